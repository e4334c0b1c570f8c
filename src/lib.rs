#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::op_ref
)]

//! Builds, repairs, parametrises and couples the Dutch water-authority
//! hydrological network models into one national model.

pub mod authority;
pub mod basin_area;
pub mod concat;
pub mod context;
pub mod control;
pub mod coupling;
pub mod edits;
pub mod error;
pub mod geometry;
pub mod ingest;
pub mod model;
pub mod network;
pub mod parametrization;
pub mod persistence;
pub mod pipeline;
pub mod report;
pub mod validation;

#[cfg(test)]
mod pipeline_test;

pub use error::{Error, Result};
