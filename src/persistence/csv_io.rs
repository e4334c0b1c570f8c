//! Non-spatial tables as CSV, one file per table named after the table.

use super::write_atomic;
use crate::error::{Error, Result};
use crate::io_err;
use crate::model::Tables;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::path::Path;

pub fn to_csv_bytes<T: Serialize>(rows: &[T], path: &Path) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).map_err(|e| Error::format(path, e))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::format(path, e.to_string()))
}

pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    write_atomic(path, &to_csv_bytes(rows, path)?)
}

/// Rows of a CSV file; a missing file reads as an empty table.
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| io_err!(path, e))?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    reader
        .deserialize()
        .map(|row| row.map_err(|e| Error::format(path, e)))
        .collect()
}

macro_rules! for_each_table {
    ($mac:ident) => {
        $mac!(
            basin_profile,
            basin_state,
            basin_static,
            basin_time,
            pump_static,
            outlet_static,
            manning_resistance_static,
            linear_resistance_static,
            tabulated_rating_curve_static,
            level_boundary_static,
            flow_boundary_static,
            discrete_control_variable,
            discrete_control_condition,
            discrete_control_logic,
            continuous_control_variable,
            continuous_control_function,
            pid_control_static
        )
    };
}

/// Writes every non-empty table and returns the names written.
pub fn write_tables(tables: &Tables, dir: &Path) -> Result<Vec<String>> {
    let mut written = Vec::new();
    macro_rules! write_each {
        ($($field:ident),*) => {
            $(if !tables.$field.is_empty() {
                let name = stringify!($field);
                write_csv(&dir.join(format!("{name}.csv")), &tables.$field)?;
                written.push(name.to_string());
            })*
        };
    }
    for_each_table!(write_each);
    Ok(written)
}

/// Reads the tables listed in `names`; unknown names are a format error.
pub fn read_tables(dir: &Path, names: &[String]) -> Result<Tables> {
    let mut tables = Tables::default();
    for name in names {
        let path = dir.join(format!("{name}.csv"));
        macro_rules! read_one {
            ($($field:ident),*) => {
                match name.as_str() {
                    $(stringify!($field) => tables.$field = read_csv(&path)?,)*
                    other => return Err(Error::format(&path, format!("unknown table '{other}'"))),
                }
            };
        }
        for_each_table!(read_one);
    }
    Ok(tables)
}
