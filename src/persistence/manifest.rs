use super::write_atomic;
use crate::context::Crs;
use crate::error::{Error, Result};
use crate::io_err;
use crate::model::{Model, SolverOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// `ribasim.json`: run period, CRS, solver settings and the tables present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub starttime: DateTime<Utc>,
    pub endtime: DateTime<Utc>,
    pub epsg: u32,
    pub solver: SolverOptions,
    pub node_types: Vec<String>,
    pub tables: Vec<String>,
    pub created: DateTime<Utc>,
}

impl Manifest {
    pub fn of(model: &Model, tables: Vec<String>) -> Self {
        let mut node_types: Vec<String> = model
            .nodes
            .values()
            .map(|n| n.node_type.as_str().to_string())
            .collect();
        node_types.sort();
        node_types.dedup();
        Self {
            starttime: model.starttime,
            endtime: model.endtime,
            epsg: model.crs.epsg,
            solver: model.solver.clone(),
            node_types,
            tables,
            created: Utc::now(),
        }
    }

    pub fn crs(&self) -> Crs {
        Crs::new(self.epsg)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::format(path, e))?;
        write_atomic(path, json.as_bytes())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| io_err!(path, e))?;
        let manifest: Manifest = serde_json::from_str(&text).map_err(|e| Error::format(path, e))?;
        if manifest.endtime <= manifest.starttime {
            return Err(Error::format(path, "endtime must be after starttime"));
        }
        Ok(manifest)
    }
}
