//! Per-authority static-data sheets: one CSV per sheet in a directory.
//! `defaults.csv` holds the category defaults; the node-type sheets hold
//! per-structure overrides keyed by the authority `code`.

use crate::error::{Error, Result};
use crate::io_err;
use crate::model::{Model, NodeType};
use crate::model::node::META_CATEGORIE;
use crate::persistence::csv_io::{read_csv, write_csv};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    Inlet,
    Outlet,
}

impl Function {
    pub fn as_str(&self) -> &'static str {
        match self {
            Function::Inlet => "inlet",
            Function::Outlet => "outlet",
        }
    }
}

impl FromStr for Function {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inlet" | "aanvoer" => Ok(Function::Inlet),
            "outlet" | "afvoer" => Ok(Function::Outlet),
            _ => Err(format!("Unknown function '{}'. Valid options: inlet, outlet", s)),
        }
    }
}

/// One row of `defaults.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDefaults {
    pub categorie: String,
    pub function: Function,
    pub flow_rate: Option<f64>,
    pub flow_rate_mm_per_day: Option<f64>,
    pub upstream_level_offset: f64,
    pub downstream_level_offset: f64,
}

/// Pump and Outlet sheets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureSheetRow {
    pub node_id: Option<i64>,
    pub name: Option<String>,
    pub code: String,
    pub flow_rate: Option<f64>,
    pub min_upstream_level: Option<f64>,
    pub max_downstream_level: Option<f64>,
    pub categorie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelBoundarySheetRow {
    pub code: String,
    pub level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowBoundarySheetRow {
    pub code: String,
    pub flow_rate: Option<f64>,
}

/// Rows of the function table of a continuous controller; one sheet row
/// per `(input, output)` point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousControlSheetRow {
    pub code: String,
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidControlSheetRow {
    pub code: String,
    pub target: f64,
    pub proportional: Option<f64>,
    pub integral: Option<f64>,
    pub derivative: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticData {
    pub defaults: Vec<CategoryDefaults>,
    pub pump: Vec<StructureSheetRow>,
    pub outlet: Vec<StructureSheetRow>,
    pub level_boundary: Vec<LevelBoundarySheetRow>,
    pub flow_boundary: Vec<FlowBoundarySheetRow>,
    pub continuous_control: Vec<ContinuousControlSheetRow>,
    pub pid_control: Vec<PidControlSheetRow>,
}

/// Categories used when an authority supplies no `defaults` sheet.
pub fn default_categories() -> Vec<CategoryDefaults> {
    let row = |categorie: &str, function, mm: f64, up: f64, down: f64| CategoryDefaults {
        categorie: categorie.to_string(),
        function,
        flow_rate: None,
        flow_rate_mm_per_day: Some(mm),
        upstream_level_offset: up,
        downstream_level_offset: down,
    };
    vec![
        row("Afvoergemaal", Function::Outlet, 15.0, 0.0, 0.2),
        row("Aanvoergemaal", Function::Inlet, 4.0, 0.2, 0.0),
        row("Uitlaat", Function::Outlet, 50.0, 0.0, 0.3),
        row("Inlaat", Function::Inlet, 4.0, 0.2, 0.0),
    ]
}

impl StaticData {
    /// Reads the sheets in `dir`; absent sheets are empty and an absent
    /// `defaults.csv` falls back to [`default_categories`].
    pub fn read(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::format(dir, "static data must be a directory of CSV sheets"));
        }
        let defaults_path = dir.join("defaults.csv");
        let defaults = if defaults_path.exists() {
            read_csv(&defaults_path)?
        } else {
            default_categories()
        };
        Ok(Self {
            defaults,
            pump: read_csv(&dir.join("Pump.csv"))?,
            outlet: read_csv(&dir.join("Outlet.csv"))?,
            level_boundary: read_csv(&dir.join("LevelBoundary.csv"))?,
            flow_boundary: read_csv(&dir.join("FlowBoundary.csv"))?,
            continuous_control: read_csv(&dir.join("ContinuousControl.csv"))?,
            pid_control: read_csv(&dir.join("PidControl.csv"))?,
        })
    }

    pub fn with_default_categories() -> Self {
        Self {
            defaults: default_categories(),
            ..Self::default()
        }
    }

    pub fn category(&self, categorie: &str) -> Option<&CategoryDefaults> {
        self.defaults
            .iter()
            .find(|d| d.categorie.eq_ignore_ascii_case(categorie))
    }

    /// Sheet rows of a Pump or Outlet, keyed by code.
    pub fn structure_rows(&self, node_type: NodeType) -> BTreeMap<&str, &StructureSheetRow> {
        let rows = match node_type {
            NodeType::Pump => &self.pump,
            NodeType::Outlet => &self.outlet,
            _ => return BTreeMap::new(),
        };
        rows.iter().map(|r| (r.code.as_str(), r)).collect()
    }

    /// Writes the skeleton sheets an authority fills in: the defaults and a
    /// Pump and Outlet sheet listing every structure of `model`.
    pub fn write_template(model: &Model, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| io_err!(dir, e))?;
        write_csv(&dir.join("defaults.csv"), &default_categories())?;
        for (node_type, file, categorie) in [
            (NodeType::Pump, "Pump.csv", "Afvoergemaal"),
            (NodeType::Outlet, "Outlet.csv", "Uitlaat"),
        ] {
            let rows: Vec<StructureSheetRow> = model
                .nodes_of_type(node_type)
                .map(|n| StructureSheetRow {
                    node_id: Some(n.node_id),
                    name: n.name.clone(),
                    code: n.code().unwrap_or_default().to_string(),
                    categorie: Some(n.meta_str(META_CATEGORIE).unwrap_or(categorie).to_string()),
                    ..StructureSheetRow::default()
                })
                .collect();
            write_csv(&dir.join(file), &rows)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::*;

    #[test]
    fn test_template_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ribasim_nl_static_{}", uuid::Uuid::new_v4()));
        let mut model = two_basin_chain();
        model.node_mut(2).unwrap().meta.insert("meta_code_waterbeheerder".to_string(), "KGM-1".into());
        StaticData::write_template(&model, &dir).unwrap();

        let data = StaticData::read(&dir).unwrap();
        assert_eq!(data.defaults, default_categories());
        assert_eq!(data.pump.len(), 1);
        assert_eq!(data.pump[0].code, "KGM-1");
        assert_eq!(data.pump[0].categorie.as_deref(), Some("Afvoergemaal"));
        assert_eq!(data.pump[0].flow_rate, None);
        assert!(data.outlet.is_empty());
        assert!(data.pid_control.is_empty());
        assert_eq!(data.category("afvoergemaal").map(|c| c.function), Some(Function::Outlet));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let missing = std::env::temp_dir().join(format!("ribasim_nl_none_{}", uuid::Uuid::new_v4()));
        assert!(matches!(StaticData::read(&missing), Err(Error::Format { .. })));
    }
}
