//! Non-fatal findings collected while a model moves through the pipeline.

use crate::io_err;
use crate::model::{LinkId, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Network,
    BasinArea,
    Edit,
    Repair,
    Parametrization,
    Control,
    Concat,
    Coupling,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Ingest => "ingest",
            Stage::Network => "network",
            Stage::BasinArea => "basin_area",
            Stage::Edit => "edit",
            Stage::Repair => "repair",
            Stage::Parametrization => "parametrization",
            Stage::Control => "control",
            Stage::Concat => "concat",
            Stage::Coupling => "coupling",
            Stage::Persist => "persist",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    InvalidGeometry,
    DiscardedLine,
    UnplacedStructure,
    UnassignedBasinArea,
    LowOverlap,
    BasinWithoutArea,
    AutomaticRepair,
    DefaultParameter,
    MissingParameter,
    CouplingSkipped,
    CouplingFailed,
    Coupled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub stage: Stage,
    pub kind: FindingKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link_ids: Vec<LinkId>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub findings: Vec<Finding>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finding and mirrors it to the log.
    pub fn push(
        &mut self,
        stage: Stage,
        kind: FindingKind,
        node_ids: Vec<NodeId>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        match kind {
            FindingKind::Coupled | FindingKind::DefaultParameter | FindingKind::AutomaticRepair => {
                info!(%stage, ?kind, ?node_ids, "{message}")
            }
            _ => warn!(%stage, ?kind, ?node_ids, "{message}"),
        }
        self.findings.push(Finding {
            stage,
            kind,
            node_ids,
            link_ids: Vec::new(),
            message,
        });
    }

    pub fn push_link(
        &mut self,
        stage: Stage,
        kind: FindingKind,
        link_ids: Vec<LinkId>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        warn!(%stage, ?kind, ?link_ids, "{message}");
        self.findings.push(Finding {
            stage,
            kind,
            node_ids: Vec::new(),
            link_ids,
            message,
        });
    }

    pub fn extend(&mut self, other: Report) {
        self.findings.extend(other.findings);
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    pub fn of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn write_json(&self, path: &Path) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::format(path, e))?;
        crate::persistence::write_atomic(path, json.as_bytes())
    }

    pub fn read_json(path: &Path) -> crate::Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| io_err!(path, e))?;
        serde_json::from_str(&text).map_err(|e| crate::Error::format(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_by_kind() {
        let mut report = Report::new();
        report.push(Stage::Network, FindingKind::DiscardedLine, vec![], "short line");
        report.push(Stage::BasinArea, FindingKind::UnassignedBasinArea, vec![3], "far away");
        report.push(Stage::BasinArea, FindingKind::UnassignedBasinArea, vec![4], "far away");
        assert_eq!(report.count(FindingKind::UnassignedBasinArea), 2);
        assert_eq!(report.count(FindingKind::Coupled), 0);
    }

    #[test]
    fn test_report_json_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ribasim_nl_report_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut report = Report::new();
        report.push_link(Stage::Repair, FindingKind::AutomaticRepair, vec![7, 8], "dropped duplicate");
        let path = dir.join("report.json");
        report.write_json(&path).unwrap();
        assert_eq!(Report::read_json(&path).unwrap(), report);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
