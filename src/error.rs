//! Error kinds shared by every pipeline stage.

use crate::report::Stage;
use crate::validation::Defect;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("[{stage}] invalid geometry for {entity}: {message}")]
    Geometry {
        stage: Stage,
        entity: String,
        message: String,
    },
    #[error("[{stage}] topology invariant '{invariant}' violated by {ids:?}")]
    Topology {
        stage: Stage,
        ids: Vec<i64>,
        invariant: String,
    },
    #[error("[{stage}] could not assign area {entity}: {message}")]
    Assignment {
        stage: Stage,
        entity: String,
        message: String,
    },
    #[error("[{stage}] coupling of node {node_id} failed: {message}")]
    Coupling {
        stage: Stage,
        node_id: i64,
        message: String,
    },
    #[error("[{stage}] model failed validation with {} defect(s): {}", defects.len(), summarize(defects))]
    Validation { stage: Stage, defects: Vec<Defect> },
    #[error("[{stage}] network has no edges")]
    EmptyNetwork { stage: Stage },
    #[error("I/O error accessing path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed input '{path}': {message}")]
    Format { path: PathBuf, message: String },
    #[error("[{stage}] cancelled")]
    Cancelled { stage: Stage },
}

pub type Result<T> = std::result::Result<T, Error>;

fn summarize(defects: &[Defect]) -> String {
    defects
        .iter()
        .take(5)
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn format(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::Format {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn topology(stage: Stage, ids: Vec<i64>, invariant: impl Into<String>) -> Self {
        Error::Topology {
            stage,
            ids,
            invariant: invariant.into(),
        }
    }

    /// True for errors the driver reports as a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}

#[macro_export]
macro_rules! io_err {
    ($path:expr, $err:expr) => {
        $crate::error::Error::Io {
            path: ::std::path::Path::new(&$path).to_path_buf(),
            source: $err,
        }
    };
}
