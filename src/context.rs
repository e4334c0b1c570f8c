//! Explicit pipeline context: coordinate reference system, working directory
//! and cooperative cancellation.

use crate::error::{Error, Result};
use crate::report::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Projected coordinate reference system, identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crs {
    pub epsg: u32,
}

impl Crs {
    /// Amersfoort / RD New.
    pub const RD_NEW: Crs = Crs { epsg: 28992 };

    pub fn new(epsg: u32) -> Self {
        Self { epsg }
    }
}

impl Default for Crs {
    fn default() -> Self {
        Crs::RD_NEW
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

impl FromStr for Crs {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        code.parse::<u32>()
            .map(Crs::new)
            .map_err(|_| format!("Unknown CRS '{}'. Expected e.g. EPSG:28992", s))
    }
}

/// Shared flag checked between stages. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub crs: Crs,
    pub work_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(work_dir: impl Into<PathBuf>, crs: Crs) -> Self {
        Self {
            crs,
            work_dir: work_dir.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns `Cancelled` if cancellation was requested before `stage` starts.
    pub fn checkpoint(&self, stage: Stage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled { stage });
        }
        Ok(())
    }

    pub fn deliveries_dir(&self) -> PathBuf {
        self.work_dir.join("deliveries")
    }

    pub fn authority_dir(&self, authority: &str) -> PathBuf {
        self.work_dir.join("models").join(authority)
    }

    pub fn national_dir(&self) -> PathBuf {
        self.work_dir.join("models").join("nederland")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crs_parse() {
        assert_eq!("EPSG:28992".parse::<Crs>().unwrap(), Crs::RD_NEW);
        assert_eq!("4326".parse::<Crs>().unwrap().epsg, 4326);
        assert!("rd".parse::<Crs>().is_err());
        assert_eq!(Crs::default().to_string(), "EPSG:28992");
    }

    #[test]
    fn test_cancellation_is_shared() {
        let ctx = PipelineContext::new("/tmp", Crs::default());
        let token = ctx.cancel.clone();
        assert!(ctx.checkpoint(Stage::Network).is_ok());
        token.cancel();
        assert!(matches!(
            ctx.checkpoint(Stage::Coupling),
            Err(Error::Cancelled { stage: Stage::Coupling })
        ));
    }
}
