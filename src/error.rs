//! Fatal pipeline conditions.
//!
//! Everything else propagates as [`anyhow::Error`]; these variants exist so
//! callers (and tests) can tell a missing upstream table apart from an I/O
//! failure by downcasting.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source file unavailable after {attempts} attempts: {}", .path.display())]
    SourceUnavailable { path: PathBuf, attempts: u32 },

    #[error("source file is unreadable or has no rows: {}", .0.display())]
    EmptySource(PathBuf),

    #[error("stage `{stage}` requires upstream table {} which does not exist", .path.display())]
    MissingUpstream { stage: &'static str, path: PathBuf },

    #[error("missing column `{column}` in {}", .path.display())]
    MissingColumn { column: String, path: PathBuf },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Fails with [`PipelineError::MissingUpstream`] unless `path` exists.
pub fn require_upstream(stage: &'static str, path: &std::path::Path) -> anyhow::Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(PipelineError::MissingUpstream {
            stage,
            path: path.to_path_buf(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_upstream_missing() {
        let err = require_upstream("zones", std::path::Path::new("/nonexistent/clean")).unwrap_err();
        let pipeline_err = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(
            pipeline_err,
            PipelineError::MissingUpstream { stage: "zones", .. }
        ));
        assert!(err.to_string().contains("/nonexistent/clean"));
    }

    #[test]
    fn test_require_upstream_present() {
        let dir = tempfile::tempdir().unwrap();
        assert!(require_upstream("zones", dir.path()).is_ok());
    }
}
