//! JSON run reports.
//!
//! A pass can leave its [`RunResult`] on disk for whatever scheduled it.
//! The file is overwritten on every pass.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::types::RunResult;

/// Write the run report as pretty JSON.
pub fn save_report(result: &RunResult, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialise run report")?;

    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
    }
    std::fs::write(path, &json).with_context(|| format!("Failed to write run report to {path}"))?;

    debug!(path, run_id = %result.run_id, "Run report saved");
    Ok(())
}

/// Load a previous run report. Returns None if the file doesn't exist.
pub fn load_report(path: &str) -> Result<Option<RunResult>> {
    if !Path::new(path).exists() {
        return Ok(None);
    }

    let json =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read run report {path}"))?;
    let result: RunResult =
        serde_json::from_str(&json).with_context(|| format!("Failed to parse run report {path}"))?;

    info!(
        path,
        run_id = %result.run_id,
        entities = result.entities.len(),
        success = result.is_success(),
        "Previous run report loaded"
    );
    Ok(Some(result))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
