//! Conformance harness for portsync.
//!
//! This crate provides:
//! - Scenario runs: exercise the installed dispatch table through the safe
//!   wrappers and record pass/fail per behavioral property
//! - Contract matrix: dump the mutex transition contract for both categories
//! - JSON report emission to stdout or a file

#![forbid(unsafe_code)]

pub mod conformance;
pub mod contract;

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

pub use conformance::{ConformanceReport, ScenarioResult, run_conformance};
pub use contract::{ContractRow, contract_matrix};

/// Failure writing a harness report.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pretty-print `value` as JSON to `output`, or to stdout when `None`.
pub fn emit_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<(), HarnessError> {
    let body = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body + "\n")?;
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{body}")?;
        }
    }
    Ok(())
}
