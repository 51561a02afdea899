//! JSON run summary

use std::path::Path;

use crate::coordinator::RunSummary;
use crate::error::{Result, VirialError};

use super::bins::publish;

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let text = serde_json::to_string_pretty(summary)?;
    publish(path, &text)
}

pub fn read_summary(path: &Path) -> Result<RunSummary> {
    let text = std::fs::read_to_string(path).map_err(|e| VirialError::io(path, e))?;
    Ok(serde_json::from_str(&text)?)
}
