//! Raw bin statistics and weight files.
//!
//! Raw file: a header line with the total sample count, then one line per
//! bin
//!
//! ```text
//! key unscreened sampled sum[0] sum_sq[0] sum[1] sum_sq[1] ...
//! ```
//!
//! Weights file: one `key weight` line per bin. Keys are the comma-joined
//! bin key components. Both files are published atomically.

use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::accumulator::{BinKey, BinStats, BinnedAccumulator};
use crate::error::{Result, VirialError};

/// Contents of a raw statistics file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawData {
    pub total: u64,
    pub bins: Vec<(BinKey, BinStats)>,
}

/// Overwrite `path` with `contents` so readers see the old file or the
/// complete new one, never a partial write.
pub fn publish(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| VirialError::io(&dir, e))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| VirialError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| VirialError::io(path, e.error))?;
    Ok(())
}

pub fn format_raw(acc: &BinnedAccumulator) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", acc.total());
    for (key, stats) in acc.snapshot() {
        let _ = write!(out, "{} {} {}", key, stats.unscreened, stats.sampled);
        for (s, q) in stats.sum.iter().zip(&stats.sum_sq) {
            let _ = write!(out, " {} {}", s, q);
        }
        out.push('\n');
    }
    out
}

pub fn write_raw(path: &Path, acc: &BinnedAccumulator) -> Result<()> {
    publish(path, &format_raw(acc))
}

pub fn write_weights(path: &Path, acc: &BinnedAccumulator) -> Result<()> {
    let mut out = String::new();
    for (key, weight) in acc.weights() {
        let _ = writeln!(out, "{} {}", key, weight);
    }
    publish(path, &out)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| VirialError::io(path, e))
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> VirialError {
    VirialError::Parse {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

fn field<T: std::str::FromStr>(path: &Path, line: usize, name: &str, text: Option<&str>) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let text = text.ok_or_else(|| parse_error(path, line, format!("missing {name}")))?;
    text.parse()
        .map_err(|e| parse_error(path, line, format!("bad {name} '{text}': {e}")))
}

/// Read a raw file whose bins hold `n_values` values each.
pub fn read_raw(path: &Path, n_values: usize) -> Result<RawData> {
    let text = read(path)?;
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let (_, header) = lines
        .next()
        .ok_or_else(|| parse_error(path, 1, "missing total sample count"))?;
    let total: u64 = field(path, 1, "total sample count", Some(header.trim()))?;

    let mut bins = Vec::new();
    for (i, line) in lines {
        let lineno = i + 1;
        let mut parts = line.split_whitespace();
        let key_text = parts.next().unwrap_or_default();
        let key: BinKey = key_text.parse().map_err(|e: String| parse_error(path, lineno, e))?;
        let unscreened: u64 = field(path, lineno, "unscreened count", parts.next())?;
        let sampled: u64 = field(path, lineno, "sample count", parts.next())?;
        if sampled > unscreened {
            return Err(parse_error(
                path,
                lineno,
                format!("sample count {sampled} exceeds unscreened count {unscreened}"),
            ));
        }
        let mut stats = BinStats::new(n_values, 1.0);
        stats.unscreened = unscreened;
        stats.sampled = sampled;
        for v in 0..n_values {
            stats.sum[v] = field(path, lineno, "sum", parts.next())?;
            stats.sum_sq[v] = field(path, lineno, "sum of squares", parts.next())?;
        }
        if parts.next().is_some() {
            return Err(parse_error(path, lineno, format!("expected {} values", n_values)));
        }
        bins.push((key, stats));
    }
    Ok(RawData { total, bins })
}

pub fn read_weights(path: &Path) -> Result<Vec<(BinKey, f64)>> {
    let text = read(path)?;
    let mut weights = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let lineno = i + 1;
        let mut parts = line.split_whitespace();
        let key: BinKey = parts
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|e: String| parse_error(path, lineno, e))?;
        let weight: f64 = field(path, lineno, "weight", parts.next())?;
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(parse_error(path, lineno, format!("weight {weight} outside (0, 1]")));
        }
        weights.push((key, weight));
    }
    Ok(weights)
}

/// Add saved statistics to an accumulator.
pub fn load_raw_into(acc: &BinnedAccumulator, raw: &RawData) {
    for (key, stats) in &raw.bins {
        acc.load_stats(key, stats);
    }
    acc.add_total(raw.total);
}

pub fn load_weights_into(acc: &BinnedAccumulator, weights: &[(BinKey, f64)]) {
    for (key, weight) in weights {
        acc.set_weight(key, *weight);
    }
}

/// Per-box file name: `raw.dat` becomes `raw_box1.dat` when a run has two
/// boxes.
pub fn box_path(path: &Path, index: usize, n_boxes: usize) -> PathBuf {
    if n_boxes <= 1 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_box{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_box{index}"),
    };
    path.with_file_name(name)
}
