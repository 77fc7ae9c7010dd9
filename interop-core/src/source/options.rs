//! Container-opening options.
//!
//! The host passes a flat string map. Every entry is validated before any is
//! applied; all rejected entries come back together in one
//! [`InteropError::InvalidOptions`].

use std::collections::BTreeMap;

use crate::error::{InteropError, InteropResult, OptionError};

pub const DEFAULT_PROBE_SIZE: usize = 2048;
const MIN_PROBE_SIZE: usize = 32;
pub const MAX_PROBE_SIZE: usize = 32 << 20;

/// Demuxer override. `Auto` sniffs the first `probesize` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatHint {
    #[default]
    Auto,
    Mp4,
    Matroska,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOptions {
    pub format: FormatHint,
    pub probe_size: usize,
    /// Fill a missing pts from the dts.
    pub generate_pts: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            format: FormatHint::Auto,
            probe_size: DEFAULT_PROBE_SIZE,
            generate_pts: false,
        }
    }
}

impl SourceOptions {
    pub fn parse(map: &BTreeMap<String, String>) -> InteropResult<Self> {
        let mut options = Self::default();
        let mut errors = Vec::new();

        for (key, value) in map {
            let result = match key.as_str() {
                "format" => parse_format(value).map(|f| options.format = f),
                "probesize" => parse_probe_size(value).map(|n| options.probe_size = n),
                "genpts" => parse_flag(value).map(|b| options.generate_pts = b),
                _ => Err("unknown option".to_string()),
            };
            if let Err(reason) = result {
                errors.push(OptionError {
                    key: key.clone(),
                    value: value.clone(),
                    reason,
                });
            }
        }

        if errors.is_empty() {
            Ok(options)
        } else {
            tracing::warn!("Rejected {} container option(s)", errors.len());
            Err(InteropError::InvalidOptions(errors))
        }
    }
}

fn parse_format(value: &str) -> Result<FormatHint, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" | "" => Ok(FormatHint::Auto),
        "mp4" | "mov" | "m4a" | "m4v" => Ok(FormatHint::Mp4),
        "matroska" | "mkv" | "webm" => Ok(FormatHint::Matroska),
        other => Err(format!("unknown container format '{}'", other)),
    }
}

fn parse_probe_size(value: &str) -> Result<usize, String> {
    let n: usize = value
        .trim()
        .parse()
        .map_err(|e| format!("expected an integer: {}", e))?;
    if !(MIN_PROBE_SIZE..=MAX_PROBE_SIZE).contains(&n) {
        return Err(format!(
            "must be between {} and {}",
            MIN_PROBE_SIZE, MAX_PROBE_SIZE
        ));
    }
    Ok(n)
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value.trim() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err("expected 0 or 1".to_string()),
    }
}
