//! Pipeline configuration.
//!
//! Loaded from JSON by the host binary; every field is optional.
//!
//! ```json
//! {
//!   "force_audio_decode": false,
//!   "force_video_decode": true,
//!   "options": { "format": "matroska", "probesize": "4096" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InteropError, InteropResult};
use crate::source::SourceOptions;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Decode audio to PCM even when the host could take it compressed.
    pub force_audio_decode: bool,
    /// Decode video to NV12 even for H.264.
    pub force_video_decode: bool,
    /// Container options, forwarded to the opener as-is.
    pub options: BTreeMap<String, String>,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> InteropResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| InteropError::InvalidInput(format!("Bad configuration: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> InteropResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            InteropError::InvalidInput(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Validate `options` as a whole.
    pub fn source_options(&self) -> InteropResult<SourceOptions> {
        SourceOptions::parse(&self.options)
    }

    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::source::FormatHint;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"force_video_decode": true, "options": {{"format": "mp4"}}}}"#
        )
        .unwrap();

        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert!(config.force_video_decode);
        assert!(!config.force_audio_decode);
        assert_eq!(config.source_options().unwrap().format, FormatHint::Mp4);
    }

    #[test]
    fn test_malformed_json_is_invalid_input() {
        assert!(matches!(
            PipelineConfig::from_json_str("{\"options\": 3}"),
            Err(InteropError::InvalidInput(_))
        ));
        assert!(PipelineConfig::from_json_file("/no/such/config.json").is_err());
    }

    #[test]
    fn test_bad_options_surface_together() {
        let mut config = PipelineConfig::default();
        config.set_option("format", "avi");
        config.set_option("bogus", "1");
        match config.source_options() {
            Err(InteropError::InvalidOptions(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate error, got {:?}", other),
        }
    }
}
