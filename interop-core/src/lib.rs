//! # Interop Core
//!
//! Pull-based demux/decode pipeline for media hosts that ask for one
//! timestamped sample at a time per stream.
//!
//! ```text
//! host ──► MediaPipeline ──► SampleProvider ──► StreamReader ──► PacketSource
//!                                  │
//!                                  └──► FrameDecoder (uncompressed only)
//! ```

// ============================================================================
// Pipeline
// ============================================================================
pub mod config;
pub mod descriptor;
pub mod pipeline;
pub mod provider;
pub mod reader;

// ============================================================================
// Containers
// ============================================================================
pub mod source;

// ============================================================================
// Codecs / Conversion
// ============================================================================
pub mod convert;
pub mod decode;
pub mod h264;

// ============================================================================
// Shared types
// ============================================================================
pub mod error;
pub mod packet;
pub mod time;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use descriptor::{
    AudioDescriptor, AudioEncoding, PresentationDescriptor, VideoDescriptor, VideoEncoding,
};
pub use error::{ErrorKind, InteropError, InteropResult};
pub use packet::{NextSample, Packet, Sample, SideData, StreamKind};
pub use pipeline::{MediaPipeline, PipelineState};
pub use provider::{ProviderVariant, SampleProvider};
pub use source::{IoCallbacks, PacketSource, StreamInfo};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
