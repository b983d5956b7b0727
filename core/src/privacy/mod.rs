// Traffic Shaping — decoupling wire timing and sizes from application data
//
// Provides chunking with random padding, exponential jitter on a timing
// grid, a delay-ordered mix queue with NHPP cover arrivals, spectral
// de-periodization and an adaptively ratioed cover generator.

pub mod cover;
pub mod mix;
pub mod padding;
pub mod rotation;
pub mod shaper;
pub mod spectral;
pub mod timing;

pub use cover::{compute_cover_count, ActivityState, AdaptiveCover, CoverConfig};
pub use mix::{thin_arrivals, DiurnalRate, MixConfig, MixPacket, MixQueue, MAX_COVER_RATE_HZ};
pub use padding::{ChunkReassembler, Chunker, PaddingConfig, SizeHistogram, CHUNK_HEADER_SIZE};
pub use rotation::{RotationLedger, RotationPack};
pub use shaper::{ShapeReport, ShapingConfig, StealthProfile, TrafficShaper};
pub use spectral::{deperiodize, dominant_peak_ratio, DeperiodizeConfig};
pub use timing::{compute_jitter, JitterConfig, TimingJitter};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShapingError {
    #[error("Invalid shaping configuration: {0}")]
    InvalidConfig(String),

    #[error("Rotation pack rejected: {0}")]
    RotationRejected(String),

    #[error("Malformed chunk frame: {0}")]
    MalformedChunk(String),
}
