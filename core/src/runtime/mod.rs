//! Model runtime: load/unload lifecycle, device selection, the sliding
//! feature buffer, and the streaming anomaly detector state machine.

pub mod buffer;
pub mod cache;
pub mod detector;
pub mod device;
pub mod wrappers;

pub use buffer::{Record, SlidingBuffer};
pub use cache::{ModelCache, Unloadable};
pub use detector::{DetectorConfig, DetectorManager, DetectorStatus, StreamingDetector};
pub use wrappers::{ModelHandle, ModelInfo, ModelKind};
