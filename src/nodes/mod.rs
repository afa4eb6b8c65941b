//! Node-based signal processing
//!
//! Streaming nodes for capture decoding:
//! - **Sources**: capture archives ([`CaptureFileSource`]) and synthetic
//!   waveforms ([`decoders::SimulationSource`])
//! - **Decoders**: the SPI transfer decoder
//! - All connected via crossbeam channels, one thread per node

pub mod capture_file;
pub mod decoders;

pub use capture_file::{CaptureFileSource, CaptureHeader};

// Re-export Edge from runtime
pub use crate::runtime::Edge;
