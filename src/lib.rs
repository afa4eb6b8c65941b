//! Streaming SPI decoder for logic-analyzer captures
//!
//! This library decodes a synchronous serial bus (clock + optional mosi,
//! miso and enable lines) captured as digitized logic levels into discrete
//! transfer words, tolerating the irregularities real captures exhibit:
//! mid-word enable deassertion, missing trailing clock edges, and wrong
//! idle clock polarity at capture start.
//!
//! # Architecture
//!
//! - **CaptureFileSource**: streams per-channel edges from capture
//!   archives with on-demand block reads
//! - **SpiDecoder**: walks four edge-indexed channel cursors in lock-step
//!   and emits sample-accurate decode events
//! - **WaveformBuilder / SimulationSource**: synthesize captures whose
//!   encoding is the exact inverse of the decoder, for verification
//! - **Runtime**: thread-per-node graph execution over crossbeam channels
//!
//! # Example
//!
//! ```no_run
//! use spidecode::{CaptureFileSource, Pipeline, SpiConfig, SpiDecoder};
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.add_process("capture", CaptureFileSource::new("scan.cap")?)?;
//! pipeline.add_process("spi", SpiDecoder::new(SpiConfig::default())?)?;
//! pipeline.connect("capture", "ch0", "spi", "clk")?;
//! // ... connect the remaining channels, a sink, then build and wait
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use thiserror::Error;

pub mod nodes;
pub mod runtime;

// Re-export decoder types
pub use nodes::decoders::{
    BitAccumulator, BitExtractor, ChannelCursor, ConfigError, EnablePolarity, IdleLevel,
    MarkerKind, ShiftOrder, SimulationSource, SpiConfig, SpiDecoder, SpiEvent, SpiMode,
    SpiTransfer, ValidEdge, Waveform, WaveformBuilder,
};

// Re-export capture sources
pub use nodes::{CaptureFileSource, CaptureHeader};

// Re-export runtime components
pub use runtime::{
    ConnectionError, Edge, InputPort, OutputPort, Pipeline, PortDirection, PortSchema,
    ProcessNode, Scheduler, WorkError, WorkResult, register_type,
};

/// Errors reading capture archives
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Meta parsing error: {0}")]
    ParseHeader(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid channel number: {0}")]
    InvalidChannel(usize),

    #[error("Invalid block number: {0}")]
    InvalidBlock(u64),

    #[error("Position out of bounds: {0}")]
    OutOfBounds(u64),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
