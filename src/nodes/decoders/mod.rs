//! Protocol decoding
//!
//! The transfer decoder plus its supporting pieces: channel cursors, word
//! assembly and the synthetic waveform generator used to verify decoding
//! without hardware.

pub mod bits;
pub mod cursor;
pub mod simulation;
pub mod spi;
pub mod types;

pub use bits::{BitAccumulator, BitExtractor};
pub use cursor::{ChannelCursor, ChannelState, CursorState, EdgeCursor};
pub use simulation::{SimulationSource, Waveform, WaveformBuilder};
pub use spi::SpiDecoder;
pub use types::{
    ConfigError, EnablePolarity, IdleLevel, MarkerKind, ShiftOrder, SpiConfig, SpiEvent, SpiMode,
    SpiTransfer, ValidEdge,
};
