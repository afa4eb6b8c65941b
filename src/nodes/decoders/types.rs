//! Common decoder types and configuration

/// Bit shift order on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOrder {
    /// Most significant bit first (standard)
    MsbFirst,
    /// Least significant bit first
    LsbFirst,
}

/// Clock level when no transfer is in progress (CPOL)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleLevel {
    /// CPOL = 0: clock rests low
    Low,
    /// CPOL = 1: clock rests high
    High,
}

impl IdleLevel {
    /// The idle level as a wire bit
    pub fn as_bit(self) -> bool {
        matches!(self, IdleLevel::High)
    }
}

/// Clock edge at which the data lines are sampled (CPHA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidEdge {
    /// CPHA = 0: data valid on the edge leaving the idle level
    Leading,
    /// CPHA = 1: data valid on the edge returning to the idle level
    Trailing,
}

/// Enable (chip select) polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnablePolarity {
    /// Enable is active-low (standard): LOW = active
    ActiveLow,
    /// Enable is active-high: HIGH = active
    ActiveHigh,
}

impl EnablePolarity {
    /// The active level as a wire bit
    pub fn active_bit(self) -> bool {
        matches!(self, EnablePolarity::ActiveHigh)
    }
}

/// Combined polarity/phase shorthand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    /// CPOL=0, CPHA=0
    Mode0,
    /// CPOL=0, CPHA=1
    Mode1,
    /// CPOL=1, CPHA=0
    Mode2,
    /// CPOL=1, CPHA=1
    Mode3,
}

impl SpiMode {
    /// Mode by its conventional number, for CLI surfaces
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(SpiMode::Mode0),
            1 => Some(SpiMode::Mode1),
            2 => Some(SpiMode::Mode2),
            3 => Some(SpiMode::Mode3),
            _ => None,
        }
    }

    pub fn clock_idle(self) -> IdleLevel {
        match self {
            SpiMode::Mode0 | SpiMode::Mode1 => IdleLevel::Low,
            SpiMode::Mode2 | SpiMode::Mode3 => IdleLevel::High,
        }
    }

    pub fn valid_edge(self) -> ValidEdge {
        match self {
            SpiMode::Mode0 | SpiMode::Mode2 => ValidEdge::Leading,
            SpiMode::Mode1 | SpiMode::Mode3 => ValidEdge::Trailing,
        }
    }
}

/// Direction of a per-bit sampling marker, or the error square marking a
/// polarity violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Up,
    Down,
    Error,
}

/// One decoded transfer word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiTransfer {
    /// Sample of the first clock edge of the word (inclusive)
    pub start: u64,
    /// Sample of the last clock edge consumed for the word (inclusive)
    pub end: u64,
    /// Data-out word, 0 if no mosi channel is configured
    pub mosi: u64,
    /// Data-in word, 0 if no miso channel is configured
    pub miso: u64,
    /// Configured word width in bits
    pub bits: u32,
}

/// Decoded event stream produced by [`SpiDecoder`](super::SpiDecoder).
///
/// Events carry sample-accurate boundaries and are emitted as decoding
/// progresses, in the order things completed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiEvent {
    /// Enable went active with the clock at its idle level; words follow
    /// until `Disable`. Never emitted when no enable channel is configured.
    TransactionStart { position: u64 },
    /// A completed transfer word
    Transfer(SpiTransfer),
    /// The clock was not at its configured idle level when enable went
    /// active; the span up to the enable deassertion was skipped
    Error { start: u64, end: u64 },
    /// Enable deasserted
    Disable { position: u64 },
    /// Per-bit sampling marker (Up/Down) or polarity error square
    Marker { position: u64, kind: MarkerKind },
}

/// Configuration rejected before a decoder is constructed
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bits per transfer must be 1-64, got {0}")]
    BitsOutOfRange(u32),

    #[error("at least one of mosi/miso must be present")]
    NoDataChannel,
}

/// Immutable decoder configuration.
///
/// The clock channel is always present; mosi, miso and enable are optional
/// but at least one data line must be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiConfig {
    pub bits_per_transfer: u32,
    pub shift_order: ShiftOrder,
    pub clock_idle: IdleLevel,
    pub valid_edge: ValidEdge,
    pub enable_polarity: EnablePolarity,
    pub has_mosi: bool,
    pub has_miso: bool,
    pub has_enable: bool,
}

impl Default for SpiConfig {
    /// Standard SPI: mode 0, 8 bits, MSB first, active-low enable,
    /// all four channels present.
    fn default() -> Self {
        Self {
            bits_per_transfer: 8,
            shift_order: ShiftOrder::MsbFirst,
            clock_idle: IdleLevel::Low,
            valid_edge: ValidEdge::Leading,
            enable_polarity: EnablePolarity::ActiveLow,
            has_mosi: true,
            has_miso: true,
            has_enable: true,
        }
    }
}

impl SpiConfig {
    /// Default configuration with polarity/phase taken from a mode shorthand
    pub fn for_mode(mode: SpiMode) -> Self {
        Self {
            clock_idle: mode.clock_idle(),
            valid_edge: mode.valid_edge(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bits_per_transfer < 1 || self.bits_per_transfer > 64 {
            return Err(ConfigError::BitsOutOfRange(self.bits_per_transfer));
        }
        if !self.has_mosi && !self.has_miso {
            return Err(ConfigError::NoDataChannel);
        }
        Ok(())
    }

    /// Marker direction for data-valid edges, fixed once per capture from
    /// the polarity/phase combination.
    pub fn marker_kind(&self) -> MarkerKind {
        match (self.clock_idle, self.valid_edge) {
            (IdleLevel::Low, ValidEdge::Leading) => MarkerKind::Up,
            (IdleLevel::Low, ValidEdge::Trailing) => MarkerKind::Down,
            (IdleLevel::High, ValidEdge::Leading) => MarkerKind::Down,
            (IdleLevel::High, ValidEdge::Trailing) => MarkerKind::Up,
        }
    }

    /// Number of input channels a decoder with this configuration consumes
    pub fn num_channels(&self) -> usize {
        1 + usize::from(self.has_mosi) + usize::from(self.has_miso) + usize::from(self.has_enable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_mapping() {
        assert_eq!(SpiMode::Mode0.clock_idle(), IdleLevel::Low);
        assert_eq!(SpiMode::Mode0.valid_edge(), ValidEdge::Leading);
        assert_eq!(SpiMode::Mode1.valid_edge(), ValidEdge::Trailing);
        assert_eq!(SpiMode::Mode2.clock_idle(), IdleLevel::High);
        assert_eq!(SpiMode::Mode3.clock_idle(), IdleLevel::High);
        assert_eq!(SpiMode::Mode3.valid_edge(), ValidEdge::Trailing);
    }

    #[test]
    fn test_marker_table() {
        let mut cfg = SpiConfig::default();
        assert_eq!(cfg.marker_kind(), MarkerKind::Up);

        cfg.valid_edge = ValidEdge::Trailing;
        assert_eq!(cfg.marker_kind(), MarkerKind::Down);

        cfg.clock_idle = IdleLevel::High;
        assert_eq!(cfg.marker_kind(), MarkerKind::Up);

        cfg.valid_edge = ValidEdge::Leading;
        assert_eq!(cfg.marker_kind(), MarkerKind::Down);
    }

    #[test]
    fn test_validate_rejects_bad_width() {
        let mut cfg = SpiConfig::default();
        cfg.bits_per_transfer = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::BitsOutOfRange(0))));

        cfg.bits_per_transfer = 65;
        assert!(cfg.validate().is_err());

        cfg.bits_per_transfer = 64;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_data_channel() {
        let mut cfg = SpiConfig::default();
        cfg.has_mosi = false;
        cfg.has_miso = false;
        assert!(matches!(cfg.validate(), Err(ConfigError::NoDataChannel)));

        cfg.has_miso = true;
        assert!(cfg.validate().is_ok());
    }
}
