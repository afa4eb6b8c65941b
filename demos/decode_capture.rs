//! Decode SPI transfers from a capture archive
//!
//! Usage:
//!   cargo run --release --example decode_capture -- \
//!       --file scan.cap \
//!       --clk 0 --mosi 1 --enable 3 \
//!       --mode 0 --bits 8 -n 100

use clap::Parser;
use spidecode::{
    CaptureFileSource, EnablePolarity, InputPort, OutputPort, Pipeline, PortDirection, PortSchema,
    ProcessNode, ShiftOrder, SpiConfig, SpiDecoder, SpiEvent, SpiMode, WorkError, WorkResult,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to capture archive
    #[arg(short, long)]
    file: String,

    /// Clock channel number
    #[arg(long)]
    clk: usize,

    /// Mosi channel number
    #[arg(long)]
    mosi: Option<usize>,

    /// Miso channel number
    #[arg(long)]
    miso: Option<usize>,

    /// Enable channel number
    #[arg(long)]
    enable: Option<usize>,

    /// SPI mode (0-3)
    #[arg(long, default_value = "0")]
    mode: u8,

    /// Bits per transfer
    #[arg(long, default_value = "8")]
    bits: u32,

    /// Least significant bit first
    #[arg(long)]
    lsb_first: bool,

    /// Enable line is active high
    #[arg(long)]
    enable_active_high: bool,

    /// Number of transfers to print (0 = unlimited)
    #[arg(short, long, default_value = "100")]
    n: usize,
}

/// Sink that prints decoded events
struct EventPrinter {
    transfers: usize,
    max_transfers: usize,
}

impl ProcessNode for EventPrinter {
    fn name(&self) -> &str {
        "event_printer"
    }

    fn should_stop(&self) -> bool {
        self.max_transfers > 0 && self.transfers >= self.max_transfers
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        0
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::new::<SpiEvent>("events", 0, PortDirection::Input)]
    }

    fn work(&mut self, inputs: &[InputPort], _outputs: &[OutputPort]) -> WorkResult<usize> {
        let mut buffer = std::collections::VecDeque::new();
        let mut input = inputs
            .first()
            .and_then(|port| port.get::<SpiEvent>(&mut buffer))
            .ok_or_else(|| WorkError::NodeError("Missing input channel".to_string()))?;

        match input.recv()? {
            SpiEvent::TransactionStart { position } => {
                info!("--- transaction at sample {} ---", position);
            }
            SpiEvent::Transfer(t) => {
                self.transfers += 1;
                info!(
                    "#{}: mosi={:#04x} miso={:#04x} samples {}..{}",
                    self.transfers, t.mosi, t.miso, t.start, t.end
                );
            }
            SpiEvent::Error { start, end } => {
                info!("clock polarity error, samples {}..{} skipped", start, end);
            }
            SpiEvent::Disable { position } => {
                info!("--- enable deasserted at sample {} ---", position);
            }
            SpiEvent::Marker { .. } => {}
        }

        if self.max_transfers > 0 && self.transfers >= self.max_transfers {
            info!("[event_printer] {} transfers reached, shutting down", self.max_transfers);
            return Err(WorkError::Shutdown);
        }

        Ok(1)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mode = SpiMode::from_index(args.mode)
        .ok_or_else(|| format!("invalid SPI mode {}", args.mode))?;

    let cfg = SpiConfig {
        bits_per_transfer: args.bits,
        shift_order: if args.lsb_first {
            ShiftOrder::LsbFirst
        } else {
            ShiftOrder::MsbFirst
        },
        enable_polarity: if args.enable_active_high {
            EnablePolarity::ActiveHigh
        } else {
            EnablePolarity::ActiveLow
        },
        has_mosi: args.mosi.is_some(),
        has_miso: args.miso.is_some(),
        has_enable: args.enable.is_some(),
        ..SpiConfig::for_mode(mode)
    };

    let source = CaptureFileSource::new(&args.file)?;
    info!(
        "Capture: {} channels, {} samples at {} Hz",
        source.header().channels,
        source.header().total_samples,
        source.header().samplerate_hz
    );

    let mut pipeline = Pipeline::new().with_default_buffer_size(1_000_000);
    pipeline.add_process("capture", source)?;
    pipeline.add_process("spi", SpiDecoder::new(cfg)?)?;
    pipeline.add_process(
        "printer",
        EventPrinter {
            transfers: 0,
            max_transfers: args.n,
        },
    )?;

    pipeline.connect("capture", &format!("ch{}", args.clk), "spi", "clk")?;
    if let Some(mosi) = args.mosi {
        pipeline.connect("capture", &format!("ch{}", mosi), "spi", "mosi")?;
    }
    if let Some(miso) = args.miso {
        pipeline.connect("capture", &format!("ch{}", miso), "spi", "miso")?;
    }
    if let Some(enable) = args.enable {
        pipeline.connect("capture", &format!("ch{}", enable), "spi", "enable")?;
    }
    pipeline.connect("spi", "events", "printer", "events")?;

    let scheduler = pipeline.build()?;
    scheduler.wait();

    Ok(())
}
