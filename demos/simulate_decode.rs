//! Round-trip a synthetic waveform through the decoder
//!
//! Generates transactions for the requested configuration, runs them
//! through the decoder and prints what comes back - the values printed
//! must match the values generated.
//!
//! Usage:
//!   cargo run --release --example simulate_decode -- --mode 3 --bits 16 --words 8

use clap::Parser;
use spidecode::{
    InputPort, OutputPort, Pipeline, PortDirection, PortSchema, ProcessNode, ShiftOrder,
    SimulationSource, SpiConfig, SpiDecoder, SpiEvent, SpiMode, WaveformBuilder, WorkError,
    WorkResult,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// SPI mode (0-3)
    #[arg(long, default_value = "0")]
    mode: u8,

    /// Bits per transfer
    #[arg(long, default_value = "8")]
    bits: u32,

    /// Least significant bit first
    #[arg(long)]
    lsb_first: bool,

    /// Number of words to generate
    #[arg(long, default_value = "8")]
    words: u64,

    /// Words per transaction
    #[arg(long, default_value = "4")]
    words_per_transaction: u64,

    /// Samples per half clock period
    #[arg(long, default_value = "5")]
    half_period: u64,
}

/// Sink that prints transfers until the stream ends
struct TransferPrinter {
    count: usize,
}

impl ProcessNode for TransferPrinter {
    fn name(&self) -> &str {
        "transfer_printer"
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

        if let SpiEvent::Transfer(t) = input.recv()? {
            self.count += 1;
            info!(
                "#{}: mosi={:#x} miso={:#x} samples {}..{}",
                self.count, t.mosi, t.miso, t.start, t.end
            );
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
        ..SpiConfig::for_mode(mode)
    };

    let mut builder = WaveformBuilder::new(cfg, args.half_period);
    builder.advance(10);
    let mut value = 0u64;
    let mut remaining = args.words;
    while remaining > 0 {
        let batch = remaining.min(args.words_per_transaction);
        let words: Vec<(u64, u64)> = (0..batch).map(|i| (value + i, value + i + 1)).collect();
        builder.transaction(&words);
        value += batch;
        remaining -= batch;
    }
    let wave = builder.finish();
    info!("Generated {} words over {} samples", args.words, wave.end);

    let mut pipeline = Pipeline::new().with_default_buffer_size(1_000_000);
    pipeline.add_process("sim", SimulationSource::new(wave))?;
    pipeline.add_process("spi", SpiDecoder::new(cfg)?)?;
    pipeline.add_process("printer", TransferPrinter { count: 0 })?;

    pipeline.connect("sim", "clk", "spi", "clk")?;
    pipeline.connect("sim", "mosi", "spi", "mosi")?;
    pipeline.connect("sim", "miso", "spi", "miso")?;
    pipeline.connect("sim", "enable", "spi", "enable")?;
    pipeline.connect("spi", "events", "printer", "events")?;

    let scheduler = pipeline.build()?;
    scheduler.wait();

    Ok(())
}
