//! Capture archive source
//!
//! [`CaptureFileSource`] reads a logic capture archive and streams each
//! channel as run-length encoded [`Edge`]s.
//!
//! A capture archive is a ZIP container with a `meta` text entry and one
//! packed-bit entry per channel block:
//!
//! ```text
//! meta            channels = 4
//!                 samplerate = 50000000
//!                 samples = 1000000
//!                 blocksize = 16777216
//!                 name0 = CLK
//! ch<K>/<B>       block B of channel K, bits packed LSB-first
//! ```
//!
//! Each broadcast destination runs in its own reader thread so a slow
//! consumer on one channel never blocks the others. All readers share one
//! archive handle and block cache behind `Arc<Mutex<..>>`.

use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::ports::{PortDirection, PortSchema};
use crate::runtime::{Edge, Sender};
use crate::{CaptureError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Metadata parsed from a capture archive's `meta` entry
#[derive(Debug, Clone)]
pub struct CaptureHeader {
    /// Number of channels in the capture
    pub channels: usize,
    /// Sample rate in Hz
    pub samplerate_hz: u64,
    /// Total number of samples captured
    pub total_samples: u64,
    /// Samples per block (the last block may be shorter)
    pub samples_per_block: u64,
    /// Number of blocks per channel
    pub total_blocks: u64,
    /// Channel names indexed by channel number
    pub channel_names: Vec<String>,
}

impl CaptureHeader {
    fn parse(meta: &str) -> Result<Self> {
        let mut channels: Option<usize> = None;
        let mut samplerate_hz: Option<u64> = None;
        let mut total_samples: Option<u64> = None;
        let mut samples_per_block: Option<u64> = None;
        let mut names: HashMap<usize, String> = HashMap::new();

        for line in meta.lines() {
            let Some((key, value)) = line.split_once(" = ") else {
                continue;
            };
            match key.trim() {
                "channels" => channels = value.parse().ok(),
                "samplerate" => samplerate_hz = value.parse().ok(),
                "samples" => total_samples = value.parse().ok(),
                "blocksize" => samples_per_block = value.parse().ok(),
                key => {
                    if let Some(Ok(index)) = key.strip_prefix("name").map(str::parse::<usize>) {
                        names.insert(index, value.to_string());
                    }
                }
            }
        }

        let field = |opt: Option<u64>, name: &str| {
            opt.ok_or_else(|| CaptureError::MissingField(name.to_string()))
        };
        let channels = channels.ok_or_else(|| CaptureError::MissingField("channels".into()))?;
        let samplerate_hz = field(samplerate_hz, "samplerate")?;
        let total_samples = field(total_samples, "samples")?;
        let samples_per_block = field(samples_per_block, "blocksize")?;

        if channels == 0 {
            return Err(CaptureError::ParseHeader("channels must be at least 1".into()));
        }
        if samples_per_block == 0 {
            return Err(CaptureError::ParseHeader("blocksize must be at least 1".into()));
        }

        Ok(Self {
            channels,
            samplerate_hz,
            total_samples,
            samples_per_block,
            total_blocks: total_samples.div_ceil(samples_per_block),
            channel_names: (0..channels)
                .map(|i| names.get(&i).cloned().unwrap_or_else(|| format!("ch{}", i)))
                .collect(),
        })
    }
}

/// Bit `index` of an LSB-first packed byte array. Past the end of the
/// data the level reads low.
#[inline]
fn packed_bit(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .is_some_and(|byte| byte >> (index % 8) & 1 == 1)
}

type SharedArchive<R> = Arc<Mutex<ZipArchive<R>>>;
type BlockCache = Arc<Mutex<HashMap<(usize, u64), Arc<[u8]>>>>;

/// Fetch one channel block through the shared cache. None when the entry
/// is absent or unreadable.
fn fetch_block<R: Read + Seek>(
    archive: &SharedArchive<R>,
    cache: &BlockCache,
    channel: usize,
    block: u64,
) -> Option<Arc<[u8]>> {
    if let Some(data) = cache.lock().unwrap().get(&(channel, block)) {
        return Some(Arc::clone(data));
    }

    let bytes: Arc<[u8]> = {
        let mut zip = archive.lock().unwrap();
        let mut entry = zip.by_name(&format!("ch{}/{}", channel, block)).ok()?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).ok()?;
        buf.into()
    };

    cache
        .lock()
        .unwrap()
        .insert((channel, block), Arc::clone(&bytes));
    Some(bytes)
}

/// Source node streaming a capture archive as per-channel edge streams.
///
/// One output port per channel, named `ch0..chN-1`. Unconnected channels
/// cost nothing: reader threads only exist per connected broadcast
/// destination.
///
/// Self-threading: the single `work()` call launches the readers. Each
/// walks its channel's packed bits, sends an initial edge at sample 0 to
/// establish the starting level followed by one edge per transition, and
/// finishes with an end-of-stream marker.
pub struct CaptureFileSource<R: Read + Seek + Send + 'static = File> {
    name: String,
    archive: SharedArchive<R>,
    header: CaptureHeader,
    cache: BlockCache,

    stop: Arc<AtomicBool>,
    readers_done: Arc<AtomicUsize>,
    reader_handles: Option<Vec<JoinHandle<()>>>,
    launched: bool,
    reader_count: usize,
}

impl CaptureFileSource<File> {
    /// Open a capture archive from disk
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }
}

impl<R: Read + Seek + Send + 'static> CaptureFileSource<R> {
    /// Open a capture archive from any seekable reader
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;

        let meta = {
            let mut entry = archive
                .by_name("meta")
                .map_err(|e| CaptureError::ParseHeader(format!("no meta entry: {}", e)))?;
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            text
        };
        let header = CaptureHeader::parse(&meta)?;
        debug!(
            "Capture: {} channels, {} samples in {} blocks at {} Hz",
            header.channels, header.total_samples, header.total_blocks, header.samplerate_hz
        );

        Ok(Self {
            name: "capture_source".to_string(),
            archive: Arc::new(Mutex::new(archive)),
            header,
            cache: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            readers_done: Arc::new(AtomicUsize::new(0)),
            reader_handles: None,
            launched: false,
            reader_count: 0,
        })
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The parsed capture metadata
    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// Total capture duration in seconds
    pub fn duration(&self) -> f64 {
        self.header.total_samples as f64 / self.header.samplerate_hz as f64
    }

    /// Random-access read of one channel at one sample position
    pub fn level_at(&self, channel: usize, position: u64) -> Result<bool> {
        if channel >= self.header.channels {
            return Err(CaptureError::InvalidChannel(channel));
        }
        if position >= self.header.total_samples {
            return Err(CaptureError::OutOfBounds(position));
        }

        let block = position / self.header.samples_per_block;
        let offset = (position % self.header.samples_per_block) as usize;
        let bytes = fetch_block(&self.archive, &self.cache, channel, block)
            .ok_or(CaptureError::InvalidBlock(block))?;
        Ok(packed_bit(&bytes, offset))
    }
}

/// One reader: walks a channel's blocks and feeds a single destination.
///
/// Readers are fully independent; a channel broadcast to several
/// destinations gets one reader each, all hitting the shared block cache.
/// Cross-channel alignment is the downstream decoder's business, done by
/// sample position.
struct Reader<R: Read + Seek + Send + 'static> {
    archive: SharedArchive<R>,
    cache: BlockCache,
    header: CaptureHeader,
    channel: usize,
    sender: Sender<Edge>,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicUsize>,
}

impl<R: Read + Seek + Send + 'static> Reader<R> {
    fn run(self) {
        let mut level = false;
        let mut position = 0u64;
        let mut edges = 0u64;

        debug!(
            "[ch{}] Reading {} samples in {} blocks",
            self.channel, self.header.total_samples, self.header.total_blocks
        );

        'capture: for block in 0..self.header.total_blocks {
            if self.stop.load(Ordering::Relaxed) {
                debug!("[ch{}] Stopped at block {}", self.channel, block);
                break;
            }
            let Some(bytes) = fetch_block(&self.archive, &self.cache, self.channel, block) else {
                warn!("[ch{}] Block {} missing, stream ends early", self.channel, block);
                break;
            };

            let block_start = block * self.header.samples_per_block;
            let in_block =
                ((bytes.len() * 8) as u64).min(self.header.total_samples - block_start) as usize;

            for offset in 0..in_block {
                let bit = packed_bit(&bytes, offset);
                // sample 0 establishes the level, then transitions only
                if position == 0 || bit != level {
                    level = bit;
                    if self.sender.send(Edge::new(bit, position)).is_err() {
                        debug!("[ch{}] Consumer hung up at sample {}", self.channel, position);
                        break 'capture;
                    }
                    edges += 1;
                }
                position += 1;
            }
        }

        info!("[ch{}] Reader finished: {} samples, {} edges", self.channel, position, edges);
        self.sender.close();
        self.done.fetch_add(1, Ordering::Relaxed);
    }
}

impl<R: Read + Seek + Send + 'static> ProcessNode for CaptureFileSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_stop(&self) -> bool {
        self.launched && self.readers_done.load(Ordering::Relaxed) >= self.reader_count
    }

    fn is_self_threading(&self) -> bool {
        true
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_outputs(&self) -> usize {
        self.header.channels
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        (0..self.header.channels)
            .map(|i| PortSchema::new::<Edge>(format!("ch{}", i), i, PortDirection::Output))
            .collect()
    }

    fn work(&mut self, _inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        if self.launched {
            return Err(WorkError::NodeError(
                "capture source launched twice".to_string(),
            ));
        }
        self.launched = true;

        info!(
            "Streaming {} samples at {} Hz over {} channels",
            self.header.total_samples, self.header.samplerate_hz, self.header.channels
        );

        let mut handles = Vec::new();
        for (channel, port) in outputs.iter().enumerate().take(self.header.channels) {
            let Some(senders) = port.split_senders::<Edge>() else {
                continue;
            };
            for (dest, sender) in senders.into_iter().enumerate() {
                let reader = Reader {
                    archive: Arc::clone(&self.archive),
                    cache: Arc::clone(&self.cache),
                    header: self.header.clone(),
                    channel,
                    sender,
                    stop: Arc::clone(&self.stop),
                    done: Arc::clone(&self.readers_done),
                };
                let handle = std::thread::Builder::new()
                    .name(format!("capture_ch{}_dest{}", channel, dest))
                    .spawn(move || reader.run())
                    .map_err(|e| WorkError::NodeError(format!("cannot spawn reader: {}", e)))?;
                handles.push(handle);
            }
        }

        self.reader_count = handles.len();
        self.reader_handles = Some(handles);
        info!("Capture source: {} readers running", self.reader_count);
        Ok(0)
    }
}

impl<R: Read + Seek + Send + 'static> Drop for CaptureFileSource<R> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handles) = self.reader_handles.take() {
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::decoders::{SpiConfig, SpiDecoder, SpiEvent, WaveformBuilder};
    use crate::runtime::Pipeline;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    /// Sample an edge stream into packed bits covering `total` samples
    fn pack_channel(edges: &[Edge], total: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; total.div_ceil(8) as usize];
        let mut level = false;
        let mut next = 0usize;
        for position in 0..total {
            while next < edges.len() && edges[next].position <= position {
                level = edges[next].level;
                next += 1;
            }
            if level {
                bytes[(position / 8) as usize] |= 1 << (position % 8);
            }
        }
        bytes
    }

    /// Build an in-memory capture archive from per-channel edge streams
    fn build_archive(channels: &[&[Edge]], total: u64, blocksize: u64) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        let mut meta = String::new();
        meta.push_str(&format!("channels = {}\n", channels.len()));
        meta.push_str("samplerate = 1000000\n");
        meta.push_str(&format!("samples = {}\n", total));
        meta.push_str(&format!("blocksize = {}\n", blocksize));
        writer.start_file("meta", options).unwrap();
        writer.write_all(meta.as_bytes()).unwrap();

        for (channel, edges) in channels.iter().enumerate() {
            let packed = pack_channel(edges, total);
            let bytes_per_block = (blocksize.div_ceil(8)) as usize;
            for (block_num, chunk) in packed.chunks(bytes_per_block).enumerate() {
                writer
                    .start_file(format!("ch{}/{}", channel, block_num), options)
                    .unwrap();
                writer.write_all(chunk).unwrap();
            }
        }

        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn test_parse_meta() {
        let clk = [Edge::new(false, 0), Edge::new(true, 10), Edge::new(false, 20)];
        let archive = build_archive(&[&clk], 64, 32);
        let source = CaptureFileSource::from_reader(archive).unwrap();

        let header = source.header();
        assert_eq!(header.channels, 1);
        assert_eq!(header.samplerate_hz, 1_000_000);
        assert_eq!(header.total_samples, 64);
        assert_eq!(header.samples_per_block, 32);
        assert_eq!(header.total_blocks, 2);
        assert_eq!(header.channel_names, vec!["ch0"]);
        assert_eq!(source.num_outputs(), 1);
        assert_eq!(source.num_inputs(), 0);
    }

    #[test]
    fn test_missing_meta_field_rejected() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("meta", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"channels = 2\nsamples = 100\n").unwrap();
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);

        let result = CaptureFileSource::from_reader(cursor);
        assert!(matches!(result, Err(CaptureError::MissingField(_))));
    }

    #[test]
    fn test_level_at_crosses_blocks() {
        // Rises at 10, falls at 40 - with 32-sample blocks the high run
        // spans the block boundary
        let ch = [Edge::new(false, 0), Edge::new(true, 10), Edge::new(false, 40)];
        let archive = build_archive(&[&ch], 64, 32);
        let source = CaptureFileSource::from_reader(archive).unwrap();

        assert!(!source.level_at(0, 0).unwrap());
        assert!(!source.level_at(0, 9).unwrap());
        assert!(source.level_at(0, 10).unwrap());
        assert!(source.level_at(0, 31).unwrap());
        assert!(source.level_at(0, 32).unwrap());
        assert!(source.level_at(0, 39).unwrap());
        assert!(!source.level_at(0, 40).unwrap());
        assert!(!source.level_at(0, 63).unwrap());

        assert!(source.level_at(1, 0).is_err());
        assert!(source.level_at(0, 64).is_err());
    }

    #[test]
    fn test_pipeline_decodes_archived_capture() {
        // Round trip: generate a waveform, pack it into an archive, then
        // decode it back through a full pipeline
        let cfg = SpiConfig {
            has_miso: false,
            ..SpiConfig::default()
        };
        let mut builder = WaveformBuilder::new(cfg, 4);
        builder.advance(10);
        builder.transaction(&[(0xA5, 0), (0x42, 0)]);
        builder.transaction(&[(0x0F, 0)]);
        let wave = builder.finish();

        let total = wave.end + 8;
        let channels = wave.channels();
        // Small blocks so multi-block reads are exercised
        let archive = build_archive(&channels, total, 64);
        let source = CaptureFileSource::from_reader(archive).unwrap();
        assert_eq!(source.header().channels, 3);

        struct Collector {
            events: Arc<Mutex<Vec<SpiEvent>>>,
        }
        impl ProcessNode for Collector {
            fn name(&self) -> &str {
                "collector"
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
                let mut input = inputs[0]
                    .get::<SpiEvent>(&mut buffer)
                    .ok_or_else(|| WorkError::NodeError("Missing input".to_string()))?;
                let event = input.recv()?;
                self.events.lock().unwrap().push(event);
                Ok(1)
            }
        }

        let events = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = Pipeline::new().with_default_buffer_size(4096);
        pipeline.add_process("capture", source).unwrap();
        pipeline
            .add_process("spi", SpiDecoder::new(cfg).unwrap())
            .unwrap();
        pipeline
            .add_process("collector", Collector { events: Arc::clone(&events) })
            .unwrap();

        pipeline.connect("capture", "ch0", "spi", "clk").unwrap();
        pipeline.connect("capture", "ch1", "spi", "mosi").unwrap();
        pipeline.connect("capture", "ch2", "spi", "enable").unwrap();
        pipeline.connect("spi", "events", "collector", "events").unwrap();

        let scheduler = pipeline.build().unwrap();
        scheduler.wait();

        let events = events.lock().unwrap();
        let words: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SpiEvent::Transfer(t) => Some(t.mosi),
                _ => None,
            })
            .collect();
        assert_eq!(words, vec![0xA5, 0x42, 0x0F]);

        let starts = events
            .iter()
            .filter(|e| matches!(e, SpiEvent::TransactionStart { .. }))
            .count();
        assert_eq!(starts, 2);
    }
}
