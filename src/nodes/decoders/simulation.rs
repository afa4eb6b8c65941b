//! Synthetic SPI waveform generation
//!
//! Builds per-channel edge streams whose encoding is the exact inverse of
//! the decoder: round-tripping a generated waveform through [`SpiDecoder`]
//! reproduces the word values it was built from. This is the primary
//! correctness check for the decoder without real hardware, and
//! [`SimulationSource`] lets whole pipelines run from it.
//!
//! [`SpiDecoder`]: super::SpiDecoder

use super::bits::BitExtractor;
use super::types::{SpiConfig, ValidEdge};
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::ports::{PortDirection, PortSchema};
use crate::runtime::{Edge, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// One generated channel: current level plus the recorded edge stream.
/// Only actual level changes are recorded, preserving the transitions-only
/// invariant the cursors rely on.
#[derive(Debug)]
struct TrackedChannel {
    level: bool,
    edges: Vec<Edge>,
}

impl TrackedChannel {
    fn new(initial: bool) -> Self {
        Self {
            level: initial,
            edges: vec![Edge::new(initial, 0)],
        }
    }

    fn transition(&mut self, at: u64) {
        self.level = !self.level;
        self.edges.push(Edge::new(self.level, at));
    }

    fn set_level(&mut self, level: bool, at: u64) {
        if level != self.level {
            self.transition(at);
        }
    }
}

/// Generated per-channel edge streams, in decoder input order.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub clock: Vec<Edge>,
    pub mosi: Option<Vec<Edge>>,
    pub miso: Option<Vec<Edge>>,
    pub enable: Option<Vec<Edge>>,
    /// First sample past the generated data
    pub end: u64,
}

impl Waveform {
    /// Channel streams in decoder input order (clock, mosi, miso, enable),
    /// absent channels skipped.
    pub fn channels(&self) -> Vec<&[Edge]> {
        let mut out: Vec<&[Edge]> = vec![&self.clock];
        if let Some(m) = &self.mosi {
            out.push(m);
        }
        if let Some(m) = &self.miso {
            out.push(m);
        }
        if let Some(e) = &self.enable {
            out.push(e);
        }
        out
    }
}

/// Composes idle periods and transactions into a waveform for a given
/// configuration.
///
/// Timing base is `half_period` samples per half clock period. Data lines
/// change half a period before the leading edge (CPHA0) or on the leading
/// edge itself (CPHA1), and are reset low after each word. Enable is
/// asserted two half-periods before a transaction's first word.
pub struct WaveformBuilder {
    cfg: SpiConfig,
    half_period: u64,
    at: u64,
    clock: TrackedChannel,
    mosi: Option<TrackedChannel>,
    miso: Option<TrackedChannel>,
    enable: Option<TrackedChannel>,
}

impl WaveformBuilder {
    pub fn new(cfg: SpiConfig, half_period: u64) -> Self {
        assert!(half_period >= 1, "half_period must be at least one sample");
        Self {
            cfg,
            half_period,
            at: 0,
            clock: TrackedChannel::new(cfg.clock_idle.as_bit()),
            mosi: cfg.has_mosi.then(|| TrackedChannel::new(false)),
            miso: cfg.has_miso.then(|| TrackedChannel::new(false)),
            enable: cfg
                .has_enable
                .then(|| TrackedChannel::new(!cfg.enable_polarity.active_bit())),
        }
    }

    /// Current sample position
    pub fn position(&self) -> u64 {
        self.at
    }

    /// Let all channels idle for `half_periods` half clock periods
    pub fn advance(&mut self, half_periods: u64) {
        self.at += half_periods * self.half_period;
    }

    /// Drive enable to its active level
    pub fn assert_enable(&mut self) {
        let active = self.cfg.enable_polarity.active_bit();
        if let Some(en) = self.enable.as_mut() {
            en.set_level(active, self.at);
        }
    }

    /// Drive enable to its inactive level
    pub fn deassert_enable(&mut self) {
        let active = self.cfg.enable_polarity.active_bit();
        if let Some(en) = self.enable.as_mut() {
            en.set_level(!active, self.at);
        }
    }

    /// Emit one full transfer word
    pub fn word(&mut self, mosi: u64, miso: u64) {
        self.word_bits(mosi, miso, self.cfg.bits_per_transfer);
    }

    /// Emit only the first `count` bits of a word. Used to build captures
    /// where enable deasserts mid-word.
    pub fn word_bits(&mut self, mosi: u64, miso: u64, count: u32) {
        let bits = self.cfg.bits_per_transfer;
        let h = self.half_period;
        let mut mosi_bits = BitExtractor::new(mosi, self.cfg.shift_order, bits);
        let mut miso_bits = BitExtractor::new(miso, self.cfg.shift_order, bits);

        match self.cfg.valid_edge {
            ValidEdge::Leading => {
                for _ in 0..count {
                    let mb = mosi_bits.next_bit();
                    let sb = miso_bits.next_bit();
                    if let Some(m) = self.mosi.as_mut() {
                        m.set_level(mb, self.at);
                    }
                    if let Some(m) = self.miso.as_mut() {
                        m.set_level(sb, self.at);
                    }
                    self.at += h;
                    self.clock.transition(self.at); // data valid
                    self.at += h;
                    self.clock.transition(self.at);
                }
            }
            ValidEdge::Trailing => {
                for _ in 0..count {
                    let mb = mosi_bits.next_bit();
                    let sb = miso_bits.next_bit();
                    self.clock.transition(self.at);
                    if let Some(m) = self.mosi.as_mut() {
                        m.set_level(mb, self.at);
                    }
                    if let Some(m) = self.miso.as_mut() {
                        m.set_level(sb, self.at);
                    }
                    self.at += h;
                    self.clock.transition(self.at); // data valid
                    self.at += h;
                }
            }
        }

        if let Some(m) = self.mosi.as_mut() {
            m.set_level(false, self.at);
        }
        if let Some(m) = self.miso.as_mut() {
            m.set_level(false, self.at);
        }
        self.advance(2);
    }

    /// Emit one transaction: enable asserted around the given
    /// (mosi, miso) words.
    pub fn transaction(&mut self, words: &[(u64, u64)]) {
        self.assert_enable();
        self.advance(2);
        for &(mosi, miso) in words {
            self.word(mosi, miso);
        }
        self.deassert_enable();
        self.advance(2);
    }

    /// Finish and return the per-channel edge streams
    pub fn finish(self) -> Waveform {
        Waveform {
            clock: self.clock.edges,
            mosi: self.mosi.map(|c| c.edges),
            miso: self.miso.map(|c| c.edges),
            enable: self.enable.map(|c| c.edges),
            end: self.at,
        }
    }
}

/// Source node that streams a pre-built [`Waveform`] into a pipeline.
///
/// Output ports follow decoder input order and naming (clk, mosi, miso,
/// enable), so wiring to [`SpiDecoder`](super::SpiDecoder) is one
/// `connect` per present channel.
///
/// Self-threading like [`CaptureFileSource`](crate::CaptureFileSource):
/// one feeder thread per broadcast destination, each replaying its
/// channel's edges and closing the stream when done.
pub struct SimulationSource {
    name: String,
    waveform: Arc<Waveform>,
    port_names: Vec<&'static str>,
    feeders_done: Arc<AtomicUsize>,
    feeder_handles: Option<Vec<JoinHandle<()>>>,
    launched: bool,
    feeder_count: usize,
}

impl SimulationSource {
    pub fn new(waveform: Waveform) -> Self {
        let mut port_names = vec!["clk"];
        if waveform.mosi.is_some() {
            port_names.push("mosi");
        }
        if waveform.miso.is_some() {
            port_names.push("miso");
        }
        if waveform.enable.is_some() {
            port_names.push("enable");
        }
        Self {
            name: "simulation_source".to_string(),
            waveform: Arc::new(waveform),
            port_names,
            feeders_done: Arc::new(AtomicUsize::new(0)),
            feeder_handles: None,
            launched: false,
            feeder_count: 0,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Replay one channel's edges to one destination
fn feed_channel(waveform: Arc<Waveform>, channel: usize, sender: Sender<Edge>, done: Arc<AtomicUsize>) {
    let edges = waveform.channels()[channel];
    debug!("[sim ch{}] Replaying {} edges", channel, edges.len());
    for &edge in edges {
        if sender.send(edge).is_err() {
            debug!("[sim ch{}] Consumer hung up", channel);
            break;
        }
    }
    sender.close();
    done.fetch_add(1, Ordering::Relaxed);
}

impl ProcessNode for SimulationSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_stop(&self) -> bool {
        self.launched && self.feeders_done.load(Ordering::Relaxed) >= self.feeder_count
    }

    fn is_self_threading(&self) -> bool {
        true
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_outputs(&self) -> usize {
        self.port_names.len()
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        self.port_names
            .iter()
            .enumerate()
            .map(|(i, name)| PortSchema::new::<Edge>(*name, i, PortDirection::Output))
            .collect()
    }

    fn work(&mut self, _inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        if self.launched {
            return Err(WorkError::NodeError(
                "simulation source launched twice".to_string(),
            ));
        }
        self.launched = true;

        let mut handles = Vec::new();
        for (channel, port) in outputs.iter().enumerate().take(self.port_names.len()) {
            let Some(senders) = port.split_senders::<Edge>() else {
                continue;
            };
            for (dest, sender) in senders.into_iter().enumerate() {
                let waveform = Arc::clone(&self.waveform);
                let done = Arc::clone(&self.feeders_done);
                let handle = std::thread::Builder::new()
                    .name(format!("sim_ch{}_dest{}", channel, dest))
                    .spawn(move || feed_channel(waveform, channel, sender, done))
                    .map_err(|e| WorkError::NodeError(format!("cannot spawn feeder: {}", e)))?;
                handles.push(handle);
            }
        }

        self.feeder_count = handles.len();
        self.feeder_handles = Some(handles);
        info!("Simulation source: {} feeders running", self.feeder_count);
        Ok(0)
    }
}

impl Drop for SimulationSource {
    fn drop(&mut self) {
        if let Some(handles) = self.feeder_handles.take() {
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}
