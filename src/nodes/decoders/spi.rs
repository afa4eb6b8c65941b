//! SPI decoder, edge-by-edge sequential design
//!
//! Walks four channel cursors (clock, mosi, miso, enable) in lock-step and
//! reconstructs transfer words according to the configured clock
//! polarity/phase, shift order and enable polarity. Emits [`SpiEvent`]s
//! with sample-accurate boundaries.
//!
//! Flow per transaction:
//!   1. Advance to the next enable assertion with the clock at its
//!      configured idle level (wrong idle polarity produces an error span
//!      that is skipped entirely)
//!   2. Decode one word at a time, proving before every clock advance that
//!      the enable line survives it
//!   3. On a mid-word deassertion, discard the partial word, report the
//!      disable and resynchronize
//!   4. A trailing edge that carries no data is allowed to fall outside
//!      the enable window; the word still counts
//!
//! All correctness decisions are made from the relative positions of
//! future edges via cursor lookahead - the clock is never advanced past a
//! point where the enable line has already deasserted.

use super::cursor::{ChannelCursor, ChannelState, EdgeCursor};
use super::bits::BitAccumulator;
use super::types::{ConfigError, MarkerKind, SpiConfig, SpiEvent, SpiTransfer, ValidEdge};
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::ports::{PortDirection, PortSchema};
use crate::runtime::{Edge, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// SPI decoder node
///
/// Inputs: clk, then mosi/miso/enable as configured - Edge channels.
/// Output: SpiEvent stream.
pub struct SpiDecoder {
    name: String,
    cfg: SpiConfig,
    /// Marker direction for data-valid edges, fixed per capture
    marker: MarkerKind,

    /// Per-channel putback buffers and cursor positions, persisted across
    /// work() calls. Ordered clk, mosi, miso, enable (absent ones skipped).
    channels: Vec<ChannelState>,

    /// Whether a transaction start has been found
    synced: bool,

    /// Scratch list of data-valid sample positions for the word in flight
    markers: Vec<u64>,

    /// Cooperative stop request, polled once per word
    cancel: Option<Arc<AtomicBool>>,

    /// Transfer counter for logging
    transfers: u64,
}

impl SpiDecoder {
    /// Create a new SPI decoder. The configuration is validated here;
    /// a decoder never exists for an invalid one.
    pub fn new(cfg: SpiConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            name: "spi_decoder".to_string(),
            marker: cfg.marker_kind(),
            channels: (0..cfg.num_channels()).map(|_| ChannelState::default()).collect(),
            cfg,
            synced: false,
            markers: Vec::new(),
            cancel: None,
            transfers: 0,
        })
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach a cooperative cancellation token, polled at every word
    /// boundary. A set token ends the decode within one word's latency.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The decoder's configuration
    pub fn config(&self) -> &SpiConfig {
        &self.cfg
    }
}

impl ProcessNode for SpiDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_inputs(&self) -> usize {
        self.cfg.num_channels()
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        let mut schemas = vec![PortSchema::new::<Edge>("clk", 0, PortDirection::Input)];
        let mut idx = 1;
        if self.cfg.has_mosi {
            schemas.push(PortSchema::new::<Edge>("mosi", idx, PortDirection::Input));
            idx += 1;
        }
        if self.cfg.has_miso {
            schemas.push(PortSchema::new::<Edge>("miso", idx, PortDirection::Input));
            idx += 1;
        }
        if self.cfg.has_enable {
            schemas.push(PortSchema::new::<Edge>("enable", idx, PortDirection::Input));
        }
        schemas
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::new::<SpiEvent>("events", 0, PortDirection::Output)]
    }

    fn work(&mut self, inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                debug!("[{}] Stop requested, ending decode", self.name);
                return Err(WorkError::Shutdown);
            }
        }

        let events = outputs
            .first()
            .and_then(|port| port.get::<SpiEvent>())
            .ok_or_else(|| WorkError::NodeError("Missing events output".into()))?;

        let cfg = self.cfg;

        // ── Attach one cursor per configured channel ─────────────────────
        let mut states = self.channels.iter_mut();
        let clock = attach_cursor(inputs, 0, states.next().unwrap(), "clk")?;
        let mut idx = 1;
        let mosi = if cfg.has_mosi {
            let cur = attach_cursor(inputs, idx, states.next().unwrap(), "mosi")?;
            idx += 1;
            Some(cur)
        } else {
            None
        };
        let miso = if cfg.has_miso {
            let cur = attach_cursor(inputs, idx, states.next().unwrap(), "miso")?;
            idx += 1;
            Some(cur)
        } else {
            None
        };
        let enable = if cfg.has_enable {
            Some(attach_cursor(inputs, idx, states.next().unwrap(), "enable")?)
        } else {
            None
        };

        let produced = {
            let mut engine = Engine {
                cfg,
                clock,
                mosi,
                miso,
                enable,
                events,
                markers: &mut self.markers,
                marker: self.marker,
                current: 0,
            };

            if !self.synced {
                engine.sync_to_transaction()?;
                self.synced = true;
            }

            engine.decode_word()?
        };

        self.transfers += produced as u64;
        Ok(produced)
    }
}

/// Wire one input port to its persisted channel state.
fn attach_cursor<'a>(
    inputs: &'a [InputPort],
    port_idx: usize,
    state: &'a mut ChannelState,
    what: &str,
) -> WorkResult<EdgeCursor<'a>> {
    let ChannelState { buffer, cursor } = state;
    let rx = inputs
        .get(port_idx)
        .and_then(|port| port.get::<Edge>(buffer))
        .ok_or_else(|| WorkError::NodeError(format!("Missing {} input", what)))?;
    EdgeCursor::attach(rx, cursor)
}

/// One decoding pass over the borrowed cursors. Rebuilt per work() call;
/// all persistent state lives in [`SpiDecoder`].
struct Engine<'a, C: ChannelCursor> {
    cfg: SpiConfig,
    clock: C,
    mosi: Option<C>,
    miso: Option<C>,
    enable: Option<C>,
    events: Sender<SpiEvent>,
    markers: &'a mut Vec<u64>,
    marker: MarkerKind,
    current: u64,
}

impl<C: ChannelCursor> Engine<'_, C> {
    /// Advance to the next enable assertion where the clock sits at its
    /// configured idle level, emitting the transaction start. Spans with
    /// the wrong idle polarity are reported as error frames and skipped
    /// whole - no data is decoded inside them.
    fn sync_to_transaction(&mut self) -> WorkResult<()> {
        self.advance_to_enable_assert()?;

        loop {
            // A false return has already moved to the next assertion
            if self.initial_polarity_ok()? {
                if self.enable.is_some() {
                    debug!("Transaction start at sample {}", self.current);
                    self.events
                        .send(SpiEvent::TransactionStart { position: self.current })?;
                }
                return Ok(());
            }
        }
    }

    /// Move the enable cursor to its next active-going edge (skipping the
    /// remainder of the current window when already inside one) and pull
    /// the clock up to it. Without an enable channel the bus counts as
    /// always enabled and nothing moves.
    fn advance_to_enable_assert(&mut self) -> WorkResult<()> {
        let active = self.cfg.enable_polarity.active_bit();
        if let Some(enable) = self.enable.as_mut() {
            if enable.level() != active {
                enable.advance_to_next_edge()?;
            } else {
                enable.advance_to_next_edge()?;
                enable.advance_to_next_edge()?;
            }
            self.current = enable.position();
            self.clock.advance_to_position(self.current)?;
        } else {
            self.current = self.clock.position();
        }
        Ok(())
    }

    /// Check the clock's level against the configured idle level at the
    /// transaction start. On a mismatch the span up to the enable
    /// deassertion is reported as an error frame and the cursors move to
    /// the next assertion; without an enable channel correctness degrades
    /// to starting wherever the clock is idle next.
    fn initial_polarity_ok(&mut self) -> WorkResult<bool> {
        if self.clock.level() == self.cfg.clock_idle.as_bit() {
            return Ok(true);
        }

        debug!("Clock idle polarity mismatch at sample {}", self.current);
        self.events.send(SpiEvent::Marker {
            position: self.current,
            kind: MarkerKind::Error,
        })?;

        if let Some(enable) = self.enable.as_mut() {
            let start = self.current;

            enable.advance_to_next_edge()?;
            self.current = enable.position();
            self.events.send(SpiEvent::Error {
                start,
                end: self.current,
            })?;

            // move to the next active-going enable edge
            enable.advance_to_next_edge()?;
            self.current = enable.position();
            self.clock.advance_to_position(self.current)?;

            Ok(false)
        } else {
            // at least start with the clock in the idle state
            self.clock.advance_to_next_edge()?;
            self.current = self.clock.position();
            Ok(true)
        }
    }

    /// Answer "will the enable line have deasserted by the clock's next
    /// edge?" without moving the clock, so the caller can still record the
    /// word first. Returns the toggle sample when it fires; with `announce`
    /// set the disable event is emitted here, otherwise reporting is the
    /// caller's job.
    fn enable_toggle_before_next_clock_edge(&mut self, announce: bool) -> WorkResult<Option<u64>> {
        let active = self.cfg.enable_polarity.active_bit();
        let Some(enable) = self.enable.as_mut() else {
            return Ok(None);
        };

        // The clock can run out of edges while the enable deassertion is
        // already buffered. Data may still be arriving, so re-check that
        // no clock edge exists up to that pending enable edge before
        // trusting the gap.
        if !self.clock.has_more_transitions() && enable.level() == active {
            if enable.has_more_transitions() {
                let next_enable = enable.next_edge_position()?;
                if !self
                    .clock
                    .would_cross_transition_if_advanced_to(next_enable)?
                {
                    if announce {
                        self.events
                            .send(SpiEvent::Disable { position: next_enable })?;
                    }
                    return Ok(Some(next_enable));
                }
            }
        }

        let next_clock = self.clock.next_edge_position()?;
        if enable.would_cross_transition_if_advanced_to(next_clock)? {
            let toggle_at = enable.next_edge_position()?;
            if announce {
                self.events.send(SpiEvent::Disable { position: toggle_at })?;
            }
            return Ok(Some(toggle_at));
        }

        Ok(None)
    }

    /// Decode exactly one word, assuming entry with the clock at its idle
    /// level. Returns the number of transfers emitted: 0 when the word was
    /// aborted by a mid-word deassertion (partial bits are discarded).
    fn decode_word(&mut self) -> WorkResult<usize> {
        let bits = self.cfg.bits_per_transfer;
        let mut mosi_word = BitAccumulator::new(self.cfg.shift_order, bits);
        let mut miso_word = BitAccumulator::new(self.cfg.shift_order, bits);
        let mut first_sample = 0u64;
        let mut need_reset = false;
        let mut disable_at: Option<u64> = None;

        self.markers.clear();

        for i in 0..bits {
            // On every single edge, check that enable doesn't toggle. The
            // enable cursor can't simply be advanced - there may not be
            // another edge on it.
            if self.enable_toggle_before_next_clock_edge(true)?.is_some() {
                self.sync_to_transaction()?;
                return Ok(0);
            }

            self.clock.advance_to_next_edge()?;
            if i == 0 {
                first_sample = self.clock.position();
            }

            if self.cfg.valid_edge == ValidEdge::Leading {
                self.sample_data(&mut mosi_word, &mut miso_word)?;
            }

            // The trailing edge is messy, but only on the very last bit:
            // when it carries no data, the enable line may rise before it
            // and the frame is still reported.
            if i + 1 == bits && self.cfg.valid_edge != ValidEdge::Trailing {
                disable_at = self.enable_toggle_before_next_clock_edge(false)?;
                if disable_at.is_some() {
                    // jump out, record the frame, then resynchronize
                    need_reset = true;
                    break;
                }

                self.clock.advance_to_next_edge()?;
                break;
            }

            if self.enable_toggle_before_next_clock_edge(true)?.is_some() {
                self.sync_to_transaction()?;
                return Ok(0);
            }

            self.clock.advance_to_next_edge()?;

            if self.cfg.valid_edge == ValidEdge::Trailing {
                self.sample_data(&mut mosi_word, &mut miso_word)?;
            }
        }

        for i in 0..self.markers.len() {
            let position = self.markers[i];
            self.events.send(SpiEvent::Marker {
                position,
                kind: self.marker,
            })?;
        }

        let transfer = SpiTransfer {
            start: first_sample,
            end: self.clock.position(),
            mosi: mosi_word.value(),
            miso: miso_word.value(),
            bits,
        };
        trace!(
            "Transfer mosi={:#x} miso={:#x} at samples {}..{}",
            transfer.mosi,
            transfer.miso,
            transfer.start,
            transfer.end
        );
        self.events.send(SpiEvent::Transfer(transfer))?;

        if need_reset {
            if let Some(position) = disable_at {
                self.events.send(SpiEvent::Disable { position })?;
            }
            self.sync_to_transaction()?;
        }

        Ok(1)
    }

    /// Sample both data lines at the clock's position and remember the
    /// spot for marker emission.
    fn sample_data(
        &mut self,
        mosi_word: &mut BitAccumulator,
        miso_word: &mut BitAccumulator,
    ) -> WorkResult<()> {
        self.current = self.clock.position();
        if let Some(mosi) = self.mosi.as_mut() {
            mosi.advance_to_position(self.current)?;
            mosi_word.add_bit(mosi.level());
        }
        if let Some(miso) = self.miso.as_mut() {
            miso.advance_to_position(self.current)?;
            miso_word.add_bit(miso.level());
        }
        self.markers.push(self.current);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::simulation::{Waveform, WaveformBuilder};
    use super::super::types::{EnablePolarity, ShiftOrder, SpiMode};
    use super::*;
    use crate::runtime::sender::ChannelMessage;
    use crate::runtime::Watchdog;
    use crossbeam_channel::bounded;

    /// Feed pre-built edge streams through the decoder and collect every
    /// event it emits. Channels are sized to hold everything up front so
    /// the single-threaded drive can't deadlock.
    fn run_decoder(cfg: SpiConfig, channels: &[&[Edge]]) -> Vec<SpiEvent> {
        let mut decoder = SpiDecoder::new(cfg).unwrap();
        assert_eq!(decoder.num_inputs(), channels.len(), "channel count mismatch");

        let wd = Watchdog::new();
        let mut inputs = Vec::new();
        for (i, edges) in channels.iter().enumerate() {
            let (tx, rx) = bounded::<ChannelMessage<Edge>>(edges.len() + 1);
            for &edge in edges.iter() {
                tx.send(ChannelMessage::Item(edge)).unwrap();
            }
            tx.send(ChannelMessage::EndOfStream).unwrap();
            inputs.push(InputPort::new_with_watchdog(
                rx,
                &wd,
                "spi_decoder",
                &format!("in{}", i),
            ));
        }

        let (etx, erx) = bounded::<ChannelMessage<SpiEvent>>(1 << 16);
        let outputs = vec![OutputPort::new_with_watchdog(
            Sender::new(vec![etx]),
            &wd,
            "spi_decoder",
            "events",
        )];

        loop {
            match decoder.work(&inputs, &outputs) {
                Ok(_) => {}
                Err(WorkError::Shutdown) => break,
                Err(e) => panic!("decoder error: {}", e),
            }
        }
        drop(outputs);

        let mut events = Vec::new();
        while let Ok(ChannelMessage::Item(event)) = erx.try_recv() {
            events.push(event);
        }
        events
    }

    fn run_waveform(cfg: SpiConfig, wave: &Waveform) -> Vec<SpiEvent> {
        run_decoder(cfg, &wave.channels())
    }

    fn transfers(events: &[SpiEvent]) -> Vec<SpiTransfer> {
        events
            .iter()
            .filter_map(|e| match e {
                SpiEvent::Transfer(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    fn count_kind(events: &[SpiEvent], pred: impl Fn(&SpiEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut cfg = SpiConfig::default();
        cfg.bits_per_transfer = 0;
        assert!(SpiDecoder::new(cfg).is_err());

        let mut cfg = SpiConfig::default();
        cfg.has_mosi = false;
        cfg.has_miso = false;
        assert!(SpiDecoder::new(cfg).is_err());
    }

    #[test]
    fn test_decodes_single_byte() {
        // 8-bit, idle-low clock, leading-edge valid, enable active-low
        let cfg = SpiConfig::default();
        let h = 4;
        let mut builder = WaveformBuilder::new(cfg, h);
        builder.advance(10);
        let assert_at = builder.position();
        builder.transaction(&[(0xA5, 0x5A)]);
        let wave = builder.finish();

        let events = run_waveform(cfg, &wave);

        let words = transfers(&events);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].mosi, 0xA5);
        assert_eq!(words[0].miso, 0x5A);
        assert_eq!(words[0].bits, 8);

        // First leading edge after enable assertion, eight full clock
        // cycles, every edge half a period apart
        let start = assert_at + 3 * h;
        assert_eq!(words[0].start, start);
        assert_eq!(words[0].end, start + 15 * h);

        assert_eq!(
            count_kind(&events, |e| matches!(e, SpiEvent::TransactionStart { .. })),
            1
        );
        assert_eq!(count_kind(&events, |e| matches!(e, SpiEvent::Disable { .. })), 1);
        assert_eq!(count_kind(&events, |e| matches!(e, SpiEvent::Error { .. })), 0);

        // Eight Up markers, one per leading edge
        let markers: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SpiEvent::Marker { position, kind: MarkerKind::Up } => Some(*position),
                _ => None,
            })
            .collect();
        let expected: Vec<u64> = (0..8).map(|i| start + 2 * h * i).collect();
        assert_eq!(markers, expected);
    }

    #[test]
    fn test_multi_word_transaction() {
        let cfg = SpiConfig::default();
        let mut builder = WaveformBuilder::new(cfg, 3);
        builder.advance(10);
        builder.transaction(&[(0x01, 0x10), (0x02, 0x20), (0x03, 0x30)]);
        let wave = builder.finish();

        let events = run_waveform(cfg, &wave);

        let words = transfers(&events);
        assert_eq!(words.len(), 3);
        assert_eq!(words.iter().map(|t| t.mosi).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(words.iter().map(|t| t.miso).collect::<Vec<_>>(), vec![0x10, 0x20, 0x30]);

        // One window: a single start/disable pair around all three words
        assert_eq!(
            count_kind(&events, |e| matches!(e, SpiEvent::TransactionStart { .. })),
            1
        );
        assert_eq!(count_kind(&events, |e| matches!(e, SpiEvent::Disable { .. })), 1);

        // Words don't overlap and come out in wire order
        assert!(words[0].end < words[1].start);
        assert!(words[1].end < words[2].start);
    }

    #[test]
    fn test_round_trip_all_modes() {
        for mode in [SpiMode::Mode0, SpiMode::Mode1, SpiMode::Mode2, SpiMode::Mode3] {
            for order in [ShiftOrder::MsbFirst, ShiftOrder::LsbFirst] {
                for bits in [1u32, 5, 8, 16, 64] {
                    let cfg = SpiConfig {
                        bits_per_transfer: bits,
                        shift_order: order,
                        ..SpiConfig::for_mode(mode)
                    };
                    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };

                    let values: Vec<(u64, u64)> = (0..4u64)
                        .map(|i| (0xA5A5_5A5A_DEAD_BEEF ^ i, 0x0F0F_F0F0_CAFE_F00D ^ i))
                        .collect();

                    let mut builder = WaveformBuilder::new(cfg, 2);
                    builder.advance(10);
                    builder.transaction(&values[..2]);
                    builder.transaction(&values[2..]);
                    let wave = builder.finish();

                    let events = run_waveform(cfg, &wave);
                    let words = transfers(&events);

                    assert_eq!(words.len(), 4, "mode {:?} order {:?} bits {}", mode, order, bits);
                    for (word, &(mosi, miso)) in words.iter().zip(values.iter()) {
                        assert_eq!(word.mosi, mosi & mask);
                        assert_eq!(word.miso, miso & mask);
                    }
                    assert_eq!(
                        count_kind(&events, |e| matches!(e, SpiEvent::Error { .. })),
                        0,
                        "no error events once synced"
                    );
                }
            }
        }
    }

    #[test]
    fn test_opposite_shift_order_bit_reverses() {
        let lsb_cfg = SpiConfig {
            shift_order: ShiftOrder::LsbFirst,
            has_miso: false,
            ..SpiConfig::default()
        };
        let mut builder = WaveformBuilder::new(lsb_cfg, 2);
        builder.advance(8);
        builder.transaction(&[(0xB4, 0)]);
        let wave = builder.finish();

        // Same bit sequence decoded with the matching order...
        let words = transfers(&run_waveform(lsb_cfg, &wave));
        assert_eq!(words[0].mosi, 0xB4);

        // ...and with the opposite order comes out bit-reversed
        let msb_cfg = SpiConfig {
            shift_order: ShiftOrder::MsbFirst,
            ..lsb_cfg
        };
        let words = transfers(&run_waveform(msb_cfg, &wave));
        assert_eq!(words[0].mosi, (0xB4u8).reverse_bits() as u64);
        assert_eq!(words[0].mosi, 0x2D);
    }

    #[test]
    fn test_premature_disable_discards_partial_word() {
        let cfg = SpiConfig {
            has_miso: false,
            ..SpiConfig::default()
        };
        let mut builder = WaveformBuilder::new(cfg, 4);
        builder.advance(10);

        // Enable deasserts between bit 6 and bit 7 of the first word
        builder.assert_enable();
        builder.advance(2);
        builder.word_bits(0xA5, 0, 7);
        let disable_at = builder.position();
        builder.deassert_enable();
        builder.advance(6);

        // A clean transaction afterwards proves resynchronization works
        builder.transaction(&[(0x3C, 0)]);
        let wave = builder.finish();

        let events = run_waveform(cfg, &wave);

        let words = transfers(&events);
        assert_eq!(words.len(), 1, "the partial word must not be reported");
        assert_eq!(words[0].mosi, 0x3C);

        let disables: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SpiEvent::Disable { position } => Some(*position),
                _ => None,
            })
            .collect();
        assert_eq!(disables.len(), 2);
        assert_eq!(disables[0], disable_at, "disable at the actual toggle sample");

        assert_eq!(
            count_kind(&events, |e| matches!(e, SpiEvent::TransactionStart { .. })),
            2
        );

        // Nothing but the aborted attempt sits between the first start and
        // the first disable: no markers, no transfer
        let first_disable = events
            .iter()
            .position(|e| matches!(e, SpiEvent::Disable { .. }))
            .unwrap();
        assert!(events[..first_disable]
            .iter()
            .all(|e| matches!(e, SpiEvent::TransactionStart { .. })));
    }

    #[test]
    fn test_trailing_edge_may_fall_outside_enable() {
        // 2-bit word, leading-edge valid: enable rises between the last
        // leading edge and the clock's return to idle. The frame still
        // counts, ending on the last data-valid edge.
        let cfg = SpiConfig {
            bits_per_transfer: 2,
            has_miso: false,
            ..SpiConfig::default()
        };
        let clk = [
            Edge::new(false, 0),
            Edge::new(true, 120),
            Edge::new(false, 130),
            Edge::new(true, 140),
            Edge::new(false, 170),
        ];
        let mosi = [Edge::new(false, 0), Edge::new(true, 115), Edge::new(false, 135)];
        let enable = [Edge::new(true, 0), Edge::new(false, 100), Edge::new(true, 160)];

        let events = run_decoder(cfg, &[&clk, &mosi, &enable]);

        assert_eq!(
            events,
            vec![
                SpiEvent::TransactionStart { position: 100 },
                SpiEvent::Marker { position: 120, kind: MarkerKind::Up },
                SpiEvent::Marker { position: 140, kind: MarkerKind::Up },
                SpiEvent::Transfer(SpiTransfer {
                    start: 120,
                    end: 140,
                    mosi: 0b10,
                    miso: 0,
                    bits: 2,
                }),
                SpiEvent::Disable { position: 160 },
            ]
        );
    }

    #[test]
    fn test_truncated_capture_after_enable_edge() {
        // Capture ends right after the enable assertion: no clock edges at
        // all. Expect the disable at the buffered deassertion and no
        // partial frame.
        let cfg = SpiConfig {
            has_miso: false,
            ..SpiConfig::default()
        };
        let clk = [Edge::new(false, 0)];
        let mosi = [Edge::new(false, 0)];
        let enable = [Edge::new(true, 0), Edge::new(false, 100), Edge::new(true, 200)];

        let events = run_decoder(cfg, &[&clk, &mosi, &enable]);

        assert_eq!(
            events,
            vec![
                SpiEvent::TransactionStart { position: 100 },
                SpiEvent::Disable { position: 200 },
            ]
        );
    }

    #[test]
    fn test_polarity_error_skips_span() {
        // Clock is high at the first assertion while the configuration
        // says idle-low: exactly one error frame spanning to the
        // deassertion, then clean decoding from the next window.
        let cfg = SpiConfig {
            bits_per_transfer: 2,
            has_miso: false,
            ..SpiConfig::default()
        };
        let clk = [
            Edge::new(false, 0),
            Edge::new(true, 80),
            Edge::new(false, 300),
            Edge::new(true, 420),
            Edge::new(false, 440),
            Edge::new(true, 460),
            Edge::new(false, 480),
        ];
        let mosi = [Edge::new(false, 0), Edge::new(true, 415), Edge::new(false, 455)];
        let enable = [
            Edge::new(true, 0),
            Edge::new(false, 150),
            Edge::new(true, 250),
            Edge::new(false, 350),
            Edge::new(true, 600),
        ];

        let events = run_decoder(cfg, &[&clk, &mosi, &enable]);

        assert_eq!(
            events,
            vec![
                SpiEvent::Marker { position: 150, kind: MarkerKind::Error },
                SpiEvent::Error { start: 150, end: 250 },
                SpiEvent::TransactionStart { position: 350 },
                SpiEvent::Marker { position: 420, kind: MarkerKind::Up },
                SpiEvent::Marker { position: 460, kind: MarkerKind::Up },
                SpiEvent::Transfer(SpiTransfer {
                    start: 420,
                    end: 480,
                    mosi: 0b10,
                    miso: 0,
                    bits: 2,
                }),
                SpiEvent::Disable { position: 600 },
            ]
        );
    }

    #[test]
    fn test_active_high_enable() {
        let cfg = SpiConfig {
            enable_polarity: EnablePolarity::ActiveHigh,
            has_miso: false,
            ..SpiConfig::default()
        };
        let mut builder = WaveformBuilder::new(cfg, 3);
        builder.advance(10);
        builder.transaction(&[(0x42, 0)]);
        let wave = builder.finish();

        let events = run_waveform(cfg, &wave);
        let words = transfers(&events);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].mosi, 0x42);
    }

    #[test]
    fn test_no_enable_channel_decodes_continuously() {
        let cfg = SpiConfig {
            has_miso: false,
            has_enable: false,
            ..SpiConfig::default()
        };
        let mut builder = WaveformBuilder::new(cfg, 3);
        builder.advance(10);
        builder.word(0x11, 0);
        builder.word(0x22, 0);
        let wave = builder.finish();

        let events = run_waveform(cfg, &wave);

        let words = transfers(&events);
        assert_eq!(words.iter().map(|t| t.mosi).collect::<Vec<_>>(), vec![0x11, 0x22]);

        // No transaction concept without an enable line
        assert_eq!(
            count_kind(&events, |e| {
                matches!(e, SpiEvent::TransactionStart { .. } | SpiEvent::Disable { .. })
            }),
            0
        );
    }

    #[test]
    fn test_no_enable_wrong_initial_polarity() {
        // Without an enable channel a polarity mismatch just skips to the
        // next clock edge - an error marker, but no error frame.
        let cfg = SpiConfig {
            bits_per_transfer: 1,
            has_miso: false,
            has_enable: false,
            ..SpiConfig::default()
        };
        let clk = [
            Edge::new(true, 0),
            Edge::new(false, 50),
            Edge::new(true, 100),
            Edge::new(false, 120),
        ];
        let mosi = [Edge::new(false, 0), Edge::new(true, 90)];

        let events = run_decoder(cfg, &[&clk, &mosi]);

        assert_eq!(
            events,
            vec![
                SpiEvent::Marker { position: 0, kind: MarkerKind::Error },
                SpiEvent::Marker { position: 100, kind: MarkerKind::Up },
                SpiEvent::Transfer(SpiTransfer {
                    start: 100,
                    end: 120,
                    mosi: 1,
                    miso: 0,
                    bits: 1,
                }),
            ]
        );
    }

    #[test]
    fn test_idempotent_resynchronization() {
        // Once a transaction start with matching polarity is found, no
        // error events appear until enable actually deasserts.
        let cfg = SpiConfig::default();
        let mut builder = WaveformBuilder::new(cfg, 2);
        builder.advance(10);
        for i in 0..5u64 {
            builder.transaction(&[(i, i + 0x80)]);
        }
        let wave = builder.finish();

        let events = run_waveform(cfg, &wave);
        assert_eq!(count_kind(&events, |e| matches!(e, SpiEvent::Error { .. })), 0);
        assert_eq!(transfers(&events).len(), 5);
    }

    #[test]
    fn test_cancellation_honored_at_word_boundary() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut decoder = SpiDecoder::new(SpiConfig::default())
            .unwrap()
            .with_cancel(Arc::clone(&cancel));

        // Already-set token stops the decode before anything is consumed
        let result = decoder.work(&[], &[]);
        assert!(matches!(result, Err(WorkError::Shutdown)));
    }

    #[test]
    fn test_trailing_valid_mode_round_trip() {
        // Mode 3: idle-high, trailing-edge valid, Down markers inverted to Up
        let cfg = SpiConfig {
            has_miso: false,
            ..SpiConfig::for_mode(SpiMode::Mode3)
        };
        let mut builder = WaveformBuilder::new(cfg, 3);
        builder.advance(10);
        builder.transaction(&[(0xC3, 0)]);
        let wave = builder.finish();

        let events = run_waveform(cfg, &wave);
        let words = transfers(&events);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].mosi, 0xC3);
        assert!(events
            .iter()
            .any(|e| matches!(e, SpiEvent::Marker { kind: MarkerKind::Up, .. })));
    }
}
