//! Edge-indexed cursors over channel streams
//!
//! A cursor is a stateful read position over one channel's edge stream.
//! The decoder walks four of them in lock-step and makes its correctness
//! decisions purely from the relative positions of future edges, so the
//! cursor exposes lookahead (`next_edge_position`,
//! `would_cross_transition_if_advanced_to`) that never moves the read
//! position.

use std::collections::VecDeque;

use crate::runtime::errors::{WorkError, WorkResult};
use crate::runtime::receiver::Receiver;
use crate::runtime::Edge;

/// Read access to one digital channel as an ordered sequence of level
/// transitions.
///
/// Blocking operations suspend until the upstream source produces more
/// edges; exhaustion of the capture surfaces as `WorkError::Shutdown` and
/// is treated as normal termination by callers.
pub trait ChannelCursor {
    /// Channel level at the current position
    fn level(&self) -> bool;

    /// Current absolute sample position
    fn position(&self) -> u64;

    /// Move to the next transition
    fn advance_to_next_edge(&mut self) -> WorkResult<()>;

    /// Move forward to an absolute sample, consuming any transitions on
    /// the way. No-op if the cursor is already at or past `target`.
    fn advance_to_position(&mut self, target: u64) -> WorkResult<()>;

    /// Sample of the next transition, without moving
    fn next_edge_position(&mut self) -> WorkResult<u64>;

    /// Whether moving to `target` would cross a transition. `false` once
    /// the stream has ended (the level holds to the end of the capture).
    fn would_cross_transition_if_advanced_to(&mut self, target: u64) -> WorkResult<bool>;

    /// Whether another transition exists in currently available data.
    /// Strictly non-blocking: re-polls the channel on every call, so the
    /// answer tracks data still arriving from a live capture.
    fn has_more_transitions(&mut self) -> bool;
}

/// Cursor position state, persisted by the owning node across `work()`
/// calls while the [`EdgeCursor`] borrowing it is rebuilt every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct CursorState {
    level: bool,
    position: u64,
    primed: bool,
}

/// Per-channel decoder state: the putback buffer backing the runtime
/// receiver plus the cursor position.
#[derive(Default)]
pub struct ChannelState {
    pub buffer: VecDeque<Edge>,
    pub cursor: CursorState,
}

/// [`ChannelCursor`] over a runtime [`Receiver`] of edges.
pub struct EdgeCursor<'a> {
    rx: Receiver<'a, Edge>,
    state: &'a mut CursorState,
}

impl<'a> EdgeCursor<'a> {
    /// Wrap a receiver, consuming the channel's initial edge on first
    /// attach to establish the starting level.
    pub fn attach(rx: Receiver<'a, Edge>, state: &'a mut CursorState) -> WorkResult<Self> {
        let mut cursor = Self { rx, state };
        if !cursor.state.primed {
            let first = cursor.rx.recv()?;
            cursor.state.level = first.level;
            cursor.state.position = first.position;
            cursor.state.primed = true;
        }
        Ok(cursor)
    }
}

impl ChannelCursor for EdgeCursor<'_> {
    fn level(&self) -> bool {
        self.state.level
    }

    fn position(&self) -> u64 {
        self.state.position
    }

    fn advance_to_next_edge(&mut self) -> WorkResult<()> {
        let edge = self.rx.recv()?;
        self.state.level = edge.level;
        self.state.position = edge.position;
        Ok(())
    }

    fn advance_to_position(&mut self, target: u64) -> WorkResult<()> {
        loop {
            match self.rx.peek() {
                Ok(next) if next.position <= target => {
                    let edge = self.rx.recv()?;
                    self.state.level = edge.level;
                    self.state.position = edge.position;
                }
                Ok(_) => break,
                // Stream ended: the current level holds to the capture end
                Err(WorkError::Shutdown) => break,
                Err(e) => return Err(e),
            }
        }
        if target > self.state.position {
            self.state.position = target;
        }
        Ok(())
    }

    fn next_edge_position(&mut self) -> WorkResult<u64> {
        Ok(self.rx.peek()?.position)
    }

    fn would_cross_transition_if_advanced_to(&mut self, target: u64) -> WorkResult<bool> {
        match self.rx.peek() {
            Ok(next) => Ok(next.position <= target),
            Err(WorkError::Shutdown) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn has_more_transitions(&mut self) -> bool {
        if self.rx.has_buffered() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(edge) => {
                self.rx.put_back(edge);
                true
            }
            Err(_) => false,
        }
    }
}
