//! Core data type for channel streams

use std::fmt;

/// One level transition on a digital channel.
///
/// Channel streams are run-length encoded: `level` holds from `position`
/// (a 0-based sample index) until the position of the next edge. Sources
/// emit one initial edge at the capture start to establish the starting
/// level, and after that only send on actual transitions, so consecutive
/// edges on a channel always differ in level. Cursor lookahead relies on
/// that invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    /// Channel level from this sample onward
    pub level: bool,
    /// Sample index where this level starts
    pub position: u64,
}

impl Edge {
    pub fn new(level: bool, position: u64) -> Self {
        Self { level, position }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Edge[{}@{}]", u8::from(self.level), self.position)
    }
}
