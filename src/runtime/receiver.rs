//! Receiving side of a node connection
//!
//! [`Receiver`] layers a putback buffer over one crossbeam channel so that
//! consumers can peek ahead and un-consume items, which is what the
//! decoder's cursor lookahead is built on. `ChannelMessage` framing is
//! unwrapped here; once `EndOfStream` (or a disconnect) is seen, every
//! later call reports `Shutdown` without touching the channel again.

use crossbeam_channel::{Receiver as CrossbeamReceiver, TryRecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

use super::errors::{WorkError, WorkResult};
use super::sender::ChannelMessage;
use super::watchdog::{OperationGuard, WatchdogHandle};

/// Buffered receiver over one channel.
///
/// The putback buffer and the end-of-stream flag are borrowed from the
/// owning node's persistent state; the `Receiver` itself is rebuilt on
/// every `work()` call and carries no state of its own. Blocking calls are
/// watchdog-guarded.
pub struct Receiver<'a, T> {
    receiver: &'a CrossbeamReceiver<ChannelMessage<T>>,
    buffer: &'a mut VecDeque<T>,
    watchdog_handle: Option<WatchdogHandle>,
    eos: &'a AtomicBool,
}

impl<'a, T> Receiver<'a, T> {
    pub fn new(
        receiver: &'a CrossbeamReceiver<ChannelMessage<T>>,
        buffer: &'a mut VecDeque<T>,
        watchdog_handle: WatchdogHandle,
        eos: &'a AtomicBool,
    ) -> Self {
        Self {
            receiver,
            buffer,
            watchdog_handle: Some(watchdog_handle),
            eos,
        }
    }

    /// Block until the buffer holds at least one item. `Shutdown` once the
    /// stream is over, now or from an earlier call.
    fn refill(&mut self) -> WorkResult<()> {
        if self.eos.load(Ordering::Relaxed) {
            return Err(WorkError::Shutdown);
        }
        if !self.buffer.is_empty() {
            return Ok(());
        }

        let _guard = self.watchdog_handle.as_ref().map(OperationGuard::new);
        match self.receiver.recv() {
            Ok(ChannelMessage::Item(item)) => {
                self.buffer.push_back(item);
                Ok(())
            }
            Ok(ChannelMessage::EndOfStream) | Err(_) => {
                trace!("channel closed, reporting Shutdown");
                self.eos.store(true, Ordering::Relaxed);
                Err(WorkError::Shutdown)
            }
        }
    }

    /// Take the next item, blocking while the channel is empty
    pub fn recv(&mut self) -> WorkResult<T> {
        self.refill()?;
        Ok(self.buffer.pop_front().unwrap())
    }

    /// Look at the next item without taking it, blocking while the
    /// channel is empty
    pub fn peek(&mut self) -> WorkResult<&T> {
        self.refill()?;
        Ok(self.buffer.front().unwrap())
    }

    /// Non-blocking take. `Disconnected` doubles as the end-of-stream
    /// answer so callers need only one emptiness case.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        if self.eos.load(Ordering::Relaxed) {
            return Err(TryRecvError::Disconnected);
        }
        if let Some(item) = self.buffer.pop_front() {
            return Ok(item);
        }
        match self.receiver.try_recv() {
            Ok(ChannelMessage::Item(item)) => Ok(item),
            Ok(ChannelMessage::EndOfStream) => {
                self.eos.store(true, Ordering::Relaxed);
                Err(TryRecvError::Disconnected)
            }
            Err(e) => Err(e),
        }
    }

    /// Return an item to the front; the next `recv()`/`peek()` sees it
    /// first
    pub fn put_back(&mut self, item: T) {
        self.buffer.push_front(item);
    }

    /// Whether any item sits in the putback buffer
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Watchdog;
    use crossbeam_channel::bounded;

    struct Fixture {
        tx: crossbeam_channel::Sender<ChannelMessage<i32>>,
        rx: CrossbeamReceiver<ChannelMessage<i32>>,
        buffer: VecDeque<i32>,
        eos: AtomicBool,
        wd: Watchdog,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = bounded(16);
            Self {
                tx,
                rx,
                buffer: VecDeque::new(),
                eos: AtomicBool::new(false),
                wd: Watchdog::new(),
            }
        }

        fn receiver(&mut self) -> Receiver<'_, i32> {
            let handle = self.wd.register_port("fixture", "recv", "in");
            Receiver::new(&self.rx, &mut self.buffer, handle, &self.eos)
        }
    }

    #[test]
    fn test_recv_drains_buffer_before_channel() {
        let mut fx = Fixture::new();
        fx.buffer.push_back(42);
        fx.tx.send(ChannelMessage::Item(99)).unwrap();

        let mut rx = fx.receiver();
        assert_eq!(rx.recv().unwrap(), 42);
        assert_eq!(rx.recv().unwrap(), 99);
    }

    #[test]
    fn test_peek_then_put_back() {
        let mut fx = Fixture::new();
        fx.tx.send(ChannelMessage::Item(5)).unwrap();

        let mut rx = fx.receiver();
        assert!(!rx.has_buffered());
        assert_eq!(rx.peek().unwrap(), &5);
        // peek pulled the item into the buffer without consuming it
        assert!(rx.has_buffered());
        assert_eq!(rx.recv().unwrap(), 5);

        rx.put_back(7);
        assert_eq!(rx.peek().unwrap(), &7);
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn test_try_recv_never_blocks() {
        let mut fx = Fixture::new();
        {
            let mut rx = fx.receiver();
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        }
        fx.tx.send(ChannelMessage::Item(3)).unwrap();
        let mut rx = fx.receiver();
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn test_end_of_stream_is_sticky() {
        let mut fx = Fixture::new();
        fx.tx.send(ChannelMessage::Item(1)).unwrap();
        fx.tx.send(ChannelMessage::EndOfStream).unwrap();
        // An item after the marker must never be surfaced
        fx.tx.send(ChannelMessage::Item(2)).unwrap();

        let mut rx = fx.receiver();
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(matches!(rx.recv(), Err(WorkError::Shutdown)));
        assert!(matches!(rx.peek(), Err(WorkError::Shutdown)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_end_of_stream_survives_rebuild() {
        let mut fx = Fixture::new();
        fx.tx.send(ChannelMessage::EndOfStream).unwrap();
        {
            let mut rx = fx.receiver();
            assert!(matches!(rx.recv(), Err(WorkError::Shutdown)));
        }
        // A fresh Receiver over the same node state remembers the closure
        {
            let mut rx = fx.receiver();
            assert!(matches!(rx.recv(), Err(WorkError::Shutdown)));
        }
    }

    #[test]
    fn test_disconnect_reads_as_shutdown() {
        // A producer dying without sending EndOfStream still terminates
        // the consumer cleanly
        let (tx, chan_rx) = bounded::<ChannelMessage<i32>>(4);
        tx.send(ChannelMessage::Item(8)).unwrap();
        drop(tx);

        let wd = Watchdog::new();
        let handle = wd.register_port("fixture", "recv", "in");
        let mut buffer = VecDeque::new();
        let eos = AtomicBool::new(false);
        let mut rx = Receiver::new(&chan_rx, &mut buffer, handle, &eos);

        assert_eq!(rx.recv().unwrap(), 8);
        assert!(matches!(rx.recv(), Err(WorkError::Shutdown)));
    }
}
