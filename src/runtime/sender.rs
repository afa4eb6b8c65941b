//! Broadcast sender side of a node connection

use crossbeam_channel::{SendError, Sender as CrossbeamSender};

use super::watchdog::{OperationGuard, WatchdogHandle};

/// In-band framing for node channels.
///
/// Dropping a sender clone is not enough to close a channel here: nodes
/// that spawn per-destination threads hand out cloned handles via
/// `split_senders()`, and the `Sender` kept by the `OutputPort` holds the
/// channel open regardless. End-of-stream therefore travels as an explicit
/// message. Nodes never handle this enum themselves; `send()` wraps and
/// `Receiver` unwraps.
#[derive(Clone, Debug)]
pub enum ChannelMessage<T> {
    Item(T),
    /// The producer is done; nothing follows
    EndOfStream,
}

/// Fan-out sender delivering each value to every connected consumer.
///
/// Delivery is sequential from the calling thread. A node that cannot
/// afford one slow consumer stalling the rest takes `split_senders()` and
/// drives each destination from its own thread instead.
pub struct Sender<T> {
    destinations: Vec<CrossbeamSender<ChannelMessage<T>>>,
    watchdog_handle: Option<WatchdogHandle>,
}

impl<T: Clone> Sender<T> {
    pub fn new(destinations: Vec<CrossbeamSender<ChannelMessage<T>>>) -> Self {
        Self {
            destinations,
            watchdog_handle: None,
        }
    }

    /// Same destinations, with send operations watchdog-guarded
    pub fn with_watchdog(&self, watchdog_handle: WatchdogHandle) -> Self {
        Self {
            destinations: self.destinations.clone(),
            watchdog_handle: Some(watchdog_handle),
        }
    }

    /// Break the fan-out into one single-destination sender per consumer
    pub fn split_senders(&self) -> Vec<Sender<T>> {
        self.destinations
            .iter()
            .map(|dest| Sender {
                destinations: vec![dest.clone()],
                watchdog_handle: self.watchdog_handle.clone(),
            })
            .collect()
    }

    /// Deliver `value` to every destination.
    ///
    /// Individual consumers hanging up is tolerated; the send only fails
    /// once nobody is left listening, so producers can use the error as
    /// their cue to stop.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let _guard = self.watchdog_handle.as_ref().map(OperationGuard::new);

        let mut delivered = 0usize;
        let mut returned = None;
        for dest in &self.destinations {
            match dest.send(ChannelMessage::Item(value.clone())) {
                Ok(()) => delivered += 1,
                Err(SendError(ChannelMessage::Item(v))) => returned = Some(v),
                Err(SendError(ChannelMessage::EndOfStream)) => {}
            }
        }

        match returned {
            Some(v) if delivered == 0 => Err(SendError(v)),
            _ => Ok(()),
        }
    }

    /// Tell every destination the stream is over.
    ///
    /// Mandatory for self-threading nodes before their sender threads
    /// exit; without it downstream `recv()` calls block forever on the
    /// still-open channel.
    pub fn close(&self) {
        let _guard = self.watchdog_handle.as_ref().map(OperationGuard::new);
        for dest in &self.destinations {
            let _ = dest.send(ChannelMessage::EndOfStream);
        }
    }
}

impl<T: Clone> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            destinations: self.destinations.clone(),
            watchdog_handle: self.watchdog_handle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_broadcast_reaches_every_destination() {
        let (tx1, rx1) = bounded::<ChannelMessage<u32>>(4);
        let (tx2, rx2) = bounded::<ChannelMessage<u32>>(4);
        let sender = Sender::new(vec![tx1, tx2]);

        sender.send(7).unwrap();
        sender.close();

        for rx in [rx1, rx2] {
            assert!(matches!(rx.recv().unwrap(), ChannelMessage::Item(7)));
            assert!(matches!(rx.recv().unwrap(), ChannelMessage::EndOfStream));
        }
    }

    #[test]
    fn test_send_survives_one_hangup() {
        let (tx1, rx1) = bounded::<ChannelMessage<u32>>(4);
        let (tx2, rx2) = bounded::<ChannelMessage<u32>>(4);
        let sender = Sender::new(vec![tx1, tx2]);

        drop(rx1);
        sender.send(1).unwrap();
        assert!(matches!(rx2.recv().unwrap(), ChannelMessage::Item(1)));

        // fails only once every consumer is gone
        drop(rx2);
        assert!(sender.send(2).is_err());
    }

    #[test]
    fn test_split_senders_are_independent() {
        let (tx1, rx1) = bounded::<ChannelMessage<u32>>(4);
        let (tx2, _rx2) = bounded::<ChannelMessage<u32>>(4);
        let sender = Sender::new(vec![tx1, tx2]);

        let splits = sender.split_senders();
        assert_eq!(splits.len(), 2);

        splits[0].send(9).unwrap();
        assert!(matches!(rx1.try_recv().unwrap(), ChannelMessage::Item(9)));
    }
}
