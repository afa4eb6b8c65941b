//! Type-erased ports handed to nodes by the scheduler
//!
//! A node's `work()` sees plain [`InputPort`]/[`OutputPort`] slices and
//! downcasts each to its item type with `get()`. The erasure lets the
//! pipeline wire arbitrary nodes together while `get()` returning `None`
//! catches a node reading a port with the wrong type.

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;

use crossbeam_channel::Receiver as CrossbeamReceiver;

use super::receiver::Receiver;
use super::sender::{ChannelMessage, Sender};
use super::watchdog::{Watchdog, WatchdogHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Name, item type and position of one port, as declared by a node's
/// `input_schema()`/`output_schema()`. The pipeline type-checks
/// connections against these.
#[derive(Debug, Clone)]
pub struct PortSchema {
    pub name: String,
    pub type_id: TypeId,
    pub index: usize,
    pub direction: PortDirection,
}

impl PortSchema {
    pub fn new<T: 'static>(name: impl Into<String>, index: usize, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            index,
            direction,
        }
    }
}

/// Receiving end of one connection, item type erased.
///
/// Owns the end-of-stream flag: [`Receiver`] wrappers built by `get()` are
/// transient, so the sticky shutdown state has to live here to survive
/// between `work()` calls.
pub struct InputPort {
    channel: Box<dyn Any + Send>,
    watchdog_handle: WatchdogHandle,
    eos: AtomicBool,
}

impl InputPort {
    /// Assemble a port from a type-erased receiver half. Pipeline-internal;
    /// unconnected inputs get a unit box that no `get()` will downcast.
    pub(crate) fn wired(channel: Box<dyn Any + Send>, watchdog_handle: WatchdogHandle) -> Self {
        Self {
            channel,
            watchdog_handle,
            eos: AtomicBool::new(false),
        }
    }

    /// Wrap a raw channel receiver, for driving a node directly in tests
    pub fn new_with_watchdog<T: Send + 'static>(
        receiver: CrossbeamReceiver<ChannelMessage<T>>,
        watchdog: &Watchdog,
        node_name: &str,
        port_name: &str,
    ) -> Self {
        Self::wired(
            Box::new(receiver),
            watchdog.register_port(node_name, "recv", port_name),
        )
    }

    /// Borrow the port as a typed [`Receiver`]. The caller supplies the
    /// putback buffer persisting between `work()` calls. None when the
    /// port does not carry `T` (or is not connected).
    pub fn get<'a, T: Send + 'static>(
        &'a self,
        buffer: &'a mut VecDeque<T>,
    ) -> Option<Receiver<'a, T>> {
        let receiver = self
            .channel
            .downcast_ref::<CrossbeamReceiver<ChannelMessage<T>>>()?;
        Some(Receiver::new(
            receiver,
            buffer,
            self.watchdog_handle.clone(),
            &self.eos,
        ))
    }
}

/// Sending end of one or more connections, item type erased
pub struct OutputPort {
    channel: Box<dyn Any + Send>,
    watchdog_handle: WatchdogHandle,
}

impl OutputPort {
    /// Assemble a port from a type-erased broadcast sender.
    /// Pipeline-internal; see [`InputPort::wired`].
    pub(crate) fn wired(channel: Box<dyn Any + Send>, watchdog_handle: WatchdogHandle) -> Self {
        Self {
            channel,
            watchdog_handle,
        }
    }

    /// Wrap a broadcast sender, for driving a node directly in tests
    pub fn new_with_watchdog<T: Send + Clone + 'static>(
        sender: Sender<T>,
        watchdog: &Watchdog,
        node_name: &str,
        port_name: &str,
    ) -> Self {
        Self::wired(
            Box::new(sender),
            watchdog.register_port(node_name, "send", port_name),
        )
    }

    /// A typed, watchdog-guarded clone of the underlying sender. None when
    /// the port does not carry `T` (or is not connected).
    pub fn get<T: Send + Clone + 'static>(&self) -> Option<Sender<T>> {
        let sender = self.channel.downcast_ref::<Sender<T>>()?;
        Some(sender.with_watchdog(self.watchdog_handle.clone()))
    }

    /// One single-destination sender per consumer, for nodes that drive
    /// each destination from its own thread. None when the port does not
    /// carry `T` or nothing is connected.
    pub fn split_senders<T: Send + Clone + 'static>(&self) -> Option<Vec<Sender<T>>> {
        let sender = self.channel.downcast_ref::<Sender<T>>()?;
        let splits = sender.split_senders();
        (!splits.is_empty()).then_some(splits)
    }
}

impl fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("OutputPort")
    }
}
