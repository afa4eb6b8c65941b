//! Dynamic channel construction by item type
//!
//! The pipeline builder works on type-erased nodes, so it cannot name the
//! item type of a connection at compile time. Each registered type
//! contributes a pair of closures: one that opens a bounded channel for
//! it, one that bundles the accumulated sender halves into a broadcast
//! [`Sender`]. `Edge` and `SpiEvent` are pre-registered; pipelines moving
//! anything else call [`register_type`] first.

use super::sender::{ChannelMessage, Sender};
use crossbeam_channel::{bounded, Sender as CrossbeamSender};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type AnyBox = Box<dyn Any + Send>;

struct TypeEntry {
    open: Box<dyn Fn(usize) -> (AnyBox, AnyBox) + Send + Sync>,
    bundle: Box<dyn Fn(Vec<AnyBox>) -> Result<AnyBox, String> + Send + Sync>,
}

pub(crate) struct TypeRegistry {
    entries: HashMap<TypeId, TypeEntry>,
}

impl TypeRegistry {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn register<T: 'static + Send + Clone>(&mut self) {
        self.entries.insert(
            TypeId::of::<T>(),
            TypeEntry {
                open: Box::new(|capacity| {
                    let (tx, rx) = bounded::<ChannelMessage<T>>(capacity);
                    (Box::new(tx) as AnyBox, Box::new(rx) as AnyBox)
                }),
                bundle: Box::new(|halves| {
                    let mut senders = Vec::with_capacity(halves.len());
                    for half in halves {
                        let tx = half
                            .downcast::<CrossbeamSender<ChannelMessage<T>>>()
                            .map_err(|_| "sender half has the wrong item type".to_string())?;
                        senders.push(*tx);
                    }
                    if senders.is_empty() {
                        return Err("no sender halves to bundle".to_string());
                    }
                    Ok(Box::new(Sender::new(senders)) as AnyBox)
                }),
            },
        );
    }

    /// Open a bounded channel for `type_id`, type-erased. None if the type
    /// was never registered.
    pub(crate) fn open_channel(
        &self,
        type_id: TypeId,
        capacity: usize,
    ) -> Option<(AnyBox, AnyBox)> {
        self.entries.get(&type_id).map(|entry| (entry.open)(capacity))
    }

    /// Bundle sender halves collected for one output port into a broadcast
    /// sender.
    pub(crate) fn bundle_senders(
        &self,
        type_id: TypeId,
        halves: Vec<AnyBox>,
    ) -> Result<AnyBox, String> {
        let entry = self
            .entries
            .get(&type_id)
            .ok_or_else(|| format!("type {:?} is not registered", type_id))?;
        (entry.bundle)(halves)
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref TYPE_REGISTRY: Arc<Mutex<TypeRegistry>> = {
        let mut registry = TypeRegistry::new();
        // The two item types every capture pipeline moves
        registry.register::<crate::runtime::Edge>();
        registry.register::<crate::nodes::decoders::SpiEvent>();
        Arc::new(Mutex::new(registry))
    };
}

/// Make `T` usable as a connection item type. Must run before building a
/// pipeline whose connections carry `T`.
pub fn register_type<T: 'static + Send + Clone>() {
    TYPE_REGISTRY.lock().unwrap().register::<T>();
}
