//! Pipeline builder: declare nodes and connections, then build a running
//! scheduler
//!
//! Connections are validated eagerly against the port schemas the nodes
//! declare (unknown names, item-type mismatches, double producers on one
//! input), but channels are only created in `build()`, once the final
//! fan-out of every output port is known.

use super::errors::ConnectionError;
use super::node::{InputPort, OutputPort, ProcessNode};
use super::ports::PortSchema;
use super::scheduler::Scheduler;
use super::type_registry::TYPE_REGISTRY;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use tracing::{debug, info};

const DEFAULT_CAPACITY: usize = 1000;

struct NodeSlot {
    name: String,
    node: Box<dyn ProcessNode>,
    inputs: Vec<PortSchema>,
    outputs: Vec<PortSchema>,
}

/// A validated connection, waiting for `build()` to open its channel.
/// Endpoints are (slot index, port index).
struct Link {
    source: (usize, usize),
    sink: (usize, usize),
    item_type: TypeId,
    capacity: usize,
}

pub struct Pipeline {
    slots: Vec<NodeSlot>,
    links: Vec<Link>,
    capacity: usize,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            links: Vec::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Channel capacity used by `connect`; sized per pipeline since a
    /// capture replay wants far deeper buffers than a live trickle.
    pub fn with_default_buffer_size(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Register a node under a pipeline-unique name
    pub fn add_process<N: ProcessNode + 'static>(
        &mut self,
        name: impl Into<String>,
        node: N,
    ) -> Result<(), String> {
        let name = name.into();
        if self.slots.iter().any(|slot| slot.name == name) {
            return Err(format!("a node named '{}' already exists", name));
        }
        self.slots.push(NodeSlot {
            name,
            inputs: node.input_schema(),
            outputs: node.output_schema(),
            node: Box::new(node),
        });
        Ok(())
    }

    fn slot_index(&self, name: &str) -> Result<usize, Box<ConnectionError>> {
        self.slots
            .iter()
            .position(|slot| slot.name == name)
            .ok_or_else(|| Box::new(ConnectionError::NodeNotFound(name.to_string())))
    }

    fn find_port<'a>(
        schemas: &'a [PortSchema],
        node: &str,
        port: &str,
    ) -> Result<&'a PortSchema, Box<ConnectionError>> {
        schemas.iter().find(|s| s.name == port).ok_or_else(|| {
            Box::new(ConnectionError::PortNotFound {
                node: node.to_string(),
                port: port.to_string(),
            })
        })
    }

    /// Connect an output port to an input port, by node and port names
    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<(), Box<ConnectionError>> {
        self.connect_with_buffer(from_node, from_port, to_node, to_port, self.capacity)
    }

    /// `connect` with an explicit channel capacity for this link
    pub fn connect_with_buffer(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        capacity: usize,
    ) -> Result<(), Box<ConnectionError>> {
        let source_slot = self.slot_index(from_node)?;
        let sink_slot = self.slot_index(to_node)?;

        let source = Self::find_port(&self.slots[source_slot].outputs, from_node, from_port)?;
        let sink = Self::find_port(&self.slots[sink_slot].inputs, to_node, to_port)?;

        if source.type_id != sink.type_id {
            return Err(Box::new(ConnectionError::TypeMismatch {
                from_node: from_node.to_string(),
                from_port: from_port.to_string(),
                from_type: source.type_id,
                to_node: to_node.to_string(),
                to_port: to_port.to_string(),
                to_type: sink.type_id,
            }));
        }

        // Outputs may fan out; an input accepts exactly one producer
        let sink_key = (sink_slot, sink.index);
        if self.links.iter().any(|link| link.sink == sink_key) {
            return Err(Box::new(ConnectionError::InputTaken {
                node: to_node.to_string(),
                port: to_port.to_string(),
            }));
        }

        self.links.push(Link {
            source: (source_slot, source.index),
            sink: sink_key,
            item_type: source.type_id,
            capacity,
        });
        Ok(())
    }

    /// Open every channel, wire up the ports and start all nodes.
    /// Consumes the pipeline; the returned scheduler is already running.
    pub fn build(self) -> Result<Scheduler, String> {
        info!(
            "Building pipeline: {} nodes, {} connections",
            self.slots.len(),
            self.links.len()
        );

        let mut scheduler = Scheduler::new();
        let watchdog = scheduler.watchdog().clone();
        let registry = TYPE_REGISTRY.lock().unwrap();

        // Open one channel per link. Receiver halves map 1:1 to input
        // ports; sender halves pile up per output port for fan-out.
        let mut rx_halves: HashMap<(usize, usize), Box<dyn Any + Send>> = HashMap::new();
        let mut tx_halves: HashMap<(usize, usize), (TypeId, Vec<Box<dyn Any + Send>>)> =
            HashMap::new();

        for link in &self.links {
            let (tx, rx) = registry.open_channel(link.item_type, link.capacity).ok_or_else(|| {
                format!(
                    "item type {:?} is not registered; call register_type::<T>() first",
                    link.item_type
                )
            })?;
            rx_halves.insert(link.sink, rx);
            tx_halves
                .entry(link.source)
                .or_insert_with(|| (link.item_type, Vec::new()))
                .1
                .push(tx);
        }

        for (slot_idx, slot) in self.slots.into_iter().enumerate() {
            let NodeSlot {
                name,
                node,
                inputs,
                outputs,
            } = slot;
            debug!("Wiring node '{}'", name);

            // Ports a node declared but nothing connected to stay valid,
            // as inert placeholders: get() on them returns None
            let input_ports: Vec<InputPort> = (0..node.num_inputs())
                .map(|i| {
                    let channel = rx_halves
                        .remove(&(slot_idx, i))
                        .unwrap_or_else(|| Box::new(()));
                    let port_name = port_label(&inputs, i, "in");
                    InputPort::wired(channel, watchdog.register_port(&name, "recv", &port_name))
                })
                .collect();

            let mut output_ports = Vec::with_capacity(node.num_outputs());
            for i in 0..node.num_outputs() {
                let channel: Box<dyn Any + Send> = match tx_halves.remove(&(slot_idx, i)) {
                    Some((item_type, halves)) => registry.bundle_senders(item_type, halves)?,
                    None => Box::new(()),
                };
                let port_name = port_label(&outputs, i, "out");
                output_ports.push(OutputPort::wired(
                    channel,
                    watchdog.register_port(&name, "send", &port_name),
                ));
            }

            scheduler.start_process(node, input_ports, output_ports);
        }

        drop(registry);
        info!("Pipeline running on {} threads", scheduler.num_threads());
        Ok(scheduler)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn port_label(schemas: &[PortSchema], index: usize, fallback: &str) -> String {
    schemas
        .get(index)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("{}{}", fallback, index))
}
