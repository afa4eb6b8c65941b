//! The processing node abstraction
//!
//! Everything that runs in a pipeline (capture sources, decoders, sinks)
//! implements [`ProcessNode`]. The scheduler owns the calling convention;
//! nodes only declare their ports and process data when asked.

pub use super::errors::{WorkError, WorkResult};
pub use super::ports::{InputPort, OutputPort};
pub use super::receiver::Receiver;
pub use super::sender::Sender;

/// One vertex of a streaming graph.
///
/// Sources declare zero inputs, sinks zero outputs; anything else is a
/// transformer. Ports are identified by the schemas a node returns, and
/// the scheduler passes the wired-up ports back into `work()` in schema
/// order.
pub trait ProcessNode: Send {
    /// Name used in logs and thread names
    fn name(&self) -> &str;

    /// Polled by the scheduler between `work()` calls; return true once
    /// the node has nothing further to do.
    fn should_stop(&self) -> bool {
        false
    }

    /// Nodes that spawn and manage their own worker threads return true.
    /// The scheduler then calls `work()` a single time to launch them and
    /// afterwards only watches `should_stop()`. The default is the
    /// driven model: `work()` called in a loop, one batch per call.
    fn is_self_threading(&self) -> bool {
        false
    }

    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    /// Input port declarations (name, item type, position)
    fn input_schema(&self) -> Vec<crate::runtime::ports::PortSchema> {
        Vec::new()
    }

    /// Output port declarations (name, item type, position)
    fn output_schema(&self) -> Vec<crate::runtime::ports::PortSchema> {
        Vec::new()
    }

    /// Process one batch: read inputs, write outputs, return how many
    /// items were produced. `Err(WorkError::Shutdown)` is the normal way
    /// to report that upstream data ran out.
    fn work(&mut self, inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize>;
}
