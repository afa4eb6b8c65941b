//! Runtime error types

use crossbeam_channel::SendError;
use std::any::TypeId;

/// Failures while wiring nodes together in a pipeline
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no node named '{0}' in the pipeline")]
    NodeNotFound(String),

    #[error("node '{node}' has no port named '{port}'")]
    PortNotFound { node: String, port: String },

    #[error(
        "cannot connect {from_node}.{from_port} ({from_type:?}) to {to_node}.{to_port} \
         ({to_type:?}): item types differ"
    )]
    TypeMismatch {
        from_node: String,
        from_port: String,
        from_type: TypeId,
        to_node: String,
        to_port: String,
        to_type: TypeId,
    },

    #[error("input port '{port}' on node '{node}' already has a producer connected")]
    InputTaken { node: String, port: String },
}

/// Failures inside a node's `work()` call.
///
/// `Shutdown` doubles as the normal end-of-data signal: a node returns it
/// when its upstream closed, and the scheduler winds the node down without
/// treating it as a fault.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("downstream channel closed: {0}")]
    SendError(String),

    #[error("{0}")]
    NodeError(String),

    #[error("shutdown")]
    Shutdown,
}

impl<T> From<SendError<T>> for WorkError {
    fn from(e: SendError<T>) -> Self {
        WorkError::SendError(e.to_string())
    }
}

pub type WorkResult<T = ()> = Result<T, WorkError>;
