//! Thread-per-node execution of a wired graph
//!
//! Every node gets a dedicated OS thread. Driven nodes have `work()`
//! called in a loop until they report `Shutdown` or the stop flag is
//! raised; self-threading nodes are launched once and then only watched
//! via `should_stop()`. Finished threads announce themselves on a
//! completion channel so `wait()` can join them as they end instead of
//! joining in spawn order.

use super::errors::WorkError;
use super::node::ProcessNode;
use super::ports::{InputPort, OutputPort};
use super::watchdog::Watchdog;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Poll interval while babysitting a self-threading node
const SELF_THREADING_POLL: std::time::Duration = std::time::Duration::from_millis(100);

pub struct Scheduler {
    workers: Vec<(String, JoinHandle<()>)>,
    stop_flag: Arc<AtomicBool>,
    done_tx: mpsc::Sender<String>,
    done_rx: Option<mpsc::Receiver<String>>,
    watchdog: Watchdog,
    sweeper: JoinHandle<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        let watchdog = Watchdog::new();
        let sweeper = watchdog.start_monitoring_thread();
        Self {
            workers: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            done_tx,
            done_rx: Some(done_rx),
            watchdog,
            sweeper,
        }
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Spawn one worker thread running `node` over the given ports
    pub fn start_process(
        &mut self,
        node: Box<dyn ProcessNode>,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
    ) {
        let name = node.name().to_string();
        debug!("Spawning worker for node '{}'", name);

        let stop_flag = Arc::clone(&self.stop_flag);
        let done_tx = self.done_tx.clone();
        let worker_name = name.clone();
        let handle = thread::spawn(move || {
            run_node(node, &inputs, &outputs, &stop_flag, &worker_name);
            // Ports must close before the completion notice goes out, so
            // downstream nodes see end-of-stream no later than the join
            drop(outputs);
            drop(inputs);
            let _ = done_tx.send(worker_name);
        });

        self.workers.push((name, handle));
    }

    /// Raise the stop flag; workers notice at their next work boundary
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Block until every worker thread has finished, joining each as its
    /// completion notice arrives.
    pub fn wait(mut self) {
        let done_rx = self.done_rx.take().expect("wait() called twice");
        // Close our copy so the loop below ends when the last worker's
        // sender drops
        drop(self.done_tx);

        let total = self.workers.len();
        let mut pending: HashMap<String, JoinHandle<()>> = self.workers.drain(..).collect();
        info!("Waiting for {} workers", total);

        while let Ok(name) = done_rx.recv() {
            if let Some(handle) = pending.remove(&name) {
                if let Err(panic) = handle.join() {
                    error!("[{}] Worker panicked: {:?}", name, panic);
                } else {
                    debug!("[{}] Worker joined ({} left)", name, pending.len());
                }
            }
            if pending.is_empty() {
                break;
            }
        }

        info!("All {} workers finished", total);
        self.watchdog.stop();
        let _ = self.sweeper.join();
    }

    /// Number of spawned workers
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of one worker thread.
fn run_node(
    mut node: Box<dyn ProcessNode>,
    inputs: &[InputPort],
    outputs: &[OutputPort],
    stop_flag: &AtomicBool,
    name: &str,
) {
    if node.is_self_threading() {
        if let Err(e) = node.work(inputs, outputs) {
            error!("[{}] Could not launch: {}", name, e);
            return;
        }
        while !stop_flag.load(Ordering::Relaxed) && !node.should_stop() {
            thread::sleep(SELF_THREADING_POLL);
        }
        info!("[{}] Done", name);
        return;
    }

    let mut produced = 0usize;
    while !stop_flag.load(Ordering::Relaxed) && !node.should_stop() {
        match node.work(inputs, outputs) {
            Ok(n) => produced += n,
            Err(WorkError::Shutdown) => {
                debug!("[{}] Input exhausted", name);
                break;
            }
            Err(e) => {
                error!("[{}] Work failed: {}", name, e);
                break;
            }
        }
    }
    info!("[{}] Done, {} items produced", name, produced);
}
