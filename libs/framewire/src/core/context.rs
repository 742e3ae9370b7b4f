// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! ProcessingContext - the serialized worker every graph operation runs on.
//!
//! One dedicated OS thread drains a job queue; graph mutation, buffer
//! broadcast, and whatever work nodes do while handling a frame all execute
//! there, one job at a time. That single-writer discipline is what lets the
//! graph go lock-free: a mutation and a broadcast can never observe each
//! other half-done.
//!
//! Two submission modes exist. [`run_async`](ProcessingContext::run_async)
//! enqueues and returns: the mode for every public mutation API and for
//! producers pushing frames from their own threads.
//! [`run_sync`](ProcessingContext::run_sync) waits for the job's result;
//! called from the worker thread itself it executes inline against the
//! active graph instead of enqueuing, which would deadlock waiting on
//! ourselves.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::buffer::{BufferDescriptor, FrameBuffer};
use crate::core::config::EngineConfig;
use crate::core::error::{PipelineError, Result};
use crate::core::graph::{Graph, NodeHandle};
use crate::core::node::PipelineNode;
use crate::core::topology::GraphTopology;

type Job = Box<dyn FnOnce(&Graph) + Send>;

thread_local! {
    /// Graph owned by the worker thread currently running on this thread,
    /// if any. Lets a synchronous submission from worker-resident code run
    /// inline instead of deadlocking on its own queue.
    static ACTIVE_GRAPH: RefCell<Option<Rc<Graph>>> = const { RefCell::new(None) };
}

struct ContextShared {
    tx: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
}

impl ContextShared {
    fn shutdown(&self) {
        // Dropping the sender closes the queue; the worker drains what is
        // already enqueued and exits.
        let sender = self.tx.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if std::thread::current().id() == self.worker_thread {
                // Shutdown issued from a worker-resident job; the thread
                // cannot join itself and will exit once the queue drains.
                tracing::debug!("shutdown requested from the worker; skipping join");
                return;
            }
            match handle.join() {
                Ok(()) => tracing::debug!("worker context stopped"),
                Err(_) => tracing::error!("worker thread panicked before shutdown"),
            }
        }
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the engine's single serialized execution context.
///
/// Construct once, clone freely (clones share the same worker), keep alive
/// for the process's working lifetime, then [`shutdown`](Self::shutdown).
/// The context owns no graph data itself; it only guarantees *where*
/// graph and buffer operations run.
#[derive(Clone)]
pub struct ProcessingContext {
    shared: Arc<ContextShared>,
}

impl ProcessingContext {
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread_name = config.worker_thread_name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let _ = ready_tx.send(std::thread::current().id());
                worker_main(config, rx);
            })?;

        let worker_thread = ready_rx
            .recv()
            .map_err(|_| PipelineError::Runtime("worker thread died during startup".into()))?;

        tracing::debug!("worker context started");
        Ok(Self {
            shared: Arc::new(ContextShared {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
                worker_thread,
            }),
        })
    }

    /// Asynchronous submission: enqueue `f` and return without waiting.
    pub fn run_async(&self, f: impl FnOnce(&Graph) + Send + 'static) -> Result<()> {
        let guard = self.shared.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(PipelineError::ContextShutdown);
        };
        tx.send(Box::new(f))
            .map_err(|_| PipelineError::ContextShutdown)
    }

    /// Synchronous submission: run `f` on the worker and return its result.
    ///
    /// From outside the worker this blocks until the job has executed in
    /// queue order. From code already running on the worker thread it is
    /// detected (thread identity against the worker's) and executed inline,
    /// re-entrantly, since enqueuing would deadlock waiting on ourselves.
    pub fn run_sync<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Graph) -> R + Send + 'static,
    {
        if std::thread::current().id() == self.shared.worker_thread {
            let graph = ACTIVE_GRAPH.with(|g| g.borrow().clone());
            return match graph {
                Some(graph) => Ok(f(&graph)),
                None => Err(PipelineError::ContextShutdown),
            };
        }

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        self.run_async(move |graph| {
            let _ = result_tx.send(f(graph));
        })?;
        result_rx
            .recv()
            .map_err(|_| PipelineError::ContextShutdown)
    }

    /// Register a node, returning its handle once the worker has it.
    pub fn add_node(&self, node: impl PipelineNode) -> Result<NodeHandle> {
        self.run_sync(move |graph| graph.add_node(node))
    }

    /// Deregister a node. Remaining edges referencing it prune lazily.
    pub fn remove_node(&self, handle: NodeHandle) -> Result<()> {
        self.run_async(move |graph| {
            graph.remove_node(handle);
        })
    }

    /// Enqueue edge creation; see [`Graph::connect`] for semantics.
    pub fn connect(
        &self,
        source: NodeHandle,
        consumer: NodeHandle,
        slot: Option<u32>,
    ) -> Result<()> {
        self.run_async(move |graph| graph.connect(source, consumer, slot))
    }

    pub fn disconnect_all(&self, source: NodeHandle) -> Result<()> {
        self.run_async(move |graph| graph.disconnect_all(source))
    }

    pub fn disconnect(&self, source: NodeHandle, consumer: NodeHandle) -> Result<()> {
        self.run_async(move |graph| graph.disconnect(source, consumer))
    }

    pub fn disconnect_all_sources(&self, consumer: NodeHandle) -> Result<()> {
        self.run_async(move |graph| graph.disconnect_all_sources(consumer))
    }

    /// Chain-building helper: wire `upstream -> downstream` on the lowest
    /// free slot and hand back the downstream node, so linear chains build
    /// by repeated application:
    ///
    /// ```ignore
    /// let relay = ctx.chain(camera, relay)?;
    /// let sink = ctx.chain(relay, sink)?;
    /// ```
    pub fn chain(&self, upstream: NodeHandle, downstream: NodeHandle) -> Result<NodeHandle> {
        self.connect(upstream, downstream, None)?;
        Ok(downstream)
    }

    /// Acquire a pooled buffer for `descriptor`, claim count 1 held by the
    /// caller. Runs on the worker: the pool is worker-domain state.
    pub fn acquire_buffer(&self, descriptor: &BufferDescriptor) -> Result<FrameBuffer> {
        let descriptor = *descriptor;
        self.run_sync(move |graph| graph.pool().acquire(&descriptor))?
    }

    /// Push a produced frame into `source` and broadcast it downstream.
    /// Consumes the caller's claim. Safe to call from any thread, capture
    /// callbacks included; the frame rides the queue to the worker.
    pub fn submit_frame(&self, source: NodeHandle, frame: FrameBuffer) -> Result<()> {
        let result = self.run_async(move |graph| graph.submit_frame(source, frame));
        if result.is_err() {
            tracing::warn!("frame submitted after shutdown; dropped");
        }
        result
    }

    /// Snapshot of the live graph for inspection or export.
    pub fn topology(&self) -> Result<GraphTopology> {
        self.run_sync(|graph| graph.topology())
    }

    /// Stop the worker after draining already-enqueued jobs. Idempotent;
    /// later submissions fail with [`PipelineError::ContextShutdown`].
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

fn worker_main(config: EngineConfig, rx: crossbeam_channel::Receiver<Job>) {
    let graph = Rc::new(Graph::new(&config));
    ACTIVE_GRAPH.with(|g| *g.borrow_mut() = Some(Rc::clone(&graph)));

    for job in rx {
        job(&graph);
    }

    ACTIVE_GRAPH.with(|g| *g.borrow_mut() = None);
    // Nodes drop here, returning any claims they hold before the pool goes
    // away with them.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::ExternalSource;

    #[test]
    fn test_run_sync_round_trips_a_value() {
        let ctx = ProcessingContext::new().unwrap();
        let nodes = ctx.run_sync(|graph| graph.node_count()).unwrap();
        assert_eq!(nodes, 0);
        ctx.shutdown();
    }

    #[test]
    fn test_run_sync_from_worker_executes_inline() {
        let ctx = ProcessingContext::new().unwrap();
        let inner_ctx = ctx.clone();
        // A nested synchronous submission from worker-resident code must
        // not deadlock: the re-entrancy check runs it inline.
        let value = ctx
            .run_sync(move |_graph| inner_ctx.run_sync(|graph| graph.node_count() + 41).unwrap())
            .unwrap();
        assert_eq!(value, 41);
        ctx.shutdown();
    }

    #[test]
    fn test_jobs_execute_in_submission_order() {
        let ctx = ProcessingContext::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            ctx.run_async(move |_| log.lock().push(i)).unwrap();
        }
        ctx.run_sync(|_| ()).unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
        ctx.shutdown();
    }

    #[test]
    fn test_mutations_enqueued_before_broadcast_apply_first() {
        let ctx = ProcessingContext::new().unwrap();
        let source = ctx.add_node(ExternalSource::new()).unwrap();
        // remove_node is asynchronous but ordered before the submit that
        // follows it, so the frame finds the node already gone.
        ctx.remove_node(source).unwrap();
        let desc = BufferDescriptor::new(8, 8);
        let buffer = ctx.acquire_buffer(&desc).unwrap();
        ctx.submit_frame(source, buffer).unwrap();

        let idle = ctx
            .run_sync(move |graph| graph.pool().idle_count(&desc))
            .unwrap();
        assert_eq!(idle, 1);
        ctx.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_submissions() {
        let ctx = ProcessingContext::new().unwrap();
        ctx.shutdown();
        ctx.shutdown();

        let err = ctx.run_async(|_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::ContextShutdown));
        let err = ctx.run_sync(|_| ()).unwrap_err();
        assert!(matches!(err, PipelineError::ContextShutdown));
    }

    #[test]
    fn test_clones_share_one_worker() {
        let ctx = ProcessingContext::new().unwrap();
        let clone = ctx.clone();
        let source = ctx.add_node(ExternalSource::new()).unwrap();
        assert!(clone.run_sync(move |g| g.contains(source)).unwrap());
        clone.shutdown();
        assert!(ctx.run_async(|_| {}).is_err());
    }
}
