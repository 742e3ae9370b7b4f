// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Graph - node arena, edge mutation, and the broadcast kernel.
//!
//! Nodes live in a generational arena and are addressed by [`NodeHandle`].
//! Handles are non-owning: removing a node invalidates its handle, and any
//! target-list entries still pointing at it are pruned lazily on the next
//! broadcast. All methods here execute on the worker context; nothing in
//! this module takes a lock on the graph as a whole.
//!
//! Exactly four operations mutate edges: [`connect`](Graph::connect),
//! [`disconnect_all`](Graph::disconnect_all),
//! [`disconnect`](Graph::disconnect) and
//! [`disconnect_all_sources`](Graph::disconnect_all_sources). Everything
//! else observes.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::core::buffer::FrameBuffer;
use crate::core::config::EngineConfig;
use crate::core::node::{PipelineNode, TargetList};
use crate::core::pool::BufferPool;
use crate::core::topology::GraphTopology;

/// Stable, non-owning reference to a node in the graph.
///
/// A handle pairs an arena index with the generation the slot had when the
/// node was inserted, so a handle left over from a removed node can never
/// alias a later occupant of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    pub(crate) fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl std::fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

pub(crate) type NodeCell = Rc<RefCell<Box<dyn PipelineNode>>>;

struct ArenaSlot {
    generation: u32,
    node: Option<NodeCell>,
}

#[derive(Default)]
struct NodeArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
}

impl NodeArena {
    fn insert(&mut self, node: Box<dyn PipelineNode>) -> NodeHandle {
        let cell = Rc::new(RefCell::new(node));
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(cell);
                NodeHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(ArenaSlot {
                    generation: 0,
                    node: Some(cell),
                });
                NodeHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn remove(&mut self, handle: NodeHandle) -> Option<NodeCell> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let cell = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(cell)
    }

    fn get(&self, handle: NodeHandle) -> Option<NodeCell> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.clone()
    }

    fn contains(&self, handle: NodeHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.node.is_some())
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    fn iter_live(&self) -> Vec<(NodeHandle, NodeCell)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.node.as_ref().map(|cell| {
                    (
                        NodeHandle {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        Rc::clone(cell),
                    )
                })
            })
            .collect()
    }
}

/// The node graph plus the buffer pool that serves it.
///
/// Confined to the worker thread; callers reach it through
/// [`ProcessingContext`](crate::core::context::ProcessingContext)
/// submissions or from inside node callbacks, which receive `&Graph`.
pub struct Graph {
    arena: RefCell<NodeArena>,
    pool: BufferPool,
}

impl Graph {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            arena: RefCell::new(NodeArena::default()),
            pool: BufferPool::new(config.pool.clone()),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Register a node and return its handle.
    pub fn add_node(&self, node: impl PipelineNode) -> NodeHandle {
        self.add_boxed_node(Box::new(node))
    }

    pub fn add_boxed_node(&self, node: Box<dyn PipelineNode>) -> NodeHandle {
        let type_name = node.type_name();
        let handle = self.arena.borrow_mut().insert(node);
        tracing::debug!(node = %handle, kind = type_name, "registered node");
        handle
    }

    /// Deregister a node. Edges referencing it are pruned lazily; its own
    /// target list and source slots die with it.
    pub fn remove_node(&self, handle: NodeHandle) -> bool {
        let removed = self.arena.borrow_mut().remove(handle);
        match removed {
            Some(_) => {
                tracing::debug!(node = %handle, "removed node");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.arena.borrow().contains(handle)
    }

    pub fn node_count(&self) -> usize {
        self.arena.borrow().len()
    }

    /// Run `f` against the concrete node behind `handle`.
    ///
    /// Returns `None` if the handle is dead, the node is mid-delivery, or
    /// it is not an `N`.
    pub fn with_node_mut<N: PipelineNode, R>(
        &self,
        handle: NodeHandle,
        f: impl FnOnce(&mut N) -> R,
    ) -> Option<R> {
        let cell = self.get(handle)?;
        let mut node = cell.try_borrow_mut().ok()?;
        let node = node.as_any_mut().downcast_mut::<N>()?;
        Some(f(node))
    }

    /// Create the edge `source -> consumer`.
    ///
    /// With an explicit `slot`, the consumer's slot is bound directly,
    /// replacing any occupant; the replaced edge's source half is left for
    /// the caller to clean up. A slot at or beyond the consumer's
    /// `maximum_inputs` is an unrecoverable programming error and panics.
    ///
    /// Without a slot, the lowest free slot is used; if none is free the
    /// operation is a no-op reported as a warning and the graph is
    /// untouched.
    ///
    /// After binding, the source's last output (if it has one) is replayed
    /// to the new edge only, so a consumer attaching after static content
    /// was produced still receives it.
    pub fn connect(&self, source: NodeHandle, consumer: NodeHandle, slot: Option<u32>) {
        if source == consumer {
            tracing::warn!(node = %source, "cannot connect a node to itself; ignored");
            return;
        }
        let (Some(src_cell), Some(dst_cell)) = (self.get(source), self.get(consumer)) else {
            tracing::warn!(
                source = %source,
                consumer = %consumer,
                "connect references a node that is not registered; ignored"
            );
            return;
        };
        let (Ok(mut src), Ok(mut dst)) = (src_cell.try_borrow_mut(), dst_cell.try_borrow_mut())
        else {
            tracing::warn!(
                source = %source,
                consumer = %consumer,
                "connect raced an in-flight delivery; ignored"
            );
            return;
        };

        let consumer_kind = dst.type_name();
        let Some(src_role) = src.as_source() else {
            tracing::warn!(source = %source, "node emits no frames; connect ignored");
            return;
        };
        let Some(dst_role) = dst.as_consumer() else {
            tracing::warn!(consumer = %consumer, "node accepts no inputs; connect ignored");
            return;
        };

        let maximum_inputs = dst_role.maximum_inputs();
        let bound_slot = match slot {
            Some(requested) => {
                if requested >= maximum_inputs {
                    panic!(
                        "input slot {requested} out of range for {consumer_kind} \
                         (maximum_inputs = {maximum_inputs})"
                    );
                }
                dst_role.source_slots_mut().bind(requested, source);
                requested
            }
            None => {
                match dst_role
                    .source_slots_mut()
                    .bind_first_free(source, maximum_inputs)
                {
                    Some(assigned) => assigned,
                    None => {
                        tracing::warn!(
                            consumer = %consumer,
                            kind = consumer_kind,
                            maximum_inputs,
                            "no free input slot; connect ignored"
                        );
                        return;
                    }
                }
            }
        };

        src_role.targets_mut().append(consumer, bound_slot);
        let replay = src_role.replay_last_output();
        drop(src);
        drop(dst);

        tracing::debug!(
            source = %source,
            consumer = %consumer,
            slot = bound_slot,
            "connected"
        );

        if let Some(frame) = replay {
            self.deliver(consumer, frame, bound_slot);
        }
    }

    /// Tear down every edge leaving `source`: each target's slot is
    /// cleared, then the target list is emptied.
    pub fn disconnect_all(&self, source: NodeHandle) {
        let Some(src_cell) = self.get(source) else {
            return;
        };
        let entries = {
            let Ok(mut src) = src_cell.try_borrow_mut() else {
                tracing::warn!(source = %source, "disconnect_all raced a delivery; ignored");
                return;
            };
            let Some(src_role) = src.as_source() else {
                return;
            };
            std::mem::take(src_role.targets_mut())
        };
        for entry in entries.entries() {
            self.clear_consumer_slot(entry.consumer, entry.slot);
        }
        tracing::debug!(source = %source, edges = entries.len(), "disconnected all targets");
    }

    /// Remove only the edges pairing `source` with `consumer`, clearing the
    /// matching slots on the consumer side.
    pub fn disconnect(&self, source: NodeHandle, consumer: NodeHandle) {
        let Some(src_cell) = self.get(source) else {
            return;
        };
        let removed = {
            let Ok(mut src) = src_cell.try_borrow_mut() else {
                tracing::warn!(source = %source, "disconnect raced a delivery; ignored");
                return;
            };
            let Some(src_role) = src.as_source() else {
                return;
            };
            src_role.targets_mut().remove_consumer(consumer)
        };
        for entry in &removed {
            self.clear_consumer_slot(entry.consumer, entry.slot);
        }
    }

    /// Consumer-side teardown: clear every occupied slot and remove the
    /// matching entry from each upstream source's target list.
    pub fn disconnect_all_sources(&self, consumer: NodeHandle) {
        let Some(dst_cell) = self.get(consumer) else {
            return;
        };
        let occupied: Vec<(u32, NodeHandle)> = {
            let Ok(mut dst) = dst_cell.try_borrow_mut() else {
                tracing::warn!(consumer = %consumer, "disconnect_all_sources raced a delivery; ignored");
                return;
            };
            let Some(dst_role) = dst.as_consumer() else {
                return;
            };
            let occupied = dst_role.source_slots_mut().occupied().collect();
            dst_role.source_slots_mut().clear();
            occupied
        };
        for (slot, source) in occupied {
            let Some(src_cell) = self.get(source) else {
                continue;
            };
            let Ok(mut src) = src_cell.try_borrow_mut() else {
                continue;
            };
            if let Some(src_role) = src.as_source() {
                src_role.targets_mut().remove_edge(consumer, slot);
            }
        }
    }

    /// Push a newly produced frame into `source` and fan it out to the
    /// source's targets. Consumes the caller's claim on `frame`.
    pub fn submit_frame(&self, source: NodeHandle, frame: FrameBuffer) {
        let Some(src_cell) = self.get(source) else {
            tracing::warn!(
                source = %source,
                "frame submitted to an unregistered node; recycling"
            );
            frame.release();
            return;
        };
        let Ok(mut node) = src_cell.try_borrow_mut() else {
            tracing::warn!(source = %source, "frame submitted to a node mid-delivery; recycling");
            frame.release();
            return;
        };
        match node.as_source() {
            Some(src_role) => {
                src_role.frame_produced(&frame);
                let targets = src_role.targets_mut();
                self.fan_out(targets, &frame);
            }
            None => {
                tracing::warn!(source = %source, "frame submitted to a non-source node; recycling");
            }
        }
        drop(node);
        frame.release();
    }

    /// Broadcast `frame` to every live entry in `targets`.
    ///
    /// The target list is snapshotted (pruning dead handles) before
    /// anything is dispatched, so concurrent-looking edits never affect an
    /// in-flight broadcast. One claim is taken per target before the first
    /// delivery, which keeps the count from reaching zero mid-fan-out no
    /// matter what order the targets release in. With no targets the claim
    /// count is cycled once so an otherwise-unheld buffer returns to its
    /// pool immediately.
    ///
    /// The caller's own claim on `frame` is untouched.
    pub fn fan_out(&self, targets: &mut TargetList, frame: &FrameBuffer) {
        let snapshot = targets.snapshot_live(|handle| self.contains(handle));
        if snapshot.is_empty() {
            frame.retain();
            frame.release();
            return;
        }
        for _ in &snapshot {
            frame.retain();
        }
        for entry in &snapshot {
            self.deliver(entry.consumer, frame.clone(), entry.slot);
        }
    }

    /// Hand one claim on `frame` to `consumer` at `slot`. The claim is
    /// released here if the consumer is gone, busy, or not a consumer at
    /// all.
    pub fn deliver(&self, consumer: NodeHandle, frame: FrameBuffer, slot: u32) {
        let Some(cell) = self.get(consumer) else {
            frame.release();
            return;
        };
        let Ok(mut node) = cell.try_borrow_mut() else {
            tracing::warn!(
                consumer = %consumer,
                "dropping delivery into a node that is already mid-delivery (cycle?)"
            );
            frame.release();
            return;
        };
        match node.as_consumer() {
            Some(dst_role) => dst_role.frame_available(self, frame, slot),
            None => {
                tracing::warn!(consumer = %consumer, "delivery into a non-consumer node; recycling");
                frame.release();
            }
        }
    }

    /// Raw copy of a source's target entries, dead ones included.
    /// Observation only; broadcasts are what prune.
    pub fn targets_of(&self, source: NodeHandle) -> Vec<crate::core::node::TargetEntry> {
        let Some(cell) = self.get(source) else {
            return Vec::new();
        };
        let Ok(mut node) = cell.try_borrow_mut() else {
            return Vec::new();
        };
        node.as_source()
            .map(|s| s.targets_mut().entries().to_vec())
            .unwrap_or_default()
    }

    /// Occupied input slots of a consumer, in ascending slot order.
    pub fn sources_of(&self, consumer: NodeHandle) -> Vec<(u32, NodeHandle)> {
        let Some(cell) = self.get(consumer) else {
            return Vec::new();
        };
        let Ok(mut node) = cell.try_borrow_mut() else {
            return Vec::new();
        };
        node.as_consumer()
            .map(|c| c.source_slots_mut().occupied().collect())
            .unwrap_or_default()
    }

    pub fn topology(&self) -> GraphTopology {
        GraphTopology::capture(self)
    }

    pub(crate) fn live_nodes(&self) -> Vec<(NodeHandle, NodeCell)> {
        self.arena.borrow().iter_live()
    }

    fn get(&self, handle: NodeHandle) -> Option<NodeCell> {
        self.arena.borrow().get(handle)
    }

    fn clear_consumer_slot(&self, consumer: NodeHandle, slot: u32) {
        let Some(cell) = self.get(consumer) else {
            return;
        };
        let Ok(mut node) = cell.try_borrow_mut() else {
            tracing::warn!(consumer = %consumer, "slot clear raced a delivery; skipped");
            return;
        };
        if let Some(dst_role) = node.as_consumer() {
            dst_role.source_slots_mut().clear_slot(slot);
        }
    }
}
