//! Node capability traits and their edge bookkeeping.
//!
//! A node registered in the graph implements [`PipelineNode`] plus one or
//! both of the capability traits: [`FrameSource`] for nodes that emit
//! buffers downstream, [`FrameConsumer`] for nodes that accept buffers on
//! numbered input slots. A processing stage implements both.

use std::any::Any;
use std::collections::BTreeMap;

use crate::core::buffer::FrameBuffer;
use crate::core::graph::{Graph, NodeHandle};

/// One attached downstream edge: which consumer, and which of its input
/// slots the edge feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetEntry {
    pub consumer: NodeHandle,
    pub slot: u32,
}

/// Ordered, non-owning list of a source's attached targets.
///
/// Entries hold arena handles, not node references, so a consumer's
/// deregistration (not this list) ends its life. Entries whose consumer is
/// gone are pruned lazily the next time the list is snapshotted for a
/// broadcast.
#[derive(Debug, Default)]
pub struct TargetList {
    entries: Vec<TargetEntry>,
}

impl TargetList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw entries in attach order, dead ones included.
    pub fn entries(&self) -> &[TargetEntry] {
        &self.entries
    }

    pub(crate) fn append(&mut self, consumer: NodeHandle, slot: u32) {
        self.entries.push(TargetEntry { consumer, slot });
    }

    /// Remove every entry pairing `consumer`, returning what was removed.
    pub(crate) fn remove_consumer(&mut self, consumer: NodeHandle) -> Vec<TargetEntry> {
        let (removed, kept) = self.entries.drain(..).partition(|e| e.consumer == consumer);
        self.entries = kept;
        removed
    }

    pub(crate) fn remove_edge(&mut self, consumer: NodeHandle, slot: u32) {
        self.entries
            .retain(|e| !(e.consumer == consumer && e.slot == slot));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copy of the live entries in attach order; dead entries are pruned
    /// from the list as a side effect.
    pub(crate) fn snapshot_live(&mut self, is_live: impl Fn(NodeHandle) -> bool) -> Vec<TargetEntry> {
        self.entries.retain(|e| is_live(e.consumer));
        self.entries.clone()
    }
}

/// A consumer's bounded map from input-slot index to the source feeding it.
#[derive(Debug, Default)]
pub struct SourceSlots {
    slots: BTreeMap<u32, NodeHandle>,
}

impl SourceSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_at(&self, slot: u32) -> Option<NodeHandle> {
        self.slots.get(&slot).copied()
    }

    /// Occupied slots in ascending slot order.
    pub fn occupied(&self) -> impl Iterator<Item = (u32, NodeHandle)> + '_ {
        self.slots.iter().map(|(slot, source)| (*slot, *source))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bind `source` at `slot`, replacing any occupant. The replaced edge's
    /// other half is deliberately left alone; unbinding it is the caller's
    /// responsibility, mirroring direct slot assignment.
    pub(crate) fn bind(&mut self, slot: u32, source: NodeHandle) -> Option<NodeHandle> {
        self.slots.insert(slot, source)
    }

    /// Bind `source` at the lowest free slot below `maximum_inputs`.
    pub(crate) fn bind_first_free(
        &mut self,
        source: NodeHandle,
        maximum_inputs: u32,
    ) -> Option<u32> {
        let slot = (0..maximum_inputs).find(|s| !self.slots.contains_key(s))?;
        self.slots.insert(slot, source);
        Some(slot)
    }

    pub(crate) fn clear_slot(&mut self, slot: u32) -> Option<NodeHandle> {
        self.slots.remove(&slot)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Base trait for anything that can be registered in the graph.
pub trait PipelineNode: Send + Any {
    /// Short kind label used in logs and topology snapshots.
    fn type_name(&self) -> &'static str;

    /// Source capability, if this node emits frames.
    fn as_source(&mut self) -> Option<&mut dyn FrameSource> {
        None
    }

    /// Consumer capability, if this node accepts frames.
    fn as_consumer(&mut self) -> Option<&mut dyn FrameConsumer> {
        None
    }

    /// Downcast support for [`Graph::with_node_mut`].
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Capability of a node that emits frame buffers to downstream targets.
pub trait FrameSource {
    fn targets_mut(&mut self) -> &mut TargetList;

    /// Hook invoked when a frame is produced through this source, before
    /// fan-out. Sources that support replay record the frame here (taking
    /// their own claim). Default: no-op, for pure streaming sources.
    fn frame_produced(&mut self, frame: &FrameBuffer) {
        let _ = frame;
    }

    /// A claim on the most recent output, for delivery to one newly
    /// attached edge. `None` when the source has no meaningful last output.
    /// Implementations must retain the returned buffer; the receiving
    /// consumer releases it.
    fn replay_last_output(&mut self) -> Option<FrameBuffer> {
        None
    }
}

/// Capability of a node that accepts frame buffers on numbered input slots.
pub trait FrameConsumer {
    /// Fixed bound on input slots; valid slots are `0..maximum_inputs`.
    fn maximum_inputs(&self) -> u32;

    fn source_slots_mut(&mut self) -> &mut SourceSlots;

    /// A new buffer is available on `slot`. The frame arrives with one
    /// claim held for this node; the implementation must release it exactly
    /// once after it is done reading or re-broadcasting.
    fn frame_available(&mut self, graph: &Graph, frame: FrameBuffer, slot: u32);
}

/// Source endpoint for producers living outside the graph (capture
/// callbacks, decoders). Frames are pushed into it through
/// [`ProcessingContext::submit_frame`](crate::core::context::ProcessingContext::submit_frame).
///
/// With replay enabled the last produced frame is held and re-delivered to
/// targets that attach later, which is the behavior wanted for static
/// content. Live sources leave it off and late subscribers simply wait for
/// the next frame.
pub struct ExternalSource {
    targets: TargetList,
    last_output: Option<FrameBuffer>,
    replay: bool,
}

impl ExternalSource {
    /// Live source: no replay, late subscribers wait for the next frame.
    pub fn new() -> Self {
        Self {
            targets: TargetList::new(),
            last_output: None,
            replay: false,
        }
    }

    /// Static-content source: the last frame is replayed to targets that
    /// attach after it was produced.
    pub fn with_replay() -> Self {
        let mut source = Self::new();
        source.replay = true;
        source
    }
}

impl Default for ExternalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineNode for ExternalSource {
    fn type_name(&self) -> &'static str {
        "external_source"
    }

    fn as_source(&mut self) -> Option<&mut dyn FrameSource> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl FrameSource for ExternalSource {
    fn targets_mut(&mut self) -> &mut TargetList {
        &mut self.targets
    }

    fn frame_produced(&mut self, frame: &FrameBuffer) {
        if !self.replay {
            return;
        }
        frame.retain();
        if let Some(previous) = self.last_output.replace(frame.clone()) {
            previous.release();
        }
    }

    fn replay_last_output(&mut self) -> Option<FrameBuffer> {
        self.last_output.as_ref().map(|frame| {
            frame.retain();
            frame.clone()
        })
    }
}

impl Drop for ExternalSource {
    fn drop(&mut self) {
        if let Some(frame) = self.last_output.take() {
            frame.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::NodeHandle;

    fn handle(index: u32) -> NodeHandle {
        NodeHandle::from_raw_parts(index, 0)
    }

    #[test]
    fn test_target_list_attach_order() {
        let mut targets = TargetList::new();
        targets.append(handle(1), 0);
        targets.append(handle(2), 1);
        targets.append(handle(1), 3);

        let order: Vec<_> = targets.entries().iter().map(|e| e.slot).collect();
        assert_eq!(order, vec![0, 1, 3]);
    }

    #[test]
    fn test_target_list_remove_consumer() {
        let mut targets = TargetList::new();
        targets.append(handle(1), 0);
        targets.append(handle(2), 0);
        targets.append(handle(1), 2);

        let removed = targets.remove_consumer(handle(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.entries()[0].consumer, handle(2));
    }

    #[test]
    fn test_snapshot_prunes_dead_entries() {
        let mut targets = TargetList::new();
        targets.append(handle(1), 0);
        targets.append(handle(2), 0);
        targets.append(handle(3), 0);

        let live = targets.snapshot_live(|h| h != handle(2));
        assert_eq!(live.len(), 2);
        assert_eq!(targets.len(), 2, "pruning persists in the list");
    }

    #[test]
    fn test_source_slots_lowest_free() {
        let mut slots = SourceSlots::new();
        slots.bind(1, handle(9));
        assert_eq!(slots.bind_first_free(handle(7), 4), Some(0));
        assert_eq!(slots.bind_first_free(handle(8), 4), Some(2));
    }

    #[test]
    fn test_source_slots_capacity() {
        let mut slots = SourceSlots::new();
        assert_eq!(slots.bind_first_free(handle(1), 1), Some(0));
        assert_eq!(slots.bind_first_free(handle(2), 1), None);
        assert_eq!(slots.source_at(0), Some(handle(1)));
    }

    #[test]
    fn test_source_slots_bind_replaces() {
        let mut slots = SourceSlots::new();
        slots.bind(0, handle(1));
        let replaced = slots.bind(0, handle(2));
        assert_eq!(replaced, Some(handle(1)));
        assert_eq!(slots.len(), 1);
    }
}
