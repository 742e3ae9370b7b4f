// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! RelayNode - pass-through stage and the reference fan-out pattern.
//!
//! A relay takes one input, optionally hands each frame to an observation
//! callback, and forwards it to its own targets with the same
//! claim-per-target accounting the broadcast kernel uses. It is the
//! canonical fixture for verifying the fan-out protocol and a convenient
//! tap point for probes.

use std::any::Any;

use crate::core::buffer::FrameBuffer;
use crate::core::graph::Graph;
use crate::core::node::{FrameConsumer, FrameSource, PipelineNode, SourceSlots, TargetList};

pub type FrameObserver = Box<dyn FnMut(&FrameBuffer) + Send>;

pub struct RelayNode {
    targets: TargetList,
    slots: SourceSlots,
    last_output: Option<FrameBuffer>,
    observer: Option<FrameObserver>,
    prevent_relay: bool,
}

impl RelayNode {
    pub fn new() -> Self {
        Self {
            targets: TargetList::new(),
            slots: SourceSlots::new(),
            last_output: None,
            observer: None,
            prevent_relay: false,
        }
    }

    /// Relay that hands every incoming frame to `observer` before the
    /// forwarding decision.
    pub fn with_observer(observer: impl FnMut(&FrameBuffer) + Send + 'static) -> Self {
        let mut relay = Self::new();
        relay.observer = Some(Box::new(observer));
        relay
    }

    pub fn set_observer(&mut self, observer: impl FnMut(&FrameBuffer) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// When set, incoming frames are observed but not forwarded.
    pub fn set_prevent_relay(&mut self, prevent: bool) {
        self.prevent_relay = prevent;
    }

    pub fn prevent_relay(&self) -> bool {
        self.prevent_relay
    }
}

impl Default for RelayNode {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineNode for RelayNode {
    fn type_name(&self) -> &'static str {
        "relay"
    }

    fn as_source(&mut self) -> Option<&mut dyn FrameSource> {
        Some(self)
    }

    fn as_consumer(&mut self) -> Option<&mut dyn FrameConsumer> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl FrameSource for RelayNode {
    fn targets_mut(&mut self) -> &mut TargetList {
        &mut self.targets
    }

    fn replay_last_output(&mut self) -> Option<FrameBuffer> {
        self.last_output.as_ref().map(|frame| {
            frame.retain();
            frame.clone()
        })
    }
}

impl FrameConsumer for RelayNode {
    fn maximum_inputs(&self) -> u32 {
        1
    }

    fn source_slots_mut(&mut self) -> &mut SourceSlots {
        &mut self.slots
    }

    fn frame_available(&mut self, graph: &Graph, frame: FrameBuffer, _slot: u32) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&frame);
        }
        if !self.prevent_relay {
            frame.retain();
            if let Some(previous) = self.last_output.replace(frame.clone()) {
                previous.release();
            }
            graph.fan_out(&mut self.targets, &frame);
        }
        // Our claim from the upstream broadcast; the fan-out above took its
        // own claim per downstream target.
        frame.release();
    }
}

impl Drop for RelayNode {
    fn drop(&mut self) {
        if let Some(frame) = self.last_output.take() {
            frame.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::{BufferDescriptor, BufferId};
    use crate::core::config::EngineConfig;
    use crate::core::node::ExternalSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        slots: SourceSlots,
        received: Arc<AtomicUsize>,
    }

    impl PipelineNode for CountingSink {
        fn type_name(&self) -> &'static str {
            "counting_sink"
        }

        fn as_consumer(&mut self) -> Option<&mut dyn FrameConsumer> {
            Some(self)
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl FrameConsumer for CountingSink {
        fn maximum_inputs(&self) -> u32 {
            1
        }

        fn source_slots_mut(&mut self) -> &mut SourceSlots {
            &mut self.slots
        }

        fn frame_available(&mut self, _graph: &Graph, frame: FrameBuffer, _slot: u32) {
            self.received.fetch_add(1, Ordering::SeqCst);
            frame.release();
        }
    }

    fn counting_sink() -> (CountingSink, Arc<AtomicUsize>) {
        let received = Arc::new(AtomicUsize::new(0));
        (
            CountingSink {
                slots: SourceSlots::new(),
                received: Arc::clone(&received),
            },
            received,
        )
    }

    #[test]
    fn test_relay_forwards_to_all_targets() {
        let graph = Graph::new(&EngineConfig::default());
        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::new());
        let (sink_a, count_a) = counting_sink();
        let (sink_b, count_b) = counting_sink();
        let a = graph.add_node(sink_a);
        let b = graph.add_node(sink_b);

        graph.connect(source, relay, None);
        graph.connect(relay, a, None);
        graph.connect(relay, b, None);

        let desc = BufferDescriptor::new(8, 8);
        let buffer = graph.pool().acquire(&desc).unwrap();
        graph.submit_frame(source, buffer);

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_sees_frame_before_forwarding() {
        let graph = Graph::new(&EngineConfig::default());
        let observed: Arc<parking_lot::Mutex<Vec<BufferId>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed_in_cb = Arc::clone(&observed);

        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::with_observer(move |frame| {
            observed_in_cb.lock().push(frame.id());
        }));
        graph.connect(source, relay, None);

        let buffer = graph.pool().acquire(&BufferDescriptor::new(8, 8)).unwrap();
        let id = buffer.id();
        graph.submit_frame(source, buffer);

        assert_eq!(*observed.lock(), vec![id]);
    }

    #[test]
    fn test_prevent_relay_blocks_forwarding() {
        let graph = Graph::new(&EngineConfig::default());
        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::new());
        let (sink, count) = counting_sink();
        let sink = graph.add_node(sink);

        graph.connect(source, relay, None);
        graph.connect(relay, sink, None);
        graph
            .with_node_mut::<RelayNode, _>(relay, |r| r.set_prevent_relay(true))
            .unwrap();

        let desc = BufferDescriptor::new(8, 8);
        let buffer = graph.pool().acquire(&desc).unwrap();
        graph.submit_frame(source, buffer);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        // The relay's claim was released without forwarding, so the buffer
        // went straight back to the pool.
        assert_eq!(graph.pool().idle_count(&desc), 1);
    }

    #[test]
    fn test_relay_without_targets_keeps_claims_balanced() {
        let graph = Graph::new(&EngineConfig::default());
        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::new());
        graph.connect(source, relay, None);

        // No downstream targets: the relay records the frame for replay and
        // releases its own claim; only the replay claim remains.
        let buffer = graph.pool().acquire(&BufferDescriptor::new(8, 8)).unwrap();
        let probe = buffer.clone();
        graph.submit_frame(source, buffer);
        assert_eq!(probe.refcount(), 1);
    }

    #[test]
    fn test_relay_replays_last_forwarded_frame() {
        let graph = Graph::new(&EngineConfig::default());
        let source = graph.add_node(ExternalSource::new());
        let relay = graph.add_node(RelayNode::new());
        graph.connect(source, relay, None);

        let buffer = graph.pool().acquire(&BufferDescriptor::new(8, 8)).unwrap();
        graph.submit_frame(source, buffer);

        let (sink, count) = counting_sink();
        let late = graph.add_node(sink);
        graph.connect(relay, late, None);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
