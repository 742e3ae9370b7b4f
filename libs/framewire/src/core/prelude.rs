// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Commonly used types for `use framewire::prelude::*`.

pub use crate::core::{
    // Errors
    error::{PipelineError, Result},

    // Buffers
    buffer::{BufferDescriptor, FrameBuffer, Orientation, PixelFormat},

    // Graph
    graph::{Graph, NodeHandle},

    // Node capabilities
    node::{ExternalSource, FrameConsumer, FrameSource, PipelineNode},
    relay::RelayNode,

    // Worker context
    context::ProcessingContext,
};
