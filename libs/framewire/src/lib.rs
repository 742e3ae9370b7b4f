// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! framewire: real-time frame graph and buffer lifecycle engine.
//!
//! A directed graph of processing nodes produces, transforms, and consumes
//! pooled, reference-counted frame buffers. The engine owns three things
//! and nothing else: how nodes are wired together, how a produced buffer
//! fans out to every downstream consumer and finds its way back to the
//! reuse pool, and the single serialized worker that makes both of those
//! race-free without per-edge locking.
//!
//! Concrete producers and consumers (capture callbacks, decoders, display
//! sinks, encoders) live outside this crate and plug in through the
//! [`FrameSource`](core::FrameSource) / [`FrameConsumer`](core::FrameConsumer)
//! capability traits.

// Suppress pedantic clippy warnings that are intentional design choices
#![allow(clippy::type_complexity)] // Arena cell types are clear in context

pub mod core;

pub use crate::core::prelude;
