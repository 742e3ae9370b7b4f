// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! BufferPool - descriptor-keyed reuse cache for frame buffers.
//!
//! Buffers are bucketed by exact [`BufferDescriptor`] equality. A release
//! that brings a pool-owned buffer's claim count to zero pushes it back on
//! its bucket's idle list; the next acquire for the same descriptor pops it
//! instead of allocating. Idle growth per bucket is capped so a topology
//! change cannot strand unbounded memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::buffer::{BufferDescriptor, BufferInner, FrameBuffer};
use crate::core::error::{PipelineError, Result};

/// Configuration for the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Maximum idle buffers retained per descriptor bucket. The oldest idle
    /// entry is dropped when a release would exceed the cap.
    pub max_idle_per_bucket: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_bucket: 16,
        }
    }
}

/// Statistics about pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Number of descriptor buckets with at least one idle buffer.
    pub buckets: usize,
    /// Idle buffers across all buckets.
    pub idle_buffers: usize,
    /// Fresh allocations performed over the pool's lifetime.
    pub total_allocated: u64,
}

pub(crate) struct PoolShared {
    buckets: Mutex<HashMap<BufferDescriptor, Vec<Arc<BufferInner>>>>,
    config: BufferPoolConfig,
    total_allocated: AtomicU64,
}

impl PoolShared {
    /// Return a zero-claim buffer to its bucket's idle list.
    pub(crate) fn recycle(&self, inner: Arc<BufferInner>) {
        *inner.timestamp_ns.lock() = None;
        let descriptor = inner.descriptor;
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(descriptor).or_default();
        bucket.push(inner);
        if bucket.len() > self.config.max_idle_per_bucket {
            bucket.remove(0);
            tracing::trace!(
                ?descriptor,
                cap = self.config.max_idle_per_bucket,
                "idle bucket over cap; dropped oldest buffer"
            );
        }
    }
}

/// Descriptor-keyed reuse cache handing out [`FrameBuffer`]s.
///
/// Cloning the pool clones a handle to the same shared state.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                buckets: Mutex::new(HashMap::new()),
                config,
                total_allocated: AtomicU64::new(0),
            }),
        }
    }

    /// Hand out a buffer matching `descriptor` with its claim count at 1,
    /// held by the caller.
    ///
    /// Reuses the most recently idled buffer for the descriptor when one
    /// exists; otherwise allocates fresh storage. Allocation failure is
    /// surfaced as [`PipelineError::PoolAllocation`]; the caller must not
    /// proceed to broadcast.
    pub fn acquire(&self, descriptor: &BufferDescriptor) -> Result<FrameBuffer> {
        {
            let mut buckets = self.shared.buckets.lock();
            if let Some(bucket) = buckets.get_mut(descriptor) {
                if let Some(inner) = bucket.pop() {
                    tracing::trace!(?descriptor, buffer = ?inner.id, "reusing idle buffer");
                    return Ok(FrameBuffer::from_idle(inner));
                }
            }
        }

        let bytes = alloc_pixels(descriptor)?;
        self.shared.total_allocated.fetch_add(1, Ordering::Relaxed);
        let buffer = FrameBuffer::new_pooled(*descriptor, bytes, Arc::downgrade(&self.shared));
        tracing::debug!(
            ?descriptor,
            buffer = ?buffer.id(),
            "allocated new frame buffer"
        );
        Ok(buffer)
    }

    /// Number of idle buffers held for `descriptor`.
    pub fn idle_count(&self, descriptor: &BufferDescriptor) -> usize {
        self.shared
            .buckets
            .lock()
            .get(descriptor)
            .map_or(0, Vec::len)
    }

    /// Drop every idle buffer. Returns how many were purged.
    pub fn purge_idle(&self) -> usize {
        let mut buckets = self.shared.buckets.lock();
        let purged = buckets.values().map(Vec::len).sum();
        buckets.clear();
        if purged > 0 {
            tracing::debug!(purged, "purged idle buffers");
        }
        purged
    }

    pub fn stats(&self) -> BufferPoolStats {
        let buckets = self.shared.buckets.lock();
        BufferPoolStats {
            buckets: buckets.values().filter(|b| !b.is_empty()).count(),
            idle_buffers: buckets.values().map(Vec::len).sum(),
            total_allocated: self.shared.total_allocated.load(Ordering::Relaxed),
        }
    }
}

fn alloc_pixels(descriptor: &BufferDescriptor) -> Result<Box<[u8]>> {
    let len = descriptor.byte_len();
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).map_err(|e| {
        PipelineError::PoolAllocation(format!(
            "{}x{} {:?} ({} bytes): {}",
            descriptor.width, descriptor.height, descriptor.format, len, e
        ))
    })?;
    bytes.resize(len, 0);
    Ok(bytes.into_boxed_slice())
}
