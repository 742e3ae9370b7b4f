// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! FrameBuffer - pooled, reference-counted image buffers.
//!
//! A [`FrameBuffer`] is the unit of data that flows through the graph. It
//! carries an explicit claim count (`retain`/`release`) that is independent
//! of how many Rust handles exist: cloning a `FrameBuffer` clones the handle,
//! not the claim. When the claim count reaches zero a pool-owned buffer
//! returns to its pool for reuse; an externally wrapped buffer runs its
//! owner-supplied teardown hook instead.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::pool::PoolShared;

/// Pixel format of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    R8Unorm,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => 4,
            PixelFormat::R8Unorm => 1,
        }
    }
}

/// Display orientation carried alongside the pixel data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

/// Size/format/orientation key describing a frame buffer.
///
/// Descriptor equality (not buffer identity) is what the pool matches on
/// when looking for a reusable buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub orientation: Orientation,
}

impl BufferDescriptor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Rgba8Unorm,
            orientation: Orientation::Portrait,
        }
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Size of the backing pixel storage in bytes.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Process-unique identity of a buffer, stable across pool reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId(u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

impl BufferId {
    pub(crate) fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type TeardownFn = Box<dyn FnOnce() + Send>;

pub(crate) enum Backing {
    /// CPU pixel storage owned by the buffer (pool-managed lifecycle).
    Pooled(Mutex<Box<[u8]>>),
    /// Externally supplied memory identified by an opaque native handle.
    /// Never returned to a pool; the teardown hook runs once on the final
    /// release.
    External {
        native_handle: u64,
        teardown: Mutex<Option<TeardownFn>>,
    },
}

pub(crate) struct BufferInner {
    pub(crate) id: BufferId,
    pub(crate) descriptor: BufferDescriptor,
    pub(crate) refcount: AtomicUsize,
    pub(crate) timestamp_ns: Mutex<Option<i64>>,
    /// Owning pool; dangling for externally wrapped buffers and after the
    /// pool itself is torn down.
    pub(crate) pool: Weak<PoolShared>,
    pub(crate) backing: Backing,
}

/// Handle to a reference-counted frame buffer.
///
/// Cloning the handle does not take a claim; callers that intend to read or
/// hold the buffer pair exactly one [`retain`](FrameBuffer::retain) with one
/// later [`release`](FrameBuffer::release).
#[derive(Clone)]
pub struct FrameBuffer {
    pub(crate) inner: Arc<BufferInner>,
}

impl FrameBuffer {
    pub(crate) fn new_pooled(
        descriptor: BufferDescriptor,
        bytes: Box<[u8]>,
        pool: Weak<PoolShared>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: BufferId::next(),
                descriptor,
                refcount: AtomicUsize::new(1),
                timestamp_ns: Mutex::new(None),
                pool,
                backing: Backing::Pooled(Mutex::new(bytes)),
            }),
        }
    }

    pub(crate) fn from_idle(inner: Arc<BufferInner>) -> Self {
        inner.refcount.store(1, Ordering::Release);
        Self { inner }
    }

    /// Wrap externally owned memory as a frame buffer.
    ///
    /// The claim count starts at 1, held by the caller. Release-to-zero does
    /// not touch any pool; it only invokes the teardown registered with
    /// [`wrap_external_with_teardown`](FrameBuffer::wrap_external_with_teardown),
    /// if any.
    pub fn wrap_external(descriptor: BufferDescriptor, native_handle: u64) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: BufferId::next(),
                descriptor,
                refcount: AtomicUsize::new(1),
                timestamp_ns: Mutex::new(None),
                pool: Weak::new(),
                backing: Backing::External {
                    native_handle,
                    teardown: Mutex::new(None),
                },
            }),
        }
    }

    /// Wrap externally owned memory, running `teardown` once on final release.
    pub fn wrap_external_with_teardown(
        descriptor: BufferDescriptor,
        native_handle: u64,
        teardown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: BufferId::next(),
                descriptor,
                refcount: AtomicUsize::new(1),
                timestamp_ns: Mutex::new(None),
                pool: Weak::new(),
                backing: Backing::External {
                    native_handle,
                    teardown: Mutex::new(Some(Box::new(teardown))),
                },
            }),
        }
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        self.inner.descriptor
    }

    pub fn width(&self) -> u32 {
        self.inner.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.inner.descriptor.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.descriptor.format
    }

    pub fn orientation(&self) -> Orientation {
        self.inner.descriptor.orientation
    }

    /// Monotonic timing tag, if the producer stamped one.
    pub fn timestamp_ns(&self) -> Option<i64> {
        *self.inner.timestamp_ns.lock()
    }

    pub fn set_timestamp_ns(&self, timestamp_ns: i64) {
        *self.inner.timestamp_ns.lock() = Some(timestamp_ns);
    }

    /// Whether this buffer is owned by a pool (as opposed to wrapping
    /// external memory).
    pub fn is_pooled(&self) -> bool {
        matches!(self.inner.backing, Backing::Pooled(_))
    }

    /// Opaque handle of an externally wrapped buffer.
    pub fn native_handle(&self) -> Option<u64> {
        match self.inner.backing {
            Backing::External { native_handle, .. } => Some(native_handle),
            Backing::Pooled(_) => None,
        }
    }

    /// Current number of outstanding claims. Diagnostics and tests only;
    /// the value is stale the moment it is read.
    pub fn refcount(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }

    /// Take a claim on the buffer. Must be paired with exactly one later
    /// [`release`](FrameBuffer::release).
    pub fn retain(&self) {
        self.inner.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one claim. At exactly zero the buffer returns to its owning
    /// pool, or, for externally wrapped buffers, runs the teardown hook.
    ///
    /// Releasing more times than retained is a defect: it panics in debug
    /// builds and is logged (with the count pinned at zero) in release
    /// builds.
    pub fn release(&self) {
        let mut current = self.inner.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                debug_assert!(
                    false,
                    "frame buffer {:?} released more times than it was retained",
                    self.inner.id
                );
                tracing::error!(
                    buffer = ?self.inner.id,
                    "refcount underflow: release without a matching retain"
                );
                return;
            }
            match self.inner.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if current == 1 {
            self.finalize();
        }
    }

    /// Read access to the pixel storage. Returns `None` for externally
    /// wrapped buffers, whose memory the engine cannot address.
    pub fn map_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        match &self.inner.backing {
            Backing::Pooled(bytes) => Some(f(&bytes.lock())),
            Backing::External { .. } => None,
        }
    }

    /// Write access to the pixel storage. Returns `None` for externally
    /// wrapped buffers.
    pub fn map_write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        match &self.inner.backing {
            Backing::Pooled(bytes) => Some(f(&mut bytes.lock())),
            Backing::External { .. } => None,
        }
    }

    fn finalize(&self) {
        if let Some(pool) = self.inner.pool.upgrade() {
            pool.recycle(Arc::clone(&self.inner));
            return;
        }
        match &self.inner.backing {
            Backing::External { teardown, .. } => {
                if let Some(hook) = teardown.lock().take() {
                    hook();
                }
            }
            Backing::Pooled(_) => {
                // Pool already torn down; storage is freed when the last
                // handle drops.
                tracing::trace!(buffer = ?self.inner.id, "released into a torn-down pool");
            }
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.inner.id)
            .field("descriptor", &self.inner.descriptor)
            .field("refcount", &self.refcount())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
