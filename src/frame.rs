//! Frames and the bounded upload buffer.
//!
//! - `Frame`: One acquired image plus its metadata and acquisition timestamp.
//! - `BufferItem`: A frame waiting in the buffer, with its upload state.
//! - `FrameBuffer`: Bounded FIFO holding area between acquisition and upload.
//!
//! An item leaves the buffer in exactly two ways: the repository confirms its
//! upload, or it is the oldest item when a new frame arrives at capacity.

use serde_json::{Map, Value};
use std::collections::VecDeque;

use crate::upload::RepositorySink;

/// Default buffer capacity when none is configured.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

// ----------------------------------------------------------------------------
// Frame: one unit of acquired data
// ----------------------------------------------------------------------------

/// One acquired frame, as decoded from the vision service envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Raw encoded image bytes.
    pub payload: Vec<u8>,
    /// Media type of `payload` (e.g. `image/png`).
    pub content_type: String,
    /// Free-form metadata forwarded to the repository as `jsonData`.
    pub metadata: Map<String, Value>,
    /// Acquisition time reported by the source. Used for file naming.
    pub timestamp: i64,
}

impl Frame {
    pub fn new(payload: Vec<u8>, content_type: impl Into<String>, timestamp: i64) -> Self {
        Self {
            payload,
            content_type: content_type.into(),
            metadata: Map::new(),
            timestamp,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

// ----------------------------------------------------------------------------
// BufferItem: a frame plus its upload lifecycle
// ----------------------------------------------------------------------------

/// Upload lifecycle of a buffered item.
///
/// `Failed` is still eligible for upload on the next drain; only a confirmed
/// upload removes the item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UploadState {
    #[default]
    Pending,
    Uploading,
    Failed { attempts: u32 },
    Uploaded,
}

impl UploadState {
    /// Number of failed attempts so far.
    pub fn attempts(&self) -> u32 {
        match self {
            UploadState::Failed { attempts } => *attempts,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BufferItem {
    pub frame: Frame,
    pub upload_state: UploadState,
}

impl BufferItem {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            upload_state: UploadState::Pending,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame.payload
    }

    pub fn content_type(&self) -> &str {
        &self.frame.content_type
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.frame.metadata
    }

    pub fn timestamp(&self) -> i64 {
        self.frame.timestamp
    }
}

impl From<Frame> for BufferItem {
    fn from(frame: Frame) -> Self {
        Self::new(frame)
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded holding area
// ----------------------------------------------------------------------------

/// Result of one `FrameBuffer::drain_upload` pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Whether the buffer held anything when the drain began.
    pub had_items: bool,
    /// Items confirmed by the sink and removed.
    pub uploaded: usize,
    /// Items the sink rejected. They stay buffered.
    pub failed: usize,
}

/// Bounded FIFO buffer of frames awaiting upload.
///
/// - Insertion order is arrival order.
/// - `len() <= capacity()` after every `add`.
/// - At capacity, the oldest item is evicted before the new one is appended.
/// - `drain_upload` walks newest to oldest, so fresh frames reach the
///   repository first when a backlog builds up. Delivery order across a
///   backlog is therefore not acquisition order.
#[derive(Debug)]
pub struct FrameBuffer {
    items: VecDeque<BufferItem>,
    capacity: usize,
    evicted: u64,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` items. A capacity of zero
    /// is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Append an item, evicting the oldest first if the buffer is full.
    pub fn add(&mut self, item: impl Into<BufferItem>) {
        while self.items.len() >= self.capacity {
            if let Some(oldest) = self.items.pop_front() {
                self.evicted += 1;
                log::warn!(
                    "buffer full ({} items), evicted frame t={}",
                    self.capacity,
                    oldest.timestamp()
                );
            }
        }
        self.items.push_back(item.into());
    }

    /// Offer every buffered item to `sink`, newest first.
    ///
    /// Exactly one upload attempt per item per call. Confirmed items are
    /// removed; rejected items keep their position and are marked `Failed`.
    pub fn drain_upload<K: RepositorySink + ?Sized>(&mut self, sink: &mut K) -> DrainOutcome {
        let mut outcome = DrainOutcome {
            had_items: !self.items.is_empty(),
            ..DrainOutcome::default()
        };

        // Removing index i leaves indices below i untouched.
        for index in (0..self.items.len()).rev() {
            let item = &mut self.items[index];
            let attempts = item.upload_state.attempts();
            item.upload_state = UploadState::Uploading;

            if sink.upload(item) {
                item.upload_state = UploadState::Uploaded;
                self.items.remove(index);
                outcome.uploaded += 1;
            } else {
                item.upload_state = UploadState::Failed {
                    attempts: attempts + 1,
                };
                outcome.failed += 1;
            }
        }

        outcome
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items dropped by FIFO eviction since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Buffered items, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BufferItem> + '_ {
        self.items.iter()
    }

    /// Timestamps of buffered items, oldest first.
    pub fn timestamps(&self) -> Vec<i64> {
        self.items.iter().map(BufferItem::timestamp).collect()
    }

    /// Memory usage estimate of buffered payloads.
    pub fn memory_bytes(&self) -> usize {
        self.items.iter().map(|item| item.payload().len()).sum()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
