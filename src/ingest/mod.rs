//! Frame acquisition sources.
//!
//! A `FrameSource` is polled once per acquisition cycle. Every failure mode
//! degrades to a non-frame `FetchResult` so that a missed frame never stops
//! the pipeline:
//! - `NoData`: the service answered but had no frame to give
//! - `Malformed`: the response could not be decoded into a frame
//! - `Unreachable`: the request itself failed (connect, timeout, I/O)

pub mod vision;

pub use vision::{VisionApiConfig, VisionApiSource, VisionStats};

use anyhow::Result;

use crate::frame::Frame;

/// Outcome of one poll of a frame source.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchResult {
    Frame(Frame),
    NoData(String),
    Malformed(String),
    Unreachable(String),
}

impl FetchResult {
    /// Collapse to the frame, if one was delivered.
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            FetchResult::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    /// Human-readable reason for a missing frame.
    pub fn absence_reason(&self) -> Option<&str> {
        match self {
            FetchResult::Frame(_) => None,
            FetchResult::NoData(reason)
            | FetchResult::Malformed(reason)
            | FetchResult::Unreachable(reason) => Some(reason),
        }
    }
}

/// Source of frames, polled once per acquisition cycle.
pub trait FrameSource {
    /// Verify the source is reachable. Called once before the pipeline starts.
    fn connect(&mut self) -> Result<()>;

    /// Poll for one frame. Must not fail: every problem maps to a non-frame result.
    fn fetch(&mut self) -> FetchResult;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn fetch(&mut self) -> FetchResult {
        (**self).fetch()
    }
}
