//! Repository sinks.
//!
//! A `RepositorySink` receives buffered items one at a time. Each call is a
//! single attempt: retries happen when the pipeline drains the buffer again
//! on a later cycle, never inside the sink.

pub mod dataverse;

pub use dataverse::{file_name_for, DataverseConfig, DataverseSink};

use anyhow::Result;

use crate::frame::BufferItem;

pub trait RepositorySink {
    /// Verify the repository is reachable. Called once before the pipeline starts.
    fn connect(&mut self) -> Result<()>;

    /// Upload one item. `true` only when the repository confirmed it.
    fn upload(&mut self, item: &BufferItem) -> bool;
}

impl<K: RepositorySink + ?Sized> RepositorySink for Box<K> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn upload(&mut self, item: &BufferItem) -> bool {
        (**self).upload(item)
    }
}
