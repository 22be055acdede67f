//! Seam to the messaging subsystem. The engine only stores the thread
//! identifier returned here; thread content and delivery live elsewhere.
use crate::utils::{self, THREAD_HRP};

pub trait DiscussionThreads: Send + Sync {
    /// Open a discussion thread for a new issue and return its identifier.
    ///
    /// Called once per raise, after the request passed its checks and before
    /// the issue is written. If the write still fails the thread is left
    /// without an issue pointing at it.
    fn open_thread(&self, issue_id: &str, title: &str) -> anyhow::Result<String>;

    /// Mirror an issue's resolution onto its thread. Informational only; the
    /// issue stays authoritative.
    fn mark_resolved(&self, _thread_id: &str, _resolved: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Issues identifiers locally without talking to a chat service.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalThreads;

impl DiscussionThreads for LocalThreads {
    fn open_thread(&self, _issue_id: &str, _title: &str) -> anyhow::Result<String> {
        utils::new_uuid_to_bech32(THREAD_HRP)
    }
}
