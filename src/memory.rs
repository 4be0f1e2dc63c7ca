//! Memory collaborator seam.
//!
//! Long-term storage, vector recall, and the nightly consolidation
//! analytics live outside this crate. The engine only needs three
//! operations, all called from worker threads off the event loop.

use crate::error::Result;

/// Durable memory collaborator.
pub trait MemoryProvider: Send + Sync {
    /// Combined durable-fact and relevant-recall context used to prime
    /// reasoning about `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn hybrid_context(&self, query: &str) -> Result<String>;

    /// Durable facts folded into the fast-brain system instruction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn core_facts(&self) -> Result<String>;

    /// Persist one completed interaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    fn save_interaction(&self, user_text: &str, assistant_text: &str) -> Result<()>;

    /// Run the once-daily consolidation pass. Called while idle, off the
    /// critical path.
    ///
    /// # Errors
    ///
    /// Returns an error if consolidation fails; the caller only logs it.
    fn consolidate(&self) -> Result<()>;
}

/// Memory stub for setups without a store. Context is empty, writes are
/// accepted and dropped.
#[derive(Debug, Default)]
pub struct NoopMemory;

impl MemoryProvider for NoopMemory {
    fn hybrid_context(&self, _query: &str) -> Result<String> {
        Ok(String::new())
    }

    fn core_facts(&self) -> Result<String> {
        Ok(String::new())
    }

    fn save_interaction(&self, _user_text: &str, _assistant_text: &str) -> Result<()> {
        Ok(())
    }

    fn consolidate(&self) -> Result<()> {
        Ok(())
    }
}
