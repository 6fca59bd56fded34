//! Lifecycle surface shared by every backend adapter.
//!
//! [`Backend`] is the seam an external adapter (SQL, grid, document store,
//! filesystem) implements alongside the data contracts in
//! [`key_value`](super::key_value) and
//! [`data_object_map`](super::data_object_map). The engine never reaches
//! into an adapter beyond these methods.

use stackstore_core::Result;

/// Lifecycle operations of a backend adapter.
///
/// Used as a supertrait of every data contract, so `Arc<dyn DataObjectMap>`
/// and friends expose lifecycle calls directly.
pub trait Backend: Send + Sync {
    /// Human-readable identity used in logs (e.g. `"memory:users"`).
    fn name(&self) -> &str;

    /// One-time initialization (create tables, indexes, buckets).
    ///
    /// Idempotent: calling it on an already set-up backend is a no-op.
    fn system_setup(&self) -> Result<()> {
        Ok(())
    }

    /// Tear down native storage for this store and release its resources.
    fn system_destroy(&self) -> Result<()>;

    /// Remove every entry while keeping the backend usable.
    fn clear(&self) -> Result<()>;

    /// Reclaim storage: physically delete expired entries, compact, etc.
    ///
    /// Never required for correctness. Must be safe to run concurrently with
    /// any other operation; scheduling it is the caller's responsibility.
    fn maintenance(&self) -> Result<()> {
        Ok(())
    }
}
