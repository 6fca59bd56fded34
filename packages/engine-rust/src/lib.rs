//! Stackstore Engine: storage contracts, reference backends, layered stacks
//! and group/member relationships on top of them.
//!
//! Callers open stores by logical name through a [`StoreContext`]; the
//! [`StackConfig`] decides which backends serve each name and in what order.

pub mod config;
mod context;
pub mod membership;
pub mod registry;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use config::{NamespaceRule, ProviderConfig, StackConfig, StackResolver};
pub use context::StoreContext;
pub use membership::{Membership, MembershipQuery, Relationship};
pub use registry::ConnectionRegistry;
pub use storage::factory::{BackendProvider, MemoryProvider, ProviderContext};
pub use storage::{
    Backend, DataObjectMap, Entry, KeyLongMap, KeyValueMap, Record, RecordUpdate, Stack,
};
