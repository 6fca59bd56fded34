//! Storage contracts, reference backends and stack composition.
//!
//! - [`Backend`]: lifecycle surface every adapter implements
//! - [`KeyValueMap`] / [`KeyLongMap`]: single-value maps with TTL and
//!   compare-and-set
//! - [`DataObjectMap`] and [`Record`]: flat records addressed by OID
//! - [`Stack`]: ordered multi-layer composition of one contract
//! - [`factory`]: per-type providers that build adapters from configuration

pub mod backend;
pub mod data_object_map;
pub mod datastores;
pub mod engines;
pub mod factory;
pub mod key_value;
pub mod record;
pub mod stack;

pub use backend::*;
pub use data_object_map::*;
pub use key_value::*;
pub use record::*;
pub use stack::*;
