//! Stackstore Core: scalar values, object identifiers, the backend-agnostic
//! query model, the clock abstraction and the shared error type.

pub mod clock;
pub mod error;
pub mod oid;
pub mod query;
pub mod types;

pub use clock::{system_clock, ClockSource, ManualClock, SystemClock};
pub use error::{Result, StoreError};
pub use oid::Oid;
pub use query::{CompareOp, OrderBy, Predicate, Query, Row, SortDirection};
pub use types::{validate_field_name, FieldMap, Value};
