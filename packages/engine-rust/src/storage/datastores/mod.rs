//! Durable [`DataObjectMap`](super::DataObjectMap) backends.
//!
//! Currently includes [`SqliteDataObjectMap`] behind the `sqlite` feature.

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{open_connection, SqliteConnection, SqliteDataObjectMap};
