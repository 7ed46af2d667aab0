//! Local storage and merge layer for a feed aggregator.
//!
//! Remote-sourced feed and entry data and purely local user state (read,
//! starred, custom titles) are stored apart and combined at read time by
//! merge views. See [`storage::Database`] for the operations and
//! [`notify`] for change observation.

pub mod config;
pub mod notify;
pub mod storage;
pub mod util;
