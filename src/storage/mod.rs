mod address;
mod batch;
mod ingest;
mod overlay;
mod query;
mod read_state;
mod rows;
mod schema;
mod sync_log;
mod types;

pub use address::{
    route, Address, Condition, FeedSelector, ResourceKind, Route, Scope, Selector, Target,
    ALL_ENTRIES_RAW, STARRED_ENTRIES_RAW,
};
pub use batch::{Operation, OperationResult};
pub use overlay::{EntryOverlayPatch, FeedOverlayPatch};
pub use query::{EntryFilter, EntryOrder, FeedFilter, FeedOrder, QueryResult};
pub use rows::Rows;
pub use schema::{Database, StoreOptions};
pub use types::{
    Entry, EntryId, Feed, FeedId, FeedPollUpdate, IngestEntry, IngestFeed, IngestSummary,
    NewSyncLogEntry, ReadStateChange, StoreError, SyncLogEntry,
};
