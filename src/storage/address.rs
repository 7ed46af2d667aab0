//! Logical addresses and the router that turns them into store routes.
//!
//! An [`Address`] is plain data: a resource kind, a scope (remote part,
//! overlay part or merged view) and a selector. [`route`] is the single
//! dispatch point; it performs no I/O. Narrow selectors are derived from the
//! matching collection route plus an id condition, so a single-feed address
//! always carries every predicate of the feed collection it belongs to.
//!
//! Addresses also have a path form, e.g. `feeds/-2/entries` or
//! `user/entries/17`:
//!
//! ```
//! use feedstore::storage::{route, Address, FeedSelector};
//!
//! let address: Address = "feeds/starred/entries".parse().unwrap();
//! assert_eq!(address, Address::feed_entries(FeedSelector::Starred));
//! assert!(route(&address).is_ok());
//! ```

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use std::fmt;
use std::str::FromStr;

use super::query::Clauses;
use super::types::{EntryId, FeedId, StoreError};

/// Raw id of the "all entries" sentinel selector.
pub const ALL_ENTRIES_RAW: i64 = -1;

/// Raw id of the "starred entries" sentinel selector.
pub const STARRED_ENTRIES_RAW: i64 = -2;

// ============================================================================
// Selectors
// ============================================================================

/// Scope of an entry collection: one real feed, or a virtual cross-feed
/// collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSelector {
    Feed(FeedId),
    All,
    Starred,
}

impl FeedSelector {
    /// Interpret a raw feed id: `-1` is "all", `-2` is "starred", positive
    /// values are real feeds. Everything else is unroutable.
    pub fn from_raw(raw: i64) -> Result<Self, StoreError> {
        match raw {
            ALL_ENTRIES_RAW => Ok(FeedSelector::All),
            STARRED_ENTRIES_RAW => Ok(FeedSelector::Starred),
            id if id > 0 => Ok(FeedSelector::Feed(id)),
            other => Err(StoreError::UnroutableAddress(format!(
                "feed id {} is neither a real feed nor a sentinel",
                other
            ))),
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            FeedSelector::Feed(id) => id,
            FeedSelector::All => ALL_ENTRIES_RAW,
            FeedSelector::Starred => STARRED_ENTRIES_RAW,
        }
    }

    /// The real feed id, if this selector names one.
    pub fn feed_id(self) -> Option<FeedId> {
        match self {
            FeedSelector::Feed(id) => Some(id),
            FeedSelector::All | FeedSelector::Starred => None,
        }
    }
}

impl fmt::Display for FeedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedSelector::Feed(id) => write!(f, "{}", id),
            FeedSelector::All => f.write_str("all"),
            FeedSelector::Starred => f.write_str("starred"),
        }
    }
}

impl FromStr for FeedSelector {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(FeedSelector::All),
            "starred" => Ok(FeedSelector::Starred),
            raw => raw
                .parse::<i64>()
                .map_err(|_| StoreError::UnroutableAddress(format!("bad feed selector '{}'", raw)))
                .and_then(FeedSelector::from_raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Feed,
    Entry,
    SyncLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Fields owned by remote ingestion
    Remote,
    /// Fields owned by local user action
    Overlay,
    /// Read-only combination of both
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Collection,
    Single(i64),
    FeedScoped(FeedSelector),
}

// ============================================================================
// Address
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub kind: ResourceKind,
    pub scope: Scope,
    pub selector: Selector,
}

impl Address {
    pub fn new(kind: ResourceKind, scope: Scope, selector: Selector) -> Self {
        Self {
            kind,
            scope,
            selector,
        }
    }

    /// Merged feed listing
    pub fn feeds() -> Self {
        Self::new(ResourceKind::Feed, Scope::Merged, Selector::Collection)
    }

    /// One merged feed
    pub fn feed(id: FeedId) -> Self {
        Self::new(ResourceKind::Feed, Scope::Merged, Selector::Single(id))
    }

    /// Merged entries of a feed or sentinel collection
    pub fn feed_entries(selector: FeedSelector) -> Self {
        Self::new(
            ResourceKind::Entry,
            Scope::Merged,
            Selector::FeedScoped(selector),
        )
    }

    /// One merged entry
    pub fn entry(id: EntryId) -> Self {
        Self::new(ResourceKind::Entry, Scope::Merged, Selector::Single(id))
    }

    /// Overlay part of one feed
    pub fn feed_overlay(id: FeedId) -> Self {
        Self::new(ResourceKind::Feed, Scope::Overlay, Selector::Single(id))
    }

    /// Overlay part of one entry
    pub fn entry_overlay(id: EntryId) -> Self {
        Self::new(ResourceKind::Entry, Scope::Overlay, Selector::Single(id))
    }

    /// Overlay part of every entry in a feed or sentinel collection
    pub fn entries_overlay(selector: FeedSelector) -> Self {
        Self::new(
            ResourceKind::Entry,
            Scope::Overlay,
            Selector::FeedScoped(selector),
        )
    }

    /// Remote part of one feed
    pub fn feed_remote(id: FeedId) -> Self {
        Self::new(ResourceKind::Feed, Scope::Remote, Selector::Single(id))
    }

    /// Ingestion target for the entries of a feed
    pub fn entries_remote(id: FeedId) -> Self {
        Self::new(
            ResourceKind::Entry,
            Scope::Remote,
            Selector::FeedScoped(FeedSelector::Feed(id)),
        )
    }

    /// Sync log, optionally for a single feed
    pub fn sync_log(feed_id: Option<FeedId>) -> Self {
        let selector = match feed_id {
            Some(id) => Selector::FeedScoped(FeedSelector::Feed(id)),
            None => Selector::Collection,
        };
        Self::new(ResourceKind::SyncLog, Scope::Merged, selector)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Remote => f.write_str("sync/")?,
            Scope::Overlay => f.write_str("user/")?,
            Scope::Merged => {}
        }
        match (self.kind, self.selector) {
            (ResourceKind::Feed, Selector::Collection) => f.write_str("feeds"),
            (ResourceKind::Feed, Selector::Single(id)) => write!(f, "feeds/{}", id),
            (ResourceKind::Feed, Selector::FeedScoped(sel)) => write!(f, "feeds/{}/feeds", sel),
            (ResourceKind::Entry, Selector::Collection) => f.write_str("entries"),
            (ResourceKind::Entry, Selector::Single(id)) => write!(f, "entries/{}", id),
            (ResourceKind::Entry, Selector::FeedScoped(sel)) => write!(f, "feeds/{}/entries", sel),
            (ResourceKind::SyncLog, Selector::Collection) => f.write_str("sync-log"),
            (ResourceKind::SyncLog, Selector::Single(id)) => write!(f, "sync-log/{}", id),
            (ResourceKind::SyncLog, Selector::FeedScoped(sel)) => {
                write!(f, "feeds/{}/sync-log", sel)
            }
        }
    }
}

impl FromStr for Address {
    type Err = StoreError;

    /// Parse the path form. Parsing only checks the shape; whether the
    /// address can be served is decided by [`route`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unroutable = || StoreError::UnroutableAddress(s.to_string());
        let trimmed = s.trim_matches('/');
        let (scope, rest) = if let Some(rest) = trimmed.strip_prefix("user/") {
            (Scope::Overlay, rest)
        } else if let Some(rest) = trimmed.strip_prefix("sync/") {
            (Scope::Remote, rest)
        } else {
            (Scope::Merged, trimmed)
        };

        let single = |raw: &str| raw.parse::<i64>().map_err(|_| unroutable());
        let segments: Vec<&str> = rest.split('/').collect();
        let (kind, selector) = match segments.as_slice() {
            ["feeds"] => (ResourceKind::Feed, Selector::Collection),
            ["feeds", id] => (ResourceKind::Feed, Selector::Single(single(*id)?)),
            ["feeds", sel, "feeds"] => (ResourceKind::Feed, Selector::FeedScoped(sel.parse()?)),
            ["feeds", sel, "entries"] => (ResourceKind::Entry, Selector::FeedScoped(sel.parse()?)),
            ["feeds", sel, "sync-log"] => {
                (ResourceKind::SyncLog, Selector::FeedScoped(sel.parse()?))
            }
            ["entries"] => (ResourceKind::Entry, Selector::Collection),
            ["entries", id] => (ResourceKind::Entry, Selector::Single(single(*id)?)),
            ["sync-log"] => (ResourceKind::SyncLog, Selector::Collection),
            ["sync-log", id] => (ResourceKind::SyncLog, Selector::Single(single(*id)?)),
            _ => return Err(unroutable()),
        };
        Ok(Address::new(kind, scope, selector))
    }
}

// ============================================================================
// Routes
// ============================================================================

/// The table or view a route operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    FeedView,
    FeedRemote,
    FeedOverlay,
    EntryView,
    EntryRemote,
    EntryOverlay,
    SyncLog,
}

impl Target {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Target::FeedView => "feed_view",
            Target::FeedRemote => "feed_sync",
            Target::FeedOverlay => "feed_user",
            Target::EntryView => "entry_view",
            Target::EntryRemote => "entry_sync",
            Target::EntryOverlay => "entry_user",
            Target::SyncLog => "sync_log",
        }
    }
}

/// One conjunct of a route predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The row is this feed
    Feed(FeedId),
    /// The row is this entry
    Entry(EntryId),
    /// The row belongs to this feed
    OfFeed(FeedId),
    /// The entry is starred
    Starred,
}

/// A routed address: where to operate and which rows qualify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: Target,
    pub conditions: Vec<Condition>,
}

impl Route {
    fn new(target: Target) -> Self {
        Self {
            target,
            conditions: Vec::new(),
        }
    }

    fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    fn scoped(self, selector: FeedSelector) -> Self {
        match selector {
            FeedSelector::Feed(id) => self.with(Condition::OfFeed(id)),
            FeedSelector::Starred => self.with(Condition::Starred),
            FeedSelector::All => self,
        }
    }

    /// The feed every qualifying row belongs to, if the route pins one.
    pub fn feed_id(&self) -> Option<FeedId> {
        self.conditions.iter().find_map(|c| match c {
            Condition::Feed(id) | Condition::OfFeed(id) => Some(*id),
            _ => None,
        })
    }

    /// Fail unless the route operates on `target`.
    pub(crate) fn require(self, target: Target, address: &Address) -> Result<Self, StoreError> {
        if self.target == target {
            Ok(self)
        } else {
            Err(StoreError::UnroutableAddress(format!(
                "{} cannot be used here (expected {})",
                address,
                target.table()
            )))
        }
    }

    /// Append this route's predicate to `builder`.
    pub(crate) fn push_predicate(&self, builder: &mut QueryBuilder<'_, Sqlite>, clauses: &mut Clauses) {
        for condition in &self.conditions {
            clauses.next(builder);
            match (condition, self.target) {
                (Condition::Feed(id), _) | (Condition::Entry(id), _) => {
                    builder.push("id = ");
                    builder.push_bind(*id);
                }
                (Condition::OfFeed(id), Target::EntryOverlay) => {
                    builder.push("id IN (SELECT id FROM entry_sync WHERE feed_id = ");
                    builder.push_bind(*id);
                    builder.push(")");
                }
                (Condition::OfFeed(id), _) => {
                    builder.push("feed_id = ");
                    builder.push_bind(*id);
                }
                (Condition::Starred, _) => {
                    builder.push("flag_star = 1");
                }
            }
        }
    }
}

fn real_id(id: i64, address: &Address) -> Result<i64, StoreError> {
    if id > 0 {
        Ok(id)
    } else {
        Err(StoreError::UnroutableAddress(format!(
            "{}: id {} is not a real id",
            address, id
        )))
    }
}

/// Map an address to the route serving it.
///
/// # Errors
///
/// `StoreError::UnroutableAddress` for every shape outside the routing table:
/// feed-scoped feeds, remote entries other than a real feed's ingestion
/// target, overlay sync logs, and non-positive single ids.
pub fn route(address: &Address) -> Result<Route, StoreError> {
    use ResourceKind as K;
    use Scope as S;
    use Selector as Sel;

    let unroutable = || StoreError::UnroutableAddress(address.to_string());

    match (address.kind, address.scope, address.selector) {
        (K::Feed, scope, Sel::Collection) => Ok(Route::new(match scope {
            S::Merged => Target::FeedView,
            S::Remote => Target::FeedRemote,
            S::Overlay => Target::FeedOverlay,
        })),
        (K::Feed, scope, Sel::Single(id)) => {
            let id = real_id(id, address)?;
            let collection = route(&Address::new(K::Feed, scope, Sel::Collection))?;
            Ok(collection.with(Condition::Feed(id)))
        }

        (K::Entry, S::Merged, Sel::Collection) => Ok(Route::new(Target::EntryView)),
        (K::Entry, S::Overlay, Sel::Collection) => Ok(Route::new(Target::EntryOverlay)),
        (K::Entry, scope @ (S::Merged | S::Overlay), Sel::FeedScoped(selector)) => {
            if let FeedSelector::Feed(id) = selector {
                real_id(id, address)?;
            }
            let collection = route(&Address::new(K::Entry, scope, Sel::Collection))?;
            Ok(collection.scoped(selector))
        }
        (K::Entry, scope @ (S::Merged | S::Overlay), Sel::Single(id)) => {
            let id = real_id(id, address)?;
            let collection = route(&Address::new(K::Entry, scope, Sel::Collection))?;
            Ok(collection.with(Condition::Entry(id)))
        }
        (K::Entry, S::Remote, Sel::FeedScoped(FeedSelector::Feed(id))) => {
            let id = real_id(id, address)?;
            Ok(Route::new(Target::EntryRemote).with(Condition::OfFeed(id)))
        }

        (K::SyncLog, S::Merged | S::Remote, Sel::Collection) => Ok(Route::new(Target::SyncLog)),
        (K::SyncLog, S::Merged | S::Remote, Sel::FeedScoped(FeedSelector::Feed(id))) => {
            let id = real_id(id, address)?;
            Ok(Route::new(Target::SyncLog).with(Condition::OfFeed(id)))
        }

        _ => Err(unroutable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unroutable(address: Address) -> bool {
        matches!(route(&address), Err(StoreError::UnroutableAddress(_)))
    }

    #[test]
    fn test_sentinel_raw_values() {
        assert_eq!(FeedSelector::from_raw(-1).unwrap(), FeedSelector::All);
        assert_eq!(FeedSelector::from_raw(-2).unwrap(), FeedSelector::Starred);
        assert_eq!(FeedSelector::from_raw(7).unwrap(), FeedSelector::Feed(7));
        assert!(FeedSelector::from_raw(0).is_err());
        assert!(FeedSelector::from_raw(-3).is_err());
        assert_eq!(FeedSelector::Starred.as_raw(), STARRED_ENTRIES_RAW);
    }

    #[test]
    fn test_single_feed_extends_collection() {
        let collection = route(&Address::feeds()).unwrap();
        let single = route(&Address::feed(4)).unwrap();

        assert_eq!(single.target, collection.target);
        assert_eq!(single.conditions, vec![Condition::Feed(4)]);
    }

    #[test]
    fn test_feed_scoped_entries() {
        let real = route(&Address::feed_entries(FeedSelector::Feed(3))).unwrap();
        assert_eq!(real.target, Target::EntryView);
        assert_eq!(real.conditions, vec![Condition::OfFeed(3)]);

        let starred = route(&Address::feed_entries(FeedSelector::Starred)).unwrap();
        assert_eq!(starred.conditions, vec![Condition::Starred]);

        let all = route(&Address::feed_entries(FeedSelector::All)).unwrap();
        assert!(all.conditions.is_empty());
    }

    #[test]
    fn test_overlay_routes() {
        let entry = route(&Address::entry_overlay(9)).unwrap();
        assert_eq!(entry.target, Target::EntryOverlay);
        assert_eq!(entry.conditions, vec![Condition::Entry(9)]);

        let feed = route(&Address::feed_overlay(2)).unwrap();
        assert_eq!(feed.target, Target::FeedOverlay);
        assert_eq!(feed.feed_id(), Some(2));
    }

    #[test]
    fn test_remote_entries_only_for_real_feeds() {
        let ingest = route(&Address::entries_remote(5)).unwrap();
        assert_eq!(ingest.target, Target::EntryRemote);
        assert_eq!(ingest.feed_id(), Some(5));

        assert!(unroutable(Address::new(
            ResourceKind::Entry,
            Scope::Remote,
            Selector::FeedScoped(FeedSelector::Starred),
        )));
        assert!(unroutable(Address::new(
            ResourceKind::Entry,
            Scope::Remote,
            Selector::Single(5),
        )));
    }

    #[test]
    fn test_unroutable_shapes() {
        assert!(unroutable(Address::new(
            ResourceKind::Feed,
            Scope::Merged,
            Selector::FeedScoped(FeedSelector::All),
        )));
        assert!(unroutable(Address::feed(0)));
        assert!(unroutable(Address::feed(-1)));
        assert!(unroutable(Address::entry(-5)));
        assert!(unroutable(Address::feed_entries(FeedSelector::Feed(-4))));
        assert!(unroutable(Address::new(
            ResourceKind::SyncLog,
            Scope::Overlay,
            Selector::Collection,
        )));
    }

    #[test]
    fn test_parse_paths() {
        let cases = [
            ("feeds", Address::feeds()),
            ("feeds/12", Address::feed(12)),
            ("feeds/-1/entries", Address::feed_entries(FeedSelector::All)),
            ("feeds/starred/entries", Address::feed_entries(FeedSelector::Starred)),
            ("entries/8", Address::entry(8)),
            ("user/feeds/3", Address::feed_overlay(3)),
            ("user/entries/4", Address::entry_overlay(4)),
            ("user/feeds/-2/entries", Address::entries_overlay(FeedSelector::Starred)),
            ("sync/feeds/6", Address::feed_remote(6)),
            ("sync/feeds/6/entries", Address::entries_remote(6)),
            ("sync-log", Address::sync_log(None)),
            ("feeds/6/sync-log", Address::sync_log(Some(6))),
        ];
        for (path, expected) in cases {
            assert_eq!(path.parse::<Address>().unwrap(), expected, "{}", path);
        }
    }

    #[test]
    fn test_display_parses_back() {
        for address in [
            Address::feeds(),
            Address::feed_entries(FeedSelector::Feed(3)),
            Address::entries_overlay(FeedSelector::All),
            Address::feed_remote(2),
            Address::sync_log(Some(1)),
        ] {
            assert_eq!(address.to_string().parse::<Address>().unwrap(), address);
        }
    }

    #[test]
    fn test_every_shape_parses_back() {
        // Unroutable shapes too: parsing checks the shape, routing decides
        for kind in [ResourceKind::Feed, ResourceKind::Entry, ResourceKind::SyncLog] {
            for scope in [Scope::Merged, Scope::Overlay, Scope::Remote] {
                for selector in [
                    Selector::Collection,
                    Selector::Single(7),
                    Selector::FeedScoped(FeedSelector::Feed(3)),
                    Selector::FeedScoped(FeedSelector::Starred),
                ] {
                    let address = Address::new(kind, scope, selector);
                    let path = address.to_string();
                    assert_eq!(path.parse::<Address>().unwrap(), address, "{}", path);
                }
            }
        }
        assert!(unroutable("feeds/all/feeds".parse().unwrap()));
        assert!(unroutable("sync-log/4".parse().unwrap()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for path in ["", "feed", "feeds/x", "feeds/0/entries", "entries/1/2", "user/"] {
            assert!(
                matches!(path.parse::<Address>(), Err(StoreError::UnroutableAddress(_))),
                "{} should not parse",
                path
            );
        }
    }
}
