//! Input validation shared by the store and the command line.

mod url_validator;

pub use url_validator::{validate_feed_url, FeedUrlError};
