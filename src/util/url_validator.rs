use thiserror::Error;
use url::Url;

/// Reasons a feed URL is refused before it reaches the store.
#[derive(Error, Debug)]
pub enum FeedUrlError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    /// Credentials would end up in the database in plain text.
    #[error("URL must not embed credentials")]
    EmbeddedCredentials,
}

/// Validates a feed URL and returns its trimmed form.
///
/// The string is stored as given (minus surrounding whitespace) rather than
/// in its normalized [`Url`] form, so that re-ingesting the same source
/// string always hits the same row.
///
/// # Examples
///
/// ```
/// use feedstore::util::validate_feed_url;
///
/// assert_eq!(
///     validate_feed_url(" https://example.com/feed.xml ").unwrap(),
///     "https://example.com/feed.xml"
/// );
/// assert!(validate_feed_url("file:///etc/passwd").is_err());
/// assert!(validate_feed_url("https://user:pw@example.com/rss").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<&str, FeedUrlError> {
    let trimmed = url_str.trim();
    let url = Url::parse(trimmed)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(FeedUrlError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(FeedUrlError::MissingHost),
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(FeedUrlError::EmbeddedCredentials);
    }

    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_http_and_https() {
        assert!(validate_feed_url("http://example.com/rss").is_ok());
        assert!(validate_feed_url("https://blog.example.org/atom.xml?x=1").is_ok());
        assert!(validate_feed_url("http://localhost:8080/feed").is_ok());
    }

    #[test]
    fn test_rejects_other_schemes() {
        for url in ["ftp://example.com/feed", "file:///tmp/feed.xml", "javascript:alert(1)"] {
            assert!(
                matches!(validate_feed_url(url), Err(FeedUrlError::UnsupportedScheme(_))),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_rejects_unparseable() {
        assert!(matches!(
            validate_feed_url("not a url"),
            Err(FeedUrlError::InvalidUrl(_))
        ));
        assert!(validate_feed_url("").is_err());
    }

    #[test]
    fn test_rejects_credentials() {
        assert!(matches!(
            validate_feed_url("https://alice@example.com/feed"),
            Err(FeedUrlError::EmbeddedCredentials)
        ));
    }

    #[test]
    fn test_returns_trimmed_input() {
        assert_eq!(
            validate_feed_url("\thttps://Example.com/Feed\n").unwrap(),
            "https://Example.com/Feed"
        );
    }
}
