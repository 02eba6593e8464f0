//! Remote fetch contract and the GitLab REST adapter.

use async_trait::async_trait;
use glsync_core::{RawIssue, Source};
use glsync_storage::{FetchError, HttpFetcher};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use thiserror::Error;

pub const CRATE_NAME: &str = "glsync-adapters";

/// GitLab personal access token header.
pub const TOKEN_HEADER: &str = "private-token";

/// Characters `encodeURI` leaves alone: alphanumerics, `-_.!~*'()` and the
/// reserved set `;,/?:@&=+$#`.
const URI_PRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'#');

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding issues from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("token is not a valid header value")]
    InvalidToken,
}

/// Fetches the raw issue list behind one encoded URL.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, url: &str, token: &str) -> Result<Vec<RawIssue>, AdapterError>;
}

/// Percent-encodes a whole URL the way `encodeURI` does; `%` itself is
/// encoded, so pre-encoded input is encoded twice.
pub fn encode_uri(url: &str) -> String {
    utf8_percent_encode(url, URI_PRESERVED).to_string()
}

/// Encoded issues URL for a source, ready for [`FetchAdapter::fetch`].
pub fn request_url(source: &Source) -> String {
    encode_uri(&source.issues_url())
}

#[derive(Debug)]
pub struct GitlabAdapter {
    http: HttpFetcher,
}

impl GitlabAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }

    fn headers(token: &str) -> Result<HeaderMap, AdapterError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !token.is_empty() {
            let mut value = HeaderValue::from_str(token).map_err(|_| AdapterError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(TOKEN_HEADER, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl FetchAdapter for GitlabAdapter {
    fn name(&self) -> &str {
        "gitlab"
    }

    async fn fetch(&self, url: &str, token: &str) -> Result<Vec<RawIssue>, AdapterError> {
        let response = self.http.fetch_bytes(url, Self::headers(token)?).await?;
        let issues: Vec<RawIssue> =
            serde_json::from_slice(&response.body).map_err(|source| AdapterError::Decode {
                url: response.final_url.clone(),
                source,
            })?;
        tracing::debug!(url, count = issues.len(), "fetched issues");
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glsync_core::Scope;

    #[test]
    fn encode_uri_keeps_uri_syntax() {
        assert_eq!(
            encode_uri("https://gitlab.com/api/v4/issues?due_date=month&scope=all#top"),
            "https://gitlab.com/api/v4/issues?due_date=month&scope=all#top"
        );
    }

    #[test]
    fn encode_uri_escapes_spaces_unicode_and_percent() {
        assert_eq!(
            encode_uri("https://h/api/v4/issues?labels=needs review,Über&search=50%"),
            "https://h/api/v4/issues?labels=needs%20review,%C3%9Cber&search=50%25"
        );
    }

    #[test]
    fn request_url_encodes_the_scoped_url() {
        let source = Source {
            gitlab_url: "https://gitlab.example.com".into(),
            scope: Scope::Group("my group".into()),
            filter: "state=opened".into(),
            token: "secret".into(),
        };
        let url = request_url(&source);
        assert_eq!(
            url,
            "https://gitlab.example.com/api/v4/groups/my%20group/issues?state=opened"
        );
        assert!(!url.contains("secret"));
    }

    #[test]
    fn empty_token_sends_no_auth_header() {
        let headers = GitlabAdapter::headers("").expect("headers");
        assert!(headers.get(TOKEN_HEADER).is_none());

        let headers = GitlabAdapter::headers("glpat-123").expect("headers");
        let value = headers.get(TOKEN_HEADER).expect("token header");
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().expect("ascii"), "glpat-123");
    }

    #[test]
    fn control_characters_in_token_are_rejected() {
        assert!(matches!(
            GitlabAdapter::headers("bad\ntoken"),
            Err(AdapterError::InvalidToken)
        ));
    }
}
