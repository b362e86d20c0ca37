//! Connection authentication.
//!
//! The token travels either as a percent-encoded `token` query parameter on
//! the WebSocket URL or as an `Authorization: Bearer <token>` header. Checking it is
//! delegated to an [`Authenticator`]; a rejected handshake is answered with
//! HTTP 401 before the upgrade.

use percent_encoding::percent_decode_str;
use std::collections::HashSet;

/// What a client presented during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    /// Query parameter wins over the header.
    pub fn from_parts(query: Option<&str>, authorization: Option<&str>) -> Self {
        let from_query = query.and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "token")
                .map(|(_, value)| percent_decode_str(value).decode_utf8_lossy().into_owned())
        });
        let from_header = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string());

        Self {
            token: from_query.or(from_header).filter(|t| !t.is_empty()),
        }
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> bool;
}

/// Accepts everyone. Used when `SKIP_AUTH` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _: &Credentials) -> bool {
        true
    }
}

/// Accepts a fixed set of bearer tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).filter(|t: &String| !t.is_empty()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, credentials: &Credentials) -> bool {
        credentials
            .token
            .as_ref()
            .is_some_and(|token| self.tokens.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_query() {
        let creds = Credentials::from_parts(Some("room=r1&token=abc"), None);
        assert_eq!(creds.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_query_token_is_percent_decoded() {
        let creds = Credentials::from_parts(Some("token=s3%2Fcr%20et"), None);
        assert_eq!(creds.token.as_deref(), Some("s3/cr et"));

        let auth = StaticTokens::new(["a+b=c"]);
        assert!(auth.authenticate(&Credentials::from_parts(Some("token=a%2Bb%3Dc"), None)));
    }

    #[test]
    fn test_token_from_bearer_header() {
        let creds = Credentials::from_parts(None, Some("Bearer xyz"));
        assert_eq!(creds.token.as_deref(), Some("xyz"));

        let creds = Credentials::from_parts(None, Some("Basic xyz"));
        assert!(creds.token.is_none());
    }

    #[test]
    fn test_query_wins_over_header() {
        let creds = Credentials::from_parts(Some("token=q"), Some("Bearer h"));
        assert_eq!(creds.token.as_deref(), Some("q"));
    }

    #[test]
    fn test_empty_token_is_absent() {
        assert!(Credentials::from_parts(Some("token="), None).token.is_none());
    }

    #[test]
    fn test_static_tokens() {
        let auth = StaticTokens::new(["alpha", "beta", ""]);
        assert_eq!(auth.len(), 2);
        assert!(auth.authenticate(&Credentials { token: Some("alpha".into()) }));
        assert!(!auth.authenticate(&Credentials { token: Some("gamma".into()) }));
        assert!(!auth.authenticate(&Credentials::default()));
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authenticate(&Credentials::default()));
    }
}
