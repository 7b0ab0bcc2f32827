use anyhow::{anyhow, Result};
use axum::http::HeaderMap;
use serde::Serialize;

pub const PROFILE_ID_HEADER: &str = "x-profile-id";
pub const PROFILE_NAME_HEADER: &str = "x-profile-name";
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// A verified user profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
}

/// Verifies the caller of a request
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Profile>;
}

/// Trusts profile headers set by an authenticating proxy in front of the
/// server
#[derive(Debug, Default, Clone)]
pub struct TrustedHeaderAuthenticator;

#[async_trait::async_trait]
impl Authenticator for TrustedHeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Profile> {
        let id = header_value(headers, PROFILE_ID_HEADER)
            .ok_or_else(|| anyhow!("missing {} header", PROFILE_ID_HEADER))?;
        let name = header_value(headers, PROFILE_NAME_HEADER).unwrap_or_else(|| id.clone());
        Ok(Profile { id, name })
    }
}

/// Non-empty header value, if present and valid text
pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_trusted_headers() {
        let auth = TrustedHeaderAuthenticator;
        let mut headers = HeaderMap::new();
        assert!(auth.authenticate(&headers).await.is_err());

        headers.insert(PROFILE_ID_HEADER, HeaderValue::from_static("p-1"));
        let profile = auth.authenticate(&headers).await.unwrap();
        assert_eq!(profile.name, "p-1");

        headers.insert(PROFILE_NAME_HEADER, HeaderValue::from_static("Ada"));
        let profile = auth.authenticate(&headers).await.unwrap();
        assert_eq!(
            profile,
            Profile {
                id: "p-1".to_string(),
                name: "Ada".to_string()
            }
        );
    }
}
