use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

use super::remote::RemoteError;

pub const MAX_URL_LENGTH: usize = 2048;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("private network access blocked: {url} resolves to {host}")]
    PrivateNetworkBlocked { url: String, host: String },
}

impl From<HttpError> for RemoteError {
    fn from(e: HttpError) -> Self {
        RemoteError::Config(e.to_string())
    }
}

/// An absolute `http(s)` base URL with a host and no embedded credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    host: String,
}

impl ValidatedUrl {
    /// Validates `url`, refusing loopback, link-local and private hosts.
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        Self::with_policy(url, false)
    }

    /// Same as [`ValidatedUrl::new`] but optionally admits private hosts,
    /// e.g. a backend on `localhost` during development.
    pub fn with_policy(url: impl Into<String>, allow_private: bool) -> Result<Self, HttpError> {
        let raw = url.into();
        let trimmed = raw.trim();
        let invalid = |reason: &str| HttpError::InvalidUrl {
            url: truncate_url(&raw),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("URL cannot be empty"));
        }
        if trimmed.len() > MAX_URL_LENGTH {
            return Err(invalid(&format!(
                "URL exceeds maximum length of {MAX_URL_LENGTH} bytes"
            )));
        }

        let parsed = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(&format!(
                "invalid scheme '{}', only 'http' and 'https' are allowed",
                parsed.scheme()
            )));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("credentials in URL are not allowed"));
        }

        let host = parsed.host().ok_or_else(|| invalid("URL must have a host"))?;
        let host_str = host.to_string().to_lowercase();
        if !allow_private && is_private_host(&host) {
            return Err(HttpError::PrivateNetworkBlocked {
                url: truncate_url(&raw),
                host: host_str,
            });
        }

        Ok(Self {
            url: parsed.as_str().trim_end_matches('/').to_string(),
            host: host_str,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Appends slash-separated path segments.
    #[must_use]
    pub fn join(&self, segments: &[&str]) -> String {
        let mut out = self.url.clone();
        for segment in segments {
            out.push('/');
            out.push_str(segment.trim_matches('/'));
        }
        out
    }
}

fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.to_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain.ends_with(".local")
                || domain.ends_with(".internal")
        }
        Host::Ipv4(ip) => is_private_v4(*ip),
        Host::Ipv6(ip) => is_private_v6(*ip),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

fn truncate_url(url: &str) -> String {
    if url.len() <= 100 {
        url.to_string()
    } else {
        let cut = (0..=100).rev().find(|i| url.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &url[..cut])
    }
}

#[cfg(feature = "rest")]
pub use self::rest::{PostgrestTable, StorageBucket};

#[cfg(feature = "rest")]
mod rest {
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::{Client, RequestBuilder, Response};
    use secrecy::{ExposeSecret, SecretString};
    use std::time::Duration;
    use tracing::{debug, instrument};

    use super::ValidatedUrl;
    use crate::capabilities::remote::{ImageUploader, ListingRow, RemoteError, RemoteTable};

    fn build_client(timeout: Duration) -> Result<Client, RemoteError> {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Config(e.to_string()))
    }

    fn map_transport(e: &reqwest::Error, timeout: Duration) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }

    async fn check_status(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// PostgREST-style table client (`/rest/v1/{table}`).
    pub struct PostgrestTable {
        client: Client,
        endpoint: String,
        api_key: SecretString,
        timeout: Duration,
    }

    impl PostgrestTable {
        pub fn new(
            base_url: &ValidatedUrl,
            table: &str,
            api_key: SecretString,
            timeout: Duration,
        ) -> Result<Self, RemoteError> {
            Ok(Self {
                client: build_client(timeout)?,
                endpoint: base_url.join(&["rest", "v1", table]),
                api_key,
                timeout,
            })
        }

        fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
            let key = self.api_key.expose_secret();
            builder
                .header("apikey", key.as_str())
                .bearer_auth(key)
                .header("Accept", "application/json")
        }

        async fn rows(&self, builder: RequestBuilder) -> Result<Vec<ListingRow>, RemoteError> {
            let response = self
                .authorized(builder)
                .send()
                .await
                .map_err(|e| map_transport(&e, self.timeout))?;
            check_status(response)
                .await?
                .json::<Vec<ListingRow>>()
                .await
                .map_err(|e| RemoteError::Decode(e.to_string()))
        }

        fn id_filter(id: &str) -> (&'static str, String) {
            ("id", format!("eq.{id}"))
        }
    }

    #[async_trait]
    impl RemoteTable for PostgrestTable {
        #[instrument(skip(self))]
        async fn select_all(&self) -> Result<Vec<ListingRow>, RemoteError> {
            self.rows(
                self.client
                    .get(&self.endpoint)
                    .query(&[("select", "*"), ("order", "created_at.desc")]),
            )
            .await
        }

        #[instrument(skip(self))]
        async fn select_by_id(&self, id: &str) -> Result<Option<ListingRow>, RemoteError> {
            let rows = self
                .rows(
                    self.client
                        .get(&self.endpoint)
                        .query(&[("select", "*".to_string()), Self::id_filter(id)]),
                )
                .await?;
            Ok(rows.into_iter().next())
        }

        #[instrument(skip(self, row), fields(id = %row.id))]
        async fn insert(&self, row: ListingRow) -> Result<ListingRow, RemoteError> {
            let id = row.id.clone();
            let rows = self
                .rows(
                    self.client
                        .post(&self.endpoint)
                        .header("Prefer", "return=representation")
                        .json(&row),
                )
                .await?;
            debug!(returned = rows.len(), "insert acknowledged");
            rows.into_iter()
                .next()
                .ok_or_else(|| RemoteError::Decode(format!("insert of {id} returned no row")))
        }

        #[instrument(skip(self, row))]
        async fn update(&self, id: &str, row: ListingRow) -> Result<ListingRow, RemoteError> {
            let rows = self
                .rows(
                    self.client
                        .patch(&self.endpoint)
                        .query(&[Self::id_filter(id)])
                        .header("Prefer", "return=representation")
                        .json(&row),
                )
                .await?;
            rows.into_iter()
                .next()
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))
        }

        #[instrument(skip(self))]
        async fn delete(&self, id: &str) -> Result<(), RemoteError> {
            let rows = self
                .rows(
                    self.client
                        .delete(&self.endpoint)
                        .query(&[Self::id_filter(id)])
                        .header("Prefer", "return=representation"),
                )
                .await?;
            if rows.is_empty() {
                return Err(RemoteError::NotFound(id.to_string()));
            }
            Ok(())
        }
    }

    /// Object-storage bucket client (`/storage/v1/object/{bucket}`).
    pub struct StorageBucket {
        client: Client,
        base_url: ValidatedUrl,
        bucket: String,
        api_key: SecretString,
        timeout: Duration,
    }

    impl StorageBucket {
        pub fn new(
            base_url: ValidatedUrl,
            bucket: impl Into<String>,
            api_key: SecretString,
            timeout: Duration,
        ) -> Result<Self, RemoteError> {
            Ok(Self {
                client: build_client(timeout)?,
                base_url,
                bucket: bucket.into(),
                api_key,
                timeout,
            })
        }

        #[must_use]
        pub fn public_url(&self, path: &str) -> String {
            self.base_url
                .join(&["storage", "v1", "object", "public", &self.bucket, path])
        }
    }

    #[async_trait]
    impl ImageUploader for StorageBucket {
        #[instrument(skip(self, bytes), fields(size = bytes.len()))]
        async fn upload(&self, path: &str, mime: &str, bytes: Bytes) -> Result<String, RemoteError> {
            let url = self
                .base_url
                .join(&["storage", "v1", "object", &self.bucket, path]);
            let key = self.api_key.expose_secret();
            let response = self
                .client
                .post(url)
                .header("apikey", key.as_str())
                .bearer_auth(key)
                .header("Content-Type", mime)
                .header("x-upsert", "true")
                .body(bytes)
                .send()
                .await
                .map_err(|e| match map_transport(&e, self.timeout) {
                    RemoteError::Network(reason) => RemoteError::Upload {
                        path: path.to_string(),
                        reason,
                    },
                    other => other,
                })?;
            check_status(response).await?;
            Ok(self.public_url(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_public_https_and_strips_trailing_slash() {
        let url = ValidatedUrl::new("https://project.supabase.co/").unwrap();
        assert_eq!(url.as_str(), "https://project.supabase.co");
        assert_eq!(url.host(), "project.supabase.co");
        assert_eq!(
            url.join(&["rest", "v1", "listings"]),
            "https://project.supabase.co/rest/v1/listings"
        );
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(ValidatedUrl::new("").is_err());
        assert!(ValidatedUrl::new("ftp://example.com").is_err());
        assert!(ValidatedUrl::new("not a url").is_err());
        assert!(ValidatedUrl::new("https://user:pw@example.com").is_err());
    }

    #[test]
    fn blocks_private_hosts_unless_allowed() {
        for url in [
            "http://localhost:54321",
            "http://127.0.0.1",
            "http://10.1.2.3",
            "http://192.168.0.10",
            "http://172.20.0.1",
            "http://169.254.169.254",
            "http://[::1]",
            "http://[fd00::1]",
            "http://db.internal",
        ] {
            assert!(
                matches!(
                    ValidatedUrl::new(url),
                    Err(HttpError::PrivateNetworkBlocked { .. })
                ),
                "{url} should be blocked"
            );
        }
        assert!(ValidatedUrl::with_policy("http://localhost:54321", true).is_ok());
        assert!(ValidatedUrl::new("http://172.32.0.1").is_ok());
    }

    #[test]
    fn long_urls_are_truncated_in_errors() {
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        match ValidatedUrl::new(long) {
            Err(HttpError::InvalidUrl { url, .. }) => assert!(url.len() <= 103),
            other => panic!("unexpected {other:?}"),
        }
    }
}
