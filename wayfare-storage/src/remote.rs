//! Remote data store boundary.
//!
//! The cache never talks to the network itself. Reads go through a
//! [`RemoteStore`], which the REST client below implements against a
//! PostgREST-style endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use wayfare_core::{FetchError, RemoteSettings, Row};

/// Read access to the remote data store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every row of `table`.
    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>, FetchError>;

    /// The row of `table` whose `id` equals `id`, if any.
    async fn fetch_by_id(&self, table: &str, id: &Value) -> Result<Option<Row>, FetchError>;

    /// The `limit` rows of `table` with the highest `field`, descending.
    async fn fetch_top_n(
        &self,
        table: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<Row>, FetchError>;
}

/// `reqwest` client for a PostgREST-style REST endpoint.
#[derive(Clone)]
pub struct RestRemoteStore {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl RestRemoteStore {
    pub fn new(settings: &RemoteSettings) -> Result<Self, FetchError> {
        if settings.base_url.trim().is_empty() {
            return Err(FetchError::NotConfigured);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(transport)?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            headers: build_auth_headers(settings.api_key.as_deref())?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn get_rows(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<Row>, FetchError> {
        let response = self
            .client
            .get(self.table_url(table))
            .headers(self.headers.clone())
            .query(&[("select", "*")])
            .query(query)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response.json::<Vec<Row>>().await.map_err(|e| FetchError::Decode {
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>, FetchError> {
        self.get_rows(table, &[]).await
    }

    async fn fetch_by_id(&self, table: &str, id: &Value) -> Result<Option<Row>, FetchError> {
        let rows = self
            .get_rows(
                table,
                &[("id", format!("eq.{}", filter_literal(id))), ("limit", "1".to_string())],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_top_n(
        &self,
        table: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<Row>, FetchError> {
        self.get_rows(
            table,
            &[("order", format!("{}.desc", field)), ("limit", limit.to_string())],
        )
        .await
    }
}

/// Render an id for a PostgREST `eq.` filter. Strings go in unquoted.
fn filter_literal(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_auth_headers(api_key: Option<&str>) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = api_key {
        headers.insert(
            HeaderName::from_static("apikey"),
            HeaderValue::from_str(api_key).map_err(invalid_api_key)?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(invalid_api_key)?,
        );
    }
    Ok(headers)
}

fn transport(e: reqwest::Error) -> FetchError {
    FetchError::Transport {
        reason: e.to_string(),
    }
}

fn invalid_api_key(e: reqwest::header::InvalidHeaderValue) -> FetchError {
    FetchError::InvalidConfig {
        field: "remote.api_key".to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_base_url_is_not_configured() {
        let settings = RemoteSettings {
            base_url: "  ".to_string(),
            ..RemoteSettings::default()
        };
        assert!(matches!(
            RestRemoteStore::new(&settings),
            Err(FetchError::NotConfigured)
        ));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let settings = RemoteSettings {
            base_url: "http://localhost:54321/".to_string(),
            ..RemoteSettings::default()
        };
        let store = RestRemoteStore::new(&settings).unwrap();
        assert_eq!(store.base_url(), "http://localhost:54321");
        assert_eq!(
            store.table_url("destinations"),
            "http://localhost:54321/rest/v1/destinations"
        );
    }

    #[test]
    fn test_auth_headers() {
        let headers = build_auth_headers(Some("anon-key")).unwrap();
        assert_eq!(headers.get("apikey").unwrap(), "anon-key");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer anon-key");
        assert!(build_auth_headers(None).unwrap().is_empty());
        assert!(matches!(
            build_auth_headers(Some("bad\nkey")),
            Err(FetchError::InvalidConfig { ref field, .. }) if field == "remote.api_key"
        ));
    }

    #[test]
    fn test_unusable_api_key_is_a_config_error() {
        let settings = RemoteSettings {
            base_url: "http://localhost:54321".to_string(),
            api_key: Some("line\r\nbreak".to_string()),
            request_timeout_ms: 500,
        };
        let Err(err) = RestRemoteStore::new(&settings) else {
            panic!("header-unsafe api key accepted");
        };
        assert!(matches!(err, FetchError::InvalidConfig { .. }));
        assert!(err.to_string().contains("remote.api_key"));
    }

    #[test]
    fn test_filter_literal() {
        assert_eq!(filter_literal(&json!("abc")), "abc");
        assert_eq!(filter_literal(&json!(42)), "42");
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_transport_error() {
        let settings = RemoteSettings {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            request_timeout_ms: 500,
        };
        let store = RestRemoteStore::new(&settings).unwrap();
        let err = store.fetch_all("destinations").await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
    }
}
