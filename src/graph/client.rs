use crate::config::Settings;
use crate::models::TokenResponse;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Retry budget per call, counting the first attempt.
const MAX_ATTEMPTS: u32 = 6;

/// Backoff ceiling when the server does not name a delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Errors raised by the gateway client.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("remote resource not found: {0}")]
    NotFound(String),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GraphError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound(_))
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Authenticated HTTP/JSON transport for the remote mail API.
///
/// One instance is shared by all pipeline tasks of an invocation; the
/// cached bearer token lives behind an async mutex.
pub struct GraphClient {
    http: reqwest::Client,
    token_url: String,
    api_endpoint: String,
    /// Version segment of the endpoint (e.g. `/v1.0`), used to fold
    /// absolute continuation URLs back into relative paths.
    version_marker: String,
    client_id: String,
    client_secret: String,
    scope: String,
    token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    pub fn new(settings: &Settings) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("mailcrawl/0.1")
            .build()
            .map_err(GraphError::Http)?;

        let api_endpoint = settings.api_endpoint.trim_end_matches('/').to_string();
        let version_marker = api_endpoint
            .rfind('/')
            .map(|idx| api_endpoint[idx..].to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(GraphClient {
            http,
            token_url: settings.token_url.clone(),
            api_endpoint,
            version_marker,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scope: settings.api_scope.clone(),
            token: Mutex::new(None),
        })
    }

    /// Exchange client credentials for a bearer token.
    ///
    /// A no-op while a cached token is still valid, unless `force_refresh`
    /// is set. Tokens are cached with a 60-second expiry margin (floor 30s).
    pub async fn authenticate(&self, force_refresh: bool) -> Result<(), GraphError> {
        let mut guard = self.token.lock().await;
        if !force_refresh && guard.as_ref().is_some_and(CachedToken::is_valid) {
            return Ok(());
        }

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| GraphError::Auth(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| GraphError::Auth(format!("invalid token response: {}", e)))?;

        let ttl = payload.expires_in.max(0) as u64;
        let margin = ttl.saturating_sub(60).max(30);
        *guard = Some(CachedToken {
            access_token: payload.access_token,
            expires_at: Instant::now() + Duration::from_secs(margin),
        });

        Ok(())
    }

    async fn bearer_token(&self) -> Result<String, GraphError> {
        {
            let guard = self.token.lock().await;
            if let Some(cached) = guard.as_ref() {
                if cached.is_valid() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        self.authenticate(false).await?;

        let guard = self.token.lock().await;
        guard
            .as_ref()
            .map(|cached| cached.access_token.clone())
            .ok_or_else(|| GraphError::Auth("no token after authentication".to_string()))
    }

    /// Fold an absolute continuation URL back into a relative API path.
    fn normalize_path(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            return match path_or_url.split_once(self.version_marker.as_str()) {
                Some((_, rest)) => rest.to_string(),
                None => "/".to_string(),
            };
        }
        path_or_url.to_string()
    }

    async fn request(
        &self,
        method: Method,
        path_or_url: &str,
        params: &[(String, String)],
    ) -> Result<reqwest::Response, GraphError> {
        let path = self.normalize_path(path_or_url);
        let url = format!("{}{}", self.api_endpoint, path);
        let mut last_transient: Option<(StatusCode, String)> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let token = self.bearer_token().await?;
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                // Immutable identifiers remain stable when items move
                // between folders.
                .header("Prefer", "IdType=\"ImmutableId\"");
            if !params.is_empty() {
                builder = builder.query(params);
            }

            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                self.authenticate(true).await?;
                continue;
            }

            if is_transient_status(status) {
                let wait = retry_delay(&response, attempt);
                let body = response.text().await.unwrap_or_default();
                last_transient = Some((status, body));
                if attempt + 1 < MAX_ATTEMPTS {
                    log::warn!(
                        "remote returned {}, retrying in {:.1}s (attempt {}/{})",
                        status,
                        wait.as_secs_f64(),
                        attempt + 1,
                        MAX_ATTEMPTS
                    );
                    tokio::time::sleep(wait).await;
                }
                continue;
            }

            if status == StatusCode::NOT_FOUND {
                return Err(GraphError::NotFound(path));
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GraphError::Status { status, body });
            }

            return Ok(response);
        }

        let (status, body) =
            last_transient.unwrap_or((StatusCode::SERVICE_UNAVAILABLE, String::new()));
        Err(GraphError::Status {
            status,
            body: format!("retry budget exhausted: {}", body),
        })
    }

    /// GET a JSON document. Accepts a relative path or an absolute
    /// continuation URL as returned in a page body.
    pub async fn get_json(
        &self,
        path_or_url: &str,
        params: &[(String, String)],
    ) -> Result<Value, GraphError> {
        let response = self.request(Method::GET, path_or_url, params).await?;
        let body = response.bytes().await.map_err(GraphError::Http)?;
        let value = serde_json::from_slice(&body)?;
        Ok(value)
    }

    /// GET a raw binary payload.
    pub async fn get_bytes(&self, path_or_url: &str) -> Result<Vec<u8>, GraphError> {
        let response = self.request(Method::GET, path_or_url, &[]).await?;
        let body = response.bytes().await.map_err(GraphError::Http)?;
        Ok(body.to_vec())
    }

    /// Lazy, finite, non-restartable sequence of listing pages, following
    /// the opaque continuation link until absent.
    pub fn paged(&self, path: &str, params: &[(String, String)]) -> Pager<'_> {
        Pager {
            client: self,
            next: Some(PageRequest::First {
                path: path.to_string(),
                params: params.to_vec(),
            }),
        }
    }
}

enum PageRequest {
    First {
        path: String,
        params: Vec<(String, String)>,
    },
    Next(String),
}

/// Cursor over a paginated listing. Each page is fetched on demand.
pub struct Pager<'a> {
    client: &'a GraphClient,
    next: Option<PageRequest>,
}

impl Pager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Value>, GraphError> {
        let Some(request) = self.next.take() else {
            return Ok(None);
        };

        let page = match request {
            PageRequest::First { path, params } => self.client.get_json(&path, &params).await?,
            PageRequest::Next(url) => self.client.get_json(&url, &[]).await?,
        };

        self.next = page
            .get("@odata.nextLink")
            .and_then(Value::as_str)
            .map(|link| PageRequest::Next(link.to_string()));

        Ok(Some(page))
    }
}

/// Statuses worth retrying: rate limiting and transient server failures.
fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Server-supplied retry delay when present (floor 1s), else capped
/// exponential backoff.
fn retry_delay(response: &reqwest::Response, attempt: u32) -> Duration {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok());

    match retry_after {
        Some(seconds) => Duration::from_secs_f64(seconds.max(1.0)),
        None => MAX_BACKOFF.min(Duration::from_secs_f64(2f64.powi(attempt as i32))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(base_url: &str) -> Settings {
        let mut settings = Settings::from_env();
        settings.token_url = format!("{}/token", base_url);
        settings.api_endpoint = format!("{}/v1.0", base_url);
        settings.client_id = "client".to_string();
        settings.client_secret = "secret".to_string();
        settings
    }

    fn token_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "test-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })
    }

    async fn mount_token_endpoint(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn token_is_cached_across_requests() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/ping"))
            .and(header("Authorization", "Bearer test-token"))
            .and(header("Prefer", "IdType=\"ImmutableId\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(2)
            .mount(&server)
            .await;

        let client = GraphClient::new(&test_settings(&server.uri())).unwrap();
        client.get_json("/ping", &[]).await.unwrap();
        client.get_json("/ping", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn refreshes_token_once_on_401() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 2).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/ping"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1.0/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = GraphClient::new(&test_settings(&server.uri())).unwrap();
        let value = client.get_json("/ping", &[]).await.unwrap();
        assert_eq!(value["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn honors_server_supplied_retry_delay() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/slow"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1.0/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = GraphClient::new(&test_settings(&server.uri())).unwrap();
        let started = Instant::now();
        client.get_json("/slow", &[]).await.unwrap();
        assert!(
            started.elapsed() >= Duration::from_secs(2),
            "should have waited at least the server-supplied delay"
        );
    }

    #[tokio::test]
    async fn surfaces_exhausted_retry_budget() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/broken"))
            .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "1"))
            .expect(u64::from(MAX_ATTEMPTS))
            .mount(&server)
            .await;

        let client = GraphClient::new(&test_settings(&server.uri())).unwrap();
        let err = client.get_json("/broken", &[]).await.unwrap_err();
        match err {
            GraphError::Status { status, body } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert!(body.contains("retry budget exhausted"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fails_fast_on_non_retryable_status() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/bad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GraphClient::new(&test_settings(&server.uri())).unwrap();
        let err = client.get_json("/bad", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            GraphError::Status { status, .. } if status == StatusCode::BAD_REQUEST
        ));
    }

    #[tokio::test]
    async fn maps_404_to_not_found() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = GraphClient::new(&test_settings(&server.uri())).unwrap();
        let err = client.get_json("/gone", &[]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pager_follows_absolute_next_links() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 1).await;

        let next_link = format!("{}/v1.0/items?page=2", server.uri());
        Mock::given(method("GET"))
            .and(path("/v1.0/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"id": "b"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1.0/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"id": "a"}],
                "@odata.nextLink": next_link
            })))
            .mount(&server)
            .await;

        let client = GraphClient::new(&test_settings(&server.uri())).unwrap();
        let mut pager = client.paged("/items", &[]);

        let first = pager.next_page().await.unwrap().unwrap();
        assert_eq!(first["value"][0]["id"], serde_json::json!("a"));

        let second = pager.next_page().await.unwrap().unwrap();
        assert_eq!(second["value"][0]["id"], serde_json::json!("b"));

        assert!(pager.next_page().await.unwrap().is_none());
    }
}
