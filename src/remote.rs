//! Remote collection client.
//!
//! [`RemoteCollection`] is the seam between the pipelines and the network:
//! collection info, paginated change listing, single record fetch and batch
//! writes. [`KintoClient`] implements it over HTTP for a Kinto server.
//!
//! # Wire Mapping
//!
//! | Operation | Request | Result |
//! |-----------|---------|--------|
//! | `info` | `GET /buckets/{b}/collections/{c}` | `data.last_modified` |
//! | `list_changes` | `GET .../records?_since=&_limit=&_sort=last_modified` | records, `ETag`, `Next-Page` |
//! | `get_record` | `GET .../records/{id}` | record, 404 → `None` |
//! | `batch_write` | `POST /batch` | one sub-response per sub-request |
//!
//! # Error Mapping
//!
//! - Connection failures, timeouts, 408, 429 and 5xx → `Transport` (retryable)
//! - Other 4xx and undecodable bodies → `Protocol`

use crate::batch::{BatchRequest, BatchResponse};
use crate::config::{AuthConfig, RemoteConfig};
use crate::document::{compare_markers, Checkpoint, Document};
use crate::error::{ReplicationError, Result};
use crate::resilience::RateLimiter;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, ETAG};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Boxed future type for trait object compatibility.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const NEXT_PAGE: &str = "Next-Page";

/// Collection metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub last_modified: Option<String>,
}

/// One page of remote changes, sorted ascending by marker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesPage {
    pub documents: Vec<Document>,
    /// Collection marker reported with the page (the `ETag`).
    pub last_modified: Option<String>,
    pub has_more: bool,
}

impl ChangesPage {
    pub fn new(documents: Vec<Document>, last_modified: Option<String>, has_more: bool) -> Self {
        Self {
            documents,
            last_modified,
            has_more,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Highest marker among the page's documents.
    pub fn max_document_marker(&self) -> Option<String> {
        self.documents
            .iter()
            .filter_map(Document::marker)
            .max_by(|a, b| compare_markers(a, b))
    }

    /// Where the checkpoint may move once this page is imported.
    ///
    /// While more pages follow, only the documents actually seen count. On the
    /// last page the collection marker wins, falling back to the documents.
    pub fn checkpoint_candidate(&self) -> Option<Checkpoint> {
        let marker = if self.has_more {
            self.max_document_marker()
        } else {
            self.last_modified
                .clone()
                .or_else(|| self.max_document_marker())
        };
        marker.map(Checkpoint::at)
    }
}

/// The remote end of a replication.
///
/// Every call is a suspension point; dropping the returned future aborts it.
pub trait RemoteCollection: Send + Sync + 'static {
    /// Cheap metadata fetch.
    fn info(&self) -> BoxFuture<'_, Result<RemoteInfo>>;

    /// Changes strictly after `since`, ascending, at most `limit`.
    fn list_changes<'a>(
        &'a self,
        since: &'a Checkpoint,
        limit: usize,
    ) -> BoxFuture<'a, Result<ChangesPage>>;

    /// A single record, `None` if it does not exist.
    fn get_record<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Document>>>;

    /// One round trip carrying every request; responses come back in order.
    fn batch_write<'a>(
        &'a self,
        requests: &'a [BatchRequest],
    ) -> BoxFuture<'a, Result<Vec<BatchResponse>>>;

    /// Long-poll request: wait up to `heartbeat` for changes after `since`.
    ///
    /// The default waits out the heartbeat and then lists changes. Remotes that
    /// can hold a request open server-side override this.
    fn poll_changes<'a>(
        &'a self,
        since: &'a Checkpoint,
        limit: usize,
        heartbeat: Duration,
    ) -> BoxFuture<'a, Result<ChangesPage>> {
        Box::pin(async move {
            tokio::time::sleep(heartbeat).await;
            self.list_changes(since, limit).await
        })
    }
}

/// Strip weak prefix and quotes from an `ETag` value.
///
/// `"\"1500\""` → `Some("1500")`, `W/"12"` → `Some("12")`, blank → `None`.
pub fn parse_etag(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    let marker = trimmed.trim_matches('"').trim();
    (!marker.is_empty()).then(|| marker.to_string())
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct BatchEnvelope {
    responses: Vec<BatchResponse>,
}

/// HTTP client for a Kinto collection.
pub struct KintoClient {
    http: reqwest::Client,
    config: RemoteConfig,
    /// Static headers plus authorization, also sent as batch defaults.
    default_headers: serde_json::Map<String, Value>,
    limiter: Option<RateLimiter>,
}

impl KintoClient {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut default_headers = serde_json::Map::new();

        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ReplicationError::Config(format!("invalid header {}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| ReplicationError::Config(format!("invalid header {}: {}", name, e)))?;
            headers.insert(header_name, header_value);
            default_headers.insert(name.clone(), Value::String(value.clone()));
        }

        if let Some(mut auth) = authorization_header(&config.auth)? {
            if let Ok(rendered) = auth.to_str() {
                default_headers.insert(AUTHORIZATION.to_string(), Value::String(rendered.to_string()));
            }
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout_duration())
            .default_headers(headers)
            .build()
            .map_err(|e| ReplicationError::Config(format!("failed to build HTTP client: {}", e)))?;

        let limiter = config.rate_limit_config().map(RateLimiter::new);

        Ok(Self {
            http,
            config,
            default_headers,
            limiter,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let start = Instant::now();
        let result = request.send().await;
        crate::metrics::record_remote_latency(operation, start.elapsed());

        let response = result.map_err(|e| {
            let err = ReplicationError::from_http(operation, e);
            crate::metrics::record_remote_error(operation, &err.kind().to_string());
            err
        })?;

        Ok(response)
    }

    fn check_status(operation: &str, response: &Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let err = if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            ReplicationError::transport(operation, format!("server answered {}", status))
        } else {
            ReplicationError::Protocol(format!("{}: server answered {}", operation, status))
        };
        crate::metrics::record_remote_error(operation, &err.kind().to_string());
        Err(err)
    }

    async fn decode<T: serde::de::DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ReplicationError::from_http(operation, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ReplicationError::Protocol(format!("{}: invalid body: {}", operation, e)))
    }

    #[instrument(skip(self), fields(collection = %self.config.collection))]
    async fn fetch_info(&self) -> Result<RemoteInfo> {
        let response = self
            .send("info", self.http.get(self.config.collection_url()))
            .await?;
        Self::check_status("info", &response)?;

        let etag = header_marker(&response);
        let body: DataEnvelope<Value> = Self::decode("info", response).await?;
        let last_modified = match body.data.get("last_modified") {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) => Some(s.clone()),
            _ => etag,
        };

        Ok(RemoteInfo { last_modified })
    }

    #[instrument(skip(self, since), fields(since = ?since.marker()))]
    async fn fetch_changes(&self, since: &Checkpoint, limit: usize) -> Result<ChangesPage> {
        let mut query: Vec<(&str, String)> = vec![
            ("_sort", "last_modified".to_string()),
            ("_limit", limit.to_string()),
        ];
        if let Some(marker) = since.marker() {
            query.push(("_since", marker.to_string()));
        }
        if let Some(excluded) = self.config.exclude_filter() {
            query.push(("exclude_id", excluded));
        }
        if let Some(expected) = self.config.expected_timestamp {
            query.push(("_expected", expected.to_string()));
        }

        let response = self
            .send(
                "list_changes",
                self.http.get(self.config.records_url()).query(&query),
            )
            .await?;
        Self::check_status("list_changes", &response)?;

        let last_modified = header_marker(&response);
        let has_more = response.headers().contains_key(NEXT_PAGE);
        let body: DataEnvelope<Vec<Value>> = Self::decode("list_changes", response).await?;

        let documents = body
            .data
            .into_iter()
            .map(Document::from_remote)
            .collect::<Result<Vec<_>>>()?;

        debug!(documents = documents.len(), has_more, ?last_modified, "Listed changes");
        Ok(ChangesPage {
            documents,
            last_modified,
            has_more,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_record(&self, id: &str) -> Result<Option<Document>> {
        let url = format!("{}/{}", self.config.records_url(), id);
        let response = self.send("get_record", self.http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status("get_record", &response)?;

        let body: DataEnvelope<Value> = Self::decode("get_record", response).await?;
        Document::from_remote(body.data).map(Some)
    }

    #[instrument(skip(self, requests), fields(requests = requests.len()))]
    async fn send_batch(&self, requests: &[BatchRequest]) -> Result<Vec<BatchResponse>> {
        let payload = json!({
            "defaults": { "headers": Value::Object(self.default_headers.clone()) },
            "requests": requests,
        });

        let response = self
            .send("batch_write", self.http.post(self.config.batch_url()).json(&payload))
            .await?;
        Self::check_status("batch_write", &response)?;

        let body: BatchEnvelope = Self::decode("batch_write", response).await?;
        if body.responses.len() != requests.len() {
            warn!(
                sent = requests.len(),
                received = body.responses.len(),
                "Batch response count mismatch"
            );
        }
        Ok(body.responses)
    }
}

impl RemoteCollection for KintoClient {
    fn info(&self) -> BoxFuture<'_, Result<RemoteInfo>> {
        Box::pin(self.fetch_info())
    }

    fn list_changes<'a>(
        &'a self,
        since: &'a Checkpoint,
        limit: usize,
    ) -> BoxFuture<'a, Result<ChangesPage>> {
        Box::pin(self.fetch_changes(since, limit))
    }

    fn get_record<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(self.fetch_record(id))
    }

    fn batch_write<'a>(
        &'a self,
        requests: &'a [BatchRequest],
    ) -> BoxFuture<'a, Result<Vec<BatchResponse>>> {
        Box::pin(self.send_batch(requests))
    }
}

impl std::fmt::Debug for KintoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KintoClient")
            .field("url", &self.config.url)
            .field("bucket", &self.config.bucket)
            .field("collection", &self.config.collection)
            .finish()
    }
}

fn header_marker(response: &Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_etag)
}

/// Render the `Authorization` header for the configured credentials.
fn authorization_header(auth: &AuthConfig) -> Result<Option<HeaderValue>> {
    // reqwest renders the credentials; the request itself is never sent.
    let builder = match auth {
        AuthConfig::None => return Ok(None),
        AuthConfig::Basic { username, password } => reqwest::Client::new()
            .get("http://localhost/")
            .basic_auth(username, Some(password)),
        AuthConfig::Bearer { token } => reqwest::Client::new()
            .get("http://localhost/")
            .bearer_auth(token),
    };

    let request = builder
        .build()
        .map_err(|e| ReplicationError::Config(format!("invalid credentials: {}", e)))?;
    Ok(request.headers().get(AUTHORIZATION).cloned())
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-process remote for pipeline tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockRemote {
        pub pages: Mutex<VecDeque<Result<ChangesPage>>>,
        pub polls: Mutex<VecDeque<Result<ChangesPage>>>,
        pub batches: Mutex<VecDeque<Result<Vec<BatchResponse>>>>,
        pub info_result: Mutex<Option<Result<RemoteInfo>>>,
        pub list_calls: Mutex<Vec<Checkpoint>>,
        pub batch_calls: Mutex<Vec<Vec<BatchRequest>>>,
        pub info_calls: Mutex<usize>,
    }

    impl MockRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_page(&self, page: Result<ChangesPage>) {
            self.pages.lock().unwrap().push_back(page);
        }

        pub fn push_poll(&self, page: Result<ChangesPage>) {
            self.polls.lock().unwrap().push_back(page);
        }

        pub fn push_batch(&self, responses: Result<Vec<BatchResponse>>) {
            self.batches.lock().unwrap().push_back(responses);
        }

        pub fn set_info(&self, info: Result<RemoteInfo>) {
            *self.info_result.lock().unwrap() = Some(info);
        }
    }

    impl RemoteCollection for MockRemote {
        fn info(&self) -> BoxFuture<'_, Result<RemoteInfo>> {
            *self.info_calls.lock().unwrap() += 1;
            let result = self
                .info_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(RemoteInfo::default()));
            Box::pin(async move { result })
        }

        fn list_changes<'a>(
            &'a self,
            since: &'a Checkpoint,
            _limit: usize,
        ) -> BoxFuture<'a, Result<ChangesPage>> {
            self.list_calls.lock().unwrap().push(since.clone());
            let page = self
                .pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ChangesPage::empty()));
            Box::pin(async move { page })
        }

        fn get_record<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
            Box::pin(async { Ok(None) })
        }

        fn batch_write<'a>(
            &'a self,
            requests: &'a [BatchRequest],
        ) -> BoxFuture<'a, Result<Vec<BatchResponse>>> {
            self.batch_calls.lock().unwrap().push(requests.to_vec());
            let next = self.batches.lock().unwrap().pop_front();
            let result = next.unwrap_or_else(|| {
                Ok(requests
                    .iter()
                    .map(|r| BatchResponse::new(200, r.path.clone(), Value::Null))
                    .collect())
            });
            Box::pin(async move { result })
        }

        fn poll_changes<'a>(
            &'a self,
            _since: &'a Checkpoint,
            _limit: usize,
            heartbeat: Duration,
        ) -> BoxFuture<'a, Result<ChangesPage>> {
            let next = self.polls.lock().unwrap().pop_front();
            Box::pin(async move {
                match next {
                    Some(result) => result,
                    None => {
                        tokio::time::sleep(heartbeat).await;
                        Ok(ChangesPage::empty())
                    }
                }
            })
        }
    }
}
