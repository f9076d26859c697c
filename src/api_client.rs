//! HTTP client for upstream APIs.
//!
//! [`ApiClient`] resolves request paths against a base endpoint, applies
//! default headers and authentication, and classifies responses.
//! [`AsyncApiClient`] runs requests through a [`WorkerScheduler`] shaped by
//! the API's rate budget.
//!
//! There is no retry at this layer. Rate-limit exhaustion is avoided by
//! pacing, not reported as an error.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{ApiConfig, NotFoundPolicy};
use crate::error::{PipelineError, Result};
use crate::rate_limit::RateLimitCalculator;
use crate::scheduler::WorkerScheduler;

/// Injects credentials into outgoing requests.
pub trait Authenticator: Send + Sync {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder;
}

/// `Authorization: Bearer <token>`.
pub struct BearerToken(pub String);

impl Authenticator for BearerToken {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.0)
    }
}

pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl Authenticator for BasicAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }
}

/// An arbitrary header, e.g. `Private-Token: ...`.
pub struct HeaderAuth {
    pub name: String,
    pub value: String,
}

impl Authenticator for HeaderAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(self.name.as_str(), self.value.as_str())
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub url: String,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            PipelineError::malformed(format!("{}: {}", self.url, e))
        })
    }

    fn body_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(200).collect()
    }
}

/// Verdict of an after-response classifier.
#[derive(Debug)]
pub enum ResponseAction {
    Continue,
    /// Skip this one item; the run goes on.
    Ignore,
    /// Abort the run with this error.
    Fail(PipelineError),
}

pub type AfterResponse = dyn Fn(&ApiResponse) -> ResponseAction + Send + Sync;

/// Default classification: 401 is fatal, 404 follows the not-found policy,
/// any other status of 400 and above is an error.
pub fn default_classify(response: &ApiResponse, not_found: NotFoundPolicy) -> ResponseAction {
    match response.status {
        401 => ResponseAction::Fail(PipelineError::Unauthorized {
            url: response.url.clone(),
        }),
        404 => match not_found {
            NotFoundPolicy::Skip => ResponseAction::Ignore,
            NotFoundPolicy::Fail => ResponseAction::Fail(PipelineError::NotFound {
                url: response.url.clone(),
            }),
        },
        status if status >= 400 => ResponseAction::Fail(PipelineError::HttpStatus {
            status,
            url: response.url.clone(),
            body: response.body_excerpt(),
        }),
        _ => ResponseAction::Continue,
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    auth: Option<Arc<dyn Authenticator>>,
    after_response: Option<Arc<AfterResponse>>,
    not_found: NotFoundPolicy,
}

pub struct ApiClientBuilder {
    endpoint: String,
    headers: HeaderMap,
    auth: Option<Arc<dyn Authenticator>>,
    after_response: Option<Arc<AfterResponse>>,
    proxy: Option<String>,
    timeout: Duration,
    not_found: NotFoundPolicy,
}

impl ApiClientBuilder {
    /// Take timeout, proxy and not-found policy from `[api]`.
    pub fn api_config(mut self, api: &ApiConfig) -> Self {
        self.timeout = Duration::from_secs(api.timeout_secs);
        self.proxy = api.proxy.clone();
        self.not_found = api.not_found;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PipelineError::invalid(format!("header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| PipelineError::invalid(format!("header '{}': {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn auth(mut self, auth: impl Authenticator + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn after_response(
        mut self,
        classify: impl Fn(&ApiResponse) -> ResponseAction + Send + Sync + 'static,
    ) -> Self {
        self.after_response = Some(Arc::new(classify));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn not_found(mut self, policy: NotFoundPolicy) -> Self {
        self.not_found = policy;
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let mut endpoint = self.endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| PipelineError::invalid(format!("endpoint '{}': {}", endpoint, e)))?;

        let mut http = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| PipelineError::invalid(format!("proxy '{}': {}", proxy, e)))?;
            http = http.proxy(proxy);
        }
        let http = http.build().map_err(|e| PipelineError::Transport {
            url: endpoint.to_string(),
            source: e,
        })?;

        Ok(ApiClient {
            http,
            endpoint,
            headers: self.headers,
            auth: self.auth,
            after_response: self.after_response,
            not_found: self.not_found,
        })
    }
}

impl ApiClient {
    pub fn builder(endpoint: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder {
            endpoint: endpoint.into(),
            headers: HeaderMap::new(),
            auth: None,
            after_response: None,
            proxy: None,
            timeout: Duration::from_secs(10),
            not_found: NotFoundPolicy::Skip,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Resolve `path` against the endpoint. Absolute URLs pass through.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| PipelineError::invalid(format!("path '{}': {}", path, e)))
    }

    /// Send a GET and read the whole body. Only transport failures are
    /// errors here; status codes are left to [`classify`](Self::classify).
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &HeaderMap,
    ) -> Result<ApiResponse> {
        let url = self.resolve(path)?;
        let url_str = url.to_string();
        debug!(url = %url_str, ?query, "GET");

        let mut request = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .headers(headers.clone())
            .query(query);
        if let Some(auth) = &self.auth {
            request = auth.apply(request);
        }

        let transport = |source: reqwest::Error| PipelineError::Transport {
            url: url_str.clone(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let final_url = response.url().to_string();
        let body = response.bytes().await.map_err(transport)?;

        Ok(ApiResponse {
            status,
            headers: response_headers,
            url: final_url,
            body: body.to_vec(),
        })
    }

    pub fn classify(&self, response: &ApiResponse) -> ResponseAction {
        match &self.after_response {
            Some(classify) => classify(response),
            None => default_classify(response, self.not_found),
        }
    }
}

/// Handler invoked with a response the classifier let through.
pub type ResponseHandler = Box<dyn FnOnce(ApiResponse) -> BoxFuture<'static, Result<()>> + Send>;

/// [`ApiClient`] with scheduled, rate-paced execution.
#[derive(Clone)]
pub struct AsyncApiClient {
    client: Arc<ApiClient>,
    scheduler: WorkerScheduler,
}

impl AsyncApiClient {
    /// Size a scheduler from the rate budget. When the calculator wants a
    /// header sample, one request to the endpoint root is made to read the header.
    pub async fn new(
        client: ApiClient,
        calculator: &RateLimitCalculator,
        worker_override: Option<usize>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let sample = if calculator.wants_header_sample() {
            match client.get("", &[], &HeaderMap::new()).await {
                Ok(response) => Some(response.headers),
                Err(err) => {
                    warn!(error = %err, "rate limit sample request failed, using static rate");
                    None
                }
            }
        } else {
            None
        };
        let budget = calculator.budget(sample.as_ref());
        let tick = budget.tick_interval()?;
        let workers = worker_override.unwrap_or_else(|| budget.workers());
        info!(
            endpoint = client.endpoint(),
            workers,
            requests = budget.requests,
            window_secs = budget.window.as_secs(),
            tick_ms = tick.as_millis() as u64,
            "creating scheduler for api"
        );
        Ok(Self::with_scheduler(
            client,
            WorkerScheduler::new(workers, Some(tick), cancel),
        ))
    }

    pub fn with_scheduler(client: ApiClient, scheduler: WorkerScheduler) -> Self {
        Self {
            client: Arc::new(client),
            scheduler,
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn scheduler(&self) -> &WorkerScheduler {
        &self.scheduler
    }

    pub fn workers(&self) -> usize {
        self.scheduler.workers()
    }

    /// Request a page and hand the response to `handler`, without blocking
    /// the caller beyond waiting for a free worker.
    pub async fn get_async(
        &self,
        path: String,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        handler: ResponseHandler,
    ) -> Result<()> {
        let task = self.request_task(path, query, headers, handler);
        self.scheduler.submit(task).await
    }

    /// Like [`get_async`](Self::get_async), for calls made from inside a
    /// running task.
    pub fn next_tick(
        &self,
        path: String,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        handler: ResponseHandler,
    ) {
        let task = self.request_task(path, query, headers, handler);
        self.scheduler.next_tick(task);
    }

    fn request_task(
        &self,
        path: String,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        handler: ResponseHandler,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        let client = self.client.clone();
        async move {
            let response = client.get(&path, &query, &headers).await?;
            match client.classify(&response) {
                ResponseAction::Continue => handler(response).await,
                ResponseAction::Ignore => {
                    warn!(url = %response.url, status = response.status, "ignoring response");
                    Ok(())
                }
                ResponseAction::Fail(err) => Err(err),
            }
        }
    }

    pub async fn wait(&self) -> Result<()> {
        self.scheduler.wait().await
    }

    pub fn has_error(&self) -> bool {
        self.scheduler.has_error()
    }

    pub fn release(&self) {
        self.scheduler.release();
    }
}
