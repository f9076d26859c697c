//! Rate-limited API collector.
//!
//! An [`ApiCollector`] fetches every page of an API listing (once per input
//! when an input iterator is given) through an [`AsyncApiClient`] and stores
//! each parsed message as one raw record tagged with the scope fingerprint.
//!
//! Pagination strategies:
//!
//! - `page_size == 0`: one request per input, no pager.
//! - determined: a `total_pages` resolver runs on the first page; the
//!   remaining pages are then requested concurrently.
//! - undetermined: `concurrency` lanes walk the pages in strides
//!   (lane *i* fetches pages *i+1*, *i+1+c*, ...); a lane stops after a page
//!   that parses to zero items.
//!
//! A non-incremental collection deletes the raw records of its fingerprint
//! before fetching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use handlebars::Handlebars;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use lake_harness_core::fingerprint::Fingerprint;
use lake_harness_core::models::NewRawRecord;
use lake_harness_core::store::Store;

use crate::api_client::{ApiResponse, AsyncApiClient, ResponseHandler};
use crate::error::{PipelineError, Result};
use crate::iterator::InputIterator;

/// Pagination window of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Pager {
    pub page: usize,
    pub skip: usize,
    pub size: usize,
}

impl Pager {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            skip: (page.saturating_sub(1)) * size,
            size,
        }
    }
}

/// Everything a request template or builder can see.
///
/// Serialized in PascalCase for templates: `{{Pager.Page}}`,
/// `{{Params.ProjectId}}`, `{{Input.Id}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestData {
    pub pager: Option<Pager>,
    pub params: Value,
    pub input: Option<Value>,
    /// Lower bound of an incremental collection.
    pub since: Option<DateTime<Utc>>,
}

impl RequestData {
    fn with_page(&self, page: usize) -> Self {
        let mut next = self.clone();
        next.pager = self.pager.map(|p| Pager::new(page, p.size));
        next
    }
}

pub type QueryBuilderFn = dyn Fn(&RequestData) -> Result<Vec<(String, String)>> + Send + Sync;
pub type HeaderBuilderFn = dyn Fn(&RequestData) -> Result<HeaderMap> + Send + Sync;
pub type TotalPagesFn = dyn Fn(&ApiResponse, &RequestData) -> Result<usize> + Send + Sync;
pub type ResponseParserFn = dyn Fn(&ApiResponse) -> Result<Vec<Value>> + Send + Sync;

/// Parse a response whose body is a JSON array of messages.
pub fn parse_json_array(response: &ApiResponse) -> Result<Vec<Value>> {
    match response.json::<Value>()? {
        Value::Array(items) => Ok(items),
        other => Err(PipelineError::malformed(format!(
            "{}: expected a JSON array, got {}",
            response.url,
            json_kind(&other)
        ))),
    }
}

/// Parse the array found at `pointer` (RFC 6901) in a JSON body. A missing
/// or `null` value counts as an empty page.
pub fn parse_json_pointer(response: &ApiResponse, pointer: &str) -> Result<Vec<Value>> {
    let body = response.json::<Value>()?;
    match body.pointer(pointer) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(PipelineError::malformed(format!(
            "{}: expected an array at '{}', got {}",
            response.url,
            pointer,
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Configuration of one collector run.
pub struct ApiCollectorArgs {
    pub plugin: String,
    /// Raw table name without the `_raw_` prefix.
    pub table: String,
    /// Scope options; their canonical form is the fingerprint.
    pub params: Value,
    pub url_template: String,
    pub query: Option<Arc<QueryBuilderFn>>,
    pub header: Option<Arc<HeaderBuilderFn>>,
    /// Items per page; `0` disables pagination.
    pub page_size: usize,
    pub total_pages: Option<Arc<TotalPagesFn>>,
    /// Pages in flight per input for undetermined pagination.
    pub concurrency: Option<usize>,
    pub response_parser: Arc<ResponseParserFn>,
    pub input: Option<Box<dyn InputIterator>>,
    pub incremental: bool,
    /// Whether the API can be asked for records changed since a point in
    /// time. When false every run is a full one.
    pub supports_incremental: bool,
    pub since: Option<DateTime<Utc>>,
}

impl ApiCollectorArgs {
    pub fn new(
        plugin: impl Into<String>,
        table: impl Into<String>,
        params: impl Serialize,
        url_template: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            plugin: plugin.into(),
            table: table.into(),
            params: serde_json::to_value(params)?,
            url_template: url_template.into(),
            query: None,
            header: None,
            page_size: 0,
            total_pages: None,
            concurrency: None,
            response_parser: Arc::new(parse_json_array),
            input: None,
            incremental: false,
            supports_incremental: true,
            since: None,
        })
    }

    pub fn query(
        mut self,
        build: impl Fn(&RequestData) -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    ) -> Self {
        self.query = Some(Arc::new(build));
        self
    }

    pub fn header(
        mut self,
        build: impl Fn(&RequestData) -> Result<HeaderMap> + Send + Sync + 'static,
    ) -> Self {
        self.header = Some(Arc::new(build));
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn total_pages(
        mut self,
        resolve: impl Fn(&ApiResponse, &RequestData) -> Result<usize> + Send + Sync + 'static,
    ) -> Self {
        self.total_pages = Some(Arc::new(resolve));
        self
    }

    pub fn concurrency(mut self, lanes: usize) -> Self {
        self.concurrency = Some(lanes);
        self
    }

    pub fn response_parser(
        mut self,
        parse: impl Fn(&ApiResponse) -> Result<Vec<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.response_parser = Arc::new(parse);
        self
    }

    pub fn input(mut self, input: impl InputIterator + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn supports_incremental(mut self, supported: bool) -> Self {
        self.supports_incremental = supported;
        self
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    /// Full name of the raw table.
    pub fn raw_table(&self) -> String {
        format!("_raw_{}", self.table)
    }
}

#[derive(Clone)]
enum Follow {
    Nothing,
    Determined(Arc<TotalPagesFn>),
    Lane { stride: usize },
}

/// State shared by every request task of one collection.
struct Shared {
    client: AsyncApiClient,
    store: Arc<dyn Store>,
    raw_table: String,
    fingerprint: Fingerprint,
    templates: Handlebars<'static>,
    query: Option<Arc<QueryBuilderFn>>,
    header: Option<Arc<HeaderBuilderFn>>,
    parser: Arc<ResponseParserFn>,
    saved: AtomicU64,
}

const URL_TEMPLATE: &str = "url";

impl Shared {
    fn request_parts(&self, data: &RequestData) -> Result<(String, Vec<(String, String)>, HeaderMap)> {
        let path = self
            .templates
            .render(URL_TEMPLATE, data)
            .map_err(|e| PipelineError::invalid(format!("url template: {}", e)))?;
        let query = match &self.query {
            Some(build) => build(data)?,
            None => Vec::new(),
        };
        let headers = match &self.header {
            Some(build) => build(data)?,
            None => HeaderMap::new(),
        };
        Ok((path, query, headers))
    }

    async fn save(&self, response: &ApiResponse, data: &RequestData) -> Result<usize> {
        let items = (self.parser)(response)?;
        if items.is_empty() {
            return Ok(0);
        }
        let input = match &data.input {
            Some(input) => Some(serde_json::to_vec(input)?),
            None => None,
        };
        let records = items
            .iter()
            .map(|item| {
                Ok(NewRawRecord {
                    params: self.fingerprint.to_string(),
                    data: serde_json::to_vec(item)?,
                    url: response.url.clone(),
                    input: input.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.insert_raw(&self.raw_table, &records).await?;
        self.saved.fetch_add(records.len() as u64, Ordering::SeqCst);
        debug!(url = %response.url, items = records.len(), "saved raw records");
        Ok(records.len())
    }

    /// Schedule a page from inside a running task.
    fn follow_up(self: &Arc<Self>, data: RequestData, follow: Follow) -> Result<()> {
        if self.client.has_error() {
            return Ok(());
        }
        let (path, query, headers) = self.request_parts(&data)?;
        let handler = handler(self.clone(), data, follow);
        self.client.next_tick(path, query, headers, handler);
        Ok(())
    }

    /// Schedule a page from the collector loop, waiting for a free worker.
    async fn submit(self: &Arc<Self>, data: RequestData, follow: Follow) -> Result<()> {
        let (path, query, headers) = self.request_parts(&data)?;
        let handler = handler(self.clone(), data, follow);
        self.client.get_async(path, query, headers, handler).await
    }
}

fn handler(shared: Arc<Shared>, data: RequestData, follow: Follow) -> ResponseHandler {
    Box::new(move |response| {
        async move {
            let count = shared.save(&response, &data).await?;
            match follow {
                Follow::Nothing => {}
                Follow::Determined(total_pages) => {
                    let total = total_pages(&response, &data)?;
                    debug!(url = %response.url, total, "determined page count");
                    for page in 2..=total {
                        shared.follow_up(data.with_page(page), Follow::Nothing)?;
                    }
                }
                Follow::Lane { stride } => {
                    if count > 0 {
                        let page = data.pager.map_or(1, |p| p.page) + stride;
                        shared.follow_up(data.with_page(page), Follow::Lane { stride })?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    })
}

/// What to request for each input. Owned by the collection loop so the
/// loop's future borrows nothing but shareable state.
struct Plan {
    shared: Arc<Shared>,
    params: Value,
    page_size: usize,
    total_pages: Option<Arc<TotalPagesFn>>,
    concurrency: usize,
    since: Option<DateTime<Utc>>,
}

impl Plan {
    async fn feed_inputs(&self, input: &mut dyn InputIterator) -> Result<()> {
        loop {
            // A failed request aborts the run; stop feeding new inputs.
            if self.shared.client.has_error() {
                return Ok(());
            }
            match input.fetch().await? {
                Some(value) => self.exec(Some(value)).await?,
                None => return Ok(()),
            }
        }
    }

    async fn exec(&self, input: Option<Value>) -> Result<()> {
        let base = RequestData {
            pager: None,
            params: self.params.clone(),
            input,
            since: self.since,
        };
        if self.page_size == 0 {
            return self.shared.submit(base, Follow::Nothing).await;
        }

        let first = RequestData {
            pager: Some(Pager::new(1, self.page_size)),
            ..base
        };
        match &self.total_pages {
            Some(total_pages) => {
                self.shared
                    .submit(first, Follow::Determined(total_pages.clone()))
                    .await
            }
            None => {
                let stride = self.concurrency;
                for lane in 0..stride {
                    self.shared
                        .submit(first.with_page(lane + 1), Follow::Lane { stride })
                        .await?;
                }
                Ok(())
            }
        }
    }
}

/// Releases the client's scheduler when a collection ends, however it ends.
struct ReleaseOnDrop(AsyncApiClient);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Collects raw records from a paginated API.
///
/// A collector owns its client for one run: [`execute`](Self::execute)
/// releases the client's scheduler when it returns.
pub struct ApiCollector {
    plan: Plan,
    input: Option<Box<dyn InputIterator>>,
    incremental: bool,
}

impl ApiCollector {
    pub fn new(args: ApiCollectorArgs, client: AsyncApiClient, store: Arc<dyn Store>) -> Result<Self> {
        let fingerprint = Fingerprint::from_params(&args.params)
            .map_err(|e| PipelineError::invalid(e.to_string()))?;
        if args.table.is_empty() {
            return Err(PipelineError::invalid("collector table must not be empty"));
        }
        if args.url_template.is_empty() {
            return Err(PipelineError::invalid("url template must not be empty"));
        }
        if args.page_size == 0 && args.total_pages.is_some() {
            return Err(PipelineError::invalid("total_pages requires a page size"));
        }

        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        templates.register_escape_fn(handlebars::no_escape);
        templates
            .register_template_string(URL_TEMPLATE, &args.url_template)
            .map_err(|e| PipelineError::invalid(format!("url template: {}", e)))?;

        // Stride lanes: a couple per input when iterating, otherwise the pool.
        let concurrency = args
            .concurrency
            .unwrap_or(if args.input.is_some() { 2 } else { client.workers() })
            .max(1);

        let raw_table = args.raw_table();
        // Without a lower bound to send, every run must be a full one.
        let incremental = args.incremental && args.supports_incremental;
        Ok(Self {
            plan: Plan {
                shared: Arc::new(Shared {
                    client,
                    store,
                    raw_table,
                    fingerprint,
                    templates,
                    query: args.query,
                    header: args.header,
                    parser: args.response_parser,
                    saved: AtomicU64::new(0),
                }),
                params: args.params,
                page_size: args.page_size,
                total_pages: args.total_pages,
                concurrency,
                since: args.since,
            },
            input: args.input,
            incremental,
        })
    }

    pub fn raw_table(&self) -> &str {
        &self.plan.shared.raw_table
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.plan.shared.fingerprint
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Run the collection to completion. Returns the number of raw records
    /// written.
    pub async fn execute(self) -> Result<u64> {
        let Self {
            plan,
            input,
            incremental,
        } = self;
        let shared = plan.shared.clone();
        let _release = ReleaseOnDrop(shared.client.clone());

        shared.store.ensure_raw_table(&shared.raw_table).await?;
        if !incremental {
            let deleted = shared
                .store
                .delete_raw(&shared.raw_table, shared.fingerprint.as_str())
                .await?;
            debug!(table = %shared.raw_table, deleted, "flushed raw records");
        }
        info!(
            table = %shared.raw_table,
            fingerprint = %shared.fingerprint,
            incremental,
            since = ?plan.since,
            "collecting"
        );

        let fed = match input {
            Some(mut input) => {
                let fed = plan.feed_inputs(input.as_mut()).await;
                let closed = input.close().await;
                fed.and(closed)
            }
            None => plan.exec(None).await,
        };

        let drained = shared.client.wait().await;
        fed?;
        drained?;

        let saved = shared.saved.load(Ordering::SeqCst);
        info!(table = %shared.raw_table, records = saved, "collected");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(body: &str) -> ApiResponse {
        ApiResponse {
            status: 200,
            headers: HeaderMap::new(),
            url: "http://example.test/items".into(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn pager_skip_follows_page() {
        assert_eq!(Pager::new(1, 50).skip, 0);
        assert_eq!(Pager::new(3, 50).skip, 100);
    }

    #[test]
    fn request_data_renders_in_templates() {
        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        hb.register_template_string("t", "projects/{{Params.ProjectId}}/issues/{{Input.Id}}?p={{Pager.Page}}")
            .unwrap();
        let data = RequestData {
            pager: Some(Pager::new(2, 10)),
            params: json!({"ConnectionId": 1, "ProjectId": 5}),
            input: Some(json!({"Id": "a&b"})),
            since: None,
        };
        assert_eq!(hb.render("t", &data).unwrap(), "projects/5/issues/a&b?p=2");
    }

    #[test]
    fn parsers_handle_arrays_and_pointers() {
        assert_eq!(parse_json_array(&response("[1, 2]")).unwrap().len(), 2);
        assert!(parse_json_array(&response("{}")).is_err());

        let body = response(r#"{"data": {"items": [{"id": 1}]}, "empty": null}"#);
        assert_eq!(parse_json_pointer(&body, "/data/items").unwrap().len(), 1);
        assert!(parse_json_pointer(&body, "/empty").unwrap().is_empty());
        assert!(parse_json_pointer(&body, "/missing").unwrap().is_empty());
        assert!(parse_json_pointer(&body, "/data").is_err());
    }
}
