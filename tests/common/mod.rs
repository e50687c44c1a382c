//! Shared fixtures: an in-memory streaming service behind the `HttpClient`
//! seam, and a counting metrics recorder.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use snowpipe_stream::transport::{HttpClientError, HttpRequest, HttpResponse, Method, ResponseFuture};
use snowpipe_stream::{
    ClientConfig, HttpClient, KeySource, MetricsErrorKind, MetricsRecorder, StreamingClient,
};

pub const PKCS8_PEM: &[u8] = include_bytes!("../fixtures/rsa_pkcs8.pem");

/// Endpoint families of the fake service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Hostname,
    Open,
    Insert,
    Status,
    Close,
}

/// Injected response replacing the normal handling of one request.
#[derive(Debug, Clone)]
pub enum Fault {
    Status(u16, &'static str),
    Disconnect,
    Hang,
}

/// A request as seen by the fake service.
#[derive(Debug, Clone)]
pub struct Seen {
    pub route: Route,
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub token_type: Option<String>,
    pub continuation: Option<String>,
    pub body: Option<Value>,
}

#[derive(Default)]
struct Channel {
    continuation: String,
    scoped_token: String,
    rows: u64,
    inserts: u64,
}

#[derive(Default)]
struct State {
    seen: Vec<Seen>,
    faults: HashMap<Route, VecDeque<Fault>>,
    channels: HashMap<String, Channel>,
    opens: u64,
    tokens_issued: u64,
    token_padding: usize,
}

/// In-memory streaming service.
///
/// Every insert must present the continuation token most recently issued for
/// its channel (by open or by the previous accepted insert); a stale token is
/// answered with 400, as the platform does.
#[derive(Default)]
pub struct FakeService {
    state: Mutex<State>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `faults` for the next requests on `route`, in order.
    pub fn fail(&self, route: Route, faults: impl IntoIterator<Item = Fault>) {
        self.state
            .lock()
            .unwrap()
            .faults
            .entry(route)
            .or_default()
            .extend(faults);
    }

    /// Queues `count` responses with `status` on `route`.
    pub fn fail_status(&self, route: Route, status: u16, count: usize) {
        self.fail(route, std::iter::repeat(Fault::Status(status, "injected")).take(count));
    }

    /// Lengthens every continuation token issued by later opens by `len` bytes.
    pub fn pad_continuation_tokens(&self, len: usize) {
        self.state.lock().unwrap().token_padding = len;
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.state.lock().unwrap().seen.clone()
    }

    pub fn seen_on(&self, route: Route) -> Vec<Seen> {
        self.seen().into_iter().filter(|s| s.route == route).collect()
    }

    pub fn rows(&self, channel: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(channel)
            .map_or(0, |c| c.rows)
    }

    pub fn opens(&self) -> u64 {
        self.state.lock().unwrap().opens
    }

    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, Fault> {
        let path = request.url().path().to_owned();
        let route = route_of(request.method(), &path);
        let body = request
            .body()
            .map(|b| serde_json::from_slice::<Value>(b).unwrap());

        let mut state = self.state.lock().unwrap();
        state.seen.push(Seen {
            route,
            method: request.method(),
            path: path.clone(),
            authorization: request.header_value("Authorization").map(str::to_owned),
            token_type: request
                .header_value("X-Snowflake-Authorization-Token-Type")
                .map(str::to_owned),
            continuation: request
                .header_value("X-Snowflake-Continuation-Token")
                .map(str::to_owned),
            body: body.clone(),
        });

        if let Some(fault) = state.faults.get_mut(&route).and_then(VecDeque::pop_front) {
            return match fault {
                Fault::Status(status, text) => Ok(HttpResponse::new(status, text)),
                other => Err(other),
            };
        }

        let response = match route {
            Route::Hostname => HttpResponse::new(200, "Control_Host.Example.Test"),
            Route::Open => {
                let body = body.unwrap_or_default();
                let name = body["channel_name"].as_str().unwrap_or_default().to_owned();
                state.opens += 1;
                state.tokens_issued += 1;
                let n = state.tokens_issued;
                let padding = "x".repeat(state.token_padding);
                let channel = state.channels.entry(name).or_default();
                channel.continuation = format!("open-{n}{padding}");
                channel.scoped_token = format!("scoped-{n}");
                HttpResponse::new(
                    200,
                    json!({
                        "ingest_host": "ingest.example.test",
                        "scoped_token": channel.scoped_token,
                        "next_continuation_token": channel.continuation,
                    })
                    .to_string(),
                )
            }
            Route::Insert => {
                let name = channel_from_insert_path(&path);
                let Some(channel) = state.channels.get_mut(&name) else {
                    return Ok(HttpResponse::new(404, "no such channel"));
                };
                let bearer = request.header_value("Authorization").unwrap_or_default();
                if bearer != format!("Bearer {}", channel.scoped_token) {
                    return Ok(HttpResponse::new(401, "scoped token rejected"));
                }
                let presented = request
                    .header_value("X-Snowflake-Continuation-Token")
                    .unwrap_or_default();
                if presented != channel.continuation {
                    return Ok(HttpResponse::new(400, "stale continuation token"));
                }
                let body = body.unwrap_or_default();
                let rows = body["rows"].as_array().map_or(0, Vec::len) as u64;
                channel.rows += rows;
                channel.inserts += 1;
                channel.continuation = format!("{}-i{}", channel.continuation, channel.inserts);
                HttpResponse::new(
                    200,
                    json!({ "next_continuation_token": channel.continuation }).to_string(),
                )
            }
            Route::Status => {
                let body = body.unwrap_or_default();
                let name = body["channel_names"][0].as_str().unwrap_or_default().to_owned();
                let rows = state.channels.get(&name).map_or(0, |c| c.rows);
                let mut statuses = serde_json::Map::new();
                statuses.insert(
                    name.to_uppercase(),
                    json!({
                        "channel_status_code": "SUCCESS",
                        "rows_inserted_count": rows,
                        "rows_error_count": 0,
                    }),
                );
                HttpResponse::new(
                    200,
                    json!({ "channel_statuses": statuses }).to_string(),
                )
            }
            Route::Close => HttpResponse::new(200, "{}"),
        };
        Ok(response)
    }
}

impl HttpClient for FakeService {
    fn send(&self, request: HttpRequest) -> ResponseFuture<'_> {
        let outcome = self.handle(&request);
        Box::pin(async move {
            match outcome {
                Ok(response) => Ok(response),
                Err(Fault::Disconnect) => Err(HttpClientError::Connect("reset by peer".into())),
                Err(Fault::Hang) => std::future::pending().await,
                Err(Fault::Status(..)) => unreachable!(),
            }
        })
    }
}

fn route_of(method: Method, path: &str) -> Route {
    match method {
        Method::Get => Route::Hostname,
        Method::Delete => Route::Close,
        Method::Post if path.ends_with(":open-channel") => Route::Open,
        Method::Post if path.ends_with(":insert-rows") => Route::Insert,
        Method::Post => Route::Status,
    }
}

fn channel_from_insert_path(path: &str) -> String {
    let last = path.rsplit('/').next().unwrap_or_default();
    last.trim_end_matches(":insert-rows").to_owned()
}

/// Counts everything the client reports.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub minted: AtomicU64,
    pub retries: AtomicU64,
    pub inserted_rows: AtomicU64,
    pub errors: Mutex<HashMap<MetricsErrorKind, u64>>,
}

impl CountingMetrics {
    pub fn errors_of(&self, kind: MetricsErrorKind) -> u64 {
        self.errors.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }
}

impl MetricsRecorder for CountingMetrics {
    fn record_token_minted(&self) {
        self.minted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self, _operation: &'static str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_insert(&self, rows: usize, _bytes: usize) {
        self.inserted_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        *self.errors.lock().unwrap().entry(kind).or_insert(0) += 1;
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::new(
        "myorg-acct",
        "ingest_user",
        "unused.pem",
        "DB.PUBLIC.EVENTS_PIPE".parse().unwrap(),
    )
    .with_retry(4, Duration::from_millis(100))
}

pub fn client(service: &Arc<FakeService>, config: ClientConfig) -> StreamingClient {
    StreamingClient::builder(config)
        .signing_key(KeySource::load(PKCS8_PEM, None).unwrap())
        .http_client(service.clone())
        .build()
        .unwrap()
}

pub fn client_with_metrics(
    service: &Arc<FakeService>,
    config: ClientConfig,
    metrics: Arc<CountingMetrics>,
) -> StreamingClient {
    StreamingClient::builder(config)
        .signing_key(KeySource::load(PKCS8_PEM, None).unwrap())
        .http_client(service.clone())
        .metrics(metrics)
        .build()
        .unwrap()
}

pub fn rows(n: usize) -> Vec<Value> {
    (0..n).map(|i| json!({ "id": i, "name": format!("row-{i}") })).collect()
}
