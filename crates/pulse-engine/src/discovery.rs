//! Fleet discovery client.
//!
//! Fetches the regional server list over HTTP with conditional caching:
//! ETag revalidation (If-None-Match / 304), Cache-Control max-age, bounded
//! retries for transient failures, and a short negative cache so a broken
//! service is not hammered by back-to-back cycles.
//!
//! Only one request is ever in flight. Starting a new discovery aborts the
//! previous one; a superseded request commits nothing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CACHE_CONTROL, ETAG, HeaderMap, IF_NONE_MATCH};
use tokio::task::AbortHandle;

use pulse_core::config::DiscoveryConfig;
use pulse_core::endpoint::{QosServer, ServerList};

/// Bytes escaped when substituting the fleet id into the URL path.
const FLEET_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`');

/// Where the client currently stands. Purely informational; all behavior
/// flows through [`DiscoveryClient::discover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    NotStarted,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("fleet id is not configured")]
    NoFleet,

    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("discovery request failed: {0}")]
    Network(String),

    #[error("discovery service returned HTTP {0}")]
    Http(u16),

    #[error("discovery response unparseable: {0}")]
    Parse(String),

    #[error("discovery superseded by a newer request")]
    Superseded,

    #[error("discovery failed recently: {0}")]
    RecentFailure(String),
}

impl DiscoveryError {
    /// Network trouble and server-side errors are worth retrying; anything
    /// the client caused is terminal.
    fn retryable(&self) -> bool {
        match self {
            DiscoveryError::Network(_) => true,
            DiscoveryError::Http(status) => *status >= 500,
            _ => false,
        }
    }
}

struct CachedList {
    servers: Arc<Vec<QosServer>>,
    expires_at: Instant,
}

struct State {
    phase: DiscoveryPhase,
    fleet_id: String,
    uri_template: String,
    etag: Option<String>,
    cached: Option<CachedList>,
    failure: Option<(Instant, String)>,
    /// Bumped whenever the in-flight request is replaced or invalidated;
    /// a fetch only commits if its generation is still current.
    generation: u64,
    in_flight: Option<AbortHandle>,
}

/// Retrieves and caches the fleet's QoS server list.
pub struct DiscoveryClient {
    http: reqwest::Client,
    retries: u32,
    failure_cache: Duration,
    success_cache: Duration,
    state: Mutex<State>,
}

impl DiscoveryClient {
    pub fn new(cfg: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_sec))
            .gzip(cfg.use_gzip)
            .build()
            .map_err(|e| DiscoveryError::Client(e.to_string()))?;

        Ok(Self {
            http,
            retries: cfg.request_retries,
            failure_cache: Duration::from_millis(cfg.failure_cache_time_ms),
            success_cache: Duration::from_millis(cfg.success_cache_time_ms),
            state: Mutex::new(State {
                phase: DiscoveryPhase::NotStarted,
                fleet_id: cfg.fleet_id.clone(),
                uri_template: cfg.discovery_service_uri.clone(),
                etag: None,
                cached: None,
                failure: None,
                generation: 0,
                in_flight: None,
            }),
        })
    }

    /// Retrieve the server list: from cache when fresh, over the network
    /// otherwise. Replaces any request already in flight.
    pub async fn discover(&self) -> Result<Arc<Vec<QosServer>>, DiscoveryError> {
        let (generation, url, etag) = {
            let mut state = self.state.lock();

            if let Some(cached) = &state.cached {
                if Instant::now() <= cached.expires_at {
                    let servers = cached.servers.clone();
                    tracing::debug!("discovery served from cache");
                    state.phase = DiscoveryPhase::Done;
                    return Ok(servers);
                }
            }
            if let Some((until, message)) = &state.failure {
                if Instant::now() <= *until {
                    let message = message.clone();
                    state.phase = DiscoveryPhase::Failed;
                    return Err(DiscoveryError::RecentFailure(message));
                }
            }
            if state.fleet_id.is_empty() {
                state.phase = DiscoveryPhase::Failed;
                return Err(DiscoveryError::NoFleet);
            }

            // replace any in-flight request; its result is discarded
            if let Some(previous) = state.in_flight.take() {
                tracing::debug!("superseding in-flight discovery request");
                previous.abort();
            }
            state.generation += 1;
            state.phase = DiscoveryPhase::Running;

            let url = build_url(&state.uri_template, &state.fleet_id);
            (state.generation, url, state.etag.clone())
        };

        let task = tokio::spawn(fetch_servers(self.http.clone(), url, etag, self.retries));
        {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.in_flight = Some(task.abort_handle());
            } else {
                // a newer request raced in while we were spawning
                task.abort();
            }
        }

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return Err(DiscoveryError::Superseded),
            Err(e) => Err(DiscoveryError::Network(format!("fetch task failed: {e}"))),
        };

        self.commit(generation, outcome)
    }

    /// Abandon any in-flight request. The cache survives; phase returns to
    /// NotStarted.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(previous) = state.in_flight.take() {
            previous.abort();
        }
        state.generation += 1;
        state.phase = DiscoveryPhase::NotStarted;
    }

    /// Cancel and forget everything: cached list, ETag, failure window.
    pub fn reset(&self) {
        self.cancel();
        let mut state = self.state.lock();
        state.cached = None;
        state.etag = None;
        state.failure = None;
    }

    /// Point at a different fleet. A changed id purges the cache.
    pub fn set_fleet_id(&self, fleet_id: impl Into<String>) {
        let fleet_id = fleet_id.into();
        let changed = self.state.lock().fleet_id != fleet_id;
        if changed {
            self.reset();
            self.state.lock().fleet_id = fleet_id;
        }
    }

    /// Change the URL template. A changed template purges the cache.
    pub fn set_service_uri(&self, uri_template: impl Into<String>) {
        let uri_template = uri_template.into();
        let changed = self.state.lock().uri_template != uri_template;
        if changed {
            self.reset();
            self.state.lock().uri_template = uri_template;
        }
    }

    pub fn phase(&self) -> DiscoveryPhase {
        self.state.lock().phase
    }

    /// Fold a finished fetch into the cache — unless a newer request
    /// superseded it in the meantime.
    fn commit(
        &self,
        generation: u64,
        outcome: Result<FetchOutcome, DiscoveryError>,
    ) -> Result<Arc<Vec<QosServer>>, DiscoveryError> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Err(DiscoveryError::Superseded);
        }
        state.in_flight = None;

        match outcome {
            Ok(FetchOutcome::Fresh {
                servers,
                etag,
                max_age,
            }) => {
                let servers = Arc::new(servers);
                tracing::info!(servers = servers.len(), "discovery refreshed server list");
                state.cached = Some(CachedList {
                    servers: servers.clone(),
                    expires_at: Instant::now() + max_age.unwrap_or(self.success_cache),
                });
                state.etag = etag;
                state.failure = None;
                state.phase = DiscoveryPhase::Done;
                Ok(servers)
            }
            Ok(FetchOutcome::NotModified { max_age }) => match state.cached.as_mut() {
                Some(cached) => {
                    tracing::debug!("discovery list unchanged, cache refreshed");
                    cached.expires_at = Instant::now() + max_age.unwrap_or(self.success_cache);
                    let servers = cached.servers.clone();
                    state.failure = None;
                    state.phase = DiscoveryPhase::Done;
                    Ok(servers)
                }
                None => {
                    // 304 with nothing cached: the server is confused
                    let error = DiscoveryError::Http(304);
                    state.failure =
                        Some((Instant::now() + self.failure_cache, error.to_string()));
                    state.phase = DiscoveryPhase::Failed;
                    Err(error)
                }
            },
            Err(error) => {
                tracing::warn!(error = %error, "discovery failed");
                state.failure = Some((Instant::now() + self.failure_cache, error.to_string()));
                state.phase = DiscoveryPhase::Failed;
                Err(error)
            }
        }
    }
}

enum FetchOutcome {
    Fresh {
        servers: Vec<QosServer>,
        etag: Option<String>,
        max_age: Option<Duration>,
    },
    NotModified {
        max_age: Option<Duration>,
    },
}

/// One discovery with retries: network errors and 5xx are retried up to
/// `retries` times, client errors are terminal.
async fn fetch_servers(
    http: reqwest::Client,
    url: String,
    etag: Option<String>,
    retries: u32,
) -> Result<FetchOutcome, DiscoveryError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match try_fetch(&http, &url, etag.as_deref()).await {
            Ok(outcome) => return Ok(outcome),
            Err(error) if error.retryable() && attempt <= retries => {
                tracing::warn!(attempt, error = %error, "discovery attempt failed, retrying");
            }
            Err(error) => return Err(error),
        }
    }
}

async fn try_fetch(
    http: &reqwest::Client,
    url: &str,
    etag: Option<&str>,
) -> Result<FetchOutcome, DiscoveryError> {
    let mut request = http.get(url).header(ACCEPT, "application/json");
    if let Some(etag) = etag {
        request = request.header(IF_NONE_MATCH, etag);
    }

    let response = request
        .send()
        .await
        .map_err(|e| DiscoveryError::Network(e.to_string()))?;

    let status = response.status();
    let max_age = parse_max_age(response.headers());

    if status == StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::NotModified { max_age });
    }
    if !status.is_success() {
        return Err(DiscoveryError::Http(status.as_u16()));
    }

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_etag);

    let list: ServerList = response
        .json()
        .await
        .map_err(|e| DiscoveryError::Parse(e.to_string()))?;

    Ok(FetchOutcome::Fresh {
        servers: filter_valid(list.servers),
        etag,
        max_age,
    })
}

/// Drop servers violating the record invariants before anyone probes them.
fn filter_valid(servers: Vec<QosServer>) -> Vec<QosServer> {
    servers
        .into_iter()
        .filter(|server| match server.validate() {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    region = %server.regionid,
                    ipv4 = %server.ipv4,
                    error = %error,
                    "dropping invalid server from discovery response"
                );
                false
            }
        })
        .collect()
}

/// Extract the opaque validator from an ETag header value. Accepts the weak
/// form `W/"…"` and the strong form `"…"`; anything unquoted is rejected.
fn parse_etag(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    let inner = raw.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.to_string())
}

/// Pull `max-age` out of a Cache-Control header. All other directives are
/// ignored.
fn parse_max_age(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(CACHE_CONTROL)?.to_str().ok()?;
    for directive in value.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        if let Some(seconds) = directive.strip_prefix("max-age=") {
            if let Ok(seconds) = seconds.trim().parse::<u64>() {
                return Some(Duration::from_secs(seconds));
            }
        }
    }
    None
}

fn build_url(template: &str, fleet_id: &str) -> String {
    let escaped = utf8_percent_encode(fleet_id, FLEET_SEGMENT).to_string();
    template.replace("{fleet}", &escaped)
}
