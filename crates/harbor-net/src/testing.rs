//! Scripted in-memory fetcher for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Reply {
    Respond { status: u16, body: Bytes },
    Fail(String),
}

#[derive(Debug, Clone)]
struct Script {
    reply: Reply,
    delay: Option<Duration>,
}

/// A [`Fetcher`] that answers from a per-URL script and counts calls.
///
/// Unscripted URLs answer `404`.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    offline: AtomicBool,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        self.script(url, Reply::Respond { status, body: body.into() }, None);
    }

    /// Answer `url` after `delay`.
    pub fn respond_after(&self, url: &str, delay: Duration, status: u16, body: impl Into<Bytes>) {
        self.script(url, Reply::Respond { status, body: body.into() }, Some(delay));
    }

    /// Fail every request for `url`.
    pub fn fail(&self, url: &str, reason: &str) {
        self.script(url, Reply::Fail(reason.to_string()), None);
    }

    /// Simulate losing (or regaining) all connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches issued for `url`.
    pub fn calls(&self, url: &str) -> usize {
        lock(&self.calls).get(url).copied().unwrap_or(0)
    }

    /// Number of fetches issued in total.
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn script(&self, url: &str, reply: Reply, delay: Option<Duration>) {
        lock(&self.scripts).insert(url.to_string(), Script { reply, delay });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
        let key = request.url.to_string();
        self.total.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls).entry(key.clone()).or_insert(0) += 1;

        let offline = self.offline.load(Ordering::SeqCst);
        let script = lock(&self.scripts).get(&key).cloned();
        let url = request.url;

        Box::pin(async move {
            if offline {
                return Err(NetError::Offline);
            }
            let Some(script) = script else {
                return Ok(Response::new(url, StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new()));
            };
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            match script.reply {
                Reply::Respond { status, body } => {
                    let status = StatusCode::from_u16(status)
                        .map_err(|e| NetError::RequestFailed(e.to_string()))?;
                    let mut headers = HeaderMap::new();
                    headers.insert(
                        http::header::CONTENT_LENGTH,
                        HeaderValue::from(body.len() as u64),
                    );
                    Ok(Response::new(url, status, headers, body))
                }
                Reply::Fail(reason) => Err(NetError::RequestFailed(reason)),
            }
        })
    }
}
