//! A fetcher with an off switch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use harbor_net::{Fetcher, NetError, Request, Response};
use tracing::debug;

/// Forwards to the wrapped fetcher until disconnected.
pub struct GatedFetcher {
    inner: Arc<dyn Fetcher>,
    disconnected: AtomicBool,
}

impl GatedFetcher {
    pub fn new(inner: Arc<dyn Fetcher>) -> Self {
        Self {
            inner,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        debug!("Network disconnected");
    }
}

impl Fetcher for GatedFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Box::pin(async { Err(NetError::Offline) });
        }
        self.inner.fetch(request)
    }
}
