//! Request routing.
//!
//! Rules are evaluated strictly in declared order and the first match wins.
//! Unmatched requests go to the network without touching any cache.

use std::sync::Arc;

use harbor_common::{HarborError, Result};
use harbor_net::{Fetcher, Request, RequestDestination, UrlPattern};
use http::Method;
use tracing::{debug, info, trace};
use url::Url;

use crate::expiration::ExpirationPolicy;
use crate::manifest::{PredicateSpec, RouteManifest};
use crate::storage::CacheStorage;
use crate::strategy::{Strategy, StrategyKind, StrategyOutcome};

/// A compiled request predicate.
#[derive(Clone)]
pub enum Predicate {
    Origin(String),
    SameOrigin,
    Url(UrlPattern),
    Destination(RequestDestination),
    Navigation,
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Arbitrary test installed from code.
    Custom(Arc<dyn Fn(&Request) -> bool + Send + Sync>),
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Origin(o) => f.debug_tuple("Origin").field(o).finish(),
            Predicate::SameOrigin => f.write_str("SameOrigin"),
            Predicate::Url(p) => f.debug_tuple("Url").field(p).finish(),
            Predicate::Destination(d) => f.debug_tuple("Destination").field(d).finish(),
            Predicate::Navigation => f.write_str("Navigation"),
            Predicate::All(p) => f.debug_tuple("All").field(p).finish(),
            Predicate::Any(p) => f.debug_tuple("Any").field(p).finish(),
            Predicate::Not(p) => f.debug_tuple("Not").field(p).finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Predicate {
    pub fn custom(test: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        Predicate::Custom(Arc::new(test))
    }

    /// Compile a manifest predicate.
    pub fn compile(spec: &PredicateSpec) -> Result<Self> {
        let predicate = match spec {
            PredicateSpec::Origin { origin } => Predicate::Origin(
                Url::parse(origin)
                    .map(|u| u.origin().ascii_serialization())
                    .unwrap_or_else(|_| origin.trim_end_matches('/').to_string()),
            ),
            PredicateSpec::SameOrigin => Predicate::SameOrigin,
            PredicateSpec::Path { glob } => Predicate::Url(UrlPattern::glob(glob).map_err(|e| {
                HarborError::config_with_source(format!("invalid glob {glob:?}"), e)
            })?),
            PredicateSpec::Prefix { prefix } => Predicate::Url(UrlPattern::prefix(prefix)),
            PredicateSpec::Suffix { suffix } => Predicate::Url(UrlPattern::suffix(suffix)),
            PredicateSpec::Contains { contains } => Predicate::Url(UrlPattern::contains(contains)),
            PredicateSpec::Exact { url } => Predicate::Url(UrlPattern::exact(url)),
            PredicateSpec::Destination { destination } => Predicate::Destination(*destination),
            PredicateSpec::Navigation => Predicate::Navigation,
            PredicateSpec::All { rules } => {
                Predicate::All(rules.iter().map(Self::compile).collect::<Result<_>>()?)
            }
            PredicateSpec::Any { rules } => {
                Predicate::Any(rules.iter().map(Self::compile).collect::<Result<_>>()?)
            }
            PredicateSpec::Not { rule } => Predicate::Not(Box::new(Self::compile(rule)?)),
        };
        Ok(predicate)
    }

    /// Evaluate against `request`. `origin` is the application origin, if known.
    pub fn matches(&self, request: &Request, origin: Option<&Url>) -> bool {
        match self {
            Predicate::Origin(expected) => request.url.origin().ascii_serialization() == *expected,
            Predicate::SameOrigin => origin.is_some_and(|base| request.is_same_origin(base)),
            Predicate::Url(pattern) => pattern.matches(&request.url),
            Predicate::Destination(d) => request.destination == *d,
            Predicate::Navigation => request.is_navigation(),
            Predicate::All(all) => all.iter().all(|p| p.matches(request, origin)),
            Predicate::Any(any) => any.iter().any(|p| p.matches(request, origin)),
            Predicate::Not(inner) => !inner.matches(request, origin),
            Predicate::Custom(test) => test(request),
        }
    }
}

/// One routing rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub predicate: Predicate,
    pub method: Method,
    pub cache_name: String,
    pub strategy: StrategyKind,
    pub policy: ExpirationPolicy,
}

impl RouteRule {
    /// A GET rule with an unbounded policy.
    pub fn new(predicate: Predicate, cache_name: &str, strategy: StrategyKind) -> Self {
        Self {
            predicate,
            method: Method::GET,
            cache_name: cache_name.to_string(),
            strategy,
            policy: ExpirationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn matches(&self, request: &Request, origin: Option<&Url>) -> bool {
        request.method == self.method && self.predicate.matches(request, origin)
    }
}

/// Routing decision for one request.
#[derive(Debug)]
pub enum RouteDecision<'a> {
    Intercept { index: usize, rule: &'a RouteRule },
    PassThrough,
}

/// Ordered rule list bound to caches and the network.
pub struct CacheRouter {
    routes: Vec<(RouteRule, Strategy)>,
    fetcher: Arc<dyn Fetcher>,
    origin: Option<Url>,
}

impl std::fmt::Debug for CacheRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRouter")
            .field("rules", &self.routes.len())
            .field("origin", &self.origin)
            .finish()
    }
}

impl CacheRouter {
    /// Bind `rules` to their caches, opening them in `storage`.
    pub async fn new(
        rules: Vec<RouteRule>,
        storage: &CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        origin: Option<Url>,
    ) -> Self {
        let mut routes = Vec::with_capacity(rules.len());
        for rule in rules {
            let cache = storage.open(&rule.cache_name, rule.policy).await;
            let strategy = Strategy::new(rule.strategy, cache, Arc::clone(&fetcher));
            routes.push((rule, strategy));
        }
        info!(rules = routes.len(), "Cache router ready");
        Self {
            routes,
            fetcher,
            origin,
        }
    }

    /// Validate and compile a manifest.
    pub async fn from_manifest(
        manifest: &RouteManifest,
        storage: &CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        origin: Option<Url>,
    ) -> Result<Self> {
        manifest.validate()?;
        let mut rules = Vec::with_capacity(manifest.len());
        for spec in &manifest.routes {
            rules.push(
                RouteRule::new(Predicate::compile(&spec.predicate)?, &spec.cache, spec.kind())
                    .with_policy(spec.policy())
                    .with_method(spec.http_method()?),
            );
        }
        Ok(Self::new(rules, storage, fetcher, origin).await)
    }

    /// First matching rule, if any.
    pub fn route(&self, request: &Request) -> RouteDecision<'_> {
        for (index, (rule, _)) in self.routes.iter().enumerate() {
            if rule.matches(request, self.origin.as_ref()) {
                trace!(url = %request.url, index, cache = %rule.cache_name, "Route matched");
                return RouteDecision::Intercept { index, rule };
            }
        }
        RouteDecision::PassThrough
    }

    /// Route and answer `request`.
    pub async fn handle(&self, request: Request) -> Result<StrategyOutcome> {
        match self.route(&request) {
            RouteDecision::Intercept { index, .. } => self.routes[index].1.handle(request).await,
            RouteDecision::PassThrough => {
                debug!(url = %request.url, "No route, passing through");
                self.pass_through(request).await
            }
        }
    }

    /// Send `request` to the network without consulting any cache.
    pub async fn pass_through(&self, request: Request) -> Result<StrategyOutcome> {
        let url = request.url.clone();
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| e.into_unavailable(&url))?;
        Ok(StrategyOutcome::network(response))
    }

    /// Names of every cache a rule writes to.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .iter()
            .map(|(rule, _)| rule.cache_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn rules(&self) -> impl Iterator<Item = &RouteRule> {
        self.routes.iter().map(|(rule, _)| rule)
    }

    pub fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }
}
