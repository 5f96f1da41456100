//! Per-IP rate limiting middleware.

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tower::{Layer, Service};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 100, window: Duration::from_secs(60) }
    }
}

#[derive(Clone)]
struct RateLimiterState {
    requests: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiterState {
    fn new() -> Self {
        Self { requests: HashMap::new() }
    }

    fn check_rate_limit(&mut self, ip: IpAddr, config: &RateLimitConfig) -> bool {
        let now = Instant::now();
        let cutoff = now - config.window;

        let requests = self.requests.entry(ip).or_insert_with(Vec::new);
        requests.retain(|&time| time > cutoff);

        if requests.len() < config.max_requests {
            requests.push(now);
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<Mutex<RateLimiterState>>,
    config: RateLimitConfig,
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { state: Arc::new(Mutex::new(RateLimiterState::new())), config }
    }
}

impl Default for RateLimitLayer {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService { inner, state: self.state.clone(), config: self.config.clone() }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<Mutex<RateLimiterState>>,
    config: RateLimitConfig,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let state = self.state.clone();
        let config = self.config.clone();

        // Falls back to loopback only when no `ConnectInfo` extension is
        // present (e.g. a `tower::ServiceExt::oneshot` call in a test) — the
        // real peer address always wins when the server was bound with
        // `into_make_service_with_connect_info::<SocketAddr>()`.
        let ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        Box::pin(async move {
            let mut state = state.lock().await;
            let allowed = state.check_rate_limit(ip, &config);
            drop(state);

            if !allowed {
                return Ok((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded, try again later").into_response());
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_ips_get_independent_budgets() {
        let config = RateLimitConfig { max_requests: 1, window: Duration::from_secs(60) };
        let mut state = RateLimiterState::new();

        assert!(state.check_rate_limit(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), &config));
        assert!(!state.check_rate_limit(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), &config));
        assert!(state.check_rate_limit(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)), &config));
    }
}
