use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::error::AppError;
use crate::rate_limit::{classify, client_key, RateLimitDecision};
use crate::state::AppState;

pub async fn rate_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(class) = classify(req.method(), req.uri().path()) else {
        return next.run(req).await;
    };

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_key(
        req.headers(),
        peer,
        state.rate_limiter.config().include_user_agent,
    );

    match state.rate_limiter.check(class, &key) {
        RateLimitDecision::Allowed {
            limit,
            remaining,
            reset_after_secs,
        } => {
            let mut response = next.run(req).await;
            if limit > 0 {
                add_rate_limit_headers(response.headers_mut(), limit, remaining, reset_after_secs);
            }
            response
        }
        RateLimitDecision::Limited {
            limit,
            retry_after_secs,
        } => {
            warn!(
                class = class.as_str(),
                client = %key,
                path = %req.uri().path(),
                limit,
                retry_after_secs,
                "rate limit exceeded"
            );
            state
                .metrics
                .rate_limited_total
                .with_label_values(&[class.as_str()])
                .inc();

            let mut response = AppError::RateLimited { retry_after_secs }.into_response();
            add_rate_limit_headers(response.headers_mut(), limit, 0, retry_after_secs);
            response
        }
    }
}

fn add_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_secs: u64) {
    for (name, value) in [
        ("x-ratelimit-limit", u64::from(limit)),
        ("x-ratelimit-remaining", u64::from(remaining)),
        ("x-ratelimit-reset", reset_secs),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Feeds the status monitor and the latency histogram.
pub async fn track_requests(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed();

    let status = response.status();
    let status_class = match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };

    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[status_class])
        .observe(elapsed.as_secs_f64());
    state.monitor.record(status.is_server_error(), elapsed);

    response
}
