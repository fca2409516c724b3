//! Fixed-window request limiting per client and endpoint class.
//!
//! Each `(class, client key)` pair owns a counter that resets when its window
//! elapses. The table lives in this process only; separate instances do not
//! share counts.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Auth,
    Api,
    Sensitive,
    Upload,
    Search,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Auth => "auth",
            EndpointClass::Api => "api",
            EndpointClass::Sensitive => "sensitive",
            EndpointClass::Upload => "upload",
            EndpointClass::Search => "search",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRule {
    pub max_requests: u32,
    pub window: Duration,
}

impl WindowRule {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Key clients by IP and user agent instead of IP alone.
    pub include_user_agent: bool,
    pub auth: WindowRule,
    pub api: WindowRule,
    pub sensitive: WindowRule,
    pub upload: WindowRule,
    pub search: WindowRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_user_agent: false,
            auth: WindowRule::new(5, 15 * 60),
            api: WindowRule::new(100, 15 * 60),
            sensitive: WindowRule::new(10, 60 * 60),
            upload: WindowRule::new(20, 10 * 60),
            search: WindowRule::new(50, 5 * 60),
        }
    }
}

impl RateLimitConfig {
    pub fn rule(&self, class: EndpointClass) -> WindowRule {
        match class {
            EndpointClass::Auth => self.auth,
            EndpointClass::Api => self.api,
            EndpointClass::Sensitive => self.sensitive,
            EndpointClass::Upload => self.upload,
            EndpointClass::Search => self.search,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after_secs: u64,
    },
    Limited {
        limit: u32,
        retry_after_secs: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    windows: DashMap<(EndpointClass, String), Window>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check(&self, class: EndpointClass, key: &str) -> RateLimitDecision {
        self.check_at(class, key, Utc::now())
    }

    pub fn check_at(&self, class: EndpointClass, key: &str, now: DateTime<Utc>) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::Allowed {
                limit: 0,
                remaining: 0,
                reset_after_secs: 0,
            };
        }

        let rule = self.config.rule(class);
        let window = chrono::Duration::from_std(rule.window).unwrap_or(chrono::Duration::zero());

        let mut entry = self
            .windows
            .entry((class, key.to_string()))
            .or_insert(Window {
                started_at: now,
                count: 0,
            });

        if now - entry.started_at >= window {
            entry.started_at = now;
            entry.count = 0;
        }

        let remaining_window = (entry.started_at + window - now).max(chrono::Duration::zero());
        let secs_left = ceil_secs(remaining_window);

        if entry.count >= rule.max_requests {
            return RateLimitDecision::Limited {
                limit: rule.max_requests,
                retry_after_secs: secs_left.max(1),
            };
        }

        entry.count += 1;
        RateLimitDecision::Allowed {
            limit: rule.max_requests,
            remaining: rule.max_requests - entry.count,
            reset_after_secs: secs_left,
        }
    }

    /// Requests counted in the current window for this key.
    pub fn count(&self, class: EndpointClass, key: &str) -> u32 {
        self.windows
            .get(&(class, key.to_string()))
            .map(|window| window.count)
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        self.windows.clear();
    }

    /// Drops windows that have fully elapsed. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|(class, _), window| {
            let length = chrono::Duration::from_std(self.config.rule(*class).window)
                .unwrap_or(chrono::Duration::zero());
            now - window.started_at < length
        });
        before - self.windows.len()
    }
}

fn ceil_secs(duration: chrono::Duration) -> u64 {
    let millis = duration.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

/// Which limit applies to a request, or `None` for unlimited routes.
pub fn classify(method: &Method, path: &str) -> Option<EndpointClass> {
    if !path.starts_with("/api/") {
        return None;
    }

    let segments: Vec<&str> = path.trim_end_matches('/').split('/').skip(2).collect();

    let post = *method == Method::POST;
    let class = match segments.as_slice() {
        ["drivers"] | ["cooks"] if post => EndpointClass::Auth,
        ["payments", ..] | ["notifications", "email"] => EndpointClass::Sensitive,
        ["orders", _, "payment"] if post => EndpointClass::Sensitive,
        ["drivers", _, "location"] if post => EndpointClass::Upload,
        ["orders"] if *method == Method::GET => EndpointClass::Search,
        _ => EndpointClass::Api,
    };

    Some(class)
}

/// Client key: first `x-forwarded-for` hop, then `x-real-ip`, then the peer
/// address, optionally joined with the user agent.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, include_user_agent: bool) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let ip = header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| header("x-real-ip").map(str::to_string))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    if include_user_agent {
        let agent = header("user-agent").unwrap_or("-");
        format!("{ip}|{agent}")
    } else {
        ip
    }
}
