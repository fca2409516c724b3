use std::env;
use std::time::Duration;

use crate::engine::route::RouteConfig;
use crate::error::AppError;
use crate::observability::monitor::StatusThresholds;
use crate::rate_limit::RateLimitConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub api_base: String,
    pub access_token: Option<String>,
    pub public_base_url: String,
}

#[derive(Debug, Clone)]
pub struct MailerSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct Fees {
    pub delivery_fee: i64,
    pub service_fee_percent: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub location_queue_size: usize,
    pub event_buffer_size: usize,
    pub idle_publish_interval: Duration,
    pub active_publish_interval: Duration,
    pub jwt_secret: String,
    pub geocoder_base: String,
    pub fees: Fees,
    pub route: RouteConfig,
    pub rate_limit: RateLimitConfig,
    pub status_thresholds: StatusThresholds,
    pub payments: PaymentSettings,
    pub mailer: MailerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            location_queue_size: 1024,
            event_buffer_size: 1024,
            idle_publish_interval: Duration::from_secs(30),
            active_publish_interval: Duration::from_secs(10),
            jwt_secret: "change-me-dev-secret".to_string(),
            geocoder_base: "https://nominatim.openstreetmap.org".to_string(),
            fees: Fees {
                delivery_fee: 3000,
                service_fee_percent: 5,
            },
            route: RouteConfig::default(),
            rate_limit: RateLimitConfig::default(),
            status_thresholds: StatusThresholds::default(),
            payments: PaymentSettings {
                api_base: "https://api.mercadopago.com".to_string(),
                access_token: None,
                public_base_url: "http://localhost:3000".to_string(),
            },
            mailer: MailerSettings {
                url: None,
                api_key: None,
                from: "pedidos@localhost".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        let mut route = defaults.route.clone();
        route.fuel_cost_per_km = parse_or_default("FUEL_COST_PER_KM", route.fuel_cost_per_km)?;

        let mut rate_limit = defaults.rate_limit.clone();
        rate_limit.enabled = parse_or_default("RATE_LIMIT_ENABLED", rate_limit.enabled)?;
        rate_limit.include_user_agent =
            parse_or_default("RATE_LIMIT_INCLUDE_UA", rate_limit.include_user_agent)?;

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            location_queue_size: parse_or_default("LOCATION_QUEUE_SIZE", defaults.location_queue_size)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            idle_publish_interval: Duration::from_secs(parse_or_default("IDLE_PUBLISH_SECS", 30)?),
            active_publish_interval: Duration::from_secs(parse_or_default("ACTIVE_PUBLISH_SECS", 10)?),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            geocoder_base: env::var("GEOCODER_BASE").unwrap_or(defaults.geocoder_base),
            fees: Fees {
                delivery_fee: parse_or_default("DELIVERY_FEE", defaults.fees.delivery_fee)?,
                service_fee_percent: parse_or_default(
                    "SERVICE_FEE_PERCENT",
                    defaults.fees.service_fee_percent,
                )?,
            },
            route,
            rate_limit,
            status_thresholds: defaults.status_thresholds,
            payments: PaymentSettings {
                api_base: env::var("PAYMENT_API_BASE").unwrap_or(defaults.payments.api_base),
                access_token: non_empty_var("PAYMENT_ACCESS_TOKEN"),
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .unwrap_or(defaults.payments.public_base_url),
            },
            mailer: MailerSettings {
                url: non_empty_var("MAILER_URL"),
                api_key: non_empty_var("MAILER_API_KEY"),
                from: env::var("MAIL_FROM").unwrap_or(defaults.mailer.from),
            },
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
