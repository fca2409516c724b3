use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::location::{LocationThrottle, PositionSample};
use crate::geo::geocode::{Geocoder, HttpGeocoder};
use crate::notify::mail::{HttpMailer, Mailer};
use crate::notify::Dispatcher;
use crate::observability::metrics::Metrics;
use crate::observability::monitor::Monitor;
use crate::payments::{CheckoutLocks, HttpPaymentGateway, PaymentGateway};
use crate::rate_limit::FixedWindowLimiter;
use crate::store::DocumentStore;

/// Outbound collaborators. Payments and mail are optional; endpoints that
/// need a missing one answer 503.
#[derive(Clone)]
pub struct Services {
    pub geocoder: Arc<dyn Geocoder>,
    pub payments: Option<Arc<dyn PaymentGateway>>,
    pub mailer: Option<Arc<dyn Mailer>>,
}

impl Services {
    pub fn from_config(config: &Config) -> Self {
        let payments = config.payments.access_token.as_ref().map(|token| {
            Arc::new(HttpPaymentGateway::new(&config.payments.api_base, token))
                as Arc<dyn PaymentGateway>
        });

        let mailer = config.mailer.url.as_ref().map(|url| {
            Arc::new(HttpMailer::new(url, config.mailer.api_key.clone())) as Arc<dyn Mailer>
        });

        Self {
            geocoder: Arc::new(HttpGeocoder::new(&config.geocoder_base)),
            payments,
            mailer,
        }
    }
}

pub struct AppState {
    pub config: Config,
    pub store: DocumentStore,
    pub services: Services,
    pub checkouts: CheckoutLocks,
    pub dispatcher: Dispatcher,
    pub rate_limiter: FixedWindowLimiter,
    pub throttle: LocationThrottle,
    pub location_tx: mpsc::Sender<PositionSample>,
    pub metrics: Metrics,
    pub monitor: Monitor,
}

impl AppState {
    pub fn new(config: Config, services: Services) -> (Self, mpsc::Receiver<PositionSample>) {
        let (location_tx, location_rx) = mpsc::channel(config.location_queue_size.max(1));

        (
            Self {
                store: DocumentStore::new(config.event_buffer_size),
                services,
                checkouts: CheckoutLocks::new(),
                dispatcher: Dispatcher::new(config.event_buffer_size),
                rate_limiter: FixedWindowLimiter::new(config.rate_limit.clone()),
                throttle: LocationThrottle::new(
                    config.idle_publish_interval,
                    config.active_publish_interval,
                ),
                location_tx,
                metrics: Metrics::new(),
                monitor: Monitor::new(config.status_thresholds.clone()),
                config,
            },
            location_rx,
        )
    }
}
