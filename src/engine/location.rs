use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::delivery::waypoints;
use crate::error::AppError;
use crate::models::driver::{Driver, GeoPoint, TrackedLocation};
use crate::models::tracking::DeliveryTracking;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GeolocationErrorCode {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

/// What a device reported: a fix or the reason it could not get one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionReport {
    Position {
        lat: f64,
        lng: f64,
        #[serde(default)]
        recorded_at: Option<DateTime<Utc>>,
    },
    Error {
        code: GeolocationErrorCode,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct PositionSample {
    pub driver_id: Uuid,
    pub report: PositionReport,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleProfile {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(ThrottleProfile),
    Throttled,
    NotSharing,
    GeolocationError,
    InvalidFix,
}

impl PublishOutcome {
    fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Published(ThrottleProfile::Idle) => "published_idle",
            PublishOutcome::Published(ThrottleProfile::Active) => "published_active",
            PublishOutcome::Throttled => "throttled",
            PublishOutcome::NotSharing => "not_sharing",
            PublishOutcome::GeolocationError => "geolocation_error",
            PublishOutcome::InvalidFix => "invalid_fix",
        }
    }
}

/// At most one write per driver per interval, where the interval depends on
/// whether the driver is on a delivery.
pub struct LocationThrottle {
    idle: Duration,
    active: Duration,
    last_write: DashMap<Uuid, DateTime<Utc>>,
}

impl LocationThrottle {
    pub fn new(idle: Duration, active: Duration) -> Self {
        Self {
            idle,
            active,
            last_write: DashMap::new(),
        }
    }

    pub fn interval(&self, profile: ThrottleProfile) -> Duration {
        match profile {
            ThrottleProfile::Idle => self.idle,
            ThrottleProfile::Active => self.active,
        }
    }

    /// True when the interval has elapsed since the last recorded write (or
    /// nothing was written yet). Does not record anything.
    pub fn is_due(&self, driver_id: Uuid, profile: ThrottleProfile, at: DateTime<Utc>) -> bool {
        let interval =
            chrono::Duration::from_std(self.interval(profile)).unwrap_or(chrono::Duration::zero());

        match self.last_write.get(&driver_id) {
            Some(last) => at - *last >= interval,
            None => true,
        }
    }

    /// Marks a write that reached the store.
    pub fn record(&self, driver_id: Uuid, at: DateTime<Utc>) {
        self.last_write.insert(driver_id, at);
    }

    /// Forgets the driver so the next sample after re-enabling is written.
    pub fn forget(&self, driver_id: Uuid) {
        self.last_write.remove(&driver_id);
    }
}

pub struct PublisherHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    /// Stops the publisher and waits for it to finish its current sample.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            error!(error = %err, "location publisher task failed");
        }
    }
}

pub fn spawn_location_publisher(
    state: Arc<AppState>,
    position_rx: mpsc::Receiver<PositionSample>,
) -> PublisherHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run_location_publisher(state, position_rx, stop_rx));

    PublisherHandle {
        stop_tx: Some(stop_tx),
        task,
    }
}

pub async fn run_location_publisher(
    state: Arc<AppState>,
    mut position_rx: mpsc::Receiver<PositionSample>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    info!("location publisher started");

    loop {
        let sample = tokio::select! {
            _ = &mut stop_rx => {
                info!("location publisher stopped");
                return;
            }
            sample = position_rx.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
        };

        state.metrics.positions_in_queue.dec();

        let driver_id = sample.driver_id;
        match process_sample(&state, sample) {
            Ok(outcome) => {
                state
                    .metrics
                    .location_writes_total
                    .with_label_values(&[outcome.label()])
                    .inc();
                debug!(driver_id = %driver_id, outcome = outcome.label(), "position sample handled");
            }
            Err(err) => {
                state
                    .metrics
                    .location_writes_total
                    .with_label_values(&["error"])
                    .inc();
                error!(driver_id = %driver_id, error = %err, "failed to publish position");
            }
        }
    }

    warn!("location publisher stopped: queue channel closed");
}

pub fn process_sample(state: &AppState, sample: PositionSample) -> Result<PublishOutcome, AppError> {
    let (lat, lng, recorded_at) = match sample.report {
        PositionReport::Error { code, message } => {
            warn!(driver_id = %sample.driver_id, ?code, message = %message, "geolocation error; sample skipped");
            return Ok(PublishOutcome::GeolocationError);
        }
        PositionReport::Position {
            lat,
            lng,
            recorded_at,
        } => (lat, lng, recorded_at.unwrap_or(sample.received_at)),
    };

    if !(GeoPoint { lat, lng }).is_valid() {
        warn!(driver_id = %sample.driver_id, lat, lng, "position out of range; sample skipped");
        return Ok(PublishOutcome::InvalidFix);
    }

    let driver_key = sample.driver_id.to_string();
    let driver = state.store.fetch::<Driver>(&driver_key)?;
    if !driver.sharing_location {
        return Ok(PublishOutcome::NotSharing);
    }

    let profile = if driver.has_active_delivery() {
        ThrottleProfile::Active
    } else {
        ThrottleProfile::Idle
    };

    if !state.throttle.is_due(driver.id, profile, sample.received_at) {
        return Ok(PublishOutcome::Throttled);
    }

    let location = TrackedLocation {
        lat,
        lng,
        recorded_at,
    };

    state.store.update::<Driver, _>(&driver_key, |driver| {
        driver.current_location = Some(location);
        driver.updated_at = Utc::now();
        Ok(())
    })?;
    state.throttle.record(driver.id, sample.received_at);

    if let Some(order_id) = driver.active_order_id {
        let tracking_key = order_id.to_string();
        if state.store.get::<DeliveryTracking>(&tracking_key)?.is_some() {
            let legs = waypoints(state, order_id)?;
            state
                .store
                .update::<DeliveryTracking, _>(&tracking_key, |tracking| {
                    tracking.last_location = Some(location);
                    let (eta_pickup, eta_delivery) =
                        legs.etas(tracking.step, location.point(), &state.config.route);
                    tracking.eta_pickup = eta_pickup;
                    tracking.eta_delivery = eta_delivery;
                    tracking.updated_at = Utc::now();
                    Ok(())
                })?;
        } else {
            warn!(driver_id = %driver.id, order_id = %order_id, "active order has no tracking document");
        }
    }

    Ok(PublishOutcome::Published(profile))
}
