use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::Order;

pub const CURRENCY: &str = "ARS";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreferenceItem {
    pub id: String,
    pub title: String,
    pub quantity: u32,
    pub unit_price: i64,
    pub currency_id: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,
    pub back_urls: BackUrls,
    pub auto_return: &'static str,
    pub external_reference: String,
    pub notification_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Preference {
    pub id: String,
    pub init_point: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentInfo {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub transaction_amount: Option<f64>,
}

/// Builds the checkout preference for an order. Fees travel as their own
/// line items so the gateway charges the order total.
pub fn preference_request(order: &Order, public_base_url: &str) -> PreferenceRequest {
    let base = public_base_url.trim_end_matches('/');
    let order_url = format!("{base}/orders/{}", order.id);

    let mut items: Vec<PreferenceItem> = order
        .items
        .iter()
        .map(|item| PreferenceItem {
            id: item.dish_id.clone(),
            title: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            currency_id: CURRENCY,
        })
        .collect();

    for (id, title, amount) in [
        ("delivery_fee", "Costo de envío", order.totals.delivery_fee),
        ("service_fee", "Tarifa de servicio", order.totals.service_fee),
    ] {
        if amount > 0 {
            items.push(PreferenceItem {
                id: id.to_string(),
                title: title.to_string(),
                quantity: 1,
                unit_price: amount,
                currency_id: CURRENCY,
            });
        }
    }

    PreferenceRequest {
        items,
        back_urls: BackUrls {
            success: format!("{order_url}?payment=success"),
            failure: format!("{order_url}?payment=failure"),
            pending: format!("{order_url}?payment=pending"),
        },
        auto_return: "approved",
        external_reference: order.id.to_string(),
        notification_url: format!("{base}/api/payments/webhook"),
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_preference(&self, request: &PreferenceRequest) -> Result<Preference, AppError>;

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentInfo, AppError>;
}

/// Serializes checkout creation per order so the gateway sees one
/// preference per order even under concurrent requests.
#[derive(Default)]
pub struct CheckoutLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CheckoutLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn claim(&self, order_id: Uuid) -> CheckoutClaim {
        let lock = self.locks.entry(order_id).or_default().clone();
        let guard = lock.lock_owned().await;
        CheckoutClaim {
            order_id,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Orders with a claim held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct CheckoutClaim {
    order_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Drop for CheckoutClaim {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.order_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct HttpPaymentGateway {
    http: Client,
    api_base: String,
    access_token: String,
}

impl HttpPaymentGateway {
    pub fn new(api_base: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_preference(&self, request: &PreferenceRequest) -> Result<Preference, AppError> {
        let res = self
            .http
            .post(format!("{}/checkout/preferences", self.api_base))
            .bearer_auth(&self.access_token)
            .json(request)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "payment preference failed: {status} {body}"
            )));
        }

        Ok(res.json::<Preference>().await?)
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentInfo, AppError> {
        let res = self
            .http
            .get(format!("{}/v1/payments/{payment_id}", self.api_base))
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("payment {payment_id} not found")));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "payment lookup failed: {status} {body}"
            )));
        }

        Ok(res.json::<PaymentInfo>().await?)
    }
}
