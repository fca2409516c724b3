use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use food_delivery::api::rest::router;
use food_delivery::auth::issue_token;
use food_delivery::config::Config;
use food_delivery::engine::location::{spawn_location_publisher, PositionSample};
use food_delivery::error::AppError;
use food_delivery::geo::geocode::StaticGeocoder;
use food_delivery::models::driver::{Driver, GeoPoint};
use food_delivery::notify::mail::{EmailMessage, Mailer};
use food_delivery::notify::NotificationPermission;
use food_delivery::payments::{PaymentGateway, PaymentInfo, Preference, PreferenceRequest};
use food_delivery::state::{AppState, Services};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;

const CUSTOMER: &str = "5b0e3a52-8a7c-4c1e-9d0e-3f1a2b3c4d5e";

#[derive(Default)]
struct FakeGateway {
    preferences_created: AtomicUsize,
    payments: Mutex<HashMap<String, PaymentInfo>>,
    latency: Duration,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_preference(&self, request: &PreferenceRequest) -> Result<Preference, AppError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let n = self.preferences_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Preference {
            id: format!("pref-{n}"),
            init_point: format!("https://pay.example/checkout/{}", request.external_reference),
        })
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentInfo, AppError> {
        self.payments
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("payment {payment_id} not found")))
    }
}

#[derive(Default)]
struct FakeMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), AppError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.enabled = false;
    config
}

fn test_services() -> Services {
    Services {
        geocoder: Arc::new(StaticGeocoder::new()),
        payments: None,
        mailer: None,
    }
}

fn setup_with(
    config: Config,
    services: Services,
) -> (axum::Router, Arc<AppState>, mpsc::Receiver<PositionSample>) {
    let (state, rx) = AppState::new(config, services);
    let shared = Arc::new(state);
    (router(shared.clone()), shared, rx)
}

fn setup() -> (axum::Router, Arc<AppState>, mpsc::Receiver<PositionSample>) {
    setup_with(test_config(), test_services())
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn patch_request(uri: &str, body: Value) -> Request<Body> {
    json_request("PATCH", uri, body)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn create_cook(app: &axum::Router, location: Option<(f64, f64)>) -> Value {
    let location = location.map(|(lat, lng)| json!({ "lat": lat, "lng": lng }));
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/cooks",
            json!({ "name": "rosa", "kitchen_name": "La cocina de Rosa", "location": location }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    body_json(res).await
}

async fn create_order(app: &axum::Router, cook_id: &str, location: Option<(f64, f64)>) -> Value {
    let location = location.map(|(lat, lng)| json!({ "lat": lat, "lng": lng }));
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/orders",
            json!({
                "customer_id": CUSTOMER,
                "cook_id": cook_id,
                "items": [
                    { "dish_id": "empanadas", "name": "Docena de empanadas", "quantity": 2, "unit_price": 9000 },
                    { "dish_id": "flan", "name": "Flan casero", "quantity": 1, "unit_price": 1000 }
                ],
                "delivery": {
                    "street": "Av. Corrientes 1234",
                    "city": "Buenos Aires",
                    "phone": "+54 11 5555 0000",
                    "location": location
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    body_json(res).await
}

async fn set_status(app: &axum::Router, order_id: &str, status: &str) -> axum::response::Response {
    app.clone()
        .oneshot(patch_request(
            &format!("/api/orders/{order_id}/status"),
            json!({ "status": status }),
        ))
        .await
        .unwrap()
}

async fn create_online_driver(app: &axum::Router, name: &str) -> Value {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/drivers",
            json!({
                "name": name,
                "phone": "+54 11 4444 0000",
                "vehicle": { "kind": "motorcycle", "plate": "A123BCD" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let driver = body_json(res).await;
    let id = driver["id"].as_str().unwrap();

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/api/drivers/{id}/availability"),
            json!({ "online": true }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state, _rx) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["orders"], 0);
    assert_eq!(body["drivers"], 0);
    assert_eq!(body["cooks"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state, _rx) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("orders_created_total"));
    assert!(body.contains("positions_in_queue"));
}

#[tokio::test]
async fn openapi_document_is_served() {
    let (app, _state, _rx) = setup();
    let response = app
        .oneshot(get_request("/api/docs/openapi.json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["paths"]["/api/orders"].is_object());
}

#[tokio::test]
async fn create_order_computes_totals() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;

    assert_eq!(order["status"], "pending");
    assert_eq!(order["totals"]["subtotal"], 19000);
    assert_eq!(order["totals"]["delivery_fee"], 3000);
    assert_eq!(order["totals"]["service_fee"], 950);
    assert_eq!(order["totals"]["total"], 22950);
    assert!(order["driver_id"].is_null());
}

#[tokio::test]
async fn order_without_items_returns_field_errors() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/orders",
            json!({
                "customer_id": CUSTOMER,
                "cook_id": cook["id"],
                "items": [],
                "delivery": { "street": " ", "city": "Rosario", "phone": "+54 341 000" }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    let fields: Vec<&str> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|field| field["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"items"));
    assert!(fields.contains(&"delivery.street"));
}

#[tokio::test]
async fn oversized_prices_are_rejected() {
    let (app, state, _rx) = setup();
    let cook = create_cook(&app, None).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/orders",
            json!({
                "customer_id": CUSTOMER,
                "cook_id": cook["id"],
                "items": [{ "dish_id": "caviar", "name": "Caviar", "quantity": 2, "unit_price": 9_000_000_000_000_000_000i64 }],
                "delivery": { "street": "Calle 1", "city": "La Plata", "phone": "221" }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["fields"][0]["field"], "items[0].unit_price");
    assert_eq!(state.metrics.orders_created_total.get(), 0);
}

#[tokio::test]
async fn order_for_unknown_cook_returns_404() {
    let (app, _state, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/orders",
            json!({
                "customer_id": CUSTOMER,
                "cook_id": "00000000-0000-0000-0000-000000000000",
                "items": [{ "dish_id": "x", "name": "X", "quantity": 1, "unit_price": 10 }],
                "delivery": { "street": "Calle 1", "city": "La Plata", "phone": "221" }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_nonexistent_order_returns_404() {
    let (app, _state, _rx) = setup();
    let fake_id = "00000000-0000-0000-0000-000000000000";
    let response = app
        .oneshot(get_request(&format!("/api/orders/{fake_id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains(fake_id));
}

#[tokio::test]
async fn status_moves_forward_only() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let id = order["id"].as_str().unwrap();

    let res = set_status(&app, id, "accepted").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "accepted");

    let res = set_status(&app, id, "pending").await;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = set_status(&app, id, "cancelled").await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = set_status(&app, id, "preparing").await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn progress_marks_current_step() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let id = order["id"].as_str().unwrap();
    set_status(&app, id, "preparing").await;

    let res = app
        .oneshot(get_request(&format!("/api/orders/{id}/progress")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = body_json(res).await;
    let states: Vec<&str> = body["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|step| step["state"].as_str().unwrap())
        .collect();
    assert_eq!(
        states,
        vec!["completed", "completed", "current", "pending", "pending", "pending"]
    );
    assert_eq!(body["elapsed"], "Hace un momento");
}

#[tokio::test]
async fn list_orders_filters_by_status() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let cook_id = cook["id"].as_str().unwrap();
    let first = create_order(&app, cook_id, None).await;
    create_order(&app, cook_id, None).await;
    set_status(&app, first["id"].as_str().unwrap(), "accepted").await;

    let res = app
        .clone()
        .oneshot(get_request("/api/orders?status=accepted"))
        .await
        .unwrap();
    let accepted = body_json(res).await;
    assert_eq!(accepted.as_array().unwrap().len(), 1);
    assert_eq!(accepted[0]["id"], first["id"]);

    let res = app
        .oneshot(get_request(&format!("/api/orders?customer_id={CUSTOMER}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn full_delivery_flow() {
    let (app, state, _rx) = setup();
    let cook = create_cook(&app, Some((-34.6037, -58.3816))).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), Some((-34.5880, -58.3960))).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    set_status(&app, &order_id, "ready").await;

    let driver = create_online_driver(&app, "Marcos").await;
    let driver_id = driver["id"].as_str().unwrap().to_string();
    let rival = create_online_driver(&app, "Lucía").await;
    let rival_id = rival["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/drivers/{driver_id}/accept/{order_id}"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let tracking = body_json(res).await;
    assert_eq!(tracking["step"], "heading_to_pickup");
    assert_eq!(tracking["driver_id"], driver_id);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/drivers/{rival_id}/accept/{order_id}"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let stored: Driver = state.store.fetch(&driver_id).unwrap();
    assert!(!stored.available);
    assert_eq!(stored.active_order_id.map(|id| id.to_string()), Some(order_id.clone()));

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/api/tracking/{order_id}/step"),
            json!({ "step": "heading_to_delivery" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/orders/{order_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["status"], "delivering");

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/api/tracking/{order_id}/step"),
            json!({ "step": "at_pickup" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/api/tracking/{order_id}/step"),
            json!({ "step": "delivered" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/orders/{order_id}")))
        .await
        .unwrap();
    let delivered = body_json(res).await;
    assert_eq!(delivered["status"], "delivered");
    assert!(delivered["delivered_at"].is_string());

    let stored: Driver = state.store.fetch(&driver_id).unwrap();
    assert!(stored.available);
    assert!(stored.active_order_id.is_none());
}

#[tokio::test]
async fn cancelled_order_keeps_its_tracking_step() {
    let (app, state, _rx) = setup();
    let cook = create_cook(&app, Some((-34.6037, -58.3816))).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), Some((-34.5880, -58.3960))).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    set_status(&app, &order_id, "ready").await;
    let driver = create_online_driver(&app, "Marcos").await;
    let driver_id = driver["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/drivers/{driver_id}/accept/{order_id}"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = set_status(&app, &order_id, "cancelled").await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/api/tracking/{order_id}/step"),
            json!({ "step": "delivered" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/tracking/{order_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["step"], "heading_to_pickup");

    let res = app
        .oneshot(get_request(&format!("/api/orders/{order_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["status"], "cancelled");

    let stored: Driver = state.store.fetch(&driver_id).unwrap();
    assert!(stored.available);
}

#[tokio::test]
async fn offline_driver_cannot_accept() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let order_id = order["id"].as_str().unwrap();
    set_status(&app, order_id, "accepted").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/drivers",
            json!({ "name": "Iván", "phone": "+54 9", "vehicle": { "kind": "bicycle", "plate": null } }),
        ))
        .await
        .unwrap();
    let driver = body_json(res).await;
    let driver_id = driver["id"].as_str().unwrap();

    let res = app
        .oneshot(json_request(
            "POST",
            &format!("/api/drivers/{driver_id}/accept/{order_id}"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn pending_order_cannot_be_picked_up() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let driver = create_online_driver(&app, "Marcos").await;

    let res = app
        .oneshot(json_request(
            "POST",
            &format!(
                "/api/drivers/{}/accept/{}",
                driver["id"].as_str().unwrap(),
                order["id"].as_str().unwrap()
            ),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn accepting_geocodes_the_delivery_address() {
    let geocoder = StaticGeocoder::new();
    geocoder.insert(
        "Av. Corrientes 1234, Buenos Aires",
        GeoPoint {
            lat: -34.6037,
            lng: -58.3816,
        },
    );
    let services = Services {
        geocoder: Arc::new(geocoder),
        ..test_services()
    };
    let (app, _state, _rx) = setup_with(test_config(), services);

    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let order_id = order["id"].as_str().unwrap();
    set_status(&app, order_id, "accepted").await;
    let driver = create_online_driver(&app, "Marcos").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/drivers/{}/accept/{order_id}", driver["id"].as_str().unwrap()),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = app
        .oneshot(get_request(&format!("/api/orders/{order_id}")))
        .await
        .unwrap();
    let stored = body_json(res).await;
    assert_eq!(stored["delivery"]["location"]["lat"], -34.6037);
}

#[tokio::test]
async fn route_sequences_ready_orders_and_reports_unresolved() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let cook_id = cook["id"].as_str().unwrap();

    let near = create_order(&app, cook_id, Some((-34.6010, -58.3800))).await;
    let far = create_order(&app, cook_id, Some((-34.6300, -58.4200))).await;
    let lost = create_order(&app, cook_id, None).await;
    for order in [&near, &far, &lost] {
        set_status(&app, order["id"].as_str().unwrap(), "ready").await;
    }
    let driver = create_online_driver(&app, "Marcos").await;

    let res = app
        .oneshot(get_request(&format!(
            "/api/drivers/{}/route?lat=-34.6000&lng=-58.3790",
            driver["id"].as_str().unwrap()
        )))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let route = body_json(res).await;
    let stops = route["stops"].as_array().unwrap();
    assert_eq!(stops.len(), 2);
    assert_eq!(stops[0]["sequence"], 1);
    assert_eq!(stops[0]["order_id"], near["id"]);
    assert_eq!(stops[1]["order_id"], far["id"]);
    assert_eq!(route["unresolved"].as_array().unwrap().len(), 1);
    assert_eq!(route["unresolved"][0]["order_id"], lost["id"]);

    let efficiency = route["efficiency"].as_u64().unwrap();
    assert!(efficiency <= 100);
}

#[tokio::test]
async fn route_without_start_position_returns_400() {
    let (app, _state, _rx) = setup();
    let driver = create_online_driver(&app, "Marcos").await;

    let res = app
        .oneshot(get_request(&format!(
            "/api/drivers/{}/route",
            driver["id"].as_str().unwrap()
        )))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

async fn wait_for_outcome(state: &AppState, outcome: &str, expected: u64) {
    for _ in 0..100 {
        let seen = state
            .metrics
            .location_writes_total
            .with_label_values(&[outcome])
            .get();
        if seen >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("publisher never reported {expected} {outcome} sample(s)");
}

#[tokio::test]
async fn location_publisher_throttles_writes() {
    let (app, state, rx) = setup();
    let publisher = spawn_location_publisher(state.clone(), rx);

    let driver = create_online_driver(&app, "Marcos").await;
    let driver_id = driver["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/drivers/{driver_id}/location"),
            json!({ "type": "position", "lat": -34.60, "lng": -58.38 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    wait_for_outcome(&state, "not_sharing", 1).await;
    let stored: Driver = state.store.fetch(&driver_id).unwrap();
    assert!(stored.current_location.is_none());

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/api/drivers/{driver_id}/sharing"),
            json!({ "enabled": true }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    for lat in [-34.60, -34.70] {
        let res = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/drivers/{driver_id}/location"),
                json!({ "type": "position", "lat": lat, "lng": -58.38 }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }

    wait_for_outcome(&state, "published_idle", 1).await;
    wait_for_outcome(&state, "throttled", 1).await;

    let stored: Driver = state.store.fetch(&driver_id).unwrap();
    let location = stored.current_location.unwrap();
    assert_eq!(location.lat, -34.60);

    publisher.stop().await;
}

#[tokio::test]
async fn location_for_unknown_driver_returns_404() {
    let (app, _state, _rx) = setup();
    let res = app
        .oneshot(json_request(
            "POST",
            "/api/drivers/00000000-0000-0000-0000-000000000000/location",
            json!({ "type": "position", "lat": 0.0, "lng": 0.0 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn payment_without_gateway_returns_503() {
    let (app, _state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;

    let res = app
        .oneshot(json_request(
            "POST",
            &format!("/api/orders/{}/payment", order["id"].as_str().unwrap()),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn payment_checkout_is_created_once_and_webhook_records_status() {
    let gateway = Arc::new(FakeGateway::default());
    let services = Services {
        payments: Some(gateway.clone() as Arc<dyn PaymentGateway>),
        ..test_services()
    };
    let (app, _state, _rx) = setup_with(test_config(), services);

    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request("POST", &format!("/api/orders/{order_id}/payment"), json!({})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let first = body_json(res).await;
    assert_eq!(first["preference_id"], "pref-1");

    let res = app
        .clone()
        .oneshot(json_request("POST", &format!("/api/orders/{order_id}/payment"), json!({})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["preference_id"], "pref-1");
    assert_eq!(gateway.preferences_created.load(Ordering::SeqCst), 1);

    gateway
        .payments
        .lock()
        .unwrap()
        .insert("987".to_string(), approved_payment(987, &order_id));

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/payments/webhook",
            json!({ "type": "payment", "data": { "id": "987" } }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack = body_json(res).await;
    assert_eq!(ack["order_id"], order_id);
    assert_eq!(ack["status"], "approved");

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/orders/{order_id}")))
        .await
        .unwrap();
    let stored = body_json(res).await;
    assert_eq!(stored["payment"]["payment_id"], "987");
    assert_eq!(stored["payment"]["status"], "approved");
    assert_eq!(stored["payment"]["preference_id"], "pref-1");

    let res = app
        .oneshot(get_request("/api/payments/404"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

fn approved_payment(id: u64, order_id: &str) -> PaymentInfo {
    PaymentInfo {
        id,
        status: "approved".to_string(),
        status_detail: Some("accredited".to_string()),
        external_reference: Some(order_id.to_string()),
        transaction_amount: Some(22950.0),
    }
}

#[tokio::test]
async fn concurrent_checkouts_create_one_preference() {
    let gateway = Arc::new(FakeGateway {
        latency: Duration::from_millis(50),
        ..FakeGateway::default()
    });
    let services = Services {
        payments: Some(gateway.clone() as Arc<dyn PaymentGateway>),
        ..test_services()
    };
    let (app, state, _rx) = setup_with(test_config(), services);

    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let uri = format!("/api/orders/{}/payment", order["id"].as_str().unwrap());

    let (first, second) = tokio::join!(
        app.clone().oneshot(json_request("POST", &uri, json!({}))),
        app.clone().oneshot(json_request("POST", &uri, json!({}))),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    let mut statuses = vec![first.status(), second.status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CREATED]);
    assert_eq!(body_json(first).await["preference_id"], "pref-1");
    assert_eq!(body_json(second).await["preference_id"], "pref-1");
    assert_eq!(gateway.preferences_created.load(Ordering::SeqCst), 1);
    assert!(state.checkouts.is_empty());
}

#[tokio::test]
async fn webhook_before_checkout_still_allows_a_checkout() {
    let gateway = Arc::new(FakeGateway::default());
    let services = Services {
        payments: Some(gateway.clone() as Arc<dyn PaymentGateway>),
        ..test_services()
    };
    let (app, _state, _rx) = setup_with(test_config(), services);

    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    gateway
        .payments
        .lock()
        .unwrap()
        .insert("555".to_string(), approved_payment(555, &order_id));

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/payments/webhook",
            json!({ "topic": "payment", "data": { "id": 555 } }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/orders/{order_id}")))
        .await
        .unwrap();
    let stored = body_json(res).await;
    assert!(stored["payment"]["preference_id"].is_null());
    assert_eq!(stored["payment"]["status"], "approved");

    let res = app
        .oneshot(json_request("POST", &format!("/api/orders/{order_id}/payment"), json!({})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let checkout = body_json(res).await;
    assert_eq!(checkout["preference_id"], "pref-1");
    assert!(checkout["init_point"].as_str().unwrap().ends_with(&order_id));
    assert_eq!(checkout["payment_id"], "555");
    assert_eq!(checkout["status"], "approved");
}

#[tokio::test]
async fn email_is_validated_before_sending() {
    let (app, _state, _rx) = setup();
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/notifications/email",
            json!({ "to": "not-an-address", "subject": "", "text": "hola" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert_eq!(body["fields"].as_array().unwrap().len(), 2);

    let res = app
        .oneshot(json_request(
            "POST",
            "/api/notifications/email",
            json!({ "to": "ana@example.com", "subject": "Tu pedido", "text": "hola" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn email_goes_through_the_mailer() {
    let mailer = Arc::new(FakeMailer::default());
    let services = Services {
        mailer: Some(mailer.clone() as Arc<dyn Mailer>),
        ..test_services()
    };
    let (app, _state, _rx) = setup_with(test_config(), services);

    let res = app
        .oneshot(json_request(
            "POST",
            "/api/notifications/email",
            json!({ "to": " ana@example.com ", "subject": "Tu pedido", "text": "Llega en 10 min" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ana@example.com");
}

#[tokio::test]
async fn preview_renders_spanish_copy() {
    let (app, _state, _rx) = setup();
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/notifications/preview",
            json!({ "status": "delivering", "context": { "driver_name": "Marcos", "eta": "8 min" } }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["title"], "¡Tu pedido va en camino!");
    assert_eq!(body["body"], "Marcos llega en aproximadamente 8 min.");

    let res = app
        .oneshot(json_request(
            "POST",
            "/api/notifications/preview",
            json!({ "status": "teleported" }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["title"], "Actualización de tu pedido");
}

#[tokio::test]
async fn granted_customers_receive_status_notifications() {
    let (app, state, _rx) = setup();

    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let order_id = order["id"].as_str().unwrap();
    let mut notifications = state.dispatcher.watch(order_id.parse().unwrap());

    let res = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/notifications/permission",
            json!({ "customer_id": CUSTOMER, "permission": "granted" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    set_status(&app, order_id, "accepted").await;

    let notification = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.order_id.to_string(), order_id);
    assert_eq!(notification.content.title, "¡Pedido aceptado!");
    assert_eq!(notification.content.body, "Rosa aceptó tu pedido.");
}

#[tokio::test]
async fn notifications_for_unwatched_orders_fall_back_to_the_log() {
    let (app, state, _rx) = setup();

    let cook = create_cook(&app, None).await;
    let cook_id = cook["id"].as_str().unwrap();
    let watched = create_order(&app, cook_id, None).await;
    let unwatched = create_order(&app, cook_id, None).await;
    let _watch = state
        .dispatcher
        .watch(watched["id"].as_str().unwrap().parse().unwrap());

    app.clone()
        .oneshot(json_request(
            "PUT",
            "/api/notifications/permission",
            json!({ "customer_id": CUSTOMER, "permission": "granted" }),
        ))
        .await
        .unwrap();

    let res = set_status(&app, unwatched["id"].as_str().unwrap(), "accepted").await;
    assert_eq!(res.status(), StatusCode::OK);

    let outcomes = &state.metrics.notifications_total;
    assert_eq!(outcomes.with_label_values(&["fell_back"]).get(), 1);
    assert_eq!(outcomes.with_label_values(&["shown"]).get(), 0);
}

#[tokio::test]
async fn system_status_requires_admin_token() {
    let (app, state, _rx) = setup();

    let res = app
        .clone()
        .oneshot(get_request("/api/system/status"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let customer = issue_token(&state.config.jwt_secret, "customer", false, 300).unwrap();
    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/system/status")
                .header("authorization", format!("Bearer {customer}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let admin = issue_token(&state.config.jwt_secret, "ops", true, 300).unwrap();
    let res = app
        .oneshot(
            Request::builder()
                .uri("/api/system/status")
                .header("authorization", format!("Bearer {admin}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["total_requests"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn onboarding_is_rate_limited() {
    let (app, state, _rx) = setup_with(Config::default(), test_services());

    for expected_remaining in (0..5).rev() {
        let res = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/cooks",
                json!({ "name": "Rosa", "kitchen_name": "La cocina de Rosa" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers()["x-ratelimit-limit"], "5");
        assert_eq!(
            res.headers()["x-ratelimit-remaining"],
            expected_remaining.to_string().as_str()
        );
    }

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/cooks",
            json!({ "name": "Rosa", "kitchen_name": "La cocina de Rosa" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = res.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 900);
    assert_eq!(res.headers()["x-ratelimit-remaining"], "0");

    let res = app.oneshot(get_request("/api/cooks")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    state.rate_limiter.reset();
}

type ClientSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(app: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Reads frames until one carries `event`, skipping the rest.
async fn next_event(socket: &mut ClientSocket, event: &str) -> Value {
    let wait = async {
        while let Some(frame) = socket.next().await {
            if let WsMessage::Text(text) = frame.unwrap() {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["event"] == event {
                    return value;
                }
            }
        }
        panic!("socket closed before a {event} event");
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .unwrap_or_else(|_| panic!("no {event} event within 2s"))
}

async fn send_command(socket: &mut ClientSocket, command: Value) {
    socket
        .send(WsMessage::Text(command.to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn websocket_streams_order_activity() {
    let (app, state, _rx) = setup();
    let cook = create_cook(&app, Some((-34.6037, -58.3816))).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), Some((-34.5880, -58.3960))).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    let addr = serve(app.clone()).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws/orders/{order_id}"))
        .await
        .unwrap();

    let snapshot = next_event(&mut socket, "order_changed").await;
    assert_eq!(snapshot["change"]["kind"], "upserted");
    assert_eq!(snapshot["change"]["revision"], 0);
    assert_eq!(snapshot["change"]["document"]["id"], order_id);
    assert_eq!(snapshot["progress"]["status"], "pending");

    send_command(&mut socket, json!({ "type": "get_version" })).await;
    let version = next_event(&mut socket, "control").await;
    assert_eq!(version["reply"]["type"], "version");

    send_command(&mut socket, json!({ "type": "set_permission", "permission": "granted" })).await;
    let reply = next_event(&mut socket, "control").await;
    assert_eq!(reply["reply"]["type"], "permission_updated");
    assert_eq!(reply["reply"]["permission"], "granted");
    assert_eq!(
        state.dispatcher.permission(CUSTOMER.parse().unwrap()),
        NotificationPermission::Granted
    );

    send_command(&mut socket, json!({ "type": "teleport" })).await;
    let error = next_event(&mut socket, "control").await;
    assert_eq!(error["reply"]["type"], "error");

    set_status(&app, &order_id, "ready").await;
    let notification = next_event(&mut socket, "notification").await;
    assert_eq!(notification["notification"]["order_id"], order_id);
    assert_eq!(notification["notification"]["content"]["title"], "Pedido listo");

    let driver = create_online_driver(&app, "Marcos").await;
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/drivers/{}/accept/{order_id}", driver["id"].as_str().unwrap()),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let tracking = next_event(&mut socket, "tracking_changed").await;
    assert_eq!(tracking["change"]["document"]["step"], "heading_to_pickup");
    assert!(tracking["change"]["revision"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn closing_the_socket_releases_the_watcher() {
    let (app, state, _rx) = setup();
    let cook = create_cook(&app, None).await;
    let order = create_order(&app, cook["id"].as_str().unwrap(), None).await;
    let order_id: uuid::Uuid = order["id"].as_str().unwrap().parse().unwrap();
    let addr = serve(app).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws/orders/{order_id}"))
        .await
        .unwrap();
    next_event(&mut socket, "order_changed").await;
    assert_eq!(state.dispatcher.watcher_count(order_id), 1);

    socket.close(None).await.unwrap();
    drop(socket);

    for _ in 0..100 {
        if state.dispatcher.watcher_count(order_id) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("watcher still registered after the client left");
}

#[tokio::test]
async fn websocket_for_unknown_order_is_refused() {
    let (app, _state, _rx) = setup();
    let addr = serve(app).await;

    let refused = connect_async(format!(
        "ws://{addr}/ws/orders/00000000-0000-0000-0000-000000000000"
    ))
    .await;
    assert!(refused.is_err());
}
