//! HTTP surface for the Trustlink escrow node
//!
//! Marketplace endpoints, the Coinbase Commerce webhook and the
//! token-protected arbitration endpoints.

pub mod disputes;
pub mod error;
pub mod listings;
pub mod middleware;
pub mod transactions;
pub mod users;
pub mod webhooks;

use std::{future::Future, sync::Arc};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use escrow_engine::node::{EscrowNode, NodeHealth};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<EscrowNode>,
    pub admin_token: Option<String>,
}

/// Build the application router
pub fn router(state: ApiState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route(
            "/api/groups/listings/",
            get(listings::list_listings).post(listings::create_listing),
        )
        .route("/api/groups/listings/:id/", get(listings::get_listing))
        .route(
            "/api/groups/listings/:id/verify/",
            post(listings::verify_listing),
        )
        .route("/api/users/", post(users::register_user))
        .route(
            "/api/escrow/transactions/",
            get(transactions::list_transactions).post(transactions::create_transaction),
        )
        .route(
            "/api/escrow/transactions/:id/",
            get(transactions::get_transaction),
        )
        .route(
            "/api/escrow/transactions/:id/transfer/",
            post(transactions::start_transfer),
        )
        .route(
            "/api/escrow/transactions/:id/confirm/",
            post(transactions::confirm_transfer),
        )
        .route("/api/escrow/disputes/", post(disputes::open_dispute))
        .route("/escrow/webhooks/coinbase/", post(webhooks::coinbase));

    let admin_routes = Router::new()
        .route(
            "/api/escrow/disputes/:transaction_id/resolve/",
            post(disputes::resolve_dispute),
        )
        .route("/api/admin/alerts/", get(disputes::list_alerts))
        .route(
            "/api/admin/users/:telegram_id/suspend/",
            post(users::suspend_user),
        )
        .route(
            "/api/admin/listings/:id/suspend/",
            post(listings::suspend_listing),
        )
        .route(
            "/api/admin/transactions/:id/charge/",
            get(transactions::charge_status),
        )
        .route("/api/admin/monitor/flags/", get(listings::monitor_flags))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_admin,
        ));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Trustlink API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(state): State<ApiState>) -> Json<NodeHealth> {
    Json(state.node.health_check().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use escrow_engine::{
        clock::SystemClock,
        models::TelegramId,
        node::EscrowNodeConfig,
        ownership::{GroupRef, OwnershipStatus, OwnershipVerifier},
        payment_gateway::GatewayConfig,
        settlement::LedgerSettlement,
        EscrowResult,
    };
    use hmac::{Hmac, Mac};
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tower::ServiceExt;

    const SECRET: &str = "test-webhook-secret";
    const ADMIN: &str = "admin-token";
    const BUYER: TelegramId = 111;
    const SELLER: TelegramId = 222;

    struct CreatorVerifier;

    #[async_trait]
    impl OwnershipVerifier for CreatorVerifier {
        async fn check(&self, _group: &GroupRef, _user_id: TelegramId) -> EscrowResult<OwnershipStatus> {
            Ok(OwnershipStatus::from_member_status("creator"))
        }
    }

    fn app() -> Router {
        let config = EscrowNodeConfig {
            gateway: GatewayConfig {
                webhook_secret: SECRET.to_string(),
                ..GatewayConfig::default()
            },
            ..EscrowNodeConfig::default()
        };
        let node = EscrowNode::with_components(
            config,
            Arc::new(CreatorVerifier),
            Arc::new(LedgerSettlement::new()),
            Arc::new(SystemClock),
        )
        .unwrap();

        router(ApiState {
            node: Arc::new(node),
            admin_token: Some(ADMIN.to_string()),
        })
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn admin_req(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Admin-Token", ADMIN)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn webhook(body: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/escrow/webhooks/coinbase/")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("X-CC-Webhook-Signature", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn confirmed_event(event_id: &str, transaction_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "delivery",
            "event": {
                "id": event_id,
                "type": "charge:confirmed",
                "data": {
                    "code": "CHG1",
                    "metadata": { "transaction_id": transaction_id },
                    "payments": [{ "network": "ethereum", "transaction_id": "0xbeef" }]
                }
            }
        }))
        .unwrap()
    }

    /// Registers both parties, lists and verifies a group, opens a purchase
    async fn open_purchase(app: &Router) -> String {
        for id in [BUYER, SELLER] {
            let (status, _) = send(app, post_json("/api/users/", json!({ "telegram_id": id }))).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, listing) = send(
            app,
            post_json(
                "/api/groups/listings/",
                json!({
                    "owner_id": SELLER,
                    "group_id": -1001,
                    "group_username": "rustaceans",
                    "title": "Rustaceans",
                    "description": "Rust chat",
                    "member_count": 900,
                    "price": "100",
                    "currency": "USDT",
                    "category": "tech"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let listing_id = listing["id"].as_str().unwrap().to_string();

        let (status, verified) = send(
            app,
            post_json(
                &format!("/api/groups/listings/{}/verify/", listing_id),
                json!({ "owner_id": SELLER }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verified["status"], "active");

        let (status, tx) = send(
            app,
            post_json(
                "/api/escrow/transactions/",
                json!({
                    "buyer_id": BUYER,
                    "listing_id": listing_id,
                    "amount": "100",
                    "currency": "USDT"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(tx["status"], "pending");
        tx["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_purchase_flow_end_to_end() {
        let app = app();
        let tx_id = open_purchase(&app).await;

        let (status, listed) = send(&app, get_req("/api/groups/listings/?category=tech")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let body = confirmed_event("evt-1", &tx_id);
        let (status, applied) = send(&app, webhook(body.clone(), Some(sign(&body)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(applied["status"], "applied");
        assert_eq!(applied["transaction_status"], "funded");

        let (status, duplicate) = send(&app, webhook(body.clone(), Some(sign(&body)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(duplicate["status"], "duplicate");

        let (status, _) = send(
            &app,
            post_json(
                &format!("/api/escrow/transactions/{}/transfer/", tx_id),
                json!({ "seller_id": SELLER }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, released) = send(
            &app,
            post_json(&format!("/api/escrow/transactions/{}/confirm/", tx_id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(released["status"], "released");

        let (status, detail) = send(&app, get_req(&format!("/api/escrow/transactions/{}/", tx_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["transaction"]["payment_ref"], "0xbeef");
        assert!(detail["dispute"].is_null());
        assert_eq!(detail["audit"].as_array().unwrap().len(), 6);

        // Sold groups leave the market
        let (_, listed) = send(&app, get_req("/api/groups/listings/")).await;
        assert!(listed.as_array().unwrap().is_empty());

        let (_, mine) = send(&app, get_req(&format!("/api/escrow/transactions/?party={}", BUYER))).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_rejections() {
        let app = app();
        let tx_id = open_purchase(&app).await;
        let body = confirmed_event("evt-1", &tx_id);

        let (status, _) = send(&app, webhook(body.clone(), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, err) = send(&app, webhook(body, Some("00ff".to_string()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err["kind"], "invalid_signature");

        let garbage = b"{not json".to_vec();
        let (status, _) = send(&app, webhook(garbage.clone(), Some(sign(&garbage)))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = confirmed_event("evt-2", &uuid::Uuid::new_v4().to_string());
        let (status, err) = send(&app, webhook(unknown.clone(), Some(sign(&unknown)))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_payment_after_refund_is_returned() {
        let app = app();
        let tx_id = open_purchase(&app).await;

        let (status, dispute) = send(
            &app,
            post_json(
                "/api/escrow/disputes/",
                json!({
                    "transaction_id": tx_id,
                    "opened_by": BUYER,
                    "reason": "Seller stopped answering"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(dispute["status"], "open");

        let resolve = Request::builder()
            .method("POST")
            .uri(format!("/api/escrow/disputes/{}/resolve/", tx_id))
            .header("content-type", "application/json")
            .header("X-Admin-Token", ADMIN)
            .body(Body::from(
                json!({ "ruling": { "type": "favor_buyer" }, "arbitrator": "ops" }).to_string(),
            ))
            .unwrap();
        let (status, resolution) = send(&app, resolve).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolution["transaction"]["status"], "refunded");

        let body = confirmed_event("evt-late", &tx_id);
        let (status, applied) = send(&app, webhook(body.clone(), Some(sign(&body)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(applied["status"], "applied");
        assert_eq!(applied["transaction_status"], "refunded");

        // Redelivery is acknowledged without paying twice
        let (status, duplicate) = send(&app, webhook(body.clone(), Some(sign(&body)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(duplicate["status"], "duplicate");

        let (_, detail) = send(&app, get_req(&format!("/api/escrow/transactions/{}/", tx_id))).await;
        let late_refunds: Vec<&Value> = detail["audit"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["action"] == "funds_refunded" && e["details"]["late_payment"] == true)
            .collect();
        assert_eq!(late_refunds.len(), 1);
        assert_eq!(late_refunds[0]["details"]["payment_ref"], "0xbeef");
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let app = app();

        let (status, _) = send(&app, get_req("/api/admin/alerts/")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .uri("/api/admin/alerts/")
            .header("X-Admin-Token", "guess")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let ok = Request::builder()
            .uri("/api/admin/alerts/")
            .header("X-Admin-Token", ADMIN)
            .body(Body::empty())
            .unwrap();
        let (status, alerts) = send(&app, ok).await;
        assert_eq!(status, StatusCode::OK);
        assert!(alerts.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_suspends_user_and_listing() {
        let app = app();
        let tx_id = open_purchase(&app).await;
        let (_, detail) = send(&app, get_req(&format!("/api/escrow/transactions/{}/", tx_id))).await;
        let listing_id = detail["transaction"]["listing_id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            post_json(&format!("/api/admin/users/{}/suspend/", SELLER), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, user) = send(
            &app,
            admin_req("POST", &format!("/api/admin/users/{}/suspend/", SELLER)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(user["registration_status"], "suspended");

        let (status, listing) = send(
            &app,
            admin_req("POST", &format!("/api/admin/listings/{}/suspend/", listing_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["status"], "suspended");

        let (_, listed) = send(&app, get_req("/api/groups/listings/")).await;
        assert!(listed.as_array().unwrap().is_empty());

        let (status, err) = send(&app, admin_req("POST", "/api/admin/users/999/suspend/")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_admin_charge_and_monitor_views() {
        let app = app();
        let tx_id = open_purchase(&app).await;

        // No Coinbase key in this node, so no hosted charge exists
        let (status, err) = send(
            &app,
            admin_req("GET", &format!("/api/admin/transactions/{}/charge/", tx_id)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["kind"], "not_found");

        let (status, flags) = send(&app, admin_req("GET", "/api/admin/monitor/flags/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(flags.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_listing_is_404() {
        let app = app();
        let (status, err) = send(
            &app,
            get_req(&format!("/api/groups/listings/{}/", uuid::Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["kind"], "not_found");
    }
}
