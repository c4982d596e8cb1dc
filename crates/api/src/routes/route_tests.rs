//! Router tests driving handlers through `oneshot`

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        Router,
    };
    use estate_billing::{
        sign_payload, BillingService, CheckoutCompleted, InMemoryBillingStore, InvoiceSummary,
        MockPaymentProcessor, PlanCatalog, PlanReferenceTable, RecordingNotifier,
    };
    use estate_shared::{PlanTier, TenantId};
    use serde_json::{json, Value};
    use time::{Duration, OffsetDateTime};
    use tower::ServiceExt;

    use crate::{
        auth::JwtManager, config::Config, routes::create_router,
        routes::webhooks::SIGNATURE_HEADER, state::AppState,
    };

    const JWT_SECRET: &str = "route-test-jwt-secret";
    const WEBHOOK_SECRET: &str = "whsec_route_test";

    struct TestApp {
        router: Router,
        store: Arc<InMemoryBillingStore>,
        processor: Arc<MockPaymentProcessor>,
        billing: Arc<BillingService>,
    }

    fn config(enable_billing: bool) -> Config {
        Config {
            bind_address: "127.0.0.1:0".into(),
            database_url: "postgres://localhost/unused".into(),
            jwt_secret: JWT_SECRET.into(),
            enable_billing,
            run_migrations: false,
            allowed_origins: vec![],
        }
    }

    fn test_app() -> TestApp {
        let store = Arc::new(InMemoryBillingStore::new());
        let processor = Arc::new(MockPaymentProcessor::new());
        let billing = Arc::new(BillingService::new(
            PlanCatalog::new(
                PlanReferenceTable::new(3)
                    .with_reference("pro-price-id", PlanTier::Pro)
                    .with_reference("elite-price-id", PlanTier::Elite),
            ),
            WEBHOOK_SECRET,
            store.clone(),
            store.clone(),
            processor.clone(),
            Arc::new(RecordingNotifier::new()),
        ));
        let state = AppState::with_billing(config(true), Some(billing.clone()));
        TestApp {
            router: create_router(state),
            store,
            processor,
            billing,
        }
    }

    fn bearer(tenant: TenantId) -> String {
        let token = JwtManager::new(JWT_SECRET)
            .issue(tenant, Duration::hours(1))
            .unwrap();
        format!("Bearer {}", token)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str, tenant: Option<TenantId>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(tenant) = tenant {
            builder = builder.header(AUTHORIZATION, bearer(tenant));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn webhook(payload: &[u8], signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/billing/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(payload.to_vec())).unwrap()
    }

    fn signed(payload: &[u8]) -> Option<String> {
        Some(sign_payload(WEBHOOK_SECRET, OffsetDateTime::now_utc().unix_timestamp(), payload).unwrap())
    }

    fn checkout_event(event_id: &str, tenant: TenantId, sub_id: &str) -> Vec<u8> {
        let now = OffsetDateTime::now_utc();
        serde_json::to_vec(&json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": now.unix_timestamp(),
            "data": { "object": {
                "client_reference_id": tenant.to_string(),
                "mode": "subscription",
                "subscription": {
                    "id": sub_id,
                    "current_period_end": (now + Duration::days(30)).unix_timestamp(),
                    "items": { "data": [ { "price": { "id": "pro-price-id" } } ] }
                }
            }}
        }))
        .unwrap()
    }

    async fn subscribe(app: &TestApp, tenant: TenantId, period_end: OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        app.billing
            .reconciler
            .apply_checkout_completed(&CheckoutCompleted {
                tenant_id: tenant,
                external_subscription_id: format!("sub_{tenant}"),
                external_plan_reference: "pro-price-id".into(),
                period_end,
                occurred_at: now,
            })
            .await
            .unwrap();
    }

    // =========================================================================
    // Webhook
    // =========================================================================

    #[tokio::test]
    async fn test_webhook_applies_then_deduplicates() {
        let app = test_app();
        let tenant = TenantId::new();
        let payload = checkout_event("evt_1", tenant, "sub_1");

        let (status, body) = send(&app.router, webhook(&payload, signed(&payload))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "processed");

        let (status, body) = send(&app.router, webhook(&payload, signed(&payload))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_processed");

        assert_eq!(app.store.subscriptions_for(tenant).await.len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_unexpanded_checkout_retried_until_processor_answers() {
        let app = test_app();
        let tenant = TenantId::new();
        let payload = serde_json::to_vec(&json!({
            "id": "evt_unexpanded",
            "type": "checkout.session.completed",
            "created": OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "object": {
                "client_reference_id": tenant.to_string(),
                "mode": "subscription",
                "subscription": "sub_plain"
            }}
        }))
        .unwrap();
        app.processor.set_price_id("elite-price-id").await;
        app.processor.set_failing(true);

        let (status, body) = send(&app.router, webhook(&payload, signed(&payload))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "PROCESSOR_ERROR");
        assert!(app.store.subscriptions_for(tenant).await.is_empty());

        app.processor.set_failing(false);
        let (status, _) = send(&app.router, webhook(&payload, signed(&payload))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app.router, get("/api/v1/subscriptions/me", Some(tenant))).await;
        assert_eq!(body["tier"], "elite");
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_or_missing_signature() {
        let app = test_app();
        let payload = checkout_event("evt_1", TenantId::new(), "sub_1");

        let forged = Some(sign_payload("whsec_wrong", OffsetDateTime::now_utc().unix_timestamp(), &payload).unwrap());
        let (status, body) = send(&app.router, webhook(&payload, forged)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_SIGNATURE");

        let (status, _) = send(&app.router, webhook(&payload, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.store.processed_event_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_unknown_subscription_is_404() {
        let app = test_app();
        let now = OffsetDateTime::now_utc();
        let payload = serde_json::to_vec(&json!({
            "id": "evt_early",
            "type": "customer.subscription.updated",
            "created": now.unix_timestamp(),
            "data": { "object": {
                "id": "sub_not_yet",
                "status": "active",
                "cancel_at_period_end": false,
                "current_period_end": (now + Duration::days(30)).unix_timestamp(),
            }}
        }))
        .unwrap();

        let (status, body) = send(&app.router, webhook(&payload, signed(&payload))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_SUBSCRIPTION");
    }

    #[tokio::test]
    async fn test_billing_disabled_returns_503() {
        let state = AppState::with_billing(config(false), None);
        let router = create_router(state);
        let payload = b"{}".to_vec();

        let (status, body) = send(&router, webhook(&payload, signed(&payload))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "BILLING_DISABLED");

        let (status, _) = send(&router, get("/api/v1/entitlements", Some(TenantId::new()))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[tokio::test]
    async fn test_health_and_plans_are_public() {
        let app = test_app();
        let (status, _) = send(&app.router, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app.router, get("/api/v1/subscriptions/plans", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["table_version"], 3);
        assert_eq!(body["plans"].as_array().unwrap().len(), 3);
        assert_eq!(body["plans"][1]["tier"], "pro");
        assert_eq!(body["plans"][1]["price_ids"], json!(["pro-price-id"]));
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let app = test_app();
        for uri in [
            "/api/v1/subscriptions/me",
            "/api/v1/entitlements",
            "/api/v1/quota/listings",
        ] {
            let (status, _) = send(&app.router, get(uri, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_entitlements_reports_usage() {
        let app = test_app();
        let tenant = TenantId::new();
        subscribe(&app, tenant, OffsetDateTime::now_utc() + Duration::days(20)).await;
        app.store.set_listing_count(tenant, 4).await;

        let (status, body) = send(&app.router, get("/api/v1/entitlements", Some(tenant))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tier"], "pro");
        assert_eq!(body["listing_count"], 4);
        assert_eq!(body["listings_remaining"], 21);

        let (status, body) = send(&app.router, get("/api/v1/subscriptions/me", Some(tenant))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscription"]["status"], "active");
    }

    // =========================================================================
    // Quota
    // =========================================================================

    #[tokio::test]
    async fn test_listing_quota_denial_payload() {
        let app = test_app();
        let tenant = TenantId::new();

        let (status, body) = send(&app.router, get("/api/v1/quota/listings", Some(tenant))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);

        app.store.set_listing_count(tenant, 1).await;
        let (status, body) = send(&app.router, get("/api/v1/quota/listings", Some(tenant))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "QUOTA_EXCEEDED");
        assert_eq!(body["current_count"], 1);
        assert_eq!(body["limit"], 1);
        assert_eq!(body["tier"], "free");
    }

    #[tokio::test]
    async fn test_feature_gate_routes() {
        let app = test_app();
        let tenant = TenantId::new();

        let (status, body) = send(&app.router, get("/api/v1/quota/features/lead_form", Some(tenant))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["resource"]["feature"], "lead_form");

        subscribe(&app, tenant, OffsetDateTime::now_utc() + Duration::days(20)).await;
        let (status, _) = send(&app.router, get("/api/v1/quota/features/lead_form", Some(tenant))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app.router, get("/api/v1/quota/features/teleport", Some(tenant))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let app = test_app();
        app.store.set_fail_reads(true);

        let (status, body) =
            send(&app.router, get("/api/v1/quota/listings", Some(TenantId::new()))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "ENTITLEMENT_UNAVAILABLE");
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    fn cancel(tenant: TenantId) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/v1/subscriptions/cancel")
            .header(AUTHORIZATION, bearer(tenant))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_cancel_flow() {
        let app = test_app();
        let tenant = TenantId::new();

        let (status, body) = send(&app.router, cancel(tenant)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NO_ACTIVE_SUBSCRIPTION");

        let period_end = OffsetDateTime::now_utc() + Duration::days(10);
        subscribe(&app, tenant, period_end).await;
        app.processor.set_period_end(period_end).await;

        let (status, body) = send(&app.router, cancel(tenant)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelling");
        assert_eq!(body["days_remaining"], 10);

        let (status, body) = send(&app.router, cancel(tenant)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ALREADY_CANCELLING");
    }

    #[tokio::test]
    async fn test_cancel_processor_failure_is_502() {
        let app = test_app();
        let tenant = TenantId::new();
        subscribe(&app, tenant, OffsetDateTime::now_utc() + Duration::days(10)).await;
        app.processor.set_failing(true);

        let (status, body) = send(&app.router, cancel(tenant)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "PROCESSOR_ERROR");

        let record = app.store.subscriptions_for(tenant).await.remove(0);
        assert_eq!(record.status, estate_shared::SubscriptionStatus::Active);
    }

    // =========================================================================
    // Checkout, portal, invoices
    // =========================================================================

    fn post_json(uri: &str, tenant: TenantId, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(AUTHORIZATION, bearer(tenant))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_checkout_returns_hosted_url() {
        let app = test_app();
        let tenant = TenantId::new();

        let (status, body) = send(
            &app.router,
            post_json(
                "/api/v1/subscriptions/checkout",
                tenant,
                json!({ "price_id": "elite-price-id" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().starts_with("https://"));

        let requests = app.processor.checkouts().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tenant_id, tenant);
        assert_eq!(requests[0].price_id, "elite-price-id");
        assert!(app.store.subscriptions_for(tenant).await.is_empty(), "recorded by webhook only");
    }

    #[tokio::test]
    async fn test_checkout_rejects_free_or_missing_price() {
        let app = test_app();
        let tenant = TenantId::new();

        let (status, body) = send(
            &app.router,
            post_json(
                "/api/v1/subscriptions/checkout",
                tenant,
                json!({ "price_id": "price_free_forever" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "UNKNOWN_PRICE");

        let (status, body) = send(
            &app.router,
            post_json("/api/v1/subscriptions/checkout", tenant, json!({ "price_id": " " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(app.processor.checkouts().await.is_empty());
    }

    #[tokio::test]
    async fn test_checkout_processor_failure_is_502() {
        let app = test_app();
        app.processor.set_failing(true);

        let (status, body) = send(
            &app.router,
            post_json(
                "/api/v1/subscriptions/checkout",
                TenantId::new(),
                json!({ "price_id": "pro-price-id" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "PROCESSOR_ERROR");
    }

    #[tokio::test]
    async fn test_portal_session() {
        let app = test_app();
        let tenant = TenantId::new();

        let (status, body) = send(
            &app.router,
            post_json("/api/v1/subscriptions/portal", tenant, json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NO_ACTIVE_SUBSCRIPTION");

        subscribe(&app, tenant, OffsetDateTime::now_utc() + Duration::days(30)).await;
        let (status, body) = send(
            &app.router,
            post_json("/api/v1/subscriptions/portal", tenant, json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().contains(&format!("sub_{tenant}")));
        assert_eq!(app.processor.portal_returns().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invoice_history() {
        let app = test_app();
        let tenant = TenantId::new();

        let (status, body) = send(&app.router, get("/api/v1/subscriptions/invoices", Some(tenant))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["invoices"], json!([]));

        subscribe(&app, tenant, OffsetDateTime::now_utc() + Duration::days(30)).await;
        app.processor
            .set_invoices(vec![InvoiceSummary {
                id: "in_1".into(),
                number: Some("EP-0001".into()),
                status: Some("paid".into()),
                amount_due: 2900,
                amount_paid: 2900,
                currency: Some("usd".into()),
                created_at: None,
                hosted_invoice_url: None,
                pdf: Some("https://files.example.com/in_1.pdf".into()),
            }])
            .await;

        let (status, body) = send(&app.router, get("/api/v1/subscriptions/invoices", Some(tenant))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["invoices"][0]["number"], "EP-0001");
        assert_eq!(body["invoices"][0]["amount_paid"], 2900);
        assert_eq!(body["invoices"][0]["pdf"], "https://files.example.com/in_1.pdf");
    }
}
