//! Axum router configuration with middleware.
//!
//! All REST routes are under `/api/v1/`; the event stream is at
//! `/ws/events`. Middleware: CORS, tracing.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Templates
        .route(
            "/templates",
            post(handlers::template::create_template).get(handlers::template::list_templates),
        )
        .route(
            "/templates/{id}",
            get(handlers::template::get_template).put(handlers::template::update_template),
        )
        .route(
            "/templates/{id}/deactivate",
            post(handlers::template::deactivate_template),
        )
        .route(
            "/templates/{id}/start",
            post(handlers::template::start_workflow),
        )
        // Instances
        .route(
            "/workflows/trigger",
            post(handlers::instance::trigger_workflow),
        )
        .route("/instances/{id}", get(handlers::instance::get_instance))
        .route(
            "/instances/{id}/history",
            get(handlers::instance::instance_history),
        )
        .route(
            "/instances/{id}/cancel",
            post(handlers::instance::cancel_instance),
        )
        // Approval requests
        .route("/approvals", get(handlers::approval::list_approvals))
        .route("/approvals/stats", get(handlers::approval::approval_stats))
        .route("/approvals/bulk", post(handlers::approval::bulk_action))
        .route("/approvals/{id}", get(handlers::approval::get_approval))
        .route("/approvals/{id}/review", post(handlers::approval::review))
        .route(
            "/approvals/{id}/start-review",
            post(handlers::approval::start_review),
        )
        .route("/approvals/{id}/reopen", post(handlers::approval::reopen))
        .route(
            "/approvals/{id}/comments",
            get(handlers::approval::list_comments).post(handlers::approval::add_comment),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/events", get(handlers::ws::ws_handler))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Store reachability and live connection counts (no caller required).
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let (status, store) = match state.db_pool.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::error!(error = %e, "health check could not reach the store");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };
    let body = serde_json::json!({
        "status": if status.is_success() { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "store": store,
        "connections": state.hub.total_connections(),
        "connected_users": state.hub.connected_users(),
    });
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use gatekeep_types::identity::{User, permissions};

    use crate::http::extractors::caller::USER_HEADER;
    use crate::state::test_support::test_state;

    struct Fixture {
        app: Router,
        state: AppState,
        admin: User,
        requester: User,
        alice: User,
    }

    async fn fixture() -> Fixture {
        let state = test_state().await;
        let dir = &state.directory;
        let company = dir.create_company("Acme").await.unwrap();
        let admin = dir.create_user(company, "Admin", None).await.unwrap();
        let requester = dir.create_user(company, "Requester", None).await.unwrap();
        let alice = dir.create_user(company, "Alice", Some("alice@acme.test")).await.unwrap();
        dir.grant_permission(&admin.id, permissions::CREATE_WORKFLOW).await.unwrap();
        dir.grant_permission(&requester.id, permissions::TRIGGER_WORKFLOW).await.unwrap();

        Fixture {
            app: build_router(state.clone()),
            state,
            admin,
            requester,
            alice,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, user: Option<&User>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user.id.to_string());
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn single_step_template(assignee: &User) -> Value {
        json!({
            "name": "PO approval",
            "entity_type": "purchase_order",
            "steps": [{
                "step_number": 1,
                "name": "Manager",
                "type": "approval",
                "assignee_type": "user",
                "assignee_user_id": assignee.id,
            }]
        })
    }

    #[tokio::test]
    async fn test_health_needs_no_caller() {
        let f = fixture().await;
        let (status, body) = call(&f.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized() {
        let f = fixture().await;
        let (status, body) = call(&f.app, "GET", "/api/v1/approvals", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errors"][0]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_template_validation_reports_all_violations() {
        let f = fixture().await;
        let draft = json!({
            "name": "",
            "entity_type": "invoice",
            "steps": [{
                "step_number": 2,
                "name": "Finance",
                "type": "approval",
                "assignee_type": "user",
                "assignee_user_id": f.alice.id,
            }]
        });
        let (status, body) = call(&f.app, "POST", "/api/v1/templates", Some(&f.admin), Some(draft)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"].as_array().unwrap().len() >= 2, "{body}");
    }

    #[tokio::test]
    async fn test_create_template_requires_permission() {
        let f = fixture().await;
        let (status, body) = call(
            &f.app,
            "POST",
            "/api/v1/templates",
            Some(&f.alice),
            Some(single_step_template(&f.alice)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["errors"][0]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_start_review_and_double_decision() {
        let f = fixture().await;
        let (status, body) = call(
            &f.app,
            "POST",
            "/api/v1/templates",
            Some(&f.admin),
            Some(single_step_template(&f.alice)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let template_id = body["data"]["id"].as_str().unwrap().to_string();

        let mut requester_events = f.state.hub.register(f.requester.id, f.requester.company_id);

        let entity = json!({
            "entity_type": "purchase_order",
            "entity_id": "po-1",
            "snapshot": {"number": "PO-1", "total": 12000},
        });
        let (status, body) = call(
            &f.app,
            "POST",
            &format!("/api/v1/templates/{template_id}/start"),
            Some(&f.requester),
            Some(entity),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let instance_id = body["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["data"]["status"], "running");

        let (status, body) = call(&f.app, "GET", "/api/v1/approvals?status=pending", Some(&f.alice), None).await;
        assert_eq!(status, StatusCode::OK);
        let requests = body["data"].as_array().unwrap();
        assert_eq!(requests.len(), 1);
        let approval_id = requests[0]["id"].as_str().unwrap().to_string();

        let decision = json!({"decision": "approved", "reason": "within budget"});
        let review_uri = format!("/api/v1/approvals/{approval_id}/review");
        let (status, body) = call(&f.app, "POST", &review_uri, Some(&f.alice), Some(decision.clone())).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["status"], "approved");

        let (status, body) = call(&f.app, "POST", &review_uri, Some(&f.alice), Some(decision)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errors"][0]["code"], "ALREADY_RESOLVED");

        let (status, body) = call(
            &f.app,
            "GET",
            &format!("/api/v1/instances/{instance_id}"),
            Some(&f.requester),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["instance"]["status"], "completed");

        let mut kinds = Vec::new();
        while let Some(frame) = requester_events.try_recv() {
            let event: Value = serde_json::from_str(&frame).unwrap();
            kinds.push(event["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("connected"));
        assert!(kinds.iter().any(|k| k == "approval_status_changed"), "{kinds:?}");
    }

    #[tokio::test]
    async fn test_other_company_sees_not_found() {
        let f = fixture().await;
        let (_, body) = call(
            &f.app,
            "POST",
            "/api/v1/templates",
            Some(&f.admin),
            Some(single_step_template(&f.alice)),
        )
        .await;
        let template_id = body["data"]["id"].as_str().unwrap().to_string();

        let other = f.state.directory.create_company("Globex").await.unwrap();
        let outsider = f.state.directory.create_user(other, "Outsider", None).await.unwrap();
        let (status, _) = call(
            &f.app,
            "GET",
            &format!("/api/v1/templates/{template_id}"),
            Some(&outsider),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bulk_rejects_unknown_action() {
        let f = fixture().await;
        let body = json!({"approval_ids": [], "action": "delegated"});
        let (status, body) = call(&f.app, "POST", "/api/v1/approvals/bulk", Some(&f.alice), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "UNSUPPORTED_DECISION");
    }
}
