//! JSON HTTP API for agents, farmers, tickets, activity and reports.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use fieldops_reports::ReportPipeline;
use fieldops_storage::{
    ActivityStore, DirectoryStore, FarmerStore, ReportPersister, Store, TicketStore,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

mod auth;
mod error;
mod handlers;
mod logging;

pub use auth::{create_token, validate_token, AuthConfig, AuthUser, Claims};
pub use error::ApiError;
pub use logging::TRACE_ID_HEADER;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

pub struct AppState {
    pub cces: Arc<dyn DirectoryStore>,
    pub farmers: Arc<dyn FarmerStore>,
    pub tickets: Arc<dyn TicketStore>,
    pub shoots: Arc<dyn ActivityStore>,
    pub reports: Arc<dyn ReportPersister>,
    pub pipeline: Arc<ReportPipeline>,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        pipeline: Arc<ReportPipeline>,
        auth: AuthConfig,
    ) -> Self {
        Self {
            cces: store.clone(),
            farmers: store.clone(),
            tickets: store.clone(),
            shoots: store.clone(),
            reports: store,
            pipeline,
            auth,
        }
    }
}

pub fn app(state: AppState) -> Router {
    use handlers::*;

    Router::new()
        .route("/health", get(health))
        .route("/cces", get(list_cces).post(create_cce))
        .route("/cces/{id}", get(get_cce).put(update_cce).delete(delete_cce))
        .route("/farmers", get(list_farmers).post(create_farmer))
        .route(
            "/farmers/{id}",
            get(get_farmer).put(update_farmer).delete(delete_farmer),
        )
        .route("/farmer/contact/{contact}", get(get_farmer_by_contact))
        .route("/tickets", get(list_tickets).post(create_ticket))
        .route(
            "/tickets/{id}",
            get(get_ticket).put(update_ticket).delete(delete_ticket),
        )
        .route("/tickets/farmer/{contact}", get(tickets_by_farmer_contact))
        .route("/tickets/cce/{id}", get(tickets_by_cce))
        .route("/tickets/cce/{id}/status/{status}", get(tickets_by_cce_and_status))
        .route("/shoots", get(list_shoots).post(record_shoot))
        .route("/shoots/range", get(shoots_in_range))
        .route("/shoots/missed", get(missed_calls))
        .route("/reports", get(list_reports))
        .route("/reports/{id}", get(get_report))
        .route("/reports/{id}/run", post(run_report))
        .layer(middleware::from_fn(logging::request_logging))
        .with_state(Arc::new(state))
}

pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "http api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving http api")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use fieldops_core::{Cce, Farmer, Shoot, ShootKind, ShootStatus};
    use fieldops_reports::{DeliveryError, MailSettings, Mailer, ReportDispatcher};
    use fieldops_storage::MemoryStore;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    struct NullMailer;

    #[async_trait::async_trait]
    impl Mailer for NullMailer {
        async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    async fn fixture() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_cce(&Cce {
                id: "A1".into(),
                name: "Alice".into(),
            })
            .await
            .unwrap();
        store
            .create_farmer(&Farmer {
                id: "F1".into(),
                name: "Ravi".into(),
                contact: "9876543210".into(),
                district: "Nashik".into(),
                crops: vec!["onion".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let dispatcher = ReportDispatcher::new(
            Arc::new(NullMailer),
            MailSettings {
                from: "reports@example.com".into(),
                recipients: vec!["ops@example.com".into()],
            },
        );
        let pipeline = Arc::new(ReportPipeline::from_store(store.clone(), dispatcher));
        let auth = AuthConfig {
            jwt_secret: SECRET.into(),
            ..Default::default()
        };
        (app(AppState::new(store.clone(), pipeline, auth)), store)
    }

    fn bearer() -> String {
        format!("Bearer {}", create_token(SECRET, "tester", 300).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: Value, auth: bool) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if auth {
            builder = builder.header(header::AUTHORIZATION, bearer());
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_carries_trace_header() {
        let (app, _) = fixture().await;
        let resp = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(&TRACE_ID_HEADER));
    }

    #[tokio::test]
    async fn each_request_gets_its_own_trace_id() {
        let (app, _) = fixture().await;
        let first = app.clone().oneshot(get_req("/cces/missing")).await.unwrap();
        let second = app.oneshot(get_req("/cces/missing")).await.unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        let a = first.headers()[&TRACE_ID_HEADER].to_str().unwrap().to_string();
        let b = second.headers()[&TRACE_ID_HEADER].to_str().unwrap().to_string();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn reads_are_public_and_writes_need_a_token() {
        let (app, _) = fixture().await;

        let resp = app.clone().oneshot(get_req("/cces/A1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["name"], "Alice");

        let resp = app
            .clone()
            .oneshot(json_req("POST", "/cces", json!({"name": "Bob"}), false))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(resp).await["error"],
            "missing authorization header"
        );

        let resp = app
            .oneshot(json_req("POST", "/cces", json!({"id": "B2", "name": "Bob"}), true))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let (app, _) = fixture().await;
        let req = Request::builder()
            .method("DELETE")
            .uri("/cces/A1")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "invalid token");
    }

    #[tokio::test]
    async fn missing_entities_are_404_json() {
        let (app, _) = fixture().await;
        let resp = app.oneshot(get_req("/farmers/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await, json!({"error": "farmer not found"}));
    }

    #[tokio::test]
    async fn farmer_filter_and_contact_lookup() {
        let (app, _) = fixture().await;
        let resp = app
            .clone()
            .oneshot(get_req("/farmers?crop=onion&district=Nashik"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let resp = app
            .clone()
            .oneshot(get_req("/farmers?crop=rice"))
            .await
            .unwrap();
        assert!(body_json(resp).await.as_array().unwrap().is_empty());

        let resp = app
            .oneshot(get_req("/farmer/contact/9876543210"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["id"], "F1");
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let (app, store) = fixture().await;
        let resp = app
            .oneshot(json_req(
                "PUT",
                "/farmers/F1",
                json!({"village": "Sinnar", "name": ""}),
                true,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let farmer = store.get_farmer("F1").await.unwrap().unwrap();
        assert_eq!(farmer.village, "Sinnar");
        assert_eq!(farmer.name, "Ravi");
    }

    #[tokio::test]
    async fn ticket_lifecycle_and_lookups() {
        let (app, _) = fixture().await;
        let resp = app
            .clone()
            .oneshot(json_req(
                "POST",
                "/tickets",
                json!({"id": "T1", "farmerId": "F1", "cceId": "A1", "description": "pest"}),
                true,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_json(resp).await["status"], "open");

        let resp = app
            .clone()
            .oneshot(get_req("/tickets/farmer/9876543210"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await[0]["id"], "T1");

        let resp = app
            .clone()
            .oneshot(get_req("/tickets/cce/A1/status/open"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let resp = app
            .clone()
            .oneshot(get_req("/tickets?status=open&sortBy=createdAt&sortOrder=desc"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await[0]["id"], "T1");

        let resp = app
            .clone()
            .oneshot(get_req("/tickets?limit=10"))
            .await
            .unwrap();
        let page = body_json(resp).await;
        assert_eq!(page["items"][0]["cceId"], "A1");
        assert!(page["nextToken"].is_null());

        let resp = app
            .oneshot(get_req("/tickets/cce/A1?startDate=2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn shoot_reads_validate_input() {
        let (app, store) = fixture().await;
        store
            .record_shoot(&Shoot {
                id: "s1".into(),
                farmer_id: "F1".into(),
                cce_id: "A1".into(),
                kind: ShootKind::Call,
                status: ShootStatus::Missed,
                timestamp: Utc.with_ymd_and_hms(2024, 6, 9, 10, 0, 0).unwrap(),
                duration_secs: 0,
            })
            .await
            .unwrap();

        let resp = app.clone().oneshot(get_req("/shoots?type=sms")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(get_req("/shoots/range?startDate=yesterday&endDate=today"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(get_req(
                "/shoots/range?startDate=2024-06-09T00:00:00Z&endDate=2024-06-10T00:00:00Z",
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let resp = app.oneshot(get_req("/shoots/missed")).await.unwrap();
        assert_eq!(body_json(resp).await[0]["type"], "call");
    }

    #[tokio::test]
    async fn ad_hoc_run_persists_report() {
        let (app, _) = fixture().await;
        let resp = app
            .clone()
            .oneshot(json_req("POST", "/reports/daily/run", json!({}), true))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let report = body_json(resp).await;
        assert_eq!(report["reportType"], "daily");
        assert_eq!(report["cceReports"]["A1"]["missedCalls"], 0);

        let id = report["id"].as_str().unwrap().to_string();
        let resp = app
            .clone()
            .oneshot(get_req(&format!("/reports/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get_req("/reports")).await.unwrap();
        assert_eq!(body_json(resp).await[0]["agentCount"], 1);
    }

    #[tokio::test]
    async fn unknown_report_kind_is_400() {
        let (app, store) = fixture().await;
        let resp = app
            .oneshot(json_req("POST", "/reports/hourly/run", json!({}), true))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.list_recent_reports(5).await.unwrap().is_empty());
    }
}
