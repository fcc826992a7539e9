//! Axum JSON surface over the persisted collections plus a manual aggregation trigger.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use marquee_core::{normalize_title, Show};
use marquee_sync::{maybe_build_scheduler, CycleError, SyncConfig, SyncPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "marquee-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TitleQuery {
    title: Option<String>,
}

impl TitleQuery {
    fn required(&self) -> Result<&str, ApiError> {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Parameter 'title' is required."))
    }
}

#[derive(Debug, Deserialize, Default)]
struct ScrapeQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct PriceRow {
    title: String,
    price: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { message: self.message })).into_response()
    }
}

impl From<CycleError> for ApiError {
    fn from(err: CycleError) -> Self {
        let status = match &err {
            CycleError::AlreadyRunning => StatusCode::CONFLICT,
            CycleError::UnknownSource(_) => StatusCode::NOT_FOUND,
            CycleError::Persist(_) | CycleError::SourceFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "aggregation request failed");
        }
        Self::new(status, err.to_string())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/shows", get(shows_handler))
        .route("/api/shows/details", get(show_details_handler))
        .route("/api/reviews", get(reviews_handler))
        .route("/api/prices", get(prices_handler))
        .route("/api/scrape", post(scrape_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind_addr: &str, pipeline: Arc<SyncPipeline>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "marquee api listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

/// Serves the API and, when enabled, runs the aggregation scheduler alongside it.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
    let scheduler = maybe_build_scheduler(&config, pipeline.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "aggregation scheduler started");
    }
    serve(&config.bind_addr, pipeline).await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn shows_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.gateway().load_shows().await).into_response()
}

async fn find_show(state: &AppState, title: &str) -> Option<Show> {
    let key = normalize_title(title);
    state
        .pipeline
        .gateway()
        .load_shows()
        .await
        .into_iter()
        .find(|s| s.normalized_title == key)
}

async fn show_details_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TitleQuery>,
) -> Result<Json<Show>, ApiError> {
    let title = query.required()?;
    find_show(&state, title)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("Show with title '{title}' not found.")))
}

async fn reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TitleQuery>,
) -> Result<Response, ApiError> {
    let needle = normalize_title(query.required()?);
    let reviews = state
        .pipeline
        .gateway()
        .load_reviews()
        .await
        .into_iter()
        .filter(|r| r.title.to_lowercase().contains(&needle))
        .collect::<Vec<_>>();
    Ok(Json(reviews).into_response())
}

async fn prices_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TitleQuery>,
) -> Result<Json<PriceRow>, ApiError> {
    let title = query.required()?;
    let show = find_show(&state, title).await;
    show.as_ref()
        .and_then(|s| {
            s.attribute("price").map(|price| PriceRow {
                title: s.title.clone(),
                price: price.to_string(),
            })
        })
        .map(Json)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("Price data not found for show '{title}'."),
            )
        })
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScrapeQuery>,
) -> Result<Response, ApiError> {
    let report = state.pipeline.run_aggregation_cycle(query.limit).await?;
    Ok(Json(report).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use marquee_adapters::{AdapterContext, AdapterError, SourceAdapter};
    use marquee_core::{ListingDraft, RawRecord, RecordKind, Review};
    use marquee_storage::{Collection, HttpClientConfig, HttpFetcher, MemoryStore, PersistenceGateway};
    use marquee_sync::{FetchOrchestrator, SourceKindPolicy};
    use serde_json::Value;
    use tower::ServiceExt;

    struct SlowListing;

    #[async_trait]
    impl SourceAdapter for SlowListing {
        fn name(&self) -> &'static str {
            "london-theatre"
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            ctx: &AdapterContext,
            limit: Option<usize>,
        ) -> Result<Vec<ListingDraft>, AdapterError> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(["Wicked", "Matilda"]
                .into_iter()
                .take(limit.unwrap_or(usize::MAX))
                .map(|t| ListingDraft::new(self.name(), t, ctx.scraped_at))
                .collect())
        }
    }

    fn record(kind: RecordKind, title: &str, price: Option<&str>) -> RawRecord {
        RawRecord::from_draft(
            ListingDraft::new("london-theatre", title, Utc::now())
                .with_attribute("price", price.map(str::to_string)),
            kind,
        )
    }

    async fn seeded_state(store: MemoryStore) -> AppState {
        let shows = vec![
            Show::from_record(&record(RecordKind::Show, "Hamlet", Some("£45"))),
            Show::from_record(&record(RecordKind::Show, "Cats", None)),
        ];
        let reviews = vec![
            Review::from_record(&record(RecordKind::Review, "Hamlet review: a triumph", None)),
            Review::from_record(&record(RecordKind::Review, "Cats", None)),
        ];
        store
            .put_raw(Collection::Shows, serde_json::to_vec(&shows).unwrap())
            .await;
        store
            .put_raw(Collection::Reviews, serde_json::to_vec(&reviews).unwrap())
            .await;

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let orchestrator = FetchOrchestrator::new(http, SourceKindPolicy::default(), Duration::from_secs(5));
        let pipeline = SyncPipeline::new(
            orchestrator,
            vec![Box::new(SlowListing)],
            PersistenceGateway::new(Arc::new(store)),
        );
        AppState::new(Arc::new(pipeline))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn scrape_request(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = app(seeded_state(MemoryStore::new()).await);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn lists_persisted_shows() {
        let (status, body) = get(app(seeded_state(MemoryStore::new()).await), "/api/shows").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(2));
        assert_eq!(body[0]["title"], "Hamlet");
    }

    #[tokio::test]
    async fn show_details_match_on_normalized_title() {
        let app = app(seeded_state(MemoryStore::new()).await);
        let (status, body) = get(app.clone(), "/api/shows/details?title=%20hAmLeT").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["normalizedTitle"], "hamlet");

        let (status, body) = get(app.clone(), "/api/shows/details?title=Hamlet%202").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("not found"));

        let (status, _) = get(app, "/api/shows/details").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reviews_match_by_contained_title() {
        let app = app(seeded_state(MemoryStore::new()).await);
        let (status, body) = get(app.clone(), "/api/reviews?title=HAMLET").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, body) = get(app, "/api/reviews?title=%20%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Parameter 'title' is required.");
    }

    #[tokio::test]
    async fn prices_require_a_price_attribute() {
        let app = app(seeded_state(MemoryStore::new()).await);
        let (status, body) = get(app.clone(), "/api/prices?title=hamlet").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Hamlet");
        assert_eq!(body["price"], "£45");

        let (status, _) = get(app, "/api/prices?title=Cats").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scrape_runs_a_cycle_and_returns_the_report() {
        let app = app(seeded_state(MemoryStore::new()).await);
        let resp = app
            .clone()
            .oneshot(scrape_request("/api/scrape?limit=1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body: Value = serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
        assert_eq!(body["summary"]["totalShows"], 3);
        assert_eq!(body["summary"]["successfulSources"], 1);

        let (_, shows) = get(app, "/api/shows").await;
        assert_eq!(shows[2]["title"], "Wicked");
    }

    #[tokio::test]
    async fn overlapping_scrape_is_rejected_with_conflict() {
        let app = app(seeded_state(MemoryStore::new()).await);
        let (first, second) = tokio::join!(
            app.clone().oneshot(scrape_request("/api/scrape")),
            app.clone().oneshot(scrape_request("/api/scrape"))
        );
        let mut statuses = vec![first.unwrap().status(), second.unwrap().status()];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
    }

    #[tokio::test]
    async fn persistence_failure_maps_to_server_error() {
        let app = app(seeded_state(MemoryStore::rejecting_writes()).await);
        let resp = app.oneshot(scrape_request("/api/scrape")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
