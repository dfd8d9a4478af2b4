use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::pipeline::PipelineContext;
use crate::scheduler::Scheduler;

#[derive(Clone)]
struct AppState {
    ctx: Arc<PipelineContext>,
    scheduler: Arc<Scheduler>,
    service: String,
}

#[derive(Deserialize)]
struct SetFeedRequest {
    handle: String,
    url: String,
}

fn router(ctx: Arc<PipelineContext>, scheduler: Arc<Scheduler>, service: String) -> Router {
    let state = AppState { ctx, scheduler, service };
    Router::new()
        .route("/setfeed", post(set_feed))
        .with_state(state)
}

/// Serve the optional add-feed HTTP resource until the process is killed.
pub async fn serve(
    addr: SocketAddr,
    ctx: Arc<PipelineContext>,
    scheduler: Arc<Scheduler>,
    service: String,
) -> anyhow::Result<()> {
    let app = router(ctx, scheduler, service);
    info!(%addr, "starting add-feed http resource");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn set_feed(
    State(state): State<AppState>,
    Json(request): Json<SetFeedRequest>,
) -> impl IntoResponse {
    if mimir_core::validate_handle(&request.handle).is_err() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_handle" })))
            .into_response();
    }

    match state.ctx.storage.set_feed_url(&request.handle, &request.url) {
        Ok(_) => {
            let scheduler = state.scheduler.clone();
            let handle = request.handle.clone();
            tokio::spawn(async move { scheduler.poll_now(handle).await });

            let uri = format!("xmpp:{}?;node=mimir/news/{}", state.service, request.handle);
            (StatusCode::OK, Json(json!({ "uri": uri }))).into_response()
        }
        Err(error) => {
            tracing::warn!(%error, "failed to persist feed from http resource");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_handle" }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = mimir_storage::FeedStorage::open(dir.path().join("feeds")).unwrap();
        let ctx = Arc::new(PipelineContext {
            storage,
            fetcher: mimir_fetcher::Fetcher::new("mimir-aggregator/test").unwrap(),
            publisher: crate::publisher::Publisher::new(
                crate::writer::AtomWriter,
                "pubsub.example.org".parse().unwrap(),
            ),
            session: mimir_session::session::test_handle().0,
        });
        let scheduler = Scheduler::new(ctx.clone());
        (router(ctx, scheduler, "pubsub.example.org".to_string()), dir)
    }

    #[tokio::test]
    async fn set_feed_accepts_a_well_formed_request() {
        let (app, _dir) = state();
        let body = json!({ "handle": "planet", "url": "https://example.org/feed" }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/setfeed")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn set_feed_rejects_an_invalid_handle() {
        let (app, _dir) = state();
        let body = json!({ "handle": "Not Valid!", "url": "https://example.org/feed" }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/setfeed")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
