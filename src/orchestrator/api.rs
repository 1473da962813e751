//! HTTP entrypoint for triggers.
//!
//! Every method on every path reaches the dispatcher, which does its own
//! bearer check. Only `/health` is answered without authentication.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::orchestrator::dispatcher::{DispatchOutcome, Dispatcher};
use crate::orchestrator::trigger::TriggerRequest;

/// The public trigger server.
pub struct EntrypointApi;

impl EntrypointApi {
    /// Build the axum router.
    pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .fallback(trigger_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(dispatcher)
    }

    /// Bind the listener, returning it with the actual address (useful with
    /// port 0).
    pub async fn bind(
        addr: SocketAddr,
    ) -> Result<(tokio::net::TcpListener, SocketAddr), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        Ok((listener, local))
    }

    /// Serve on an already-bound listener until the process exits.
    pub async fn serve(
        dispatcher: Arc<Dispatcher>,
        listener: tokio::net::TcpListener,
    ) -> Result<(), std::io::Error> {
        axum::serve(listener, Self::router(dispatcher)).await
    }

    /// Bind and serve.
    pub async fn start(
        dispatcher: Arc<Dispatcher>,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (listener, local) = Self::bind(addr).await?;
        tracing::info!(context = ?dispatcher.context(), "Trigger endpoint listening on {}", local);
        Self::serve(dispatcher, listener).await?;
        Ok(())
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn trigger_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trigger = TriggerRequest::new(method, &uri, headers, body);

    // Own task: a caller hanging up must not abort provisioning halfway.
    let outcome = match tokio::spawn(async move { dispatcher.dispatch(trigger).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "Dispatch task panicked");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };

    match outcome {
        Ok(DispatchOutcome::Unauthorized) => {
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
        Ok(DispatchOutcome::Started(_)) => (StatusCode::OK, "Started").into_response(),
        Ok(DispatchOutcome::Accepted(task)) => {
            tokio::spawn(async move {
                if let Err(e) = task.join().await {
                    tracing::debug!(error = %e, "Background job ended with error");
                }
            });
            (StatusCode::ACCEPTED, "Running...").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Trigger failed");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{Config, EnvSource};
    use crate::testing::{MockPlatform, RecordingJob, spawn_capture_server};

    fn dispatcher(pairs: &[(&str, &str)], platform: Arc<MockPlatform>, job: Arc<RecordingJob>) -> Arc<Dispatcher> {
        let mut all = vec![
            ("SANDBOX_SOURCE_URL", "https://github.com/acme/jobs.git"),
            ("READINESS_DELAY_MS", "1"),
        ];
        all.extend_from_slice(pairs);
        let config = Config::resolve(&EnvSource::from_pairs(all)).unwrap();
        Arc::new(Dispatcher::from_config(&config, platform, job).unwrap())
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let router = EntrypointApi::router(dispatcher(
            &[],
            Arc::new(MockPlatform::new()),
            Arc::new(RecordingJob::new()),
        ));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[tokio::test]
    async fn any_path_rejects_wrong_token() {
        let router = EntrypointApi::router(dispatcher(
            &[("CRON_SECRET", "s3cret")],
            Arc::new(MockPlatform::new()),
            Arc::new(RecordingJob::new()),
        ));
        let req = Request::builder()
            .method("DELETE")
            .uri("/some/deep/path?x=1")
            .header("Authorization", "Bearer totally-bogus")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(resp).await, "Unauthorized");
    }

    #[tokio::test]
    async fn missing_secret_is_a_server_error() {
        let mock = Arc::new(MockPlatform::new());
        let router = EntrypointApi::router(dispatcher(&[], mock.clone(), Arc::new(RecordingJob::new())));
        let req = Request::builder()
            .uri("/")
            .header("Authorization", "Bearer ")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.contains("CRON_SECRET"));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn inner_answers_running() {
        let job = Arc::new(RecordingJob::new());
        let router = EntrypointApi::router(dispatcher(
            &[
                ("CRON_SECRET", "s3cret"),
                ("IN_SANDBOX", "true"),
                ("SANDBOX_ID", "sbx_self"),
            ],
            Arc::new(MockPlatform::new()),
            job.clone(),
        ));
        let req = Request::builder()
            .method("POST")
            .uri("/api/cron")
            .header("Authorization", "Bearer s3cret")
            .body(Body::from("payload"))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_text(resp).await, "Running...");

        for _ in 0..100 {
            if job.runs() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(job.runs(), 1);
    }

    #[tokio::test]
    async fn outer_answers_started() {
        let (url, _) = spawn_capture_server().await;
        let router = EntrypointApi::router(dispatcher(
            &[("CRON_SECRET", "s3cret")],
            Arc::new(MockPlatform::new().with_route(3000, url)),
            Arc::new(RecordingJob::new()),
        ));
        let req = Request::builder()
            .uri("/api/cron")
            .header("Authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "Started");
    }

    #[tokio::test]
    async fn readiness_timeout_is_reported() {
        let router = EntrypointApi::router(dispatcher(
            &[("CRON_SECRET", "s3cret"), ("READINESS_MAX_ATTEMPTS", "3")],
            Arc::new(MockPlatform::new().with_probe_exit_codes([7; 3])),
            Arc::new(RecordingJob::new()),
        ));
        let req = Request::builder()
            .uri("/api/cron")
            .header("Authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_text(resp).await,
            "Server failed to respond after 3 attempts"
        );
    }
}
