mod common;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use common::*;
use hero_card::client::{BackendError, GenerationBackend, HttpBackend, JobHandleSource, GENERIC_ERROR};
use hero_card::models::{FailureCause, GenerationOutcome, GenerationRequest, JobHandle, ProgressFrame, UploadCandidate};
use hero_card::normalize::Normalizer;
use hero_card::observer::{Observer, PushObserver, CONNECTION_ERROR};
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn request(text: &str, holiday_theme: bool) -> GenerationRequest {
    let mut raw = png_bytes(16).to_vec();
    raw.resize(1024 * 1024, 0);
    let image = Normalizer::default()
        .normalize(UploadCandidate { bytes: Bytes::from(raw), content_type: "image/png".into(), file_name: "me.png".into() })
        .await
        .expect("valid png");
    GenerationRequest { text: text.into(), image, correlation_id: Uuid::new_v4(), holiday_theme }
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle.as_bytes())
}

async fn mock_submit(response: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate-hero-card"))
        .respond_with(response)
        .expect(1)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn submit_sends_all_fields_and_reads_the_job_id() {
    let server = mock_submit(ResponseTemplate::new(202).set_body_json(json!({ "task_id": "abc" }))).await;
    let backend = HttpBackend::new(server.uri(), JobHandleSource::Server);
    let req = request("Building APIs", false).await;

    let outcome = backend.submit(&req).await;
    assert_eq!(outcome, GenerationOutcome::Accepted(JobHandle("abc".into())));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let sent = &received[0];
    let content_type = sent.headers.get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data"), "{}", content_type);

    let body = &sent.body;
    assert!(contains(body, "name=\"text\"\r\n\r\nBuilding APIs\r\n"));
    assert!(contains(body, &format!("name=\"session_id\"\r\n\r\n{}\r\n", req.correlation_id)));
    assert!(contains(body, "name=\"holiday_theme\"\r\n\r\nfalse\r\n"));
    assert!(contains(body, "name=\"image\"; filename=\"me.png\""));
    assert!(contains(body, "Content-Type: image/png"));
    assert!(body.len() > 1024 * 1024);
}

#[tokio::test]
async fn accepted_without_body_uses_the_correlation_id() {
    let server = mock_submit(ResponseTemplate::new(202)).await;
    let backend = HttpBackend::new(format!("{}/", server.uri()), JobHandleSource::Correlation);
    let req = request("Building APIs", true).await;

    let outcome = backend.submit(&req).await;
    assert_eq!(outcome, GenerationOutcome::Accepted(JobHandle(req.correlation_id.to_string())));
}

#[tokio::test]
async fn server_handles_fall_back_to_session_id_and_reject_when_missing() {
    let server = mock_submit(
        ResponseTemplate::new(202).set_body_json(json!({ "session_id": "s-1", "message": "Card generation started" })),
    )
    .await;
    let backend = HttpBackend::new(server.uri(), JobHandleSource::Server);
    assert_eq!(backend.submit(&request("x", false).await).await, GenerationOutcome::Accepted(JobHandle("s-1".into())));

    let server = mock_submit(ResponseTemplate::new(202)).await;
    let backend = HttpBackend::new(server.uri(), JobHandleSource::Server);
    assert_eq!(backend.submit(&request("x", false).await).await, GenerationOutcome::Rejected(GENERIC_ERROR.into()));
}

#[tokio::test]
async fn ok_response_is_an_immediate_result() {
    let server = mock_submit(ResponseTemplate::new(200).set_body_json(json!({ "image_base64": DONE_B64 }))).await;
    let backend = HttpBackend::new(server.uri(), JobHandleSource::Correlation);
    assert_eq!(
        backend.submit(&request("x", false).await).await,
        GenerationOutcome::Immediate(Bytes::from_static(b"done"))
    );
}

#[tokio::test]
async fn error_statuses_become_rejections() {
    let server = mock_submit(
        ResponseTemplate::new(400).set_body_json(json!({ "error": "Unable to process image. Please upload a valid image file" })),
    )
    .await;
    let backend = HttpBackend::new(server.uri(), JobHandleSource::Correlation);
    assert_eq!(
        backend.submit(&request("x", false).await).await,
        GenerationOutcome::Rejected("Unable to process image. Please upload a valid image file".into())
    );

    let server = mock_submit(ResponseTemplate::new(429).set_body_string("Too Many Requests")).await;
    let backend = HttpBackend::new(server.uri(), JobHandleSource::Correlation);
    assert_eq!(backend.submit(&request("x", false).await).await, GenerationOutcome::Rejected(GENERIC_ERROR.into()));
}

#[tokio::test]
async fn unreachable_backend_is_a_rejection() {
    let backend = HttpBackend::new("http://127.0.0.1:9", JobHandleSource::Correlation);
    assert_eq!(backend.submit(&request("x", false).await).await, GenerationOutcome::Rejected(GENERIC_ERROR.into()));
}

#[tokio::test]
async fn status_is_fetched_and_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status/task-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "started", "status_description": "Task has been started by a worker." })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/task-2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), JobHandleSource::Server);
    let status = backend.status(&JobHandle("task-1".into())).await.unwrap();
    assert_eq!(status.status, "started");
    assert_eq!(status.image_base64, None);

    let err = backend.status(&JobHandle("task-2".into())).await.unwrap_err();
    assert!(matches!(err, BackendError::Status { status: 500, .. }));
}

#[tokio::test]
async fn job_ids_are_escaped_as_one_path_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "pending" })))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), JobHandleSource::Server);
    backend.status(&JobHandle("a/b?c#d".into())).await.unwrap();
    let prefixed = HttpBackend::new(format!("{}/api/", server.uri()), JobHandleSource::Server);
    prefixed.status(&JobHandle("task 7".into())).await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].url.path(), "/status/a%2Fb%3Fc%23d");
    assert_eq!(received[0].url.query(), None);
    assert_eq!(received[1].url.path(), "/api/status/task%207");
}

/// Serves `/stream/:id` as server-sent events, waiting `delay` before each one.
async fn serve_events(events: Vec<String>, delay: Duration) -> String {
    let app = Router::new().route(
        "/stream/:id",
        get(move |Path(_id): Path<String>| {
            let events = events.clone();
            async move {
                let stream = futures_util::stream::unfold(events.into_iter(), move |mut rest| async move {
                    let next = rest.next()?;
                    tokio::time::sleep(delay).await;
                    Some((Ok::<_, Infallible>(Event::default().data(next)), rest))
                });
                Sse::new(stream)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn raw(item: Result<String, BackendError>) -> String {
    item.unwrap()
}

#[tokio::test]
async fn push_over_http_stops_at_complete() {
    let events = vec![
        json!({ "type": "connected", "session_id": "job-1" }).to_string(),
        raw(partial(1)),
        raw(partial(2)),
        raw(complete()),
        raw(partial(3)),
    ];
    let base = serve_events(events, Duration::ZERO).await;
    let backend = Arc::new(HttpBackend::new(base, JobHandleSource::Correlation));

    let mut obs = PushObserver::new(backend).observe(JobHandle("job-1".into()));
    let mut frames = Vec::new();
    while let Some(frame) = obs.next().await {
        frames.push(frame);
    }
    assert_eq!(
        frames,
        vec![
            ProgressFrame::Partial { image: Bytes::from_static(b"hi"), index: 1 },
            ProgressFrame::Partial { image: Bytes::from_static(b"hi"), index: 2 },
            ProgressFrame::Complete { image: Bytes::from_static(b"done") },
        ]
    );
}

#[tokio::test]
async fn push_over_http_that_ends_early_is_a_connection_error() {
    let base = serve_events(vec![raw(partial(1))], Duration::ZERO).await;
    let backend = Arc::new(HttpBackend::new(base, JobHandleSource::Correlation));

    let mut obs = PushObserver::new(backend).observe(JobHandle("job-1".into()));
    assert!(matches!(obs.next().await, Some(ProgressFrame::Partial { index: 1, .. })));
    assert_eq!(
        obs.next().await,
        Some(ProgressFrame::Failed { cause: FailureCause::Transport, message: CONNECTION_ERROR.into() })
    );
}

#[tokio::test]
async fn push_subscription_refused_is_a_connection_error() {
    let server = MockServer::start().await;
    let backend = Arc::new(HttpBackend::new(server.uri(), JobHandleSource::Correlation));
    let mut obs = PushObserver::new(backend).observe(JobHandle("job-1".into()));
    assert_eq!(
        obs.next().await,
        Some(ProgressFrame::Failed { cause: FailureCause::Transport, message: CONNECTION_ERROR.into() })
    );
}

#[tokio::test]
async fn cancelling_over_http_drops_the_delayed_terminal_event() {
    let base = serve_events(vec![raw(partial(1)), raw(complete())], Duration::from_millis(150)).await;
    let backend = Arc::new(HttpBackend::new(base, JobHandleSource::Correlation));

    let mut obs = PushObserver::new(backend).observe(JobHandle("job-1".into()));
    assert!(matches!(obs.next().await, Some(ProgressFrame::Partial { .. })));
    obs.cancel();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(obs.next().await, None);
}
