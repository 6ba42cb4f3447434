//! Provider integration tests against local mock upstreams

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chorus_gateway::providers::{
    ChatOptions, ChunkSink, GigaChatConfig, GigaChatProvider, GroqConfig, GroqProvider,
    OllamaConfig, OllamaProvider,
};
use chorus_gateway::{Error, Provider};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve `router` on an ephemeral port and return its base URL
async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Body delivered in the given pieces, split wherever the test likes
fn chunked(pieces: &[&str], content_type: &'static str) -> Response {
    let pieces: Vec<Result<String, Infallible>> =
        pieces.iter().map(|p| Ok((*p).to_string())).collect();
    (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(futures::stream::iter(pieces)),
    )
        .into_response()
}

fn sse_line(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

type Captured = Arc<Mutex<Vec<serde_json::Value>>>;

fn groq_provider(url: &str) -> GroqProvider {
    GroqProvider::new(GroqConfig {
        api_key: Some(SecretString::from("gsk-test")),
        api_url: url.to_string(),
        ..GroqConfig::default()
    })
    .unwrap()
}

async fn groq_completions(
    State(captured): State<Captured>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some("Bearer gsk-test") {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    captured.lock().unwrap().push(body);

    let second = sse_line("lo, ");
    let (second_head, second_tail) = second.split_at(12);
    let third = sse_line("wörld");
    let umlaut = third.find('ö').unwrap() + 1;

    // split inside a line and between the two bytes of 'ö'
    let pieces: Vec<Result<Vec<u8>, Infallible>> = vec![
        Ok(format!("{}: keep-alive\n\n{second_head}", sse_line("Hel")).into_bytes()),
        Ok(format!("{second_tail}data: not json\n\n").into_bytes()),
        Ok(third.as_bytes()[..umlaut].to_vec()),
        Ok(third.as_bytes()[umlaut..].to_vec()),
        Ok(format!("data: [DONE]\n\n{}", sse_line("late")).into_bytes()),
    ];
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(futures::stream::iter(pieces)),
    )
        .into_response()
}

#[tokio::test]
async fn groq_streams_fragments_in_order() {
    let captured: Captured = Arc::default();
    let url = spawn_upstream(
        Router::new()
            .route("/chat/completions", post(groq_completions))
            .with_state(captured.clone()),
    )
    .await;
    let provider = groq_provider(&url);

    let options = ChatOptions {
        model: Some("llama-3.1-8b-instant".to_string()),
        max_tokens: Some(64),
        ..ChatOptions::default()
    };
    let mut out = Recording::default();
    provider
        .chat("hi", &options, &CancellationToken::new(), &mut out)
        .await
        .unwrap();

    assert_eq!(out.fragments, ["Hel", "lo, ", "wörld"]);

    let body = captured.lock().unwrap().pop().unwrap();
    assert_eq!(body["model"], "llama-3.1-8b-instant");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 64);
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "hi");
    // the per-request override leaves the provider's selection alone
    assert_eq!(provider.model(), GroqConfig::default().model);
}

#[tokio::test]
async fn non_success_status_surfaces_status_and_body() {
    let url = spawn_upstream(Router::new().route(
        "/chat/completions",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
    ))
    .await;
    let provider = groq_provider(&url);

    let mut out = String::new();
    let err = provider
        .chat("hi", &ChatOptions::default(), &CancellationToken::new(), &mut out)
        .await
        .unwrap_err();

    match err {
        Error::Upstream {
            provider,
            status,
            body,
        } => {
            assert_eq!(provider, "groq");
            assert_eq!(status, 429);
            assert_eq!(body, "slow down");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(out.is_empty());
}

/// Records fragments; optionally fails on the n-th one
#[derive(Default)]
struct Recording {
    fragments: Vec<String>,
    fail_on: Option<usize>,
}

#[async_trait]
impl ChunkSink for Recording {
    async fn on_chunk(&mut self, fragment: &str) -> chorus_gateway::Result<()> {
        if self.fail_on == Some(self.fragments.len() + 1) {
            return Err(Error::ClientDisconnected);
        }
        self.fragments.push(fragment.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn sink_error_aborts_the_stream() {
    let url = spawn_upstream(Router::new().route(
        "/chat/completions",
        post(|| async {
            let lines: Vec<String> = ["one", "two", "three"].iter().map(|c| sse_line(c)).collect();
            let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
            chunked(&refs, "text/event-stream")
        }),
    ))
    .await;
    let provider = groq_provider(&url);

    let mut sink = Recording {
        fail_on: Some(2),
        ..Recording::default()
    };
    let err = provider
        .chat("hi", &ChatOptions::default(), &CancellationToken::new(), &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ClientDisconnected));
    assert_eq!(sink.fragments, ["one"]);
}

#[tokio::test]
async fn cancelled_request_never_streams() {
    let url = spawn_upstream(Router::new().route(
        "/chat/completions",
        post(|| async { chunked(&[sse_line("never").as_str()], "text/event-stream") }),
    ))
    .await;
    let provider = groq_provider(&url);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut out = String::new();
    let err = provider
        .chat("hi", &ChatOptions::default(), &cancel, &mut out)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(out.is_empty());
}

async fn ollama_chat(
    State(captured): State<Captured>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    captured.lock().unwrap().push(body);
    chunked(
        &[
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n{\"mess",
            "age\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"ignored\"},\"done\":false}\n",
        ],
        "application/x-ndjson",
    )
}

#[tokio::test]
async fn ollama_stops_at_done_and_forwards_options() {
    let captured: Captured = Arc::default();
    let url = spawn_upstream(
        Router::new()
            .route("/api/chat", post(ollama_chat))
            .route(
                "/api/tags",
                get(|| async { Json(serde_json::json!({ "models": [{ "name": "llama3.2:3b" }] })) }),
            )
            .with_state(captured.clone()),
    )
    .await;

    let provider = OllamaProvider::new(OllamaConfig {
        api_url: format!("{url}/"),
        ..OllamaConfig::default()
    })
    .unwrap();

    assert_eq!(provider.installed_models().await.unwrap(), ["llama3.2:3b"]);

    let options = ChatOptions {
        system_prompt: Some("be brief".to_string()),
        temperature: Some(0.5),
        ..ChatOptions::default()
    };
    let mut out = String::new();
    provider
        .chat("hello", &options, &CancellationToken::new(), &mut out)
        .await
        .unwrap();
    assert_eq!(out, "Hi there");

    let body = captured.lock().unwrap().pop().unwrap();
    assert_eq!(body["model"], "llama3.2:3b");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "be brief");
    assert_eq!(body["options"]["temperature"], 0.5);
    assert!(body["options"].get("num_predict").is_none());
}

#[derive(Clone)]
struct OAuthMock {
    token_requests: Arc<AtomicUsize>,
    /// Seconds until the issued token expires
    ttl_secs: i64,
}

async fn oauth(
    State(mock): State<OAuthMock>,
    headers: HeaderMap,
    Form(form): Form<std::collections::HashMap<String, String>>,
) -> Response {
    let n = mock.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some("Basic c2VjcmV0")
        || form.get("scope").map(String::as_str) != Some("GIGACHAT_API_PERS")
        || headers.get("RqUID").is_none()
    {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }

    // a slow token endpoint widens the window for concurrent refreshes
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let expires_at = chrono::Utc::now().timestamp_millis() + mock.ttl_secs * 1000;
    Json(serde_json::json!({
        "access_token": format!("tok-{n}"),
        "expires_at": expires_at,
    }))
    .into_response()
}

async fn gigachat_completions(headers: HeaderMap) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    if !bearer.starts_with("tok-") {
        return (StatusCode::UNAUTHORIZED, "no token").into_response();
    }
    chunked(
        &[
            sse_line("answer with ").as_str(),
            sse_line(&bearer).as_str(),
            "data: [DONE]\n\n",
        ],
        "text/event-stream",
    )
}

async fn gigachat_upstream(ttl_secs: i64) -> (String, Arc<AtomicUsize>) {
    let token_requests = Arc::new(AtomicUsize::new(0));
    let mock = OAuthMock {
        token_requests: token_requests.clone(),
        ttl_secs,
    };
    let url = spawn_upstream(
        Router::new()
            .route("/oauth", post(oauth))
            .route("/api/v1/chat/completions", post(gigachat_completions))
            .with_state(mock),
    )
    .await;
    (url, token_requests)
}

fn gigachat_provider(url: &str, auth_key: &str) -> GigaChatProvider {
    GigaChatProvider::new(GigaChatConfig {
        auth_key: Some(SecretString::from(auth_key)),
        api_url: format!("{url}/api/v1"),
        auth_url: format!("{url}/oauth"),
        ..GigaChatConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn gigachat_refreshes_the_token_once_for_concurrent_chats() {
    let (url, token_requests) = gigachat_upstream(1800).await;
    let provider = Arc::new(gigachat_provider(&url, "c2VjcmV0"));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let provider = provider.clone();
            tokio::spawn(async move {
                let mut out = String::new();
                provider
                    .chat("hi", &ChatOptions::default(), &CancellationToken::new(), &mut out)
                    .await
                    .map(|()| out)
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        assert_eq!(task.unwrap().unwrap(), "answer with tok-1");
    }
    assert_eq!(token_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gigachat_refreshes_tokens_close_to_expiry() {
    // inside the refresh margin from the moment it is issued
    let (url, token_requests) = gigachat_upstream(30).await;
    let provider = gigachat_provider(&url, "c2VjcmV0");

    assert_eq!(provider.access_token().await.unwrap(), "tok-1");
    assert_eq!(provider.access_token().await.unwrap(), "tok-2");
    assert_eq!(token_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn gigachat_rejected_credentials_are_auth_errors() {
    let (url, _) = gigachat_upstream(1800).await;
    let provider = gigachat_provider(&url, "wrong");

    let mut out = String::new();
    let err = provider
        .chat("hi", &ChatOptions::default(), &CancellationToken::new(), &mut out)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Auth(ref msg) if msg.contains("401")));
    assert!(out.is_empty());
}

#[tokio::test]
async fn gigachat_seeded_token_skips_refresh() {
    let (url, token_requests) = gigachat_upstream(1800).await;
    let provider = GigaChatProvider::new(GigaChatConfig {
        access_token: Some(SecretString::from("tok-seeded")),
        api_url: format!("{url}/api/v1"),
        auth_url: format!("{url}/oauth"),
        ..GigaChatConfig::default()
    })
    .unwrap();

    let mut out = String::new();
    provider
        .chat("hi", &ChatOptions::default(), &CancellationToken::new(), &mut out)
        .await
        .unwrap();

    assert_eq!(out, "answer with tok-seeded");
    assert_eq!(token_requests.load(Ordering::SeqCst), 0);
}
