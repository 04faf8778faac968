use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cot_harness::gateway::chat_completions::{ChatCompletionsAdapter, ChatProvider};
use cot_harness::gateway::{
    Attribution, ChatGateway, ChatRequest, FinishReason, GenerationParams, NoopUsageSink,
    ProviderError, ProviderGateway, RetryPolicy,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> ChatCompletionsAdapter {
    ChatCompletionsAdapter::with_config(
        "sk-test",
        format!("{}/", server.uri()),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn ok_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
    })
}

#[tokio::test]
async fn adapter_parses_content_usage_and_trims() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "Qwen/Qwen2-7B-Instruct",
            "max_tokens": 1024
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("  {\"choice\":\"A\"}\n")))
        .expect(1)
        .mount(&server)
        .await;

    let req = ChatRequest::prompt("Qwen/Qwen2-7B-Instruct", "hi", Attribution::new("test"))
        .max_tokens(1024);
    let resp = adapter(&server).chat(&req).await.unwrap();

    assert_eq!(resp.content, "{\"choice\":\"A\"}");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 7);
}

#[tokio::test]
async fn adapter_classifies_429_as_rate_limit() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "slow down", "code": 429 }
        })))
        .mount(&server)
        .await;

    let req = ChatRequest::prompt("m", "hi", Attribution::new("test"));
    let err = adapter(&server).chat(&req).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }));
    assert_eq!(err.code(), "rate_limited");
}

#[tokio::test]
async fn adapter_reports_http_status_and_missing_choices() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let req = ChatRequest::prompt("m", "hi", Attribution::new("test"));
    let err = adapter(&server).chat(&req).await.unwrap_err();
    assert!(err.to_string().contains("No choices"));

    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&failing)
        .await;

    let err = adapter(&failing).chat(&req).await.unwrap_err();
    assert_eq!(err.context().and_then(|c| c.http_status), Some(503));
    assert!(err.to_string().contains("HTTP 503"));
}

struct FlipResponder {
    calls: Arc<AtomicUsize>,
    failures: usize,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ResponseTemplate::new(500).set_body_json(json!({ "error": { "message": "boom" } }))
        } else {
            ResponseTemplate::new(200).set_body_json(ok_body("B"))
        }
    }
}

#[tokio::test]
async fn gateway_retries_until_success() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: calls.clone(),
            failures: 2,
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        RetryPolicy::immediate(5),
    );

    let content = gateway
        .generate("m", "hi", &GenerationParams::default(), Attribution::new("test"))
        .await
        .unwrap();
    assert_eq!(content, "B");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gateway_gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: calls.clone(),
            failures: usize::MAX,
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        RetryPolicy::immediate(3),
    );

    let req = ChatRequest::prompt("m", "hi", Attribution::new("test"));
    let err = ChatGateway::chat(&gateway, req).await.unwrap_err();
    assert_eq!(err.attempts(), 3);
    assert!(err.last_error().to_string().contains("boom"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
