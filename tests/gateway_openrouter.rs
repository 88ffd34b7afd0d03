use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sbs_arbiter::gateway::openrouter::{ChatProvider, OpenRouterAdapter};
use sbs_arbiter::gateway::{
    Attribution, ChatModel, ChatRequest, FinishReason, GatewayConfig, Message, NoopUsageSink,
    ProviderError, ProviderGateway,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[tokio::test]
async fn openrouter_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "{\"主要问题\": \"13无问题\"}" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();

    let req = ChatRequest::new(
        ChatModel::openrouter("openai/o3"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    )
    .json();

    let resp = adapter.chat(&req).await.unwrap();
    assert_eq!(resp.content, "{\"主要问题\": \"13无问题\"}");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
}

#[tokio::test]
async fn openrouter_detects_refusal_from_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot comply with that request." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();

    let req = ChatRequest::new(
        ChatModel::openrouter("openai/o3"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let err = adapter.chat(&req).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
}

#[tokio::test]
async fn openrouter_classifies_http_429_as_rate_limit_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();

    let req = ChatRequest::new(
        ChatModel::openrouter("openai/o3"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let err = adapter.chat(&req).await.unwrap_err();
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(60));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

#[tokio::test]
async fn provider_gateway_retries_on_retryable_errors_and_succeeds() {
    let server = MockServer::start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));
    let second = ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": "ok" },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    }));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls,
            first,
            second,
        })
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("openai/o3"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let resp = gateway.chat(req).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn provider_gateway_does_not_retry_permanent_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad request", "code": "invalid" }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("openai/o3"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    gateway.chat(req).await.unwrap_err();
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}
