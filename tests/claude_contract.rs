//! Claude client contract tests.
//!
//! Verify the exact HTTP shape sent to the Anthropic Messages API and the
//! handling of responses and error statuses.

use kikitori::config::SummaryConfig;
use kikitori::summary::{ClaudeClient, GenerationOptions, LlmClient};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn config_with_key() -> SummaryConfig {
    SummaryConfig {
        anthropic_api_key: Some("test-key".to_owned()),
        ..SummaryConfig::default()
    }
}

fn text_response(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "msg_test",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "model": "claude-3-5-haiku-20241022",
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 10, "output_tokens": 5}
    }))
}

#[tokio::test]
async fn request_carries_required_fields_and_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 4096,
            "system": "システムプロンプト",
            "messages": [{"role": "user", "content": "ユーザープロンプト"}]
        })))
        .respond_with(text_response("## 議事録"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ClaudeClient::new(&config_with_key())
        .unwrap()
        .with_base_url(server.uri());

    let result = client
        .generate(
            "システムプロンプト",
            "ユーザープロンプト",
            &GenerationOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result, Some("## 議事録".to_owned()));
}

#[tokio::test]
async fn unset_sampling_knobs_are_omitted_from_the_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(text_response("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ClaudeClient::new(&config_with_key())
        .unwrap()
        .with_base_url(server.uri());
    client
        .generate("s", "u", &GenerationOptions::default())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert!(body.get("temperature").is_none());
    assert!(body.get("top_p").is_none());
}

#[tokio::test]
async fn set_sampling_knobs_are_sent() {
    let server = MockServer::start().await;

    let checker = |req: &Request| -> bool {
        let body: serde_json::Value = match req.body_json() {
            Ok(b) => b,
            Err(_) => return false,
        };
        body["temperature"] == json!(0.2) && body.get("top_p").is_none()
    };
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(checker)
        .respond_with(text_response("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ClaudeClient::new(&config_with_key())
        .unwrap()
        .with_base_url(server.uri());
    let options = GenerationOptions {
        temperature: Some(0.2),
        top_p: None,
        max_tokens: Some(1024),
    };
    client.generate("s", "u", &options).await.unwrap();
}

#[tokio::test]
async fn empty_content_yields_none() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_test",
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": "claude-3-5-haiku-20241022",
            "usage": {"input_tokens": 1, "output_tokens": 0}
        })))
        .mount(&server)
        .await;

    let client = ClaudeClient::new(&config_with_key())
        .unwrap()
        .with_base_url(server.uri());
    let result = client
        .generate("s", "u", &GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(result, None);
}

#[tokio::test]
async fn api_error_status_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "type": "error",
            "error": {"type": "rate_limit_error", "message": "slow down"}
        })))
        .mount(&server)
        .await;

    let client = ClaudeClient::new(&config_with_key())
        .unwrap()
        .with_base_url(server.uri());
    let err = client
        .generate("s", "u", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("429"));
}

#[test]
fn missing_api_key_is_a_config_error() {
    // Guard against ambient credentials leaking into the test.
    let config = SummaryConfig {
        anthropic_api_key: None,
        ..SummaryConfig::default()
    };
    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        assert!(ClaudeClient::new(&config).is_err());
    }
}
