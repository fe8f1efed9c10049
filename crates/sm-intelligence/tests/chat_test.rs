use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sm_core::config::CacheScope;
use sm_core::error::{ErrorCode, HasErrorCode};
use sm_intelligence::cache::CacheSettings;
use sm_intelligence::chat::{
    AiChatService, AiRequest, ChatError, ChatSettings, FixedProviderFactory, HttpProviderFactory,
    DEFAULT_SYSTEM_PROMPT,
};
use sm_intelligence::llm::{LlmError, LlmRole, MockProvider};

fn settings() -> ChatSettings {
    ChatSettings {
        timeout: Duration::from_secs(2),
        retry_count: 2,
        retry_backoff: Duration::from_millis(5),
        ..ChatSettings::default()
    }
}

fn service_with(settings: ChatSettings, mock: &MockProvider) -> AiChatService {
    AiChatService::new(
        settings,
        CacheSettings::new(64, Duration::from_secs(60)),
        Arc::new(FixedProviderFactory::new(Arc::new(mock.clone()))),
    )
}

fn request(message: &str) -> AiRequest {
    serde_json::from_value(json!({
        "message": message,
        "ai_config": { "provider": "claude", "model": "claude-test" }
    }))
    .unwrap()
}

#[tokio::test]
async fn repeated_question_is_served_from_cache() {
    let mock = MockProvider::new().with_text("Use this:\n```bash\ndf -h\n```");
    let service = service_with(settings(), &mock);

    let first = service.ask(request("disk usage?"), "alice", None).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.command.as_deref(), Some("df -h"));
    assert_eq!(first.model, "mock");
    assert_eq!(first.tokens_used, Some(15));

    let second = service.ask(request("  disk   usage? "), "bob", None).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.response, first.response);
    assert_eq!(second.command.as_deref(), Some("df -h"));
    assert_eq!(second.model, "mock");
    assert_eq!(second.tokens_used, None);
    assert_eq!(mock.calls(), 1);

    let stats = service.cache_stats();
    assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
}

#[tokio::test]
async fn request_defaults_reach_the_provider() {
    let mock = MockProvider::new();
    let service = service_with(settings(), &mock);

    let reply = service.ask(request("uptime?"), "alice", None).await.unwrap();
    assert_eq!(reply.response, "Mock response to: uptime?");
    assert_eq!(reply.command, None);

    let (messages, config) = &mock.captured_requests()[0];
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, LlmRole::User);
    assert_eq!(config.model, "claude-test");
    assert_eq!(config.max_tokens, 2048);
    assert!((config.temperature - 0.7).abs() < f32::EPSILON);
    assert_eq!(config.system_prompt.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
}

#[tokio::test]
async fn retryable_failure_is_retried() {
    let mock = MockProvider::new()
        .with_error(LlmError::HttpError("connection reset".into()))
        .with_text("ok");
    let service = service_with(settings(), &mock);

    let reply = service.ask(request("hello"), "alice", None).await.unwrap();
    assert_eq!(reply.response, "ok");
    assert!(!reply.cached);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried_or_cached() {
    let mock = MockProvider::new().with_error(LlmError::ApiError {
        status: 401,
        message: "bad key".into(),
    });
    let service = service_with(settings(), &mock);

    let err = service.ask(request("hello"), "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CacheComputeError);
    assert_eq!(mock.calls(), 1);
    assert_eq!(service.cache_stats().entries, 0);

    // Nothing was cached, so the next ask reaches the provider again.
    let reply = service.ask(request("hello"), "alice", None).await.unwrap();
    assert!(!reply.cached);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn rate_limit_surfaces_after_retries() {
    let limited = || LlmError::RateLimited { retry_after_secs: Some(1) };
    let mock = MockProvider::new()
        .with_error(limited())
        .with_error(limited())
        .with_error(limited());
    let service = service_with(settings(), &mock);

    let err = service.ask(request("hello"), "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RateLimited);
    assert_eq!(mock.calls(), 3);
}

#[tokio::test]
async fn unknown_and_disabled_providers_are_rejected() {
    let mock = MockProvider::new();
    let service = service_with(
        ChatSettings {
            enabled_providers: vec!["anthropic".into()],
            ..settings()
        },
        &mock,
    );

    let gemini: AiRequest = serde_json::from_value(json!({
        "message": "hi",
        "ai_config": { "provider": "gemini", "model": "g" }
    }))
    .unwrap();
    let err = service.ask(gemini, "alice", None).await.unwrap_err();
    assert_eq!(err, ChatError::UnsupportedProvider("gemini".into()));
    assert_eq!(err.code(), ErrorCode::UnsupportedProvider);

    let openai: AiRequest = serde_json::from_value(json!({
        "message": "hi",
        "ai_config": { "provider": "openai", "model": "gpt" }
    }))
    .unwrap();
    let err = service.ask(openai, "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnsupportedProvider);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn empty_message_is_a_protocol_error() {
    let mock = MockProvider::new();
    let service = service_with(settings(), &mock);

    let err = service.ask(request("   "), "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtocolError);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn session_context_is_sent_and_keys_the_cache() {
    let mock = MockProvider::new();
    let service = service_with(settings(), &mock);

    service
        .ask(request("what is running?"), "alice", Some("deploy@web1:22"))
        .await
        .unwrap();
    let (messages, _) = &mock.captured_requests()[0];
    assert_eq!(messages[0].role, LlmRole::System);
    assert_eq!(
        messages[0].content,
        "The user has an active SSH session to deploy@web1:22."
    );

    let other = service
        .ask(request("what is running?"), "alice", Some("root@db1:22"))
        .await
        .unwrap();
    assert!(!other.cached);
    let plain = service.ask(request("what is running?"), "alice", None).await.unwrap();
    assert!(!plain.cached);
    assert_eq!(mock.calls(), 3);
}

#[tokio::test]
async fn principal_scope_keeps_entries_private() {
    let mock = MockProvider::new();
    let service = service_with(
        ChatSettings {
            scope: CacheScope::Principal,
            ..settings()
        },
        &mock,
    );

    service.ask(request("ls?"), "alice", None).await.unwrap();
    let bob = service.ask(request("ls?"), "bob", None).await.unwrap();
    assert!(!bob.cached);
    let alice_again = service.ask(request("ls?"), "alice", None).await.unwrap();
    assert!(alice_again.cached);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn slow_provider_times_out() {
    let mock = MockProvider::new().with_delay(Duration::from_millis(300));
    let service = service_with(
        ChatSettings {
            timeout: Duration::from_millis(30),
            retry_count: 0,
            ..settings()
        },
        &mock,
    );

    let err = service.ask(request("hello"), "alice", None).await.unwrap_err();
    assert_eq!(err, ChatError::Timeout(Duration::from_millis(30)));
    assert_eq!(err.code(), ErrorCode::CacheComputeError);
    assert_eq!(service.cache_stats().inflight, 0);
}

#[tokio::test]
async fn concurrent_asks_share_one_completion() {
    let mock = MockProvider::new().with_delay(Duration::from_millis(50));
    let service = service_with(settings(), &mock);

    let (a, b) = tokio::join!(
        service.ask(request("free -m?"), "alice", None),
        service.ask(request("free -m?"), "bob", None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.response, b.response);
    assert!(a.cached != b.cached);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let service = AiChatService::new(
        ChatSettings {
            anthropic_key_env: "SHELLMUX_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..settings()
        },
        CacheSettings::new(8, Duration::from_secs(60)),
        Arc::new(HttpProviderFactory::new()),
    );

    let err = service.ask(request("hello"), "alice", None).await.unwrap_err();
    assert_eq!(err, ChatError::MissingApiKey("anthropic"));
    assert_eq!(err.code(), ErrorCode::Unauthorized);
}
