use chrono::Utc;
use httpmock::prelude::*;
use postmeter::channels::{Channel, ChannelSender, TelegramSender};
use postmeter::generation::{ContentGenerator, GenerationRequest, HttpContentGenerator};
use postmeter::scheduling::posts::Post;
use serde_json::json;

fn telegram_channel() -> Channel {
    Channel {
        id: 11,
        company_id: 1,
        channel_type: "telegram".into(),
        config_json: json!({
            "telegram_bot_token": "42:secret",
            "telegram_channel_id": -100123,
        }),
        created_at: Utc::now(),
    }
}

fn post() -> Post {
    Post {
        id: 5,
        company_id: 1,
        channel_id: 11,
        content: "<b>Launch</b> today".into(),
        ai_generated: false,
        status: "scheduled".into(),
        scheduled_time: Some(Utc::now()),
        timezone: "UTC".into(),
        created_at: Utc::now(),
    }
}

fn request() -> GenerationRequest {
    GenerationRequest {
        company_id: 1,
        channel_id: 11,
        rule_id: Some(3),
        topic: "launch".into(),
        prompt: "one paragraph".into(),
        use_random_context: false,
        timezone: "Europe/Kyiv".into(),
    }
}

#[tokio::test]
async fn telegram_sender_posts_to_bot_api() {
    let server = MockServer::start_async().await;
    let send_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/bot42:secret/sendMessage")
            .json_body(json!({
                "chat_id": -100123,
                "text": "<b>Launch</b> today",
                "parse_mode": "html",
            }));
        then.status(200)
            .json_body(json!({ "ok": true, "result": { "message_id": 777 } }));
    });

    let sender = TelegramSender::new(server.base_url(), 5).unwrap();
    let receipt = sender.send(&telegram_channel(), &post()).await.unwrap();

    send_mock.assert();
    assert_eq!(receipt.external_id, "777");
}

#[tokio::test]
async fn telegram_rejection_surfaces_description() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/bot42:secret/sendMessage");
        then.status(400).json_body(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: chat not found",
        }));
    });

    let sender = TelegramSender::new(server.base_url(), 5).unwrap();
    let err = sender.send(&telegram_channel(), &post()).await.unwrap_err();
    assert!(err.to_string().contains("chat not found"));
}

#[tokio::test]
async fn http_generator_returns_trimmed_content() {
    let server = MockServer::start_async().await;
    let generate_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/generate")
            .header("authorization", "Bearer gen-token")
            .json_body_partial(r#"{ "topic": "launch", "rule_id": 3 }"#);
        then.status(200)
            .json_body(json!({ "content": "  Launch day is here.\n" }));
    });

    let generator = HttpContentGenerator::new(
        server.url("/generate"),
        Some("gen-token".into()),
        5,
    )
    .unwrap();
    let content = generator.generate(&request()).await.unwrap();

    generate_mock.assert();
    assert_eq!(content.as_deref(), Some("Launch day is here."));
}

#[tokio::test]
async fn http_generator_blank_content_is_none_and_errors_propagate() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/blank");
        then.status(200).json_body(json!({ "content": "   " }));
    });
    server.mock(|when, then| {
        when.method(POST).path("/broken");
        then.status(503);
    });

    let blank = HttpContentGenerator::new(server.url("/blank"), None, 5).unwrap();
    assert_eq!(blank.generate(&request()).await.unwrap(), None);

    let broken = HttpContentGenerator::new(server.url("/broken"), None, 5).unwrap();
    let err = broken.generate(&request()).await.unwrap_err();
    assert!(err.to_string().contains("rejected"));
}
