mod common;

use std::time::Duration;

use common::{
    capabilities, chat_response, embedding_response, inputs, orchestrator, with_header,
    ScriptedTransport,
};
use fastrag::provider::{ChatRequest, ProviderResponse, TransportError};
use fastrag::{Error, OrchestratorSettings};
use futures_util::future::try_join_all;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

const TABLE: &str = r#"
replace_defaults = true
[labels]
chat = ["a", "b"]
emb = ["A", "B"]
solo = ["only"]
"#;

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn server_errors_are_bounded_per_model() {
    let transport = ScriptedTransport::new(|_| Ok(ProviderResponse::new(503, "busy")));
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"]);

    let err = orchestrator
        .execute("chat", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("every model fails");

    match err {
        Error::CapabilityExhausted {
            label,
            last_model,
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(label, "chat");
            assert_eq!(last_model, "b");
            assert_eq!(attempts, 6);
            assert!(matches!(*last_error, Error::Server { status: 503, .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(transport.calls_to("a"), 3);
    assert_eq!(transport.calls_to("b"), 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn rate_limited_model_fails_over_after_every_key() {
    let transport = ScriptedTransport::new(|call| {
        if call.model == "A" {
            return Ok(ProviderResponse::new(429, "slow down"));
        }
        let vectors: Vec<Vec<f32>> = inputs(call).iter().map(|_| vec![1.0, 0.0]).collect();
        Ok(embedding_response(&vectors))
    });
    let orchestrator = orchestrator(
        transport.clone(),
        capabilities(TABLE),
        &["key-one", "key-two"],
    );

    let batch = orchestrator
        .embed("emb", &["x".to_string(), "y".to_string()])
        .await
        .expect("second model answers");

    assert_eq!(batch.model, "B");
    assert_eq!(batch.vectors.len(), 2);
    let calls = transport.calls();
    let a_keys: Vec<&str> = calls
        .iter()
        .filter(|call| call.model == "A")
        .map(|call| call.key.as_str())
        .collect();
    assert_eq!(a_keys.len(), 10);
    assert!(a_keys[..5].iter().all(|key| *key == "key-one"));
    assert!(a_keys[5..].iter().all(|key| *key == "key-two"));
    assert_eq!(transport.calls_to("B"), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn repeated_key_does_not_block_model_failover() {
    let transport = ScriptedTransport::new(|call| {
        if call.model == "A" {
            return Ok(ProviderResponse::new(429, "slow down"));
        }
        Ok(embedding_response(&[vec![0.5, 0.5]]))
    });
    let orchestrator = orchestrator(
        transport.clone(),
        capabilities(TABLE),
        &["same-key", "same-key"],
    );

    let batch = orchestrator
        .embed("emb", &["x".to_string()])
        .await
        .expect("second model answers");

    assert_eq!(batch.model, "B");
    assert_eq!(transport.calls_to("A"), 5);
    assert_eq!(transport.calls_to("B"), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn repeated_rejected_key_ends_in_auth_error() {
    let transport = ScriptedTransport::new(|_| Ok(ProviderResponse::new(401, "bad key")));
    let orchestrator = orchestrator(
        transport.clone(),
        capabilities(TABLE),
        &["same-key", "same-key"],
    );

    let err = orchestrator
        .execute("chat", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("the only key is rejected");

    assert!(matches!(err, Error::Auth { attempts: 3, .. }));
    assert_eq!(transport.calls().len(), 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_calls_rotate_shared_keys_once() {
    let transport = ScriptedTransport::new(|call| {
        if call.key == "key-one" {
            return Ok(ProviderResponse::new(429, "slow down"));
        }
        Ok(chat_response(&format!("from {}", call.key)))
    });
    let orchestrator = orchestrator(
        transport.clone(),
        capabilities(TABLE),
        &["key-one", "key-two", "key-three"],
    );

    let request = ChatRequest::new(None, "hi");
    let completions = try_join_all((0..4).map(|_| orchestrator.execute("solo", &request)))
        .await
        .expect("every call recovers on the next key");

    assert!(completions
        .iter()
        .all(|completion| completion.content == "from key-two"));
    let calls = transport.calls();
    assert_eq!(calls.iter().filter(|call| call.key == "key-one").count(), 12);
    assert_eq!(calls.iter().filter(|call| call.key == "key-two").count(), 4);
    assert!(calls.iter().all(|call| call.key != "key-three"));

    let next = orchestrator
        .execute("solo", &request)
        .await
        .expect("cursor stays on the second key");
    assert_eq!(next.content, "from key-two");
    assert_eq!(transport.calls().len(), 17);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn rejected_credentials_end_in_auth_error() {
    let transport = ScriptedTransport::new(|_| Ok(ProviderResponse::new(401, "bad key")));
    let orchestrator = orchestrator(
        transport.clone(),
        capabilities(TABLE),
        &["key-one", "key-two"],
    );

    let err = orchestrator
        .execute("chat", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("no key works");

    assert!(matches!(err, Error::Auth { ref model, .. } if model == "a"));
    let keys: Vec<String> = transport.calls().into_iter().map(|call| call.key).collect();
    assert_eq!(
        keys,
        vec!["key-one", "key-one", "key-one", "key-two", "key-two", "key-two"]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_minute_quota_sleeps_before_returning() {
    let transport = ScriptedTransport::new(|_| {
        let response = with_header(chat_response("done"), "x-ratelimit-remaining-minute", "0");
        Ok(with_header(response, "x-ratelimit-reset-minute", "7"))
    });
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"]);

    let started = Instant::now();
    let completion = orchestrator
        .execute("solo", &ChatRequest::new(None, "hi"))
        .await
        .expect("completion");

    assert_eq!(completion.content, "done");
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_hourly_quota_moves_to_next_key() {
    let transport = ScriptedTransport::new(|call| {
        let response = chat_response(&format!("from {}", call.key));
        if call.key == "key-one" {
            return Ok(with_header(response, "x-ratelimit-remaining-hour", "0"));
        }
        Ok(response)
    });
    let orchestrator = orchestrator(
        transport.clone(),
        capabilities(TABLE),
        &["key-one", "key-two"],
    );

    let completion = orchestrator
        .execute("solo", &ChatRequest::new(None, "hi"))
        .await
        .expect("completion");

    assert_eq!(completion.content, "from key-two");
    let keys: Vec<String> = transport.calls().into_iter().map(|call| call.key).collect();
    assert_eq!(keys, vec!["key-one", "key-two"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn call_deadline_cancels_in_flight_work() {
    let transport = ScriptedTransport::with_delay(Duration::from_secs(4), |_| {
        Ok(ProviderResponse::new(503, "busy"))
    });
    let settings = OrchestratorSettings {
        call_timeout: Some(Duration::from_secs(10)),
        ..OrchestratorSettings::default()
    };
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"])
        .with_settings(settings);

    let err = orchestrator
        .execute("solo", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("deadline");

    match err {
        Error::Cancelled { elapsed, attempts } => {
            assert_eq!(attempts, 2);
            assert!(elapsed >= Duration::from_secs(10));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn timeouts_and_network_errors_are_retried() {
    let transport = ScriptedTransport::new(|_| Err(TransportError::Timeout));
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"]);
    let err = orchestrator
        .execute("solo", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("always times out");
    assert!(matches!(
        err,
        Error::CapabilityExhausted { ref last_error, .. }
            if matches!(**last_error, Error::Timeout { .. })
    ));
    assert_eq!(transport.calls().len(), 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn client_side_failures_surface_as_request_errors() {
    let transport =
        ScriptedTransport::new(|_| Err(TransportError::Other("invalid mime type".into())));
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"]);
    let err = orchestrator
        .execute("solo", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("request never builds");
    match err {
        Error::CapabilityExhausted { last_error, .. } => match *last_error {
            Error::Request {
                ref model,
                ref key_prefix,
                attempts,
                ref message,
            } => {
                assert_eq!(model, "only");
                assert_eq!(key_prefix, "key-on");
                assert_eq!(attempts, 3);
                assert_eq!(message, "invalid mime type");
            }
            other => panic!("unexpected last error {other:?}"),
        },
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(transport.calls().len(), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_success_is_not_retried() {
    let transport = ScriptedTransport::new(|_| Ok(ProviderResponse::new(200, "{\"choices\": []}")));
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"]);
    let err = orchestrator
        .execute("chat", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("malformed");
    assert!(matches!(err, Error::MalformedResponse { .. }));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_label_makes_no_request() {
    let transport = ScriptedTransport::new(|_| Ok(chat_response("never")));
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"]);
    let err = orchestrator
        .execute("painter", &ChatRequest::new(None, "hi"))
        .await
        .expect_err("unknown");
    assert!(matches!(err, Error::UnknownCapability(ref label) if label == "painter"));
    assert!(transport.calls().is_empty());

    let direct = orchestrator
        .execute("b", &ChatRequest::new(None, "hi"))
        .await
        .expect("model ids resolve directly");
    assert_eq!(direct.model, "b");
}

#[tokio::test(flavor = "current_thread")]
async fn empty_embedding_input_skips_the_provider() {
    let transport = ScriptedTransport::new(|_| Ok(embedding_response(&[])));
    let orchestrator = orchestrator(transport.clone(), capabilities(TABLE), &["key-one"]);
    let batch = orchestrator.embed("emb", &[]).await.expect("empty batch");
    assert!(batch.vectors.is_empty());
    assert!(transport.calls().is_empty());
}
