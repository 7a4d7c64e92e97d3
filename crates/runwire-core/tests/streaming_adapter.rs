//! Integration tests for run submission, streaming, cancellation and retry.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fixtures::{
    CANCEL_PATH, CHAT_PATH, STREAM_PATH, api_error, config_for, count_requests, created, delta,
    done, error_event, mount_bootstrap, sse_response,
};
use runwire_core::runs::{RunRecord, RunStatus};
use runwire_core::stream::{ChatClient, ChatError};
use runwire_core::transport::TransportError;
use runwire_core::{ChatMessage, Role, ServerMessage};
use serde_json::{Value, json};
use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_terminal(client: &ChatClient, run_id: &str) -> RunRecord {
    tokio::time::timeout(WAIT, client.store().wait_for_terminal(run_id))
        .await
        .expect("run did not finish in time")
        .expect("run disappeared")
}

/// Spawns `send_run` for one user message and waits until the store reports
/// its run as active with `status`.
async fn spawn_send(
    client: &Arc<ChatClient>,
    message: ChatMessage,
    status: RunStatus,
) -> (String, tokio::task::JoinHandle<Result<String, ChatError>>) {
    let mut state = client.store().subscribe();
    let sending = {
        let client = Arc::clone(client);
        tokio::spawn(async move { client.send_run(&[message], None).await })
    };
    let run_id = tokio::time::timeout(
        WAIT,
        state.wait_for(|state| state.active_run().is_some_and(|run| run.status == status)),
    )
    .await
    .unwrap()
    .unwrap()
    .active_run()
    .map(|run| run.id.clone())
    .unwrap();
    (run_id, sending)
}

async fn chat_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.method.as_str() == "POST" && request.url.path() == CHAT_PATH)
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

fn server_message(id: &str, role: Role, content: &str) -> ServerMessage {
    ServerMessage {
        id: id.to_string(),
        role,
        content: content.to_string(),
        timestamp: Utc::now(),
        event_seq: None,
    }
}

#[tokio::test]
async fn test_send_run_streams_out_of_order_deltas() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(created("run_b1", Some("srv_u1")))
        .expect(1)
        .mount(&server)
        .await;
    let body = [
        delta(2, " world"),
        delta(1, "Hello"),
        delta(2, " world"),
        delta(3, "!"),
        done(4, "srv_a1"),
    ]
    .concat();
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("run_id", "run_b1"))
        .respond_with(sse_response(&body))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(config_for(&server)).unwrap();
    let run_id = client
        .send_run(&[ChatMessage::user("u1", "Say hello")], None)
        .await
        .unwrap();
    let run = wait_terminal(&client, &run_id).await;

    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.backend_run_id.as_deref(), Some("run_b1"));
    assert_eq!(run.conversation_id.as_deref(), Some("conv_1"));
    assert_eq!(run.source_message_id.as_deref(), Some("srv_u1"));
    assert_eq!(run.result_message_id.as_deref(), Some("srv_a1"));
    assert_eq!(run.last_event_seq, Some(4));
    assert!(run.received_any_delta);
    assert!(client.store().active_run().is_none());

    let transcript = client.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].id, "u1");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content, "Hello world!");

    let bodies = chat_bodies(&server).await;
    assert_eq!(
        bodies[0],
        json!({ "messages": [{ "id": "u1", "role": "user", "content": "Say hello" }] })
    );

    // Once the server lists both messages, the local copies disappear.
    let server_messages = [
        server_message("srv_u1", Role::User, "Say hello"),
        server_message("srv_a1", Role::Assistant, "Hello world!"),
    ];
    let shown = client.messages(&server_messages, Utc::now());
    let ids: Vec<&str> = shown.iter().map(|message| message.id.as_str()).collect();
    assert_eq!(ids, vec!["srv_u1", "srv_a1"]);
}

#[tokio::test]
async fn test_error_event_marks_run_error() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(created("run_b1", None))
        .mount(&server)
        .await;
    let body = [
        delta(1, "Partial"),
        error_event(2, "E_PROVIDER", "upstream overloaded"),
    ]
    .concat();
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(sse_response(&body))
        .mount(&server)
        .await;

    let client = ChatClient::new(config_for(&server)).unwrap();
    let run_id = client
        .send_run(&[ChatMessage::user("u1", "hi")], None)
        .await
        .unwrap();
    let run = wait_terminal(&client, &run_id).await;

    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error_code.as_deref(), Some("E_PROVIDER"));
    assert_eq!(run.error_message.as_deref(), Some("upstream overloaded"));

    // Messages of a failed run stay visible well past the pending window.
    let later = Utc::now() + chrono::Duration::hours(1);
    let shown = client.messages(&[], later);
    assert_eq!(shown.len(), 2);
    assert_eq!(shown[0].id, "u1");
    assert_eq!(shown[1].content, "Partial");
}

#[tokio::test]
async fn test_creation_failure_marks_run_error_and_keeps_message() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(api_error(500, "E_UPSTREAM", "model unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(config_for(&server)).unwrap();
    let err = client
        .send_run(&[ChatMessage::user("u1", "hi")], None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ChatError::Transport(TransportError::Status { status: 500, .. })
    ));
    let run = client.store().last_run().unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error_code.as_deref(), Some("E_UPSTREAM"));
    assert!(client.store().active_run().is_none());
    assert_eq!(count_requests(&server, "GET", STREAM_PATH).await, 0);

    let later = Utc::now() + chrono::Duration::hours(1);
    let shown = client.messages(&[], later);
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].id, "u1");
}

#[tokio::test]
async fn test_retry_resubmits_snapshot_with_lineage() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(api_error(502, "E_UPSTREAM", "bad gateway"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(created("run_b2", None))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("run_id", "run_b2"))
        .respond_with(sse_response(&[delta(1, "Second try"), done(2, "srv_a2")].concat()))
        .mount(&server)
        .await;

    let client = ChatClient::new(config_for(&server)).unwrap();
    client
        .send_run(&[ChatMessage::user("u1", "hi")], None)
        .await
        .unwrap_err();
    let original = client.store().last_run().unwrap();

    let retry_id = client.retry(&original.id).await.unwrap();
    let retry = wait_terminal(&client, &retry_id).await;

    assert_eq!(retry.status, RunStatus::Done);
    assert_eq!(retry.retry_of_run_id.as_deref(), Some(original.id.as_str()));
    assert_eq!(retry.request_messages, original.request_messages);
    assert_eq!(
        client.store().retry_lineage(&retry_id),
        vec![original.id.clone(), retry_id.clone()]
    );
    assert_eq!(client.store().run(&original.id).unwrap(), original);

    // The user message is not duplicated by the retry.
    let transcript = client.transcript();
    let users = transcript.iter().filter(|m| m.role == Role::User).count();
    assert_eq!(users, 1);

    let bodies = chat_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0], bodies[1]);
}

#[tokio::test]
async fn test_retry_unknown_run() {
    let server = MockServer::start().await;
    let client = ChatClient::new(config_for(&server)).unwrap();

    let err = client.retry("missing").await.unwrap_err();

    assert!(matches!(err, ChatError::UnknownRun(id) if id == "missing"));
}

#[tokio::test]
async fn test_cancel_marks_cancelled_even_when_backend_fails() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(created("run_b1", None))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(sse_response(&delta(1, "late")).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CANCEL_PATH))
        .and(body_json(json!({ "run_id": "run_b1" })))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(ChatClient::new(config_for(&server)).unwrap());
    let mut state = client.store().subscribe();
    let sending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .send_run(&[ChatMessage::user("u1", "hi")], None)
                .await
        })
    };

    // Cancel while the stream request is still waiting for headers.
    let streaming = tokio::time::timeout(
        WAIT,
        state.wait_for(|state| {
            state
                .active_run()
                .is_some_and(|run| run.status == RunStatus::Streaming)
        }),
    )
    .await
    .unwrap()
    .unwrap()
    .active_run()
    .map(|run| run.id.clone())
    .unwrap();

    client.cancel_run(&streaming).await.unwrap();

    let run = client.store().run(&streaming).unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error_code.as_deref(), Some("E_CANCELLED"));
    assert_eq!(run.error_message.as_deref(), Some("Run cancelled by user"));

    let run_id = sending.await.unwrap().unwrap();
    assert_eq!(run_id, streaming);

    // The late stream must not revive the run.
    let run = client.store().run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(!run.received_any_delta);
}

#[tokio::test]
async fn test_cancel_finished_run_skips_backend() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(created("run_b1", None))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(sse_response(&done(1, "srv_a1")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CANCEL_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = ChatClient::new(config_for(&server)).unwrap();
    let run_id = client
        .send_run(&[ChatMessage::user("u1", "hi")], None)
        .await
        .unwrap();
    wait_terminal(&client, &run_id).await;

    client.cancel_run(&run_id).await.unwrap();

    assert_eq!(client.store().run(&run_id).unwrap().status, RunStatus::Done);
}

#[tokio::test]
async fn test_cancel_unknown_run() {
    let server = MockServer::start().await;
    let client = ChatClient::new(config_for(&server)).unwrap();

    let err = client.cancel_run("missing").await.unwrap_err();

    assert!(matches!(err, ChatError::UnknownRun(_)));
}

#[tokio::test]
async fn test_stream_open_failure_is_recorded_on_run() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(created("run_b1", None))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(api_error(404, "E_RUN_NOT_FOUND", "no such run"))
        .mount(&server)
        .await;

    let client = ChatClient::new(config_for(&server)).unwrap();
    let run_id = client
        .send_run(&[ChatMessage::user("u1", "hi")], None)
        .await
        .unwrap();

    let run = client.store().run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error_code.as_deref(), Some("E_RUN_NOT_FOUND"));
}

#[tokio::test]
async fn test_new_run_supersedes_run_waiting_for_stream() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(body_string_contains("\"u1\""))
        .respond_with(created("run_b1", None))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(body_string_contains("\"u2\""))
        .respond_with(created("run_b2", None))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("run_id", "run_b1"))
        .respond_with(
            sse_response(&[delta(1, "stale"), done(2, "srv_a1")].concat())
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("run_id", "run_b2"))
        .respond_with(sse_response(&[delta(1, "fresh"), done(2, "srv_a2")].concat()))
        .mount(&server)
        .await;

    let client = Arc::new(ChatClient::new(config_for(&server)).unwrap());
    let (first, sending) =
        spawn_send(&client, ChatMessage::user("u1", "first"), RunStatus::Streaming).await;

    let second = client
        .send_run(&[ChatMessage::user("u2", "second")], None)
        .await
        .unwrap();

    assert_eq!(client.store().run(&first).unwrap().status, RunStatus::Cancelled);
    assert_eq!(wait_terminal(&client, &second).await.status, RunStatus::Done);
    assert_eq!(sending.await.unwrap().unwrap(), first);

    let first_run = client.store().run(&first).unwrap();
    assert_eq!(first_run.status, RunStatus::Cancelled);
    assert!(!first_run.received_any_delta);

    let transcript = client.transcript();
    assert!(transcript.iter().all(|message| message.content != "stale"));
    assert!(transcript.iter().any(|message| message.content == "fresh"));
}

#[tokio::test]
async fn test_new_run_supersedes_run_still_being_created() {
    let server = MockServer::start().await;
    mount_bootstrap(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(body_string_contains("\"u1\""))
        .respond_with(created("run_b1", None).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(body_string_contains("\"u2\""))
        .respond_with(created("run_b2", None))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("run_id", "run_b1"))
        .respond_with(sse_response(&delta(1, "stale")))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("run_id", "run_b2"))
        .respond_with(sse_response(&[delta(1, "fresh"), done(2, "srv_a2")].concat()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CANCEL_PATH))
        .and(body_json(json!({ "run_id": "run_b1" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(ChatClient::new(config_for(&server)).unwrap());
    let (first, sending) =
        spawn_send(&client, ChatMessage::user("u1", "first"), RunStatus::Idle).await;

    let second = client
        .send_run(&[ChatMessage::user("u2", "second")], None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&client, &second).await.status, RunStatus::Done);
    assert_eq!(sending.await.unwrap().unwrap(), first);

    let first_run = client.store().run(&first).unwrap();
    assert_eq!(first_run.status, RunStatus::Cancelled);
    assert_eq!(first_run.backend_run_id, None);
    assert_eq!(count_requests(&server, "GET", STREAM_PATH).await, 1);

    let transcript = client.transcript();
    let assistants: Vec<&str> = transcript
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(assistants, vec!["fresh"]);
}
