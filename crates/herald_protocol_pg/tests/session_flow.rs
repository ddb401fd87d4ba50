//! End-to-end session tests: a real `FrontendSession` driven over an
//! in-memory duplex stream, asserting on literal wire transcripts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use herald_common::config::{
    AuthConfig, AuthMethod, HeraldConfig, ListenConfig, VirtualDatabase,
};
use herald_protocol_pg::auth;
use herald_protocol_pg::dispatch::{
    Notification, NotifyDispatcher, UpstreamCommand, INPUT_CHANNEL_CAPACITY,
};
use herald_protocol_pg::liveness::ConnectionGate;
use herald_protocol_pg::session::FrontendSession;

const PROTOCOL_VERSION: i32 = 196608;

fn trust_db(name: &str) -> VirtualDatabase {
    VirtualDatabase {
        name: name.to_string(),
        auth: AuthConfig {
            method: AuthMethod::Trust,
            user: String::new(),
            password: String::new(),
        },
    }
}

fn md5_db(name: &str, user: &str, password: &str) -> VirtualDatabase {
    VirtualDatabase {
        name: name.to_string(),
        auth: AuthConfig {
            method: AuthMethod::Md5,
            user: user.to_string(),
            password: password.to_string(),
        },
    }
}

fn config_with(databases: Vec<VirtualDatabase>) -> Arc<HeraldConfig> {
    let mut startup_parameters = BTreeMap::new();
    startup_parameters.insert("server_version".to_string(), "9.4.1".to_string());
    Arc::new(HeraldConfig {
        listen: ListenConfig {
            port: 6433,
            host: "localhost".to_string(),
            keepalive: true,
        },
        connect: "host=localhost port=5432".to_string(),
        startup_parameters,
        databases,
        prometheus: None,
    })
}

struct Harness {
    client: DuplexStream,
    commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    gate: Arc<ConnectionGate>,
    notify_tx: mpsc::Sender<Notification>,
    session: JoinHandle<()>,
}

async fn start_session(config: Arc<HeraldConfig>, buffer: usize) -> Harness {
    let (client, server) = tokio::io::duplex(buffer);
    let (dispatcher, commands) = NotifyDispatcher::new();
    let (notify_tx, notify_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    dispatcher.spawn_fanout(notify_rx);

    let gate = Arc::new(ConnectionGate::new());
    gate.set_connected();
    let signal = gate.capture().unwrap();

    let session = FrontendSession::new(
        server,
        "test-client".to_string(),
        1,
        dispatcher,
        signal,
        config,
    );
    let session = tokio::spawn(session.run());

    Harness {
        client,
        commands,
        gate,
        notify_tx,
        session,
    }
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

fn tagged_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![tag];
    frame.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn startup_frame(params: &[(&str, &str)]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    for (k, v) in params {
        payload.extend_from_slice(&cstr(k));
        payload.extend_from_slice(&cstr(v));
    }
    payload.push(0);

    let mut frame = Vec::new();
    frame.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

fn query_frame(sql: &str) -> Vec<u8> {
    tagged_frame(b'Q', &cstr(sql))
}

fn parse_frame(statement: &str, query: &str) -> Vec<u8> {
    let mut payload = cstr(statement);
    payload.extend_from_slice(&cstr(query));
    payload.extend_from_slice(&0i16.to_be_bytes());
    tagged_frame(b'P', &payload)
}

fn bind_frame() -> Vec<u8> {
    let mut payload = cstr("");
    payload.extend_from_slice(&cstr(""));
    payload.extend_from_slice(&0i16.to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes());
    tagged_frame(b'B', &payload)
}

fn describe_frame(kind: u8) -> Vec<u8> {
    let mut payload = vec![kind];
    payload.extend_from_slice(&cstr(""));
    tagged_frame(b'D', &payload)
}

fn execute_frame() -> Vec<u8> {
    let mut payload = cstr("");
    payload.extend_from_slice(&0i32.to_be_bytes());
    tagged_frame(b'E', &payload)
}

fn sync_frame() -> Vec<u8> {
    tagged_frame(b'S', &[])
}

fn terminate_frame() -> Vec<u8> {
    tagged_frame(b'X', &[])
}

fn password_frame(body: &[u8]) -> Vec<u8> {
    tagged_frame(b'p', body)
}

async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
    try_read_frame(client).await.expect("unexpected EOF")
}

async fn try_read_frame(client: &mut DuplexStream) -> Option<(u8, Vec<u8>)> {
    let mut tag = [0u8; 1];
    if client.read_exact(&mut tag).await.is_err() {
        return None;
    }
    let mut len = [0u8; 4];
    client.read_exact(&mut len).await.unwrap();
    let len = i32::from_be_bytes(len) as usize;
    let mut payload = vec![0u8; len - 4];
    client.read_exact(&mut payload).await.unwrap();
    Some((tag[0], payload))
}

async fn read_until_ready(client: &mut DuplexStream) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    loop {
        let frame = read_frame(client).await;
        let done = frame.0 == b'Z';
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

async fn handshake(client: &mut DuplexStream) -> Vec<(u8, Vec<u8>)> {
    client
        .write_all(&startup_frame(&[("user", "alice"), ("database", "events")]))
        .await
        .unwrap();
    read_until_ready(client).await
}

fn tags(frames: &[(u8, Vec<u8>)]) -> Vec<u8> {
    frames.iter().map(|f| f.0).collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[tokio::test]
async fn startup_replays_parameters_and_goes_idle() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    let frames = handshake(&mut h.client).await;

    assert_eq!(tags(&frames), vec![b'R', b'S', b'Z']);
    // AuthenticationOk
    assert_eq!(frames[0].1, 0i32.to_be_bytes());
    // the configured startup parameter
    assert_eq!(frames[1].1, b"server_version\x009.4.1\x00");
    // idle
    assert_eq!(frames[2].1, b"I");
}

#[tokio::test]
async fn simple_query_select_1() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client.write_all(&query_frame("select 1")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;

    assert_eq!(tags(&frames), vec![b'T', b'D', b'C', b'Z']);
    assert!(contains(&frames[0].1, b"?column?\x00"));
    assert_eq!(frames[1].1, [0, 1, 0, 0, 0, 1, b'1']);
    assert_eq!(frames[2].1, b"SELECT\x00");
    assert_eq!(frames[3].1, b"I");
}

#[tokio::test]
async fn listen_then_empty_query() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client.write_all(&query_frame("LISTEN foo")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'C', b'Z']);
    assert_eq!(frames[0].1, b"LISTEN\x00");

    h.client.write_all(&query_frame("")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'I', b'Z']);

    // the first subscriber triggered an upstream LISTEN
    assert_eq!(
        h.commands.recv().await,
        Some(UpstreamCommand::Listen("foo".to_string()))
    );
}

#[tokio::test]
async fn parse_error_transcript() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client.write_all(&query_frame("notify")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;

    assert_eq!(tags(&frames), vec![b'E', b'Z']);
    assert!(contains(&frames[0].1, b"ERROR\x00"));
    assert!(contains(&frames[0].1, b"42601\x00"));
    assert!(contains(&frames[0].1, b"parse error at or near \"notify\"\x00"));

    // the session survives a parse error
    h.client.write_all(&query_frame("select 1")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'T', b'D', b'C', b'Z']);
}

#[tokio::test]
async fn notification_delivery() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client.write_all(&query_frame("LISTEN foo")).await.unwrap();
    read_until_ready(&mut h.client).await;

    h.notify_tx
        .send(Notification {
            pid: 42,
            channel: "foo".to_string(),
            payload: "bar".to_string(),
        })
        .await
        .unwrap();

    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'A');
    let mut expected = 42i32.to_be_bytes().to_vec();
    expected.extend_from_slice(b"foo\x00bar\x00");
    assert_eq!(payload, expected);
}

#[tokio::test]
async fn unlisten_all_stops_delivery() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client.write_all(&query_frame("LISTEN foo")).await.unwrap();
    read_until_ready(&mut h.client).await;
    h.client.write_all(&query_frame("unlisten *")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'C', b'Z']);
    assert_eq!(frames[0].1, b"UNLISTEN\x00");

    h.notify_tx
        .send(Notification {
            pid: 1,
            channel: "foo".to_string(),
            payload: "dropped".to_string(),
        })
        .await
        .unwrap();

    // no NotificationResponse may interleave with the next query
    h.client.write_all(&query_frame("select 1")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'T', b'D', b'C', b'Z']);

    assert_eq!(
        h.commands.recv().await,
        Some(UpstreamCommand::Listen("foo".to_string()))
    );
    assert_eq!(
        h.commands.recv().await,
        Some(UpstreamCommand::Unlisten("foo".to_string()))
    );
}

#[tokio::test]
async fn upstream_loss_terminates_with_57a02() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.gate.set_disconnected();

    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'E');
    assert!(contains(&payload, b"FATAL\x00"));
    assert!(contains(&payload, b"57A02\x00"));
    assert!(contains(
        &payload,
        b"terminating connection because the server connection was lost\x00"
    ));

    assert!(try_read_frame(&mut h.client).await.is_none());
    h.session.await.unwrap();
}

#[tokio::test]
async fn slow_client_is_evicted_with_57a03() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 16).await;
    handshake(&mut h.client).await;

    h.client.write_all(&query_frame("LISTEN foo")).await.unwrap();
    read_until_ready(&mut h.client).await;

    // Each frame is larger than the duplex buffer, so an undrained client
    // parks the writer mid-flush.
    let notification = |i: usize| Notification {
        pid: 7,
        channel: "foo".to_string(),
        payload: format!("payload-{:04}", i),
    };

    // The first notification parks the writer in a flush the client is
    // not draining.
    h.notify_tx.send(notification(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Fill the inbox behind the stalled writer.
    for i in 1..=32 {
        h.notify_tx.send(notification(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Once the client drains, the writer delivers the in-flight frame,
    // observes the inbox at capacity minus one and evicts.
    let mut frames = Vec::new();
    while let Some(frame) = try_read_frame(&mut h.client).await {
        frames.push(frame);
    }
    assert_eq!(frames[0].0, b'A');
    let fatal = frames.last().unwrap();
    assert_eq!(fatal.0, b'E');
    assert!(contains(&fatal.1, b"FATAL\x00"));
    assert!(contains(&fatal.1, b"57A03\x00"));
    assert!(contains(
        &fatal.1,
        b"terminating connection because the client could not keep up\x00"
    ));
    h.session.await.unwrap();
}

#[tokio::test]
async fn extended_protocol_happy_path() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    let mut batch = Vec::new();
    batch.extend_from_slice(&parse_frame("", "select 1"));
    batch.extend_from_slice(&describe_frame(b'S'));
    batch.extend_from_slice(&bind_frame());
    batch.extend_from_slice(&execute_frame());
    batch.extend_from_slice(&sync_frame());
    h.client.write_all(&batch).await.unwrap();

    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'1', b'T', b'2', b'D', b'C', b'Z']);
}

#[tokio::test]
async fn extended_protocol_describe_listen_is_no_data() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    let mut batch = Vec::new();
    batch.extend_from_slice(&parse_frame("", "listen foo"));
    batch.extend_from_slice(&describe_frame(b'S'));
    batch.extend_from_slice(&bind_frame());
    batch.extend_from_slice(&execute_frame());
    batch.extend_from_slice(&sync_frame());
    h.client.write_all(&batch).await.unwrap();

    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'1', b'n', b'2', b'C', b'Z']);
    assert_eq!(frames[3].1, b"LISTEN\x00");
}

#[tokio::test]
async fn failed_parse_discards_until_sync() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    let mut batch = Vec::new();
    batch.extend_from_slice(&parse_frame("", "notify"));
    batch.extend_from_slice(&bind_frame());
    batch.extend_from_slice(&execute_frame());
    batch.extend_from_slice(&sync_frame());
    h.client.write_all(&batch).await.unwrap();

    let frames = read_until_ready(&mut h.client).await;
    // Bind and Execute are swallowed; exactly one ReadyForQuery follows
    assert_eq!(tags(&frames), vec![b'E', b'Z']);
    assert!(contains(&frames[0].1, b"42601\x00"));

    // and the session is resynchronized
    h.client.write_all(&query_frame("select 1")).await.unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'T', b'D', b'C', b'Z']);
}

#[tokio::test]
async fn named_statement_is_session_fatal() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client
        .write_all(&parse_frame("stmt", "select 1"))
        .await
        .unwrap();

    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'E');
    assert!(contains(&payload, b"FATAL\x00"));
    assert!(contains(&payload, b"08P01\x00"));
    assert!(contains(&payload, b"attempted to use statement name \"stmt\""));
    assert!(try_read_frame(&mut h.client).await.is_none());
    h.session.await.unwrap();
}

#[tokio::test]
async fn execute_without_parse_is_session_fatal() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client.write_all(&execute_frame()).await.unwrap();

    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'E');
    assert!(contains(&payload, b"08P01\x00"));
    assert!(contains(
        &payload,
        b"attempted to execute the unnamed prepared statement when one does not exist"
    ));
    assert!(try_read_frame(&mut h.client).await.is_none());
}

#[tokio::test]
async fn unnamed_statement_is_cleared_after_execute() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    let mut batch = Vec::new();
    batch.extend_from_slice(&parse_frame("", "select 1"));
    batch.extend_from_slice(&bind_frame());
    batch.extend_from_slice(&execute_frame());
    batch.extend_from_slice(&sync_frame());
    // reuse after Execute is deliberately disallowed
    batch.extend_from_slice(&execute_frame());
    h.client.write_all(&batch).await.unwrap();

    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'1', b'2', b'D', b'C', b'Z']);

    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'E');
    assert!(contains(&payload, b"FATAL\x00"));
    assert!(try_read_frame(&mut h.client).await.is_none());
}

#[tokio::test]
async fn terminate_closes_silently() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client.write_all(&terminate_frame()).await.unwrap();
    assert!(try_read_frame(&mut h.client).await.is_none());
    h.session.await.unwrap();
}

#[tokio::test]
async fn ssl_request_is_rejected_then_startup_proceeds() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;

    let mut ssl = Vec::new();
    ssl.extend_from_slice(&8i32.to_be_bytes());
    ssl.extend_from_slice(&80877103i32.to_be_bytes());
    h.client.write_all(&ssl).await.unwrap();

    let mut reply = [0u8; 1];
    h.client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"N");

    let frames = handshake(&mut h.client).await;
    assert_eq!(*tags(&frames).last().unwrap(), b'Z');
}

#[tokio::test]
async fn cancel_request_closes_silently() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;

    let mut cancel = Vec::new();
    cancel.extend_from_slice(&16i32.to_be_bytes());
    cancel.extend_from_slice(&80877102i32.to_be_bytes());
    cancel.extend_from_slice(&1234i32.to_be_bytes());
    cancel.extend_from_slice(&5678i32.to_be_bytes());
    h.client.write_all(&cancel).await.unwrap();

    assert!(try_read_frame(&mut h.client).await.is_none());
    h.session.await.unwrap();
}

#[tokio::test]
async fn missing_user_fails_with_08p01() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;

    h.client
        .write_all(&startup_frame(&[("database", "events")]))
        .await
        .unwrap();
    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'E');
    assert!(contains(&payload, b"FATAL\x00"));
    assert!(contains(&payload, b"08P01\x00"));
}

#[tokio::test]
async fn unknown_database_fails_with_3d000() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;

    h.client
        .write_all(&startup_frame(&[("user", "alice"), ("database", "nope")]))
        .await
        .unwrap();
    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'E');
    assert!(contains(&payload, b"3D000\x00"));
    assert!(contains(&payload, b"database \"nope\" does not exist\x00"));
}

#[tokio::test]
async fn database_defaults_to_user_name() {
    let mut h = start_session(config_with(vec![trust_db("alice")]), 1024).await;

    h.client
        .write_all(&startup_frame(&[("user", "alice")]))
        .await
        .unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(*tags(&frames).last().unwrap(), b'Z');
}

#[tokio::test]
async fn md5_auth_round_trip() {
    let config = config_with(vec![md5_db("events", "alice", "hunter2")]);
    let mut h = start_session(config, 1024).await;

    h.client
        .write_all(&startup_frame(&[("user", "alice"), ("database", "events")]))
        .await
        .unwrap();

    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'R');
    assert_eq!(&payload[..4], &5i32.to_be_bytes());
    let salt = [payload[4], payload[5], payload[6], payload[7]];

    let answer = auth::md5_response("hunter2", "alice", salt);
    h.client.write_all(&password_frame(&answer)).await.unwrap();

    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(frames[0].0, b'R');
    assert_eq!(frames[0].1, 0i32.to_be_bytes());
    assert_eq!(*tags(&frames).last().unwrap(), b'Z');
}

#[tokio::test]
async fn md5_auth_wrong_password_fails_with_28001() {
    let config = config_with(vec![md5_db("events", "alice", "hunter2")]);
    let mut h = start_session(config, 1024).await;

    h.client
        .write_all(&startup_frame(&[("user", "alice"), ("database", "events")]))
        .await
        .unwrap();

    let (_, payload) = read_frame(&mut h.client).await;
    let salt = [payload[4], payload[5], payload[6], payload[7]];
    let answer = auth::md5_response("wrong", "alice", salt);
    h.client.write_all(&password_frame(&answer)).await.unwrap();

    let (tag, payload) = read_frame(&mut h.client).await;
    assert_eq!(tag, b'E');
    assert!(contains(&payload, b"28001\x00"));
    assert!(contains(
        &payload,
        b"password authentication failed for user \"alice\"\x00"
    ));
    assert!(try_read_frame(&mut h.client).await.is_none());
}

#[tokio::test]
async fn jdbc_float_digits_workaround_is_a_nop_set() {
    let mut h = start_session(config_with(vec![trust_db("events")]), 1024).await;
    handshake(&mut h.client).await;

    h.client
        .write_all(&query_frame("SET extra_float_digits = 3"))
        .await
        .unwrap();
    let frames = read_until_ready(&mut h.client).await;
    assert_eq!(tags(&frames), vec![b'C', b'Z']);
    assert_eq!(frames[0].1, b"SET\x00");
}
