//! End-to-end session tests.
//!
//! Each test runs a real server and client over loopback TCP or an
//! in-memory duplex stream, using the example command set (`version`, `inc`,
//! `dec`) plus a client-side `prn` callback.
//!
//! # Running
//!
//! ```bash
//! cargo test --test session_integration -- --nocapture
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arpc::codec::{self, FrameReader, Message};
use arpc::error::{NAME_ERROR, PANIC_ERROR, TYPE_ERROR};
use arpc::{
    connect, connect_stream, serve_stream, Args, ConnectOptions, RemoteError, Registry, RpcError,
    Server, ServerOptions, Session,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn server_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .insert_value("version", json!({"major": 1, "minor": 0}))
        .register_sync("inc", |args| Ok(args.get::<i64>(0)? + 1))
        .register_sync("boom", |_args| -> Result<Value, RemoteError> {
            panic!("sensor unplugged")
        })
        .register_async("dec", |session, args| async move {
            let u: i64 = args.get(0)?;
            session
                .call("prn", Args::new().arg("decrementing"))
                .await
                .map_err(|e| RemoteError::value_error(e.to_string()))?;
            sleep(Duration::from_millis(50)).await;
            session
                .call("prn", Args::new().arg("done"))
                .await
                .map_err(|e| RemoteError::value_error(e.to_string()))?;
            Ok::<_, RemoteError>(u - 1)
        })
        .register_async("eager", |_session, args| {
            // Panics before the future exists
            let n: i64 = args.get(0).unwrap();
            async move { Ok::<_, RemoteError>(n) }
        })
        .register_async("async_boom", |_session, _args| async move {
            if true {
                panic!("async handler failed");
            }
            Ok::<_, RemoteError>(Value::Null)
        });
    registry
}

/// Client registry recording every `prn` argument.
fn recording_registry() -> (Registry, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    let sink = Arc::clone(&log);
    registry.register_sync("prn", move |args| {
        let text: String = args.get(0)?;
        sink.lock().unwrap().push(text);
        Ok(Value::Null)
    });
    (registry, log)
}

/// Start a TCP server on an ephemeral port and return its address.
async fn start_server(options: ServerOptions) -> String {
    let server = Server::bind("127.0.0.1:0", Arc::new(server_registry()), options)
        .await
        .expect("Failed to bind test server");
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run());
    addr
}

async fn connect_client(addr: &str, options: ConnectOptions) -> Session {
    timeout(TEST_TIMEOUT, connect(addr, options))
        .await
        .expect("Connect timed out")
        .expect("Connect failed")
}

async fn call(session: &Session, name: &str, args: Args) -> Result<Value, RpcError> {
    timeout(TEST_TIMEOUT, session.call(name, args))
        .await
        .expect("Call timed out")
}

// =============================================================================
// Calls
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_call_with_password() {
    let addr = start_server(ServerOptions::default().password("rrr")).await;
    let session = connect_client(&addr, ConnectOptions::default().password("rrr")).await;

    assert_eq!(call(&session, "inc", Args::new().arg(5)).await.unwrap(), json!(6));
    let six: i64 = session.call_as("inc", Args::new().arg(5)).await.unwrap();
    assert_eq!(six, 6);

    session.close().await;
}

#[tokio::test]
async fn test_value_entry() {
    let addr = start_server(ServerOptions::default()).await;
    let session = connect_client(&addr, ConnectOptions::default()).await;

    let version = call(&session, "version", Args::new()).await.unwrap();
    assert_eq!(version, json!({"major": 1, "minor": 0}));

    session.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_call_with_callbacks() {
    let addr = start_server(ServerOptions::default()).await;
    let (registry, log) = recording_registry();
    let session = connect_client(&addr, ConnectOptions::new(Arc::new(registry))).await;

    let result = call(&session, "dec", Args::new().arg(5)).await.unwrap();
    assert_eq!(result, json!(4));
    // Both callbacks were answered before the final result arrived
    assert_eq!(
        *log.lock().unwrap(),
        vec!["decrementing".to_string(), "done".to_string()]
    );

    session.close().await;
}

#[tokio::test]
async fn test_concurrent_async_calls_and_sync_call() {
    let addr = start_server(ServerOptions::default()).await;
    let (registry, _log) = recording_registry();
    let session = connect_client(&addr, ConnectOptions::new(Arc::new(registry))).await;

    // `inc` is answered while both `dec` handlers are still sleeping
    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        call(&session, "dec", Args::new().arg(10)),
        call(&session, "dec", Args::new().arg(20)),
        call(&session, "inc", Args::new().arg(1)),
    );
    assert_eq!(a.unwrap(), json!(9));
    assert_eq!(b.unwrap(), json!(19));
    assert_eq!(c.unwrap(), json!(2));
    assert!(started.elapsed() < Duration::from_secs(5));

    session.close().await;
}

// =============================================================================
// Remote errors
// =============================================================================

#[tokio::test]
async fn test_unknown_command_is_name_error() {
    let addr = start_server(ServerOptions::default()).await;
    let session = connect_client(&addr, ConnectOptions::default()).await;

    let err = call(&session, "gcc", Args::new()).await.unwrap_err();
    let remote = err.as_remote().expect("Expected remote error");
    assert_eq!(remote.class, NAME_ERROR);
    assert_eq!(remote.message(), Some("No such command"));

    // The session survives handler-level failures
    assert_eq!(call(&session, "inc", Args::new().arg(1)).await.unwrap(), json!(2));
    session.close().await;
}

#[tokio::test]
async fn test_bad_argument_is_type_error() {
    let addr = start_server(ServerOptions::default()).await;
    let session = connect_client(&addr, ConnectOptions::default()).await;

    let err = call(&session, "inc", Args::new().arg("five")).await.unwrap_err();
    assert!(err.as_remote().is_some_and(|e| e.is(TYPE_ERROR)));

    let err = call(&session, "inc", Args::new()).await.unwrap_err();
    assert!(err.as_remote().is_some_and(|e| e.is(TYPE_ERROR)));

    session.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_panics_become_remote_errors() {
    let addr = start_server(ServerOptions::default()).await;
    let session = connect_client(&addr, ConnectOptions::default()).await;

    let err = call(&session, "boom", Args::new()).await.unwrap_err();
    let remote = err.as_remote().expect("Expected remote error");
    assert_eq!(remote.class, PANIC_ERROR);
    assert!(remote.message().unwrap().contains("sensor unplugged"));

    let err = call(&session, "async_boom", Args::new()).await.unwrap_err();
    assert!(err.as_remote().is_some_and(|e| e.is(PANIC_ERROR)));

    let err = call(&session, "eager", Args::new().arg("x")).await.unwrap_err();
    assert!(err.as_remote().is_some_and(|e| e.is(PANIC_ERROR)));
    assert_eq!(call(&session, "eager", Args::new().arg(7)).await.unwrap(), json!(7));

    assert!(!session.is_closed());
    assert_eq!(call(&session, "inc", Args::new().arg(2)).await.unwrap(), json!(3));
    session.close().await;
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_wrong_password_closes_silently() {
    let addr = start_server(ServerOptions::default().password("rrr")).await;
    let session = connect_client(&addr, ConnectOptions::default().password("wrong")).await;

    let result = call(&session, "inc", Args::new().arg(5)).await;
    assert!(result.unwrap_err().is_disconnect());
    timeout(TEST_TIMEOUT, session.closed())
        .await
        .expect("Client session should close");
    assert!(session.is_closed());

    // Later calls fail immediately
    let late = session.call("inc", Args::new().arg(5)).await;
    assert!(matches!(late, Err(RpcError::SessionClosed)));
}

#[tokio::test]
async fn test_wrong_password_sends_nothing() {
    let addr = start_server(ServerOptions::default().password("rrr")).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"{\"act\":\"login\",\"password\":\"nope\"}\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let read = timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
        .await
        .expect("Server should drop the connection");
    // EOF or reset, but never a reply
    if read.is_ok() {
        assert!(received.is_empty(), "Unexpected reply: {:?}", received);
    }
}

#[tokio::test]
async fn test_malformed_first_frame_is_rejected() {
    let first_frames: [&[u8]; 4] = [
        b"{\"act\":\"login\"}\r\n",
        b"{\"act\":\"login\",\"password\":123}\r\n",
        b"{\"act\":\"cmd\",\"name\":\"inc\",\"args\":[1]}\r\n",
        b"{\"password\":\"rrr\"}\r\n",
    ];

    for first in first_frames {
        let (client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let options = ServerOptions::default().password("rrr");
            serve_stream(server_io, Arc::new(server_registry()), &options).await;
        });

        // A valid login and call follow, but the first frame already decided
        let mut bytes = first.to_vec();
        bytes.extend_from_slice(
            b"{\"act\":\"login\",\"password\":\"rrr\"}\r\n\
              {\"act\":\"cmd\",\"rid\":1,\"name\":\"inc\",\"args\":[1]}\r\n",
        );
        let (mut client_read, mut client_write) = split(client_io);
        client_write.write_all(&bytes).await.unwrap();

        timeout(TEST_TIMEOUT, server)
            .await
            .expect("Server should drop the connection")
            .unwrap();
        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, client_read.read_to_end(&mut received))
            .await
            .expect("Test timed out")
            .unwrap();
        assert!(
            received.is_empty(),
            "Reply after {:?}: {:?}",
            String::from_utf8_lossy(first),
            String::from_utf8_lossy(&received)
        );
    }
}

// =============================================================================
// Heartbeat and framing
// =============================================================================

#[tokio::test]
async fn test_heartbeat_keeps_idle_session_open() {
    let (client_io, server_io) = duplex(64 * 1024);
    let options = ConnectOptions::default().heartbeat(Some(Duration::from_millis(100)));
    let session = connect_stream(client_io, options).await.unwrap();

    let (server_read, _server_write) = split(server_io);
    let mut frames = FrameReader::new(server_read);
    let mut heartbeats = 0;
    let deadline = Instant::now() + Duration::from_millis(550);
    while let Ok(Ok(message)) =
        tokio::time::timeout_at(deadline.into(), frames.next_message()).await
    {
        assert_eq!(message, Message::Heartbeat);
        heartbeats += 1;
    }

    assert!(heartbeats >= 4, "Only {} heartbeats", heartbeats);
    assert!(!session.is_closed());
    session.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_never_interleave() {
    // Small buffer forces partial writes on every frame
    let (client_io, server_io) = duplex(1024);
    let options = ConnectOptions::default().heartbeat(Some(Duration::from_millis(1)));
    let session = connect_stream(client_io, options).await.unwrap();

    let big = "x".repeat(64 * 1024);
    let callers: Vec<_> = (0..2)
        .map(|i| {
            let session = session.clone();
            let payload = format!("{}{}", i, big);
            tokio::spawn(async move { session.call("store", Args::new().arg(payload)).await })
        })
        .collect();

    let (server_read, mut server_write) = split(server_io);
    let mut lines = BufReader::new(server_read);
    let mut calls = Vec::new();
    let mut heartbeats = 0;
    while calls.len() < 2 {
        let mut line = String::new();
        let read = timeout(TEST_TIMEOUT, lines.read_line(&mut line))
            .await
            .expect("Test timed out")
            .unwrap();
        assert!(read > 0, "Stream ended early");
        assert!(line.ends_with("\r\n"));
        match codec::decode(line.as_bytes()) {
            Some(Message::Call { rid, args, .. }) => {
                assert_eq!(args[0].as_str().map(str::len), Some(big.len() + 1));
                calls.push(rid);
            }
            Some(Message::Heartbeat) => heartbeats += 1,
            other => panic!("Interleaved or unexpected frame: {:?}", other),
        }
    }

    for rid in &calls {
        codec::write_message(&mut server_write, &Message::Response { rid: *rid, res: json!(true) })
            .await
            .unwrap();
    }
    for caller in callers {
        let result = timeout(TEST_TIMEOUT, caller).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), json!(true));
    }
    assert_ne!(calls[0], calls[1]);
    // Heartbeats may or may not land between the two calls
    eprintln!("Observed {} heartbeat(s) between large frames", heartbeats);
    session.close().await;
}

#[tokio::test]
async fn test_noise_and_stray_responses_are_ignored() {
    let (client_io, server_io) = duplex(64 * 1024);
    let mut registry = Registry::new();
    registry.register_sync("inc", |args| Ok(args.get::<i64>(0)? + 1));

    let server = tokio::spawn(async move {
        serve_stream(server_io, Arc::new(registry), &ServerOptions::default().heartbeat(None)).await;
    });

    // Drive the client side by hand
    let (client_read, mut client_write) = split(client_io);
    client_write
        .write_all(
            b"MicroPython v1.20 boot\r\n\
              [1,2,3]\r\n\
              {\"act\":\"res\",\"rid\":999,\"res\":1}\r\n\
              {\"act\":\"hb\"}\r\n\
              {\"act\":\"bogus\"}\r\n\
              {\"act\":\"cmd\",\"rid\":7,\"name\":\"inc\",\"args\":[41]}\r\n",
        )
        .await
        .unwrap();

    let mut frames = FrameReader::new(client_read);
    let reply = timeout(TEST_TIMEOUT, frames.next_message())
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(reply, Message::Response { rid: 7, res: json!(42) });

    drop(client_write);
    drop(frames);
    timeout(TEST_TIMEOUT, server)
        .await
        .expect("Server should finish on EOF")
        .unwrap();
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_close_fails_pending_calls() {
    let (client_io, server_io) = duplex(64 * 1024);
    let session = connect_stream(client_io, ConnectOptions::default().heartbeat(None))
        .await
        .unwrap();
    // Peer that never answers
    let _peer = server_io;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call("slow", Args::new()).await })
    };
    sleep(Duration::from_millis(20)).await;

    session.close().await;
    let result = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(RpcError::SessionClosed)));
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_server_exit_fails_client_calls() {
    let (client_io, server_io) = duplex(64 * 1024);
    let session = connect_stream(client_io, ConnectOptions::default().heartbeat(None))
        .await
        .unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call("slow", Args::new()).await })
    };
    sleep(Duration::from_millis(20)).await;
    drop(server_io);

    let result = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    timeout(TEST_TIMEOUT, session.closed())
        .await
        .expect("Session should close on EOF");
}

#[tokio::test]
async fn test_connect_failure() {
    let err = connect("127.0.0.1:1", ConnectOptions::default()).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectionFailed { .. }));
    assert!(err.to_string().contains("127.0.0.1:1"));
}
