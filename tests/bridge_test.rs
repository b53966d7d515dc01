//! Integration tests for the bridge lifecycle.
//!
//! Starts an in-process bridge on a random port with a fake worker channel
//! and calls it with a [`BridgeClient`], validating routing, dispatch keys,
//! shutdown and failure propagation end to end.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bifrost::client::BridgeClient;
use bifrost::codec::RawCodec;
use bifrost::server::control::STATUS_PATH;
use bifrost::server::control::proto::StatusRequest;
use bifrost::events::{Event, EventKind, EventSink};
use bifrost::server::config::{Config, TlsConfig, WorkerConfig};
use bifrost::{
    BifrostError, Bridge, BridgeState, MethodDescriptor, MethodKey, ProtocolRegistry, RawMessage,
    Result, ServiceDescriptor, StaticEnvironment, WorkerChannel, WorkerRequest,
};

// ============================================================================
// Fake worker channel
// ============================================================================

/// Replies by method name:
/// - `Hello`: "pong"
/// - `Echo`: the request payload
/// - `Fail`: a worker error with code INVALID_ARGUMENT
/// - `Hang`: waits until the pool fails
/// - anything else: the method key
///
/// `on_start` events are raised from inside `start`, the way a pool
/// reports its workers.
#[derive(Default)]
struct FakeChannel {
    calls: Mutex<Vec<(String, Bytes)>>,
    sink: Mutex<Option<EventSink>>,
    on_start: Mutex<Vec<Event>>,
    started: AtomicBool,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    failed: CancellationToken,
}

impl FakeChannel {
    fn keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Fail the way a pool does: release pending calls, then report.
    fn fail(&self, reason: &str) {
        self.failed.cancel();
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(Event::PoolFailed {
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl WorkerChannel for FakeChannel {
    fn listen(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            for event in self.on_start.lock().unwrap().drain(..) {
                sink(event);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, method: &MethodKey, request: WorkerRequest) -> Result<Bytes> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), request.payload.clone()));

        match method.method() {
            "Hello" => Ok(Bytes::from_static(b"pong")),
            "Echo" => Ok(request.payload),
            "Fail" => Err(BifrostError::Worker {
                code: tonic::Code::InvalidArgument as i32,
                message: "bad request".to_string(),
            }),
            "Hang" => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.failed.cancelled().await;
                Err(BifrostError::PoolFailed("pool died".to_string()))
            }
            _ => Ok(Bytes::from(method.to_string())),
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

const GREETER: &str = r#"
syntax = "proto3";
package pkg;

service Greeter {
  rpc Hello (HelloRequest) returns (HelloReply);
  rpc Echo (HelloRequest) returns (HelloReply);
  rpc Fail (HelloRequest) returns (HelloReply);
  rpc Hang (HelloRequest) returns (HelloReply);
}

message HelloRequest { string name = 1; }
message HelloReply { string message = 1; }
"#;

fn write_proto(dir: &TempDir, source: &str) -> PathBuf {
    let path = dir.path().join("service.proto");
    std::fs::write(&path, source).unwrap();
    path
}

/// Find an address nothing listens on.
fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn config(proto: &Path, listen: &str) -> Config {
    let mut config = Config::parse(
        r#"
        [server]
        proto = "placeholder.proto"

        [workers]
        command = ["unused"]
        num_workers = 1
        "#,
    )
    .unwrap();
    config.server.listen = listen.to_string();
    config.server.proto = proto.to_path_buf();
    config
}

fn bridge_with(config: Config, channel: &Arc<FakeChannel>) -> Bridge {
    let bridge = Bridge::new(config);
    let channel = Arc::clone(channel);
    bridge
        .set_channel_factory(move |_: &WorkerConfig| -> Result<Arc<dyn WorkerChannel>> {
            Ok(Arc::clone(&channel) as Arc<dyn WorkerChannel>)
        })
        .unwrap();
    bridge
}

fn record_events(bridge: &Bridge) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bridge
        .add_listener(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.clone())
        }))
        .unwrap();
    events
}

fn kinds(events: &Mutex<Vec<Event>>) -> Vec<EventKind> {
    events.lock().unwrap().iter().map(Event::kind).collect()
}

/// Serve in the background and wait until the accept loop runs.
async fn start(bridge: &Bridge) -> (String, JoinHandle<Result<()>>) {
    let server = bridge.clone();
    let handle = tokio::spawn(async move { server.serve().await });

    for _ in 0..500 {
        if let Some(addr) = bridge.local_addr() {
            return (format!("http://{addr}"), handle);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bridge did not start serving: {:?}", bridge.state());
}

async fn finish(handle: JoinHandle<Result<()>>) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("bridge did not stop")
        .expect("serve task panicked")
}

fn rpc_code(err: &BifrostError) -> tonic::Code {
    match err {
        BifrostError::Rpc { code, .. } => *code,
        other => panic!("expected an rpc error, got {other:?}"),
    }
}

// ============================================================================
// Serving
// ============================================================================

#[tokio::test]
async fn greeter_hello_round_trip() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let events = record_events(&bridge);

    let (addr, handle) = start(&bridge).await;
    assert_eq!(bridge.state(), BridgeState::Serving);
    assert!(channel.started.load(Ordering::SeqCst));

    let client = BridgeClient::connect(addr).await.unwrap();
    let reply = client
        .call(&MethodKey::new("pkg.Greeter", "Hello"), "ping")
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"pong"));

    let calls = channel.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![("pkg.Greeter/Hello".to_string(), Bytes::from_static(b"ping"))]
    );

    drop(client);
    assert!(bridge.stop());
    finish(handle).await.unwrap();

    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert_eq!(bridge.local_addr(), None);
    assert!(channel.stopped.load(Ordering::SeqCst));
    assert_eq!(
        kinds(&events),
        [EventKind::Serving, EventKind::Stopping, EventKind::Stopped]
    );
}

#[tokio::test]
async fn payload_bytes_pass_through_untouched() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (addr, handle) = start(&bridge).await;

    // not valid protobuf for HelloRequest; the bridge must not care
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let client = BridgeClient::connect(addr).await.unwrap();
    let reply = client
        .call(&MethodKey::new("pkg.Greeter", "Echo"), payload.clone())
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), payload.as_slice());

    drop(client);
    bridge.stop();
    finish(handle).await.unwrap();
}

#[tokio::test]
async fn every_declared_method_is_routed() {
    let source = r#"
        syntax = "proto3";
        package shop.v1;

        service Catalog {
          rpc List (Empty) returns (Empty);
          rpc Get (Empty) returns (Empty);
        }

        service Cart {
          rpc Add (Empty) returns (Empty);
          rpc Remove (Empty) returns (Empty);
          rpc Checkout (Empty) returns (Empty);
        }

        message Empty {}
    "#;
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, source);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (addr, handle) = start(&bridge).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    let expected = [
        ("shop.v1.Catalog", "List"),
        ("shop.v1.Catalog", "Get"),
        ("shop.v1.Cart", "Add"),
        ("shop.v1.Cart", "Remove"),
        ("shop.v1.Cart", "Checkout"),
    ];
    for (service, method) in expected {
        let key = MethodKey::new(service, method);
        let reply = client.call(&key, Bytes::new()).await.unwrap();
        assert_eq!(reply, Bytes::from(key.to_string()));
    }

    let keys: Vec<String> = expected
        .iter()
        .map(|(service, method)| format!("{service}/{method}"))
        .collect();
    assert_eq!(channel.keys(), keys);

    drop(client);
    bridge.stop();
    finish(handle).await.unwrap();
}

#[tokio::test]
async fn undeclared_method_is_unimplemented() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (addr, handle) = start(&bridge).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    let err = client
        .call(&MethodKey::new("pkg.Greeter", "Goodbye"), "ping")
        .await
        .unwrap_err();
    assert_eq!(rpc_code(&err), tonic::Code::Unimplemented);
    assert!(channel.keys().is_empty());

    drop(client);
    bridge.stop();
    finish(handle).await.unwrap();
}

const FEED: &str = r#"
syntax = "proto3";
package pkg;

message Chunk { bytes data = 1; }

service Feed {
  rpc Watch (Chunk) returns (stream Chunk);
  rpc Echo (stream Chunk) returns (Chunk);
  rpc Chat (stream Chunk) returns (stream Chunk);
}
"#;

async fn raw_client(addr: &str) -> tonic::client::Grpc<tonic::transport::Channel> {
    let channel = tonic::transport::Endpoint::from_shared(addr.to_string())
        .unwrap()
        .connect()
        .await
        .unwrap();
    tonic::client::Grpc::new(channel)
}

fn feed_path(method: &str) -> http::uri::PathAndQuery {
    http::uri::PathAndQuery::try_from(MethodKey::new("pkg.Feed", method).path()).unwrap()
}

fn chunk(bytes: &'static [u8]) -> RawMessage {
    RawMessage::from(bytes)
}

#[tokio::test]
async fn streaming_methods_forward_one_exchange() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, FEED);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (addr, handle) = start(&bridge).await;
    let mut grpc = raw_client(&addr).await;

    // server streaming: one reply message, then the stream ends
    grpc.ready().await.unwrap();
    let mut replies = grpc
        .server_streaming(
            tonic::Request::new(chunk(b"tick")),
            feed_path("Watch"),
            RawCodec::<RawMessage, RawMessage>::default(),
        )
        .await
        .unwrap()
        .into_inner();
    let reply = replies.message().await.unwrap().unwrap();
    assert_eq!(reply.into_bytes(), Bytes::from_static(b"pkg.Feed/Watch"));
    assert!(replies.message().await.unwrap().is_none());

    // client streaming: only the first request message reaches the worker
    grpc.ready().await.unwrap();
    let reply = grpc
        .client_streaming(
            tonic::Request::new(tokio_stream::iter(vec![chunk(b"first"), chunk(b"second")])),
            feed_path("Echo"),
            RawCodec::<RawMessage, RawMessage>::default(),
        )
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.into_bytes(), Bytes::from_static(b"first"));

    // bidirectional
    grpc.ready().await.unwrap();
    let mut replies = grpc
        .streaming(
            tonic::Request::new(tokio_stream::iter(vec![chunk(b"hi")])),
            feed_path("Chat"),
            RawCodec::<RawMessage, RawMessage>::default(),
        )
        .await
        .unwrap()
        .into_inner();
    let reply = replies.message().await.unwrap().unwrap();
    assert_eq!(reply.into_bytes(), Bytes::from_static(b"pkg.Feed/Chat"));
    assert!(replies.message().await.unwrap().is_none());

    let calls = channel.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            ("pkg.Feed/Watch".to_string(), Bytes::from_static(b"tick")),
            ("pkg.Feed/Echo".to_string(), Bytes::from_static(b"first")),
            ("pkg.Feed/Chat".to_string(), Bytes::from_static(b"hi")),
        ]
    );

    drop(grpc);
    bridge.stop();
    finish(handle).await.unwrap();
}

#[tokio::test]
async fn empty_request_stream_is_invalid_argument() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, FEED);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (addr, handle) = start(&bridge).await;
    let mut grpc = raw_client(&addr).await;

    grpc.ready().await.unwrap();
    let status = grpc
        .client_streaming(
            tonic::Request::new(tokio_stream::empty::<RawMessage>()),
            feed_path("Echo"),
            RawCodec::<RawMessage, RawMessage>::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(channel.keys().is_empty());

    drop(grpc);
    bridge.stop();
    finish(handle).await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_fail_independently() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let events = record_events(&bridge);
    let (addr, handle) = start(&bridge).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    let mut calls = Vec::new();
    for i in 0..10 {
        let client = client.clone();
        let method = if i == 3 { "Fail" } else { "Echo" };
        calls.push(tokio::spawn(async move {
            client
                .call(&MethodKey::new("pkg.Greeter", method), format!("call-{i}"))
                .await
        }));
    }

    for (i, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap();
        if i == 3 {
            let err = result.unwrap_err();
            assert_eq!(rpc_code(&err), tonic::Code::InvalidArgument);
        } else {
            assert_eq!(result.unwrap(), Bytes::from(format!("call-{i}")));
        }
    }
    assert_eq!(bridge.state(), BridgeState::Serving);
    assert!(kinds(&events).contains(&EventKind::CallFailed));

    drop(client);
    bridge.stop();
    finish(handle).await.unwrap();
}

// ============================================================================
// Stopping
// ============================================================================

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let events = record_events(&bridge);

    // before serving: nothing to stop
    assert!(!bridge.stop());

    let (_addr, handle) = start(&bridge).await;
    assert!(bridge.stop());
    assert!(!bridge.stop());
    assert!(!bridge.stop_handle().stop());
    finish(handle).await.unwrap();

    assert!(!bridge.stop());
    assert_eq!(bridge.state(), BridgeState::Stopped);

    let stopping = kinds(&events)
        .into_iter()
        .filter(|kind| *kind == EventKind::Stopping)
        .count();
    assert_eq!(stopping, 1);

    // a stopped bridge does not serve again
    let err = bridge.serve().await.unwrap_err();
    assert!(matches!(err, BifrostError::InvalidState(_)));
}

#[tokio::test]
async fn configuration_is_locked_while_serving() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (_addr, handle) = start(&bridge).await;

    let err = bridge.add_listener(Arc::new(|_: &Event| {})).unwrap_err();
    assert!(matches!(err, BifrostError::InvalidState(_)));
    let err = bridge.add_option(Arc::new(|server: tonic::transport::Server| server)).unwrap_err();
    assert!(matches!(err, BifrostError::InvalidState(_)));
    let err = bridge.serve().await.unwrap_err();
    assert!(matches!(err, BifrostError::InvalidState(_)));

    bridge.stop();
    finish(handle).await.unwrap();
}

#[tokio::test]
async fn pool_failure_fails_in_flight_calls_and_stops() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let events = record_events(&bridge);
    let (addr, handle) = start(&bridge).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    let mut calls = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .call(&MethodKey::new("pkg.Greeter", "Hang"), Bytes::new())
                .await
        }));
    }

    for _ in 0..500 {
        if channel.in_flight.load(Ordering::SeqCst) == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(channel.in_flight.load(Ordering::SeqCst), 3);

    channel.fail("all workers crashed");

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(rpc_code(&err), tonic::Code::Unavailable);
    }
    drop(client);

    let err = finish(handle).await.unwrap_err();
    assert!(matches!(err, BifrostError::PoolFailed(ref reason) if reason == "all workers crashed"));
    assert_eq!(bridge.state(), BridgeState::Stopped);

    let kinds = kinds(&events);
    let position = |kind| kinds.iter().position(|k| *k == kind).unwrap();
    assert!(position(EventKind::PoolFailed) < position(EventKind::Stopping));
    assert!(position(EventKind::Stopping) < position(EventKind::Stopped));
}

#[tokio::test]
async fn listeners_can_query_the_bridge_during_startup() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    *channel.on_start.lock().unwrap() = vec![
        Event::WorkerSpawned {
            worker: 0,
            pid: None,
        },
        Event::PoolStarted { workers: 1 },
    ];
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer = bridge.stop_handle();
    bridge
        .add_listener(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push((event.kind(), observer.state()));
        }))
        .unwrap();

    let (_addr, handle) = start(&bridge).await;
    bridge.stop();
    finish(handle).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        &seen[..3],
        [
            (EventKind::WorkerSpawned, Some(BridgeState::Serving)),
            (EventKind::PoolStarted, Some(BridgeState::Serving)),
            (EventKind::Serving, Some(BridgeState::Serving)),
        ]
    );
}

#[tokio::test]
async fn pool_failure_during_startup_stops_the_bridge() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    *channel.on_start.lock().unwrap() = vec![Event::PoolFailed {
        reason: "no workers".to_string(),
    }];
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let events = record_events(&bridge);

    let server = bridge.clone();
    let handle = tokio::spawn(async move { server.serve().await });
    let err = finish(handle).await.unwrap_err();

    assert!(matches!(err, BifrostError::PoolFailed(ref reason) if reason == "no workers"));
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(channel.stopped.load(Ordering::SeqCst));
    assert_eq!(
        kinds(&events),
        [EventKind::PoolFailed, EventKind::Stopping, EventKind::Stopped]
    );
}

#[tokio::test]
async fn control_plane_stop() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (addr, handle) = start(&bridge).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.state, "serving");
    assert_eq!(status.version, bifrost::version_string());

    assert!(client.stop().await.unwrap());
    drop(client);

    finish(handle).await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Stopped);
}

#[tokio::test]
async fn control_plane_decode_errors_match_prost_codec() {
    use prost::Message;

    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);
    let (addr, handle) = start(&bridge).await;

    // field 1, length 5, but only one byte follows
    let garbage: &'static [u8] = &[0x0a, 0x05, b'x'];
    let expected = StatusRequest::decode(garbage).unwrap_err().to_string();

    let mut grpc = raw_client(&addr).await;
    grpc.ready().await.unwrap();
    let status = grpc
        .unary(
            tonic::Request::new(RawMessage::from(garbage)),
            http::uri::PathAndQuery::from_static(STATUS_PATH),
            RawCodec::<RawMessage, RawMessage>::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Internal);
    assert_eq!(status.message(), expected);

    drop(grpc);
    bridge.stop();
    finish(handle).await.unwrap();
}

#[tokio::test]
async fn control_plane_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let mut config = config(&proto, "127.0.0.1:0");
    config.control.enabled = false;
    let bridge = bridge_with(config, &channel);
    let (addr, handle) = start(&bridge).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    let err = client.stop().await.unwrap_err();
    assert_eq!(rpc_code(&err), tonic::Code::Unimplemented);
    assert_eq!(bridge.state(), BridgeState::Serving);

    drop(client);
    bridge.stop();
    finish(handle).await.unwrap();
}

// ============================================================================
// Startup failures
// ============================================================================

/// Serve must fail, leave the bridge reusable and the port free.
async fn assert_startup_fails(bridge: &Bridge, addr: &str) -> BifrostError {
    let err = bridge.serve().await.unwrap_err();
    assert_eq!(bridge.state(), BridgeState::Initialized);
    assert_eq!(bridge.local_addr(), None);
    TcpListener::bind(addr).expect("listener left open after failed startup");
    err
}

/// Serves a fixed descriptor list regardless of the path.
struct FixedRegistry(Vec<ServiceDescriptor>);

impl ProtocolRegistry for FixedRegistry {
    fn services(&self, _path: &Path) -> Result<Vec<ServiceDescriptor>> {
        Ok(self.0.clone())
    }
}

fn unary(name: &str) -> MethodDescriptor {
    MethodDescriptor {
        name: name.to_string(),
        client_streaming: false,
        server_streaming: false,
    }
}

#[tokio::test]
async fn duplicate_service_is_startup_error() {
    let greeter = |method: &str| ServiceDescriptor {
        package: "pkg".to_string(),
        name: "Greeter".to_string(),
        methods: vec![unary(method)],
    };
    let channel = Arc::new(FakeChannel::default());
    let addr = free_addr();
    let bridge = bridge_with(config(Path::new("unused.proto"), &addr), &channel);
    bridge
        .set_registry(FixedRegistry(vec![greeter("Hello"), greeter("Bye")]))
        .unwrap();

    let err = assert_startup_fails(&bridge, &addr).await;
    assert!(matches!(err, BifrostError::DuplicateService(ref name) if name == "pkg.Greeter"));
    assert!(!channel.started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn invalid_protocol_file_is_startup_error() {
    let source = r#"
        syntax = "proto3";
        package pkg;
        service Greeter { rpc Hello (Missing) returns (Missing); }
    "#;
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, source);
    let channel = Arc::new(FakeChannel::default());
    let addr = free_addr();
    let bridge = bridge_with(config(&proto, &addr), &channel);

    let err = assert_startup_fails(&bridge, &addr).await;
    assert!(matches!(err, BifrostError::Protocol { .. }), "{err}");
    assert!(!channel.started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn descriptor_colliding_with_external_service_is_startup_error() {
    let source = r#"
        syntax = "proto3";
        package bifrost.control.v1;
        message Empty {}
        service Control { rpc Stop (Empty) returns (Empty); }
    "#;
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, source);
    let channel = Arc::new(FakeChannel::default());
    let addr = free_addr();
    let bridge = bridge_with(config(&proto, &addr), &channel);

    let err = assert_startup_fails(&bridge, &addr).await;
    assert!(
        matches!(err, BifrostError::DuplicateService(ref name) if name == "bifrost.control.v1.Control")
    );
}

#[tokio::test]
async fn missing_tls_certificate_leaves_nothing_listening() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let channel = Arc::new(FakeChannel::default());
    let addr = free_addr();
    let mut config = config(&proto, &addr);
    config.server.tls = Some(TlsConfig {
        cert: dir.path().join("missing.crt"),
        key: dir.path().join("missing.key"),
        client_ca: None,
    });
    let bridge = bridge_with(config, &channel);

    let err = assert_startup_fails(&bridge, &addr).await;
    assert!(matches!(err, BifrostError::Tls(_)));
    assert!(!channel.started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn failed_startup_can_be_retried() {
    let dir = TempDir::new().unwrap();
    let proto = dir.path().join("later.proto");
    let channel = Arc::new(FakeChannel::default());
    let bridge = bridge_with(config(&proto, "127.0.0.1:0"), &channel);

    let err = bridge.serve().await.unwrap_err();
    assert!(matches!(err, BifrostError::Protocol { .. }));

    std::fs::write(&proto, GREETER).unwrap();
    let (_addr, handle) = start(&bridge).await;
    bridge.stop();
    finish(handle).await.unwrap();
}

// ============================================================================
// Worker environment
// ============================================================================

#[tokio::test]
async fn worker_environment_is_merged_with_marker_last() {
    let dir = TempDir::new().unwrap();
    let proto = write_proto(&dir, GREETER);
    let mut config = config(&proto, "127.0.0.1:0");
    config.workers.set_env("FROM_WORKER", "1");
    config.workers.set_env("APP_ENV", "dev");
    config.workers.set_env("BIFROST_GRPC", "false");

    let bridge = Bridge::new(config);
    bridge
        .set_environment(StaticEnvironment::new(
            [("APP_ENV".to_string(), "prod".to_string())].into(),
        ))
        .unwrap();

    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let channel = Arc::new(FakeChannel::default());
    bridge
        .set_channel_factory(move |workers: &WorkerConfig| -> Result<Arc<dyn WorkerChannel>> {
            *slot.lock().unwrap() = Some(workers.env.clone());
            Ok(Arc::clone(&channel) as Arc<dyn WorkerChannel>)
        })
        .unwrap();

    let (_addr, handle) = start(&bridge).await;
    bridge.stop();
    finish(handle).await.unwrap();

    let env = seen.lock().unwrap().clone().unwrap();
    assert_eq!(env["FROM_WORKER"], "1");
    assert_eq!(env["APP_ENV"], "prod");
    assert_eq!(env["BIFROST_GRPC"], "true");
}
