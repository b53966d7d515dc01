//! Proxy services built at runtime from service descriptors.
//!
//! A [`ProxyService`] is a method table for one protobuf service: every
//! registered method maps to the same forwarding function, which hands the
//! still-encoded request to the [`WorkerChannel`] under the method's
//! [`MethodKey`] and returns the worker's reply bytes as the response.
//!
//! [`ProxyServer`] adapts the table to tonic: it routes
//! `/package.Service/Method` requests like generated server code does,
//! but with [`RawCodec`] so messages are never decoded on the bridge.
//!
//! Methods declared as streaming are forwarded as one exchange: the first
//! request message goes to the worker and its reply is the only response
//! message. Later request messages are not read.
//!
//! ```text
//! client ── /pkg.Greeter/Hello ──► ProxyServer ──► ProxyService::forward
//!                                                     │ dispatch("pkg.Greeter/Hello", bytes)
//!                                                     ▼
//!                                                WorkerChannel ──► worker
//! ```

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tonic::codegen::{Body, BoxFuture, StdError};
use tonic::server::{Grpc, StreamingService, UnaryService};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::codec::{RawCodec, RawMessage};
use crate::events::{Event, EventSink};
use crate::worker::{WorkerChannel, WorkerRequest};
use crate::{BifrostError, Result, telemetry};

/// Routing key of a forwardable method: `package.Service/Method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    key: Arc<str>,
    split: usize,
}

impl MethodKey {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            key: format!("{service}/{method}").into(),
            split: service.len(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Fully qualified service name.
    pub fn service(&self) -> &str {
        &self.key[..self.split]
    }

    pub fn method(&self) -> &str {
        &self.key[self.split + 1..]
    }

    /// HTTP/2 path clients call: `/package.Service/Method`.
    pub fn path(&self) -> String {
        format!("/{}", self.key)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Per-call limits applied to every proxied method.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxySettings {
    /// Upper bound on the wait for a worker reply.
    pub request_timeout: Option<Duration>,
    pub max_decoding_message_size: Option<usize>,
    pub max_encoding_message_size: Option<usize>,
}

/// How the transport carries a method's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    /// Any of client, server or bidirectional streaming.
    Streaming,
}

#[derive(Debug)]
struct ProxyMethod {
    key: MethodKey,
    shape: CallShape,
}

/// Method table of one proxied service.
pub struct ProxyService {
    qualified_name: String,
    methods: HashMap<String, ProxyMethod>,
    channel: Arc<dyn WorkerChannel>,
    settings: ProxySettings,
    events: Option<EventSink>,
}

impl ProxyService {
    pub fn new(qualified_name: impl Into<String>, channel: Arc<dyn WorkerChannel>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            methods: HashMap::new(),
            channel,
            settings: ProxySettings::default(),
            events: None,
        }
    }

    pub fn with_settings(mut self, settings: ProxySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Report failed calls as [`Event::CallFailed`].
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Add one forwarded unary method. Each name may be registered once.
    pub fn register_method(&mut self, name: &str) -> Result<&MethodKey> {
        self.register(name, CallShape::Unary)
    }

    /// Add one forwarded method of the given shape.
    pub fn register(&mut self, name: &str, shape: CallShape) -> Result<&MethodKey> {
        if self.methods.contains_key(name) {
            return Err(BifrostError::DuplicateMethod(format!(
                "{}/{name}",
                self.qualified_name
            )));
        }
        let key = MethodKey::new(&self.qualified_name, name);
        let method = self
            .methods
            .entry(name.to_string())
            .or_insert(ProxyMethod { key, shape });
        Ok(&method.key)
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Registered method keys, sorted.
    pub fn method_keys(&self) -> Vec<MethodKey> {
        let mut keys: Vec<_> = self.methods.values().map(|m| m.key.clone()).collect();
        keys.sort();
        keys
    }

    pub fn method_key(&self, method: &str) -> Option<&MethodKey> {
        self.methods.get(method).map(|m| &m.key)
    }

    pub fn shape(&self, method: &str) -> Option<CallShape> {
        self.methods.get(method).map(|m| m.shape)
    }

    /// Forward one call to the worker channel.
    ///
    /// Dropping the returned future abandons the wait; whatever the worker
    /// does with the already dispatched request is the channel's concern.
    pub async fn forward(
        &self,
        method: &str,
        request: Request<RawMessage>,
    ) -> std::result::Result<Response<RawMessage>, Status> {
        let key = self.methods.get(method).map(|m| &m.key).ok_or_else(|| {
            Status::unimplemented(format!(
                "method {method} not found in service {}",
                self.qualified_name
            ))
        })?;

        let worker_request = WorkerRequest {
            metadata: forwarded_metadata(request.metadata()),
            payload: request.into_inner().into_bytes(),
        };

        let start = Instant::now();
        let dispatch = self.channel.dispatch(key, worker_request);
        let result = match self.settings.request_timeout {
            Some(limit) => tokio::time::timeout(limit, dispatch)
                .await
                .unwrap_or_else(|_| Err(BifrostError::Timeout(limit))),
            None => dispatch.await,
        };
        record_call(key, start, result.is_ok());

        match result {
            Ok(reply) => Ok(Response::new(RawMessage::from(reply))),
            Err(e) => {
                debug!(method = %key, error = %e, "dispatch failed");
                if let Some(events) = &self.events {
                    events(Event::CallFailed {
                        method: key.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    }

    /// Share the table with the transport.
    pub fn into_server(self) -> ProxyServer {
        ProxyServer {
            inner: Arc::new(self),
        }
    }
}

impl fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyService")
            .field("qualified_name", &self.qualified_name)
            .field("methods", &self.method_keys())
            .field("settings", &self.settings)
            .finish()
    }
}

fn record_call(key: &MethodKey, start: Instant, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(telemetry::REQUESTS_TOTAL,
        "method" => key.to_string(),
        "status" => status,
    )
    .increment(1);
    metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
        "method" => key.to_string(),
    )
    .record(start.elapsed().as_secs_f64());
}

/// Request headers handled by the transport, not meant for workers.
const TRANSPORT_HEADERS: &[&str] = &[
    "content-type",
    "te",
    "user-agent",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
];

/// ASCII metadata entries the worker gets to see.
fn forwarded_metadata(metadata: &tonic::metadata::MetadataMap) -> BTreeMap<String, String> {
    metadata
        .iter()
        .filter_map(|entry| match entry {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => Some((key, value)),
            tonic::metadata::KeyAndValueRef::Binary(..) => None,
        })
        .filter(|(key, _)| !TRANSPORT_HEADERS.contains(&key.as_str()))
        .filter_map(|(key, value)| {
            Some((key.as_str().to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

/// Tonic-facing handle of a [`ProxyService`].
#[derive(Debug, Clone)]
pub struct ProxyServer {
    inner: Arc<ProxyService>,
}

impl ProxyServer {
    pub fn service(&self) -> &ProxyService {
        &self.inner
    }

    /// Route pattern covering every method of the service.
    pub fn route(&self) -> String {
        format!("/{}/{{*method}}", self.inner.qualified_name)
    }
}

/// Trailers-only `UNIMPLEMENTED` reply, as generated servers send it.
pub(crate) fn unimplemented_response() -> http::Response<tonic::body::Body> {
    let mut response = http::Response::new(tonic::body::Body::default());
    let headers = response.headers_mut();
    headers.insert(
        Status::GRPC_STATUS,
        (tonic::Code::Unimplemented as i32).into(),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}

struct ForwardSvc {
    proxy: Arc<ProxyService>,
    method: String,
}

impl UnaryService<RawMessage> for ForwardSvc {
    type Response = RawMessage;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<RawMessage>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let method = self.method.clone();
        Box::pin(async move { proxy.forward(&method, request).await })
    }
}

struct ExchangeSvc {
    proxy: Arc<ProxyService>,
    method: String,
}

impl StreamingService<RawMessage> for ExchangeSvc {
    type Response = RawMessage;
    type ResponseStream = tokio_stream::Once<std::result::Result<RawMessage, Status>>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<RawMessage>>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let method = self.method.clone();
        Box::pin(async move {
            let (metadata, extensions, mut messages) = request.into_parts();
            let first = messages.message().await?.ok_or_else(|| {
                Status::invalid_argument("request stream closed before the first message")
            })?;
            let reply = proxy
                .forward(&method, Request::from_parts(metadata, extensions, first))
                .await?;
            Ok(reply.map(|message| tokio_stream::once(Ok(message))))
        })
    }
}

impl<B> tower::Service<http::Request<B>> for ProxyServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let method = req
            .uri()
            .path()
            .strip_prefix('/')
            .and_then(|path| path.strip_prefix(self.inner.qualified_name.as_str()))
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|method| Some((method.to_string(), self.inner.shape(method)?)));

        let Some((method, shape)) = method else {
            return Box::pin(async move { Ok(unimplemented_response()) });
        };

        let settings = self.inner.settings;
        let proxy = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut grpc = Grpc::new(RawCodec::<RawMessage, RawMessage>::default())
                .apply_max_message_size_config(
                    settings.max_decoding_message_size,
                    settings.max_encoding_message_size,
                );
            let response = match shape {
                CallShape::Unary => grpc.unary(ForwardSvc { proxy, method }, req).await,
                CallShape::Streaming => grpc.streaming(ExchangeSvc { proxy, method }, req).await,
            };
            Ok(response)
        })
    }
}
