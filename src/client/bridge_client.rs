//! [`BridgeClient`]: raw gRPC calls against a bridge.
//!
//! Messages travel as already-encoded bytes through [`RawCodec`], so the
//! client needs no generated types for the proxied services. The control
//! service uses the typed messages in [`control::proto`].

use std::time::Duration;

use bytes::Bytes;
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::transport::{Channel, Endpoint};

use crate::codec::{Payload, RawCodec, RawMessage, Typed};
use crate::proxy::MethodKey;
use crate::server::control::{self, proto};
use crate::{BifrostError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to a bridge.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    inner: Grpc<Channel>,
}

impl BridgeClient {
    /// Connect to a bridge at the given address.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let client = BridgeClient::connect("http://127.0.0.1:9001").await?;
    /// ```
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let channel = Endpoint::from_shared(addr.clone())
            .map_err(|e| BifrostError::Configuration(format!("invalid address {addr}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await
            .map_err(|e| BifrostError::Rpc {
                code: tonic::Code::Unavailable,
                message: format!("failed to connect to {addr}: {e}"),
            })?;
        Ok(Self {
            inner: Grpc::new(channel),
        })
    }

    /// Call a method with an encoded request message; returns the encoded
    /// reply.
    pub async fn call(&self, method: &MethodKey, payload: impl Into<Bytes>) -> Result<Bytes> {
        let reply: RawMessage = self
            .unary(&method.path(), RawMessage::new(payload.into()))
            .await?;
        Ok(reply.into_bytes())
    }

    /// Ask the bridge to drain and stop. True if this request started the
    /// drain.
    pub async fn stop(&self) -> Result<bool> {
        let reply: Typed<proto::StopResponse> = self
            .unary(control::STOP_PATH, Typed(proto::StopRequest {}))
            .await?;
        Ok(reply.into_inner().stopping)
    }

    pub async fn status(&self) -> Result<proto::StatusResponse> {
        let reply: Typed<proto::StatusResponse> = self
            .unary(control::STATUS_PATH, Typed(proto::StatusRequest {}))
            .await?;
        Ok(reply.into_inner())
    }

    async fn unary<Req, Resp>(&self, path: &str, request: Req) -> Result<Resp>
    where
        Req: Payload + Sync,
        Resp: Payload + Sync,
    {
        let path = PathAndQuery::try_from(path)
            .map_err(|e| BifrostError::Configuration(format!("invalid method path {path}: {e}")))?;

        let mut grpc = self.inner.clone();
        grpc.ready().await.map_err(|e| BifrostError::Rpc {
            code: tonic::Code::Unavailable,
            message: format!("service was not ready: {e}"),
        })?;

        let response = grpc
            .unary(
                tonic::Request::new(request),
                path,
                RawCodec::<Req, Resp>::default(),
            )
            .await
            .map_err(from_status)?;
        Ok(response.into_inner())
    }
}

/// Convert [`tonic::Status`] to [`BifrostError`].
fn from_status(status: tonic::Status) -> BifrostError {
    BifrostError::Rpc {
        code: status.code(),
        message: status.message().to_string(),
    }
}
