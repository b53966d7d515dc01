//! Control plane: `bifrost.control.v1.Control`.
//!
//! Lets an operator stop a running bridge, or ask for its state, over the
//! same gRPC port the proxied services use.

use std::convert::Infallible;
use std::task::{Context, Poll};

use tonic::codegen::{Body, BoxFuture, StdError};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::{Request, Response, Status};
use tracing::info;

use super::bridge::StopHandle;
use crate::codec::{RawCodec, Typed};
use crate::proxy::unimplemented_response;
use crate::version_string;

/// Message types of the control service.
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StopRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StopResponse {
        /// True when this request initiated the drain.
        #[prost(bool, tag = "1")]
        pub stopping: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusResponse {
        #[prost(string, tag = "1")]
        pub state: String,
        #[prost(string, tag = "2")]
        pub version: String,
    }
}

pub const SERVICE_NAME: &str = "bifrost.control.v1.Control";
pub const STOP_PATH: &str = "/bifrost.control.v1.Control/Stop";
pub const STATUS_PATH: &str = "/bifrost.control.v1.Control/Status";

/// Server side of the control service.
#[derive(Debug, Clone)]
pub struct ControlServer {
    handle: StopHandle,
}

impl ControlServer {
    pub fn new(handle: StopHandle) -> Self {
        Self { handle }
    }
}

impl NamedService for ControlServer {
    const NAME: &'static str = SERVICE_NAME;
}

struct StopSvc(StopHandle);

impl UnaryService<Typed<proto::StopRequest>> for StopSvc {
    type Response = Typed<proto::StopResponse>;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, _request: Request<Typed<proto::StopRequest>>) -> Self::Future {
        let handle = self.0.clone();
        Box::pin(async move {
            info!("stop requested over control plane");
            let stopping = handle.stop();
            Ok(Response::new(Typed(proto::StopResponse { stopping })))
        })
    }
}

struct StatusSvc(StopHandle);

impl UnaryService<Typed<proto::StatusRequest>> for StatusSvc {
    type Response = Typed<proto::StatusResponse>;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, _request: Request<Typed<proto::StatusRequest>>) -> Self::Future {
        let state = self
            .0
            .state()
            .map_or("stopped", |state| state.as_str())
            .to_string();
        Box::pin(async move {
            Ok(Response::new(Typed(proto::StatusResponse {
                state,
                version: version_string(),
            })))
        })
    }
}

impl<B> tower::Service<http::Request<B>> for ControlServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let handle = self.handle.clone();
        match req.uri().path() {
            STOP_PATH => Box::pin(async move {
                let codec = RawCodec::<Typed<proto::StopResponse>, Typed<proto::StopRequest>>::default();
                let mut grpc = Grpc::new(codec);
                Ok(grpc.unary(StopSvc(handle), req).await)
            }),
            STATUS_PATH => Box::pin(async move {
                let codec =
                    RawCodec::<Typed<proto::StatusResponse>, Typed<proto::StatusRequest>>::default();
                let mut grpc = Grpc::new(codec);
                Ok(grpc.unary(StatusSvc(handle), req).await)
            }),
            _ => Box::pin(async move { Ok(unimplemented_response()) }),
        }
    }
}
