//! The bridge: lifecycle of listener, worker channel and gRPC server.
//!
//! ```text
//! Initialized ──serve()──► Serving ──stop()──► Stopping ──drain──► Stopped
//!      ▲                      │
//!      └── startup failure ───┘ (listener closed, channel never started)
//! ```
//!
//! All state lives behind one `std::sync::Mutex` that is only held for
//! synchronous work: startup steps, state transitions and `stop()`. The
//! accept loop and every proxied call run without it. Events the worker
//! channel raises during startup are held back and delivered once the
//! lock is released, so listeners may call back into the bridge.

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tokio::sync::oneshot;
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic::transport::server::Router;
use tracing::{debug, info, warn};

use super::config::Config;
use super::control::ControlServer;
use super::listener::{BoundListener, ListenAddr, load_tls};
use crate::env::{EnvironmentProvider, StaticEnvironment, merge_worker_env};
use crate::events::{Event, EventListener, EventSink};
use crate::protocol::{ProtoFileRegistry, ProtocolRegistry};
use crate::proxy::{CallShape, ProxyService, ProxySettings, unimplemented_response};
use crate::worker::{ChannelFactory, ProcessPoolFactory, WorkerChannel};
use crate::{BifrostError, Result};

/// Transform applied to the tonic server builder before serving.
///
/// TLS and codecs are managed by the bridge; options cover the rest
/// (keepalive, concurrency limits, timeouts).
pub type ServerOption = Arc<dyn Fn(Server) -> Server + Send + Sync>;

/// Lifecycle state of a [`Bridge`].
///
/// A bridge is `Initialized` from construction; there is no observable
/// state before configuration is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeState {
    Initialized,
    Serving,
    Stopping,
    Stopped,
}

impl BridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeState::Initialized => "initialized",
            BridgeState::Serving => "serving",
            BridgeState::Stopping => "stopping",
            BridgeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serves the services of a protocol file from a pool of workers.
///
/// Cheap to clone; clones share one bridge.
///
/// # Example
///
/// ```ignore
/// let config = Config::load(None)?;
/// let bridge = Bridge::new(config);
/// bridge.add_listener(Arc::new(bifrost::events::log_event))?;
/// bridge.serve().await?;
/// ```
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    inner: Mutex<Inner>,
    listeners: RwLock<Vec<EventListener>>,
}

struct Inner {
    state: BridgeState,
    registry: Arc<dyn ProtocolRegistry>,
    factory: Arc<dyn ChannelFactory>,
    environment: Option<Arc<dyn EnvironmentProvider>>,
    options: Vec<ServerOption>,
    /// Routes of externally implemented services.
    router: axum::Router,
    external: HashSet<&'static str>,
    // set only while serving
    shutdown: Option<oneshot::Sender<()>>,
    channel: Option<Arc<dyn WorkerChannel>>,
    local_addr: Option<String>,
    fatal: Option<String>,
}

/// Everything `serve` needs once the lock is released.
struct Session {
    listener: BoundListener,
    router: Router,
    channel: Arc<dyn WorkerChannel>,
    services: usize,
}

impl Bridge {
    /// Create a bridge with the default collaborators: a `.proto` file
    /// registry, a process pool and the `[env]` table as environment.
    ///
    /// The control service is registered when `[control] enabled` is set.
    pub fn new(config: Config) -> Self {
        let environment: Arc<dyn EnvironmentProvider> =
            Arc::new(StaticEnvironment::new(config.env.clone()));
        let control = config.control.enabled;
        let registry = ProtoFileRegistry::with_includes(config.server.proto_includes.clone());

        let bridge = Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    state: BridgeState::Initialized,
                    registry: Arc::new(registry),
                    factory: Arc::new(ProcessPoolFactory),
                    environment: Some(environment),
                    options: Vec::new(),
                    router: axum::Router::new(),
                    external: HashSet::new(),
                    shutdown: None,
                    channel: None,
                    local_addr: None,
                    fatal: None,
                }),
                listeners: RwLock::new(Vec::new()),
            }),
        };

        if control {
            let mut inner = bridge.shared.lock();
            inner.mount(ControlServer::new(bridge.stop_handle()));
        }
        bridge
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> BridgeState {
        self.shared.lock().state
    }

    /// Address the server accepts on, while serving.
    pub fn local_addr(&self) -> Option<String> {
        self.shared.lock().local_addr.clone()
    }

    /// Handle that stops the bridge without keeping it alive.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Replace the source of service descriptors.
    pub fn set_registry(&self, registry: impl ProtocolRegistry + 'static) -> Result<()> {
        let mut inner = self.shared.configurable("set the protocol registry")?;
        inner.registry = Arc::new(registry);
        Ok(())
    }

    /// Replace how the worker channel is created.
    pub fn set_channel_factory(&self, factory: impl ChannelFactory + 'static) -> Result<()> {
        let mut inner = self.shared.configurable("set the channel factory")?;
        inner.factory = Arc::new(factory);
        Ok(())
    }

    /// Replace the provider of extra worker environment variables.
    pub fn set_environment(&self, environment: impl EnvironmentProvider + 'static) -> Result<()> {
        let mut inner = self.shared.configurable("set the environment provider")?;
        inner.environment = Some(Arc::new(environment));
        Ok(())
    }

    /// Register an externally implemented gRPC service, typically a
    /// tonic-generated `FooServer`. Its name must not collide with another
    /// external service or any service of the protocol file.
    pub fn register_service<S>(&self, service: S) -> Result<()>
    where
        S: tower::Service<http::Request<axum::body::Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        let mut inner = self.shared.configurable("register a service")?;
        if inner.external.contains(S::NAME) {
            return Err(BifrostError::DuplicateService(S::NAME.to_string()));
        }
        inner.mount(service);
        debug!(service = S::NAME, "external service registered");
        Ok(())
    }

    pub fn add_option(&self, option: ServerOption) -> Result<()> {
        let mut inner = self.shared.configurable("add a server option")?;
        inner.options.push(option);
        Ok(())
    }

    /// Listeners see every event in registration order.
    pub fn add_listener(&self, listener: EventListener) -> Result<()> {
        drop(self.shared.configurable("add a listener")?);
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        Ok(())
    }

    /// Start serving and run until stopped.
    ///
    /// Startup failures return `Err` with the bridge back in `Initialized`
    /// and nothing listening. A bridge stopped by a fatal pool failure
    /// returns [`BifrostError::PoolFailed`] once drained.
    pub async fn serve(&self) -> Result<()> {
        let gate = StartupGate::closed();
        let started = {
            let mut inner = self.shared.lock();
            if inner.state != BridgeState::Initialized {
                return Err(BifrostError::InvalidState(format!(
                    "cannot serve a bridge that is {}",
                    inner.state
                )));
            }
            self.shared.prepare(&inner, &gate).map(|session| {
                let addr = session.listener.local_addr();
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                inner.state = BridgeState::Serving;
                inner.shutdown = Some(shutdown_tx);
                inner.channel = Some(Arc::clone(&session.channel));
                inner.local_addr = Some(addr.clone());
                (session, shutdown_rx, addr)
            })
        };
        gate.open(&self.shared);
        let (session, shutdown_rx, addr) = started?;

        let Session {
            listener,
            router,
            channel,
            services,
        } = session;

        info!(addr = %addr, services, "bridge serving");
        // a fatal startup event may already have begun the drain
        if self.state() == BridgeState::Serving {
            self.shared.throw(Event::Serving { addr });
        }

        let signal = async move {
            // a dropped sender also means stop
            let _ = shutdown_rx.await;
        };
        let served = listener.serve(router, signal).await;
        if let Err(e) = &served {
            warn!(error = %e, "accept loop failed");
        }

        channel.stop().await;

        let fatal = {
            let mut inner = self.shared.lock();
            inner.state = BridgeState::Stopped;
            inner.shutdown = None;
            inner.channel = None;
            inner.local_addr = None;
            inner.fatal.take()
        };
        info!("bridge stopped");
        self.shared.throw(Event::Stopped);

        served?;
        match fatal {
            Some(reason) => Err(BifrostError::PoolFailed(reason)),
            None => Ok(()),
        }
    }

    /// Begin a graceful drain. Returns immediately; `serve` returns once
    /// in-flight calls complete. No-op unless serving.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Bridge")
            .field("state", &inner.state)
            .field("listen", &self.shared.config.server.listen)
            .field("local_addr", &inner.local_addr)
            .field("external", &inner.external)
            .finish()
    }
}

impl Inner {
    fn mount<S>(&mut self, service: S)
    where
        S: tower::Service<http::Request<axum::body::Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        let router = std::mem::replace(&mut self.router, axum::Router::new());
        self.router = router.route_service(&format!("/{}/{{*method}}", S::NAME), service);
        self.external.insert(S::NAME);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn configurable(&self, action: &str) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.state != BridgeState::Initialized {
            return Err(BifrostError::InvalidState(format!(
                "cannot {action} while {}",
                inner.state
            )));
        }
        Ok(inner)
    }

    /// Startup steps up to and including worker start. On error every
    /// resource acquired so far is dropped, closing the listener.
    fn prepare(self: &Arc<Self>, inner: &Inner, gate: &Arc<StartupGate>) -> Result<Session> {
        let server_config = &self.config.server;

        let listener = ListenAddr::parse(&server_config.listen)?.bind()?;
        debug!(addr = %listener.local_addr(), "listener bound");

        let mut workers = self.config.workers.clone();
        workers.env = merge_worker_env(&workers.env, inner.environment.as_deref())?;

        let channel = inner.factory.create(&workers)?;
        let sink = self.event_sink(Arc::clone(gate));
        channel.listen(Arc::clone(&sink));

        let mut server = Server::builder();
        if let Some(tls) = &server_config.tls {
            server = server
                .tls_config(load_tls(tls)?)
                .map_err(|e| BifrostError::Tls(e.to_string()))?;
        }
        server = server.max_concurrent_streams(server_config.max_concurrent_streams);
        for option in &inner.options {
            server = option(server);
        }

        let descriptors = inner.registry.services(&server_config.proto)?;
        let settings = ProxySettings {
            request_timeout: server_config.request_timeout(),
            max_decoding_message_size: server_config.max_recv_msg_size,
            max_encoding_message_size: server_config.max_send_msg_size,
        };

        let mut names: HashSet<String> = inner.external.iter().map(|n| n.to_string()).collect();
        let mut router = inner.router.clone();
        for descriptor in &descriptors {
            let name = descriptor.qualified_name();
            if !names.insert(name.clone()) {
                return Err(BifrostError::DuplicateService(name));
            }

            let mut proxy = ProxyService::new(name.as_str(), Arc::clone(&channel))
                .with_settings(settings)
                .with_events(Arc::clone(&sink));
            for method in &descriptor.methods {
                let shape = if method.is_streaming() {
                    CallShape::Streaming
                } else {
                    CallShape::Unary
                };
                proxy.register(&method.name, shape)?;
            }

            debug!(service = %name, methods = descriptor.methods.len(), "proxy registered");
            let proxy = proxy.into_server();
            router = router.route_service(&proxy.route(), proxy);
        }
        let router = router.fallback_service(tower::service_fn(|_: http::Request<axum::body::Body>| async {
            Ok::<_, Infallible>(unimplemented_response())
        }));
        let router = server.add_routes(Routes::from(router));

        channel.start()?;

        Ok(Session {
            listener,
            router,
            channel,
            services: names.len(),
        })
    }

    fn event_sink(self: &Arc<Self>, gate: Arc<StartupGate>) -> EventSink {
        let shared = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(event) = gate.hold(event) else {
                return;
            };
            if let Some(shared) = shared.upgrade() {
                shared.throw(event);
            }
        })
    }

    /// Deliver `event` to every listener, then react to it.
    fn throw(&self, event: Event) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener(&event);
        }

        if event.is_fatal() {
            let reason = match &event {
                Event::PoolFailed { reason } => reason.clone(),
                other => other.kind().to_string(),
            };
            warn!(reason = %reason, "fatal event, stopping bridge");
            let serving = {
                let mut inner = self.lock();
                if inner.fatal.is_none() && inner.state == BridgeState::Serving {
                    inner.fatal = Some(reason);
                }
                inner.state == BridgeState::Serving
            };
            if serving {
                self.stop();
            }
        }
    }

    fn stop(&self) -> bool {
        let shutdown = {
            let mut inner = self.lock();
            if inner.state != BridgeState::Serving {
                return false;
            }
            inner.state = BridgeState::Stopping;
            inner.shutdown.take()
        };

        info!("bridge stopping");
        if let Some(shutdown) = shutdown {
            // the accept loop may already be gone
            let _ = shutdown.send(());
        }
        self.throw(Event::Stopping);
        true
    }
}

/// Buffers channel events until `serve` has released the bridge lock.
struct StartupGate {
    held: Mutex<Option<Vec<Event>>>,
}

impl StartupGate {
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(Some(Vec::new())),
        })
    }

    /// Keep `event` while closed; hand it back once open.
    fn hold(&self, event: Event) -> Option<Event> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.as_mut() {
            Some(buffer) => {
                buffer.push(event);
                None
            }
            None => Some(event),
        }
    }

    /// Deliver held events in order, then pass new ones straight through.
    fn open(&self, shared: &Shared) {
        loop {
            let batch = {
                let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
                let batch = held.take().unwrap_or_default();
                if !batch.is_empty() {
                    // events raised while this batch is delivered queue behind it
                    *held = Some(Vec::new());
                }
                batch
            };
            if batch.is_empty() {
                return;
            }
            for event in batch {
                shared.throw(event);
            }
        }
    }
}

/// Stops a bridge from anywhere: signal handlers, the control plane.
#[derive(Clone)]
pub struct StopHandle {
    shared: Weak<Shared>,
}

impl StopHandle {
    /// Same as [`Bridge::stop`]; false if the bridge is gone.
    pub fn stop(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| shared.stop())
    }

    pub fn state(&self) -> Option<BridgeState> {
        self.shared.upgrade().map(|shared| shared.lock().state)
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("state", &self.state())
            .finish()
    }
}
