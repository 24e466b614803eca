// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Application and Lifecycle Coordination
//!
//! This module provides the root [`App`] type: queue registration, the
//! asynchronous error sink, and the connect/close state machine. Lifecycle
//! operations serialize through two in-flight completion slots; concurrent
//! calls join the pending completion instead of racing, and a connect
//! arriving during a failing close (or vice versa) is cancelled with
//! [`Error::CancelledByPeer`]. When clustering is enabled and the process is
//! the master, connect and close delegate to the cluster manager and never
//! touch broker resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cluster::{ClusterManager, ProcessSpawner, READY_MARKER};
use crate::config::{self, Config};
use crate::errors::Error;
use crate::handler::{message_handler, ErrorEvent, ErrorSink};
use crate::middleware::Middleware;
use crate::queue::{ConsumeOptions, QueueEntry, QueueOptions};
use crate::registry::{Registry, Schema};
use crate::transport::{LapinTransport, Transport};

type LifecycleFuture = Shared<BoxFuture<'static, Result<(), Error>>>;

/// What a lifecycle call found when inspecting the in-flight slots.
enum Pending {
    /// Join an operation of the same kind already in flight
    Join(LifecycleFuture),
    /// Chain after the peer operation currently in flight
    Peer(LifecycleFuture),
}

struct Lifecycle<T: Transport> {
    connecting: Option<LifecycleFuture>,
    closing: Option<LifecycleFuture>,
    connection: Option<Arc<T::Connection>>,
    consumer_channel: Option<T::Channel>,
    publisher_channel: Option<T::Channel>,
    consumer_tags: HashMap<String, String>,
    sigint_watcher: Option<JoinHandle<()>>,
}

impl<T: Transport> Default for Lifecycle<T> {
    fn default() -> Self {
        Lifecycle {
            connecting: None,
            closing: None,
            connection: None,
            consumer_channel: None,
            publisher_channel: None,
            consumer_tags: HashMap::new(),
            sigint_watcher: None,
        }
    }
}

struct AppInner<T: Transport> {
    config: Config,
    transport: Arc<T>,
    registry: StdMutex<Registry>,
    errors: ErrorSink,
    lifecycle: Mutex<Lifecycle<T>>,
    cluster: Mutex<Option<ClusterManager<ProcessSpawner>>>,
}

/// The root application: queue registry, middleware, and lifecycle.
///
/// Cheap to clone; clones share all state.
pub struct App<T: Transport = LapinTransport> {
    inner: Arc<AppInner<T>>,
}

impl<T: Transport> Clone for App<T> {
    fn clone(&self) -> Self {
        App {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for App<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App<LapinTransport> {
    /// Creates an application backed by the lapin transport.
    pub fn new(config: Config) -> Result<App<LapinTransport>, Error> {
        App::build(config, LapinTransport::new(), None)
    }

    /// Creates an application whose queue registration is constrained by a
    /// schema collaborator.
    pub fn with_schema(
        config: Config,
        schema: Arc<dyn Schema>,
    ) -> Result<App<LapinTransport>, Error> {
        App::build(config, LapinTransport::new(), Some(schema))
    }
}

impl<T: Transport> App<T> {
    /// Creates an application over a custom transport. This is the seam
    /// integration tests use.
    pub fn with_transport(config: Config, transport: T) -> Result<App<T>, Error> {
        App::build(config, transport, None)
    }

    fn build(
        config: Config,
        transport: T,
        schema: Option<Arc<dyn Schema>>,
    ) -> Result<App<T>, Error> {
        if config.cluster && config.queue_name.is_some() && !config::is_cluster_worker() {
            warn!("queueName is ignored when clustering is enabled");
        }
        if !config.cluster && config.resolved_queue_name().is_none() {
            return Err(Error::Validation(
                "queueName is required when clustering is disabled".to_owned(),
            ));
        }

        Ok(App {
            inner: Arc::new(AppInner {
                config,
                transport: Arc::new(transport),
                registry: StdMutex::new(Registry::new(schema)),
                errors: broadcast::channel(32).0,
                lifecycle: Mutex::new(Lifecycle::default()),
                cluster: Mutex::new(None),
            }),
        })
    }

    /// Appends middleware applied to every queue, in registration order.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.registry().add_middleware(middleware);
    }

    /// Registers a queue with its middleware pipeline.
    ///
    /// # Parameters
    /// * `name` - Queue name, unique within the application
    /// * `queue_options` - Assertion options; must be absent under a schema
    /// * `consume_options` - Consumer attachment options
    /// * `middleware` - Ordered, non-empty pipeline for this queue
    pub fn queue(
        &self,
        name: &str,
        queue_options: Option<QueueOptions>,
        consume_options: Option<ConsumeOptions>,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Result<(), Error> {
        self.registry()
            .add_queue(name, queue_options, consume_options, middleware)
    }

    /// Registered queue names in registration order.
    pub fn queue_names(&self) -> Vec<String> {
        self.registry().queue_names()
    }

    /// Subscribes to asynchronous pipeline and responder failures.
    pub fn on_error(&self) -> broadcast::Receiver<Arc<ErrorEvent>> {
        self.inner.errors.subscribe()
    }

    /// Connects to the broker and starts consuming every bound queue.
    ///
    /// Idempotent: calls arriving while a connect is in flight join the same
    /// completion, and a fully open application resolves immediately. A call
    /// arriving during a pending close chains after it; if that close fails,
    /// the connect is cancelled with [`Error::CancelledByPeer`]. On a
    /// failure while connecting, whatever was opened is released again and
    /// the original error surfaces.
    ///
    /// Under clustering, the master delegates to the cluster manager
    /// instead of opening broker resources.
    ///
    /// # Parameters
    /// * `url` - Broker URL; falls back to the configured one, then to
    ///   `COWORKERS_RABBITMQ_URL`
    pub async fn connect(&self, url: Option<&str>) -> Result<(), Error> {
        if self.inner.config.cluster && !config::is_cluster_worker() {
            return self.cluster_start().await;
        }

        let url = self.inner.config.resolved_url(url).ok_or_else(|| {
            Error::Validation(
                "no broker url: pass one to connect or set COWORKERS_RABBITMQ_URL".to_owned(),
            )
        })?;
        let required = self.required_queues();

        loop {
            let step = {
                let mut lifecycle = self.inner.lifecycle.lock().await;
                if let Some(pending) = &lifecycle.connecting {
                    Pending::Join(pending.clone())
                } else if let Some(pending) = &lifecycle.closing {
                    Pending::Peer(pending.clone())
                } else if fully_open(&lifecycle, &required) {
                    return Ok(());
                } else {
                    let fresh = self.spawn_connect(url.clone());
                    lifecycle.connecting = Some(fresh.clone());
                    Pending::Join(fresh)
                }
            };

            match step {
                Pending::Join(connect) => return connect.await,
                Pending::Peer(close) => match close.await {
                    Ok(()) => continue,
                    Err(close_err) => {
                        return Err(Error::CancelledByPeer {
                            message: "Connect cancelled because pending close failed (closeErr)"
                                .to_owned(),
                            peer: Arc::new(close_err),
                        });
                    }
                },
            }
        }
    }

    /// Closes consumers, channels and the connection.
    ///
    /// Idempotent like [`App::connect`]. A call arriving during a pending
    /// connect chains after it; if that connect fails, the close is
    /// cancelled with [`Error::CancelledByPeer`]. Under clustering, the
    /// master delegates to the cluster manager.
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.config.cluster && !config::is_cluster_worker() {
            return self.cluster_stop().await;
        }

        loop {
            let step = {
                let mut lifecycle = self.inner.lifecycle.lock().await;
                if let Some(pending) = &lifecycle.closing {
                    Pending::Join(pending.clone())
                } else if let Some(pending) = &lifecycle.connecting {
                    Pending::Peer(pending.clone())
                } else if fully_closed(&lifecycle) {
                    return Ok(());
                } else {
                    let fresh = self.spawn_close();
                    lifecycle.closing = Some(fresh.clone());
                    Pending::Join(fresh)
                }
            };

            match step {
                Pending::Join(close) => return close.await,
                Pending::Peer(connect) => match connect.await {
                    Ok(()) => continue,
                    Err(connect_err) => {
                        return Err(Error::CancelledByPeer {
                            message: "Close cancelled because pending connect failed (closeErr)"
                                .to_owned(),
                            peer: Arc::new(connect_err),
                        });
                    }
                },
            }
        }
    }

    fn spawn_connect(&self, url: String) -> LifecycleFuture {
        let app = self.clone();
        async move {
            let result = match app.do_connect(&url).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    // Release whatever partially succeeded; the original
                    // error surfaces, not the rollback's.
                    if let Err(close_err) = app.release_resources().await {
                        warn!(
                            error = close_err.to_string(),
                            "rollback close failed after connect failure"
                        );
                    }
                    Err(err)
                }
            };
            app.inner.lifecycle.lock().await.connecting = None;
            result
        }
        .boxed()
        .shared()
    }

    fn spawn_close(&self) -> LifecycleFuture {
        let app = self.clone();
        async move {
            let result = app.release_resources().await;
            app.inner.lifecycle.lock().await.closing = None;
            result
        }
        .boxed()
        .shared()
    }

    async fn do_connect(&self, url: &str) -> Result<(), Error> {
        let transport = &self.inner.transport;

        let connection = Arc::new(
            transport
                .connect(url, &self.inner.config.connection_name)
                .await?,
        );
        self.inner.lifecycle.lock().await.connection = Some(connection.clone());

        let (consumer_channel, publisher_channel) = futures_util::future::try_join(
            transport.create_channel(&connection),
            transport.create_channel(&connection),
        )
        .await?;
        {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            lifecycle.consumer_channel = Some(consumer_channel.clone());
            lifecycle.publisher_channel = Some(publisher_channel.clone());
        }

        if let Some(prefetch) = self.inner.config.prefetch {
            transport.set_prefetch(&consumer_channel, prefetch).await?;
        }

        for entry in self.entries_to_consume()? {
            transport
                .assert_queue(&consumer_channel, &entry.name, &entry.queue_options)
                .await?;

            let pipeline = self
                .registry()
                .pipeline_for(&entry.name)
                .unwrap_or_default();
            let handler = message_handler(
                self.inner.transport.clone(),
                entry.name.clone(),
                pipeline,
                consumer_channel.clone(),
                publisher_channel.clone(),
                self.inner.errors.clone(),
            );
            let tag = transport
                .consume(&consumer_channel, &entry.name, &entry.consume_options, handler)
                .await?;
            self.inner
                .lifecycle
                .lock()
                .await
                .consumer_tags
                .insert(entry.name.clone(), tag);
        }

        self.install_sigint_watcher().await;

        if config::is_cluster_worker() {
            // Readiness signal the cluster manager waits for.
            println!("{READY_MARKER}");
        }

        debug!("application connected");
        Ok(())
    }

    /// Releases every held broker resource, clearing each slot as its
    /// resource goes. The first failing step aborts the sequence; whatever
    /// remains is left to the transport's own teardown on process exit.
    async fn release_resources(&self) -> Result<(), Error> {
        let transport = &self.inner.transport;

        let (consumer_channel, consumer_tags) = {
            let lifecycle = self.inner.lifecycle.lock().await;
            (
                lifecycle.consumer_channel.clone(),
                lifecycle.consumer_tags.clone(),
            )
        };

        if let Some(channel) = &consumer_channel {
            for (queue_name, tag) in consumer_tags {
                transport.cancel_consumer(channel, &tag).await?;
                self.inner
                    .lifecycle
                    .lock()
                    .await
                    .consumer_tags
                    .remove(&queue_name);
            }
            transport.close_channel(channel).await?;
            self.inner.lifecycle.lock().await.consumer_channel = None;
        }

        let publisher_channel = self.inner.lifecycle.lock().await.publisher_channel.clone();
        if let Some(channel) = &publisher_channel {
            transport.close_channel(channel).await?;
            self.inner.lifecycle.lock().await.publisher_channel = None;
        }

        let connection = self.inner.lifecycle.lock().await.connection.clone();
        if let Some(connection) = &connection {
            transport.close_connection(connection).await?;
            self.inner.lifecycle.lock().await.connection = None;
        }

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(watcher) = lifecycle.sigint_watcher.take() {
            watcher.abort();
        }

        debug!("application closed");
        Ok(())
    }

    /// Installs the SIGINT watcher that closes the application. The task
    /// handle is stored so close can remove exactly this watcher.
    async fn install_sigint_watcher(&self) {
        let app = self.clone();
        let watcher = tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
                debug!("SIGINT received, closing");
                let app = app.clone();
                // Driven on a detached task: close aborts this watcher.
                tokio::spawn(async move {
                    if let Err(err) = app.close().await {
                        error!(error = err.to_string(), "failure to close on SIGINT");
                    }
                });
            }
        });

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(previous) = lifecycle.sigint_watcher.take() {
            previous.abort();
        }
        lifecycle.sigint_watcher = Some(watcher);
    }

    /// The queue entries this process consumes: the single bound queue when
    /// one is resolved, every registered queue otherwise.
    fn entries_to_consume(&self) -> Result<Vec<QueueEntry>, Error> {
        let registry = self.registry();
        match self.inner.config.resolved_queue_name() {
            Some(name) => {
                let entry = registry.entry(&name).cloned().ok_or_else(|| {
                    Error::Validation(format!("queue `{name}` is not registered"))
                })?;
                Ok(vec![entry])
            }
            None => Ok(registry.entries().to_vec()),
        }
    }

    fn required_queues(&self) -> Vec<String> {
        match self.inner.config.resolved_queue_name() {
            Some(name) => vec![name],
            None => self.queue_names(),
        }
    }

    async fn cluster_start(&self) -> Result<(), Error> {
        let manager = {
            let mut cluster = self.inner.cluster.lock().await;
            if cluster.is_none() {
                *cluster = Some(ClusterManager::new(
                    ProcessSpawner::from_current_exe()?,
                    self.queue_names(),
                    self.inner.config.graceful_timeout,
                    self.inner.config.term_timeout,
                ));
            }
            cluster.clone()
        };
        match manager {
            Some(manager) => manager.start().await,
            None => Ok(()),
        }
    }

    async fn cluster_stop(&self) -> Result<(), Error> {
        let manager = self.inner.cluster.lock().await.clone();
        match manager {
            Some(manager) => manager.stop().await,
            None => Ok(()),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.registry.lock().expect("registry lock poisoned")
    }
}

fn fully_open<T: Transport>(lifecycle: &Lifecycle<T>, required_queues: &[String]) -> bool {
    lifecycle.connection.is_some()
        && lifecycle.consumer_channel.is_some()
        && lifecycle.publisher_channel.is_some()
        && required_queues
            .iter()
            .all(|queue| lifecycle.consumer_tags.contains_key(queue))
}

fn fully_closed<T: Transport>(lifecycle: &Lifecycle<T>) -> bool {
    lifecycle.connection.is_none()
        && lifecycle.consumer_channel.is_none()
        && lifecycle.publisher_channel.is_none()
}

#[cfg(test)]
impl<T: Transport> App<T> {
    pub(crate) async fn debug_slots(&self) -> (bool, bool) {
        let lifecycle = self.inner.lifecycle.lock().await;
        (lifecycle.connecting.is_some(), lifecycle.closing.is_some())
    }

    pub(crate) async fn debug_released(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock().await;
        fully_closed(&lifecycle)
            && lifecycle.consumer_tags.is_empty()
            && lifecycle.sigint_watcher.is_none()
    }

    pub(crate) async fn debug_consumer_tags(&self) -> HashMap<String, String> {
        self.inner.lifecycle.lock().await.consumer_tags.clone()
    }
}
