//! Watch intake: cluster watch streams feeding the capturers
//!
//! Each resource kind gets two tasks. The intake task follows the watch
//! stream and pushes notifications into a bounded queue; the worker task
//! drains the queue through its capturer one notification at a time, so
//! events for one kind are handled in arrival order. A full queue holds the
//! intake back instead of dropping notifications.

use super::{
    capture, Capturer, Change, DeploymentCapturer, EndpointCapturer, EndpointRegistry,
    EventCapturer, JobCapturer, WatchEvent,
};
use crate::controller::Context;
use crate::server::{SharedMetrics, ShutdownSignal};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default depth of each capturer's queue
pub const DEFAULT_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    /// Namespace to watch; `None` watches the whole cluster
    pub namespace: Option<String>,
    pub buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            buffer: DEFAULT_BUFFER,
        }
    }
}

fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Map a raw watcher event onto a capture notification
///
/// Objects from the initial listing are `Added`; every live apply is
/// `Updated`. Listing boundaries carry no object and are dropped.
pub fn to_watch_event<K>(event: watcher::Event<K>) -> Option<WatchEvent<K>> {
    let (change, object) = match event {
        watcher::Event::InitApply(object) => (Change::Added, object),
        watcher::Event::Apply(object) => (Change::Updated, object),
        watcher::Event::Delete(object) => (Change::Deleted, object),
        watcher::Event::Init | watcher::Event::InitDone => return None,
    };
    Some(WatchEvent { change, object })
}

/// Follow the watch stream until shutdown, queueing notifications
async fn intake<K>(
    api: Api<K>,
    kind: &'static str,
    tx: mpsc::Sender<WatchEvent<K>>,
    mut shutdown: ShutdownSignal,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);
    info!(capturer = kind, "Watch started");

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    let Some(event) = to_watch_event(event) else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        warn!(capturer = kind, "Capture worker gone, stopping watch");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(capturer = kind, error = %e, "Watch error (will retry)");
                }
                None => {
                    warn!(capturer = kind, "Watch stream ended");
                    break;
                }
            }
        }
    }
    info!(capturer = kind, "Watch stopped");
}

/// Drain the queue through the capturer; returns how many were handled
///
/// Ends once every sender is dropped and the queue is empty, so queued
/// notifications still finish after the intake stops.
async fn work<C>(
    capturer: Arc<C>,
    mut rx: mpsc::Receiver<WatchEvent<C::Object>>,
    metrics: Option<SharedMetrics>,
) -> usize
where
    C: Capturer + 'static,
{
    let mut handled = 0;
    while let Some(event) = rx.recv().await {
        // Outcomes are already logged and counted inside capture
        let _ = capture(capturer.as_ref(), &event, metrics.as_ref()).await;
        handled += 1;
    }
    debug!(capturer = capturer.name(), handled, "Capture worker stopped");
    handled
}

fn spawn_capturer<C>(
    client: Client,
    config: &WatchConfig,
    capturer: C,
    shutdown: ShutdownSignal,
    metrics: Option<SharedMetrics>,
) -> [JoinHandle<()>; 2]
where
    C: Capturer + 'static,
    C::Object: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Debug + 'static,
    <C::Object as Resource>::DynamicType: Default,
{
    let (tx, rx) = mpsc::channel(config.buffer.max(1));
    let api = api::<C::Object>(client, config.namespace.as_deref());
    let kind = capturer.name();

    let intake = tokio::spawn(intake(api, kind, tx, shutdown));
    let worker = tokio::spawn(async move {
        work(Arc::new(capturer), rx, metrics).await;
    });
    [intake, worker]
}

/// Start the watches for every capturer
///
/// Deployments drive phase completion and cutover, Events feed phase logs,
/// Endpoints fill `registry`, and Jobs report CronJob runs.
pub fn spawn_watchers(
    client: Client,
    ctx: Context,
    registry: Arc<EndpointRegistry>,
    config: &WatchConfig,
    shutdown: ShutdownSignal,
) -> Vec<JoinHandle<()>> {
    let metrics = ctx.metrics.clone();
    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        buffer = config.buffer,
        "Starting capture watches"
    );

    let mut handles = Vec::with_capacity(8);
    handles.extend(spawn_capturer(
        client.clone(),
        config,
        DeploymentCapturer::new(ctx.clone()),
        shutdown.clone(),
        metrics.clone(),
    ));
    handles.extend(spawn_capturer(
        client.clone(),
        config,
        EventCapturer::new(ctx),
        shutdown.clone(),
        metrics.clone(),
    ));
    handles.extend(spawn_capturer(
        client.clone(),
        config,
        EndpointCapturer::new(registry),
        shutdown.clone(),
        metrics.clone(),
    ));
    handles.extend(spawn_capturer(
        client,
        config,
        JobCapturer::new(metrics.clone()),
        shutdown,
        metrics,
    ));
    handles
}
