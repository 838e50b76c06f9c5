//! Endpoint set resolution.
//!
//! A [`Resolver`] turns a target into a [`Watcher`]. Each watcher owns one
//! background task that fetches the current `Endpoints` object, then follows its
//! change stream. Every applied change is republished as the full, sorted list of
//! addresses serving the target.
//!
//! # Example
//!
//! ```ignore
//! use k8s_endpoint_resolver::{KubeEndpointClient, Resolver};
//!
//! let client = KubeEndpointClient::try_default().await?;
//! let resolver = Resolver::new(client);
//! let mut watcher = resolver.resolve("my-grpc-service.my-namespace:grpc")?;
//!
//! loop {
//!     match watcher.next().await {
//!         Ok(addrs) => println!("serving: {addrs:?}"),
//!         Err(e) if e.is_closed() => break,
//!         Err(e) => eprintln!("watch error: {e}"),
//!     }
//! }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use futures::Stream;
use k8s_openapi::api::core::v1::Endpoints;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::client::{BoxError, EndpointClient};
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, ChangeResult};
use crate::stream::{BackoffSettings, StreamWatcher};
use crate::target::{Port, Target};

/// Default capacity of the queue between the stream watcher and the [`Watcher`].
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Creates [`Watcher`]s for targets, sharing one API client.
#[derive(Debug)]
pub struct Resolver<C> {
    client: Arc<C>,
    backoff: BackoffSettings,
    queue_capacity: usize,
}

impl<C> Clone for Resolver<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            backoff: self.backoff,
            queue_capacity: self.queue_capacity,
        }
    }
}

impl<C: EndpointClient> Resolver<C> {
    /// Creates a resolver that talks to the API through `client`.
    #[must_use]
    pub fn new(client: C) -> Self {
        Self::from_shared(Arc::new(client))
    }

    /// Creates a resolver from a client that is shared with other components.
    #[must_use]
    pub fn from_shared(client: Arc<C>) -> Self {
        Self {
            client,
            backoff: BackoffSettings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Sets the backoff used when fetching the snapshot or reconnecting the stream.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets how many undelivered change results may be buffered per watcher.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        self.queue_capacity = capacity;
        self
    }

    /// Parses `target` and starts resolving it.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] if the target cannot be parsed.
    pub fn resolve(&self, target: &str) -> Result<Watcher> {
        Ok(self.resolve_target(target.parse()?))
    }

    /// Starts resolving an already parsed target.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn resolve_target(&self, target: Target) -> Watcher {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let cancel = CancellationToken::new();

        tokio::spawn(follow(
            self.client.clone(),
            target.clone(),
            self.backoff,
            tx,
            cancel.clone(),
        ));

        Watcher {
            state: EndpointState::new(target.port_selector().cloned()),
            target,
            events: rx,
            cancel,
        }
    }
}

/// Background task of one watcher: snapshot first, then the change stream.
async fn follow<C: EndpointClient>(
    client: Arc<C>,
    target: Target,
    backoff: BackoffSettings,
    tx: Sender<ChangeResult>,
    cancel: CancellationToken,
) {
    let fetched = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        fetched = fetch_snapshot(&*client, &target, backoff) => fetched,
    };

    let Some(snapshot) = fetched else {
        return;
    };

    let snapshot = ChangeEvent::Added(snapshot);
    let version = snapshot.resource_version();
    if tx.send(Ok(snapshot)).await.is_err() {
        return;
    }

    let since = match version {
        Ok(version) => version,
        Err(e) => {
            if tx.send(Err(e)).await.is_err() {
                return;
            }
            0
        }
    };

    StreamWatcher::new(client, target, since, tx)
        .backoff(backoff)
        .run(cancel)
        .await;
}

/// Fetches the current `Endpoints` object, retrying until it succeeds.
async fn fetch_snapshot<C: EndpointClient>(
    client: &C,
    target: &Target,
    backoff: BackoffSettings,
) -> Option<Endpoints> {
    let fetch = move || async move {
        let mut body = client.start_single_unary(target, 0).await?;
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await?;
        Ok::<_, BoxError>(serde_json::from_slice::<Endpoints>(&buf)?)
    };

    let fetched = fetch
        .retry(backoff.builder())
        .sleep(tokio::time::sleep)
        .notify(|e: &BoxError, delay: Duration| {
            tracing::warn!(
                service = %target,
                backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "failed to fetch endpoints snapshot: {e}"
            );
        })
        .await;

    match fetched {
        Ok(endpoints) => Some(endpoints),
        Err(e) => {
            tracing::error!(service = %target, "giving up on endpoints snapshot: {e}");
            None
        }
    }
}

/// Live view of the addresses serving one target.
///
/// Dropping the watcher closes it.
#[derive(Debug)]
pub struct Watcher {
    target: Target,
    events: Receiver<ChangeResult>,
    state: EndpointState,
    cancel: CancellationToken,
}

impl Watcher {
    /// Waits for the next change and returns the recomputed address set.
    ///
    /// The first call returns the addresses from the initial snapshot. Errors
    /// never discard the previously returned addresses; call `next` again to
    /// keep following the target.
    ///
    /// # Errors
    ///
    /// - [`Error::Watch`] for decode, event type, `resourceVersion` or stream termination errors
    /// - [`Error::Remote`] for `ERROR` events sent by the server
    /// - [`Error::Closed`] once the watcher has been closed
    pub async fn next(&mut self) -> Result<Vec<SocketAddr>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        let received = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::Closed),
            received = self.events.recv() => received,
        };

        let event = received.ok_or(Error::Closed)??;
        self.state.apply(event)?;
        Ok(self.state.addresses.clone())
    }

    /// The addresses returned by the last successful [`next`](Self::next).
    #[must_use]
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.state.addresses
    }

    /// The target being resolved.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Stops the background watch. Calling this more than once has no effect.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Returns a handle that can close this watcher from another task.
    #[must_use]
    pub fn closer(&self) -> Closer {
        Closer(self.cancel.clone())
    }

    /// Converts the watcher into a stream of updates that ends when it is closed.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<SocketAddr>>> + Send {
        futures::stream::unfold(self, |mut watcher| async move {
            match watcher.next().await {
                Err(Error::Closed) => None,
                item => Some((item, watcher)),
            }
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Closes a [`Watcher`] from anywhere; a pending `next` returns [`Error::Closed`].
#[derive(Clone, Debug)]
pub struct Closer(CancellationToken);

impl Closer {
    /// Closes the watcher.
    pub fn close(&self) {
        self.0.cancel();
    }
}

/// The authoritative `Endpoints` state of one target.
#[derive(Debug, Default)]
struct EndpointState {
    port: Option<Port>,
    current: Option<Endpoints>,
    addresses: Vec<SocketAddr>,
}

impl EndpointState {
    fn new(port: Option<Port>) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Applies one event. State only changes for added, modified and deleted events.
    fn apply(&mut self, event: ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::Added(endpoints) | ChangeEvent::Modified(endpoints) => {
                self.current = Some(endpoints);
            }
            ChangeEvent::Deleted(_) => {
                self.current = None;
            }
            ChangeEvent::Error(status) => {
                return Err(Error::Remote {
                    code: status.code,
                    reason: status.reason,
                    message: status.message.unwrap_or_default(),
                });
            }
        }

        self.addresses = self
            .current
            .as_ref()
            .map(|endpoints| resolved_addresses(endpoints, self.port.as_ref()))
            .unwrap_or_default();

        tracing::debug!("resolved {} endpoint addresses", self.addresses.len());
        Ok(())
    }
}

/// Flattens an `Endpoints` object into the sorted, deduplicated addresses selected by `port`.
///
/// With no port selector every port of every subset is used. Addresses that are
/// not IPs and ports out of range are skipped.
#[must_use]
pub fn resolved_addresses(endpoints: &Endpoints, port: Option<&Port>) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    for subset in endpoints.subsets.iter().flatten() {
        let selected = subset
            .ports
            .iter()
            .flatten()
            .filter(|p| port.is_none_or(|sel| sel.matches(p.port, p.name.as_deref())));

        for endpoint_port in selected {
            let Ok(number) = u16::try_from(endpoint_port.port) else {
                continue;
            };

            for address in subset.addresses.iter().flatten() {
                match address.ip.parse::<IpAddr>() {
                    Ok(ip) => addrs.push(SocketAddr::new(ip, number)),
                    Err(_) => tracing::warn!("skipping invalid endpoint address: {}", address.ip),
                }
            }
        }
    }

    addrs.sort_unstable();
    addrs.dedup();
    addrs
}
