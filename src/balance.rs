//! Feeding resolved endpoints into a tonic balance channel.
//!
//! Every address set a [`Watcher`] yields is diffed against the addresses already
//! handed to the channel, and only the difference is sent as `Change::Remove` and
//! `Change::Insert` events. See the crate docs for a complete example.

use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::sync::mpsc::Sender;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::error::Error;
use crate::k8s::KubeEndpointClient;
use crate::resolver::{Resolver, Watcher};
use crate::target::Target;

/// Starts resolving `target` and sends endpoint changes to the provided sender.
///
/// This function spawns a background task that creates a Kubernetes client from
/// the ambient configuration, watches the target's `Endpoints` resource and sends
/// `Change` events to the provided sender.
///
/// `build` turns each new address into the `Endpoint` the channel connects to.
/// The caller needs RBAC permission to get and watch `Endpoints` in the target
/// namespace.
pub fn discover<F>(target: Target, tx: Sender<Change<SocketAddr, Endpoint>>, build: F)
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    tokio::spawn(async move {
        let client = match KubeEndpointClient::try_default().await {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("Kubernetes endpoint watcher failed: {e}");
                return;
            }
        };

        let watcher = Resolver::new(client).resolve_target(target);
        balance_loop(watcher, tx, build).await;
    });
}

/// Like [`discover`], but drives an existing [`Watcher`].
///
/// The task stops when the watcher is closed or the receiver is dropped.
pub fn discover_with<F>(watcher: Watcher, tx: Sender<Change<SocketAddr, Endpoint>>, build: F)
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    tokio::spawn(balance_loop(watcher, tx, build));
}

/// Background task that follows a watcher and sends endpoint changes.
async fn balance_loop<F>(mut watcher: Watcher, tx: Sender<Change<SocketAddr, Endpoint>>, build: F)
where
    F: Fn(SocketAddr) -> Endpoint,
{
    let mut known: HashSet<SocketAddr> = HashSet::new();

    loop {
        let addrs = match watcher.next().await {
            Ok(addrs) => addrs,
            Err(Error::Closed) => {
                tracing::debug!("watcher closed, stopping Kubernetes discovery");
                return;
            }
            Err(e) => {
                tracing::warn!("Kubernetes endpoint watch error: {e}");
                continue;
            }
        };

        for action in diff_endpoints(&mut known, &addrs) {
            let change = match action {
                EndpointAction::Insert(addr) => Change::Insert(addr, build(addr)),
                EndpointAction::Remove(addr) => Change::Remove(addr),
            };

            if tx.send(change).await.is_err() {
                tracing::warn!("channel closed, stopping Kubernetes watcher");
                return;
            }
        }

        tracing::debug!(
            "Kubernetes discovery: {} endpoints for {}",
            known.len(),
            watcher.target()
        );
    }
}

/// Represents an endpoint change action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(SocketAddr),
    Remove(SocketAddr),
}

/// Computes the actions that turn `known` into `current`, and applies them to `known`.
///
/// Removals come first, both halves in address order.
fn diff_endpoints(known: &mut HashSet<SocketAddr>, current: &[SocketAddr]) -> Vec<EndpointAction> {
    let wanted: HashSet<SocketAddr> = current.iter().copied().collect();
    let mut removed: Vec<SocketAddr> = known.difference(&wanted).copied().collect();
    removed.sort_unstable();

    let mut actions = Vec::new();

    for addr in removed {
        known.remove(&addr);
        tracing::debug!("removing endpoint: {addr}");
        actions.push(EndpointAction::Remove(addr));
    }

    for &addr in current {
        if known.insert(addr) {
            tracing::debug!("adding endpoint: {addr}");
            actions.push(EndpointAction::Insert(addr));
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::testing::{MockEndpointClient, endpoints, test_backoff, watch_event};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    // diff_endpoints tests

    #[test]
    fn diff_inserts_new_endpoints() {
        let mut known = HashSet::new();
        let actions = diff_endpoints(&mut known, &[addr("10.0.0.1:50051"), addr("10.0.0.2:50051")]);

        assert_eq!(
            actions,
            vec![
                EndpointAction::Insert(addr("10.0.0.1:50051")),
                EndpointAction::Insert(addr("10.0.0.2:50051")),
            ]
        );
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn diff_skips_known_endpoints() {
        let mut known = HashSet::new();
        known.insert(addr("10.0.0.1:50051"));

        let actions = diff_endpoints(&mut known, &[addr("10.0.0.1:50051"), addr("10.0.0.2:50051")]);

        // Only 10.0.0.2 should be inserted since 10.0.0.1 is already known
        assert_eq!(actions, vec![EndpointAction::Insert(addr("10.0.0.2:50051"))]);
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn diff_removes_missing_endpoints() {
        let mut known = HashSet::new();
        known.insert(addr("10.0.0.1:50051"));
        known.insert(addr("10.0.0.2:50051"));

        let actions = diff_endpoints(&mut known, &[addr("10.0.0.2:50051"), addr("10.0.0.3:50051")]);

        assert_eq!(
            actions,
            vec![
                EndpointAction::Remove(addr("10.0.0.1:50051")),
                EndpointAction::Insert(addr("10.0.0.3:50051")),
            ]
        );
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn diff_empty_set_removes_everything() {
        let mut known = HashSet::new();
        known.insert(addr("10.0.0.2:50051"));
        known.insert(addr("10.0.0.1:50051"));

        let actions = diff_endpoints(&mut known, &[]);

        assert_eq!(
            actions,
            vec![
                EndpointAction::Remove(addr("10.0.0.1:50051")),
                EndpointAction::Remove(addr("10.0.0.2:50051")),
            ]
        );
        assert!(known.is_empty());
    }

    #[test]
    fn diff_unchanged_set_is_empty() {
        let mut known = HashSet::new();
        known.insert(addr("10.0.0.1:50051"));

        assert!(diff_endpoints(&mut known, &[addr("10.0.0.1:50051")]).is_empty());
    }

    // discover_with tests

    #[tokio::test]
    async fn discover_with_sends_changes() {
        let client = Arc::new(MockEndpointClient::default());
        client.push_snapshot(&endpoints("5", &["10.0.0.1"], &[(50051, "grpc")]));
        let mut stream = client.push_stream();

        let watcher = Resolver::from_shared(client.clone())
            .backoff(test_backoff())
            .resolve("service1.namespace1:grpc")
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        discover_with(watcher, tx, |addr| {
            Endpoint::from_shared(format!("http://{addr}")).unwrap()
        });

        let change = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(change, Change::Insert(a, _) if a == addr("10.0.0.1:50051")));

        // Malformed data is logged and skipped.
        stream.write_all(br#"{"type":"not-supported"}"#).await.unwrap();

        let modified = watch_event("MODIFIED", &endpoints("6", &["10.0.0.2"], &[(50051, "grpc")]));
        stream.write_all(&serde_json::to_vec(&modified).unwrap()).await.unwrap();

        let change = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(change, Change::Remove(a) if a == addr("10.0.0.1:50051")));

        let change = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(change, Change::Insert(a, _) if a == addr("10.0.0.2:50051")));
    }

    #[tokio::test]
    async fn discover_with_stops_when_watcher_closes() {
        let client = Arc::new(MockEndpointClient::default());
        let watcher = Resolver::from_shared(client)
            .backoff(test_backoff())
            .resolve("service1.namespace1")
            .unwrap();
        let closer = watcher.closer();

        let (tx, mut rx) = mpsc::channel(16);
        discover_with(watcher, tx, |addr| {
            Endpoint::from_shared(format!("http://{addr}")).unwrap()
        });

        closer.close();

        // The task drops its sender once it stops.
        let closed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }
}
