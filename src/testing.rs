//! In-memory [`EndpointClient`] used by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::io::DuplexStream;
use tokio::time::Instant;

use crate::client::{BoxError, ByteStream, EndpointClient};
use crate::event::ResourceVersion;
use crate::stream::BackoffSettings;
use crate::target::Target;

/// Hands out pre-registered pipes and records every request.
///
/// Once the registered streams or snapshots run out, further requests never complete.
#[derive(Default)]
pub(crate) struct MockEndpointClient {
    streams: Mutex<VecDeque<DuplexStream>>,
    snapshots: Mutex<VecDeque<Vec<u8>>>,
    failures: Mutex<usize>,
    stream_calls: Mutex<Vec<(Target, ResourceVersion, Instant)>>,
    unary_calls: Mutex<Vec<(Target, ResourceVersion)>>,
}

impl MockEndpointClient {
    /// Registers the next change stream and returns its writing end.
    pub(crate) fn push_stream(&self) -> DuplexStream {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        self.streams.lock().unwrap().push_back(reader);
        writer
    }

    /// Registers the body of the next snapshot fetch.
    pub(crate) fn push_snapshot_bytes(&self, body: impl Into<Vec<u8>>) {
        self.snapshots.lock().unwrap().push_back(body.into());
    }

    /// Registers the next snapshot fetch.
    pub(crate) fn push_snapshot(&self, endpoints: &Endpoints) {
        self.push_snapshot_bytes(serde_json::to_vec(endpoints).unwrap());
    }

    /// Makes the next `n` change stream requests fail to connect.
    pub(crate) fn fail_next_connects(&self, n: usize) {
        *self.failures.lock().unwrap() = n;
    }

    /// Resource versions of all change stream requests so far.
    pub(crate) fn stream_calls(&self) -> Vec<ResourceVersion> {
        self.stream_calls.lock().unwrap().iter().map(|(_, v, _)| *v).collect()
    }

    /// When each change stream request was made.
    pub(crate) fn stream_call_times(&self) -> Vec<Instant> {
        self.stream_calls.lock().unwrap().iter().map(|(_, _, at)| *at).collect()
    }

    /// Number of snapshot requests so far.
    pub(crate) fn unary_calls(&self) -> usize {
        self.unary_calls.lock().unwrap().len()
    }

    /// Waits until at least `n` change stream requests were made.
    pub(crate) async fn wait_for_stream_calls(&self, n: usize) -> Vec<ResourceVersion> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let calls = self.stream_calls();
                if calls.len() >= n {
                    return calls;
                }

                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for change stream requests")
    }
}

impl EndpointClient for MockEndpointClient {
    async fn start_change_stream(
        &self,
        target: &Target,
        since: ResourceVersion,
    ) -> Result<ByteStream, BoxError> {
        self.stream_calls
            .lock()
            .unwrap()
            .push((target.clone(), since, Instant::now()));

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            let fail = *failures > 0;
            *failures = failures.saturating_sub(1);
            fail
        };

        if fail {
            return Err("connection refused".into());
        }

        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(reader) => Ok(Box::pin(reader)),
            None => std::future::pending().await,
        }
    }

    async fn start_single_unary(
        &self,
        target: &Target,
        version: ResourceVersion,
    ) -> Result<ByteStream, BoxError> {
        self.unary_calls.lock().unwrap().push((target.clone(), version));

        let next = self.snapshots.lock().unwrap().pop_front();
        match next {
            Some(body) => Ok(Box::pin(std::io::Cursor::new(body))),
            None => std::future::pending().await,
        }
    }
}

/// Backoff short enough for tests.
pub(crate) fn test_backoff() -> BackoffSettings {
    BackoffSettings::new(Duration::from_millis(10), Duration::from_millis(10))
}

/// An `Endpoints` object with a single subset.
pub(crate) fn endpoints(version: &str, ips: &[&str], ports: &[(i32, &str)]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some("service1".to_string()),
            namespace: Some("namespace1".to_string()),
            resource_version: Some(version.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![subset(ips, ports)]),
    }
}

/// One subset with the given addresses and `(port, name)` pairs.
pub(crate) fn subset(ips: &[&str], ports: &[(i32, &str)]) -> EndpointSubset {
    EndpointSubset {
        addresses: Some(
            ips.iter()
                .map(|ip| EndpointAddress {
                    ip: (*ip).to_string(),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(
            ports
                .iter()
                .map(|(port, name)| EndpointPort {
                    port: *port,
                    name: Some((*name).to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

/// A wire-format watch event.
pub(crate) fn watch_event(event_type: &str, endpoints: &Endpoints) -> serde_json::Value {
    serde_json::json!({ "type": event_type, "object": endpoints })
}

/// A wire-format `ADDED` event for one address and port.
pub(crate) fn added_event(version: &str, ip: &str, port: i32, name: &str) -> serde_json::Value {
    watch_event("ADDED", &endpoints(version, &[ip], &[(port, name)]))
}
