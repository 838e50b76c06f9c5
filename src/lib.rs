#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes endpoint resolution for RPC load balancing.
//!
//! When using gRPC (HTTP/2) with Kubernetes, standard `ClusterIP` services don't load balance
//! effectively because HTTP/2 multiplexes all requests over a single long-lived TCP connection.
//! This crate resolves a service name into the live list of pod addresses behind it, by
//! watching the service's `Endpoints` resource over a long-lived streaming connection.
//!
//! # Features
//!
//! - **Live resolution**: An initial snapshot followed by every change, applied in order
//! - **Transparent reconnects**: Broken watch streams resume from the last seen `resourceVersion`
//!   after a bounded exponential backoff
//! - **Port selection**: Resolve every port of a service, or only a numbered or named one
//! - **tonic integration**: Feed address changes straight into a balance channel
//!
//! # Usage
//!
//! ```ignore
//! use k8s_endpoint_resolver::{KubeEndpointClient, Resolver};
//!
//! let client = KubeEndpointClient::try_default().await?;
//! let mut watcher = Resolver::new(client).resolve("my-grpc-service.my-namespace:grpc")?;
//!
//! // The first update is the current state; later ones follow every change.
//! let addrs = watcher.next().await?;
//!
//! // Stop watching.
//! watcher.close();
//! ```
//!
//! With a tonic balance channel:
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use k8s_endpoint_resolver::discover;
//!
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//!
//! discover("my-grpc-service.my-namespace:grpc".parse()?, tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! });
//!
//! // let client = MyServiceClient::new(channel);
//! ```

mod balance;
mod client;
mod error;
mod event;
mod k8s;
mod resolver;
mod stream;
mod target;

#[cfg(test)]
mod testing;

pub use balance::{discover, discover_with};
pub use client::{BoxError, ByteStream, EndpointClient};
pub use error::{Error, Result, WatchError};
pub use event::{ChangeEvent, ChangeResult, RemoteStatus, ResourceVersion, StatusMeta};
pub use k8s::{
    ApiSettings, KubeEndpointClient, SERVICE_ACCOUNT_CA_FILE, SERVICE_ACCOUNT_TOKEN_FILE,
    TokenSource,
};
pub use resolver::{Closer, Resolver, Watcher, resolved_addresses};
pub use stream::{BackoffSettings, StreamWatcher, WatchHandle};
pub use target::{Port, Target};
