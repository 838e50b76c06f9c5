//! Prints the addresses of a Kubernetes service as they change.
//!
//! # Running
//!
//! Works inside a pod (service account credentials) or anywhere a kubeconfig is
//! available:
//!
//! ```text
//! RUST_LOG=k8s_endpoint_resolver=debug \
//!     cargo run --example watch-endpoints -- greeter-server.default:grpc
//! ```
//!
//! # Environment Variables
//!
//! - `TARGET`: Target to resolve when no argument is given (default: kubernetes.default:https)
//! - `KUBE_API_URL`: API server URL; when set, explicit settings are used instead of kubeconfig
//! - `KUBE_TLS_INSECURE`: Skip server certificate verification (default: false)
//! - `KUBE_TOKEN_FILE`: Bearer token file (default: service account token)
//! - `KUBECONFIG_USER`: Kubeconfig user to authenticate as (takes precedence over the token)

use std::env;

use k8s_endpoint_resolver::{ApiSettings, Error, KubeEndpointClient, Resolver};
use tracing::{Level, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let target = env::args()
        .nth(1)
        .or_else(|| env::var("TARGET").ok())
        .unwrap_or_else(|| "kubernetes.default:https".to_string());

    let client = match env::var("KUBE_API_URL") {
        Ok(url) => {
            let mut settings = ApiSettings::new(url);
            if env::var("KUBE_TLS_INSECURE").is_ok_and(|v| v == "true") {
                settings = settings.insecure_skip_verify();
            }
            if let Ok(path) = env::var("KUBE_TOKEN_FILE") {
                settings = settings.token_file(path);
            }
            if let Ok(user) = env::var("KUBECONFIG_USER") {
                settings = settings.kubeconfig_user(user, None);
            }
            KubeEndpointClient::from_settings(settings).await?
        }
        Err(_) => KubeEndpointClient::try_default().await?,
    };

    let mut watcher = Resolver::new(client).resolve(&target)?;
    info!("Resolving {}", watcher.target());

    let closer = watcher.closer();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            closer.close();
        }
    });

    loop {
        match watcher.next().await {
            Ok(addrs) => {
                let addrs: Vec<String> = addrs.iter().map(ToString::to_string).collect();
                info!("{} endpoints: [{}]", addrs.len(), addrs.join(", "));
            }
            Err(e) if e.is_closed() => break,
            Err(Error::Watch(e)) if e.is_stream_termination() => {
                warn!("watch stream interrupted, reconnecting: {e}");
            }
            Err(e) => error!("watch error: {e}"),
        }
    }

    info!("Done");
    Ok(())
}
