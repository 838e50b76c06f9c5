//! Kubernetes API access for `Endpoints` watches.
//!
//! [`KubeEndpointClient`] implements [`EndpointClient`] on top of a `kube`
//! client. It can be created from the ambient configuration (kubeconfig or
//! in-cluster service account, exactly as `kube::Client::try_default` does), or
//! from explicit [`ApiSettings`].
//!
//! # Credentials
//!
//! Two strategies are supported, in order of precedence:
//!
//! 1. A user profile from a kubeconfig file (`ApiSettings::kubeconfig_user`)
//! 2. A bearer token file, by default the pod's service account token
//!
//! # Example
//!
//! ```ignore
//! use k8s_endpoint_resolver::{ApiSettings, KubeEndpointClient, Resolver};
//!
//! let settings = ApiSettings::new("https://10.0.0.1:443").insecure_skip_verify();
//! let client = KubeEndpointClient::from_settings(settings).await?;
//! let mut watcher = Resolver::new(client).resolve("my-grpc-service.default:grpc")?;
//! ```

use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{GetParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::Request;
use kube::{Client, Config, Resource};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use tokio_util::compat::FuturesAsyncReadCompatExt;

use crate::client::{BoxError, ByteStream, EndpointClient};
use crate::error::{Error, Result};
use crate::event::ResourceVersion;
use crate::target::Target;

/// CA bundle mounted into every pod with a service account.
pub const SERVICE_ACCOUNT_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Token mounted into every pod with a service account.
pub const SERVICE_ACCOUNT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// How requests to the API server are authenticated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenSource {
    /// Reuse the auth section of a kubeconfig user.
    KubeconfigUser {
        /// Name of the user entry.
        user: String,
        /// Kubeconfig location; the default lookup is used when `None`.
        path: Option<PathBuf>,
    },
    /// Send the contents of a file as a bearer token.
    TokenFile(PathBuf),
}

/// Connection settings for the Kubernetes API server.
///
/// The defaults are designed for running within a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiSettings {
    /// API server URL, e.g. `https://10.0.0.1:443`.
    pub api_url: String,
    /// Skip server certificate verification. Not recommended.
    pub insecure_skip_verify: bool,
    /// PEM file with the CA certificates to trust. Required unless verification is skipped.
    pub ca_file: PathBuf,
    /// Bearer token file, used when no kubeconfig user is configured.
    pub token_file: PathBuf,
    /// Kubeconfig user whose auth section should be used.
    pub kubeconfig_user: Option<String>,
    /// Kubeconfig location for `kubeconfig_user`.
    pub kubeconfig_path: Option<PathBuf>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self::new(default_api_url(
            std::env::var("KUBERNETES_SERVICE_HOST").ok().as_deref(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok().as_deref(),
        ))
    }
}

impl ApiSettings {
    /// Creates settings for the given API server URL, with service account TLS and token.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            insecure_skip_verify: false,
            ca_file: PathBuf::from(SERVICE_ACCOUNT_CA_FILE),
            token_file: PathBuf::from(SERVICE_ACCOUNT_TOKEN_FILE),
            kubeconfig_user: None,
            kubeconfig_path: None,
        }
    }

    /// Settings for the API server of the cluster this process runs in.
    ///
    /// The URL is taken from `KUBERNETES_SERVICE_HOST` and `KUBERNETES_SERVICE_PORT`.
    #[must_use]
    pub fn in_cluster() -> Self {
        Self::default()
    }

    /// Disables server certificate verification.
    #[must_use]
    pub fn insecure_skip_verify(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }

    /// Sets the CA bundle to trust.
    #[must_use]
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = path.into();
        self
    }

    /// Sets the bearer token file.
    #[must_use]
    pub fn token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = path.into();
        self
    }

    /// Authenticates as a kubeconfig user instead of with the token file.
    #[must_use]
    pub fn kubeconfig_user(mut self, user: impl Into<String>, path: Option<PathBuf>) -> Self {
        self.kubeconfig_user = Some(user.into());
        self.kubeconfig_path = path;
        self
    }

    /// The credential strategy in effect. A kubeconfig user wins over the token file.
    #[must_use]
    pub fn credentials(&self) -> TokenSource {
        match &self.kubeconfig_user {
            Some(user) => TokenSource::KubeconfigUser {
                user: user.clone(),
                path: self.kubeconfig_path.clone(),
            },
            None => TokenSource::TokenFile(self.token_file.clone()),
        }
    }

    /// Builds a `kube` client configuration, reading all referenced files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL is missing or invalid, or the CA or
    /// token file cannot be read, and [`Error::Kubeconfig`] if the kubeconfig
    /// user cannot be loaded.
    pub async fn into_config(self) -> Result<Config> {
        if self.api_url.is_empty() || self.api_url == "https://:" {
            return Err(Error::Config(
                "API URL needs to be specified or KUBERNETES_SERVICE_HOST and \
                 KUBERNETES_SERVICE_PORT must be defined"
                    .to_string(),
            ));
        }

        let cluster_url: http::Uri = self
            .api_url
            .parse()
            .map_err(|e| Error::Config(format!("invalid API URL {:?}: {e}", self.api_url)))?;

        let mut config = Config::new(cluster_url);

        if self.insecure_skip_verify {
            config.accept_invalid_certs = true;
        } else {
            config.root_cert = Some(load_root_certs(&self.ca_file)?);
        }

        match self.credentials() {
            TokenSource::KubeconfigUser { user, path } => {
                let kubeconfig = match path {
                    Some(path) => Kubeconfig::read_from(path)?,
                    None => Kubeconfig::read()?,
                };

                let options = KubeConfigOptions {
                    user: Some(user),
                    ..Default::default()
                };

                let profile = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
                config.auth_info = profile.auth_info;
            }
            TokenSource::TokenFile(path) => {
                let token = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("failed to read token from {}: {e}", path.display()))
                })?;

                if token.trim().is_empty() {
                    return Err(Error::Config(format!("token file {} is empty", path.display())));
                }

                // kube re-reads the file when the token rotates.
                config.auth_info.token_file = Some(path.to_string_lossy().into_owned());
            }
        }

        Ok(config)
    }
}

/// Builds `https://host:port` from the in-cluster service environment.
fn default_api_url(host: Option<&str>, port: Option<&str>) -> String {
    let host = host.unwrap_or_default();
    let port = port.unwrap_or_default();
    if host.contains(':') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

/// Reads DER certificates from a PEM bundle.
fn load_root_certs(path: &Path) -> Result<Vec<Vec<u8>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| {
            Error::Config(format!("failed to parse root CA from {}: {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs.iter().map(|cert| cert.to_vec()).collect())
}

/// [`EndpointClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeEndpointClient {
    client: Client,
}

impl KubeEndpointClient {
    /// Wraps an existing `kube` client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a client from the ambient kubeconfig or in-cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Kube`] if no usable configuration is found.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// Creates a client from explicit settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid; see [`ApiSettings::into_config`].
    pub async fn from_settings(settings: ApiSettings) -> Result<Self> {
        let config = settings.into_config().await?;
        Ok(Self::new(Client::try_from(config)?))
    }
}

/// Base request for the `Endpoints` collection of the target's namespace.
fn endpoints_request(target: &Target) -> Request {
    Request::new(Endpoints::url_path(&(), Some(target.namespace())))
}

/// Watch request for the target's `Endpoints` object.
fn watch_request(
    target: &Target,
    since: ResourceVersion,
) -> std::result::Result<http::Request<Vec<u8>>, BoxError> {
    // Bookmark events carry no endpoints and would be reported as invalid events.
    let params = WatchParams::default()
        .fields(&format!("metadata.name={}", target.service()))
        .disable_bookmarks();
    Ok(endpoints_request(target).watch(&params, &since.to_string())?)
}

/// Get request for the target's `Endpoints` object.
fn get_request(
    target: &Target,
    version: ResourceVersion,
) -> std::result::Result<http::Request<Vec<u8>>, BoxError> {
    let params = if version == 0 {
        GetParams::default()
    } else {
        GetParams::at(&version.to_string())
    };

    Ok(endpoints_request(target).get(target.service(), &params)?)
}

impl EndpointClient for KubeEndpointClient {
    async fn start_change_stream(
        &self,
        target: &Target,
        since: ResourceVersion,
    ) -> std::result::Result<ByteStream, BoxError> {
        let request = watch_request(target, since)?;
        tracing::debug!("Starting Kubernetes endpoints watch: {}", request.uri());

        let body = self.client.request_stream(request).await?;
        Ok(Box::pin(body.compat()))
    }

    async fn start_single_unary(
        &self,
        target: &Target,
        version: ResourceVersion,
    ) -> std::result::Result<ByteStream, BoxError> {
        let request = get_request(target, version)?;
        tracing::debug!("Fetching Kubernetes endpoints: {}", request.uri());

        let body = self.client.request_stream(request).await?;
        Ok(Box::pin(body.compat()))
    }
}
