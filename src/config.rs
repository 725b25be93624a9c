use std::time::Duration;

use derive_builder::Builder;
use tonic::transport::ClientTlsConfig;

use crate::classify::DEFAULT_TRANSIENT_INTERNAL_MESSAGES;
use crate::{Backoff, Client, Context, DatabaseId, Endpoint, Error, ResourceRouting};

fn default_transient_internal_messages() -> Vec<String> {
    DEFAULT_TRANSIENT_INTERNAL_MESSAGES
        .iter()
        .map(|message| message.to_string())
        .collect()
}

/// Configuration for building a `Client`.
///
/// # Example
///
/// ```no_run
/// # use spanner_rs::*;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Error> {
/// let client = Client::configure()
///     .database(DatabaseId::parse("projects/my-project/instances/my-instance/databases/my-db")?)
///     .max_sessions(25_u32)
///     .connect()
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", build_fn(error = "crate::Error"))]
pub struct Config {
    /// The database to connect to.
    pub(crate) database: DatabaseId,

    /// The endpoint used when resource-based routing is disabled or finds nothing.
    /// Defaults to `https://spanner.googleapis.com`.
    #[builder(setter(into), default)]
    pub(crate) endpoint: Endpoint,

    /// TLS settings of the channel, the default root certificates are used when absent and the
    /// endpoint is `https`.
    #[builder(setter(strip_option), default)]
    pub(crate) tls_config: Option<ClientTlsConfig>,

    /// Attach credentials found through `gcp_auth` to every request. Defaults to `true`.
    #[builder(default = "true")]
    pub(crate) authenticate: bool,

    /// The size of the session pool. Defaults to 10.
    #[builder(default = "10")]
    pub(crate) max_sessions: u32,

    /// How long to wait for a session when the pool is exhausted. Defaults to 30 seconds.
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) session_acquire_timeout: Duration,

    /// Defaults to the value of `GOOGLE_CLOUD_SPANNER_ENABLE_RESOURCE_BASED_ROUTING`.
    #[builder(default = "ResourceRouting::from_env()")]
    pub(crate) resource_routing: ResourceRouting,

    /// Bounds the lookup of the instance's endpoint. Defaults to 30 seconds.
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) endpoint_discovery_timeout: Duration,

    #[builder(default)]
    pub(crate) backoff: Backoff,

    /// Begin read/write transactions with their first statement rather than with a separate
    /// round trip. Defaults to `true`.
    #[builder(default = "true")]
    pub(crate) inline_begin: bool,

    /// `INTERNAL` errors whose message contains one of these are retried like `UNAVAILABLE`.
    #[builder(default = "default_transient_internal_messages()")]
    pub(crate) transient_internal_messages: Vec<String>,
}

impl ConfigBuilder {
    /// Targets a Cloud Spanner emulator listening on `localhost`.
    pub fn with_emulator_grpc_port(self, port: u16) -> Self {
        self.endpoint(format!("http://localhost:{}", port))
            .authenticate(false)
            .resource_routing(ResourceRouting::Disabled)
    }

    pub async fn connect(self) -> Result<Client, Error> {
        self.connect_with(&Context::background()).await
    }

    /// Connects within `ctx`, which bounds the endpoint discovery and the channel setup.
    pub async fn connect_with(self, ctx: &Context) -> Result<Client, Error> {
        Client::connect(self.build()?, ctx).await
    }
}
