use std::fmt;
use std::time::Duration;

use tonic::Code;

use crate::classify::ErrorKind;
use crate::connection::InstanceAdmin;
use crate::{Backoff, Context, Error, ErrorClassifier, InstanceId, SpannerResource};

pub const DEFAULT_ENDPOINT: &str = "https://spanner.googleapis.com";

/// Enables resource-based routing when set to a true value.
pub const RESOURCE_ROUTING_ENV: &str = "GOOGLE_CLOUD_SPANNER_ENABLE_RESOURCE_BASED_ROUTING";

/// The URI of the Spanner API a client talks to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(uri: &str) -> Self {
        Endpoint::new(uri)
    }
}

impl From<String> for Endpoint {
    fn from(uri: String) -> Self {
        Endpoint::new(uri)
    }
}

/// Whether the client asks the instance for a dedicated endpoint before connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceRouting {
    Enabled,
    Disabled,
}

impl Default for ResourceRouting {
    fn default() -> Self {
        ResourceRouting::Disabled
    }
}

impl ResourceRouting {
    /// Reads [`RESOURCE_ROUTING_ENV`].
    pub fn from_env() -> Self {
        match std::env::var(RESOURCE_ROUTING_ENV) {
            Ok(value) => Self::from_value(&value),
            Err(_) => ResourceRouting::Disabled,
        }
    }

    fn from_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => ResourceRouting::Enabled,
            _ => ResourceRouting::Disabled,
        }
    }
}

/// Picks the endpoint a client connects to.
pub(crate) struct EndpointResolver {
    pub(crate) default: Endpoint,
    pub(crate) routing: ResourceRouting,
    /// Bounds the whole discovery, retries included.
    pub(crate) discovery_timeout: Duration,
    pub(crate) backoff: Backoff,
    pub(crate) classifier: ErrorClassifier,
}

impl EndpointResolver {
    /// Returns the first endpoint of `instance`, or the default one when routing is disabled,
    /// the instance has none, or the lookup is denied or keeps failing transiently.
    ///
    /// Other lookup errors, and the expiry of `ctx` itself, are returned.
    pub(crate) async fn resolve(
        &self,
        admin: &mut dyn InstanceAdmin,
        instance: &InstanceId,
        ctx: &Context,
    ) -> Result<Endpoint, Error> {
        if self.routing == ResourceRouting::Disabled {
            return Ok(self.default.clone());
        }

        let discovery = ctx.with_timeout(self.discovery_timeout);
        let mut retry = 0;
        loop {
            let err = match discovery.run(admin.get_instance_endpoints(instance)).await {
                Ok(Ok(endpoints)) => return Ok(self.pick(instance, endpoints)),
                Ok(Err(err)) | Err(err) => err,
            };

            let classification = self.classifier.classify(&err);
            if classification.code == Code::PermissionDenied {
                log::warn!(
                    "permission denied while looking up the endpoint of {}, falling back to {}: {}",
                    instance.id(),
                    self.default,
                    err
                );
                return Ok(self.default.clone());
            }
            match classification.kind {
                ErrorKind::TransportTransient => {
                    let delay = self.backoff.delay(retry);
                    log::debug!(
                        "endpoint lookup failed with a transient error, retrying in {:?}: {}",
                        delay,
                        err
                    );
                    retry += 1;
                    if discovery.sleep(delay).await.is_ok() {
                        continue;
                    }
                }
                ErrorKind::DeadlineExceeded | ErrorKind::Canceled => {}
                _ => return Err(err),
            }

            // The discovery budget is spent. Only the caller's own context is an error.
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if let (Some(caller), Some(discovery)) = (ctx.deadline(), discovery.deadline()) {
                if caller <= discovery {
                    return Err(Error::DeadlineExceeded);
                }
            }
            log::warn!(
                "could not look up the endpoint of {}, falling back to {}: {}",
                instance.id(),
                self.default,
                err
            );
            return Ok(self.default.clone());
        }
    }

    fn pick(&self, instance: &InstanceId, endpoints: Vec<String>) -> Endpoint {
        match endpoints.into_iter().next() {
            Some(endpoint) => {
                log::debug!("using endpoint {} of {}", endpoint, instance.id());
                Endpoint::new(endpoint)
            }
            None => self.default.clone(),
        }
    }
}
