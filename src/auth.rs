use std::{future::Future, pin::Pin, sync::Arc};

use gcp_auth::AuthenticationManager;
use http::HeaderValue;
use tower::{filter::AsyncPredicate, BoxError};

use crate::Error;

const CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";
const SPANNER_DATA: &str = "https://www.googleapis.com/auth/spanner.data";
const SPANNER_ADMIN: &str = "https://www.googleapis.com/auth/spanner.admin";

/// The OAuth scopes requested for a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scopes {
    Database,
    /// Instance reads, used to discover endpoints.
    Admin,
}

impl Scopes {
    fn as_slice(&self) -> &'static [&'static str] {
        match self {
            Scopes::Database => &[CLOUD_PLATFORM, SPANNER_DATA],
            Scopes::Admin => &[CLOUD_PLATFORM, SPANNER_ADMIN],
        }
    }
}

fn bearer(token: &str) -> Result<HeaderValue, Error> {
    let mut header = HeaderValue::try_from(format!("Bearer {}", token))
        .map_err(|err| Error::Client(format!("invalid auth token: {}", err)))?;
    header.set_sensitive(true);
    Ok(header)
}

/// Adds a bearer token to every request of a channel.
///
/// Tokens are cached and refreshed by the shared `AuthenticationManager`.
#[derive(Clone)]
pub(crate) struct AuthFilter {
    auth_manager: Arc<AuthenticationManager>,
    scopes: Scopes,
}

impl AuthFilter {
    pub(crate) fn new(auth_manager: Arc<AuthenticationManager>, scopes: Scopes) -> Self {
        Self {
            auth_manager,
            scopes,
        }
    }
}

impl AsyncPredicate<http::Request<tonic::body::BoxBody>> for AuthFilter {
    type Future = Pin<Box<dyn Future<Output = Result<Self::Request, BoxError>> + Send>>;

    type Request = http::Request<tonic::body::BoxBody>;

    fn check(&mut self, request: http::Request<tonic::body::BoxBody>) -> Self::Future {
        let auth_manager = self.auth_manager.clone();
        let scopes = self.scopes;
        Box::pin(async move {
            let token = auth_manager
                .get_token(scopes.as_slice())
                .await
                .map_err(|err| Error::Client(format!("failed to obtain access token: {}", err)))?;

            let (mut parts, body) = request.into_parts();
            parts
                .headers
                .insert(http::header::AUTHORIZATION, bearer(token.as_str())?);
            Ok(http::Request::from_parts(parts, body))
        })
    }
}
