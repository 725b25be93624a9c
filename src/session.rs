use std::sync::Arc;
use std::time::Duration;

use bb8::{ErrorSink, ManageConnection, Pool, PooledConnection};
use tokio::sync::broadcast;

use crate::connection::Connection;
use crate::retry::retry_transient;
use crate::{Backoff, Context, Error, ErrorClassifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Session(String);

impl Session {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A session leased from the pool, handed back when dropped.
pub(crate) type SessionLease = PooledConnection<'static, SessionManager>;

pub(crate) type SessionPool = Pool<SessionManager>;

/// Creates sessions for the `bb8` pool; the pool owns leasing and release.
///
/// Transient `CreateSession` failures are retried here, within `timeout`. The pool itself never
/// retries, other failures go to [`SessionFailures`].
pub(crate) struct SessionManager {
    connection: Box<dyn Connection>,
    backoff: Backoff,
    classifier: ErrorClassifier,
    timeout: Duration,
}

impl SessionManager {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        backoff: Backoff,
        classifier: ErrorClassifier,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            backoff,
            classifier,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl ManageConnection for SessionManager {
    type Connection = Session;
    type Error = Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let ctx = Context::background().with_timeout(self.timeout);
        let session = retry_transient(
            &ctx,
            &self.backoff,
            &self.classifier,
            "CreateSession",
            || {
                let mut connection = self.connection.clone();
                async move { connection.create_session().await }
            },
        )
        .await?;
        log::debug!("created session {}", session.name());
        Ok(session)
    }

    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Broadcasts the errors of session creation, which the pool runs in background tasks, to the
/// callers waiting for a session.
#[derive(Clone, Debug)]
pub(crate) struct SessionFailures(broadcast::Sender<Arc<Error>>);

impl SessionFailures {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self(sender)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<Error>> {
        self.0.subscribe()
    }
}

impl ErrorSink<Error> for SessionFailures {
    fn sink(&self, error: Error) {
        log::debug!("failed to create session: {}", error);
        // No receiver means nobody is waiting for a session.
        let _ = self.0.send(Arc::new(error));
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<Error>> {
        Box::new(self.clone())
    }
}
