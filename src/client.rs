use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bb8::Pool;
use futures::future::BoxFuture;
use futures::FutureExt;
use gcp_auth::AuthenticationManager;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::classify::retry_delay;
use crate::connection::{grpc, CommitTransaction, Connection};
use crate::endpoint::EndpointResolver;
use crate::resumable::{Query, SessionSlot};
use crate::retry::retry_transient;
use crate::session::{SessionFailures, SessionLease, SessionPool};
use crate::{
    runner, Backoff, CommitResult, Config, ConfigBuilder, Context, Endpoint, Error,
    ErrorClassifier, Mutation, ReadOnlyTransaction, ResourceRouting, ResultStream, Session,
    SessionManager, Statement, TimestampBound, TransactionContext, TransactionSelector,
};

/// What every operation of a [`Client`] and its clones share.
pub(crate) struct Shared {
    pub(crate) pool: SessionPool,
    failures: SessionFailures,
    pub(crate) classifier: ErrorClassifier,
    pub(crate) backoff: Backoff,
    pub(crate) inline_begin: bool,
}

impl Shared {
    fn new(
        connection: Box<dyn Connection>,
        max_sessions: u32,
        session_acquire_timeout: Duration,
        classifier: ErrorClassifier,
        backoff: Backoff,
        inline_begin: bool,
    ) -> Self {
        let failures = SessionFailures::new();
        let manager = SessionManager::new(
            connection,
            backoff,
            classifier.clone(),
            session_acquire_timeout,
        );
        let pool = Pool::builder()
            .max_size(max_sessions)
            .connection_timeout(session_acquire_timeout)
            .retry_connection(false)
            .error_sink(Box::new(failures.clone()))
            .build_unchecked(manager);
        Self {
            pool,
            failures,
            classifier,
            backoff,
            inline_begin,
        }
    }

    /// Leases a session, waiting at most for the pool's acquire timeout.
    ///
    /// A failure to create a session while waiting ends the wait with that failure.
    pub(crate) async fn session(&self, ctx: &Context) -> Result<SessionLease, Error> {
        let mut failures = self.failures.subscribe();
        let lease = self.pool.get_owned();
        tokio::pin!(lease);
        ctx.run(async move {
            loop {
                tokio::select! {
                    biased;
                    leased = &mut lease => {
                        return leased.map_err(|err| {
                            last_failure(&mut failures).unwrap_or_else(|| err.into())
                        });
                    }
                    failure = failures.recv() => match failure {
                        Ok(err) => return Err(err.replay()),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return (&mut lease).await.map_err(Error::from),
                    },
                }
            }
        })
        .await?
    }
}

/// The most recent session creation failure not seen yet, if any.
fn last_failure(failures: &mut broadcast::Receiver<Arc<Error>>) -> Option<Error> {
    let mut last = None;
    loop {
        match failures.try_recv() {
            Ok(err) => last = Some(err),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return last.map(|err| err.replay()),
        }
    }
}

/// How [`Client::apply`] commits its mutations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    at_least_once: bool,
}

impl ApplyOptions {
    /// Commits in a single round trip without a prior read/write transaction.
    ///
    /// An aborted commit is retried, so the mutations may be applied more than once.
    pub fn at_least_once() -> Self {
        Self {
            at_least_once: true,
        }
    }
}

/// A Cloud Spanner client.
///
/// Clones share the same channel and session pool.
#[derive(Clone)]
pub struct Client {
    connection: Box<dyn Connection>,
    shared: Arc<Shared>,
    endpoint: Endpoint,
}

impl Client {
    /// Returns a builder for configuring and connecting a client.
    pub fn configure() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub(crate) async fn connect(config: Config, ctx: &Context) -> Result<Self, Error> {
        let auth = if config.authenticate {
            let manager = AuthenticationManager::new().await.map_err(|err| {
                Error::Config(format!("failed to initialize authentication: {}", err))
            })?;
            Some(Arc::new(manager))
        } else {
            None
        };

        let classifier = ErrorClassifier::new(config.transient_internal_messages);
        let resolver = EndpointResolver {
            default: config.endpoint,
            routing: config.resource_routing,
            discovery_timeout: config.endpoint_discovery_timeout,
            backoff: config.backoff,
            classifier: classifier.clone(),
        };
        let endpoint = match resolver.routing {
            ResourceRouting::Enabled => {
                let mut admin = ctx
                    .run(grpc::connect_admin(
                        &resolver.default,
                        config.tls_config.clone(),
                        auth.clone(),
                    ))
                    .await??;
                resolver
                    .resolve(admin.as_mut(), config.database.instance(), ctx)
                    .await?
            }
            ResourceRouting::Disabled => resolver.default.clone(),
        };

        log::debug!("connecting to {}", endpoint);
        let connection = ctx
            .run(grpc::connect(
                &endpoint,
                config.tls_config,
                auth,
                config.database,
            ))
            .await??;

        let shared = Shared::new(
            connection.clone(),
            config.max_sessions,
            config.session_acquire_timeout,
            classifier,
            config.backoff,
            config.inline_begin,
        );
        Ok(Self::from_parts(connection, shared, endpoint))
    }

    pub(crate) fn from_parts(
        connection: Box<dyn Connection>,
        shared: Shared,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            connection,
            shared: Arc::new(shared),
            endpoint,
        }
    }

    /// The endpoint this client is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Reads with strong consistency in single-use transactions.
    pub fn single(&self) -> ReadContext {
        self.read_context(None)
    }

    /// Reads in single-use transactions that observe the data as of `bound`.
    pub fn single_with_bound(&self, bound: TimestampBound) -> ReadContext {
        self.read_context(Some(bound))
    }

    fn read_context(&self, bound: Option<TimestampBound>) -> ReadContext {
        ReadContext {
            connection: self.connection.clone(),
            shared: self.shared.clone(),
            bound,
        }
    }

    /// Starts a read-only transaction with strong consistency.
    ///
    /// The transaction holds on to a session until it is dropped.
    pub async fn read_only_transaction(&self, ctx: &Context) -> Result<ReadOnlyTransaction, Error> {
        self.read_only(ctx, None).await
    }

    pub async fn read_only_transaction_with_bound(
        &self,
        ctx: &Context,
        bound: TimestampBound,
    ) -> Result<ReadOnlyTransaction, Error> {
        self.read_only(ctx, Some(bound)).await
    }

    async fn read_only(
        &self,
        ctx: &Context,
        bound: Option<TimestampBound>,
    ) -> Result<ReadOnlyTransaction, Error> {
        let session = self.shared.session(ctx).await?;
        Ok(ReadOnlyTransaction::new(
            self.connection.clone(),
            self.shared.clone(),
            session,
            bound,
        ))
    }

    /// Runs `body` in a read/write transaction and commits it.
    ///
    /// The body is invoked again, with a new transaction, each time Cloud Spanner aborts the
    /// previous one. Any other error, including the body's own, rolls back and is returned.
    ///
    /// ```no_run
    /// # use spanner_rs::*;
    /// # use futures::FutureExt;
    /// # async fn run(client: Client) -> Result<(), Error> {
    /// let result = client
    ///     .read_write_transaction(&Context::background(), |tx| {
    ///         async move {
    ///             tx.execute_update(&"UPDATE Singers SET Active = true WHERE SingerId = 1".into())
    ///                 .await
    ///         }
    ///         .boxed()
    ///     })
    ///     .await?;
    /// println!("updated {} rows at {:?}", result.value, result.timestamp);
    /// # Ok(()) }
    /// ```
    pub async fn read_write_transaction<T, E, F>(
        &self,
        ctx: &Context,
        body: F,
    ) -> Result<CommitResult<T>, E>
    where
        F: for<'t> FnMut(&'t mut TransactionContext) -> BoxFuture<'t, Result<T, E>>,
        E: std::error::Error + From<Error> + Send + 'static,
    {
        runner::run(self.connection.as_ref(), &self.shared, ctx, body).await
    }

    /// Applies `mutations` atomically and returns the commit timestamp.
    pub async fn apply(
        &self,
        ctx: &Context,
        mutations: Vec<Mutation>,
        options: ApplyOptions,
    ) -> Result<SystemTime, Error> {
        if options.at_least_once {
            return self.apply_at_least_once(ctx, mutations).await;
        }
        let result = self
            .read_write_transaction(ctx, move |tx| {
                tx.buffer_write(mutations.clone());
                async { Ok::<_, Error>(()) }.boxed()
            })
            .await?;
        Ok(result.timestamp)
    }

    async fn apply_at_least_once(
        &self,
        ctx: &Context,
        mutations: Vec<Mutation>,
    ) -> Result<SystemTime, Error> {
        let lease = self.shared.session(ctx).await?;
        let session: &Session = &lease;
        let mut attempt = 0;
        loop {
            ctx.check()?;
            let result = retry_transient(
                ctx,
                &self.shared.backoff,
                &self.shared.classifier,
                "Commit",
                || {
                    let mut connection = self.connection.clone();
                    let mutations = mutations.clone();
                    async move {
                        connection
                            .commit(session, CommitTransaction::SingleUse, mutations)
                            .await
                    }
                },
            )
            .await;
            let err = match result {
                Ok(timestamp) => return Ok(timestamp),
                Err(err) => err,
            };

            let classification = self.shared.classifier.classify(&err);
            if !classification.is_abort() {
                return Err(err);
            }
            let delay = classification
                .cause
                .and_then(retry_delay)
                .unwrap_or_else(|| self.shared.backoff.delay(attempt));
            log::debug!("single-use commit aborted, retrying in {:?}: {}", delay, err);
            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }
}

/// Runs queries in single-use read-only transactions.
pub struct ReadContext {
    connection: Box<dyn Connection>,
    shared: Arc<Shared>,
    bound: Option<TimestampBound>,
}

impl ReadContext {
    /// Starts `statement`, leasing a session for as long as the returned stream is read.
    pub fn execute_query(&self, ctx: &Context, statement: &Statement) -> ResultStream<'static> {
        ResultStream::new(
            self.connection.clone(),
            self.shared.clone(),
            ctx.clone(),
            Query {
                statement: statement.clone(),
                seqno: None,
                session: SessionSlot::Pending,
                selector: TransactionSelector::SingleUse(self.bound.clone()).into(),
                inline_begin: false,
            },
        )
    }
}

#[cfg(test)]
impl Client {
    pub(crate) async fn for_test(mock: &crate::testing::MockConnection) -> Client {
        let connection: Box<dyn Connection> = Box::new(mock.clone());
        let shared = Shared::new(
            connection.clone(),
            10,
            Duration::from_secs(30),
            ErrorClassifier::default(),
            Backoff::default(),
            true,
        );
        Client::from_parts(connection, shared, Endpoint::default())
    }

    pub(crate) fn idle_sessions(&self) -> u32 {
        self.shared.pool.state().idle_connections
    }
}
