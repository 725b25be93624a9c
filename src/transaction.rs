use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use google_api_proto::google::spanner::v1 as proto;

use crate::connection::{CommitTransaction, Connection};
use crate::resumable::Query;
use crate::retry::retry_transient;
use crate::session::SessionLease;
use crate::{Context, Error, ResultStream, Session, Shared, Statement};

/// A write to apply at commit time.
pub type Mutation = proto::Mutation;

#[derive(Clone, Debug, PartialEq)]
pub enum TimestampBound {
    Strong,
    ReadTimestamp(SystemTime),
    MinReadTimestamp(SystemTime),
    ExactStaleness(Duration),
    MaxStaleness(Duration),
}

fn duration(value: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: value.as_secs() as i64,
        nanos: value.subsec_nanos() as i32,
    }
}

impl From<TimestampBound> for proto::transaction_options::read_only::TimestampBound {
    fn from(value: TimestampBound) -> Self {
        use proto::transaction_options::read_only::TimestampBound as Bound;
        match value {
            TimestampBound::Strong => Bound::Strong(true),
            TimestampBound::ReadTimestamp(timestamp) => Bound::ReadTimestamp(timestamp.into()),
            TimestampBound::MinReadTimestamp(timestamp) => {
                Bound::MinReadTimestamp(timestamp.into())
            }
            TimestampBound::MaxStaleness(staleness) => Bound::MaxStaleness(duration(staleness)),
            TimestampBound::ExactStaleness(staleness) => {
                Bound::ExactStaleness(duration(staleness))
            }
        }
    }
}

/// The kind of transaction to begin.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TransactionMode {
    ReadOnly(Option<TimestampBound>),
    ReadWrite,
}

impl From<TransactionMode> for proto::TransactionOptions {
    fn from(value: TransactionMode) -> Self {
        let mode = match value {
            TransactionMode::ReadOnly(bound) => {
                proto::transaction_options::Mode::ReadOnly(proto::transaction_options::ReadOnly {
                    timestamp_bound: bound.map(Into::into),
                    ..Default::default()
                })
            }
            TransactionMode::ReadWrite => proto::transaction_options::Mode::ReadWrite(
                proto::transaction_options::ReadWrite::default(),
            ),
        };
        proto::TransactionOptions {
            mode: Some(mode),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TransactionSelector {
    SingleUse(Option<TimestampBound>),
    /// Not begun yet.
    Begin(TransactionMode),
    Id(Transaction),
}

impl From<TransactionSelector> for proto::TransactionSelector {
    fn from(value: TransactionSelector) -> Self {
        let selector = match value {
            TransactionSelector::SingleUse(bound) => proto::transaction_selector::Selector::SingleUse(
                TransactionMode::ReadOnly(bound).into(),
            ),
            TransactionSelector::Begin(mode) => {
                proto::transaction_selector::Selector::Begin(mode.into())
            }
            TransactionSelector::Id(tx) => {
                proto::transaction_selector::Selector::Id(tx.id.clone().into())
            }
        };
        proto::TransactionSelector {
            selector: Some(selector),
        }
    }
}

/// A transaction handle assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transaction {
    id: Vec<u8>,
}

impl Transaction {
    pub(crate) fn new(id: impl Into<Vec<u8>>) -> Self {
        Self { id: id.into() }
    }

    pub(crate) fn id(&self) -> &[u8] {
        &self.id
    }
}

/// Begins a transaction explicitly, retrying transient failures of the RPC alone.
pub(crate) async fn begin(
    connection: &dyn Connection,
    session: &Session,
    mode: &TransactionMode,
    ctx: &Context,
    shared: &Shared,
) -> Result<Transaction, Error> {
    retry_transient(ctx, &shared.backoff, &shared.classifier, "BeginTransaction", || {
        let mut connection = dyn_clone::clone_box(connection);
        async move { connection.begin_transaction(session, mode).await }
    })
    .await
}

/// The outcome of a committed read/write transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitResult<T> {
    /// What the transaction body returned on its successful attempt.
    pub value: T,
    pub timestamp: SystemTime,
    /// The number of times the body was executed.
    pub attempts: usize,
}

/// The handle given to a read/write transaction body for one attempt.
///
/// The body may run several times: everything done through this handle is discarded when an
/// attempt aborts, but effects outside of it are not.
pub struct TransactionContext {
    connection: Box<dyn Connection>,
    shared: Arc<Shared>,
    session: SessionLease,
    ctx: Context,
    selector: TransactionSelector,
    mutations: Vec<Mutation>,
    seqno: i64,
    attempt: usize,
}

impl TransactionContext {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        shared: Arc<Shared>,
        session: SessionLease,
        ctx: Context,
        attempt: usize,
    ) -> Self {
        Self {
            connection,
            shared,
            session,
            ctx,
            selector: TransactionSelector::Begin(TransactionMode::ReadWrite),
            mutations: Vec::new(),
            seqno: 0,
            attempt,
        }
    }

    /// The context bounding the whole transaction, including its retries.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The 0-based number of this attempt.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Runs a query within this transaction.
    pub fn execute_query(&mut self, statement: &Statement) -> ResultStream<'_> {
        self.stream(statement, None)
    }

    /// Runs a DML statement within this transaction and returns the number of modified rows.
    pub async fn execute_update(&mut self, statement: &Statement) -> Result<i64, Error> {
        self.seqno += 1;
        let seqno = Some(self.seqno);
        let mut stream = self.stream(statement, seqno);
        while stream.next().await?.is_some() {}
        stream
            .row_count()
            .ok_or_else(|| Error::Codec("missing row count in DML response".to_string()))
    }

    /// Buffers mutations, they are sent to the server with the commit.
    pub fn buffer_write(&mut self, mutations: impl IntoIterator<Item = Mutation>) {
        self.mutations.extend(mutations);
    }

    fn stream(&mut self, statement: &Statement, seqno: Option<i64>) -> ResultStream<'_> {
        let inline_begin = self.shared.inline_begin;
        ResultStream::new(
            self.connection.clone(),
            self.shared.clone(),
            self.ctx.clone(),
            Query {
                statement: statement.clone(),
                seqno,
                session: (&*self.session).into(),
                selector: (&mut self.selector).into(),
                inline_begin,
            },
        )
    }

    async fn ensure_begun(&mut self) -> Result<Transaction, Error> {
        match &self.selector {
            TransactionSelector::Id(tx) => Ok(tx.clone()),
            TransactionSelector::Begin(mode) => {
                let tx = begin(
                    self.connection.as_ref(),
                    &self.session,
                    mode,
                    &self.ctx,
                    &self.shared,
                )
                .await?;
                self.selector = TransactionSelector::Id(tx.clone());
                Ok(tx)
            }
            TransactionSelector::SingleUse(_) => Err(Error::Client(
                "cannot commit a single-use transaction".to_string(),
            )),
        }
    }

    pub(crate) async fn commit(&mut self) -> Result<SystemTime, Error> {
        let tx = self.ensure_begun().await?;
        let connection = self.connection.as_ref();
        let session: &Session = &self.session;
        let mutations = &self.mutations;
        retry_transient(
            &self.ctx,
            &self.shared.backoff,
            &self.shared.classifier,
            "Commit",
            || {
                let mut connection = dyn_clone::clone_box(connection);
                let tx = tx.clone();
                let mutations = mutations.clone();
                async move {
                    connection
                        .commit(session, CommitTransaction::Id(tx), mutations)
                        .await
                }
            },
        )
        .await
    }

    /// Rolls back a begun transaction, failures are only logged.
    pub(crate) async fn rollback(&mut self) {
        if let TransactionSelector::Id(tx) = &self.selector {
            let mut connection = self.connection.clone();
            let result = self
                .ctx
                .run(connection.rollback(&self.session, tx))
                .await
                .and_then(|result| result);
            if let Err(err) = result {
                log::debug!("failed to roll back transaction: {}", err);
            }
        }
    }

    /// Discards the attempt's transaction and buffered mutations, keeping the session.
    pub(crate) fn into_session(self) -> SessionLease {
        self.session
    }
}

/// A read-only transaction: several reads that observe the same snapshot.
///
/// The transaction is begun with the first query.
pub struct ReadOnlyTransaction {
    connection: Box<dyn Connection>,
    shared: Arc<Shared>,
    session: SessionLease,
    selector: TransactionSelector,
}

impl ReadOnlyTransaction {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        shared: Arc<Shared>,
        session: SessionLease,
        bound: Option<TimestampBound>,
    ) -> Self {
        Self {
            connection,
            shared,
            session,
            selector: TransactionSelector::Begin(TransactionMode::ReadOnly(bound)),
        }
    }

    pub fn execute_query(&mut self, ctx: &Context, statement: &Statement) -> ResultStream<'_> {
        ResultStream::new(
            self.connection.clone(),
            self.shared.clone(),
            ctx.clone(),
            Query {
                statement: statement.clone(),
                seqno: None,
                session: (&*self.session).into(),
                selector: (&mut self.selector).into(),
                inline_begin: false,
            },
        )
    }

    /// Ends the transaction and hands the session back to the pool.
    pub fn close(self) {}
}
