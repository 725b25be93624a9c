use std::time::SystemTime;

use async_trait::async_trait;
use dyn_clone::DynClone;
use futures::stream::BoxStream;

use crate::{
    Error, InstanceId, Mutation, ResumeToken, Session, Statement, Transaction, TransactionMode,
    TransactionSelector,
};

/// The column names and, for inline begins, the transaction that a query started.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ResultMetadata {
    pub(crate) columns: Vec<String>,
    pub(crate) transaction: Option<Transaction>,
}

/// One message of a streaming query.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PartialResult {
    pub(crate) metadata: Option<ResultMetadata>,
    pub(crate) values: Vec<prost_types::Value>,
    /// The last value is incomplete and continues in the next message.
    pub(crate) chunked_value: bool,
    pub(crate) resume_token: Option<ResumeToken>,
    pub(crate) row_count: Option<i64>,
}

pub(crate) type PartialResultStream = BoxStream<'static, Result<PartialResult, Error>>;

/// What a commit applies to.
#[derive(Clone, Debug)]
pub(crate) enum CommitTransaction {
    Id(Transaction),
    /// Begin and commit in a single round trip; may apply more than once if retried.
    SingleUse,
}

#[async_trait]
pub(crate) trait Connection
where
    Self: DynClone + Send + Sync,
{
    async fn create_session(&mut self) -> Result<Session, Error>;
    async fn begin_transaction(
        &mut self,
        session: &Session,
        mode: &TransactionMode,
    ) -> Result<Transaction, Error>;
    async fn execute_streaming_sql(
        &mut self,
        session: &Session,
        selector: &TransactionSelector,
        statement: &Statement,
        resume_token: Option<&ResumeToken>,
        seqno: Option<i64>,
    ) -> Result<PartialResultStream, Error>;
    async fn commit(
        &mut self,
        session: &Session,
        transaction: CommitTransaction,
        mutations: Vec<Mutation>,
    ) -> Result<SystemTime, Error>;
    async fn rollback(&mut self, session: &Session, transaction: &Transaction)
        -> Result<(), Error>;
}

dyn_clone::clone_trait_object!(Connection);

/// The single instance admin read used to discover resource-specific endpoints.
#[async_trait]
pub(crate) trait InstanceAdmin
where
    Self: Send,
{
    async fn get_instance_endpoints(&mut self, instance: &InstanceId)
        -> Result<Vec<String>, Error>;
}

pub(crate) mod grpc;
