//! A scripted, in-memory transport for exercising retries without a server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::StreamExt;
use google_api_proto::google::rpc::{RetryInfo, Status as RpcStatus};
use prost::Message;
use prost_types::value::Kind;
use prost_types::Value;
use tonic::{Code, Status};

use crate::classify::RETRY_INFO_TYPE;
use crate::connection::{
    CommitTransaction, Connection, InstanceAdmin, PartialResult, PartialResultStream,
    ResultMetadata,
};
use crate::{
    Error, InstanceId, Mutation, ResumeToken, Session, Statement, Transaction, TransactionMode,
    TransactionSelector,
};

pub(crate) fn int64(value: i64) -> Value {
    string(&value.to_string())
}

pub(crate) fn string(value: &str) -> Value {
    Value {
        kind: Some(Kind::StringValue(value.to_string())),
    }
}

/// An `ABORTED` status carrying a `RetryInfo` detail.
pub(crate) fn aborted_with_retry_delay(delay: Duration) -> Status {
    let info = RetryInfo {
        retry_delay: Some(prost_types::Duration {
            seconds: delay.as_secs() as i64,
            nanos: delay.subsec_nanos() as i32,
        }),
    };
    let details = RpcStatus {
        code: Code::Aborted as i32,
        message: "Transaction aborted".to_string(),
        details: vec![prost_types::Any {
            type_url: RETRY_INFO_TYPE.to_string(),
            value: info.encode_to_vec().into(),
        }],
    };
    Status::with_details(
        Code::Aborted,
        "Transaction aborted",
        details.encode_to_vec().into(),
    )
}

/// The messages a query streams back.
///
/// Message `i` carries the resume token `i + 1` unless tokens are restricted with
/// [`MockQuery::with_tokens_at`]. A resumed stream restarts at the message following its token.
#[derive(Clone, Debug)]
pub(crate) struct MockQuery {
    columns: Vec<String>,
    messages: Vec<(Vec<Value>, bool)>,
    tokens: Option<Vec<usize>>,
    row_count: Option<i64>,
    delay: Option<Duration>,
}

impl MockQuery {
    /// One message per row.
    pub(crate) fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::chunks(columns, rows.into_iter().map(|row| (row, false)).collect())
    }

    /// Arbitrary messages, each with its values and `chunked_value` flag.
    pub(crate) fn chunks(columns: &[&str], messages: Vec<(Vec<Value>, bool)>) -> Self {
        Self {
            columns: columns.iter().map(|column| column.to_string()).collect(),
            messages,
            tokens: None,
            row_count: None,
            delay: None,
        }
    }

    /// A DML statement modifying `row_count` rows.
    pub(crate) fn dml(row_count: i64) -> Self {
        Self {
            row_count: Some(row_count),
            ..Self::chunks(&[], vec![(vec![], false)])
        }
    }

    pub(crate) fn with_tokens_at(self, positions: &[usize]) -> Self {
        Self {
            tokens: Some(positions.to_vec()),
            ..self
        }
    }

    /// Waits before sending each message.
    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    fn has_token(&self, position: usize) -> bool {
        match &self.tokens {
            Some(positions) => positions.contains(&position),
            None => true,
        }
    }
}

#[derive(Default)]
struct MockState {
    sessions: usize,
    transactions: usize,
    queries: HashMap<String, MockQuery>,
    failures: HashMap<&'static str, VecDeque<Status>>,
    stream_failures: HashMap<String, Vec<(usize, Status)>>,
    calls: HashMap<&'static str, usize>,
    resume_tokens: HashMap<String, Vec<Option<usize>>>,
    selectors: HashMap<String, Vec<&'static str>>,
    committed_mutations: Vec<usize>,
    single_use_commits: usize,
}

impl MockState {
    /// Records a call of `method` and returns its next scripted failure.
    fn call(&mut self, method: &'static str) -> Result<(), Error> {
        *self.calls.entry(method).or_default() += 1;
        match self.failures.get_mut(method).and_then(VecDeque::pop_front) {
            Some(status) => Err(Error::Status(status)),
            None => Ok(()),
        }
    }

    fn begin(&mut self) -> Transaction {
        self.transactions += 1;
        Transaction::new(format!("tx-{}", self.transactions).into_bytes())
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn put_query(&self, sql: &str, query: MockQuery) {
        self.state().queries.insert(sql.to_string(), query);
    }

    /// Fails the next call of `method` that has no earlier failure queued.
    pub(crate) fn fail_method(&self, method: &'static str, status: Status) {
        self.state()
            .failures
            .entry(method)
            .or_default()
            .push_back(status);
    }

    /// Breaks one stream of `sql` instead of sending the message at `position`.
    pub(crate) fn fail_stream_at(&self, sql: &str, position: usize, status: Status) {
        self.state()
            .stream_failures
            .entry(sql.to_string())
            .or_default()
            .push((position, status));
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    /// The resume token each execution of `sql` started from.
    pub(crate) fn resume_tokens(&self, sql: &str) -> Vec<Option<usize>> {
        self.state()
            .resume_tokens
            .get(sql)
            .cloned()
            .unwrap_or_default()
    }

    /// The kind of transaction selector of each execution of `sql`.
    pub(crate) fn selectors(&self, sql: &str) -> Vec<&'static str> {
        self.state().selectors.get(sql).cloned().unwrap_or_default()
    }

    /// The number of mutations of each commit.
    pub(crate) fn committed_mutations(&self) -> Vec<usize> {
        self.state().committed_mutations.clone()
    }

    pub(crate) fn single_use_commits(&self) -> usize {
        self.state().single_use_commits
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_session(&mut self) -> Result<Session, Error> {
        let mut state = self.state();
        state.call("CreateSession")?;
        state.sessions += 1;
        Ok(Session::new(format!(
            "projects/test-project/instances/test-instance/databases/test-db/sessions/{}",
            state.sessions
        )))
    }

    async fn begin_transaction(
        &mut self,
        _session: &Session,
        _mode: &TransactionMode,
    ) -> Result<Transaction, Error> {
        let mut state = self.state();
        state.call("BeginTransaction")?;
        Ok(state.begin())
    }

    async fn execute_streaming_sql(
        &mut self,
        _session: &Session,
        selector: &TransactionSelector,
        statement: &Statement,
        resume_token: Option<&ResumeToken>,
        _seqno: Option<i64>,
    ) -> Result<PartialResultStream, Error> {
        let (items, delay) = {
            let mut state = self.state();
            state.call("ExecuteStreamingSql")?;
            let sql = statement.sql();
            let query = state.queries.get(sql).cloned().ok_or_else(|| {
                Error::Status(Status::invalid_argument(format!("unexpected SQL: {}", sql)))
            })?;

            let start = resume_token
                .and_then(|token| std::str::from_utf8(token.as_bytes()).ok())
                .and_then(|token| token.parse::<usize>().ok());
            state
                .resume_tokens
                .entry(sql.to_string())
                .or_default()
                .push(start);
            let (label, begun) = match selector {
                TransactionSelector::SingleUse(_) => ("single-use", None),
                TransactionSelector::Begin(_) => ("begin", Some(state.begin())),
                TransactionSelector::Id(_) => ("id", None),
            };
            state
                .selectors
                .entry(sql.to_string())
                .or_default()
                .push(label);

            let failures = state.stream_failures.entry(sql.to_string()).or_default();
            let mut items = Vec::new();
            for position in start.unwrap_or(0)..=query.messages.len() {
                if let Some(idx) = failures.iter().position(|(at, _)| *at == position) {
                    let (_, status) = failures.remove(idx);
                    items.push(Err(Error::Status(status)));
                    break;
                }
                let (values, chunked_value) = match query.messages.get(position) {
                    Some(message) => message.clone(),
                    None => break,
                };
                let metadata = if items.is_empty() {
                    Some(ResultMetadata {
                        columns: query.columns.clone(),
                        transaction: begun.clone(),
                    })
                } else {
                    None
                };
                let resume_token = if query.has_token(position) {
                    Some(ResumeToken::new((position + 1).to_string().into_bytes()))
                } else {
                    None
                };
                let row_count = if position + 1 == query.messages.len() {
                    query.row_count
                } else {
                    None
                };
                items.push(Ok(PartialResult {
                    metadata,
                    values,
                    chunked_value,
                    resume_token,
                    row_count,
                }));
            }
            (items, query.delay)
        };

        Ok(futures::stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }

    async fn commit(
        &mut self,
        _session: &Session,
        transaction: CommitTransaction,
        mutations: Vec<Mutation>,
    ) -> Result<SystemTime, Error> {
        let mut state = self.state();
        state.committed_mutations.push(mutations.len());
        if let CommitTransaction::SingleUse = transaction {
            state.single_use_commits += 1;
        }
        state.call("Commit")?;
        Ok(SystemTime::now())
    }

    async fn rollback(&mut self, _session: &Session, _tx: &Transaction) -> Result<(), Error> {
        self.state().call("Rollback")
    }
}

pub(crate) struct MockInstanceAdmin {
    endpoints: Vec<String>,
    failures: VecDeque<Status>,
    calls: usize,
}

impl MockInstanceAdmin {
    pub(crate) fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            failures: VecDeque::new(),
            calls: 0,
        }
    }

    pub(crate) fn fail(&mut self, status: Status) {
        self.failures.push_back(status);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls
    }
}

#[async_trait]
impl InstanceAdmin for MockInstanceAdmin {
    async fn get_instance_endpoints(
        &mut self,
        _instance: &InstanceId,
    ) -> Result<Vec<String>, Error> {
        self.calls += 1;
        match self.failures.pop_front() {
            Some(status) => Err(Error::Status(status)),
            None => Ok(self.endpoints.clone()),
        }
    }
}
