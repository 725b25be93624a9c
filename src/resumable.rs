use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use futures::StreamExt;

use crate::connection::{Connection, PartialResult, PartialResultStream};
use crate::result_set::{PendingValues, RowAssembler};
use crate::session::SessionLease;
use crate::transaction::begin;
use crate::{Context, Error, Row, Session, Shared, Statement, TransactionSelector};

/// An opaque marker issued by the server that allows resuming a query after the rows it covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self(token.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Active,
    Resuming,
    Done,
    Failed,
}

/// Where the session of a query comes from.
pub(crate) enum SessionSlot<'a> {
    /// Leased from the pool when the query starts, handed back when it ends.
    Pending,
    Leased(SessionLease),
    /// Owned by the enclosing transaction.
    Borrowed(&'a Session),
    Released,
}

impl<'a> SessionSlot<'a> {
    async fn acquire(&mut self, ctx: &Context, shared: &Shared) -> Result<(), Error> {
        if let SessionSlot::Pending = self {
            *self = SessionSlot::Leased(shared.session(ctx).await?);
        }
        Ok(())
    }

    fn get(&self) -> Result<&Session, Error> {
        match self {
            SessionSlot::Leased(lease) => Ok(lease),
            SessionSlot::Borrowed(session) => Ok(session),
            SessionSlot::Pending | SessionSlot::Released => {
                Err(Error::Client("query has no session".to_string()))
            }
        }
    }

    fn release(&mut self) {
        if let SessionSlot::Leased(_) = self {
            *self = SessionSlot::Released;
        }
    }
}

impl<'a> From<&'a Session> for SessionSlot<'a> {
    fn from(session: &'a Session) -> Self {
        SessionSlot::Borrowed(session)
    }
}

pub(crate) enum SelectorSlot<'a> {
    Owned(TransactionSelector),
    /// Shared with the enclosing transaction, which learns the id of inline begins through it.
    Borrowed(&'a mut TransactionSelector),
}

impl<'a> Deref for SelectorSlot<'a> {
    type Target = TransactionSelector;

    fn deref(&self) -> &TransactionSelector {
        match self {
            SelectorSlot::Owned(selector) => selector,
            SelectorSlot::Borrowed(selector) => selector,
        }
    }
}

impl<'a> DerefMut for SelectorSlot<'a> {
    fn deref_mut(&mut self) -> &mut TransactionSelector {
        match self {
            SelectorSlot::Owned(selector) => selector,
            SelectorSlot::Borrowed(selector) => selector,
        }
    }
}

impl<'a> From<&'a mut TransactionSelector> for SelectorSlot<'a> {
    fn from(selector: &'a mut TransactionSelector) -> Self {
        SelectorSlot::Borrowed(selector)
    }
}

impl From<TransactionSelector> for SelectorSlot<'_> {
    fn from(selector: TransactionSelector) -> Self {
        SelectorSlot::Owned(selector)
    }
}

/// Everything needed to (re-)issue one streaming query.
pub(crate) struct Query<'a> {
    pub(crate) statement: Statement,
    /// Sequence number of DML statements, `None` for queries.
    pub(crate) seqno: Option<i64>,
    pub(crate) session: SessionSlot<'a>,
    pub(crate) selector: SelectorSlot<'a>,
    /// Piggy-back the begin of the transaction on this query when the selector is `Begin`.
    pub(crate) inline_begin: bool,
}

/// The last point of the stream acknowledged by the server.
#[derive(Default)]
struct Checkpoint {
    token: Option<ResumeToken>,
    /// The start of the row that straddles the checkpoint.
    pending: PendingValues,
}

/// The rows of a streaming query.
///
/// Broken streams are transparently re-issued from the last resume token. Rows received after
/// that token are counted, so the ones the server sends again are dropped instead of being
/// returned twice. When no token was received yet, the query restarts from the beginning and the
/// rows already returned are skipped the same way.
///
/// Dropping the stream, or calling [`ResultStream::stop`], releases the RPC immediately.
pub struct ResultStream<'a> {
    connection: Box<dyn Connection>,
    shared: Arc<Shared>,
    ctx: Context,
    query: Query<'a>,
    state: StreamState,
    stream: Option<PartialResultStream>,
    assembler: RowAssembler,
    ready: VecDeque<Row>,
    checkpoint: Checkpoint,
    /// Rows assembled since the checkpoint, whether returned or still in `ready`.
    since_checkpoint: usize,
    /// Re-sent rows to drop after a resume.
    skip: usize,
    retries: u32,
    row_count: Option<i64>,
    failure: Option<Error>,
}

impl<'a> ResultStream<'a> {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        shared: Arc<Shared>,
        ctx: Context,
        query: Query<'a>,
    ) -> Self {
        Self {
            connection,
            shared,
            ctx,
            query,
            state: StreamState::NotStarted,
            stream: None,
            assembler: RowAssembler::default(),
            ready: VecDeque::new(),
            checkpoint: Checkpoint::default(),
            since_checkpoint: 0,
            skip: 0,
            retries: 0,
            row_count: None,
            failure: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The names of the result's columns, known once the first response arrived.
    pub fn columns(&self) -> Option<&[String]> {
        self.assembler.columns()
    }

    /// The number of rows modified by a DML statement, known once the stream is done.
    pub fn row_count(&self) -> Option<i64> {
        self.row_count
    }

    /// Returns the next row, or `None` once the query is exhausted.
    ///
    /// After a failure, the same error is returned by every subsequent call. The exception is a
    /// transport failure, which later calls report as [`Error::Client`] with the same message.
    pub async fn next(&mut self) -> Result<Option<Row>, Error> {
        loop {
            if !matches!(self.state, StreamState::Done | StreamState::Failed) {
                if let Some(err) = self.ctx.err() {
                    return Err(self.fail(err));
                }
            }
            if let Some(row) = self.ready.pop_front() {
                return Ok(Some(row));
            }
            let result = match self.state {
                StreamState::Done => return Ok(None),
                StreamState::Failed => return Err(self.failure()),
                StreamState::NotStarted => self.start().await,
                StreamState::Active | StreamState::Resuming => self.advance().await,
            };
            if let Err(err) = result {
                return Err(self.fail(err));
            }
        }
    }

    /// Reads all remaining rows.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>, Error> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Cancels the underlying RPC and releases the session of a single-use read.
    pub fn stop(&mut self) {
        self.stream = None;
        self.ready.clear();
        self.query.session.release();
        if !matches!(self.state, StreamState::Done | StreamState::Failed) {
            self.state = StreamState::Failed;
            self.failure = Some(Error::Status(tonic::Status::failed_precondition(
                "next called after stop",
            )));
        }
    }

    async fn start(&mut self) -> Result<(), Error> {
        self.query.session.acquire(&self.ctx, &self.shared).await?;
        self.state = StreamState::Active;
        match self.open().await {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) => self.recover(err).await,
        }
    }

    async fn open(&mut self) -> Result<PartialResultStream, Error> {
        let session = self.query.session.get()?;
        if let TransactionSelector::Begin(mode) = &*self.query.selector {
            // An inline begin is only attempted by the first RPC. Re-issuing it could begin a
            // second transaction, so a stream that broke before the id arrived begins explicitly.
            if !self.query.inline_begin {
                let tx = begin(
                    self.connection.as_ref(),
                    session,
                    mode,
                    &self.ctx,
                    &self.shared,
                )
                .await?;
                *self.query.selector = TransactionSelector::Id(tx);
            }
        }
        self.query.inline_begin = false;

        let mut connection = self.connection.clone();
        self.ctx
            .run(connection.execute_streaming_sql(
                session,
                &self.query.selector,
                &self.query.statement,
                self.checkpoint.token.as_ref(),
                self.query.seqno,
            ))
            .await?
    }

    async fn advance(&mut self) -> Result<(), Error> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Client("stream is not open".to_string()))?;
        match self.ctx.run(stream.next()).await? {
            Some(Ok(partial)) => self.absorb(partial),
            Some(Err(err)) => self.recover(err).await,
            None => {
                if self.assembler.has_pending() {
                    return Err(Error::Codec("stream ended with an incomplete row".to_string()));
                }
                self.finish();
                Ok(())
            }
        }
    }

    fn absorb(&mut self, partial: PartialResult) -> Result<(), Error> {
        if let Some(metadata) = partial.metadata {
            self.assembler.set_columns(metadata.columns);
            if let Some(tx) = metadata.transaction {
                if let TransactionSelector::Begin(_) = *self.query.selector {
                    *self.query.selector = TransactionSelector::Id(tx);
                }
            }
        }
        for row in self
            .assembler
            .push(partial.values, partial.chunked_value)?
        {
            if self.skip > 0 {
                self.skip -= 1;
            } else {
                self.since_checkpoint += 1;
                self.ready.push_back(row);
            }
        }
        if partial.row_count.is_some() {
            self.row_count = partial.row_count;
        }
        if let Some(token) = partial.resume_token {
            self.checkpoint = Checkpoint {
                token: Some(token),
                pending: self.assembler.pending().clone(),
            };
            // Rows still to skip lie after the new checkpoint and were already seen.
            self.since_checkpoint = self.skip;
            self.retries = 0;
        }
        Ok(())
    }

    /// Re-issues the query from the checkpoint if `err` is transient, otherwise returns it.
    async fn recover(&mut self, mut err: Error) -> Result<(), Error> {
        self.stream = None;
        loop {
            if !self.shared.classifier.classify(&err).is_transient() {
                return Err(err);
            }
            self.state = StreamState::Resuming;
            let delay = self.shared.backoff.delay(self.retries);
            log::debug!(
                "query stream failed with a transient error, resuming in {:?}: {}",
                delay,
                err
            );
            self.ctx.sleep(delay).await?;
            self.retries += 1;

            self.assembler.restore(self.checkpoint.pending.clone());
            self.skip = self.since_checkpoint;
            match self.open().await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.state = StreamState::Active;
                    return Ok(());
                }
                Err(next) => err = next,
            }
        }
    }

    fn finish(&mut self) {
        self.state = StreamState::Done;
        self.stream = None;
        self.query.session.release();
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = StreamState::Failed;
        self.stream = None;
        self.ready.clear();
        self.query.session.release();
        self.failure = Some(err.replay());
        err
    }

    fn failure(&self) -> Error {
        match &self.failure {
            Some(err) => err.replay(),
            None => Error::Client("stream failed".to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{int64, string, MockConnection, MockQuery};
    use crate::Client;
    use std::time::Duration;
    use tonic::{Code, Status};

    const SQL: &str = "SELECT SingerId, AlbumId, AlbumTitle FROM Albums";

    fn albums(rows: usize) -> MockQuery {
        MockQuery::new(
            &["SingerId", "AlbumId", "AlbumTitle"],
            (0..rows)
                .map(|i| {
                    vec![
                        int64(i as i64),
                        int64(i as i64 * 10),
                        string(&format!("Album {}", i)),
                    ]
                })
                .collect(),
        )
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter().map(|row| row.get("SingerId").unwrap()).collect()
    }

    async fn client(mock: &MockConnection) -> Client {
        Client::for_test(mock).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_query() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        let client = client(&mock).await;

        let rows = client
            .single()
            .execute_query(&Context::background(), &SQL.into())
            .collect_rows()
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec![0, 1, 2]);
        assert_eq!(rows[2].get::<String>("AlbumTitle").unwrap(), "Album 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_checkpoint() {
        let mock = MockConnection::new();
        // Every row carries a token; the stream breaks right after the first row.
        mock.put_query(SQL, albums(3));
        mock.fail_stream_at(SQL, 1, Status::unavailable("server is unavailable"));
        let client = client(&mock).await;

        let rows = client
            .single()
            .execute_query(&Context::background(), &SQL.into())
            .collect_rows()
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec![0, 1, 2]);
        assert_eq!(mock.resume_tokens(SQL), vec![None, Some(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_checkpoint_is_skipped() {
        let mock = MockConnection::new();
        // Only the first row carries a token, the second one is re-sent after the resume.
        mock.put_query(SQL, albums(3).with_tokens_at(&[0]));
        mock.fail_stream_at(
            SQL,
            2,
            Status::internal("stream terminated by RST_STREAM"),
        );
        let client = client(&mock).await;

        let rows = client
            .single()
            .execute_query(&Context::background(), &SQL.into())
            .collect_rows()
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec![0, 1, 2]);
        assert_eq!(mock.resume_tokens(SQL), vec![None, Some(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_without_checkpoint() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(4).with_tokens_at(&[]));
        mock.fail_stream_at(SQL, 2, Status::unavailable("server is unavailable"));
        mock.fail_stream_at(SQL, 3, Status::unavailable("server is unavailable"));
        let client = client(&mock).await;

        let mut stream = client
            .single()
            .execute_query(&Context::background(), &SQL.into());
        let mut seen = Vec::new();
        while let Some(row) = stream.next().await.unwrap() {
            seen.push(row.get::<i64>("SingerId").unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(stream.state(), StreamState::Done);
        assert_eq!(mock.resume_tokens(SQL), vec![None, None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_transient_errors() {
        let uninterrupted = {
            let mock = MockConnection::new();
            mock.put_query(SQL, albums(10).with_tokens_at(&[1, 4, 5]));
            client(&mock)
                .await
                .single()
                .execute_query(&Context::background(), &SQL.into())
                .collect_rows()
                .await
                .unwrap()
        };

        let mock = MockConnection::new();
        mock.put_query(SQL, albums(10).with_tokens_at(&[1, 4, 5]));
        for at in [0, 1, 3, 3, 5, 6, 9, 10] {
            mock.fail_stream_at(SQL, at, Status::unavailable("server is unavailable"));
        }
        let rows = client(&mock)
            .await
            .single()
            .execute_query(&Context::background(), &SQL.into())
            .collect_rows()
            .await
            .unwrap();
        assert_eq!(rows, uninterrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_sticky() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        mock.fail_stream_at(SQL, 1, Status::internal("stream terminated by RST_STREAM"));
        mock.fail_stream_at(SQL, 2, Status::not_found("Session not found"));
        let client = client(&mock).await;

        let mut stream = client
            .single()
            .execute_query(&Context::background(), &SQL.into());
        assert!(stream.next().await.unwrap().is_some());
        assert!(stream.next().await.unwrap().is_some());
        let err = stream.next().await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(stream.next().await.unwrap_err().code(), Code::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_argument_on_open() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        mock.fail_method("ExecuteStreamingSql", Status::invalid_argument("Invalid argument"));
        let client = client(&mock).await;

        let err = client
            .single()
            .execute_query(&Context::background(), &SQL.into())
            .collect_rows()
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_on_open_is_retried() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        mock.fail_method("ExecuteStreamingSql", Status::unavailable("Temporary unavailable"));
        mock.fail_method("ExecuteStreamingSql", Status::unavailable("Temporary unavailable"));
        let client = client(&mock).await;

        let rows = client
            .single()
            .execute_query(&Context::background(), &SQL.into())
            .collect_rows()
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_without_errors() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3).with_delay(Duration::from_millis(50)));
        let client = client(&mock).await;

        let ctx = Context::background().with_timeout(Duration::from_millis(5));
        let err = client
            .single()
            .execute_query(&ctx, &SQL.into())
            .collect_rows()
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_resume() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        mock.fail_stream_at(SQL, 1, Status::internal("stream terminated by RST_STREAM"));
        for _ in 0..1000 {
            mock.fail_stream_at(SQL, 1, Status::unavailable("server is unavailable"));
        }
        let client = client(&mock).await;

        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let err = client
            .single()
            .execute_query(&ctx, &SQL.into())
            .collect_rows()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded), "{:?}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        let client = client(&mock).await;

        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = client
            .single()
            .execute_query(&ctx, &SQL.into())
            .collect_rows()
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(mock.resume_tokens(SQL).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_reading() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        mock.fail_stream_at(SQL, 1, Status::internal("stream terminated by RST_STREAM"));
        mock.fail_stream_at(SQL, 2, Status::unavailable("server is unavailable"));
        let client = client(&mock).await;

        let (ctx, cancel) = Context::background().with_cancel();
        let mut stream = client.single().execute_query(&ctx, &SQL.into());
        let mut count = 0;
        let err = loop {
            match stream.next().await {
                Ok(Some(_)) => {
                    count += 1;
                    if count == 2 {
                        cancel.cancel();
                    }
                }
                Ok(None) => panic!("expected the stream to be cancelled"),
                Err(err) => break err,
            }
        };
        assert_eq!(count, 2);
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_session() {
        let mock = MockConnection::new();
        mock.put_query(SQL, albums(3));
        let client = client(&mock).await;

        let mut stream = client
            .single()
            .execute_query(&Context::background(), &SQL.into());
        assert!(stream.next().await.unwrap().is_some());
        assert_eq!(client.idle_sessions(), 0);
        stream.stop();
        assert_eq!(client.idle_sessions(), 1);
        assert_eq!(
            stream.next().await.unwrap_err().code(),
            Code::FailedPrecondition
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_rows_across_resume() {
        let mock = MockConnection::new();
        mock.put_query(
            SQL,
            MockQuery::chunks(
                &["a"],
                vec![
                    (vec![string("he")], true),
                    (vec![string("llo")], false),
                    (vec![string("world")], false),
                ],
            )
            .with_tokens_at(&[0, 2]),
        );
        mock.fail_stream_at(SQL, 2, Status::unavailable("server is unavailable"));
        let client = client(&mock).await;

        let rows = client
            .single()
            .execute_query(&Context::background(), &SQL.into())
            .collect_rows()
            .await
            .unwrap();
        let values: Vec<String> = rows.iter().map(|row| row.get("a").unwrap()).collect();
        assert_eq!(values, vec!["hello", "world"]);
    }
}
