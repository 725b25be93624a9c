use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use gcp_auth::AuthenticationManager;
use google_api_proto::google::spanner::admin::instance::v1::{
    instance_admin_client::InstanceAdminClient, GetInstanceRequest,
};
use google_api_proto::google::spanner::v1 as proto;
use proto::{
    spanner_client::SpannerClient, BeginTransactionRequest, CommitRequest, CreateSessionRequest,
    ExecuteSqlRequest, RollbackRequest,
};
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::Request;
use tower::filter::{AsyncFilter, AsyncFilterLayer};
use tower::util::Either;
use tower::ServiceBuilder;

use super::{
    CommitTransaction, Connection, InstanceAdmin, PartialResult, PartialResultStream,
    ResultMetadata,
};
use crate::auth::{AuthFilter, Scopes};
use crate::{
    DatabaseId, Endpoint, Error, InstanceId, Mutation, ResumeToken, Session, SpannerResource,
    Statement, Transaction, TransactionMode, TransactionSelector,
};

type AuthChannel = Either<AsyncFilter<Channel, AuthFilter>, Channel>;

async fn channel(
    endpoint: &Endpoint,
    tls_config: Option<ClientTlsConfig>,
    auth: Option<Arc<AuthenticationManager>>,
    scopes: Scopes,
) -> Result<AuthChannel, Error> {
    let channel = Channel::from_shared(endpoint.to_string()).map_err(|invalid_uri| {
        Error::Config(format!("invalid endpoint {}: {}", endpoint, invalid_uri))
    })?;
    let channel = match tls_config {
        Some(tls_config) => channel.tls_config(tls_config)?,
        None if endpoint.as_str().starts_with("https://") => {
            channel.tls_config(ClientTlsConfig::new())?
        }
        None => channel,
    };

    let channel = channel.connect().await?;

    let auth_layer = auth.map(|auth| AsyncFilterLayer::new(AuthFilter::new(auth, scopes)));

    Ok(ServiceBuilder::new()
        .option_layer(auth_layer)
        .service(channel))
}

#[derive(Clone)]
struct GrpcConnection {
    database: DatabaseId,
    spanner: SpannerClient<AuthChannel>,
}

pub(crate) async fn connect(
    endpoint: &Endpoint,
    tls_config: Option<ClientTlsConfig>,
    auth: Option<Arc<AuthenticationManager>>,
    database: DatabaseId,
) -> Result<Box<dyn Connection>, Error> {
    let channel = channel(endpoint, tls_config, auth, Scopes::Database).await?;
    Ok(Box::new(GrpcConnection {
        database,
        spanner: SpannerClient::new(channel),
    }))
}

fn system_time(timestamp: prost_types::Timestamp) -> Result<SystemTime, Error> {
    if timestamp.seconds < 0 || timestamp.nanos < 0 {
        return Err(Error::Codec(format!(
            "invalid commit timestamp {:?}",
            timestamp
        )));
    }
    Ok(UNIX_EPOCH + Duration::new(timestamp.seconds as u64, timestamp.nanos as u32))
}

impl From<proto::PartialResultSet> for PartialResult {
    fn from(value: proto::PartialResultSet) -> Self {
        let metadata = value.metadata.map(|metadata| ResultMetadata {
            columns: metadata
                .row_type
                .map(|row_type| row_type.fields.into_iter().map(|field| field.name).collect())
                .unwrap_or_default(),
            transaction: metadata
                .transaction
                .filter(|tx| !tx.id.is_empty())
                .map(|tx| Transaction::new(tx.id.to_vec())),
        });
        let row_count = value
            .stats
            .and_then(|stats| stats.row_count)
            .map(|row_count| match row_count {
                proto::result_set_stats::RowCount::RowCountExact(count) => count,
                proto::result_set_stats::RowCount::RowCountLowerBound(count) => count,
            });
        let resume_token = if value.resume_token.is_empty() {
            None
        } else {
            Some(ResumeToken::new(value.resume_token.to_vec()))
        };
        Self {
            metadata,
            values: value.values,
            chunked_value: value.chunked_value,
            resume_token,
            row_count,
        }
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    async fn create_session(&mut self) -> Result<Session, Error> {
        let response = self
            .spanner
            .create_session(Request::new(CreateSessionRequest {
                database: self.database.id(),
                ..Default::default()
            }))
            .await?;
        Ok(Session::new(response.into_inner().name))
    }

    async fn begin_transaction(
        &mut self,
        session: &Session,
        mode: &TransactionMode,
    ) -> Result<Transaction, Error> {
        let response = self
            .spanner
            .begin_transaction(Request::new(BeginTransactionRequest {
                session: session.name().to_string(),
                options: Some(mode.clone().into()),
                ..Default::default()
            }))
            .await?;
        Ok(Transaction::new(response.into_inner().id.to_vec()))
    }

    async fn execute_streaming_sql(
        &mut self,
        session: &Session,
        selector: &TransactionSelector,
        statement: &Statement,
        resume_token: Option<&ResumeToken>,
        seqno: Option<i64>,
    ) -> Result<PartialResultStream, Error> {
        let params = statement
            .params
            .iter()
            .map(|(name, (value, _))| (name.clone(), value.clone()))
            .collect();
        let param_types = statement
            .params
            .iter()
            .map(|(name, (_, code))| {
                (
                    name.clone(),
                    proto::Type {
                        code: *code as i32,
                        ..Default::default()
                    },
                )
            })
            .collect();

        let stream = self
            .spanner
            .execute_streaming_sql(Request::new(ExecuteSqlRequest {
                session: session.name().to_string(),
                transaction: Some(selector.clone().into()),
                sql: statement.sql.clone(),
                params: Some(prost_types::Struct { fields: params }),
                param_types,
                resume_token: resume_token
                    .map(|token| token.as_bytes().to_vec())
                    .unwrap_or_default()
                    .into(),
                seqno: seqno.unwrap_or(0), // ignored for queries, required for DML
                ..Default::default()
            }))
            .await?
            .into_inner();

        Ok(stream
            .map(|partial| partial.map(PartialResult::from).map_err(Error::from))
            .boxed())
    }

    async fn commit(
        &mut self,
        session: &Session,
        transaction: CommitTransaction,
        mutations: Vec<Mutation>,
    ) -> Result<SystemTime, Error> {
        let transaction = match transaction {
            CommitTransaction::Id(tx) => {
                proto::commit_request::Transaction::TransactionId(tx.id().to_vec().into())
            }
            CommitTransaction::SingleUse => {
                proto::commit_request::Transaction::SingleUseTransaction(
                    TransactionMode::ReadWrite.into(),
                )
            }
        };
        let response = self
            .spanner
            .commit(Request::new(CommitRequest {
                session: session.name().to_string(),
                transaction: Some(transaction),
                mutations,
                ..Default::default()
            }))
            .await?
            .into_inner();

        response
            .commit_timestamp
            .ok_or_else(|| Error::Codec("missing commit timestamp".to_string()))
            .and_then(system_time)
    }

    async fn rollback(&mut self, session: &Session, tx: &Transaction) -> Result<(), Error> {
        self.spanner
            .rollback(Request::new(RollbackRequest {
                session: session.name().to_string(),
                transaction_id: tx.id().to_vec().into(),
            }))
            .await?;

        Ok(())
    }
}

#[derive(Clone)]
struct GrpcInstanceAdmin {
    admin: InstanceAdminClient<AuthChannel>,
}

pub(crate) async fn connect_admin(
    endpoint: &Endpoint,
    tls_config: Option<ClientTlsConfig>,
    auth: Option<Arc<AuthenticationManager>>,
) -> Result<Box<dyn InstanceAdmin>, Error> {
    let channel = channel(endpoint, tls_config, auth, Scopes::Admin).await?;
    Ok(Box::new(GrpcInstanceAdmin {
        admin: InstanceAdminClient::new(channel),
    }))
}

#[async_trait]
impl InstanceAdmin for GrpcInstanceAdmin {
    async fn get_instance_endpoints(
        &mut self,
        instance: &InstanceId,
    ) -> Result<Vec<String>, Error> {
        let response = self
            .admin
            .get_instance(Request::new(GetInstanceRequest {
                name: instance.id(),
                field_mask: Some(prost_types::FieldMask {
                    paths: vec!["endpoint_uris".to_string()],
                }),
                ..Default::default()
            }))
            .await?;
        Ok(response.into_inner().endpoint_uris)
    }
}
