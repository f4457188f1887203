//! PostgreSQL 논리 복제 클라이언트
//!
//! `replication=database` 연결로 시작해 인증(cleartext / MD5 / SCRAM-SHA-256)을 마치고
//! `START_REPLICATION SLOT .. LOGICAL ..`로 CopyBoth 스트림을 엽니다.

use crate::connection::ConnectionConfig;
use crate::dumper::{ReplicationConnector, ReplicationSession, ReplicationStream};
use crate::error::{CdcError, Result};
use crate::pg_protocol::{encode_standby_status, AuthRequest, BackendMessage, PgMessageCodec};
use crate::position::{IngestPosition, Lsn};
use crate::wal::DecodingPlugin;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::frontend;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const APPLICATION_NAME: &str = "rust_cdc";

/// startup 메시지 (복제 모드)
pub fn startup_message(config: &ConnectionConfig) -> Result<Bytes> {
    let database = config.database.as_deref().unwrap_or(&config.username);
    let mut buf = BytesMut::new();
    frontend::startup_message(
        [
            ("user", config.username.as_str()),
            ("database", database),
            ("replication", "database"),
            ("application_name", APPLICATION_NAME),
        ],
        &mut buf,
    )?;
    Ok(buf.freeze())
}

/// `START_REPLICATION SLOT <slot> LOGICAL <lsn> (<options>)`
pub fn start_replication_query(slot_name: &str, lsn: Lsn, plugin: DecodingPlugin, publication: &str) -> String {
    format!(
        "START_REPLICATION SLOT {} LOGICAL {} ({})",
        slot_name,
        lsn,
        plugin.start_options(publication)
    )
}

fn query_message(sql: &str) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    frontend::query(sql, &mut buf)?;
    Ok(buf.freeze())
}

/// TCP로 PostgreSQL에 붙는 커넥터
#[derive(Debug, Clone)]
pub struct PgReplicationConnector {
    config: ConnectionConfig,
    slot_name: String,
    plugin: DecodingPlugin,
    publication: String,
}

impl PgReplicationConnector {
    pub fn new(
        config: ConnectionConfig,
        slot_name: impl Into<String>,
        plugin: DecodingPlugin,
        publication: impl Into<String>,
    ) -> Self {
        PgReplicationConnector {
            config,
            slot_name: slot_name.into(),
            plugin,
            publication: publication.into(),
        }
    }
}

#[async_trait]
impl ReplicationConnector for PgReplicationConnector {
    type Session = PgReplicationSession<TcpStream>;

    async fn connect(&self) -> Result<Self::Session> {
        info!("Connecting to {}", self.config.address());
        let stream = tokio::time::timeout(self.config.timeout, TcpStream::connect(self.config.address()))
            .await
            .map_err(|_| CdcError::Timeout)?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", self.config.address(), e)))?;
        stream.set_nodelay(true)?;
        PgReplicationSession::startup(
            stream,
            self.config.clone(),
            self.slot_name.clone(),
            self.plugin,
            self.publication.clone(),
        )
        .await
    }
}

/// startup 메시지를 보낸 연결
pub struct PgReplicationSession<S = TcpStream> {
    framed: Framed<S, PgMessageCodec>,
    config: ConnectionConfig,
    slot_name: String,
    plugin: DecodingPlugin,
    publication: String,
    parameters: HashMap<String, String>,
}

impl<S> PgReplicationSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn startup(
        io: S,
        config: ConnectionConfig,
        slot_name: String,
        plugin: DecodingPlugin,
        publication: String,
    ) -> Result<Self> {
        let mut framed = Framed::new(io, PgMessageCodec::new());
        framed.send(startup_message(&config)?).await?;
        Ok(PgReplicationSession {
            framed,
            config,
            slot_name,
            plugin,
            publication,
            parameters: HashMap::new(),
        })
    }

    /// 인증 후 서버가 알려준 ParameterStatus
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    async fn send(&mut self, message: Bytes) -> Result<()> {
        self.framed.send(message).await
    }

    async fn send_password(&mut self, password: &[u8]) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::password_message(password, &mut buf)?;
        self.send(buf.freeze()).await
    }

    async fn scram_exchange(&mut self, mechanisms: &[String]) -> Result<()> {
        if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
            return Err(CdcError::AuthenticationError(format!(
                "no supported SASL mechanism in {:?}",
                mechanisms
            )));
        }

        let mut scram = ScramSha256::new(self.config.password.as_bytes(), ChannelBinding::unsupported());
        let mut buf = BytesMut::new();
        frontend::sasl_initial_response(SCRAM_SHA_256, scram.message(), &mut buf)?;
        self.send(buf.freeze()).await?;

        match read_message(&mut self.framed).await? {
            BackendMessage::Authentication(AuthRequest::SaslContinue(data)) => {
                scram
                    .update(&data)
                    .map_err(|e| CdcError::AuthenticationError(format!("SCRAM exchange failed: {}", e)))?;
            }
            BackendMessage::ErrorResponse(error) => return Err(error.into_error()),
            other => return Err(unexpected("SASL continue", &other)),
        }

        let mut buf = BytesMut::new();
        frontend::sasl_response(scram.message(), &mut buf)?;
        self.send(buf.freeze()).await?;

        match read_message(&mut self.framed).await? {
            BackendMessage::Authentication(AuthRequest::SaslFinal(data)) => scram
                .finish(&data)
                .map_err(|e| CdcError::AuthenticationError(format!("SCRAM server signature rejected: {}", e))),
            BackendMessage::ErrorResponse(error) => Err(error.into_error()),
            other => Err(unexpected("SASL final", &other)),
        }
    }
}

async fn read_message<S>(framed: &mut Framed<S, PgMessageCodec>) -> Result<BackendMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(message) => BackendMessage::parse(message?),
        None => Err(CdcError::ConnectionError("connection closed by server".to_string())),
    }
}

fn unexpected(stage: &str, message: &BackendMessage) -> CdcError {
    CdcError::decode(0, format!("unexpected message during {}: {:?}", stage, message))
}

#[async_trait]
impl<S> ReplicationSession for PgReplicationSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = PgReplicationStream<S>;

    async fn authenticate(&mut self) -> Result<()> {
        loop {
            match read_message(&mut self.framed).await? {
                BackendMessage::Authentication(request) => match request {
                    AuthRequest::Ok => debug!("Authenticated as {}", self.config.username),
                    AuthRequest::CleartextPassword => {
                        let password = self.config.password.clone();
                        self.send_password(password.as_bytes()).await?;
                    }
                    AuthRequest::Md5Password { salt } => {
                        let hashed = md5_hash(
                            self.config.username.as_bytes(),
                            self.config.password.as_bytes(),
                            salt,
                        );
                        self.send_password(hashed.as_bytes()).await?;
                    }
                    AuthRequest::Sasl { mechanisms } => self.scram_exchange(&mechanisms).await?,
                    AuthRequest::Unsupported(code) => {
                        return Err(CdcError::AuthenticationError(format!(
                            "unsupported authentication method {}",
                            code
                        )))
                    }
                    other => return Err(unexpected("authentication", &BackendMessage::Authentication(other))),
                },
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    debug!("Backend process id {}", process_id);
                }
                BackendMessage::NoticeResponse(notice) => warn!("Server notice: {}", notice.message),
                BackendMessage::ErrorResponse(error) => return Err(error.into_error()),
                BackendMessage::ReadyForQuery(_) => {
                    info!(
                        "PostgreSQL server version: {}, authenticated as {}",
                        self.parameter("server_version").unwrap_or("unknown"),
                        self.config.username
                    );
                    return Ok(());
                }
                other => return Err(unexpected("startup", &other)),
            }
        }
    }

    async fn subscribe(mut self, resume: &IngestPosition) -> Result<Self::Stream> {
        let lsn = resume.as_lsn().ok_or_else(|| {
            CdcError::InvalidPosition(format!("{} cannot start logical replication", resume))
        })?;
        let sql = start_replication_query(&self.slot_name, lsn, self.plugin, &self.publication);
        debug!("{}", sql);
        self.send(query_message(&sql)?).await?;

        loop {
            match read_message(&mut self.framed).await? {
                BackendMessage::CopyBothResponse => break,
                BackendMessage::NoticeResponse(notice) => warn!("Server notice: {}", notice.message),
                BackendMessage::ErrorResponse(error) => return Err(error.into_error()),
                other => return Err(unexpected("START_REPLICATION", &other)),
            }
        }
        info!(
            "Streaming slot {} with {} from {}",
            self.slot_name, self.plugin, lsn
        );

        Ok(PgReplicationStream { framed: self.framed })
    }
}

/// CopyBoth 스트림. 각 프레임은 CopyData 본문 (XLogData 또는 keepalive)
pub struct PgReplicationStream<S = TcpStream> {
    framed: Framed<S, PgMessageCodec>,
}

#[async_trait]
impl<S> ReplicationStream for PgReplicationStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match read_message(&mut self.framed).await? {
                BackendMessage::CopyData(data) => return Ok(Some(data)),
                BackendMessage::CopyDone => {
                    info!("Replication stream ended by server");
                    return Ok(None);
                }
                BackendMessage::NoticeResponse(notice) => warn!("Server notice: {}", notice.message),
                BackendMessage::ErrorResponse(error) => return Err(error.into_error()),
                other => return Err(unexpected("streaming", &other)),
            }
        }
    }

    async fn send_feedback(
        &mut self,
        received: &IngestPosition,
        acknowledged: Option<&IngestPosition>,
    ) -> Result<()> {
        let write = received.as_lsn().unwrap_or(Lsn::INVALID);
        let flush = acknowledged.and_then(IngestPosition::as_lsn).unwrap_or(Lsn::INVALID);
        debug!("Standby status write={} flush={}", write, flush);
        self.framed
            .send(encode_standby_status(write, flush, flush, Utc::now(), false))
            .await
    }
}
