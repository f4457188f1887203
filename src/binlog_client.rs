//! MySQL binlog 복제 클라이언트
//!
//! 패킷 채널 위에서 핸드셰이크 / 인증을 마치고 replica로 등록한 뒤
//! `COM_BINLOG_DUMP` 또는 `COM_BINLOG_DUMP_GTID`로 이벤트 스트림을 엽니다.

use crate::auth::{self, AuthPlugin, FAST_AUTH_SUCCESS, PERFORM_FULL_AUTHENTICATION};
use crate::connection::ConnectionConfig;
use crate::dumper::{ReplicationConnector, ReplicationSession, ReplicationStream};
use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use crate::payload::PacketPayload;
use crate::position::{BinlogPosition, IngestPosition, BINLOG_START_POSITION};
use crate::protocol::{GreetingPacket, PacketChannel, ServerPacket};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// COM_REGISTER_SLAVE 명령어 코드
const COM_REGISTER_SLAVE: u8 = 0x15;

/// COM_BINLOG_DUMP_GTID 명령어 코드
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

const BINLOG_THROUGH_GTID: u16 = 0x04;

/// COM_REGISTER_SLAVE 페이로드
pub fn register_slave_command(
    server_id: u32,
    hostname: &str,
    username: &str,
    password: &str,
    port: u16,
) -> Bytes {
    let mut payload = PacketPayload::new();
    payload.write_int1(COM_REGISTER_SLAVE);
    payload.write_int4(server_id);
    write_short_string(&mut payload, hostname);
    write_short_string(&mut payload, username);
    write_short_string(&mut payload, password);
    payload.write_int2(port);
    // replication rank, master id
    payload.write_int4(0);
    payload.write_int4(0);
    payload.into_bytes()
}

fn write_short_string(payload: &mut PacketPayload, value: &str) {
    let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
    payload.write_int1(bytes.len() as u8);
    payload.write_bytes(bytes);
}

/// COM_BINLOG_DUMP 페이로드 (blocking 모드)
pub fn binlog_dump_command(server_id: u32, position: &BinlogPosition) -> Result<Bytes> {
    let offset = u32::try_from(position.position.max(BINLOG_START_POSITION)).map_err(|_| {
        CdcError::InvalidPosition(format!(
            "binlog offset {} does not fit COM_BINLOG_DUMP",
            position
        ))
    })?;
    let mut payload = PacketPayload::new();
    payload.write_int1(COM_BINLOG_DUMP);
    payload.write_int4(offset);
    payload.write_int2(0);
    payload.write_int4(server_id);
    payload.write_bytes(position.filename.as_bytes());
    Ok(payload.into_bytes())
}

/// COM_BINLOG_DUMP_GTID 페이로드. 파일명 없이 GTID 집합만으로 시작 위치를 지정
pub fn binlog_dump_gtid_command(server_id: u32, gtid_set: &GtidSet) -> Bytes {
    let mut payload = PacketPayload::new();
    payload.write_int1(COM_BINLOG_DUMP_GTID);
    payload.write_int2(BINLOG_THROUGH_GTID);
    payload.write_int4(server_id);
    // binlog name length + name (비움)
    payload.write_int4(0);
    payload.write_int8(BINLOG_START_POSITION);
    payload.write_int4(gtid_set.encoded_len() as u32);
    gtid_set.encode_sid_block(&mut payload);
    payload.into_bytes()
}

/// TCP로 MySQL에 붙는 커넥터
#[derive(Debug, Clone)]
pub struct MySqlReplicationConnector {
    config: ConnectionConfig,
    heartbeat_interval: Duration,
}

impl MySqlReplicationConnector {
    pub fn new(config: ConnectionConfig, heartbeat_interval: Duration) -> Self {
        MySqlReplicationConnector {
            config,
            heartbeat_interval,
        }
    }
}

#[async_trait]
impl ReplicationConnector for MySqlReplicationConnector {
    type Session = MySqlReplicationSession<TcpStream>;

    async fn connect(&self) -> Result<Self::Session> {
        info!("Connecting to {}", self.config.address());
        let channel = tokio::time::timeout(
            self.config.timeout,
            PacketChannel::connect(&self.config.hostname, self.config.port),
        )
        .await
        .map_err(|_| CdcError::Timeout)??;
        MySqlReplicationSession::handshake(channel, self.config.clone(), self.heartbeat_interval).await
    }
}

/// Greeting을 받은 연결
pub struct MySqlReplicationSession<S = TcpStream> {
    channel: PacketChannel<S>,
    config: ConnectionConfig,
    heartbeat_interval: Duration,
    greeting: GreetingPacket,
}

impl<S> MySqlReplicationSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// 서버 greeting 수신
    pub async fn handshake(
        mut channel: PacketChannel<S>,
        config: ConnectionConfig,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let packet = channel.read_packet().await?;
        let greeting = GreetingPacket::parse(&packet.payload)?;
        info!(
            "MySQL server version: {}, thread id: {}",
            greeting.server_version, greeting.thread_id
        );
        Ok(MySqlReplicationSession {
            channel,
            config,
            heartbeat_interval,
            greeting,
        })
    }

    pub fn greeting(&self) -> &GreetingPacket {
        &self.greeting
    }
}

#[async_trait]
impl<S> ReplicationSession for MySqlReplicationSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = MySqlReplicationStream<S>;

    async fn authenticate(&mut self) -> Result<()> {
        let mut plugin = AuthPlugin::from_name(&self.greeting.auth_plugin_name)?;
        let response = auth::create_handshake_response(
            &self.config.username,
            &self.config.password,
            self.config.database.as_deref(),
            &self.greeting.scramble,
            self.greeting.server_collation,
            plugin,
        );
        self.channel.write_payload(response).await?;

        loop {
            let packet = self.channel.read_packet().await?;
            match ServerPacket::parse_auth(packet.payload)? {
                ServerPacket::Ok(_) => {
                    info!("Authenticated as {} using {}", self.config.username, plugin.name());
                    return Ok(());
                }
                ServerPacket::Err(err) => {
                    return Err(CdcError::AuthenticationError(format!(
                        "{} (error {}, state {})",
                        err.message, err.error_code, err.sql_state
                    )))
                }
                ServerPacket::AuthSwitch { plugin: name, data } => {
                    debug!("Server requested auth switch to {}", name);
                    plugin = AuthPlugin::from_name(&name)?;
                    let response = plugin.scramble(&self.config.password, &data);
                    self.channel.write_payload(Bytes::from(response)).await?;
                }
                ServerPacket::AuthMoreData(data) => match data.first() {
                    Some(&FAST_AUTH_SUCCESS) => debug!("caching_sha2_password fast auth succeeded"),
                    Some(&PERFORM_FULL_AUTHENTICATION) => {
                        return Err(CdcError::AuthenticationError(
                            "caching_sha2_password full authentication requires a secure connection"
                                .to_string(),
                        ))
                    }
                    _ => {
                        return Err(CdcError::decode(
                            self.channel.codec().stream_offset(),
                            "unexpected auth more data",
                        ))
                    }
                },
                other => {
                    return Err(CdcError::decode(
                        self.channel.codec().stream_offset(),
                        format!("unexpected authentication response {:?}", other),
                    ))
                }
            }
        }
    }

    async fn subscribe(mut self, resume: &IngestPosition) -> Result<Self::Stream> {
        let dump = match resume {
            IngestPosition::Binlog(position) => binlog_dump_command(self.config.server_id, position)?,
            IngestPosition::Gtid(gtid_set) => binlog_dump_gtid_command(self.config.server_id, gtid_set),
            IngestPosition::Wal(lsn) => {
                return Err(CdcError::InvalidPosition(format!(
                    "WAL position {} cannot start a binlog dump",
                    lsn
                )))
            }
        };

        self.channel
            .execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await?;
        if !self.heartbeat_interval.is_zero() {
            self.channel
                .execute(&format!(
                    "SET @master_heartbeat_period = {}",
                    self.heartbeat_interval.as_nanos()
                ))
                .await?;
        }
        self.channel
            .execute_command(register_slave_command(
                self.config.server_id,
                &self.config.hostname,
                &self.config.username,
                &self.config.password,
                self.config.port,
            ))
            .await?;
        self.channel.send_command(dump).await?;
        info!(
            "Requested binlog dump from {} as server id {}",
            resume, self.config.server_id
        );

        Ok(MySqlReplicationStream {
            channel: self.channel,
        })
    }
}

/// 이벤트 패킷 스트림. 각 프레임은 OK 마커를 뗀 binlog 이벤트
pub struct MySqlReplicationStream<S = TcpStream> {
    channel: PacketChannel<S>,
}

#[async_trait]
impl<S> ReplicationStream for MySqlReplicationStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let packet = self.channel.read_packet().await?;
        match packet.payload.first() {
            Some(0x00) => Ok(Some(packet.payload.slice(1..))),
            Some(0xFE) if packet.payload.len() < 9 => {
                info!("Binlog stream ended by server");
                Ok(None)
            }
            _ => match ServerPacket::parse(packet.payload)? {
                ServerPacket::Err(err) => Err(err.into_error()),
                other => Err(CdcError::decode(
                    self.channel.codec().stream_offset(),
                    format!("unexpected packet in binlog stream {:?}", other),
                )),
            },
        }
    }
}
