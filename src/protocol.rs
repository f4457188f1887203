//! MySQL 프로토콜 패킷 처리
//!
//! - `MySqlPacketCodec`: 3 바이트 길이 + 1 바이트 시퀀스 헤더 프레이밍.
//!   0xFFFFFF 길이 패킷은 다음 패킷과 이어 붙여 하나의 논리 페이로드로 만듭니다.
//! - `ServerPacket`: OK / ERR / EOF / 인증 관련 응답을 나타내는 enum
//! - `PacketChannel`: `Framed` 위에서 명령 단위로 시퀀스를 관리하는 채널

use crate::error::{CdcError, Result};
use crate::payload::PacketPayload;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

/// 물리 패킷 최대 페이로드 길이
pub const MAX_PACKET_LENGTH: usize = 0xFF_FFFF;

/// 패킷 헤더 길이 (length 3 + sequence 1)
pub const PACKET_HEADER_LENGTH: usize = 4;

const DEFAULT_MAX_PAYLOAD: usize = 1 << 30;

const COM_QUERY: u8 = 0x03;

/// 하나의 논리 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlPacket {
    /// 첫 물리 패킷의 시퀀스 ID
    pub sequence_id: u8,
    pub payload: Bytes,
}

/// MySQL 패킷 코덱
///
/// 시퀀스 ID는 한 명령 교환 안에서 송수신 양방향으로 1씩 증가합니다.
/// 새 명령을 보내기 전에 `reset_sequence`를 호출해야 합니다.
#[derive(Debug)]
pub struct MySqlPacketCodec {
    sequence_id: u8,
    pending: BytesMut,
    pending_sequence: Option<u8>,
    stream_offset: u64,
    max_payload: usize,
}

impl Default for MySqlPacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlPacketCodec {
    pub fn new() -> Self {
        MySqlPacketCodec {
            sequence_id: 0,
            pending: BytesMut::new(),
            pending_sequence: None,
            stream_offset: 0,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// 지금까지 디코딩한 바이트 수
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }
}

impl Decoder for MySqlPacketCodec {
    type Item = MySqlPacket;
    type Error = CdcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MySqlPacket>> {
        loop {
            if src.len() < PACKET_HEADER_LENGTH {
                src.reserve(PACKET_HEADER_LENGTH - src.len());
                return Ok(None);
            }

            let length = LittleEndian::read_u24(&src[..3]) as usize;
            let sequence_id = src[3];

            if self.pending.len() + length > self.max_payload {
                return Err(CdcError::decode(
                    self.stream_offset,
                    format!(
                        "packet length {} exceeds maximum payload {}",
                        self.pending.len() + length,
                        self.max_payload
                    ),
                ));
            }

            if src.len() < PACKET_HEADER_LENGTH + length {
                src.reserve(PACKET_HEADER_LENGTH + length - src.len());
                return Ok(None);
            }

            if sequence_id != self.sequence_id {
                return Err(CdcError::decode(
                    self.stream_offset,
                    format!(
                        "unexpected sequence id {} (expected {})",
                        sequence_id, self.sequence_id
                    ),
                ));
            }

            src.advance(PACKET_HEADER_LENGTH);
            let body = src.split_to(length);
            self.stream_offset += (PACKET_HEADER_LENGTH + length) as u64;
            self.sequence_id = self.sequence_id.wrapping_add(1);
            let first_sequence = *self.pending_sequence.get_or_insert(sequence_id);

            if length == MAX_PACKET_LENGTH {
                self.pending.extend_from_slice(&body);
                continue;
            }

            let payload = if self.pending.is_empty() {
                body.freeze()
            } else {
                self.pending.extend_from_slice(&body);
                self.pending.split().freeze()
            };
            self.pending_sequence = None;

            return Ok(Some(MySqlPacket {
                sequence_id: first_sequence,
                payload,
            }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<MySqlPacket>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() && self.pending.is_empty() => Ok(None),
            None => Err(CdcError::decode(
                self.stream_offset,
                format!(
                    "stream truncated with {} buffered bytes",
                    src.len() + self.pending.len()
                ),
            )),
        }
    }
}

impl Encoder<Bytes> for MySqlPacketCodec {
    type Error = CdcError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        let mut offset = 0;
        loop {
            let chunk = (payload.len() - offset).min(MAX_PACKET_LENGTH);
            dst.reserve(PACKET_HEADER_LENGTH + chunk);
            let mut header = [0u8; 3];
            LittleEndian::write_u24(&mut header, chunk as u32);
            dst.put_slice(&header);
            dst.put_u8(self.sequence_id);
            dst.put_slice(&payload[offset..offset + chunk]);
            self.sequence_id = self.sequence_id.wrapping_add(1);
            offset += chunk;
            // 정확히 0xFFFFFF 배수 길이는 빈 패킷으로 끝을 알림
            if chunk < MAX_PACKET_LENGTH {
                return Ok(());
            }
        }
    }
}

/// OK 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// ERR 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn into_error(self) -> CdcError {
        CdcError::ServerError {
            code: self.error_code,
            sql_state: self.sql_state,
            message: self.message,
        }
    }
}

/// EOF 패킷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

/// 서버 응답
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    Ok(OkPacket),
    Err(ErrPacket),
    Eof(EofPacket),
    /// 인증 플러그인 전환 요청 (plugin name, 새 scramble)
    AuthSwitch { plugin: String, data: Bytes },
    /// caching_sha2_password 추가 데이터
    AuthMoreData(Bytes),
    Data(Bytes),
}

impl ServerPacket {
    /// 일반 명령 응답 분류
    pub fn parse(payload: Bytes) -> Result<Self> {
        match payload.first() {
            Some(0x00) => parse_ok(&payload).map(ServerPacket::Ok),
            Some(0xFF) => parse_err(&payload).map(ServerPacket::Err),
            Some(0xFE) if payload.len() < 9 => parse_eof(&payload).map(ServerPacket::Eof),
            _ => Ok(ServerPacket::Data(payload)),
        }
    }

    /// 인증 단계 응답 분류
    pub fn parse_auth(payload: Bytes) -> Result<Self> {
        match payload.first() {
            Some(0x00) => parse_ok(&payload).map(ServerPacket::Ok),
            Some(0xFF) => parse_err(&payload).map(ServerPacket::Err),
            Some(0xFE) => {
                let mut cursor = PacketPayload::from_bytes(&payload);
                cursor.skip_reserved(1)?;
                if !cursor.has_remaining() {
                    // 구 버전 서버의 old-password 전환 요청
                    return Ok(ServerPacket::AuthSwitch {
                        plugin: "mysql_old_password".to_string(),
                        data: Bytes::new(),
                    });
                }
                let plugin = cursor.read_string_nul()?;
                let mut data = cursor.read_string_eof_bytes()?;
                if data.last() == Some(&0) {
                    data.truncate(data.len() - 1);
                }
                Ok(ServerPacket::AuthSwitch { plugin, data })
            }
            Some(0x01) => Ok(ServerPacket::AuthMoreData(payload.slice(1..))),
            _ => Ok(ServerPacket::Data(payload)),
        }
    }
}

fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    let mut cursor = PacketPayload::from_bytes(payload);
    cursor.skip_reserved(1)?;
    let affected_rows = cursor.read_int_lenenc()?;
    let last_insert_id = cursor.read_int_lenenc()?;
    let status_flags = if cursor.remaining() >= 2 { cursor.read_int2()? } else { 0 };
    let warnings = if cursor.remaining() >= 2 { cursor.read_int2()? } else { 0 };
    let info = String::from_utf8_lossy(cursor.as_slice()).into_owned();
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

fn parse_err(payload: &[u8]) -> Result<ErrPacket> {
    let mut cursor = PacketPayload::from_bytes(payload);
    cursor.skip_reserved(1)?;
    let error_code = cursor.read_int2()?;
    let sql_state = if cursor.peek_u8() == Some(b'#') {
        cursor.skip_reserved(1)?;
        cursor.read_string_fix(5)?
    } else {
        "HY000".to_string()
    };
    let message = String::from_utf8_lossy(cursor.as_slice()).into_owned();
    Ok(ErrPacket {
        error_code,
        sql_state,
        message,
    })
}

fn parse_eof(payload: &[u8]) -> Result<EofPacket> {
    let mut cursor = PacketPayload::from_bytes(payload);
    cursor.skip_reserved(1)?;
    let warnings = if cursor.remaining() >= 2 { cursor.read_int2()? } else { 0 };
    let status_flags = if cursor.remaining() >= 2 { cursor.read_int2()? } else { 0 };
    Ok(EofPacket {
        warnings,
        status_flags,
    })
}

/// Greeting 패킷 (Handshake V10)
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = PacketPayload::from_bytes(data);

        let protocol_version = cursor.read_int1()?;
        if protocol_version == 0xFF {
            return Err(parse_err(data)?.into_error());
        }
        let server_version = cursor.read_string_nul()?;
        let thread_id = cursor.read_int4()?;
        let mut scramble = cursor.read_string_fix_bytes(8)?.to_vec();
        cursor.skip_reserved(1)?;
        let capabilities_lower = cursor.read_int2()?;

        // 4.1 이전 서버는 여기서 끝날 수 있음
        if !cursor.has_remaining() {
            return Ok(GreetingPacket {
                protocol_version,
                server_version,
                thread_id,
                scramble,
                server_capabilities: capabilities_lower as u32,
                server_collation: 0,
                server_status: 0,
                auth_plugin_name: String::new(),
            });
        }

        let server_collation = cursor.read_int1()?;
        let server_status = cursor.read_int2()?;
        let capabilities_upper = cursor.read_int2()?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;
        let auth_data_len = cursor.read_int1()?;
        cursor.skip_reserved(10)?;

        if server_capabilities & crate::auth::capabilities::SECURE_CONNECTION != 0 {
            let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
            let part2 = cursor.read_string_fix_bytes(part2_len.min(cursor.remaining()))?;
            // 마지막 NUL 제외
            let trimmed = match part2.last() {
                Some(0) => &part2[..part2.len() - 1],
                _ => &part2[..],
            };
            scramble.extend_from_slice(trimmed);
        }

        let auth_plugin_name = if server_capabilities & crate::auth::capabilities::PLUGIN_AUTH != 0
            && cursor.has_remaining()
        {
            let raw = cursor.read_string_eof_bytes()?;
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).into_owned()
        } else {
            String::new()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// COM_QUERY 페이로드
pub fn query_command(sql: &str) -> Bytes {
    let mut payload = PacketPayload::new();
    payload.write_int1(COM_QUERY);
    payload.write_bytes(sql.as_bytes());
    payload.into_bytes()
}

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    framed: Framed<S, MySqlPacketCodec>,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        PacketChannel {
            framed: Framed::new(stream, MySqlPacketCodec::new()),
        }
    }

    /// 패킷 읽기
    pub async fn read_packet(&mut self) -> Result<MySqlPacket> {
        match self.framed.next().await {
            Some(packet) => packet,
            None => Err(CdcError::ConnectionError(
                "connection closed by server".to_string(),
            )),
        }
    }

    /// 현재 시퀀스로 페이로드 쓰기
    pub async fn write_payload(&mut self, payload: Bytes) -> Result<()> {
        self.framed.send(payload).await
    }

    /// 새 명령 교환 시작
    pub async fn send_command(&mut self, payload: Bytes) -> Result<()> {
        self.framed.codec_mut().reset_sequence();
        self.write_payload(payload).await
    }

    /// OK 또는 ERR 응답을 기대하는 명령 실행
    pub async fn execute_command(&mut self, payload: Bytes) -> Result<OkPacket> {
        self.send_command(payload).await?;
        let response = self.read_packet().await?;
        match ServerPacket::parse(response.payload)? {
            ServerPacket::Ok(ok) => Ok(ok),
            ServerPacket::Err(err) => Err(err.into_error()),
            other => Err(CdcError::decode(
                self.framed.codec().stream_offset(),
                format!("unexpected response {:?}", other),
            )),
        }
    }

    /// 결과셋이 없는 쿼리 실행 (SET 등)
    pub async fn execute(&mut self, sql: &str) -> Result<OkPacket> {
        debug!("Executing: {}", sql);
        self.execute_command(query_command(sql)).await
    }

    pub fn codec(&self) -> &MySqlPacketCodec {
        self.framed.codec()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn frame(sequence_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        out.push(sequence_id);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_decode_single_packet() {
        let mut codec = MySqlPacketCodec::new();
        let mut src = BytesMut::from(&frame(0, b"hello")[..]);
        let packet = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(&packet.payload[..], b"hello");
        assert_eq!(codec.sequence_id(), 1);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_incomplete_consumes_nothing() {
        let mut codec = MySqlPacketCodec::new();
        let full = frame(0, b"hello world");
        let mut src = BytesMut::from(&full[..7]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 7);
        assert_eq!(codec.sequence_id(), 0);

        src.extend_from_slice(&full[7..]);
        let packet = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&packet.payload[..], b"hello world");
    }

    #[test]
    fn test_decode_split_at_threshold() {
        let first = vec![0xABu8; MAX_PACKET_LENGTH];
        let mut src = BytesMut::new();
        src.extend_from_slice(&frame(0, &first));
        src.extend_from_slice(&frame(1, &[0xCD, 0xEF]));

        let mut codec = MySqlPacketCodec::new();
        let packet = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(packet.payload.len(), MAX_PACKET_LENGTH + 2);
        assert_eq!(packet.payload[MAX_PACKET_LENGTH], 0xCD);
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(codec.sequence_id(), 2);
    }

    #[test]
    fn test_encode_exact_threshold_appends_empty_packet() {
        let payload = Bytes::from(vec![7u8; MAX_PACKET_LENGTH]);
        let mut codec = MySqlPacketCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(payload, &mut dst).unwrap();
        assert_eq!(dst.len(), MAX_PACKET_LENGTH + 8);
        assert_eq!(&dst[MAX_PACKET_LENGTH + 4..], &[0, 0, 0, 1]);

        let mut decoder = MySqlPacketCodec::new();
        let packet = decoder.decode(&mut dst).unwrap().unwrap();
        assert_eq!(packet.payload.len(), MAX_PACKET_LENGTH);
    }

    #[test]
    fn test_sequence_mismatch_is_fatal() {
        let mut codec = MySqlPacketCodec::new();
        let mut src = BytesMut::from(&frame(0, b"a")[..]);
        codec.decode(&mut src).unwrap().unwrap();
        src.extend_from_slice(&frame(5, b"b"));
        match codec.decode(&mut src) {
            Err(CdcError::ProtocolDecode { offset, .. }) => assert_eq!(offset, 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sequence_wraps() {
        let mut codec = MySqlPacketCodec::new();
        let mut src = BytesMut::new();
        for i in 0..=256u32 {
            src.extend_from_slice(&frame((i % 256) as u8, b"x"));
        }
        for _ in 0..=256 {
            assert!(codec.decode(&mut src).unwrap().is_some());
        }
        assert_eq!(codec.sequence_id(), 1);
    }

    #[test]
    fn test_truncated_stream_at_eof() {
        let mut codec = MySqlPacketCodec::new();
        let full = frame(0, b"abcdef");
        let mut src = BytesMut::from(&full[..6]);
        assert!(matches!(
            codec.decode_eof(&mut src),
            Err(CdcError::ProtocolDecode { .. })
        ));
    }

    #[test]
    fn test_parse_server_packets() {
        let ok = ServerPacket::parse(Bytes::from_static(&[0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00])).unwrap();
        assert!(matches!(ok, ServerPacket::Ok(OkPacket { affected_rows: 1, .. })));

        let mut err = vec![0xFF, 0x48, 0x04, b'#'];
        err.extend_from_slice(b"HY000");
        err.extend_from_slice(b"No database selected");
        match ServerPacket::parse(Bytes::from(err)).unwrap() {
            ServerPacket::Err(e) => {
                assert_eq!(e.error_code, 1096);
                assert_eq!(e.sql_state, "HY000");
                assert_eq!(e.message, "No database selected");
            }
            other => panic!("unexpected {:?}", other),
        }

        let eof = ServerPacket::parse(Bytes::from_static(&[0xFE, 0x00, 0x00, 0x02, 0x00])).unwrap();
        assert!(matches!(eof, ServerPacket::Eof(_)));
    }

    #[test]
    fn test_parse_auth_switch() {
        let mut data = vec![0xFE];
        data.extend_from_slice(b"mysql_native_password\0");
        data.extend_from_slice(b"12345678901234567890\0");
        match ServerPacket::parse_auth(Bytes::from(data)).unwrap() {
            ServerPacket::AuthSwitch { plugin, data } => {
                assert_eq!(plugin, "mysql_native_password");
                assert_eq!(&data[..], b"12345678901234567890");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    pub(crate) fn greeting_bytes(scramble: &[u8; 20], plugin: &str) -> Vec<u8> {
        use crate::auth::capabilities::*;
        let caps = PROTOCOL_41 | SECURE_CONNECTION | PLUGIN_AUTH | LONG_PASSWORD;
        let mut payload = PacketPayload::new();
        payload.write_int1(10);
        payload.write_string_nul(b"8.0.36");
        payload.write_int4(42);
        payload.write_bytes(&scramble[..8]);
        payload.write_int1(0);
        payload.write_int2((caps & 0xFFFF) as u16);
        payload.write_int1(45);
        payload.write_int2(2);
        payload.write_int2((caps >> 16) as u16);
        payload.write_int1(21);
        payload.write_reserved(10);
        payload.write_bytes(&scramble[8..]);
        payload.write_int1(0);
        payload.write_string_nul(plugin.as_bytes());
        payload.into_bytes().to_vec()
    }

    #[test]
    fn test_greeting_parse() {
        let scramble = *b"abcdefghijklmnopqrst";
        let greeting = GreetingPacket::parse(&greeting_bytes(&scramble, "caching_sha2_password")).unwrap();
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.thread_id, 42);
        assert_eq!(greeting.scramble, scramble.to_vec());
        assert_eq!(greeting.auth_plugin_name, "caching_sha2_password");
    }

    #[tokio::test]
    async fn test_channel_execute_ok() {
        let ok = frame(1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        let mock = tokio_test::io::Builder::new()
            .write(&frame(0, &query_command("SET @a = 1")))
            .read(&ok)
            .build();
        let mut channel = PacketChannel::new(mock);
        let result = channel.execute("SET @a = 1").await.unwrap();
        assert_eq!(result.status_flags, 2);
    }

    #[tokio::test]
    async fn test_channel_execute_error() {
        let mut err = vec![0xFF, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000");
        err.extend_from_slice(b"denied");
        let mock = tokio_test::io::Builder::new()
            .write(&frame(0, &query_command("SET @a = 1")))
            .read(&frame(1, &err))
            .build();
        let mut channel = PacketChannel::new(mock);
        match channel.execute("SET @a = 1").await {
            Err(CdcError::ServerError { code, sql_state, .. }) => {
                assert_eq!(code, 1045);
                assert_eq!(sql_state, "28000");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
