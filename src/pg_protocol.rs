//! PostgreSQL 메시지 프레이밍
//!
//! - `PgMessageCodec`: 타입 1 바이트 + big-endian 길이 4 바이트 (자기 자신 포함) 프레이밍
//! - `BackendMessage`: 복제 연결에서 필요한 백엔드 메시지
//! - `ReplicationMessage`: CopyData 안의 XLogData / primary keepalive
//! - `encode_standby_status`: standby status update (`r`) 인코딩

use crate::error::{CdcError, Result};
use crate::position::Lsn;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio_util::codec::{Decoder, Encoder};

/// 2000-01-01 00:00:00 UTC의 unix epoch 초
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// 타입 + 길이
const MESSAGE_HEADER_LENGTH: usize = 5;

const DEFAULT_MAX_MESSAGE: usize = 1 << 30;

/// 백엔드 메시지 하나 (타입 바이트와 본문)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgMessage {
    pub tag: u8,
    pub body: Bytes,
}

/// PostgreSQL 메시지 코덱
///
/// 디코딩은 백엔드 메시지를, 인코딩은 이미 프레이밍된 프론트엔드 메시지 바이트를 다룹니다.
#[derive(Debug)]
pub struct PgMessageCodec {
    stream_offset: u64,
    max_length: usize,
}

impl Default for PgMessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PgMessageCodec {
    pub fn new() -> Self {
        PgMessageCodec {
            stream_offset: 0,
            max_length: DEFAULT_MAX_MESSAGE,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }
}

impl Decoder for PgMessageCodec {
    type Item = PgMessage;
    type Error = CdcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PgMessage>> {
        if src.len() < MESSAGE_HEADER_LENGTH {
            src.reserve(MESSAGE_HEADER_LENGTH - src.len());
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length < 4 || length > self.max_length {
            return Err(CdcError::decode(
                self.stream_offset,
                format!("malformed message length {} for type '{}'", length, src[0] as char),
            ));
        }

        let total = 1 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let tag = src[0];
        src.advance(MESSAGE_HEADER_LENGTH);
        let body = src.split_to(length - 4).freeze();
        self.stream_offset += total as u64;
        Ok(Some(PgMessage { tag, body }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<PgMessage>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(CdcError::decode(
                self.stream_offset,
                format!("stream truncated with {} buffered bytes", src.len()),
            )),
        }
    }
}

impl Encoder<Bytes> for PgMessageCodec {
    type Error = CdcError;

    fn encode(&mut self, message: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&message);
        Ok(())
    }
}

/// 범위 검사가 있는 big-endian 본문 읽기
#[derive(Debug, Clone)]
pub(crate) struct MessageReader {
    buf: Bytes,
    offset: usize,
}

impl MessageReader {
    pub(crate) fn new(buf: Bytes) -> Self {
        MessageReader { buf, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, n: usize, what: &str) -> Result<Bytes> {
        if self.remaining() < n {
            return Err(CdcError::decode(
                self.offset as u64,
                format!("truncated {}: need {} bytes, have {}", what, n, self.remaining()),
            ));
        }
        let bytes = self.buf.slice(self.offset..self.offset + n);
        self.offset += n;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        Ok(self.take(2, "int16")?.get_i16())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(self.take(4, "int32")?.get_i32())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(self.take(4, "uint32")?.get_u32())
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(self.take(8, "int64")?.get_i64())
    }

    pub(crate) fn lsn(&mut self) -> Result<Lsn> {
        Ok(Lsn(self.take(8, "LSN")?.get_u64()))
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.take(n, "bytes")
    }

    pub(crate) fn rest(&mut self) -> Bytes {
        let rest = self.buf.slice(self.offset..);
        self.offset = self.buf.len();
        rest
    }

    /// NUL 종료 문자열
    pub(crate) fn cstr(&mut self) -> Result<String> {
        let end = self.buf[self.offset..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CdcError::decode(self.offset as u64, "unterminated string"))?;
        let raw = self.take(end, "string")?;
        self.offset += 1;
        String::from_utf8(raw.to_vec())
            .map_err(|e| CdcError::decode(self.offset as u64, format!("invalid UTF-8: {}", e)))
    }
}

/// 인증 요청 ('R')
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue(Bytes),
    SaslFinal(Bytes),
    Unsupported(i32),
}

/// ErrorResponse / NoticeResponse 필드
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl PgServerError {
    fn parse(body: Bytes) -> Result<Self> {
        let mut reader = MessageReader::new(body);
        let mut error = PgServerError::default();
        loop {
            let field = reader.u8()?;
            if field == 0 {
                return Ok(error);
            }
            let value = reader.cstr()?;
            match field {
                b'V' => error.severity = value,
                b'S' if error.severity.is_empty() => error.severity = value,
                b'C' => error.code = value,
                b'M' => error.message = value,
                b'D' => error.detail = Some(value),
                _ => {}
            }
        }
    }

    /// SQLSTATE 클래스에 따라 CDC 에러로 변환
    pub fn into_error(self) -> CdcError {
        let message = match &self.detail {
            Some(detail) => format!("{}: {} ({})", self.severity, self.message, detail),
            None => format!("{}: {}", self.severity, self.message),
        };
        match self.code.as_str() {
            "28000" | "28P01" => CdcError::AuthenticationError(message),
            code if code.starts_with("08") || code.starts_with("57P") => {
                CdcError::ConnectionError(format!("{} [{}]", message, code))
            }
            _ => CdcError::QueryError {
                message,
                sql_state: Some(self.code),
            },
        }
    }
}

/// 복제 연결에서 다루는 백엔드 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(u8),
    ErrorResponse(PgServerError),
    NoticeResponse(PgServerError),
    CopyBothResponse,
    CopyData(Bytes),
    CopyDone,
    CommandComplete(String),
    Other(u8),
}

impl BackendMessage {
    pub fn parse(message: PgMessage) -> Result<Self> {
        let PgMessage { tag, body } = message;
        let mut reader = MessageReader::new(body.clone());
        Ok(match tag {
            b'R' => BackendMessage::Authentication(match reader.i32()? {
                0 => AuthRequest::Ok,
                3 => AuthRequest::CleartextPassword,
                5 => {
                    let salt = reader.bytes(4)?;
                    AuthRequest::Md5Password {
                        salt: [salt[0], salt[1], salt[2], salt[3]],
                    }
                }
                10 => {
                    let mut mechanisms = Vec::new();
                    while reader.remaining() > 0 {
                        let mechanism = reader.cstr()?;
                        if mechanism.is_empty() {
                            break;
                        }
                        mechanisms.push(mechanism);
                    }
                    AuthRequest::Sasl { mechanisms }
                }
                11 => AuthRequest::SaslContinue(reader.rest()),
                12 => AuthRequest::SaslFinal(reader.rest()),
                other => AuthRequest::Unsupported(other),
            }),
            b'S' => BackendMessage::ParameterStatus {
                name: reader.cstr()?,
                value: reader.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: reader.i32()?,
                secret_key: reader.i32()?,
            },
            b'Z' => BackendMessage::ReadyForQuery(reader.u8()?),
            b'E' => BackendMessage::ErrorResponse(PgServerError::parse(body)?),
            b'N' => BackendMessage::NoticeResponse(PgServerError::parse(body)?),
            b'W' => BackendMessage::CopyBothResponse,
            b'd' => BackendMessage::CopyData(body),
            b'c' => BackendMessage::CopyDone,
            b'C' => BackendMessage::CommandComplete(reader.cstr()?),
            other => BackendMessage::Other(other),
        })
    }
}

/// CopyData 안의 복제 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        send_time: i64,
        data: Bytes,
    },
    PrimaryKeepalive {
        wal_end: Lsn,
        send_time: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(data: Bytes) -> Result<Self> {
        let mut reader = MessageReader::new(data);
        match reader.u8()? {
            b'w' => Ok(ReplicationMessage::XLogData {
                wal_start: reader.lsn()?,
                wal_end: reader.lsn()?,
                send_time: reader.i64()?,
                data: reader.rest(),
            }),
            b'k' => Ok(ReplicationMessage::PrimaryKeepalive {
                wal_end: reader.lsn()?,
                send_time: reader.i64()?,
                reply_requested: reader.u8()? != 0,
            }),
            other => Err(CdcError::decode(
                0,
                format!("unknown replication message type 0x{:02X}", other),
            )),
        }
    }
}

/// 2000-01-01 기준 마이크로초
pub fn to_pg_timestamp(time: DateTime<Utc>) -> i64 {
    (time.timestamp() - PG_EPOCH_OFFSET_SECS) * 1_000_000 + time.timestamp_subsec_micros() as i64
}

pub fn from_pg_timestamp(micros: i64) -> Option<DateTime<Utc>> {
    let seconds = micros.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let nanos = micros.rem_euclid(1_000_000) as u32 * 1000;
    DateTime::from_timestamp(seconds, nanos)
}

/// CopyData로 감싼 standby status update
pub fn encode_standby_status(
    write: Lsn,
    flush: Lsn,
    apply: Lsn,
    client_time: DateTime<Utc>,
    reply_requested: bool,
) -> Bytes {
    let mut body = BytesMut::with_capacity(34);
    body.put_u8(b'r');
    body.put_u64(write.0);
    body.put_u64(flush.0);
    body.put_u64(apply.0);
    body.put_i64(to_pg_timestamp(client_time));
    body.put_u8(reply_requested as u8);

    let mut frame = BytesMut::with_capacity(MESSAGE_HEADER_LENGTH + body.len());
    frame.put_u8(b'd');
    frame.put_u32((4 + body.len()) as u32);
    frame.put_slice(&body);
    frame.freeze()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn message(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub(crate) fn xlog_data(wal_start: u64, wal_end: u64, data: &[u8]) -> Vec<u8> {
        let mut body = vec![b'w'];
        body.extend_from_slice(&wal_start.to_be_bytes());
        body.extend_from_slice(&wal_end.to_be_bytes());
        body.extend_from_slice(&0i64.to_be_bytes());
        body.extend_from_slice(data);
        body
    }

    pub(crate) fn keepalive(wal_end: u64, reply_requested: bool) -> Vec<u8> {
        let mut body = vec![b'k'];
        body.extend_from_slice(&wal_end.to_be_bytes());
        body.extend_from_slice(&0i64.to_be_bytes());
        body.push(reply_requested as u8);
        body
    }

    pub(crate) fn error_body(code: &str, text: &str) -> Vec<u8> {
        let mut body = Vec::new();
        for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', text)] {
            body.push(field);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        body
    }

    #[test]
    fn test_decode_waits_for_full_message() {
        let mut codec = PgMessageCodec::new();
        let bytes = message(b'Z', b"I");
        let mut buf = BytesMut::from(&bytes[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[3..]);
        buf.extend_from_slice(&message(b'c', b"")[..2]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.tag, b'Z');
        assert_eq!(&decoded.body[..], b"I");
        assert_eq!(codec.stream_offset(), 6);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_decode_rejects_malformed_length() {
        let mut codec = PgMessageCodec::new();
        let mut buf = BytesMut::from(&[b'd', 0, 0, 0, 3][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CdcError::ProtocolDecode { offset: 0, .. })
        ));

        let mut codec = PgMessageCodec::new().with_max_length(16);
        let mut buf = BytesMut::from(&message(b'd', &[0u8; 32])[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_eof_truncated() {
        let mut codec = PgMessageCodec::new();
        let mut buf = BytesMut::from(&message(b'd', b"abcdef")[..7]);
        assert!(codec.decode_eof(&mut buf).is_err());
        assert!(codec.decode_eof(&mut BytesMut::new()).unwrap().is_none());
    }

    #[test]
    fn test_parse_authentication_requests() {
        let parse = |body: &[u8]| {
            BackendMessage::parse(PgMessage {
                tag: b'R',
                body: Bytes::copy_from_slice(body),
            })
            .unwrap()
        };
        assert_eq!(
            parse(&[0, 0, 0, 5, 1, 2, 3, 4]),
            BackendMessage::Authentication(AuthRequest::Md5Password { salt: [1, 2, 3, 4] })
        );
        assert_eq!(
            parse(b"\0\0\0\x0aSCRAM-SHA-256\0SCRAM-SHA-256-PLUS\0\0"),
            BackendMessage::Authentication(AuthRequest::Sasl {
                mechanisms: vec!["SCRAM-SHA-256".into(), "SCRAM-SHA-256-PLUS".into()],
            })
        );
        assert_eq!(
            parse(&[0, 0, 0, 7]),
            BackendMessage::Authentication(AuthRequest::Unsupported(7))
        );
    }

    #[test]
    fn test_error_response_classification() {
        let parse = |code: &str| match BackendMessage::parse(PgMessage {
            tag: b'E',
            body: Bytes::from(error_body(code, "boom")),
        })
        .unwrap()
        {
            BackendMessage::ErrorResponse(e) => e,
            other => panic!("unexpected {:?}", other),
        };

        let slot_busy = parse("55006");
        assert_eq!(slot_busy.message, "boom");
        let err = slot_busy.into_error();
        assert_eq!(err.sql_state(), Some("55006"));
        assert!(!err.is_retryable());

        assert!(matches!(
            parse("28P01").into_error(),
            CdcError::AuthenticationError(_)
        ));
        assert!(parse("57P01").into_error().is_retryable());
    }

    #[test]
    fn test_parse_replication_messages() {
        let xlog = ReplicationMessage::parse(Bytes::from(xlog_data(0x10, 0x20, b"BEGIN 7"))).unwrap();
        assert_eq!(
            xlog,
            ReplicationMessage::XLogData {
                wal_start: Lsn(0x10),
                wal_end: Lsn(0x20),
                send_time: 0,
                data: Bytes::from_static(b"BEGIN 7"),
            }
        );

        let keepalive = ReplicationMessage::parse(Bytes::from(keepalive(0x30, true))).unwrap();
        assert_eq!(
            keepalive,
            ReplicationMessage::PrimaryKeepalive {
                wal_end: Lsn(0x30),
                send_time: 0,
                reply_requested: true,
            }
        );

        assert!(ReplicationMessage::parse(Bytes::from_static(b"k\0\0")).is_err());
        assert!(ReplicationMessage::parse(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_standby_status_layout() {
        let time = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap();
        let frame = encode_standby_status(Lsn(0x300), Lsn(0x200), Lsn(0x100), time, false);
        assert_eq!(frame.len(), 39);
        assert_eq!(&frame[..6], &[b'd', 0, 0, 0, 38, b'r']);
        assert_eq!(&frame[6..14], &0x300u64.to_be_bytes());
        assert_eq!(&frame[14..22], &0x200u64.to_be_bytes());
        assert_eq!(&frame[22..30], &0x100u64.to_be_bytes());
        assert_eq!(&frame[30..38], &1_000_000i64.to_be_bytes());
        assert_eq!(frame[38], 0);
    }

    #[test]
    fn test_pg_timestamp_conversion() {
        let time = Utc.with_ymd_and_hms(2019, 10, 16, 8, 32, 13).unwrap();
        let micros = to_pg_timestamp(time);
        assert_eq!(from_pg_timestamp(micros), Some(time));
        assert_eq!(
            from_pg_timestamp(-1_000_000),
            Some(Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap())
        );
    }
}
