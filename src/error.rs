//! CDC 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("연결 에러: {0}")]
    ConnectionError(String),

    #[error("인증 실패: {0}")]
    AuthenticationError(String),

    #[error("프로토콜 디코딩 에러 (offset {offset}): {message}")]
    ProtocolDecode { offset: u64, message: String },

    #[error("지원하지 않는 컬럼 타입: column={column}, type code={type_code}")]
    UnsupportedColumnType { column: String, type_code: u8 },

    #[error("테이블 메타데이터 없음: {0}")]
    MissingTableMetadata(String),

    #[error("이벤트 디코딩 실패 (position {position}): {source}")]
    EventDecode {
        position: String,
        #[source]
        source: Box<CdcError>,
    },

    #[error("값 디코딩 에러: {0}")]
    ValueError(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("잘못된 위치 정보: {0}")]
    InvalidPosition(String),

    #[error("위치 역행: {previous} -> {next}")]
    PositionRegression { previous: String, next: String },

    #[error("쿼리 실행 에러: {message}")]
    QueryError {
        message: String,
        sql_state: Option<String>,
    },

    #[error("서버 에러 {code} ({sql_state}): {message}")]
    ServerError {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("재시도 횟수 초과 ({attempts}회): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 디코딩 에러 생성 헬퍼
    pub fn decode(offset: u64, message: impl Into<String>) -> Self {
        CdcError::ProtocolDecode {
            offset,
            message: message.into(),
        }
    }

    /// SQLSTATE 없는 쿼리 에러
    pub fn query(message: impl Into<String>) -> Self {
        CdcError::QueryError {
            message: message.into(),
            sql_state: None,
        }
    }

    /// 재연결로 복구 가능한 에러인지 여부
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CdcError::ConnectionError(_) | CdcError::IoError(_) | CdcError::Timeout
        )
    }

    /// 서버가 돌려준 SQLSTATE
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            CdcError::QueryError { sql_state, .. } => sql_state.as_deref(),
            CdcError::ServerError { sql_state, .. } => Some(sql_state.as_str()),
            _ => None,
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CdcError::IoError("reset".into()).is_retryable());
        assert!(CdcError::Timeout.is_retryable());
        assert!(!CdcError::decode(10, "bad header").is_retryable());
        assert!(!CdcError::UnsupportedColumnType {
            column: "c1".into(),
            type_code: 0xF3,
        }
        .is_retryable());
    }

    #[test]
    fn test_sql_state() {
        let err = CdcError::QueryError {
            message: "slot exists".into(),
            sql_state: Some("42710".into()),
        };
        assert_eq!(err.sql_state(), Some("42710"));
        assert_eq!(CdcError::Timeout.sql_state(), None);
    }
}
