//! 재시작 가능한 스트림 위치
//!
//! MySQL은 binlog 파일명 + 오프셋 또는 GTID 집합, PostgreSQL은 WAL LSN을 사용합니다.
//! 모든 위치는 텍스트로 저장했다가 그대로 다시 파싱할 수 있습니다.

use crate::error::{CdcError, Result};
use crate::gtid::{looks_like_gtid, GtidSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// binlog 파일은 4바이트 magic 뒤부터 이벤트가 시작됨
pub const BINLOG_START_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let ordering = match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ if self.filename == other.filename => Ordering::Equal,
            _ => return None,
        };
        Some(
            ordering
                .then(self.position.cmp(&other.position))
                .then_with(|| self.filename.cmp(&other.filename)),
        )
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

impl FromStr for BinlogPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (filename, position) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| CdcError::InvalidPosition(format!("expected file:offset, got {}", s)))?;
        if filename.is_empty() {
            return Err(CdcError::InvalidPosition(format!("empty binlog filename: {}", s)));
        }
        let position = position
            .parse()
            .map_err(|_| CdcError::InvalidPosition(format!("invalid binlog offset: {}", s)))?;
        Ok(BinlogPosition::new(filename, position))
    }
}

/// PostgreSQL WAL log sequence number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || CdcError::InvalidPosition(format!("invalid LSN: {}", s));
        match s.split_once('/') {
            Some((high, low)) => {
                let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
                let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
                Ok(Lsn(((high as u64) << 32) | low as u64))
            }
            None => s.parse::<u64>().map(Lsn).map_err(|_| invalid()),
        }
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// 증분 수집 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum IngestPosition {
    Binlog(BinlogPosition),
    Gtid(GtidSet),
    Wal(Lsn),
}

impl IngestPosition {
    /// 아직 아무것도 읽지 않은 위치인지
    pub fn is_initial(&self) -> bool {
        match self {
            IngestPosition::Binlog(p) => p.filename.is_empty(),
            IngestPosition::Gtid(set) => set.is_empty(),
            IngestPosition::Wal(lsn) => *lsn == Lsn::INVALID,
        }
    }

    pub fn as_lsn(&self) -> Option<Lsn> {
        match self {
            IngestPosition::Wal(lsn) => Some(*lsn),
            _ => None,
        }
    }

    /// 두 위치 중 뒤쪽 (비교 불가면 self 유지)
    pub fn max(self, other: IngestPosition) -> IngestPosition {
        match other.partial_cmp(&self) {
            Some(Ordering::Greater) => other,
            _ => self,
        }
    }
}

impl PartialOrd for IngestPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (IngestPosition::Binlog(a), IngestPosition::Binlog(b)) => a.partial_cmp(b),
            (IngestPosition::Gtid(a), IngestPosition::Gtid(b)) => a.partial_cmp(b),
            (IngestPosition::Wal(a), IngestPosition::Wal(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for IngestPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestPosition::Binlog(p) => write!(f, "{}", p),
            IngestPosition::Gtid(set) => write!(f, "{}", set),
            IngestPosition::Wal(lsn) => write!(f, "{}", lsn),
        }
    }
}

impl FromStr for IngestPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CdcError::InvalidPosition("empty position".to_string()));
        }
        if looks_like_gtid(s) {
            return Ok(IngestPosition::Gtid(s.parse()?));
        }
        // LSN 텍스트에는 ':'가 없음. 경로가 붙은 binlog 파일명은 '/'를 포함할 수 있음
        if !s.contains(':') && (s.contains('/') || s.bytes().all(|b| b.is_ascii_digit())) {
            return Ok(IngestPosition::Wal(s.parse()?));
        }
        Ok(IngestPosition::Binlog(s.parse()?))
    }
}

/// `next`가 `previous`보다 뒤가 아니면 PositionRegression
pub fn ensure_not_behind(previous: &IngestPosition, next: &IngestPosition) -> Result<()> {
    match next.partial_cmp(previous) {
        Some(Ordering::Less) | None => Err(CdcError::PositionRegression {
            previous: previous.to_string(),
            next: next.to_string(),
        }),
        _ => Ok(()),
    }
}
