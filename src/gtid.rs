//! GTID (Global Transaction ID) 집합
//!
//! GTID 형식: UUID:sequence-number
//! 여러 서버의 GTID 집합을 추적: "uuid1:1-100:200,uuid2:1-50"

use crate::error::{CdcError, Result};
use crate::payload::PacketPayload;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 닫힌 구간 [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GtidInterval {
    pub start: u64,
    pub end: u64,
}

impl GtidInterval {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end {
            return Err(CdcError::GtidError(format!(
                "invalid interval {}-{}",
                start, end
            )));
        }
        Ok(GtidInterval { start, end })
    }

    pub fn contains(&self, gno: u64) -> bool {
        gno >= self.start && gno <= self.end
    }
}

impl fmt::Display for GtidInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for GtidInterval {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| CdcError::GtidError(format!("invalid interval: {}", s)))
        };
        match s.split_once('-') {
            Some((start, end)) => GtidInterval::new(parse(start)?, parse(end)?),
            None => {
                let gno = parse(s)?;
                GtidInterval::new(gno, gno)
            }
        }
    }
}

/// 정렬되고 병합된 구간 목록으로 정규화
fn normalize(mut intervals: Vec<GtidInterval>) -> Vec<GtidInterval> {
    intervals.sort();
    let mut merged: Vec<GtidInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            // 연접한 구간도 병합
            Some(last) if last.end.saturating_add(1) >= interval.start => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// 전체 GTID 집합 (server UUID 별 구간 목록)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, Vec<GtidInterval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|intervals| intervals.is_empty())
    }

    pub fn intervals(&self, sid: &Uuid) -> &[GtidInterval] {
        self.sets.get(sid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn sids(&self) -> impl Iterator<Item = &Uuid> {
        self.sets.keys()
    }

    /// 트랜잭션 하나 추가
    pub fn add(&mut self, sid: Uuid, gno: u64) -> Result<()> {
        let interval = GtidInterval::new(gno, gno)?;
        self.add_interval(sid, interval);
        Ok(())
    }

    pub fn add_interval(&mut self, sid: Uuid, interval: GtidInterval) {
        let intervals = self.sets.entry(sid).or_default();
        intervals.push(interval);
        *intervals = normalize(std::mem::take(intervals));
    }

    pub fn contains(&self, sid: &Uuid, gno: u64) -> bool {
        self.intervals(sid).iter().any(|i| i.contains(gno))
    }

    /// 합집합
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (sid, intervals) in &other.sets {
            for interval in intervals {
                result.add_interval(*sid, *interval);
            }
        }
        result
    }

    /// self ⊆ other
    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.sets.iter().all(|(sid, intervals)| {
            let theirs = other.intervals(sid);
            intervals.iter().all(|mine| {
                theirs
                    .iter()
                    .any(|t| t.start <= mine.start && mine.end <= t.end)
            })
        })
    }

    /// 차집합
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (sid, intervals) in &self.sets {
            let mut remaining = intervals.clone();
            for removed in other.intervals(sid) {
                let mut next = Vec::with_capacity(remaining.len() + 1);
                for range in remaining {
                    if range.end < removed.start || range.start > removed.end {
                        next.push(range);
                        continue;
                    }
                    if range.start < removed.start {
                        next.push(GtidInterval {
                            start: range.start,
                            end: removed.start - 1,
                        });
                    }
                    if range.end > removed.end {
                        next.push(GtidInterval {
                            start: removed.end + 1,
                            end: range.end,
                        });
                    }
                }
                remaining = next;
            }
            if !remaining.is_empty() {
                result.sets.insert(*sid, remaining);
            }
        }
        result
    }

    /// COM_BINLOG_DUMP_GTID 용 SID block 인코딩
    pub fn encode_sid_block(&self, payload: &mut PacketPayload) {
        let sets: Vec<_> = self.sets.iter().filter(|(_, i)| !i.is_empty()).collect();
        payload.write_int8(sets.len() as u64);
        for (sid, intervals) in sets {
            payload.write_bytes(sid.as_bytes());
            payload.write_int8(intervals.len() as u64);
            for interval in intervals {
                payload.write_int8(interval.start);
                // 서버 형식은 반열린 구간
                payload.write_int8(interval.end + 1);
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        8 + self
            .sets
            .values()
            .filter(|i| !i.is_empty())
            .map(|i| 16 + 8 + i.len() * 16)
            .sum::<usize>()
    }

    pub fn decode_sid_block(payload: &mut PacketPayload) -> Result<Self> {
        let mut set = GtidSet::new();
        let count = payload.read_int8()?;
        for _ in 0..count {
            let sid_bytes = payload.read_string_fix_bytes(16)?;
            let sid = Uuid::from_slice(&sid_bytes).map_err(|e| CdcError::GtidError(e.to_string()))?;
            let intervals = payload.read_int8()?;
            for _ in 0..intervals {
                let start = payload.read_int8()?;
                let end = payload.read_int8()?;
                set.add_interval(sid, GtidInterval::new(start, end.saturating_sub(1))?);
            }
        }
        Ok(set)
    }
}

impl PartialOrd for GtidSet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.is_subset_of(other), other.is_subset_of(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (sid, intervals) in &self.sets {
            if intervals.is_empty() {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", sid)?;
            for interval in intervals {
                write!(f, ":{}", interval)?;
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = CdcError;

    /// "uuid:1-5:7,uuid2:1-3" 형식. 구간만 있는 조각("uuid:1-5,7")은 직전 UUID에 붙임
    fn from_str(s: &str) -> Result<Self> {
        let mut set = GtidSet::new();
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NULL") {
            return Ok(set);
        }

        let mut current: Option<Uuid> = None;
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut pieces = part.split(':');
            let head = pieces.next().unwrap_or_default().trim();
            let sid = match Uuid::parse_str(head) {
                Ok(sid) => sid,
                Err(_) => {
                    let sid = current
                        .ok_or_else(|| CdcError::GtidError(format!("invalid GTID set: {}", s)))?;
                    set.add_interval(sid, head.parse()?);
                    continue;
                }
            };
            let mut any = false;
            for piece in pieces {
                set.add_interval(sid, piece.parse()?);
                any = true;
            }
            if !any {
                return Err(CdcError::GtidError(format!("missing intervals for {}", sid)));
            }
            current = Some(sid);
        }
        Ok(set)
    }
}

/// 텍스트가 GTID 집합 형식인지 (첫 ':' 앞이 UUID)
pub fn looks_like_gtid(text: &str) -> bool {
    text.trim()
        .split_once(':')
        .map(|(head, _)| Uuid::parse_str(head.trim()).is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "550e8400-e29b-41d4-a716-446655440000";
    const SID2: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn sid(text: &str) -> Uuid {
        Uuid::parse_str(text).unwrap()
    }

    #[test]
    fn test_gtid_parse_and_display() {
        let set: GtidSet = format!("{}:1-100:200:300-400,{}:1-5", SID, SID2).parse().unwrap();
        assert!(set.contains(&sid(SID), 200));
        assert!(!set.contains(&sid(SID), 201));
        assert!(set.contains(&sid(SID2), 5));
        // BTreeMap 정렬 순서로 출력
        assert_eq!(
            set.to_string(),
            format!("{}:1-5,{}:1-100:200:300-400", SID2, SID)
        );
    }

    #[test]
    fn test_gtid_parse_lenient_forms() {
        let set: GtidSet = format!("{}:1-100,200,\n{}:7", SID, SID2).parse().unwrap();
        assert!(set.contains(&sid(SID), 200));
        assert!(set.contains(&sid(SID2), 7));
        assert!(GtidSet::from_str("").unwrap().is_empty());
        assert!(GtidSet::from_str("1-5").is_err());
        assert!(GtidSet::from_str(&format!("{}:0", SID)).is_err());
    }

    #[test]
    fn test_gtid_add_merges_adjacent() {
        let mut set = GtidSet::new();
        set.add(sid(SID), 1).unwrap();
        set.add(sid(SID), 3).unwrap();
        set.add(sid(SID), 2).unwrap();
        assert_eq!(set.intervals(&sid(SID)), &[GtidInterval { start: 1, end: 3 }]);
    }

    #[test]
    fn test_gtid_union_and_order() {
        let a: GtidSet = format!("{}:1-5", SID).parse().unwrap();
        let b: GtidSet = format!("{}:6-9,{}:1", SID, SID2).parse().unwrap();
        let union = a.union(&b);
        assert_eq!(union.to_string(), format!("{}:1,{}:1-9", SID2, SID));
        assert!(a < union);
        assert!(union > b);
        assert_eq!(a.partial_cmp(&b), None);
        assert_eq!(a.partial_cmp(&a.clone()), Some(Ordering::Equal));
    }

    #[test]
    fn test_gtid_subtract() {
        let a: GtidSet = format!("{}:1-10", SID).parse().unwrap();
        let b: GtidSet = format!("{}:3-4:8", SID).parse().unwrap();
        assert_eq!(a.subtract(&b).to_string(), format!("{}:1-2:5-7:9-10", SID));
        assert!(a.subtract(&a).is_empty());
    }

    #[test]
    fn test_sid_block_encoding() {
        let set: GtidSet = format!("{}:1-5:7", SID).parse().unwrap();
        let mut payload = PacketPayload::new();
        set.encode_sid_block(&mut payload);
        assert_eq!(payload.remaining(), set.encoded_len());
        assert_eq!(payload.remaining(), 8 + 16 + 8 + 2 * 16);

        let bytes = payload.as_slice().to_vec();
        // 첫 구간 끝은 반열린 6
        assert_eq!(&bytes[32..40], &1u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &6u64.to_le_bytes());

        let decoded = GtidSet::decode_sid_block(&mut payload).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_looks_like_gtid() {
        assert!(looks_like_gtid(&format!("{}:1-3", SID)));
        assert!(!looks_like_gtid("mysql-bin.000003:4"));
        assert!(!looks_like_gtid("0/16B3748"));
    }
}
