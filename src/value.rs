//! 컬럼 값 코덱
//!
//! Binlog row image의 컬럼 값을 `ColumnValue`로 디코딩하고, 반대로 인코딩합니다.
//! TIME2 / DATETIME2 / TIMESTAMP2는 서버의 packed 정수 형식을 그대로 따르므로
//! 디코딩과 인코딩이 정확히 역함수 관계입니다.

use crate::decimal;
use crate::error::{CdcError, Result};
use crate::json;
use crate::payload::PacketPayload;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const TIMEF_INT_OFS: i64 = 0x80_0000;
const TIMEF_OFS: i64 = 0x8000_0000_0000;
const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;

/// MySQL 컬럼 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    NewDate,
    Varchar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    TypedArray,
    Vector,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
}

impl ColumnType {
    pub fn from_code(code: u8) -> Option<Self> {
        use ColumnType::*;
        Some(match code {
            0 => Decimal,
            1 => Tiny,
            2 => Short,
            3 => Long,
            4 => Float,
            5 => Double,
            6 => Null,
            7 => Timestamp,
            8 => LongLong,
            9 => Int24,
            10 => Date,
            11 => Time,
            12 => DateTime,
            13 => Year,
            14 => NewDate,
            15 => Varchar,
            16 => Bit,
            17 => Timestamp2,
            18 => DateTime2,
            19 => Time2,
            20 => TypedArray,
            242 => Vector,
            245 => Json,
            246 => NewDecimal,
            247 => Enum,
            248 => Set,
            249 => TinyBlob,
            250 => MediumBlob,
            251 => LongBlob,
            252 => Blob,
            253 => VarString,
            254 => String,
            255 => Geometry,
            _ => return None,
        })
    }

    pub fn code(&self) -> u8 {
        use ColumnType::*;
        match self {
            Decimal => 0,
            Tiny => 1,
            Short => 2,
            Long => 3,
            Float => 4,
            Double => 5,
            Null => 6,
            Timestamp => 7,
            LongLong => 8,
            Int24 => 9,
            Date => 10,
            Time => 11,
            DateTime => 12,
            Year => 13,
            NewDate => 14,
            Varchar => 15,
            Bit => 16,
            Timestamp2 => 17,
            DateTime2 => 18,
            Time2 => 19,
            TypedArray => 20,
            Vector => 242,
            Json => 245,
            NewDecimal => 246,
            Enum => 247,
            Set => 248,
            TinyBlob => 249,
            MediumBlob => 250,
            LongBlob => 251,
            Blob => 252,
            VarString => 253,
            String => 254,
            Geometry => 255,
        }
    }

    /// TABLE_MAP SIGNEDNESS 메타데이터 대상 여부
    pub fn is_numeric(&self) -> bool {
        use ColumnType::*;
        matches!(
            self,
            Tiny | Short | Int24 | Long | LongLong | Float | Double | NewDecimal | Decimal
        )
    }
}

/// TABLE_MAP 메타데이터 블록에서 컬럼 메타 읽기
pub fn read_column_meta(column_type: ColumnType, payload: &mut PacketPayload) -> Result<u16> {
    use ColumnType::*;
    Ok(match column_type {
        Float | Double | Blob | TinyBlob | MediumBlob | LongBlob | Geometry | Json | Vector
        | Time2 | DateTime2 | Timestamp2 => payload.read_int1()? as u16,
        Varchar | VarString | Bit => payload.read_int2()?,
        NewDecimal | String | Enum | Set => {
            let first = payload.read_int1()? as u16;
            let second = payload.read_int1()? as u16;
            (first << 8) | second
        }
        _ => 0,
    })
}

/// `read_column_meta`의 역
pub fn write_column_meta(column_type: ColumnType, meta: u16, payload: &mut PacketPayload) {
    use ColumnType::*;
    match column_type {
        Float | Double | Blob | TinyBlob | MediumBlob | LongBlob | Geometry | Json | Vector
        | Time2 | DateTime2 | Timestamp2 => payload.write_int1(meta as u8),
        Varchar | VarString | Bit => payload.write_int2(meta),
        NewDecimal | String | Enum | Set => {
            payload.write_int1((meta >> 8) as u8);
            payload.write_int1(meta as u8);
        }
        _ => {}
    }
}

/// 컬럼 정의 (TABLE_MAP에서 파싱)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub type_code: u8,
    pub meta: u16,
    pub unsigned: bool,
    pub nullable: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType, meta: u16) -> Self {
        ColumnDefinition {
            name: name.into(),
            type_code: column_type.code(),
            meta,
            unsigned: false,
            nullable: true,
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn column_type(&self) -> Result<ColumnType> {
        ColumnType::from_code(self.type_code).ok_or_else(|| self.unsupported())
    }

    fn unsupported(&self) -> CdcError {
        CdcError::UnsupportedColumnType {
            column: self.name.clone(),
            type_code: self.type_code,
        }
    }

    /// 소수점 이하 초 자릿수 (TIME2 / DATETIME2 / TIMESTAMP2)
    pub fn fsp(&self) -> u16 {
        self.meta
    }
}

/// DATE 값 (0000-00-00 허용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateValue {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl DateValue {
    pub const ZERO: DateValue = DateValue {
        year: 0,
        month: 0,
        day: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn to_naive(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        DateValue {
            year: date.year() as u16,
            month: date.month() as u8,
            day: date.day() as u8,
        }
    }
}

impl fmt::Display for DateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// TIME 값 (-838:59:59 ~ 838:59:59)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeValue {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub nanos: u32,
}

impl TimeValue {
    pub const ZERO: TimeValue = TimeValue {
        negative: false,
        hours: 0,
        minutes: 0,
        seconds: 0,
        nanos: 0,
    };

    pub fn new(hours: u32, minutes: u8, seconds: u8) -> Self {
        TimeValue {
            negative: false,
            hours,
            minutes,
            seconds,
            nanos: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.hours == 0 && self.minutes == 0 && self.seconds == 0 && self.nanos == 0
    }

    /// 서버 packed 형식 ((hms << 24) + microseconds, 부호 포함)에서 변환
    pub fn from_packed(packed: i64) -> Self {
        let negative = packed < 0;
        let abs = packed.unsigned_abs();
        let hms = abs >> 24;
        TimeValue {
            negative,
            hours: ((hms >> 12) % (1 << 10)) as u32,
            minutes: ((hms >> 6) % 64) as u8,
            seconds: (hms % 64) as u8,
            nanos: ((abs % (1 << 24)) * 1000) as u32,
        }
    }

    pub fn to_packed(&self) -> i64 {
        let hms = ((self.hours as i64) << 12) | ((self.minutes as i64) << 6) | self.seconds as i64;
        let packed = (hms << 24) + (self.nanos / 1000) as i64;
        if self.negative {
            -packed
        } else {
            packed
        }
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative && !self.is_zero() {
            write!(f, "-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        write_fraction(f, self.nanos)
    }
}

/// DATETIME 값 (0000-00-00 00:00:00 허용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateTimeValue {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub nanos: u32,
}

impl DateTimeValue {
    pub const ZERO: DateTimeValue = DateTimeValue {
        year: 0,
        month: 0,
        day: 0,
        hour: 0,
        minute: 0,
        second: 0,
        nanos: 0,
    };

    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        DateTimeValue {
            year,
            month,
            day,
            hour,
            minute,
            second,
            nanos: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn from_packed(packed: i64) -> Self {
        let abs = packed.unsigned_abs();
        let ymdhms = abs >> 24;
        let ymd = ymdhms >> 17;
        let ym = ymd >> 5;
        let hms = ymdhms % (1 << 17);
        DateTimeValue {
            year: (ym / 13) as u16,
            month: (ym % 13) as u8,
            day: (ymd % 32) as u8,
            hour: (hms >> 12) as u8,
            minute: ((hms >> 6) % 64) as u8,
            second: (hms % 64) as u8,
            nanos: ((abs % (1 << 24)) * 1000) as u32,
        }
    }

    pub fn to_packed(&self) -> i64 {
        let ymd = (((self.year as i64) * 13 + self.month as i64) << 5) | self.day as i64;
        let hms = ((self.hour as i64) << 12) | ((self.minute as i64) << 6) | self.second as i64;
        (((ymd << 17) | hms) << 24) + (self.nanos / 1000) as i64
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?
            .and_hms_nano_opt(self.hour as u32, self.minute as u32, self.second as u32, self.nanos)
    }

    pub fn from_naive(value: NaiveDateTime) -> Self {
        DateTimeValue {
            year: value.year() as u16,
            month: value.month() as u8,
            day: value.day() as u8,
            hour: value.hour() as u8,
            minute: value.minute() as u8,
            second: value.second() as u8,
            nanos: value.nanosecond(),
        }
    }
}

impl fmt::Display for DateTimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )?;
        write_fraction(f, self.nanos)
    }
}

/// TIMESTAMP 값 (epoch 초, 0은 zero datetime)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimestampValue {
    pub seconds: u32,
    pub nanos: u32,
}

impl TimestampValue {
    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.nanos == 0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if self.is_zero() {
            return None;
        }
        DateTime::from_timestamp(self.seconds as i64, self.nanos)
    }
}

impl fmt::Display for TimestampValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(datetime) => {
                write!(f, "{}", datetime.format("%Y-%m-%d %H:%M:%S"))?;
                write_fraction(f, self.nanos)
            }
            None => write!(f, "{}", DateTimeValue::ZERO),
        }
    }
}

fn write_fraction(f: &mut fmt::Formatter<'_>, nanos: u32) -> fmt::Result {
    if nanos == 0 {
        Ok(())
    } else if nanos % 1000 == 0 {
        write!(f, ".{:06}", nanos / 1000)
    } else {
        write!(f, ".{:09}", nanos)
    }
}

/// 정규화된 컬럼 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    String(String),
    Bytes(Vec<u8>),
    Bit(Vec<u8>),
    Enum(u16),
    Set(u64),
    /// 0은 zero year
    Year(u16),
    Date(DateValue),
    Time(TimeValue),
    DateTime(DateTimeValue),
    Timestamp(TimestampValue),
    TimestampTz(DateTime<FixedOffset>),
    Json(serde_json::Value),
    Uuid(Uuid),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// UTF-8이면 문자열, 아니면 원본 바이트
    pub fn from_text_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => ColumnValue::String(text),
            Err(e) => ColumnValue::Bytes(e.into_bytes()),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Bool(v) => write!(f, "{}", v),
            ColumnValue::Int(v) => write!(f, "{}", v),
            ColumnValue::UInt(v) => write!(f, "{}", v),
            ColumnValue::Float(v) => write!(f, "{}", v),
            ColumnValue::Double(v) => write!(f, "{}", v),
            ColumnValue::Decimal(v) => write!(f, "{}", v),
            ColumnValue::String(v) => write!(f, "{}", v),
            ColumnValue::Bytes(v) | ColumnValue::Bit(v) => write!(f, "0x{}", hex::encode(v)),
            ColumnValue::Enum(v) => write!(f, "{}", v),
            ColumnValue::Set(v) => write!(f, "{}", v),
            ColumnValue::Year(v) => write!(f, "{:04}", v),
            ColumnValue::Date(v) => write!(f, "{}", v),
            ColumnValue::Time(v) => write!(f, "{}", v),
            ColumnValue::DateTime(v) => write!(f, "{}", v),
            ColumnValue::Timestamp(v) => write!(f, "{}", v),
            ColumnValue::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
            ColumnValue::Json(v) => write!(f, "{}", v),
            ColumnValue::Uuid(v) => write!(f, "{}", v),
        }
    }
}

fn fraction_width(column: &ColumnDefinition) -> Result<usize> {
    match column.fsp() {
        0 => Ok(0),
        1 | 2 => Ok(1),
        3 | 4 => Ok(2),
        5 | 6 => Ok(3),
        other => Err(CdcError::ValueError(format!(
            "column {}: invalid fractional seconds precision {}",
            column.name, other
        ))),
    }
}

/// STRING 컬럼 메타에서 (실제 타입, 길이) 추출
fn string_real_type(meta: u16) -> (u8, u16) {
    let mut real_type = (meta >> 8) as u8;
    let mut length = meta & 0xFF;
    if real_type & 0x30 != 0x30 {
        length |= (((real_type & 0x30) ^ 0x30) as u16) << 4;
        real_type |= 0x30;
    }
    (real_type, length)
}

fn blob_length_bytes(column: &ColumnDefinition) -> Result<usize> {
    match column.meta {
        1..=4 => Ok(column.meta as usize),
        other => Err(CdcError::ValueError(format!(
            "column {}: invalid blob length width {}",
            column.name, other
        ))),
    }
}

fn bit_length(meta: u16) -> usize {
    let bits = (meta >> 8) as usize * 8 + (meta & 0xFF) as usize;
    (bits + 7) / 8
}

/// Binlog row image에서 컬럼 값 하나 읽기
pub fn read_binlog_value(column: &ColumnDefinition, payload: &mut PacketPayload) -> Result<ColumnValue> {
    use ColumnType as T;

    let value = match column.column_type()? {
        T::Tiny => {
            let v = payload.read_int1()?;
            if column.unsigned {
                ColumnValue::UInt(v as u64)
            } else {
                ColumnValue::Int(v as i8 as i64)
            }
        }
        T::Short => {
            let v = payload.read_int2()?;
            if column.unsigned {
                ColumnValue::UInt(v as u64)
            } else {
                ColumnValue::Int(v as i16 as i64)
            }
        }
        T::Int24 => {
            let v = payload.read_int3()?;
            if column.unsigned {
                ColumnValue::UInt(v as u64)
            } else if v & 0x80_0000 != 0 {
                ColumnValue::Int(v as i64 - 0x100_0000)
            } else {
                ColumnValue::Int(v as i64)
            }
        }
        T::Long => {
            let v = payload.read_int4()?;
            if column.unsigned {
                ColumnValue::UInt(v as u64)
            } else {
                ColumnValue::Int(v as i32 as i64)
            }
        }
        T::LongLong => {
            let v = payload.read_int8()?;
            if column.unsigned {
                ColumnValue::UInt(v)
            } else {
                ColumnValue::Int(v as i64)
            }
        }
        T::Float => ColumnValue::Float(payload.read_f32()?),
        T::Double => ColumnValue::Double(payload.read_f64()?),
        T::NewDecimal => {
            let precision = (column.meta >> 8) as u8;
            let scale = column.meta as u8;
            ColumnValue::Decimal(decimal::read_decimal(payload, precision, scale)?)
        }
        T::Year => match payload.read_int1()? {
            0 => ColumnValue::Year(0),
            v => ColumnValue::Year(1900 + v as u16),
        },
        T::Date => {
            let v = payload.read_int3()?;
            ColumnValue::Date(DateValue {
                year: (v >> 9) as u16,
                month: ((v >> 5) & 0x0F) as u8,
                day: (v & 0x1F) as u8,
            })
        }
        T::Time => {
            let raw = payload.read_int3()?;
            let signed = if raw & 0x80_0000 != 0 {
                raw as i64 - 0x100_0000
            } else {
                raw as i64
            };
            let abs = signed.unsigned_abs();
            ColumnValue::Time(TimeValue {
                negative: signed < 0,
                hours: (abs / 10000) as u32,
                minutes: ((abs / 100) % 100) as u8,
                seconds: (abs % 100) as u8,
                nanos: 0,
            })
        }
        T::Time2 => ColumnValue::Time(read_time2(column, payload)?),
        T::DateTime => {
            let v = payload.read_int8()?;
            let date = v / 1_000_000;
            let time = v % 1_000_000;
            ColumnValue::DateTime(DateTimeValue {
                year: (date / 10000) as u16,
                month: ((date / 100) % 100) as u8,
                day: (date % 100) as u8,
                hour: (time / 10000) as u8,
                minute: ((time / 100) % 100) as u8,
                second: (time % 100) as u8,
                nanos: 0,
            })
        }
        T::DateTime2 => ColumnValue::DateTime(read_datetime2(column, payload)?),
        T::Timestamp => ColumnValue::Timestamp(TimestampValue {
            seconds: payload.read_int4()?,
            nanos: 0,
        }),
        T::Timestamp2 => {
            let seconds = payload.read_uint_be(4)? as u32;
            let micros = read_fraction_unsigned(column, payload)?;
            ColumnValue::Timestamp(TimestampValue {
                seconds,
                nanos: micros * 1000,
            })
        }
        T::Varchar | T::VarString => {
            let len = if column.meta < 256 {
                payload.read_int1()? as usize
            } else {
                payload.read_int2()? as usize
            };
            ColumnValue::from_text_bytes(payload.read_string_fix_bytes(len)?.to_vec())
        }
        T::String | T::Enum | T::Set => {
            let (real_type, length) = string_real_type(column.meta);
            match ColumnType::from_code(real_type) {
                Some(T::Enum) => ColumnValue::Enum(payload.read_uint_le(length as usize)? as u16),
                Some(T::Set) => ColumnValue::Set(payload.read_uint_le(length as usize)?),
                _ => {
                    let len = if length > 255 {
                        payload.read_int2()? as usize
                    } else {
                        payload.read_int1()? as usize
                    };
                    ColumnValue::from_text_bytes(payload.read_string_fix_bytes(len)?.to_vec())
                }
            }
        }
        T::Bit => ColumnValue::Bit(payload.read_string_fix_bytes(bit_length(column.meta))?.to_vec()),
        T::Blob | T::TinyBlob | T::MediumBlob | T::LongBlob | T::Geometry | T::Vector => {
            let len = payload.read_uint_le(blob_length_bytes(column)?)? as usize;
            ColumnValue::Bytes(payload.read_string_fix_bytes(len)?.to_vec())
        }
        T::Json => {
            let len = payload.read_uint_le(blob_length_bytes(column)?)? as usize;
            let bytes = payload.read_string_fix_bytes(len)?;
            ColumnValue::Json(json::decode_json(&bytes).map_err(|e| {
                CdcError::ValueError(format!("column {}: {}", column.name, e))
            })?)
        }
        T::Decimal | T::Null | T::NewDate | T::TypedArray => return Err(column.unsupported()),
    };
    Ok(value)
}

/// fsp 별 소수부 바이트를 microseconds로 (TIMESTAMP2)
fn read_fraction_unsigned(column: &ColumnDefinition, payload: &mut PacketPayload) -> Result<u32> {
    Ok(match fraction_width(column)? {
        0 => 0,
        1 => payload.read_int1()? as u32 * 10000,
        2 => payload.read_uint_be(2)? as u32 * 100,
        _ => payload.read_uint_be(3)? as u32,
    })
}

fn read_time2(column: &ColumnDefinition, payload: &mut PacketPayload) -> Result<TimeValue> {
    let packed = match fraction_width(column)? {
        0 => {
            let int_part = payload.read_uint_be(3)? as i64 - TIMEF_INT_OFS;
            int_part << 24
        }
        1 => {
            let mut int_part = payload.read_uint_be(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = payload.read_int1()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10000
        }
        2 => {
            let mut int_part = payload.read_uint_be(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = payload.read_uint_be(2)? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        _ => payload.read_uint_be(6)? as i64 - TIMEF_OFS,
    };
    if packed == 0 {
        return Ok(TimeValue::ZERO);
    }
    Ok(TimeValue::from_packed(packed))
}

fn read_datetime2(column: &ColumnDefinition, payload: &mut PacketPayload) -> Result<DateTimeValue> {
    let raw = payload.read_uint_be(5)? as i64;
    let frac = match fraction_width(column)? {
        0 => 0,
        1 => payload.read_int1()? as i8 as i64 * 10000,
        2 => payload.read_uint_be(2)? as u16 as i16 as i64 * 100,
        _ => {
            let v = payload.read_uint_be(3)? as i64;
            if v & 0x80_0000 != 0 {
                v - 0x100_0000
            } else {
                v
            }
        }
    };
    let int_part = raw - DATETIMEF_INT_OFS;
    if raw == 0 || (int_part == 0 && frac == 0) {
        return Ok(DateTimeValue::ZERO);
    }
    Ok(DateTimeValue::from_packed((int_part << 24) + frac))
}

fn mismatch(column: &ColumnDefinition, value: &ColumnValue) -> CdcError {
    CdcError::ValueError(format!(
        "column {}: cannot encode {:?} as type code {}",
        column.name, value, column.type_code
    ))
}

fn check_fraction(column: &ColumnDefinition, nanos: u32) -> Result<()> {
    let fsp = column.fsp() as u32;
    let unit = 10u32.pow(9 - fsp.min(6));
    if nanos % unit != 0 {
        return Err(CdcError::ValueError(format!(
            "column {}: fraction {}ns exceeds precision {}",
            column.name, nanos, fsp
        )));
    }
    Ok(())
}

fn signed_in_range(column: &ColumnDefinition, value: &ColumnValue, bits: u32) -> Result<u64> {
    let (min, max) = if column.unsigned {
        (0i128, (1i128 << bits) - 1)
    } else {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    };
    let v = match value {
        ColumnValue::Int(v) => *v as i128,
        ColumnValue::UInt(v) => *v as i128,
        _ => return Err(mismatch(column, value)),
    };
    if v < min || v > max {
        return Err(CdcError::ValueError(format!(
            "column {}: {} out of range",
            column.name, v
        )));
    }
    Ok(v as u64)
}

fn write_length_prefixed(payload: &mut PacketPayload, width: usize, bytes: &[u8]) -> Result<()> {
    if width < 8 && bytes.len() as u64 >= (1u64 << (width * 8)) {
        return Err(CdcError::ValueError(format!(
            "value of {} bytes does not fit a {}-byte length",
            bytes.len(),
            width
        )));
    }
    payload.write_uint_le(bytes.len() as u64, width)?;
    payload.write_bytes(bytes);
    Ok(())
}

fn text_bytes(value: &ColumnValue) -> Option<&[u8]> {
    match value {
        ColumnValue::String(s) => Some(s.as_bytes()),
        ColumnValue::Bytes(b) => Some(b),
        _ => None,
    }
}

/// `read_binlog_value`의 역
pub fn write_binlog_value(
    column: &ColumnDefinition,
    value: &ColumnValue,
    payload: &mut PacketPayload,
) -> Result<()> {
    use ColumnType as T;

    match (column.column_type()?, value) {
        (T::Tiny, _) => payload.write_int1(signed_in_range(column, value, 8)? as u8),
        (T::Short, _) => payload.write_int2(signed_in_range(column, value, 16)? as u16),
        (T::Int24, _) => payload.write_int3(signed_in_range(column, value, 24)? as u32 & 0xFF_FFFF),
        (T::Long, _) => payload.write_int4(signed_in_range(column, value, 32)? as u32),
        (T::LongLong, ColumnValue::Int(v)) if !column.unsigned => payload.write_int8(*v as u64),
        (T::LongLong, ColumnValue::UInt(v)) if column.unsigned => payload.write_int8(*v),
        (T::Float, ColumnValue::Float(v)) => payload.write_f32(*v),
        (T::Double, ColumnValue::Double(v)) => payload.write_f64(*v),
        (T::NewDecimal, ColumnValue::Decimal(v)) => {
            decimal::write_decimal(v, (column.meta >> 8) as u8, column.meta as u8, payload)?
        }
        (T::Year, ColumnValue::Year(v)) => match *v {
            0 => payload.write_int1(0),
            1901..=2155 => payload.write_int1((*v - 1900) as u8),
            other => {
                return Err(CdcError::ValueError(format!(
                    "column {}: year {} out of range",
                    column.name, other
                )))
            }
        },
        (T::Date, ColumnValue::Date(v)) => {
            payload.write_int3(((v.year as u32) << 9) | ((v.month as u32) << 5) | v.day as u32)
        }
        (T::Time, ColumnValue::Time(v)) => {
            let magnitude =
                v.hours as i64 * 10000 + v.minutes as i64 * 100 + v.seconds as i64;
            let signed = if v.negative { -magnitude } else { magnitude };
            payload.write_int3((signed as u32) & 0xFF_FFFF);
        }
        (T::Time2, ColumnValue::Time(v)) => write_time2(column, v, payload)?,
        (T::DateTime, ColumnValue::DateTime(v)) => {
            let date = v.year as u64 * 10000 + v.month as u64 * 100 + v.day as u64;
            let time = v.hour as u64 * 10000 + v.minute as u64 * 100 + v.second as u64;
            payload.write_int8(date * 1_000_000 + time);
        }
        (T::DateTime2, ColumnValue::DateTime(v)) => write_datetime2(column, v, payload)?,
        (T::Timestamp, ColumnValue::Timestamp(v)) => payload.write_int4(v.seconds),
        (T::Timestamp2, ColumnValue::Timestamp(v)) => {
            check_fraction(column, v.nanos)?;
            payload.write_uint_be(v.seconds as u64, 4)?;
            let micros = (v.nanos / 1000) as u64;
            match fraction_width(column)? {
                0 => {}
                1 => payload.write_int1((micros / 10000) as u8),
                2 => payload.write_uint_be(micros / 100, 2)?,
                _ => payload.write_uint_be(micros, 3)?,
            }
        }
        (T::Varchar | T::VarString, _) => {
            let bytes = text_bytes(value).ok_or_else(|| mismatch(column, value))?;
            write_length_prefixed(payload, if column.meta < 256 { 1 } else { 2 }, bytes)?;
        }
        (T::String | T::Enum | T::Set, _) => {
            let (real_type, length) = string_real_type(column.meta);
            match (ColumnType::from_code(real_type), value) {
                (Some(T::Enum), ColumnValue::Enum(v)) => {
                    payload.write_uint_le(*v as u64, length as usize)?
                }
                (Some(T::Set), ColumnValue::Set(v)) => payload.write_uint_le(*v, length as usize)?,
                (Some(T::Enum | T::Set), _) => return Err(mismatch(column, value)),
                _ => {
                    let bytes = text_bytes(value).ok_or_else(|| mismatch(column, value))?;
                    write_length_prefixed(payload, if length > 255 { 2 } else { 1 }, bytes)?;
                }
            }
        }
        (T::Bit, ColumnValue::Bit(v)) => {
            if v.len() != bit_length(column.meta) {
                return Err(mismatch(column, value));
            }
            payload.write_bytes(v);
        }
        (T::Blob | T::TinyBlob | T::MediumBlob | T::LongBlob | T::Geometry | T::Vector, _) => {
            let bytes = text_bytes(value).ok_or_else(|| mismatch(column, value))?;
            write_length_prefixed(payload, blob_length_bytes(column)?, bytes)?;
        }
        (T::Json, ColumnValue::Json(v)) => {
            let encoded = json::encode_json(v)?;
            write_length_prefixed(payload, blob_length_bytes(column)?, &encoded)?;
        }
        (T::Decimal | T::Null | T::NewDate | T::TypedArray, _) => return Err(column.unsupported()),
        _ => return Err(mismatch(column, value)),
    }
    Ok(())
}

fn write_time2(column: &ColumnDefinition, value: &TimeValue, payload: &mut PacketPayload) -> Result<()> {
    check_fraction(column, value.nanos)?;
    let packed = value.to_packed();
    let int_part = packed >> 24;
    let frac = packed % (1 << 24);
    match fraction_width(column)? {
        0 => payload.write_uint_be((int_part + TIMEF_INT_OFS) as u64, 3)?,
        1 => {
            payload.write_uint_be((int_part + TIMEF_INT_OFS) as u64, 3)?;
            payload.write_int1((frac / 10000) as i8 as u8);
        }
        2 => {
            payload.write_uint_be((int_part + TIMEF_INT_OFS) as u64, 3)?;
            payload.write_uint_be((frac / 100) as i16 as u16 as u64, 2)?;
        }
        _ => payload.write_uint_be((packed + TIMEF_OFS) as u64, 6)?,
    }
    Ok(())
}

fn write_datetime2(
    column: &ColumnDefinition,
    value: &DateTimeValue,
    payload: &mut PacketPayload,
) -> Result<()> {
    check_fraction(column, value.nanos)?;
    let packed = value.to_packed();
    let frac = packed % (1 << 24);
    payload.write_uint_be(((packed >> 24) + DATETIMEF_INT_OFS) as u64, 5)?;
    match fraction_width(column)? {
        0 => {}
        1 => payload.write_int1((frac / 10000) as i8 as u8),
        2 => payload.write_uint_be((frac / 100) as i16 as u16 as u64, 2)?,
        _ => payload.write_uint_be((frac as u64) & 0xFF_FFFF, 3)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn decode(column: &ColumnDefinition, bytes: &[u8]) -> ColumnValue {
        let mut payload = PacketPayload::from_bytes(bytes);
        let value = read_binlog_value(column, &mut payload).unwrap();
        assert!(!payload.has_remaining(), "{} left unread", payload.remaining());
        value
    }

    fn round_trip(column: &ColumnDefinition, value: ColumnValue) {
        let mut payload = PacketPayload::new();
        write_binlog_value(column, &value, &mut payload).unwrap();
        let decoded = read_binlog_value(column, &mut payload).unwrap();
        assert_eq!(decoded, value, "column {}", column.name);
        assert!(!payload.has_remaining());
    }

    #[test]
    fn test_time2_known_value() {
        let column = ColumnDefinition::new("t", ColumnType::Time2, 0);
        let value = decode(&column, &[0x80, 0xAA, 0xD7]);
        assert_eq!(value.to_string(), "10:43:23");
    }

    #[test]
    fn test_time2_zero_sentinel_for_every_precision() {
        for fsp in 0..=6u16 {
            let column = ColumnDefinition::new("t", ColumnType::Time2, fsp);
            let mut bytes = vec![0x80, 0x00, 0x00];
            let extra = match fsp {
                0 => 0,
                1 | 2 => 1,
                3 | 4 => 2,
                _ => 3,
            };
            bytes.extend(std::iter::repeat(0).take(extra));
            let value = decode(&column, &bytes);
            assert_eq!(value, ColumnValue::Time(TimeValue::ZERO), "fsp {}", fsp);
            assert_eq!(value.to_string(), "00:00:00");
        }
    }

    #[test]
    fn test_datetime2_known_value() {
        let column = ColumnDefinition::new("dt", ColumnType::DateTime2, 0);
        let raw = 659887819813u64.to_be_bytes();
        let value = decode(&column, &raw[3..]);
        assert_eq!(value.to_string(), "2019-10-16 16:48:37");
    }

    #[test]
    fn test_datetime2_zero() {
        let column = ColumnDefinition::new("dt", ColumnType::DateTime2, 0);
        let value = decode(&column, &[0, 0, 0, 0, 0]);
        assert_eq!(value, ColumnValue::DateTime(DateTimeValue::ZERO));
        assert_eq!(value.to_string(), "0000-00-00 00:00:00");

        let value = decode(&column, &[0x80, 0, 0, 0, 0]);
        assert_eq!(value, ColumnValue::DateTime(DateTimeValue::ZERO));
    }

    #[test]
    fn test_year() {
        let column = ColumnDefinition::new("y", ColumnType::Year, 0);
        assert_eq!(decode(&column, &[0]).to_string(), "0000");
        assert_eq!(decode(&column, &[25]).to_string(), "1925");
        assert_eq!(decode(&column, &[255]).to_string(), "2155");
    }

    #[test]
    fn test_legacy_temporal_values() {
        let date = ColumnDefinition::new("d", ColumnType::Date, 0);
        assert_eq!(decode(&date, &1034065u32.to_le_bytes()[..3]).to_string(), "2019-10-17");
        assert_eq!(decode(&date, &[0, 0, 0]).to_string(), "0000-00-00");

        let time = ColumnDefinition::new("t", ColumnType::Time, 0);
        assert_eq!(decode(&time, &101531u32.to_le_bytes()[..3]).to_string(), "10:15:31");

        let datetime = ColumnDefinition::new("dt", ColumnType::DateTime, 0);
        assert_eq!(
            decode(&datetime, &20191017111500u64.to_le_bytes()).to_string(),
            "2019-10-17 11:15:00"
        );
        assert_eq!(decode(&datetime, &0u64.to_le_bytes()).to_string(), "0000-00-00 00:00:00");

        let timestamp = ColumnDefinition::new("ts", ColumnType::Timestamp, 0);
        assert_eq!(
            decode(&timestamp, &1571214733u32.to_le_bytes()).to_string(),
            "2019-10-16 08:32:13"
        );
        assert_eq!(decode(&timestamp, &[0, 0, 0, 0]).to_string(), "0000-00-00 00:00:00");
    }

    #[test]
    fn test_int24_sign_extension() {
        let column = ColumnDefinition::new("i", ColumnType::Int24, 0);
        assert_eq!(decode(&column, &[0x00, 0x00, 0x80]), ColumnValue::Int(-0x80_0000));
        let unsigned = ColumnDefinition::new("i", ColumnType::Int24, 0).unsigned();
        assert_eq!(decode(&unsigned, &[0x00, 0x00, 0x80]), ColumnValue::UInt(0x80_0000));
    }

    #[test]
    fn test_decimal_vectors() {
        let column = ColumnDefinition::new("amount", ColumnType::NewDecimal, (14 << 8) + 4);
        let positive = hex::decode("810DFB38D204D2").unwrap();
        assert_eq!(
            decode(&column, &positive),
            ColumnValue::Decimal(BigDecimal::from_str("1234567890.1234").unwrap())
        );
        let negative = hex::decode("7EF204C72DFB2D").unwrap();
        assert_eq!(
            decode(&column, &negative),
            ColumnValue::Decimal(BigDecimal::from_str("-1234567890.1234").unwrap())
        );
    }

    #[test]
    fn test_integer_round_trips() {
        let cases = [
            (ColumnType::Tiny, 8u32),
            (ColumnType::Short, 16),
            (ColumnType::Int24, 24),
            (ColumnType::Long, 32),
        ];
        for (column_type, bits) in cases {
            let signed = ColumnDefinition::new("s", column_type, 0);
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            for v in [min, -1, 0, 1, max] {
                round_trip(&signed, ColumnValue::Int(v));
            }
            let unsigned = ColumnDefinition::new("u", column_type, 0).unsigned();
            round_trip(&unsigned, ColumnValue::UInt((1u64 << bits) - 1));
            round_trip(&unsigned, ColumnValue::UInt(0));
        }
        let bigint = ColumnDefinition::new("b", ColumnType::LongLong, 0);
        round_trip(&bigint, ColumnValue::Int(i64::MIN));
        round_trip(&bigint, ColumnValue::Int(i64::MAX));
        let ubigint = ColumnDefinition::new("b", ColumnType::LongLong, 0).unsigned();
        round_trip(&ubigint, ColumnValue::UInt(u64::MAX));
    }

    #[test]
    fn test_integer_out_of_range_rejected() {
        let column = ColumnDefinition::new("s", ColumnType::Tiny, 0);
        let mut payload = PacketPayload::new();
        assert!(write_binlog_value(&column, &ColumnValue::Int(128), &mut payload).is_err());
    }

    #[test]
    fn test_temporal_round_trips() {
        for fsp in 0..=6u16 {
            let time2 = ColumnDefinition::new("t", ColumnType::Time2, fsp);
            let datetime2 = ColumnDefinition::new("dt", ColumnType::DateTime2, fsp);
            let timestamp2 = ColumnDefinition::new("ts", ColumnType::Timestamp2, fsp);
            let nanos = match fsp {
                0 => 0,
                1 | 2 => 500_000_000,
                3 | 4 => 123_000_000,
                5 => 999_990_000,
                _ => 999_999_000,
            };

            round_trip(&time2, ColumnValue::Time(TimeValue::ZERO));
            round_trip(&time2, ColumnValue::Time(TimeValue { nanos, ..TimeValue::new(838, 59, 59) }));
            round_trip(
                &time2,
                ColumnValue::Time(TimeValue {
                    negative: true,
                    nanos,
                    ..TimeValue::new(12, 30, 1)
                }),
            );
            round_trip(&datetime2, ColumnValue::DateTime(DateTimeValue::ZERO));
            round_trip(
                &datetime2,
                ColumnValue::DateTime(DateTimeValue {
                    nanos,
                    ..DateTimeValue::new(9999, 12, 31, 23, 59, 59)
                }),
            );
            round_trip(
                &datetime2,
                ColumnValue::DateTime(DateTimeValue::new(1000, 1, 1, 0, 0, 0)),
            );
            round_trip(
                &timestamp2,
                ColumnValue::Timestamp(TimestampValue {
                    seconds: 1571214733,
                    nanos,
                }),
            );
        }

        round_trip(
            &ColumnDefinition::new("d", ColumnType::Date, 0),
            ColumnValue::Date(DateValue::ZERO),
        );
        round_trip(
            &ColumnDefinition::new("t", ColumnType::Time, 0),
            ColumnValue::Time(TimeValue {
                negative: true,
                ..TimeValue::new(838, 59, 59)
            }),
        );
        round_trip(
            &ColumnDefinition::new("y", ColumnType::Year, 0),
            ColumnValue::Year(0),
        );
        round_trip(
            &ColumnDefinition::new("y", ColumnType::Year, 0),
            ColumnValue::Year(2155),
        );
    }

    #[test]
    fn test_time2_negative_with_fraction_layout() {
        // -00:00:01.5 (fsp 1): int part 0x7FFFFE, frac byte 0xCE
        let column = ColumnDefinition::new("t", ColumnType::Time2, 1);
        let value = decode(&column, &[0x7F, 0xFF, 0xFE, 0xCE]);
        assert_eq!(
            value,
            ColumnValue::Time(TimeValue {
                negative: true,
                nanos: 500_000_000,
                ..TimeValue::new(0, 0, 1)
            })
        );
        assert_eq!(value.to_string(), "-00:00:01.500000");
    }

    #[test]
    fn test_fraction_precision_overflow_rejected() {
        let column = ColumnDefinition::new("t", ColumnType::Time2, 2);
        let value = ColumnValue::Time(TimeValue {
            nanos: 123_000_000,
            ..TimeValue::new(1, 2, 3)
        });
        let mut payload = PacketPayload::new();
        assert!(write_binlog_value(&column, &value, &mut payload).is_err());
    }

    #[test]
    fn test_string_round_trips() {
        round_trip(
            &ColumnDefinition::new("v", ColumnType::Varchar, 100),
            ColumnValue::String("héllo".into()),
        );
        round_trip(
            &ColumnDefinition::new("v", ColumnType::Varchar, 1000),
            ColumnValue::String("x".repeat(300)),
        );
        round_trip(
            &ColumnDefinition::new("v", ColumnType::Varchar, 100),
            ColumnValue::Bytes(vec![0xff, 0x00, 0xfe]),
        );
        round_trip(
            &ColumnDefinition::new("c", ColumnType::String, ((ColumnType::String.code() as u16) << 8) | 40),
            ColumnValue::String("char".into()),
        );
        round_trip(
            &ColumnDefinition::new("e", ColumnType::String, ((ColumnType::Enum.code() as u16) << 8) | 2),
            ColumnValue::Enum(300),
        );
        round_trip(
            &ColumnDefinition::new("s", ColumnType::String, ((ColumnType::Set.code() as u16) << 8) | 8),
            ColumnValue::Set(u64::MAX),
        );
        round_trip(
            &ColumnDefinition::new("b", ColumnType::Blob, 2),
            ColumnValue::Bytes(vec![1, 2, 3]),
        );
        round_trip(
            &ColumnDefinition::new("bits", ColumnType::Bit, (2 << 8) | 3),
            ColumnValue::Bit(vec![0x07, 0xFF, 0x01]),
        );
    }

    #[test]
    fn test_string_long_char_length() {
        // CHAR(255) utf8mb4: 1020 bytes, 상위 비트가 real_type에 섞여 있음
        let (real_type, length) = string_real_type(0xCEFC);
        assert_eq!(real_type, 0xFE);
        assert_eq!(length, 0x3FC);
    }

    #[test]
    fn test_enum_set_width_is_checked() {
        let wide_set = ColumnDefinition::new("s", ColumnType::String, ((ColumnType::Set.code() as u16) << 8) | 9);
        let mut payload = PacketPayload::new();
        assert!(matches!(
            write_binlog_value(&wide_set, &ColumnValue::Set(1), &mut payload),
            Err(CdcError::ValueError(_))
        ));

        let narrow_enum = ColumnDefinition::new("e", ColumnType::String, ((ColumnType::Enum.code() as u16) << 8) | 1);
        assert!(matches!(
            write_binlog_value(&narrow_enum, &ColumnValue::Enum(300), &mut payload),
            Err(CdcError::ValueError(_))
        ));
        assert!(!payload.has_remaining());
    }

    #[test]
    fn test_float_round_trips() {
        round_trip(&ColumnDefinition::new("f", ColumnType::Float, 4), ColumnValue::Float(f32::MAX));
        round_trip(&ColumnDefinition::new("d", ColumnType::Double, 8), ColumnValue::Double(-0.5));
    }

    #[test]
    fn test_json_round_trip() {
        let column = ColumnDefinition::new("doc", ColumnType::Json, 4);
        round_trip(
            &column,
            ColumnValue::Json(serde_json::json!({"id": 1, "tags": ["a", null, true], "ratio": 0.25})),
        );
    }

    #[test]
    fn test_unknown_type_code() {
        let column = ColumnDefinition {
            name: "mystery".into(),
            type_code: 0xF0,
            meta: 0,
            unsigned: false,
            nullable: true,
        };
        let mut payload = PacketPayload::from_bytes(&[1, 2, 3]);
        match read_binlog_value(&column, &mut payload) {
            Err(CdcError::UnsupportedColumnType { column, type_code }) => {
                assert_eq!(column, "mystery");
                assert_eq!(type_code, 0xF0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_column_meta_round_trip() {
        let mut payload = PacketPayload::new();
        write_column_meta(ColumnType::NewDecimal, (10 << 8) | 2, &mut payload);
        write_column_meta(ColumnType::Varchar, 1020, &mut payload);
        write_column_meta(ColumnType::Time2, 3, &mut payload);
        write_column_meta(ColumnType::Long, 0, &mut payload);
        assert_eq!(read_column_meta(ColumnType::NewDecimal, &mut payload).unwrap(), (10 << 8) | 2);
        assert_eq!(read_column_meta(ColumnType::Varchar, &mut payload).unwrap(), 1020);
        assert_eq!(read_column_meta(ColumnType::Time2, &mut payload).unwrap(), 3);
        assert_eq!(read_column_meta(ColumnType::Long, &mut payload).unwrap(), 0);
        assert!(!payload.has_remaining());
    }
}
