//! MySQL binary JSON 코덱
//!
//! JSON 컬럼은 binlog에 서버 내부 바이너리 형식으로 기록됩니다.
//! object/array는 small(2바이트 offset)과 large(4바이트 offset) 두 가지 형태가 있고,
//! 작은 스칼라는 value entry 안에 inline으로 들어갑니다.

use crate::decimal;
use crate::error::{CdcError, Result};
use crate::payload::PacketPayload;
use crate::value::{ColumnType, DateTimeValue, TimeValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use serde_json::{Map, Number, Value};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0A;
const DOUBLE: u8 = 0x0B;
const STRING: u8 = 0x0C;
const OPAQUE: u8 = 0x0F;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

fn corrupt(message: impl Into<String>) -> CdcError {
    CdcError::ValueError(format!("corrupt binary JSON: {}", message.into()))
}

fn slice(data: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    data.get(start..start + len)
        .ok_or_else(|| corrupt(format!("{} bytes at {} out of {}", len, start, data.len())))
}

/// 바이너리 JSON 문서를 serde_json 값으로
pub fn decode_json(data: &[u8]) -> Result<Value> {
    match data.split_first() {
        None => Ok(Value::Null),
        Some((value_type, body)) => decode_value(*value_type, body),
    }
}

fn decode_value(value_type: u8, data: &[u8]) -> Result<Value> {
    match value_type {
        SMALL_OBJECT => decode_container(data, false, true),
        LARGE_OBJECT => decode_container(data, true, true),
        SMALL_ARRAY => decode_container(data, false, false),
        LARGE_ARRAY => decode_container(data, true, false),
        LITERAL => decode_literal(*slice(data, 0, 1)?.first().unwrap_or(&0xFF)),
        INT16 => Ok(Value::from(LittleEndian::read_i16(slice(data, 0, 2)?))),
        UINT16 => Ok(Value::from(LittleEndian::read_u16(slice(data, 0, 2)?))),
        INT32 => Ok(Value::from(LittleEndian::read_i32(slice(data, 0, 4)?))),
        UINT32 => Ok(Value::from(LittleEndian::read_u32(slice(data, 0, 4)?))),
        INT64 => Ok(Value::from(LittleEndian::read_i64(slice(data, 0, 8)?))),
        UINT64 => Ok(Value::from(LittleEndian::read_u64(slice(data, 0, 8)?))),
        DOUBLE => {
            let v = LittleEndian::read_f64(slice(data, 0, 8)?);
            Number::from_f64(v)
                .map(Value::Number)
                .ok_or_else(|| corrupt(format!("non-finite double {}", v)))
        }
        STRING => {
            let (len, used) = read_variable_length(data)?;
            let bytes = slice(data, used, len)?;
            String::from_utf8(bytes.to_vec())
                .map(Value::String)
                .map_err(|e| corrupt(e.to_string()))
        }
        OPAQUE => {
            let field_type = *slice(data, 0, 1)?.first().unwrap_or(&0);
            let (len, used) = read_variable_length(&data[1..])?;
            let bytes = slice(data, 1 + used, len)?;
            decode_opaque(field_type, bytes)
        }
        other => Err(corrupt(format!("unknown value type {}", other))),
    }
}

fn decode_literal(literal: u8) -> Result<Value> {
    match literal {
        LITERAL_NULL => Ok(Value::Null),
        LITERAL_TRUE => Ok(Value::Bool(true)),
        LITERAL_FALSE => Ok(Value::Bool(false)),
        other => Err(corrupt(format!("unknown literal {}", other))),
    }
}

fn read_offset(data: &[u8], at: usize, large: bool) -> Result<usize> {
    if large {
        Ok(LittleEndian::read_u32(slice(data, at, 4)?) as usize)
    } else {
        Ok(LittleEndian::read_u16(slice(data, at, 2)?) as usize)
    }
}

fn is_inlined(value_type: u8, large: bool) -> bool {
    match value_type {
        LITERAL | INT16 | UINT16 => true,
        INT32 | UINT32 => large,
        _ => false,
    }
}

fn decode_container(data: &[u8], large: bool, object: bool) -> Result<Value> {
    let width = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let size = read_offset(data, width, large)?;
    if size > data.len() {
        return Err(corrupt(format!("container size {} exceeds {}", size, data.len())));
    }
    let data = &data[..size];
    let header = 2 * width;
    let key_entry = width + 2;
    let value_entry = 1 + width;
    let value_entries_start = if object { header + count * key_entry } else { header };

    let mut keys = Vec::with_capacity(if object { count } else { 0 });
    if object {
        for i in 0..count {
            let at = header + i * key_entry;
            let key_offset = read_offset(data, at, large)?;
            let key_len = LittleEndian::read_u16(slice(data, at + width, 2)?) as usize;
            let key = slice(data, key_offset, key_len)?;
            keys.push(String::from_utf8(key.to_vec()).map_err(|e| corrupt(e.to_string()))?);
        }
    }

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let at = value_entries_start + i * value_entry;
        let value_type = *slice(data, at, 1)?.first().unwrap_or(&0xFF);
        let value = if is_inlined(value_type, large) {
            decode_value(value_type, slice(data, at + 1, width)?)?
        } else {
            let offset = read_offset(data, at + 1, large)?;
            let body = data
                .get(offset..)
                .ok_or_else(|| corrupt(format!("value offset {} out of range", offset)))?;
            decode_value(value_type, body)?
        };
        values.push(value);
    }

    if object {
        let map: Map<String, Value> = keys.into_iter().zip(values).collect();
        Ok(Value::Object(map))
    } else {
        Ok(Value::Array(values))
    }
}

/// 7비트 가변 길이 (최대 5바이트)
fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0usize;
    for i in 0..5 {
        let byte = *data.get(i).ok_or_else(|| corrupt("truncated variable length"))?;
        length |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(corrupt("variable length longer than 5 bytes"))
}

fn write_variable_length(out: &mut Vec<u8>, mut length: usize) {
    loop {
        let byte = (length & 0x7F) as u8;
        length >>= 7;
        if length == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// DECIMAL / 시간 타입 opaque 값은 문자열로, 나머지는 "base64:type{N}:..." 형태로
fn decode_opaque(field_type: u8, data: &[u8]) -> Result<Value> {
    let packed = || -> Result<i64> { Ok(LittleEndian::read_i64(slice(data, 0, 8)?)) };
    match ColumnType::from_code(field_type) {
        Some(ColumnType::NewDecimal) => {
            let precision = *slice(data, 0, 1)?.first().unwrap_or(&0);
            let scale = *slice(data, 1, 1)?.first().unwrap_or(&0);
            let mut payload = PacketPayload::from_bytes(&data[2..]);
            let value = decimal::read_decimal(&mut payload, precision, scale)?;
            Ok(Value::String(value.to_string()))
        }
        Some(ColumnType::Time) => Ok(Value::String(TimeValue::from_packed(packed()?).to_string())),
        Some(ColumnType::Date) => {
            let datetime = DateTimeValue::from_packed(packed()?);
            Ok(Value::String(format!(
                "{:04}-{:02}-{:02}",
                datetime.year, datetime.month, datetime.day
            )))
        }
        Some(ColumnType::DateTime | ColumnType::Timestamp) => {
            Ok(Value::String(DateTimeValue::from_packed(packed()?).to_string()))
        }
        _ => Ok(Value::String(format!(
            "base64:type{}:{}",
            field_type,
            STANDARD.encode(data)
        ))),
    }
}

/// serde_json 값을 바이너리 JSON 문서로
pub fn encode_json(value: &Value) -> Result<Vec<u8>> {
    let (value_type, body) = encode_value(value)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(value_type);
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_value(value: &Value) -> Result<(u8, Vec<u8>)> {
    Ok(match value {
        Value::Null => (LITERAL, vec![LITERAL_NULL]),
        Value::Bool(true) => (LITERAL, vec![LITERAL_TRUE]),
        Value::Bool(false) => (LITERAL, vec![LITERAL_FALSE]),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                (INT64, v.to_le_bytes().to_vec())
            } else if let Some(v) = n.as_u64() {
                (UINT64, v.to_le_bytes().to_vec())
            } else {
                let v = n.as_f64().ok_or_else(|| corrupt(format!("unrepresentable number {}", n)))?;
                (DOUBLE, v.to_le_bytes().to_vec())
            }
        }
        Value::String(s) => {
            let mut out = Vec::with_capacity(s.len() + 5);
            write_variable_length(&mut out, s.len());
            out.extend_from_slice(s.as_bytes());
            (STRING, out)
        }
        Value::Array(items) => {
            let items: Vec<&Value> = items.iter().collect();
            match encode_container(None, &items, false)? {
                Some(body) => (SMALL_ARRAY, body),
                None => (LARGE_ARRAY, encode_container(None, &items, true)?.unwrap_or_default()),
            }
        }
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            let items: Vec<&Value> = map.values().collect();
            match encode_container(Some(&keys), &items, false)? {
                Some(body) => (SMALL_OBJECT, body),
                None => (
                    LARGE_OBJECT,
                    encode_container(Some(&keys), &items, true)?.unwrap_or_default(),
                ),
            }
        }
    })
}

/// small 형식에 안 들어가면 None
fn encode_container(keys: Option<&[&str]>, items: &[&Value], large: bool) -> Result<Option<Vec<u8>>> {
    let width = if large { 4 } else { 2 };
    let limit = if large { u32::MAX as usize } else { u16::MAX as usize };
    let count = items.len();
    let key_entries = keys.map(|k| k.len() * (width + 2)).unwrap_or(0);
    let header = 2 * width + key_entries + count * (1 + width);

    let mut entries = Vec::with_capacity(header);
    let mut tail = Vec::new();
    let put_offset = |buf: &mut Vec<u8>, v: usize| {
        if large {
            buf.extend_from_slice(&(v as u32).to_le_bytes());
        } else {
            buf.extend_from_slice(&(v as u16).to_le_bytes());
        }
    };

    let mut key_entry_bytes = Vec::with_capacity(key_entries);
    if let Some(keys) = keys {
        for key in keys {
            if key.len() > u16::MAX as usize {
                return Err(corrupt(format!("key of {} bytes", key.len())));
            }
            let offset = header + tail.len();
            if offset > limit {
                return Ok(None);
            }
            put_offset(&mut key_entry_bytes, offset);
            key_entry_bytes.extend_from_slice(&(key.len() as u16).to_le_bytes());
            tail.extend_from_slice(key.as_bytes());
        }
    }

    let mut value_entry_bytes = Vec::with_capacity(count * (1 + width));
    for item in items {
        let (value_type, body) = encode_value(item)?;
        if value_type == LITERAL {
            value_entry_bytes.push(LITERAL);
            value_entry_bytes.push(body[0]);
            value_entry_bytes.extend(std::iter::repeat(0).take(width - 1));
        } else {
            let offset = header + tail.len();
            if offset > limit {
                return Ok(None);
            }
            value_entry_bytes.push(value_type);
            put_offset(&mut value_entry_bytes, offset);
            tail.extend_from_slice(&body);
        }
    }

    let total = header + tail.len();
    if total > limit || count > limit {
        return Ok(None);
    }
    put_offset(&mut entries, count);
    put_offset(&mut entries, total);
    entries.extend_from_slice(&key_entry_bytes);
    entries.extend_from_slice(&value_entry_bytes);
    entries.extend_from_slice(&tail);
    Ok(Some(entries))
}
