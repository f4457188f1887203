//! MySQL 패킷 페이로드 커서
//!
//! 고정 길이 정수, length-encoded 정수/문자열, NUL 종료 문자열 등
//! MySQL 프로토콜의 기본 타입을 읽고 쓰는 커서입니다.
//! 읽기는 버퍼 앞쪽을 소비하고 쓰기는 뒤쪽에 붙입니다.

use crate::error::{CdcError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

/// length-encoded 값의 NULL 마커
pub const LENENC_NULL: u8 = 0xfb;

/// 패킷 페이로드 커서
#[derive(Debug, Default, Clone)]
pub struct PacketPayload {
    buf: BytesMut,
    base_offset: u64,
    consumed: usize,
}

impl PacketPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        PacketPayload {
            buf: BytesMut::from(bytes),
            base_offset: 0,
            consumed: 0,
        }
    }

    /// 스트림 내 시작 오프셋 지정 (에러 진단용)
    pub fn with_base_offset(mut self, offset: u64) -> Self {
        self.base_offset = offset;
        self
    }

    /// 현재 읽기 위치 (스트림 기준)
    pub fn position(&self) -> u64 {
        self.base_offset + self.consumed as u64
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    /// 남은 바이트 (소비하지 않음)
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// 뒤쪽 n 바이트 제거 (체크섬 trailer 등)
    pub fn truncate_tail(&mut self, n: usize) -> Result<()> {
        if n > self.buf.len() {
            return Err(self.error(format!("cannot strip {} trailing bytes from {}", n, self.buf.len())));
        }
        self.buf.truncate(self.buf.len() - n);
        Ok(())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    fn error(&self, message: impl Into<String>) -> CdcError {
        CdcError::decode(self.position(), message)
    }

    fn take(&mut self, n: usize) -> Result<BytesMut> {
        if self.buf.len() < n {
            return Err(self.error(format!(
                "need {} bytes but only {} remaining",
                n,
                self.buf.len()
            )));
        }
        self.consumed += n;
        Ok(self.buf.split_to(n))
    }

    // ---- 읽기 ----

    pub fn read_int1(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_int2(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(&self.take(2)?))
    }

    pub fn read_int3(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u24(&self.take(3)?))
    }

    pub fn read_int4(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(&self.take(4)?))
    }

    pub fn read_int6(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u48(&self.take(6)?))
    }

    pub fn read_int8(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(&self.take(8)?))
    }

    /// n 바이트 little-endian 부호 없는 정수 (1..=8)
    pub fn read_uint_le(&mut self, n: usize) -> Result<u64> {
        if n == 0 || n > 8 {
            return Err(self.error(format!("invalid integer width {}", n)));
        }
        Ok(LittleEndian::read_uint(&self.take(n)?, n))
    }

    /// n 바이트 big-endian 부호 없는 정수 (1..=8), packed temporal 값 용
    pub fn read_uint_be(&mut self, n: usize) -> Result<u64> {
        if n == 0 || n > 8 {
            return Err(self.error(format!("invalid integer width {}", n)));
        }
        Ok(BigEndian::read_uint(&self.take(n)?, n))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(&self.take(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(&self.take(8)?))
    }

    /// length-encoded 정수. 0xfb는 0으로 읽힙니다.
    pub fn read_int_lenenc(&mut self) -> Result<u64> {
        let offset = self.position();
        match self.read_int1()? {
            first @ 0..=0xfa => Ok(first as u64),
            LENENC_NULL => Ok(0),
            0xfc => Ok(self.read_int2()? as u64),
            0xfd => Ok(self.read_int3()? as u64),
            0xfe => self.read_int8(),
            _ => Err(CdcError::decode(offset, "invalid length-encoded integer marker 0xff")),
        }
    }

    pub fn read_string_lenenc_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_int_lenenc()? as usize;
        Ok(self.take(len)?.freeze())
    }

    /// NULL(0xfb)이면 None
    pub fn read_string_lenenc_nullable(&mut self) -> Result<Option<Bytes>> {
        if self.peek_u8() == Some(LENENC_NULL) {
            self.take(1)?;
            return Ok(None);
        }
        self.read_string_lenenc_bytes().map(Some)
    }

    pub fn read_string_lenenc(&mut self) -> Result<String> {
        let bytes = self.read_string_lenenc_bytes()?;
        self.utf8(bytes)
    }

    pub fn read_string_fix_bytes(&mut self, len: usize) -> Result<Bytes> {
        Ok(self.take(len)?.freeze())
    }

    pub fn read_string_fix(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_string_fix_bytes(len)?;
        self.utf8(bytes)
    }

    pub fn read_string_nul_bytes(&mut self) -> Result<Bytes> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| self.error("missing NUL terminator"))?;
        let bytes = self.take(end)?.freeze();
        self.take(1)?;
        Ok(bytes)
    }

    pub fn read_string_nul(&mut self) -> Result<String> {
        let bytes = self.read_string_nul_bytes()?;
        self.utf8(bytes)
    }

    pub fn read_string_eof_bytes(&mut self) -> Result<Bytes> {
        let len = self.buf.len();
        Ok(self.take(len)?.freeze())
    }

    pub fn read_string_eof(&mut self) -> Result<String> {
        let bytes = self.read_string_eof_bytes()?;
        self.utf8(bytes)
    }

    pub fn skip_reserved(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    fn utf8(&self, bytes: Bytes) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| self.error(format!("invalid UTF-8: {}", e)))
    }

    // ---- 쓰기 ----

    pub fn write_int1(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_int2(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_int3(&mut self, value: u32) {
        let mut tmp = [0u8; 3];
        LittleEndian::write_u24(&mut tmp, value);
        self.buf.put_slice(&tmp);
    }

    pub fn write_int4(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_int6(&mut self, value: u64) {
        let mut tmp = [0u8; 6];
        LittleEndian::write_u48(&mut tmp, value);
        self.buf.put_slice(&tmp);
    }

    pub fn write_int8(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// n 바이트 little-endian 부호 없는 정수 (1..=8). 값이 n 바이트를 넘으면 에러
    pub fn write_uint_le(&mut self, value: u64, n: usize) -> Result<()> {
        check_width(n)?;
        if n < 8 && value >> (n * 8) != 0 {
            return Err(CdcError::ValueError(format!(
                "{} does not fit in {} bytes",
                value, n
            )));
        }
        self.buf.put_uint_le(value, n);
        Ok(())
    }

    pub fn write_uint_be(&mut self, value: u64, n: usize) -> Result<()> {
        check_width(n)?;
        self.buf.put_uint(value, n);
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    /// 가장 짧은 형식으로 length-encoded 정수 쓰기
    pub fn write_int_lenenc(&mut self, value: u64) {
        if value < 0xfb {
            self.write_int1(value as u8);
        } else if value < (1 << 16) {
            self.write_int1(0xfc);
            self.write_int2(value as u16);
        } else if value < (1 << 24) {
            self.write_int1(0xfd);
            self.write_int3(value as u32);
        } else {
            self.write_int1(0xfe);
            self.write_int8(value);
        }
    }

    pub fn write_string_lenenc(&mut self, value: &[u8]) {
        self.write_int_lenenc(value.len() as u64);
        self.buf.put_slice(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn write_string_nul(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
        self.buf.put_u8(0);
    }

    pub fn write_reserved(&mut self, len: usize) {
        self.buf.put_bytes(0, len);
    }
}

fn check_width(n: usize) -> Result<()> {
    if n == 0 || n > 8 {
        return Err(CdcError::ValueError(format!("invalid integer width {}", n)));
    }
    Ok(())
}
