//! MySQL binary DECIMAL 코덱
//!
//! 9자리 단위 word(4바이트 BE)와 자투리 자릿수로 정수부/소수부를 저장하며,
//! 첫 바이트의 최상위 비트가 부호입니다. 음수는 전체 바이트를 반전합니다.

use crate::error::{CdcError, Result};
use crate::payload::PacketPayload;
use bigdecimal::num_bigint::Sign;
use bigdecimal::BigDecimal;
use std::str::FromStr;

const DIGITS_PER_WORD: usize = 9;
const WORD_SIZE: usize = 4;
const DIGITS_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// precision/scale 에 대한 바이너리 길이
pub fn binary_size(precision: u8, scale: u8) -> usize {
    let integral = (precision - scale.min(precision)) as usize;
    let fractional = scale as usize;
    (integral / DIGITS_PER_WORD) * WORD_SIZE
        + DIGITS_TO_BYTES[integral % DIGITS_PER_WORD]
        + (fractional / DIGITS_PER_WORD) * WORD_SIZE
        + DIGITS_TO_BYTES[fractional % DIGITS_PER_WORD]
}

fn check_meta(precision: u8, scale: u8) -> Result<()> {
    if precision == 0 || scale > precision {
        return Err(CdcError::ValueError(format!(
            "invalid decimal meta precision={} scale={}",
            precision, scale
        )));
    }
    Ok(())
}

fn be_value(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn push_group(out: &mut String, bytes: &[u8], digits: usize) -> Result<()> {
    let value = be_value(bytes);
    if value >= 10u64.pow(digits as u32) {
        return Err(CdcError::ValueError(format!(
            "corrupt decimal group {} for {} digits",
            value, digits
        )));
    }
    out.push_str(&format!("{:0width$}", value, width = digits));
    Ok(())
}

pub fn read_decimal(payload: &mut PacketPayload, precision: u8, scale: u8) -> Result<BigDecimal> {
    check_meta(precision, scale)?;
    let size = binary_size(precision, scale);
    let mut bytes = payload.read_string_fix_bytes(size)?.to_vec();

    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    let integral = (precision - scale) as usize;
    let fractional = scale as usize;
    let mut cursor = 0;
    let mut text = String::with_capacity(precision as usize + 2);
    if negative {
        text.push('-');
    }

    let lead = integral % DIGITS_PER_WORD;
    if lead > 0 {
        let n = DIGITS_TO_BYTES[lead];
        push_group(&mut text, &bytes[cursor..cursor + n], lead)?;
        cursor += n;
    }
    for _ in 0..integral / DIGITS_PER_WORD {
        push_group(&mut text, &bytes[cursor..cursor + WORD_SIZE], DIGITS_PER_WORD)?;
        cursor += WORD_SIZE;
    }
    if integral == 0 {
        text.push('0');
    }

    if fractional > 0 {
        text.push('.');
        for _ in 0..fractional / DIGITS_PER_WORD {
            push_group(&mut text, &bytes[cursor..cursor + WORD_SIZE], DIGITS_PER_WORD)?;
            cursor += WORD_SIZE;
        }
        let trail = fractional % DIGITS_PER_WORD;
        if trail > 0 {
            let n = DIGITS_TO_BYTES[trail];
            push_group(&mut text, &bytes[cursor..cursor + n], trail)?;
        }
    }

    BigDecimal::from_str(&text).map_err(|e| CdcError::ValueError(format!("{}: {}", text, e)))
}

fn push_bytes(out: &mut Vec<u8>, digits: &str, width: usize) -> Result<()> {
    let value = u64::from_str(digits).map_err(|e| CdcError::ValueError(e.to_string()))?;
    out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
    Ok(())
}

/// `read_decimal`의 역. scale을 넘는 자릿수나 정수부 overflow는 에러
pub fn write_decimal(
    value: &BigDecimal,
    precision: u8,
    scale: u8,
    payload: &mut PacketPayload,
) -> Result<()> {
    check_meta(precision, scale)?;
    let scaled = value.with_scale(scale as i64);
    if &scaled != value {
        return Err(CdcError::ValueError(format!(
            "{} does not fit scale {}",
            value, scale
        )));
    }

    let (unscaled, _) = scaled.as_bigint_and_exponent();
    let negative = unscaled.sign() == Sign::Minus;
    let mut digits = unscaled.magnitude().to_string();
    let fractional = scale as usize;
    let integral = (precision - scale) as usize;
    if digits.len() < fractional + 1 {
        digits = format!("{:0>width$}", digits, width = fractional + 1);
    }
    let split = digits.len() - fractional;
    let (int_digits, frac_digits) = digits.split_at(split);
    let int_digits = int_digits.trim_start_matches('0');
    if int_digits.len() > integral {
        return Err(CdcError::ValueError(format!(
            "{} overflows DECIMAL({},{})",
            value, precision, scale
        )));
    }
    let int_digits = format!("{:0>width$}", int_digits, width = integral);

    let mut out = Vec::with_capacity(binary_size(precision, scale));
    let lead = integral % DIGITS_PER_WORD;
    if lead > 0 {
        push_bytes(&mut out, &int_digits[..lead], DIGITS_TO_BYTES[lead])?;
    }
    for chunk in int_digits.as_bytes()[lead..].chunks(DIGITS_PER_WORD) {
        push_bytes(&mut out, std::str::from_utf8(chunk).unwrap_or("0"), WORD_SIZE)?;
    }
    let full = (fractional / DIGITS_PER_WORD) * DIGITS_PER_WORD;
    for chunk in frac_digits.as_bytes()[..full].chunks(DIGITS_PER_WORD) {
        push_bytes(&mut out, std::str::from_utf8(chunk).unwrap_or("0"), WORD_SIZE)?;
    }
    let trail = fractional % DIGITS_PER_WORD;
    if trail > 0 {
        push_bytes(&mut out, &frac_digits[full..], DIGITS_TO_BYTES[trail])?;
    }

    if negative {
        out.iter_mut().for_each(|b| *b = !*b);
    }
    out[0] ^= 0x80;
    payload.write_bytes(&out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_hex(hex_text: &str, precision: u8, scale: u8) -> BigDecimal {
        let bytes = hex::decode(hex_text).unwrap();
        let mut payload = PacketPayload::from_bytes(&bytes);
        let value = read_decimal(&mut payload, precision, scale).unwrap();
        assert!(!payload.has_remaining());
        value
    }

    fn encode(value: &str, precision: u8, scale: u8) -> Vec<u8> {
        let mut payload = PacketPayload::new();
        write_decimal(&BigDecimal::from_str(value).unwrap(), precision, scale, &mut payload).unwrap();
        payload.as_slice().to_vec()
    }

    #[test]
    fn test_binary_size() {
        assert_eq!(binary_size(14, 4), 7);
        assert_eq!(binary_size(10, 0), 5);
        assert_eq!(binary_size(65, 30), 30);
        assert_eq!(binary_size(1, 1), 1);
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            decode_hex("810DFB38D204D2", 14, 4),
            BigDecimal::from_str("1234567890.1234").unwrap()
        );
        assert_eq!(
            decode_hex("7EF204C72DFB2D", 14, 4),
            BigDecimal::from_str("-1234567890.1234").unwrap()
        );
        assert_eq!(hex::encode_upper(encode("1234567890.1234", 14, 4)), "810DFB38D204D2");
        assert_eq!(hex::encode_upper(encode("-1234567890.1234", 14, 4)), "7EF204C72DFB2D");
    }

    #[test]
    fn test_round_trips() {
        let cases = [
            ("0", 10, 0),
            ("0.00", 5, 2),
            ("-0.5", 3, 1),
            ("99999999999999999999.999999999", 29, 9),
            ("-12345678901234567890123456789.0123456789", 39, 10),
            ("0.000000001", 10, 9),
            ("42", 2, 0),
        ];
        for (text, precision, scale) in cases {
            let bytes = encode(text, precision, scale);
            assert_eq!(bytes.len(), binary_size(precision, scale), "{}", text);
            let mut payload = PacketPayload::from_bytes(&bytes);
            let decoded = read_decimal(&mut payload, precision, scale).unwrap();
            assert_eq!(decoded, BigDecimal::from_str(text).unwrap(), "{}", text);
        }
    }

    #[test]
    fn test_overflow_and_scale_rejected() {
        let mut payload = PacketPayload::new();
        let too_big = BigDecimal::from_str("1000").unwrap();
        assert!(write_decimal(&too_big, 5, 2, &mut payload).is_err());
        let too_precise = BigDecimal::from_str("1.234").unwrap();
        assert!(write_decimal(&too_precise, 5, 2, &mut payload).is_err());
        assert!(write_decimal(&too_big, 2, 3, &mut payload).is_err());
    }

    #[test]
    fn test_truncated_input() {
        let mut payload = PacketPayload::from_bytes(&[0x81, 0x0D]);
        assert!(read_decimal(&mut payload, 14, 4).is_err());
    }
}
