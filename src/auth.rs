//! MySQL 인증 처리
//!
//! mysql_native_password, caching_sha2_password(fast auth) 구현

use crate::error::{CdcError, Result};
use crate::payload::PacketPayload;
use bytes::Bytes;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
}

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// caching_sha2_password fast auth 성공 표시
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
/// caching_sha2_password full auth 필요 표시
pub const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;

/// 지원하는 인증 플러그인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            NATIVE_PASSWORD | "" => Ok(AuthPlugin::NativePassword),
            CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2Password),
            other => Err(CdcError::AuthenticationError(format!(
                "unsupported authentication plugin {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => NATIVE_PASSWORD,
            AuthPlugin::CachingSha2Password => CACHING_SHA2_PASSWORD,
        }
    }

    /// 플러그인별 scramble 응답
    pub fn scramble(&self, password: &str, scramble: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::NativePassword => scramble_native_password(password, scramble),
            AuthPlugin::CachingSha2Password => scramble_caching_sha2(password, scramble),
        }
    }
}

/// Native password 인증 응답 생성
///
/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
pub fn scramble_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password 응답 생성
///
/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
pub fn scramble_caching_sha2(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(scramble);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// HandshakeResponse41 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
    plugin: AuthPlugin,
) -> Bytes {
    let mut capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if database.is_some() {
        capabilities |= capabilities::CONNECT_WITH_DB;
    }

    let mut payload = PacketPayload::new();
    payload.write_int4(capabilities);
    // Max packet size - 0 means default (16MB)
    payload.write_int4(0);
    payload.write_int1(collation);
    payload.write_reserved(23);
    payload.write_string_nul(username.as_bytes());

    let auth_response = plugin.scramble(password, scramble);
    payload.write_int1(auth_response.len() as u8);
    payload.write_bytes(&auth_response);

    if let Some(db) = database {
        payload.write_string_nul(db.as_bytes());
    }

    payload.write_string_nul(plugin.name().as_bytes());
    payload.into_bytes()
}
