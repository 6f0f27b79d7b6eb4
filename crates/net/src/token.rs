//! Connect tokens: a fixed-size signed blob handed to a client out of band
//! and presented in its connection request. The server shares the signing
//! key; nothing else needs to be coordinated ahead of time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ring::hmac;

use crate::protocol::KEY_BYTES;

pub const USER_DATA_BYTES: usize = 32;
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

const ADDR_BYTES: usize = 63;
const TAG_BYTES: usize = 32;
const SIGNED_BYTES: usize = 8 + 8 + USER_DATA_BYTES + 1 + ADDR_BYTES;

/// Total size of an encoded token.
pub const TOKEN_BYTES: usize = SIGNED_BYTES + TAG_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("private key must be exactly {KEY_BYTES} bytes")]
    BadKeyLength,
    #[error("token is not {TOKEN_BYTES} bytes")]
    BadLength,
    #[error("server address exceeds {ADDR_BYTES} bytes")]
    AddressTooLong,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Decoded, verified token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToken {
    pub client_id: u64,
    pub expiry_unix: u64,
    pub user_data: [u8; USER_DATA_BYTES],
    pub server_addr: String,
}

/// Derives a signing key from a shared secret string, for setups that
/// configure a passphrase instead of raw key bytes.
pub fn key_from_secret(secret: &str) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, secret.as_bytes())
        .as_ref()
        .to_vec()
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Builds and signs a token valid for `lifetime` from now. `user_data` is
/// truncated or zero-padded to [`USER_DATA_BYTES`].
pub fn generate_connect_token(
    client_id: u64,
    server_addr: &str,
    user_data: &[u8],
    private_key: &[u8],
    lifetime: Duration,
) -> Result<Vec<u8>, TokenError> {
    if private_key.len() != KEY_BYTES {
        return Err(TokenError::BadKeyLength);
    }
    let addr = server_addr.as_bytes();
    if addr.len() > ADDR_BYTES {
        return Err(TokenError::AddressTooLong);
    }

    let mut buf = Vec::with_capacity(TOKEN_BYTES);
    buf.extend_from_slice(&client_id.to_le_bytes());
    let expiry = unix_now() + lifetime.as_secs();
    buf.extend_from_slice(&expiry.to_le_bytes());

    let mut padded = [0u8; USER_DATA_BYTES];
    let take = user_data.len().min(USER_DATA_BYTES);
    padded[..take].copy_from_slice(&user_data[..take]);
    buf.extend_from_slice(&padded);

    buf.push(addr.len() as u8);
    buf.extend_from_slice(addr);
    buf.resize(SIGNED_BYTES, 0);

    let key = hmac::Key::new(hmac::HMAC_SHA256, private_key);
    let tag = hmac::sign(&key, &buf);
    buf.extend_from_slice(tag.as_ref());
    debug_assert_eq!(buf.len(), TOKEN_BYTES);
    Ok(buf)
}

/// Checks signature and expiry, returning the decoded fields.
pub fn verify_connect_token(
    token: &[u8],
    private_key: &[u8],
    now_unix: u64,
) -> Result<ConnectToken, TokenError> {
    if private_key.len() != KEY_BYTES {
        return Err(TokenError::BadKeyLength);
    }
    if token.len() != TOKEN_BYTES {
        return Err(TokenError::BadLength);
    }

    let (signed, tag) = token.split_at(SIGNED_BYTES);
    let key = hmac::Key::new(hmac::HMAC_SHA256, private_key);
    hmac::verify(&key, signed, tag).map_err(|_| TokenError::BadSignature)?;

    let client_id = u64::from_le_bytes(signed[0..8].try_into().unwrap_or_default());
    let expiry_unix = u64::from_le_bytes(signed[8..16].try_into().unwrap_or_default());
    if now_unix > expiry_unix {
        return Err(TokenError::Expired);
    }

    let mut user_data = [0u8; USER_DATA_BYTES];
    user_data.copy_from_slice(&signed[16..16 + USER_DATA_BYTES]);

    let addr_start = 16 + USER_DATA_BYTES + 1;
    let addr_len = (signed[16 + USER_DATA_BYTES] as usize).min(ADDR_BYTES);
    let server_addr = String::from_utf8_lossy(&signed[addr_start..addr_start + addr_len]).into_owned();

    Ok(ConnectToken {
        client_id,
        expiry_unix,
        user_data,
        server_addr,
    })
}
