//! 代理链接签名
//!
//! 签名格式: `<hex(HMAC-SHA256(secret, path ":" expire))>:<expire>`
//! expire 为 Unix 秒，0 表示永不过期。

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::time::Duration;

const BLOCK_LEN: usize = 64;

/// 签名校验错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("缺少签名")]
    Missing,
    #[error("签名无效")]
    Invalid,
    #[error("签名已过期")]
    Expired,
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut key_block = [0u8; BLOCK_LEN];
    if key.len() > BLOCK_LEN {
        let digest = Sha256::digest(key);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; BLOCK_LEN];
    let mut opad = [0x5cu8; BLOCK_LEN];
    for i in 0..BLOCK_LEN {
        ipad[i] ^= key_block[i];
        opad[i] ^= key_block[i];
    }

    let inner = Sha256::new().chain_update(ipad).chain_update(message).finalize();
    let outer = Sha256::new().chain_update(opad).chain_update(inner).finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&outer);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 代理链接签名器
#[derive(Clone)]
pub struct LinkSigner {
    secret: Vec<u8>,
    /// 签名有效期，零表示永不过期
    expiry: Duration,
}

impl std::fmt::Debug for LinkSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSigner")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl LinkSigner {
    pub fn new(secret: impl Into<Vec<u8>>, expiry: Duration) -> Self {
        Self {
            secret: secret.into(),
            expiry,
        }
    }

    fn digest(&self, path: &str, expire: i64) -> String {
        let message = format!("{}:{}", path, expire);
        hex::encode(hmac_sha256(&self.secret, message.as_bytes()))
    }

    /// 为路径生成签名
    pub fn sign(&self, path: &str) -> String {
        self.sign_at(path, Utc::now().timestamp())
    }

    fn sign_at(&self, path: &str, now: i64) -> String {
        let expire = if self.expiry.is_zero() {
            0
        } else {
            now + self.expiry.as_secs() as i64
        };
        format!("{}:{}", self.digest(path, expire), expire)
    }

    /// 校验路径上的签名
    pub fn verify(&self, path: &str, sign: &str) -> Result<(), SignError> {
        self.verify_at(path, sign, Utc::now().timestamp())
    }

    fn verify_at(&self, path: &str, sign: &str, now: i64) -> Result<(), SignError> {
        if sign.is_empty() {
            return Err(SignError::Missing);
        }
        let (digest, expire) = sign.rsplit_once(':').ok_or(SignError::Invalid)?;
        let expire: i64 = expire.parse().map_err(|_| SignError::Invalid)?;
        if !constant_time_eq(digest.as_bytes(), self.digest(path, expire).as_bytes()) {
            return Err(SignError::Invalid);
        }
        if expire != 0 && expire < now {
            return Err(SignError::Expired);
        }
        Ok(())
    }
}
