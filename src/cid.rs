//! Content ids.
//!
//! A `Cid` is a codec tag plus the BLAKE3 digest of a block's bytes. The
//! codec tells the decode registry how to parse the block; the digest is
//! both the address and the integrity check.
//!
//! Text form:   `<codec-name>:<64 hex digits>` (e.g. `raw:af13...`)
//! Binary form: `[uvarint codec][32 digest bytes]`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};
use crate::varint::{push_varint, read_varint};

// ── Codecs ─────────────────────────────────────────────────────────

/// Opaque bytes: parity shards and leaf payloads.
pub const RAW: u64 = 0x55;

/// Plain DAG node envelope (payload + links).
pub const DAG_NODE: u64 = 0x70;

/// Reed-Solomon recovery node envelope.
pub const RECOVERY_REEDSOLOMON: u64 = 0x700;

/// Digest length in bytes (BLAKE3-256).
pub const DIGEST_LEN: usize = 32;

/// Human-readable codec name, or None for unknown codecs.
pub fn codec_name(codec: u64) -> Option<&'static str> {
    match codec {
        RAW => Some("raw"),
        DAG_NODE => Some("dag-node"),
        RECOVERY_REEDSOLOMON => Some("recovery-reedsolomon"),
        _ => None,
    }
}

fn codec_from_name(name: &str) -> Option<u64> {
    match name {
        "raw" => Some(RAW),
        "dag-node" => Some(DAG_NODE),
        "recovery-reedsolomon" => Some(RECOVERY_REEDSOLOMON),
        other => other
            .strip_prefix("0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok()),
    }
}

// ── Cid ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid {
    codec: u64,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    /// Hash `data` under the given codec.
    pub fn new(codec: u64, data: &[u8]) -> Self {
        Self {
            codec,
            digest: *blake3::hash(data).as_bytes(),
        }
    }

    /// Shorthand for `Cid::new(RAW, data)`.
    pub fn raw(data: &[u8]) -> Self {
        Self::new(RAW, data)
    }

    pub fn from_parts(codec: u64, digest: [u8; DIGEST_LEN]) -> Self {
        Self { codec, digest }
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// True if `data` hashes to this id.
    pub fn matches(&self, data: &[u8]) -> bool {
        blake3::hash(data).as_bytes() == &self.digest
    }

    /// Append the binary form to `out`.
    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        push_varint(out, self.codec);
        out.extend_from_slice(&self.digest);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DIGEST_LEN + 3);
        self.write_bytes(&mut out);
        out
    }

    /// Parse the binary form from the front of `bytes`, returning `(cid, consumed)`.
    pub fn read_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        let (codec, n) = read_varint(bytes)
            .ok_or_else(|| RecoveryError::InvalidFormat("truncated cid codec".into()))?;
        let end = n + DIGEST_LEN;
        if bytes.len() < end {
            return Err(RecoveryError::InvalidFormat("truncated cid digest".into()));
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[n..end]);
        Ok((Self { codec, digest }, end))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = blake3::Hash::from(self.digest).to_hex();
        match codec_name(self.codec) {
            Some(name) => write!(f, "{}:{}", name, hex),
            None => write!(f, "{:#x}:{}", self.codec, hex),
        }
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, hex) = s
            .split_once(':')
            .ok_or_else(|| RecoveryError::InvalidFormat(format!("malformed cid '{}'", s)))?;
        let codec = codec_from_name(name)
            .ok_or_else(|| RecoveryError::InvalidFormat(format!("unknown codec '{}'", name)))?;
        let hash = blake3::Hash::from_hex(hex)
            .map_err(|e| RecoveryError::InvalidFormat(format!("bad digest in '{}': {}", s, e)))?;
        Ok(Self {
            codec,
            digest: *hash.as_bytes(),
        })
    }
}
