//! 32-byte Curve25519 / preshared key material.
//!
//! UAPI text carries keys as 64 lowercase hex characters, wg-quick files as
//! standard base64. Both decode into the same [`Key`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::sync::atomic::{compiler_fence, Ordering};

/// Length of every WireGuard key in bytes.
pub const KEY_LEN: usize = 32;

/// Raw key material, zeroed on drop. `Debug` never prints the full value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    /// Decode 64 hex characters (either case).
    pub fn from_hex(text: &str) -> Option<Self> {
        let text = text.as_bytes();
        if text.len() != KEY_LEN * 2 {
            return None;
        }
        let mut out = [0u8; KEY_LEN];
        for (i, pair) in text.chunks_exact(2).enumerate() {
            out[i] = (hex_digit(pair[0])? << 4) | hex_digit(pair[1])?;
        }
        Some(Key(out))
    }

    /// Decode standard padded base64 (44 characters).
    pub fn from_base64(text: &str) -> Option<Self> {
        let decoded = STANDARD.decode(text.trim()).ok()?;
        let bytes: [u8; KEY_LEN] = decoded.try_into().ok()?;
        Some(Key(bytes))
    }

    /// Lowercase hex, as emitted by UAPI get.
    pub fn to_hex(&self) -> String {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(KEY_LEN * 2);
        for byte in self.0 {
            out.push(DIGITS[(byte >> 4) as usize] as char);
            out.push(DIGITS[(byte & 0x0f) as usize] as char);
        }
        out
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// An all-zero key means "unset" in UAPI.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Overwrite the key material with zeroes.
    pub fn wipe(&mut self) {
        for byte in self.0.iter_mut() {
            // SAFETY: `byte` is a valid, aligned, exclusive reference into `self.0`.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
        compiler_fence(Ordering::SeqCst);
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.wipe();
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        write!(f, "Key({}…)", &b64[..8])
    }
}
