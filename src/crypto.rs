//! Per-peer packet encryption.
//!
//! Each authenticated peer gets a 32-byte session key used for the lifetime
//! of its connection. Packets are sealed with AES-256-GCM; the 12-byte
//! random nonce is prepended so every ciphertext is self-contained. The
//! user's password doubles as a key-encryption key for the authentication
//! token after being padded to the key length.

use crate::error::{VpnError, VpnResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

/// Session key length in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Filler byte appended to short passwords.
const PAD_BYTE: u8 = b't';

/// A 32-byte symmetric session key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice; `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("SessionKey(..)")
    }
}

/// Pad or truncate a password into a 32-byte key-encryption key.
pub fn pad_password(password: &str) -> SessionKey {
    let mut key = [PAD_BYTE; KEY_LEN];
    let bytes = password.as_bytes();
    let n = bytes.len().min(KEY_LEN);
    key[..n].copy_from_slice(&bytes[..n]);
    SessionKey(key)
}

/// Returns true if `b` is allowed in a decrypted token key: digits,
/// uppercase, or lowercase ASCII, with the punctuation gaps rejected.
pub fn is_token_key_byte(b: u8) -> bool {
    b.is_ascii_digit() || b.is_ascii_uppercase() || b.is_ascii_lowercase()
}

/// AES-256-GCM packet cipher bound to one key.
#[derive(Clone)]
pub struct PacketCipher {
    cipher: Aes256Gcm,
}

impl PacketCipher {
    /// Create a cipher from a session key.
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Create a cipher keyed by a padded password.
    pub fn from_password(password: &str) -> Self {
        Self::new(&pad_password(password))
    }

    /// Encrypt a packet. The returned buffer is `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> VpnResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VpnError::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a sealed packet. Fails on truncated input, a bad tag, or any
    /// tampering; callers drop the frame and continue.
    pub fn open(&self, data: &[u8]) -> VpnResult<Vec<u8>> {
        if data.len() <= NONCE_LEN {
            return Err(VpnError::Crypto(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VpnError::Crypto("decryption failed".into()))
    }
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = SessionKey::new([7u8; KEY_LEN]);
        let cipher = PacketCipher::new(&key);
        let packet = b"\x45\x00\x00\x14some ip payload";

        let sealed = cipher.seal(packet).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], packet.as_slice());
        assert_eq!(cipher.open(&sealed).unwrap(), packet);
    }

    #[test]
    fn test_open_rejects_tampering() {
        let cipher = PacketCipher::new(&SessionKey::new([7u8; KEY_LEN]));
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let sealed = PacketCipher::new(&SessionKey::new([1u8; KEY_LEN]))
            .seal(b"payload")
            .unwrap();
        let other = PacketCipher::new(&SessionKey::new([2u8; KEY_LEN]));
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_open_rejects_truncated() {
        let cipher = PacketCipher::new(&SessionKey::new([7u8; KEY_LEN]));
        assert!(cipher.open(&[]).is_err());
        assert!(cipher.open(&[0u8; NONCE_LEN]).is_err());
    }

    #[test]
    fn test_pad_password() {
        assert_eq!(pad_password("pw").as_bytes(), b"pwtttttttttttttttttttttttttttttt");
        let exact = "a".repeat(KEY_LEN);
        assert_eq!(pad_password(&exact).as_bytes(), exact.as_bytes());
        let long = "b".repeat(KEY_LEN + 5);
        assert_eq!(pad_password(&long).as_bytes(), &long.as_bytes()[..KEY_LEN]);
    }

    #[test]
    fn test_token_key_charset() {
        for b in [b'0', b'9', b'A', b'Z', b'a', b'z'] {
            assert!(is_token_key_byte(b));
        }
        // The gap bytes around the allowed ranges are rejected.
        for b in [b' ', b'/', b':', b'@', b'[', b'`', b'{', 0x00, 0xff] {
            assert!(!is_token_key_byte(b));
        }
    }
}
