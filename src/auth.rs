//! Token authentication.
//!
//! A client proves its identity with a single wire string:
//! `"<username>:<base64(seal(padded_password, session_key))>"`. The server
//! decrypts the second part under the user's padded password; the plaintext
//! *is* the 32-byte session key for the connection. Decrypted keys must pass
//! the alphanumeric charset filter — the session keys minted by
//! [`make_token`] satisfy it by construction.

use crate::crypto::{self, PacketCipher, SessionKey, KEY_LEN};
use crate::error::{VpnError, VpnResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// A configured user: immutable after startup.
#[derive(Debug, Clone)]
pub struct UserCredential {
    /// Username, the first token component.
    pub name: String,
    /// Password; padded to 32 bytes to form the key-encryption key.
    pub password: String,
    /// Virtual address assigned to this user.
    pub ip: Ipv4Addr,
}

struct KnownUser {
    kek: PacketCipher,
    ip: Ipv4Addr,
}

/// Validates tokens against the configured credential set.
pub struct Authenticator {
    users: HashMap<String, KnownUser>,
}

impl Authenticator {
    /// Build the credential table. The key-encryption ciphers are derived
    /// once here rather than per handshake.
    pub fn new(users: &[UserCredential]) -> Self {
        let users = users
            .iter()
            .map(|u| {
                (
                    u.name.clone(),
                    KnownUser {
                        kek: PacketCipher::from_password(&u.password),
                        ip: u.ip,
                    },
                )
            })
            .collect();
        Self { users }
    }

    /// Verify a presented token. On success returns the user's assigned
    /// virtual address and the recovered session key; the caller is
    /// responsible for binding them into the peer table. Every failure path
    /// returns `None` without any side effect.
    pub fn verify(&self, token: &str) -> Option<(Ipv4Addr, SessionKey)> {
        let mut parts = token.splitn(2, ':');
        let name = parts.next()?;
        let Some(encoded) = parts.next() else {
            log::debug!("malformed token: missing separator");
            return None;
        };

        let Some(user) = self.users.get(name) else {
            log::debug!("unknown user: {}", name);
            return None;
        };

        let ciphertext = match BASE64.decode(encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("token base64 decode failed: {}", e);
                return None;
            }
        };

        let plaintext = match user.kek.open(&ciphertext) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("token decrypt failed for {}: {}", name, e);
                return None;
            }
        };

        if !plaintext.iter().all(|&b| crypto::is_token_key_byte(b)) {
            log::debug!("session key for {} failed charset check", name);
            return None;
        }

        let Some(key) = SessionKey::from_slice(&plaintext) else {
            log::debug!(
                "session key for {} has wrong length: {}",
                name,
                plaintext.len()
            );
            return None;
        };

        Some((user.ip, key))
    }
}

/// Mint a client token: a fresh 32-byte alphanumeric session key sealed
/// under the user's padded password. Returns the wire token and the key the
/// client will use for the lifetime of the session.
pub fn make_token(name: &str, password: &str) -> VpnResult<(String, SessionKey)> {
    let raw: Vec<u8> = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .collect();
    let key = SessionKey::from_slice(&raw)
        .ok_or_else(|| VpnError::Crypto("session key generation failed".into()))?;

    let kek = PacketCipher::from_password(password);
    let sealed = kek.seal(key.as_bytes())?;
    Ok((format!("{}:{}", name, BASE64.encode(sealed)), key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<UserCredential> {
        vec![UserCredential {
            name: "u".into(),
            password: "pw".into(),
            ip: Ipv4Addr::new(10, 0, 0, 2),
        }]
    }

    fn token_for(password: &str, key: &[u8]) -> String {
        let sealed = PacketCipher::from_password(password).seal(key).unwrap();
        format!("u:{}", BASE64.encode(sealed))
    }

    #[test]
    fn test_happy_path() {
        let auth = Authenticator::new(&users());
        let key = [b'0'; KEY_LEN];

        let (ip, session) = auth.verify(&token_for("pw", &key)).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(session.as_bytes(), &key);
    }

    #[test]
    fn test_minted_token_verifies() {
        let auth = Authenticator::new(&users());
        let (token, key) = make_token("u", "pw").unwrap();

        let (ip, session) = auth.verify(&token).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(session.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_missing_separator_rejected() {
        let auth = Authenticator::new(&users());
        assert!(auth.verify("no-separator-here").is_none());
    }

    #[test]
    fn test_unknown_user_rejected() {
        let auth = Authenticator::new(&users());
        let sealed = PacketCipher::from_password("pw")
            .seal(&[b'0'; KEY_LEN])
            .unwrap();
        let token = format!("nobody:{}", BASE64.encode(sealed));
        assert!(auth.verify(&token).is_none());
    }

    #[test]
    fn test_bad_base64_rejected() {
        let auth = Authenticator::new(&users());
        assert!(auth.verify("u:%%%not-base64%%%").is_none());
    }

    #[test]
    fn test_wrong_password_rejected() {
        let auth = Authenticator::new(&users());
        let token = token_for("wrong", &[b'0'; KEY_LEN]);
        assert!(auth.verify(&token).is_none());
    }

    #[test]
    fn test_key_with_space_rejected() {
        // Decryption succeeds but the charset filter must still reject it.
        let auth = Authenticator::new(&users());
        let mut key = [b'0'; KEY_LEN];
        key[5] = 0x20;
        assert!(auth.verify(&token_for("pw", &key)).is_none());
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let auth = Authenticator::new(&users());
        assert!(auth.verify(&token_for("pw", &[b'0'; 16])).is_none());
    }
}
