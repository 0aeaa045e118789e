use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// 256-bit AES key. Either random (PAKE-agreed) or derived from a password.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// PBKDF2-HMAC-SHA256 with 100k iterations. Both ends must hold the same
    /// salt, announced by `/d/encrypt-info`.
    pub fn derive(password: &str, salt: &[u8]) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.write_str("EncryptionKey(..)")
    }
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

pub fn salt_to_base64(salt: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(salt)
}

pub fn salt_from_base64(encoded: &str) -> anyhow::Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = EncryptionKey::derive("hunter2", &salt);
        let b = EncryptionKey::derive("hunter2", &salt);
        assert_eq!(a, b);
    }

    #[test]
    fn salt_and_password_both_matter() {
        let salt = [7u8; SALT_LEN];
        let other_salt = [8u8; SALT_LEN];
        let base = EncryptionKey::derive("hunter2", &salt);
        assert_ne!(base, EncryptionKey::derive("hunter3", &salt));
        assert_ne!(base, EncryptionKey::derive("hunter2", &other_salt));
    }

    #[test]
    fn salt_base64_round_trips() {
        let salt = random_salt();
        let encoded = salt_to_base64(&salt);
        assert_eq!(salt_from_base64(&encoded).unwrap(), salt.to_vec());
    }
}
