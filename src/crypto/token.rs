use rand::RngCore;

/// Entropy behind each token.
const TOKEN_BYTES: usize = 32;

/// Per-process download/upload secret: 32 random bytes as 64 lowercase hex
/// characters, embedded as a path segment in every privileged URL.
#[derive(Clone, Debug)]
pub struct Token(String);

impl Token {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Byte-for-byte comparison without early exit, so the match time does
    /// not leak how much of a guessed token was correct.
    pub fn matches(&self, candidate: &str) -> bool {
        let ours = self.0.as_bytes();
        let theirs = candidate.as_bytes();
        if ours.len() != theirs.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in ours.iter().zip(theirs.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
