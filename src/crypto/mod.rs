pub mod framing;
pub mod keys;
pub mod pake;
pub mod token;

pub use framing::{ciphertext_len, encrypt_stream, FrameDecoder};
pub use keys::EncryptionKey;
pub use token::Token;
