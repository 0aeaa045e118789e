//! Framed AES-256-GCM streaming.
//!
//! Wire layout: `nonce (12) || [ len (4, big-endian) || ciphertext ]*`.
//! Each ciphertext decrypts to at most 64 KB of plaintext. The per-frame
//! nonce keeps the first 4 bytes of the stream nonce and replaces the last
//! 8 with the big-endian frame counter, so a (key, nonce) pair can never
//! repeat within a stream. The counter is capped at 2^32 frames.

use crate::crypto::keys::EncryptionKey;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use bytes::Bytes;
use futures::stream::Stream;
use futures::stream;
use rand::RngCore;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const LEN_PREFIX: usize = 4;
/// Plaintext bytes per frame.
pub const FRAME_SIZE: usize = 64 * 1024;
/// Hard ceiling on frames per stream; past this the counter bytes would wrap
/// into territory a second stream under the same key could reuse.
const MAX_FRAMES: u64 = 1 << 32;

/// Exact on-wire size of an encrypted stream for `plaintext_len` input bytes.
pub fn ciphertext_len(plaintext_len: u64) -> u64 {
    let frames = plaintext_len.div_ceil(FRAME_SIZE as u64);
    NONCE_LEN as u64 + plaintext_len + frames * (LEN_PREFIX + TAG_LEN) as u64
}

fn frame_nonce(base: &[u8; NONCE_LEN], index: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn exhausted() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "frame counter exhausted (2^32 frames)",
    )
}

enum EncodePhase {
    Nonce,
    Frames,
    Done,
}

struct EncoderState<R> {
    reader: R,
    cipher: Aes256Gcm,
    nonce_base: [u8; NONCE_LEN],
    counter: u64,
    phase: EncodePhase,
}

/// Encrypt `reader` into the framed stream layout.
///
/// Pull-driven: the first item is the stream nonce, every following item is
/// one `len || ciphertext` frame. An encrypt or read failure ends the stream
/// with that error.
pub fn encrypt_stream<R>(
    reader: R,
    key: &EncryptionKey,
) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    R: AsyncRead + Unpin + Send,
{
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let mut nonce_base = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_base);

    let state = EncoderState {
        reader,
        cipher,
        nonce_base,
        counter: 0,
        phase: EncodePhase::Nonce,
    };

    stream::unfold(state, |mut st| async move {
        match st.phase {
            EncodePhase::Nonce => {
                st.phase = EncodePhase::Frames;
                Some((Ok(Bytes::copy_from_slice(&st.nonce_base)), st))
            }
            EncodePhase::Frames => {
                let mut buf = vec![0u8; FRAME_SIZE];
                let filled = match fill_buf(&mut st.reader, &mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        st.phase = EncodePhase::Done;
                        return Some((Err(e), st));
                    }
                };
                if filled == 0 {
                    st.phase = EncodePhase::Done;
                    return None;
                }
                if st.counter >= MAX_FRAMES {
                    st.phase = EncodePhase::Done;
                    return Some((Err(exhausted()), st));
                }

                let nonce = frame_nonce(&st.nonce_base, st.counter);
                let ciphertext = match st
                    .cipher
                    .encrypt(GenericArray::from_slice(&nonce), &buf[..filled])
                {
                    Ok(ct) => ct,
                    Err(_) => {
                        st.phase = EncodePhase::Done;
                        return Some((
                            Err(io::Error::new(io::ErrorKind::Other, "encryption failed")),
                            st,
                        ));
                    }
                };
                st.counter += 1;

                let mut framed = Vec::with_capacity(LEN_PREFIX + ciphertext.len());
                framed.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
                framed.extend_from_slice(&ciphertext);
                Some((Ok(Bytes::from(framed)), st))
            }
            EncodePhase::Done => None,
        }
    })
}

// Read until the buffer is full or the source hits EOF, so frames stay at
// FRAME_SIZE even over a drip-feeding reader.
async fn fill_buf<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reads the framed layout back into plaintext frames.
///
/// Symmetric to the encoder: the 12-byte nonce once, then alternating
/// `(length, ciphertext, decrypt under the next counter)`. A decrypt failure
/// is terminal.
pub struct FrameDecoder<R> {
    reader: R,
    cipher: Aes256Gcm,
    nonce_base: Option<[u8; NONCE_LEN]>,
    counter: u64,
    failed: bool,
}

impl<R: AsyncRead + Unpin> FrameDecoder<R> {
    pub fn new(reader: R, key: &EncryptionKey) -> Self {
        Self {
            reader,
            cipher: Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())),
            nonce_base: None,
            counter: 0,
            failed: false,
        }
    }

    /// Next plaintext frame, or `None` at a clean end of stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "decoder already failed",
            ));
        }

        if self.nonce_base.is_none() {
            let mut nonce = [0u8; NONCE_LEN];
            self.reader.read_exact(&mut nonce).await?;
            self.nonce_base = Some(nonce);
        }

        let mut len_buf = [0u8; LEN_PREFIX];
        if !read_exact_or_eof(&mut self.reader, &mut len_buf).await? {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len < TAG_LEN || frame_len > FRAME_SIZE + TAG_LEN {
            self.failed = true;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} out of bounds", frame_len),
            ));
        }

        let mut ciphertext = vec![0u8; frame_len];
        self.reader.read_exact(&mut ciphertext).await?;

        if self.counter >= MAX_FRAMES {
            self.failed = true;
            return Err(exhausted());
        }
        let nonce = frame_nonce(self.nonce_base.as_ref().unwrap(), self.counter);
        self.counter += 1;

        match self
            .cipher
            .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_slice())
        {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(_) => {
                self.failed = true;
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decryption failed: wrong key or corrupted stream",
                ))
            }
        }
    }
}

// Ok(true) when the buffer was filled, Ok(false) on EOF at a frame boundary.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame header",
            ));
        }
        filled += n;
    }
    Ok(true)
}
