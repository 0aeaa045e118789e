pub mod session;

pub use session::{ChunkHeaders, ChunkOutcome, SessionStore, UploadSession};
