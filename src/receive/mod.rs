pub mod client;
pub mod uploader;

pub use client::{ReceiveOptions, ReceiveOutcome, Receiver, STDOUT_SENTINEL};
pub use uploader::{ParallelUploader, UploadOptions, UploadSummary};
