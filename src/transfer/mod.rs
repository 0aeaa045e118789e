pub mod buffer_pool;
pub mod checksum;
pub mod io;
pub mod limiter;
pub mod progress;
pub mod zipper;

pub use buffer_pool::{BufferPool, BufferPools};
pub use checksum::ChecksumCache;
pub use limiter::{LimiterRegistry, TokenBucket};
pub use progress::{ProgressAggregator, ProgressSnapshot, TransferMeter};
