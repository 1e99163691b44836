//! Lock-free SPSC ring buffers and the stream-keyed ring pool

pub mod buffer;
pub mod pool;

pub use buffer::RingBuffer;
pub use pool::RingBufferPool;
