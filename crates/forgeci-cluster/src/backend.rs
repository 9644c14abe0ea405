//! Backing technologies for the cluster structures.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryProvider;
pub use self::redis::RedisProvider;
