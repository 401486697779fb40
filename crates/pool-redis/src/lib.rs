pub mod client;
pub mod error;
pub mod rank;

pub use client::{PoolRedis, ReplyClass};
pub use error::RedisError;
pub use rank::alpha_num_rank;
