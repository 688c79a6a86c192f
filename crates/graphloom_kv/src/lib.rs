//! Coordination plane for Graphloom.
//!
//! Ephemeral cross-process state lives here: the named work queues and
//! the sliding rate-limit windows. Everything goes through the small
//! `Kv` trait so production runs against Redis while tests and
//! single-node setups use the in-memory backend with the same
//! semantics.

pub mod broker;
pub mod clock;
pub mod error;
pub mod governor;
pub mod kv;
pub mod mem;
pub mod redis_kv;

pub use broker::{BrokerJob, BrokerJobStatus, QueueBroker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{KvError, Result};
pub use governor::{Admission, RateGovernor};
pub use kv::Kv;
pub use mem::MemoryKv;
pub use redis_kv::RedisKv;
