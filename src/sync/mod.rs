// src/sync/mod.rs

//! The read-skewed RCU lock and the read-mostly hash map built on top of it.

mod rcu;
mod rcu_map;

pub use rcu::ReadSkewedLock;
pub use rcu_map::RcuHashMap;
