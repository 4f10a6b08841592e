//! Shared connection primitives

pub use self::{
    activity::ActivityUdpSocket,
    conns::{ConnGuard, ConnSet},
    lru::{LruConns, LruEntry},
    timeout::IdleTimeoutStream,
};

pub mod activity;
pub mod conns;
pub mod lru;
pub mod timeout;
