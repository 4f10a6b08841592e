//! Fronthaul Core Library
//!
//! Protocol building blocks for the fronthaul tunnel server: the obfuscated
//! meek cookie codec and the udpgw port-forward multiplexing codec, plus the
//! shared connection primitives used by the server.

#![crate_type = "lib"]

pub use self::{
    cookie::{generate_key_pair, open_cookie, seal_cookie, ClientSessionData},
    udpgw::Message,
};

pub mod cookie;
pub mod net;
pub mod obfuscate;
pub mod udpgw;
