//! Per-account HTTP(S) and SOCKS5 gateway.
//!
//! Every configured account gets its own listening ports, and everything
//! accepted on them leaves through that account's upstream: the local
//! network or a chained SOCKS5 proxy such as Tor.

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod http_proxy;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod socks_server;
pub mod upstream;
