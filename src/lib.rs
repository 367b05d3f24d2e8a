//! sockspipe - SOCKS5 bridge served over a local stream endpoint.
//!
//! This crate provides:
//! - `proto`: the framed wire protocol spoken over the endpoint
//! - `pipe`: the multi-instance endpoint server
//! - `worker`: the dispatch core binding pipe channels to SOCKS sessions
//! - `socks`: the SOCKS5 originator opening outgoing target connections
//! - `tcpmux`: the multiplexer owning the established target sockets
//!
//! Peers connect to the endpoint, declare a read/write/duplex channel with a
//! `channel_setup` frame, then multiplex any number of SOCKS5 sessions toward
//! arbitrary TCP targets:
//!
//! ```text
//! peer ──pipe instance──▶ worker ──session──▶ SOCKS originator ──▶ target
//!      ◀──socks frames──        ◀──events───                   ◀── bytes
//! ```
//!
//! Unix-only: the endpoint is a Unix-domain stream socket.

pub mod config;
pub mod pipe;
pub mod proto;
pub mod socks;
pub mod tcpmux;
pub mod worker;

pub use config::{Config, ConfigError};
pub use pipe::{InstanceToken, PipeEvent, PipeServer};
pub use proto::{ClientId, Frame, FrameBody, SocksId};
pub use socks::{SocksEvent, SocksProxy, Token};
pub use tcpmux::{TcpEvent, TcpMux};
pub use worker::{ExitReason, Worker, WorkerConfig};
