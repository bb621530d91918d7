//! # Yuki Core
//!
//! Tunnel engine for the Yuki point-to-point IP tunnel.
//!
//! This crate provides:
//! - Plaintext frame encoding and decoding (Data, Ping, Pong)
//! - Length-delimited record channels over any reliable byte stream
//! - The two-record handshake that authenticates a client and delivers a
//!   per-session key
//! - Session state, traffic counters and keepalive clock
//! - The duplex relay binding one session to one virtual interface
//! - The responder engine ([`TunnelEngine`]) and the initiator
//!   ([`TunnelClient`])
//! - A client registry implementing [`IdentityStore`]
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │        TunnelEngine (session table)  /  TunnelClient           │
//! ├───────────────────────────────────────────────────────────────┤
//! │   Relay: inbound loop  ◄── select! + shutdown ──►  outbound    │
//! ├───────────────────────────────┬───────────────────────────────┤
//! │  Frames sealed into envelopes │  VirtualInterface (yuki-tun)  │
//! ├───────────────────────────────┴───────────────────────────────┤
//! │                Record channel (TLS, TCP, memory)              │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod identity;
pub mod relay;
pub mod session;

pub use channel::{Channel, RecordSink, RecordSource};
pub use client::{ClientSession, TunnelClient};
pub use config::TunnelConfig;
pub use engine::{SessionHandle, TunnelEngine};
pub use error::{FrameError, IdentityError, Result, TunnelError};
pub use frame::{FRAME_HEADER_SIZE, Frame, FrameType};
pub use handshake::{ClientHello, PROTOCOL_VERSION, ServerReply};
pub use identity::{ClientRecord, ClientRegistry, IdentityStore};
pub use session::{Session, SessionSnapshot, SessionState};
