//! # nearchat-engine
//!
//! Runtime logic for nearchat, embedded into the CLI or any other
//! front-end.
//!
//! This crate provides:
//! - **Session state machine**: a single command-driven actor that owns
//!   the stream and key material for one peer session at a time, from
//!   connect/listen through handshake, verification, and teardown
//! - **Handshake engine**: role-asymmetric x25519 key exchange
//! - **Framed channel**: encrypted, length-prefixed application frames
//!   plus raw-by-count file payloads over any `Connection`
//! - **Recovery**: client reconnect-once and server relisten policies
//!   after connection loss
//! - **Transport implementations**: TCP for production, an in-memory
//!   duplex pair for tests
//! - **Observable state**: per-field watch cells (connection state,
//!   messages, verification code, transfer progress, last error) consumed
//!   by CLI printers or UI subscribers

pub mod handshake;
pub mod memory;
pub mod service;
pub mod session;
pub mod state;
pub mod tcp;
