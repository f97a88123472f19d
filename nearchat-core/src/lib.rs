//! # nearchat-core
//!
//! Shared building blocks for the nearchat secure pairing protocol.
//!
//! This crate provides the foundational types and utilities used by
//! [`nearchat-engine`] and the binary crate (`nearchat-cli`).
//!
//! ## Responsibilities
//!
//! - **Crypto primitives** — ephemeral x25519 keypairs, session secret
//!   derivation, AES-CBC blob encryption with per-call IVs, and the 5-digit
//!   human verification code.
//!
//! - **Wire model** — length-prefixed blob framing over boundary-agnostic
//!   byte streams, and the plaintext application frame model (chat text,
//!   file headers, verification control).
//!
//! - **Transport seam** — `Connection` / `Listener` / `Connector` traits so
//!   the engine can run over TCP, an in-memory pipe, or any other duplex
//!   byte stream.
//!
//! - **Error taxonomy** — the protocol-level failure kinds the engine maps
//!   onto session teardown and recovery decisions.

pub mod crypto;
pub mod error;
pub mod transport;
pub mod wire;
