//! Coding and decoding for the cell types that make up the onion-routing
//! protocol.
//!
//! # Overview
//!
//! Onion routers and clients talk to one another via a connection-oriented
//! protocol built on fixed-size (and a few variable-size) frames called
//! _cells_.  This crate implements those cells: the outer "channel cell"
//! layer that is visible to a relay connection, and the inner "relay cell"
//! layer that is onion-encrypted and addressed to a single hop of a
//! circuit.
//!
//! This crate is a building block: it does no I/O and holds no keys.  The
//! channel and circuit machinery that actually moves these cells lives in
//! `velum-proto`; the policy that decides what to build lives in
//! `velum-circmgr`.
//!
//! # Design
//!
//! Each cell type is a plain struct with an `encode_onto`/`take_from` pair,
//! collected into `AnyChanMsg` and `AnyRelayMsg` enums.  The only component
//! that is allowed to parse or emit the inner relay structure (command,
//! recognized, stream id, digest, length) is [`relaycell::AnyRelayMsgOuter`].

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

pub mod chancell;
mod err;
pub mod reader;
pub mod relaycell;
pub mod writer;

pub use err::{BytesError, Error};

/// An error type for decoding failures in this crate.
pub type BytesResult<T> = std::result::Result<T, BytesError>;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
