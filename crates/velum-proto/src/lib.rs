//! Async client implementation of the velum onion-routing protocol.
//!
//! # Overview
//!
//! This crate turns a framed relay connection (anything that can read and
//! write cells) into _channels_, _circuits_, and _streams_:
//!
//! * A [channel](channel::Channel) is a direct connection to a relay.  It
//!   multiplexes circuits, and runs a reactor task that routes every
//!   inbound cell to the circuit it belongs to.
//! * A [circuit](circuit::ClientCirc) is a multi-hop cryptographic tunnel
//!   built over a channel.  Each circuit runs its own reactor task that
//!   owns the stream table, the flow-control windows, and the per-hop
//!   encryption state.
//! * A [stream](stream::DataStream) is a logical byte channel multiplexed
//!   within a circuit, created with a BEGIN or BEGIN_DIR message.
//!
//! This crate does not choose paths, enforce exit policies, or decide when
//! circuits should exist: that policy lives in `velum-circmgr`.  It also
//! does not perform TLS or own sockets: the caller supplies the framed
//! transport.
//!
//! # Design
//!
//! Every channel and every circuit has a single reactor task that owns all
//! of its mutable protocol state; handles communicate with the reactor
//! over message channels.  That keeps the locking story trivial: nothing
//! ever holds a lock across a network operation, and flow-control stalls
//! suspend only the reactor's interest in the stalled stream.

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

pub mod channel;
pub mod circuit;
pub mod crypto;
pub mod stream;
mod util;

use std::sync::Arc;
use thiserror::Error;

use velum_cell::chancell::msg::DestroyReason;
use velum_cell::relaycell::msg::EndReason;

/// An error type for the velum protocol crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred while trying to encode or decode a cell.
    #[error("Unable to parse or encode cell")]
    CellErr(#[source] velum_cell::Error),
    /// We tried to use a channel that was already closed.
    #[error("Channel closed")]
    ChannelClosed,
    /// We tried to use a circuit that was already closed.
    #[error("Circuit closed")]
    CircuitClosed,
    /// The remote end destroyed our circuit.
    #[error("Circuit destroyed: {}", reason.human_str())]
    CircDestroy {
        /// The reason that the remote gave in its DESTROY message.
        reason: DestroyReason,
    },
    /// Protocol violation at the channel level.
    #[error("Channel protocol violation: {0}")]
    ChanProto(String),
    /// Protocol violation at the circuit level.
    #[error("Circuit protocol violation: {0}")]
    CircProto(String),
    /// Protocol violation at the stream level.
    #[error("Stream protocol violation: {0}")]
    StreamProto(String),
    /// The remote end refused our stream request, or closed the stream.
    #[error("Stream ended: {}", reason.human_str())]
    EndReceived {
        /// The reason the remote gave for ending the stream.
        reason: EndReason,
    },
    /// Data received on a cell that we never recognized as plaintext.
    #[error("Cell from an unrecognized hop, or cell was corrupted")]
    BadCellAuth,
    /// A cryptographic handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeProto(&'static str),
    /// Tried to address a hop that isn't on the circuit.
    #[error("No such hop on circuit")]
    NoSuchHop,
    /// Unable to allocate a circuit or stream ID: the space is full.
    #[error("Couldn't allocate unused identifier")]
    IdRangeFull,
    /// An IO error occurred on the underlying framed connection.
    #[error("IO error on connection: {0}")]
    ChanIoErr(Arc<std::io::Error>),
    /// An internal error of some kind that should never occur.
    #[error("Internal programming error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a cell encoding error.
    pub(crate) fn from_cell_enc(err: velum_cell::Error) -> Error {
        Error::CellErr(err)
    }
    /// Wrap a cell decoding error.
    pub(crate) fn from_cell_dec(err: velum_cell::Error) -> Error {
        Error::CellErr(err)
    }
}

/// Construct an [`enum@Error`] for a condition that indicates a bug in
/// this crate or its caller.
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::Error::Internal(format!($($arg)*))
    };
}
pub(crate) use internal;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
