//! Declare an error type for velum-circmgr.

use thiserror::Error;

/// An error returned while looking up or building a circuit, or while
/// attaching a stream to one.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// No suitable relays for a request.
    #[error("Can't build path for circuit: {0}")]
    NoPath(String),

    /// No suitable exit relay for a request.
    #[error("Can't find exit for circuit: {0}")]
    NoExit(String),

    /// We couldn't get a connection to the chosen entry relay.
    #[error("Couldn't reach entry relay {peer}")]
    ChanFailed {
        /// Which relay we were trying to connect to.
        peer: String,
        /// What went wrong.
        #[source]
        cause: velum_proto::Error,
    },

    /// A circuit build took too long to finish.
    #[error("Circuit took too long to build")]
    CircTimeout,

    /// Protocol issue while building a circuit or opening a stream.
    #[error("Problem with circuit: {0}")]
    Protocol(#[from] velum_proto::Error),

    /// The caller's request was cancelled, or the manager shut down
    /// while the request was waiting.
    #[error("Request interrupted")]
    Interrupted,

    /// Tried to use a circuit in a state that doesn't allow it.
    #[error("Circuit not usable: {0}")]
    UnusableCircuit(&'static str),

    /// The circuit manager itself went away while we were using it.
    #[error("Circuit manager is shutting down")]
    ManagerClosed,
}

/// A Result type as returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;
