//! Internal error helpers shared by the reactor implementations.

use crate::Error;

/// An error type returned by a reactor's `run_once`: either a real error,
/// or an orderly shutdown request.
#[derive(Debug)]
pub(crate) enum ReactorError {
    /// The reactor should shut down with an aborted status.
    Err(Error),
    /// The reactor should shut down without an error, since all is well.
    Shutdown,
}

impl From<Error> for ReactorError {
    fn from(e: Error) -> ReactorError {
        ReactorError::Err(e)
    }
}
