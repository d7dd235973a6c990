//! Pending stream requests, and the queue that holds them until a
//! suitable circuit shows up.

use crate::usage::{ExitTarget, TargetPort};
use crate::{Error, Result};

use futures::channel::oneshot;
use std::sync::{Arc, Mutex};
use velum_cell::relaycell::msg::EndReason;
use velum_proto::stream::DataStream;

use crate::directory::Relay;
use crate::events::InitEvent;

/// The overall status of an [`OpenStreamResponse`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum OpenStreamStatus {
    /// The stream was opened successfully.
    StreamOpened,
    /// No CONNECTED response arrived within the stream-open deadline.
    StreamTimeout,
    /// The remote end refused or closed the stream.
    StreamError,
    /// We couldn't get a circuit or connection to carry the stream.
    ConnectionFail,
}

/// The outcome of a request to open a stream.
#[derive(Debug)]
#[non_exhaustive]
pub enum OpenStreamResponse {
    /// The stream is open and ready for use.
    Opened(DataStream),
    /// No CONNECTED response arrived in time.
    Timeout,
    /// The remote end sent an END with the given reason.
    Error {
        /// The reason the remote gave.
        reason: EndReason,
        /// A human-readable version of the reason.
        msg: String,
    },
    /// We couldn't get a connection or circuit for the stream.
    ConnectionFail {
        /// What went wrong.
        msg: String,
    },
}

impl OpenStreamResponse {
    /// Return the status code for this response.
    pub fn status(&self) -> OpenStreamStatus {
        match self {
            OpenStreamResponse::Opened(_) => OpenStreamStatus::StreamOpened,
            OpenStreamResponse::Timeout => OpenStreamStatus::StreamTimeout,
            OpenStreamResponse::Error { .. } => OpenStreamStatus::StreamError,
            OpenStreamResponse::ConnectionFail { .. } => OpenStreamStatus::ConnectionFail,
        }
    }

    /// Return true if this response carries an open stream.
    pub fn is_opened(&self) -> bool {
        matches!(self, OpenStreamResponse::Opened(_))
    }

    /// Consume this response and return its stream, if it has one.
    pub fn into_stream(self) -> Option<DataStream> {
        match self {
            OpenStreamResponse::Opened(s) => Some(s),
            _ => None,
        }
    }
}

/// A request to open an exit stream, waiting in the queue for a circuit
/// that can carry it.
pub(crate) struct StreamExitRequest {
    /// The target the caller wants to reach.
    target: ExitTarget,
    /// The waiting caller's completion channel.  Taken (exactly once)
    /// when the request completes.
    tx: Mutex<Option<oneshot::Sender<Result<OpenStreamResponse>>>>,
}

impl StreamExitRequest {
    /// Create a new request and the receiver its caller waits on.
    pub(crate) fn new(target: ExitTarget) -> (Arc<Self>, oneshot::Receiver<Result<OpenStreamResponse>>) {
        let (tx, rx) = oneshot::channel();
        let req = Arc::new(StreamExitRequest {
            target,
            tx: Mutex::new(Some(tx)),
        });
        (req, rx)
    }

    /// Return the target of this request.
    pub(crate) fn target(&self) -> &ExitTarget {
        &self.target
    }

    /// Return true if this request has already completed.
    pub(crate) fn is_completed(&self) -> bool {
        self.tx.lock().expect("poisoned lock").is_none()
    }

    /// Mark this request complete, delivering `response` to the caller.
    ///
    /// Returns false if the request was already complete (the response
    /// is dropped in that case).
    fn complete(&self, response: Result<OpenStreamResponse>) -> bool {
        let Some(tx) = self.tx.lock().expect("poisoned lock").take() else {
            return false;
        };
        // The caller may have gone away; that's fine.
        let _ = tx.send(response);
        true
    }
}

/// The shared queue of pending exit requests.
#[derive(Default)]
pub(crate) struct RequestQueue {
    /// The requests, in arrival order.
    inner: Mutex<Vec<Arc<StreamExitRequest>>>,
}

impl RequestQueue {
    /// Add a request to the back of the queue.
    pub(crate) fn push(&self, req: Arc<StreamExitRequest>) {
        self.inner.lock().expect("poisoned lock").push(req);
    }

    /// Remove a request from the queue, if it is still there.
    pub(crate) fn remove(&self, req: &Arc<StreamExitRequest>) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .retain(|r| !Arc::ptr_eq(r, req));
    }

    /// Complete a request and remove it from the queue.
    pub(crate) fn complete(&self, req: &Arc<StreamExitRequest>, response: Result<OpenStreamResponse>) {
        self.remove(req);
        req.complete(response);
    }

    /// Return a snapshot of the pending requests, in arrival order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<StreamExitRequest>> {
        self.inner.lock().expect("poisoned lock").clone()
    }

    /// Return the number of pending requests.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("poisoned lock").len()
    }

    /// Return the distinct ports that pending requests are asking for.
    pub(crate) fn pending_ports(&self) -> Vec<TargetPort> {
        let mut ports: Vec<TargetPort> = self
            .inner
            .lock()
            .expect("poisoned lock")
            .iter()
            .map(|r| TargetPort::new(r.target().port()))
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Complete every pending request with an interruption error.
    /// Used at shutdown.
    pub(crate) fn interrupt_all(&self) {
        let reqs: Vec<_> = {
            let mut inner = self.inner.lock().expect("poisoned lock");
            std::mem::take(&mut *inner)
        };
        for req in reqs {
            req.complete(Err(Error::Interrupted));
        }
    }
}

/// A request for a directory stream: which directory cache to talk to,
/// and which initialization events to fire along the way.
#[derive(Clone, Debug)]
pub struct DirectoryStreamRequest {
    /// The directory cache to contact.
    relay: Relay,
    /// Event to fire once the one-hop circuit is built.
    request_event: Option<InitEvent>,
    /// Event to fire once the stream is open.
    loading_event: Option<InitEvent>,
}

impl DirectoryStreamRequest {
    /// Create a request to open a directory stream to `relay`.
    pub fn new(relay: Relay) -> Self {
        DirectoryStreamRequest {
            relay,
            request_event: None,
            loading_event: None,
        }
    }

    /// Set the initialization events to fire for this request.
    pub fn with_events(mut self, request: InitEvent, loading: InitEvent) -> Self {
        self.request_event = Some(request);
        self.loading_event = Some(loading);
        self
    }

    /// Return the directory cache this request targets.
    pub(crate) fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Return the event to fire when the circuit is built.
    pub(crate) fn request_event(&self) -> Option<InitEvent> {
        self.request_event
    }

    /// Return the event to fire when the stream opens.
    pub(crate) fn loading_event(&self) -> Option<InitEvent> {
        self.loading_event
    }
}
