use std::io;

/// Environment-level failures surfaced to callers.
///
/// Only conditions that originate outside the process (peer death, missing
/// services, socket errors, expired deadlines) are represented here. Caller
/// misuse — stale references, wrong-thread access, payload-size mismatches,
/// double removal — is a defect and panics at the point of detection instead
/// of being returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session (or the event loop behind a handle) is closed.
    #[error("session closed")]
    Closed,

    /// A synchronous call or handshake deadline expired.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// No server is offering the requested service.
    #[error("service unavailable")]
    Unavailable,

    /// Bindings are configured and the requested service is not bound.
    #[error("access to service not permitted")]
    NotPermitted,

    /// Transport-level failure (socket error, unreachable service directory,
    /// malformed frame from the peer).
    #[error("communication error")]
    Comm(#[from] io::Error),

    /// The peer accepted the frame but reported a failure handling it.
    #[error("peer fault: {0}")]
    Fault(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Comm(io::Error::from(errno))
    }
}
