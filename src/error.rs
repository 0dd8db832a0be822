use std::io;

use crate::hw::{ConnectorId, CrtcId, ObjectId, PlaneKind};

/// Errors surfaced by the commit engine and its device backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device rejected a nonblocking commit because one is still
    /// in flight. Transient; the caller retries after the next
    /// completion event.
    #[error("device busy, commit still in flight")]
    Busy,
    /// Unrecoverable device access error.
    #[error("{errmsg}: {source}")]
    Access {
        errmsg: &'static str,
        #[source]
        source: io::Error,
    },
    /// A structural invariant of the state model was violated by the
    /// caller. Surfaced as an error instead of aborting the process.
    #[error("state invariant violated: {0}")]
    Invariant(&'static str),
    #[error("connector {0:?} has no usable mode")]
    NoMode(ConnectorId),
    #[error("no free crtc for connector {0:?}")]
    NoCrtc(ConnectorId),
    #[error("no {kind:?} plane available on crtc {crtc:?}")]
    NoPlane { kind: PlaneKind, crtc: CrtcId },
    #[error("object {obj:?} has no property \"{name}\"")]
    UnknownProperty { obj: ObjectId, name: &'static str },
    #[error("unknown output")]
    UnknownOutput,
    #[error("unknown view")]
    UnknownView,
    /// A framebuffer key outlived the slot it pointed at.
    #[error("stale framebuffer key")]
    StaleFbKey,
    #[error("buffer {0} is not allocated on this device")]
    UnknownBuffer(u64),
}

impl Error {
    pub fn access(errmsg: &'static str, source: io::Error) -> Self {
        Error::Access { errmsg, source }
    }

    /// Whether a failed commit should be retried on the next cycle
    /// rather than treated as fatal for the output.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
