//! Error and Result types for the response core.
//!
//! Modeled after the error taxonomy in `spec.md` §7: a reply-level error
//! is reported to the one affected client request, a connection-level
//! error cascades to every request on that connection, and allocation
//! pressure never corrupts correctness, only throughput.

use std::error::Error as StdError;
use std::fmt;

/// Result type used throughout the response core.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// An error encountered while ingesting, filtering, forwarding, or
/// sending a response.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

/// The taxonomy from spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Message or connection pool exhaustion. Non-fatal: retried on the
    /// next event-loop tick unless it happens while synthesizing a
    /// client error, in which case the client connection is closed.
    AllocFail,
    /// Malformed wire bytes from a server. Closes the server connection.
    ParseError,
    /// A reply arrived with no outstanding request on the server's
    /// out-queue. Closes the server connection.
    StrayReply,
    /// The server connection received FIN. Outstanding requests are
    /// errored out immediately, unlike client FIN.
    ServerEof,
    /// Arming write-interest on the event loop failed.
    ForwardFailure,
    /// A request failed upstream (timeout, shard unavailable, parse
    /// error) and must be reported to the client as a synthesized
    /// error reply.
    RequestError,
    /// A released message was referenced, or a peer link was found in
    /// an inconsistent state. Always a bug in this crate, never a wire
    /// condition; kept as a `Kind` so it can be asserted on in tests.
    InvariantViolation,
    /// The configuration file could not be read or parsed.
    ConfigError,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(kind: Kind, cause: C) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: Some(cause.into()),
            }),
        }
    }

    /// The classification from spec.md §7.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub fn is_alloc_fail(&self) -> bool {
        matches!(self.inner.kind, Kind::AllocFail)
    }

    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::ParseError | Kind::StrayReply | Kind::ServerEof
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::AllocFail => f.write_str("message or connection pool exhausted"),
            Kind::ParseError => f.write_str("malformed reply from server"),
            Kind::StrayReply => f.write_str("reply received with no outstanding request"),
            Kind::ServerEof => f.write_str("server closed the connection"),
            Kind::ForwardFailure => f.write_str("failed to arm client write interest"),
            Kind::RequestError => f.write_str("request failed upstream"),
            Kind::InvariantViolation => f.write_str("response core invariant violated"),
            Kind::ConfigError => f.write_str("invalid configuration"),
        }?;
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::with(Kind::ParseError, err)
    }
}
