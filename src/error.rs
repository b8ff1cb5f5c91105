use std::io;
use std::sync::Arc;

/// Errors surfaced by sessions, requests and responses.
///
/// End of stream is never an error: reads resolve with zero bytes, header
/// waits with `None`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("multiple read operations are not allowed")]
    MultipleReads,
    #[error("multiple write operations are not allowed")]
    MultipleWrites,
    #[error("multiple header awaitings are not allowed")]
    MultipleHeaderAwaits,
    #[error("multiple completion awaitings are not allowed")]
    MultipleCompletionAwaits,
    #[error("request is already in use")]
    RequestInUse,
    #[error("request is not active")]
    RequestNotActive,
    #[error("bad option {option}: {source}")]
    BadOption {
        option: &'static str,
        #[source]
        source: curl::Error,
    },
    #[error("bad url: {0}")]
    BadUrl(String),
    #[error("no response code available")]
    NoResponseCode,
    #[error("operation cancelled")]
    Cancelled,
    #[error("session closed")]
    SessionClosed,
    #[error("curl error: {0}")]
    Easy(#[from] curl::Error),
    #[error("curl multi error: {0}")]
    Multi(#[from] curl::MultiError),
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    #[error("malformed body: {0}")]
    Body(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The API was driven in a way the transfer state does not allow.
    Usage,
    /// libcurl reported a failure for a transfer or the multi handle.
    Engine,
    /// Socket or runtime failure on the reactor side.
    Reactor,
    /// The operation was aborted or its transfer torn down.
    Cancelled,
    /// The session driver is gone.
    Closed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MultipleReads
            | Error::MultipleWrites
            | Error::MultipleHeaderAwaits
            | Error::MultipleCompletionAwaits
            | Error::RequestInUse
            | Error::RequestNotActive
            | Error::BadOption { .. }
            | Error::BadUrl(_)
            | Error::NoResponseCode
            | Error::Body(_) => ErrorKind::Usage,
            Error::Easy(_) | Error::Multi(_) => ErrorKind::Engine,
            Error::Io(_) => ErrorKind::Reactor,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::SessionClosed => ErrorKind::Closed,
        }
    }

    /// True for errors caused by an explicit abort or a torn down transfer.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::MultipleReads.kind(), ErrorKind::Usage);
        assert_eq!(Error::BadUrl(String::new()).kind(), ErrorKind::Usage);
        assert_eq!(Error::Easy(curl::Error::new(7)).kind(), ErrorKind::Engine);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::SessionClosed.kind(), ErrorKind::Closed);
        let io: Error = io::Error::other("boom").into();
        assert_eq!(io.kind(), ErrorKind::Reactor);
    }

    #[test]
    fn test_engine_message_preserved() {
        let err = Error::from(curl::Error::new(6));
        let text = err.to_string();
        assert!(text.starts_with("curl error: "), "{text}");
        assert!(text.len() > "curl error: ".len());
    }
}
