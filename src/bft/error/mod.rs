use std::error;
use std::fmt;
use std::result;

/// Wrapper Result for the Rust standard library Result type.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

/// The different kinds of errors produced by this crate.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// The request pool rejected a submission because it is at capacity.
    RequestPoolFull,
    /// The request pool rejected a submission because an identical
    /// request is already pending.
    RequestAlreadyExists,
    /// The request pool has been closed.
    RequestPoolClosed,
    /// A write ahead log operation failed.
    WriteAheadLog,
    /// Encoding or decoding of a persisted record or message failed.
    Serialization,
    /// Replaying the write ahead log produced an inconsistent state.
    Recovery,
    /// A request, proposal or signature failed verification.
    Verification,
    /// An internal channel was disconnected or at capacity.
    CommunicationChannel,
    /// A crypto hash operation received invalid input.
    CryptoHash,
}

impl Error {
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(f, "{:?}: {}", k, e),
        }
    }
}

impl error::Error for Error {}

/// Extension trait to attach an `ErrorKind` to a foreign result.
pub trait ResultWrappedExt<T> {
    fn wrapped(self, kind: ErrorKind) -> Result<T>;
}

impl<T, E> ResultWrappedExt<T> for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    fn wrapped(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }
}
