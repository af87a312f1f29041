use std::error::Error as StdError;

use thiserror::Error;

/// The kind of an [`Error`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Error)]
pub enum ErrorKind {
    /// Malformed DOS/PE headers, wrong signatures, truncated streams, or an
    /// RVA that falls outside any section.
    #[error("malformed image: {0}")]
    BadImage(&'static str),
    /// The image is well-formed but uses a construct this library does not
    /// handle, such as an unknown table tag in the Valid mask.
    #[error("unsupported image: {0}")]
    UnsupportedImage(&'static str),
    /// The CLI header data directory is empty.
    #[error("not a managed image")]
    NotAManagedImage,
    /// A metadata token cannot be represented in the requested coded index.
    #[error("cannot encode metadata token: {0}")]
    Encoding(&'static str),
    /// A mutation or rewrite would leave a reference without a valid target.
    #[error("broken metadata reference: {0}")]
    BrokenReference(&'static str),
    /// The strong-name key blob is unreadable or unsupported.
    #[error("invalid strong-name key: {0}")]
    Key(&'static str),
    /// A file system operation failed.
    #[error("i/o failure")]
    Io,
}

/// An error returned when parsing, mutating or saving an assembly image.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub(crate) kind: ErrorKind,
    #[source]
    pub(crate) source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new error from a known kind as well as an arbitrary payload.
    pub(crate) fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e)
    }
}

impl From<scroll::Error> for Error {
    fn from(e: scroll::Error) -> Self {
        Self::new(ErrorKind::BadImage("truncated or malformed record"), e)
    }
}

/// The result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
