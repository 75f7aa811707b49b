//! Error type used by the method handlers.
//!
//! Handlers return a `DavResult`; the dispatcher in `davhandler.rs` turns
//! the error into an HTTP response in one place. Errors that carry a DAV
//! pre-/postcondition are rendered as an `<D:error>` XML body.
use std::error::Error;
use std::io;

use http::StatusCode;

use crate::fs::FsError;

#[derive(Debug)]
pub(crate) enum DavError {
    XmlReadError,
    XmlParseError,
    InvalidPath,
    IllegalPath,
    ForbiddenPath,
    UnknownDavMethod,
    Status(StatusCode),
    StatusClose(StatusCode),
    Condition(DavCondition),
    FsError(FsError),
    IoError(io::Error),
    XmlReaderError(xml::reader::Error),
    XmlWriterError(xml::writer::Error),
}

/// A DAV pre- or postcondition, like `{DAV:}lock-token-submitted`.
///
/// `href` is the URL (with prefix) of the resource that caused the
/// condition, if any.
#[derive(Debug)]
pub(crate) struct DavCondition {
    pub status:  StatusCode,
    pub element: &'static str,
    pub href:    Option<String>,
}

impl DavError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::IllegalPath => StatusCode::BAD_GATEWAY,
            // paths that escape the share root are a client error.
            DavError::ForbiddenPath => StatusCode::BAD_REQUEST,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::Status(s) => *s,
            DavError::StatusClose(s) => *s,
            DavError::Condition(c) => c.status,
            DavError::FsError(e) => fserror_to_status(*e),
            DavError::IoError(e) => ioerror_to_status(e),
            DavError::XmlReaderError(_) => StatusCode::BAD_REQUEST,
            DavError::XmlWriterError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // must we close the connection after sending this error?
    pub(crate) fn must_close(&self) -> bool {
        matches!(self, DavError::StatusClose(_))
    }
}

pub(crate) fn fserror_to_status(e: FsError) -> StatusCode {
    match e {
        FsError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        FsError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
        FsError::Exists => StatusCode::METHOD_NOT_ALLOWED,
        FsError::NotFound => StatusCode::NOT_FOUND,
        FsError::Forbidden => StatusCode::FORBIDDEN,
        FsError::Conflict => StatusCode::CONFLICT,
        FsError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
    }
}

fn ioerror_to_status(ioerror: &io::Error) -> StatusCode {
    match ioerror.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        io::ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        io::ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::IoError(e) => Some(e),
            DavError::XmlReaderError(e) => Some(e),
            DavError::XmlWriterError(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for DavError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DavError::XmlReaderError(_) => write!(f, "XML parse error"),
            DavError::XmlWriterError(_) => write!(f, "XML generate error"),
            DavError::IoError(_) => write!(f, "I/O error"),
            DavError::Condition(c) => write!(f, "{} ({})", c.status, c.element),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<StatusCode> for DavError {
    fn from(s: StatusCode) -> Self {
        DavError::Status(s)
    }
}

impl From<DavCondition> for DavError {
    fn from(c: DavCondition) -> Self {
        DavError::Condition(c)
    }
}

impl From<FsError> for DavError {
    fn from(e: FsError) -> Self {
        DavError::FsError(e)
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<xml::reader::Error> for DavError {
    fn from(e: xml::reader::Error) -> Self {
        DavError::XmlReaderError(e)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        DavError::XmlWriterError(e)
    }
}

impl From<DavError> for io::Error {
    fn from(e: DavError) -> Self {
        match e {
            DavError::IoError(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
