// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::fmt::{self, Write as _};

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. The web layer
/// maps kinds to HTTP statuses in one place.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[error("Cancelled")] Cancelled,
    #[error("Unknown")] Unknown,
    #[error("Invalid argument")] InvalidArgument,
    #[error("Deadline exceeded")] DeadlineExceeded,
    #[error("Not found")] NotFound,
    #[error("Already exists")] AlreadyExists,
    #[error("Failed precondition")] FailedPrecondition,
    #[error("Aborted")] Aborted,
    #[error("Out of range")] OutOfRange,
    #[error("Unimplemented")] Unimplemented,
    #[error("Internal")] Internal,
    #[error("Unavailable")] Unavailable,
    #[error("Data loss")] DataLoss,
}

/// The project-wide error type: a kind, an optional message, and an optional
/// underlying cause.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new<S: Into<String>>(kind: ErrorKind, msg: S) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn wrap<E: Into<Box<dyn std::error::Error + Send + Sync>>>(kind: ErrorKind, e: E) -> Self {
        Error {
            kind,
            msg: None,
            source: Some(e.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Annotates the error with a higher-level message, keeping the original
    /// as the cause.
    pub fn context<S: Into<String>>(self, msg: S) -> Self {
        Error {
            kind: self.kind,
            msg: Some(msg.into()),
            source: Some(Box::new(self)),
        }
    }

    /// Returns the full cause chain, for logging as a single field.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut cur: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(self);
        while let Some(e) = cur {
            write!(&mut out, ": {e}").expect("string write is infallible");
            cur = e.source();
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.msg, &self.source) {
            (Some(m), _) => write!(f, "{}: {}", self.kind, m),
            (None, Some(s)) => write!(f, "{}: {}", self.kind, s),
            (None, None) => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match (&self.msg, &self.source) {
            // When there's no message of our own, the source is already
            // rendered by `Display`; don't repeat it in the chain.
            (None, _) => None,
            (Some(_), Some(s)) => Some(s.as_ref()),
            (Some(_), None) => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Returns early with an `Error` of the given kind and formatted message.
///
/// Example:
/// ```
/// use nightowl_base::bail_t;
/// let e = || -> Result<(), nightowl_base::Error> {
///     bail_t!(NotFound, "no such camera: {}", "C42");
/// }().unwrap_err();
/// assert_eq!(e.kind(), nightowl_base::ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no such camera: C42");
/// ```
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $($arg:tt)+) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, format!($($arg)+)))
    };
}

/// Constructs an `Error` of the given kind and formatted message.
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$t, format!($($arg)+))
    };
}
