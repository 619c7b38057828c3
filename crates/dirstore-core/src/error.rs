//! Error Types
//!
//! This module provides the closed set of error kinds raised by the directory
//! storage layer, and their mapping to protocol result codes.
//!
//! # Example
//!
//! ```
//! use dirstore_core::{DirectoryError, ResultCode};
//!
//! let err = DirectoryError::AlreadyExists {
//!     dn: "cn=alice,dc=example".to_string(),
//! };
//! assert_eq!(err.result_code(), ResultCode::EntryAlreadyExists);
//! assert!(err.is_classified());
//! ```

use serde::Serialize;
use thiserror::Error;

/// Boxed error source carried by unclassified failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error raised by the directory storage layer.
///
/// Every variant except [`DirectoryError::Internal`] is *classified*: it is
/// constructed by the repository or the mapper, travels unchanged through the
/// transaction boundary, and maps to a specific protocol result code.
/// `Internal` covers everything else and is wrapped with context at each
/// boundary it crosses.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The distinguished name could not be parsed.
    #[error("invalid DN syntax: {message}")]
    InvalidDn { message: String },

    /// An entry with the same normalized DN already exists.
    #[error("entry already exists: {dn}")]
    AlreadyExists { dn: String },

    /// The target entry does not exist.
    ///
    /// `matched_dn` names the deepest existing ancestor, when one was found.
    #[error("no such object: {dn}")]
    NoSuchObject {
        dn: String,
        matched_dn: Option<String>,
    },

    /// The authorization check rejected the operation.
    #[error("insufficient access rights to {operation} {dn}")]
    InsufficientAccess { operation: String, dn: String },

    /// A structural attribute is missing or the entry shape is invalid.
    #[error("object class violation: {message}")]
    ObjectClassViolation { message: String },

    /// An attribute value does not satisfy its matching rule.
    #[error("invalid syntax for attribute '{attribute}': {message}")]
    InvalidAttributeSyntax { attribute: String, message: String },

    /// Rename or delete was attempted on an entry that still has children.
    #[error("operation not allowed on non-leaf entry: {dn}")]
    NotAllowedOnNonLeaf { dn: String },

    /// Unclassified failure.
    #[error("{context}")]
    Internal {
        context: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl DirectoryError {
    /// Create an unclassified error without an underlying cause.
    pub fn internal(context: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            source: None,
        }
    }

    /// Create an unclassified error wrapping its cause.
    pub fn internal_with_source(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Internal {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    /// Shorthand for a lookup miss without a matched-DN hint.
    pub fn no_such_object(dn: impl Into<String>) -> Self {
        Self::NoSuchObject {
            dn: dn.into(),
            matched_dn: None,
        }
    }

    /// Returns `true` for every kind except [`DirectoryError::Internal`].
    #[must_use]
    pub fn is_classified(&self) -> bool {
        !matches!(self, Self::Internal { .. })
    }

    /// Check if this error reports a missing entry.
    #[must_use]
    pub fn is_no_such_object(&self) -> bool {
        matches!(self, Self::NoSuchObject { .. })
    }

    /// Check if this error reports a DN collision.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Map the error kind to its protocol result code.
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::InvalidDn { .. } => ResultCode::InvalidDnSyntax,
            Self::AlreadyExists { .. } => ResultCode::EntryAlreadyExists,
            Self::NoSuchObject { .. } => ResultCode::NoSuchObject,
            Self::InsufficientAccess { .. } => ResultCode::InsufficientAccessRights,
            Self::ObjectClassViolation { .. } => ResultCode::ObjectClassViolation,
            Self::InvalidAttributeSyntax { .. } => ResultCode::InvalidAttributeSyntax,
            Self::NotAllowedOnNonLeaf { .. } => ResultCode::NotAllowedOnNonLeaf,
            Self::Internal { .. } => ResultCode::ProtocolError,
        }
    }

    /// The matched-DN hint, if the error carries one.
    #[must_use]
    pub fn matched_dn(&self) -> Option<&str> {
        match self {
            Self::NoSuchObject { matched_dn, .. } => matched_dn.as_deref(),
            _ => None,
        }
    }

    /// Render the error followed by every source in its causal chain.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// Type alias for Results using `DirectoryError`.
pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Adds boundary context to unclassified failures.
pub trait ResultExt<T> {
    /// Wrap an unclassified error with `context`; classified errors pass
    /// through untouched so the handler still sees their kind.
    fn context<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| {
            if err.is_classified() {
                err
            } else {
                DirectoryError::internal_with_source(context(), err)
            }
        })
    }
}

/// Directory protocol result codes (RFC 4511, section 4.1.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultCode {
    Success,
    ProtocolError,
    InvalidAttributeSyntax,
    NoSuchObject,
    InvalidDnSyntax,
    InsufficientAccessRights,
    NotAllowedOnNonLeaf,
    EntryAlreadyExists,
    ObjectClassViolation,
}

impl ResultCode {
    /// Numeric code sent on the wire.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::ProtocolError => 2,
            Self::InvalidAttributeSyntax => 21,
            Self::NoSuchObject => 32,
            Self::InvalidDnSyntax => 34,
            Self::InsufficientAccessRights => 50,
            Self::ObjectClassViolation => 65,
            Self::NotAllowedOnNonLeaf => 66,
            Self::EntryAlreadyExists => 68,
        }
    }
}

/// What the protocol layer needs to write a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub result_code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_dn: Option<String>,
}

impl OperationOutcome {
    #[must_use]
    pub fn success() -> Self {
        Self {
            result_code: ResultCode::Success,
            diagnostic_message: None,
            matched_dn: None,
        }
    }

    /// Build the outcome for an operation result.
    ///
    /// Unclassified errors never leak their message to the client.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::success(),
            Err(err) => Self::from(err),
        }
    }
}

impl From<&DirectoryError> for OperationOutcome {
    fn from(err: &DirectoryError) -> Self {
        let diagnostic_message = err.is_classified().then(|| err.to_string());
        Self {
            result_code: err.result_code(),
            diagnostic_message,
            matched_dn: err.matched_dn().map(str::to_string),
        }
    }
}
