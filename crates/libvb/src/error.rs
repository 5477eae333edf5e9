use std::fmt;

use crate::event::EventKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the underlying virtualization subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemError {
    pub code: i32,
    pub domain: i32,
    pub message: String,
}

impl SubsystemError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            domain: 0,
            message: message.into(),
        }
    }
}

impl fmt::Display for SubsystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}, domain {})", self.message, self.code, self.domain)
    }
}

impl std::error::Error for SubsystemError {}

/// Errors from this crate.
///
/// `Query` is the only variant produced by the subsystem rejecting a request;
/// everything else is a local marshaling contract violation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The subsystem rejected a probe, fetch, set or (de)registration call.
    #[error("{op} failed for {resource}")]
    Query {
        op: &'static str,
        resource: String,
        #[source]
        source: SubsystemError,
    },

    /// A raw typed-parameter record could not be read.
    #[error("malformed typed parameter at index {index}: {reason}")]
    Decode { index: usize, reason: String },

    /// A value cannot be represented for the named parameter.
    #[error("invalid value for parameter {name:?}: {reason}")]
    InvalidValue { name: String, reason: String },

    /// A parameter name does not fit the fixed-size field.
    #[error("parameter name {name:?} is {len} bytes, at most {max} fit")]
    NameTooLong { name: String, len: usize, max: usize },

    /// Deregistration referenced an id that is not registered.
    #[error("no event registration with id {0}")]
    UnknownRegistration(i32),

    /// A handler cannot be invoked with the shape its event kind requires.
    #[error("handler contract violated for {kind} events: {reason}")]
    HandlerContract { kind: EventKind, reason: String },

    /// An event id outside the known range.
    #[error("invalid event id {0}")]
    UnknownEventKind(i32),
}

impl Error {
    pub(crate) fn query(
        op: &'static str,
        resource: impl Into<String>,
        source: SubsystemError,
    ) -> Self {
        Error::Query {
            op,
            resource: resource.into(),
            source,
        }
    }

    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True when the subsystem rejected the request; such failures may be
    /// environment dependent, unlike local contract violations.
    pub fn is_subsystem(&self) -> bool {
        matches!(self, Error::Query { .. })
    }
}
