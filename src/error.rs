//! Error taxonomy surfaced by the host loop and the tool gate.
//!
//! Every variant is a hard failure except [`Error::EnvelopeSyntax`] raised
//! while parsing a provider response, which the host loop may convert into a
//! diagnostic envelope when configured with `EnvelopeRecovery::Diagnostic`.

use std::fmt;

use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::token::TokenError;

/// Coarse classification of an [`Error`], stable for callers that only
/// need to decide between retrying, aborting, or surfacing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TrustViolation,
    PolicyViolation,
    CapabilityViolation,
    LimitExceeded,
    EnvelopeSyntax,
    TokenVerification,
    Provider,
    Cancelled,
    Script,
    ToolFailed,
    Internal,
}

/// Which consumption limit tripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitKind {
    ToolCalls(String),
    NetCalls,
    NetBytes,
    FsBytes,
    BudgetPerCall(String),
    BudgetPerRun(String),
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::ToolCalls(tool) => write!(f, "call limit for {tool}"),
            LimitKind::NetCalls => write!(f, "network call limit"),
            LimitKind::NetBytes => write!(f, "network byte limit"),
            LimitKind::FsBytes => write!(f, "filesystem byte limit"),
            LimitKind::BudgetPerCall(center) => write!(f, "per-call budget for '{center}'"),
            LimitKind::BudgetPerRun(center) => write!(f, "per-run budget for '{center}'"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("trust violation: '{tool}' requires the config context (current: {context})")]
    TrustViolation { tool: String, context: String },

    #[error("policy violation: '{name}' {reason}")]
    PolicyViolation { name: String, reason: String },

    #[error("capability violation: '{tool}' needs {resource}:{verb} on '{scope}'")]
    CapabilityViolation {
        tool: String,
        resource: String,
        verb: String,
        scope: String,
    },

    #[error("limit exceeded: {limit} (used {used}, requested {requested}, max {max})")]
    LimitExceeded {
        limit: LimitKind,
        used: u64,
        requested: u64,
        max: u64,
    },

    #[error("envelope syntax error: {0}")]
    EnvelopeSyntax(#[from] EnvelopeError),

    #[error("token verification failed: {0}")]
    TokenVerification(#[from] TokenError),

    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("script error at line {line}: {message}")]
    Script { line: usize, message: String },

    #[error("tool '{tool}' failed: {source}")]
    ToolFailed {
        tool: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TrustViolation { .. } => ErrorKind::TrustViolation,
            Error::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            Error::CapabilityViolation { .. } => ErrorKind::CapabilityViolation,
            Error::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            Error::EnvelopeSyntax(_) => ErrorKind::EnvelopeSyntax,
            Error::TokenVerification(_) => ErrorKind::TokenVerification,
            Error::Provider(_) => ErrorKind::Provider,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Script { .. } => ErrorKind::Script,
            Error::ToolFailed { .. } => ErrorKind::ToolFailed,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn policy(name: &str, reason: impl Into<String>) -> Self {
        Error::PolicyViolation {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::policy("tool.x", "is denied").kind(),
            ErrorKind::PolicyViolation
        );
        assert_eq!(
            Error::from(TokenError::Replayed).kind(),
            ErrorKind::TokenVerification
        );
        assert_eq!(
            Error::from(EnvelopeError::NotFound).kind(),
            ErrorKind::EnvelopeSyntax
        );
    }

    #[test]
    fn test_limit_display() {
        let err = Error::LimitExceeded {
            limit: LimitKind::ToolCalls("tool.x".to_string()),
            used: 2,
            requested: 1,
            max: 2,
        };
        let text = err.to_string();
        assert!(text.contains("call limit for tool.x"));
        assert!(text.contains("max 2"));
    }

    #[test]
    fn test_tool_failed_keeps_source() {
        let err = Error::ToolFailed {
            tool: "fs.read".to_string(),
            source: anyhow::anyhow!("no such file"),
        };
        assert!(err.to_string().contains("no such file"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
