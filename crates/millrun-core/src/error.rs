//! Domain error classification
//!
//! Errors crossing the sandbox or tool boundary are classified into domain
//! kinds, not Rust types. The kind alone decides every downstream effect:
//! run status, event disposition, session result and workflow control
//! fields.

use serde::{Deserialize, Serialize};

use crate::model::RunStatus;

/// Domain kind of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credential invalid or expired
    Auth,

    /// Access denied by the external system
    Permission,

    /// Transient I/O fault
    Network,

    /// External system throttled us
    RateLimit,

    /// User-script bug, including undeclared-topic publishes
    Logic,

    /// Engine bug
    Internal,

    /// Account balance exhausted
    Balance,

    /// Platform API key problem
    ApiKey,
}

impl ErrorKind {
    /// The run status a failure of this kind lands in
    pub fn run_status(self) -> RunStatus {
        match self {
            Self::Auth | Self::Permission => RunStatus::PausedApproval,
            Self::Network | Self::RateLimit => RunStatus::PausedTransient,
            Self::Logic => RunStatus::FailedLogic,
            // Balance and api_key have no paused flavor yet; they surface
            // as internal failures so the workflow stops prominently.
            Self::Internal | Self::Balance | Self::ApiKey => RunStatus::FailedInternal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Logic => "logic",
            Self::Internal => "internal",
            Self::Balance => "balance",
            Self::ApiKey => "api_key",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Self::Auth),
            "permission" => Ok(Self::Permission),
            "network" => Ok(Self::Network),
            "rate_limit" => Ok(Self::RateLimit),
            "logic" => Ok(Self::Logic),
            "internal" => Ok(Self::Internal),
            "balance" => Ok(Self::Balance),
            "api_key" => Ok(Self::ApiKey),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// A classified failure crossing the sandbox or tool boundary
///
/// Auth failures carry the offending service/account so the approval
/// surface can tell the user exactly what to reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub service_id: Option<String>,
    pub account_id: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            service_id: None,
            account_id: None,
        }
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// The run status this error maps to
    pub fn run_status(&self) -> RunStatus {
        self.kind.run_status()
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_to_status_mapping() {
        assert_eq!(ErrorKind::Auth.run_status(), RunStatus::PausedApproval);
        assert_eq!(ErrorKind::Permission.run_status(), RunStatus::PausedApproval);
        assert_eq!(ErrorKind::Network.run_status(), RunStatus::PausedTransient);
        assert_eq!(ErrorKind::RateLimit.run_status(), RunStatus::PausedTransient);
        assert_eq!(ErrorKind::Logic.run_status(), RunStatus::FailedLogic);
        assert_eq!(ErrorKind::Internal.run_status(), RunStatus::FailedInternal);
        assert_eq!(ErrorKind::Balance.run_status(), RunStatus::FailedInternal);
        assert_eq!(ErrorKind::ApiKey.run_status(), RunStatus::FailedInternal);
    }

    #[test]
    fn auth_context_carries_upward() {
        let err = ClassifiedError::auth("token expired")
            .with_service("gmail")
            .with_account("acct-7");
        assert_eq!(err.service_id.as_deref(), Some("gmail"));
        assert_eq!(err.account_id.as_deref(), Some("acct-7"));
        assert_eq!(err.to_string(), "[auth] token expired");
    }
}
