// =============================================================================
// Shared types used across the Tidal trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side on the spot book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order pricing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Lifecycle state of an order.
///
/// `UnknownSubmit` parks an order whose placement raised before a response was
/// observed; it resolves back to `Accepted`, or to `Canceled` / `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    New,
    Accepted,
    Partial,
    Filled,
    CancelRequested,
    Canceled,
    Rejected,
    Expired,
    UnknownSubmit,
}

impl OrderState {
    /// Terminal states never mutate price/qty again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// States counted against the concurrent-order cap.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::New
                | Self::Accepted
                | Self::Partial
                | Self::CancelRequested
                | Self::UnknownSubmit
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Accepted => "ACCEPTED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::UnknownSubmit => "UNKNOWN_SUBMIT",
        };
        write!(f, "{s}")
    }
}

/// Result-code taxonomy shared by public operations and the process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitCode {
    Ok,
    InvalidArgs,
    RiskRejected,
    ExchangeRetryable,
    ExchangeFatal,
    RateLimited,
    ReconcileMismatch,
    KillSwitchActive,
    InternalError,
    ForbiddenInAgentMode,
}

impl ExitCode {
    /// Numeric process exit / result code.
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::InvalidArgs => 2,
            Self::RiskRejected => 3,
            Self::ExchangeRetryable => 5,
            Self::ExchangeFatal => 6,
            Self::RateLimited => 7,
            Self::ReconcileMismatch => 8,
            Self::KillSwitchActive => 9,
            Self::InternalError => 10,
            Self::ForbiddenInAgentMode => 11,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::InvalidArgs => "INVALID_ARGS",
            Self::RiskRejected => "RISK_REJECTED",
            Self::ExchangeRetryable => "EXCHANGE_RETRYABLE",
            Self::ExchangeFatal => "EXCHANGE_FATAL",
            Self::RateLimited => "RATE_LIMITED",
            Self::ReconcileMismatch => "RECONCILE_MISMATCH",
            Self::KillSwitchActive => "KILL_SWITCH_ACTIVE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ForbiddenInAgentMode => "FORBIDDEN_IN_AGENT_MODE",
        };
        write!(f, "{s}")
    }
}

/// Result envelope returned by every public operation. The engine speaks in
/// envelopes rather than raising; `ok` is true iff `code == Ok`.
#[derive(Debug, Clone, Serialize)]
pub struct OpResult<T> {
    pub ok: bool,
    pub code: ExitCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> OpResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            code: ExitCode::Ok,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(code: ExitCode, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            code,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Failure that still carries partial data (e.g. an order parked in
    /// UNKNOWN_SUBMIT).
    pub fn fail_with(code: ExitCode, error: impl Into<String>, data: T) -> Self {
        Self {
            ok: false,
            code,
            data: Some(data),
            error: Some(error.into()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_taxonomy_matches_contract() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::InvalidArgs.code(), 2);
        assert_eq!(ExitCode::RiskRejected.code(), 3);
        assert_eq!(ExitCode::ExchangeRetryable.code(), 5);
        assert_eq!(ExitCode::ExchangeFatal.code(), 6);
        assert_eq!(ExitCode::RateLimited.code(), 7);
        assert_eq!(ExitCode::ReconcileMismatch.code(), 8);
        assert_eq!(ExitCode::KillSwitchActive.code(), 9);
        assert_eq!(ExitCode::InternalError.code(), 10);
        assert_eq!(ExitCode::ForbiddenInAgentMode.code(), 11);
    }

    #[test]
    fn open_and_terminal_states_are_disjoint() {
        let all = [
            OrderState::New,
            OrderState::Accepted,
            OrderState::Partial,
            OrderState::Filled,
            OrderState::CancelRequested,
            OrderState::Canceled,
            OrderState::Rejected,
            OrderState::Expired,
            OrderState::UnknownSubmit,
        ];
        for state in all {
            assert!(
                !(state.is_open() && state.is_terminal()),
                "state {state} is both open and terminal"
            );
        }
        assert!(OrderState::UnknownSubmit.is_open());
        assert!(OrderState::CancelRequested.is_open());
        assert!(OrderState::Expired.is_terminal());
    }

    #[test]
    fn side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
        let s: Side = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(s, Side::Sell);
    }

    #[test]
    fn envelope_shapes() {
        let ok: OpResult<u32> = OpResult::ok(7);
        assert!(ok.ok);
        assert_eq!(ok.code, ExitCode::Ok);

        let fail: OpResult<u32> = OpResult::fail(ExitCode::RiskRejected, "blocked");
        assert!(!fail.ok);
        assert_eq!(fail.code.code(), 3);
        assert!(fail.data.is_none());
    }
}
