use std::time::Duration;

use crate::ids::{CaseId, ParticipantId};
use crate::turns::Party;

/// Failures of the external Reasoner/Evaluator collaborators.
/// Classified so callers can decide between retrying and giving up.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("rejected request: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl CollaboratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::ServerError { .. } | Self::Timeout(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::ServerError { .. } => "server_error",
            Self::Rejected(_) => "rejected",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400..=499 => Self::Rejected(format!("status {status}: {body}")),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidResponse(format!("unexpected status {status}: {body}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(String),
    #[error("message already persisted at sequence {0}")]
    AlreadyPersisted(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("case directory unavailable: {0}")]
    Unavailable(String),
}

/// Why a connection was refused entry to a room.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("case not found: {0}")]
    NotFound(CaseId),
    #[error("{identity} is not a participant of case {case_id}")]
    Forbidden {
        case_id: CaseId,
        identity: ParticipantId,
    },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AdmissionError {
    /// Short reason suitable for a close frame.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "Case not found",
            Self::Forbidden { .. } => "Not authorized to join this case",
            Self::Directory(_) | Self::Ledger(_) => "Internal server error",
        }
    }
}

/// Rejected inbound payloads. Reported to the sender only.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("Invalid message format: {0}")]
    Validation(String),
}

/// Per-connection delivery failure. Never aborts a fan-out.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("send queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("out of turn: {attempted} may not act (current speaker: {current:?})")]
    OutOfTurn {
        attempted: Party,
        current: Option<Party>,
    },
    #[error("evaluation failed: {0}")]
    EvaluationFailed(#[from] CollaboratorError),
    #[error("{} must supply an argument", .0.label())]
    MissingInput(Party),
    #[error("stale submission: expected turn {expected}, session is at turn {actual}")]
    StaleTurn { expected: u32, actual: u32 },
    #[error("no adversarial session for case {0}")]
    UnknownSession(CaseId),
}

impl TurnError {
    /// Stable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfTurn { .. } => "OUT_OF_TURN",
            Self::EvaluationFailed(_) => "EVALUATION_FAILED",
            Self::MissingInput(_) => "INVALID_PARAMS",
            Self::StaleTurn { .. } => "STALE_TURN",
            Self::UnknownSession(_) => "NOT_FOUND",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CollaboratorError::Unavailable("tcp".into()).is_retryable());
        assert!(CollaboratorError::ServerError { status: 502, body: "".into() }.is_retryable());
        assert!(CollaboratorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CollaboratorError::Rejected("bad".into()).is_retryable());
        assert!(!CollaboratorError::InvalidResponse("nan".into()).is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            CollaboratorError::from_status(422, "bad".into()),
            CollaboratorError::Rejected(_)
        ));
        assert!(matches!(
            CollaboratorError::from_status(503, "down".into()),
            CollaboratorError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            CollaboratorError::from_status(302, "moved".into()),
            CollaboratorError::InvalidResponse(_)
        ));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(CollaboratorError::Timeout(Duration::from_secs(1)).error_kind(), "timeout");
        assert_eq!(CollaboratorError::Rejected("x".into()).error_kind(), "rejected");
    }

    #[test]
    fn admission_close_reasons() {
        let nf = AdmissionError::NotFound(CaseId::from_raw("c1"));
        assert_eq!(nf.close_reason(), "Case not found");
        let fb = AdmissionError::Forbidden {
            case_id: CaseId::from_raw("c1"),
            identity: ParticipantId::from_raw("0xbad"),
        };
        assert_eq!(fb.close_reason(), "Not authorized to join this case");
        assert!(fb.to_string().contains("0xbad"));
    }

    #[test]
    fn turn_error_codes() {
        let oot = TurnError::OutOfTurn {
            attempted: Party::B,
            current: Some(Party::A),
        };
        assert_eq!(oot.code(), "OUT_OF_TURN");
        let failed = TurnError::from(CollaboratorError::Timeout(Duration::from_secs(2)));
        assert_eq!(failed.code(), "EVALUATION_FAILED");
        assert!(failed.to_string().contains("timeout"));
    }
}
