use estimate_ledger_client::{ClientError, FailureKind};
use serde::Serialize;

pub const NETWORK_FAILURE_MESSAGE: &str = "Failed to reach the server";

/// Who triggered the request that failed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    UserAction,
    Background,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Error,
    Warning,
}

/// User-facing message for a failed action.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub kind: FailureKind,
    pub message: String,
}

/// Log a failure and, for user-initiated actions, produce the notice to show.
///
/// Background failures are logged at warn and stay silent.
pub fn report(origin: Origin, err: &ClientError) -> Option<Notice> {
    let kind = err.kind();
    match origin {
        Origin::Background => {
            tracing::warn!(kind = ?kind, error = %err, "background request failed");
            None
        }
        Origin::UserAction => {
            tracing::error!(kind = ?kind, error = %err, "request failed");
            let (level, message) = match err {
                ClientError::Application(message) => (NoticeLevel::Error, message.clone()),
                ClientError::Validation(message) => (NoticeLevel::Warning, message.clone()),
                ClientError::Transport(_)
                | ClientError::Status { .. }
                | ClientError::Decode(_) => {
                    (NoticeLevel::Error, NETWORK_FAILURE_MESSAGE.to_string())
                }
            };
            Some(Notice { level, kind, message })
        }
    }
}
