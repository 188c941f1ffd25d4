//! Outbound progress events

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a forwarded worker line came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    StdoutInfo,
    StderrInfo,
    StderrError,
}

impl LineKind {
    pub fn is_error(&self) -> bool {
        matches!(self, LineKind::StderrError)
    }
}

/// One unit of progress for a single caller.
///
/// Serialized as `{"status": ..., ...}`; `Success` and `Failure` are terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    Starting {
        message: String,
    },
    Processing {
        log: String,
        source: LineKind,
        attempt: u32,
    },
    Retrying {
        message: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    Success {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<Uuid>,
    },
    Failure {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<Uuid>,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Success { .. } | ProgressEvent::Failure { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            ProgressEvent::Starting { .. } => "starting",
            ProgressEvent::Processing { .. } => "processing",
            ProgressEvent::Retrying { .. } => "retrying",
            ProgressEvent::Success { .. } => "success",
            ProgressEvent::Failure { .. } => "failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = ProgressEvent::Processing {
            log: "page 1/3".into(),
            source: LineKind::StdoutInfo,
            attempt: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["log"], "page 1/3");
        assert_eq!(json["source"], "stdout_info");

        let done = ProgressEvent::Success {
            message: "done".into(),
            document_id: None,
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("documentId").is_none());
        assert!(done.is_terminal());

        let retry = ProgressEvent::Retrying {
            message: "attempt 1/3 failed".into(),
            attempt: 1,
            max_attempts: 3,
            delay_ms: 1000,
        };
        let json = serde_json::to_value(&retry).unwrap();
        assert_eq!(json["status"], "retrying");
        assert_eq!(json["maxAttempts"], 3);
        assert_eq!(json["delayMs"], 1000);

        let id = Uuid::nil();
        let failed = ProgressEvent::Failure {
            message: "boom".into(),
            document_id: Some(id),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["documentId"], id.to_string());
        let back: ProgressEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, failed);
    }
}
