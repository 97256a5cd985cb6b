//! Session events fanned out to subscribers.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::completion::CompletionAction;
use crate::core::types::{ContextKey, FileChangeType, SessionStatus, TaskStatus};
use crate::io::pr::PrOutcome;
use crate::pipeline::parser::TestSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub context: ContextKey,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    Output {
        data: String,
    },
    Progress {
        value: u8,
        applied: bool,
    },
    FileChange {
        path: String,
        change: FileChangeType,
    },
    TestResult(TestSummary),
    Started {
        pid: Option<u32>,
        workspace: Option<PathBuf>,
    },
    Exit {
        code: Option<i32>,
        status: SessionStatus,
    },
    Completion {
        task_status: TaskStatus,
        action: CompletionAction,
        #[serde(skip_serializing_if = "Option::is_none")]
        pull_request: Option<PrOutcome>,
    },
    CompletionError {
        message: String,
    },
}

impl EventKind {
    /// Kebab-case name used as the SSE event type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Output { .. } => "output",
            Self::Progress { .. } => "progress",
            Self::FileChange { .. } => "file-change",
            Self::TestResult(_) => "test-result",
            Self::Started { .. } => "started",
            Self::Exit { .. } => "exit",
            Self::Completion { .. } => "completion",
            Self::CompletionError { .. } => "completion-error",
        }
    }
}

/// Broadcast hub; lagging subscribers lose events instead of blocking sessions.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, context: &ContextKey, session_id: &str, kind: EventKind) {
        trace!(event = kind.name(), %context, "publish");
        // No subscribers is fine.
        let _ = self.tx.send(SessionEvent {
            context: context.clone(),
            session_id: session_id.to_string(),
            kind,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kebab_case_type() {
        let event = SessionEvent {
            context: ContextKey::task("t1"),
            session_id: "s1".to_string(),
            kind: EventKind::CompletionError {
                message: "boom".to_string(),
            },
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "completion-error");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["message"], "boom");
        assert_eq!(json["context"]["context_id"], "t1");
    }

    #[test]
    fn lagging_subscriber_skips_ahead() {
        let hub = EventHub::new(2);
        let mut rx = hub.subscribe();
        let key = ContextKey::task("t1");
        for value in [10, 20, 30] {
            hub.publish(&key, "s1", EventKind::Progress { value, applied: true });
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        let next = rx.try_recv().expect("after lag");
        assert_eq!(next.kind, EventKind::Progress { value: 20, applied: true });
    }
}
