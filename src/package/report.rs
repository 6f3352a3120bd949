//! Structured JSON report of a session.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::catalog::TaskCategory;
use crate::session::{Artifact, Session, SessionStatus, TaskState, TaskStatus};
use crate::system_info::SystemInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub selected_tasks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub system_info: Option<SystemInfo>,
    pub summary: ReportSummary,
    pub errors: Vec<String>,
    /// In selection order
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Never started (only possible for a `failed` session)
    pub not_run: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: String,
    pub name: String,
    pub category: TaskCategory,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub artifacts: Vec<ArtifactReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEncoding {
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub name: String,
    pub size: usize,
    /// Hex SHA-256 of the raw bytes
    pub sha256: String,
    pub encoding: ContentEncoding,
    pub content: String,
}

impl DiagnosticReport {
    pub fn from_session(session: &Session) -> Self {
        let summary = ReportSummary {
            total: session.task_states.len(),
            succeeded: session.count(TaskStatus::Succeeded),
            failed: session.count(TaskStatus::Failed),
            cancelled: session.count(TaskStatus::Cancelled),
            not_run: session.count(TaskStatus::Pending) + session.count(TaskStatus::Running),
        };

        Self {
            session_id: session.id,
            status: session.status,
            selected_tasks: session.selected_task_ids.clone(),
            created_at: session.created_at,
            started_at: session.started_at,
            completed_at: session.completed_at,
            system_info: session.system_info.clone(),
            summary,
            errors: session.errors(),
            tasks: session.task_states.iter().map(TaskReport::from_state).collect(),
        }
    }
}

impl TaskReport {
    fn from_state(state: &TaskState) -> Self {
        Self {
            id: state.task_id.clone(),
            name: state.name.clone(),
            category: state.category,
            status: state.status,
            started_at: state.started_at,
            finished_at: state.finished_at,
            duration_ms: state.duration.map(|d| d.as_millis() as u64),
            error: state.error.clone(),
            artifacts: state
                .output
                .iter()
                .flat_map(|o| o.artifacts.iter())
                .map(ArtifactReport::from_artifact)
                .collect(),
        }
    }
}

impl ArtifactReport {
    fn from_artifact(artifact: &Artifact) -> Self {
        let (encoding, content) = match std::str::from_utf8(&artifact.data) {
            Ok(text) => (ContentEncoding::Utf8, text.to_string()),
            Err(_) => (
                ContentEncoding::Base64,
                base64::engine::general_purpose::STANDARD.encode(&artifact.data),
            ),
        };
        Self {
            name: artifact.name.clone(),
            size: artifact.data.len(),
            sha256: hex::encode(Sha256::digest(&artifact.data)),
            encoding,
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_binary_artifacts_are_base64() {
        let artifact = Artifact {
            name: "Mini.dmp".to_string(),
            data: Bytes::from_static(&[0x4d, 0x44, 0xff, 0xfe]),
        };
        let report = ArtifactReport::from_artifact(&artifact);
        assert_eq!(report.encoding, ContentEncoding::Base64);
        assert_eq!(report.content, "TUT//g==");
        assert_eq!(report.size, 4);
    }

    #[test]
    fn test_text_artifacts_are_inline() {
        let artifact = Artifact {
            name: "hosts.txt".to_string(),
            data: Bytes::from("abc"),
        };
        let report = ArtifactReport::from_artifact(&artifact);
        assert_eq!(report.encoding, ContentEncoding::Utf8);
        assert_eq!(report.content, "abc");
        assert_eq!(
            report.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
