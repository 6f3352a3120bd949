//! Request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{TaskCategory, TaskInfo};
use crate::package::OutputFormat;
use crate::session::{Session, SessionStatus, SessionSummary, TaskState, TaskStatus};
use crate::system_info::SystemInfo;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    /// Whether elevation-gated tasks can be selected
    pub is_elevated: bool,
    pub tasks: Vec<TaskInfo>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Task ids, in the order they should be admitted
    pub selected_tasks: Vec<String>,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    /// Defaults to the format chosen at creation
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: Uuid,
    pub status: SessionStatus,
}

#[derive(Debug, Serialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskStateResponse {
    pub id: String,
    pub name: String,
    pub category: TaskCategory,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub artifacts: Vec<ArtifactInfo>,
}

impl From<&TaskState> for TaskStateResponse {
    fn from(state: &TaskState) -> Self {
        Self {
            id: state.task_id.clone(),
            name: state.name.clone(),
            category: state.category,
            status: state.status,
            error: state.error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            duration_ms: state.duration.map(|d| d.as_millis() as u64),
            artifacts: state
                .output
                .iter()
                .flat_map(|o| o.artifacts.iter())
                .map(|a| ArtifactInfo {
                    name: a.name.clone(),
                    size: a.data.len(),
                })
                .collect(),
        }
    }
}

/// Full view of one session: the status report plus every task.
#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub selected_tasks: Vec<String>,
    pub system_info: Option<SystemInfo>,
    pub tasks: Vec<TaskStateResponse>,
}

impl From<&Session> for SessionDetailResponse {
    fn from(session: &Session) -> Self {
        Self {
            summary: SessionSummary::from(session),
            selected_tasks: session.selected_task_ids.clone(),
            system_info: session.system_info.clone(),
            tasks: session.task_states.iter().map(TaskStateResponse::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::finished_session;

    #[test]
    fn test_detail_flattens_summary() {
        let session = finished_session(
            OutputFormat::Zip,
            &[("Alpha", TaskStatus::Succeeded), ("Beta", TaskStatus::Failed)],
        );
        let value = serde_json::to_value(SessionDetailResponse::from(&session)).unwrap();

        assert_eq!(value["status"], "completed");
        assert_eq!(value["output_format"], "zip");
        assert_eq!(value["progress"], 1.0);
        assert_eq!(value["tasks"][0]["artifacts"][0]["name"], "alpha.txt");
        assert_eq!(value["tasks"][1]["error"], "Beta broke");
        assert_eq!(value["errors"][0], "Beta: Beta broke");
    }

    #[test]
    fn test_create_request_format_is_optional() {
        let request: CreateSessionRequest =
            serde_json::from_str(r#"{"selected_tasks": ["bios", "ipconfig"]}"#).unwrap();
        assert_eq!(request.selected_tasks, vec!["bios", "ipconfig"]);
        assert!(request.output_format.is_none());

        let request: CreateSessionRequest =
            serde_json::from_str(r#"{"selected_tasks": [], "output_format": "json"}"#).unwrap();
        assert_eq!(request.output_format, Some(OutputFormat::Json));
    }
}
