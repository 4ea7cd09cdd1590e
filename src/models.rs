use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder used when a delivery carries no job id.
pub const UNKNOWN_JOB_ID: &str = "unknown";

// ---- inbound webhook payload ----
// Only the fields the dispatcher reads; everything else GitHub sends is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub repository: Option<Repository>,
    #[serde(default)]
    pub workflow_job: Option<WorkflowJob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    /// API URL of the repository, e.g. `https://api.github.com/repos/o/r`.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowJob {
    #[serde(default)]
    pub id: Option<Value>,
}

impl WebhookPayload {
    pub fn is_queued(&self) -> bool {
        self.action.as_deref() == Some("queued")
    }

    pub fn repository_url(&self) -> Option<&str> {
        self.repository
            .as_ref()
            .and_then(|r| r.url.as_deref())
            .filter(|u| !u.trim().is_empty())
    }

    pub fn job_id(&self) -> JobId {
        self.workflow_job
            .as_ref()
            .and_then(|j| j.id.as_ref())
            .map(JobId::from_value)
            .unwrap_or_else(JobId::unknown)
    }
}

/// Workflow job identifier as echoed back to the caller.
///
/// GitHub sends an integer; anything else is kept as text so it can still name
/// the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobId {
    Number(u64),
    Text(String),
}

impl JobId {
    pub fn unknown() -> Self {
        JobId::Text(UNKNOWN_JOB_ID.to_string())
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(id) => JobId::Number(id),
                None => JobId::Text(n.to_string()),
            },
            Value::String(s) if !s.is_empty() => JobId::Text(s.clone()),
            _ => JobId::unknown(),
        }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobId::Number(id) => write!(f, "{}", id),
            JobId::Text(s) => write!(f, "{}", s),
        }
    }
}

// ---- GitHub JIT runner registration ----
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitConfigRequest {
    pub name: String,
    pub runner_group_id: u64,
    pub labels: Vec<String>,
    pub work_directory: String,
}

#[derive(Debug, Deserialize)]
pub struct JitConfigResponse {
    pub encoded_jit_config: String,
    #[serde(default)]
    pub runner: Option<RegisteredRunner>,
}

#[derive(Debug, Deserialize)]
pub struct RegisteredRunner {
    pub id: u64,
}

// ---- responses ----
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DispatchOutcome {
    Ignored,
    Provisioned { job_id: JobId },
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}
