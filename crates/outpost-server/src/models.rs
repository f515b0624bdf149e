//! API request and response bodies

use serde::{Deserialize, Serialize};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Query of `/api/client/{agent_name}/exec`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecParams {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub full: Option<String>,
    /// Literal stdin; the request body is used when absent
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecParams {
    /// stdout is on unless `stdout=0`
    pub fn want_stdout(&self) -> bool {
        self.stdout.as_deref().map_or(true, |v| flag(v))
    }

    /// stderr is off unless `stderr=1`
    pub fn want_stderr(&self) -> bool {
        self.stderr.as_deref().is_some_and(flag)
    }

    pub fn want_full(&self) -> bool {
        self.full.as_deref().is_some_and(flag)
    }
}

/// Query naming an agent instance
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceParams {
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Form of `POST /api/proxy/{host}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterServiceForm {
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub replace_host: String,
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes" | "on")
}
