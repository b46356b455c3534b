use serde::{Deserialize, Serialize};

/// Label carrying the id of the ant that started a container.
pub const ANT_ID: &str = "AntID";
/// Label carrying the id of the user that owns the request.
pub const USER_ID: &str = "UserID";
pub const ORGANIZATION_ID: &str = "OrganizationID";
/// Label carrying the task request id.
pub const REQUEST_ID: &str = "RequestID";

/// Execution backend requested by a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMethod {
    Shell,
    Docker,
    Kubernetes,
    HttpGet,
    HttpPostForm,
    HttpPostJson,
    HttpPutForm,
    HttpPutJson,
    HttpDelete,
}

impl TaskMethod {
    pub const ALL: [TaskMethod; 9] = [
        TaskMethod::Shell,
        TaskMethod::Docker,
        TaskMethod::Kubernetes,
        TaskMethod::HttpGet,
        TaskMethod::HttpPostForm,
        TaskMethod::HttpPostJson,
        TaskMethod::HttpPutForm,
        TaskMethod::HttpPutJson,
        TaskMethod::HttpDelete,
    ];

    /// Methods served by the HTTP adapter. `HTTP_PUT_FORM` is not among them.
    pub fn is_http(&self) -> bool {
        matches!(
            self,
            TaskMethod::HttpGet
                | TaskMethod::HttpPostForm
                | TaskMethod::HttpPostJson
                | TaskMethod::HttpPutJson
                | TaskMethod::HttpDelete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMethod::Shell => "SHELL",
            TaskMethod::Docker => "DOCKER",
            TaskMethod::Kubernetes => "KUBERNETES",
            TaskMethod::HttpGet => "HTTP_GET",
            TaskMethod::HttpPostForm => "HTTP_POST_FORM",
            TaskMethod::HttpPostJson => "HTTP_POST_JSON",
            TaskMethod::HttpPutForm => "HTTP_PUT_FORM",
            TaskMethod::HttpPutJson => "HTTP_PUT_JSON",
            TaskMethod::HttpDelete => "HTTP_DELETE",
        }
    }
}

impl std::fmt::Display for TaskMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskMethod {
    type Err = crate::error::AntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::error::AntError::UnsupportedMethod(s.to_string()))
    }
}

/// State of a task request as reported back to the queen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestState {
    Pending,
    Ready,
    Started,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Unknown,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Pending => "PENDING",
            RequestState::Ready => "READY",
            RequestState::Started => "STARTED",
            RequestState::Executing => "EXECUTING",
            RequestState::Completed => "COMPLETED",
            RequestState::Failed => "FAILED",
            RequestState::Cancelled => "CANCELLED",
            RequestState::Paused => "PAUSED",
            RequestState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Image pull policy shared by the Docker and Kubernetes adapters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

impl PullPolicy {
    /// Value of the Kubernetes `imagePullPolicy` field.
    pub fn kubernetes(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::Never => "Never",
            PullPolicy::IfNotPresent => "IfNotPresent",
        }
    }
}

const DNS1123_MAX_LEN: usize = 63;

/// Turns an arbitrary name into a valid DNS-1123 label.
pub fn make_dns1123_compatible(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .replace('_', "-")
        .chars()
        .filter(|c| *c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    let trimmed = cleaned.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let mut out: String = trimmed.chars().take(DNS1123_MAX_LEN).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_serde_and_parse() {
        assert_eq!(
            serde_json::to_string(&TaskMethod::HttpPostJson).unwrap(),
            "\"HTTP_POST_JSON\""
        );
        assert_eq!("kubernetes".parse::<TaskMethod>().unwrap(), TaskMethod::Kubernetes);
        assert!("FORK_JOB".parse::<TaskMethod>().is_err());
    }

    #[test]
    fn test_put_form_is_not_http() {
        assert!(TaskMethod::HttpGet.is_http());
        assert!(TaskMethod::HttpDelete.is_http());
        assert!(!TaskMethod::HttpPutForm.is_http());
        assert!(!TaskMethod::Shell.is_http());
    }

    #[test]
    fn test_request_state_terminal() {
        assert!(RequestState::Cancelled.is_terminal());
        assert!(!RequestState::Executing.is_terminal());
        assert_eq!(RequestState::Cancelled.to_string(), "CANCELLED");
    }

    #[test]
    fn test_pull_policy() {
        let p: PullPolicy = serde_yaml::from_str("if-not-present").unwrap();
        assert_eq!(p, PullPolicy::IfNotPresent);
        assert_eq!(PullPolicy::Always.kubernetes(), "Always");
    }

    #[test]
    fn test_make_dns1123_compatible() {
        assert_eq!(make_dns1123_compatible("My_Task.Name"), "my-taskname");
        assert_eq!(make_dns1123_compatible("--abc"), "abc");
        let long = "a".repeat(100);
        assert_eq!(make_dns1123_compatible(&long).len(), 63);
    }
}
