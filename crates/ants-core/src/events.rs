use crate::error::AntError;
use crate::types::{RequestState, TaskMethod, REQUEST_ID};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Envelope shared by every event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaseEvent {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

impl BaseEvent {
    fn new(source: &str, event_type: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            event_type: event_type.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Start or stop transition of a container, keyed by method and container name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerLifecycleEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub user_id: String,
    pub ant_id: String,
    pub method: TaskMethod,
    pub container_name: String,
    pub container_id: String,
    pub container_state: RequestState,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ContainerLifecycleEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &str,
        user_id: &str,
        ant_id: &str,
        method: TaskMethod,
        container_name: &str,
        container_id: &str,
        container_state: RequestState,
        labels: HashMap<String, String>,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            base: BaseEvent::new(source, "ContainerLifecycleEvent"),
            user_id: user_id.to_string(),
            ant_id: ant_id.to_string(),
            method,
            container_name: container_name.to_string(),
            container_id: container_id.to_string(),
            container_state,
            labels,
            started_at,
            ended_at,
        }
    }

    pub fn key(&self) -> String {
        lifecycle_key(self.method, &self.container_name)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.base.created_at
    }

    pub fn validate(&self) -> Result<(), AntError> {
        if self.ant_id.is_empty() {
            return Err(AntError::Validation("ant id is not specified".into()));
        }
        if self.container_name.is_empty() {
            return Err(AntError::Validation("container name is not specified".into()));
        }
        if self.container_id.is_empty() {
            return Err(AntError::Validation("container id is not specified".into()));
        }
        Ok(())
    }

    /// Seconds since start, or the full run time once the container has ended.
    pub fn elapsed_secs(&self) -> i64 {
        match self.ended_at {
            Some(ended) if self.container_state != RequestState::Executing => {
                (ended - self.started_at).num_seconds()
            }
            _ => (Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Request id from the `RequestID` label, 0 when absent or malformed.
    pub fn request_id(&self) -> u64 {
        self.labels
            .get(REQUEST_ID)
            .and_then(|id| id.parse().ok())
            .unwrap_or(0)
    }

    pub fn marshal(&self) -> Result<Vec<u8>, AntError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(payload: &[u8]) -> Result<Self, AntError> {
        let event: Self = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }
}

impl std::fmt::Display for ContainerLifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AntID={} ContainerName={} ContainerState={} Method={}",
            self.ant_id, self.container_name, self.container_state, self.method
        )
    }
}

pub fn lifecycle_key(method: TaskMethod, container_name: &str) -> String {
    format!("{}:{}", method, container_name)
}

/// Per-request allocation held by an ant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AntAllocation {
    pub job_request_id: u64,
    /// Task type to its state.
    #[serde(default)]
    pub task_types: HashMap<String, RequestState>,
    pub ant_id: String,
    pub ant_topic: String,
    pub allocated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AntAllocation {
    pub fn new(ant_id: &str, ant_topic: &str, request_id: u64, task_type: &str) -> Self {
        let now = Utc::now();
        Self {
            job_request_id: request_id,
            task_types: HashMap::from([(task_type.to_string(), RequestState::Executing)]),
            ant_id: ant_id.to_string(),
            ant_topic: ant_topic.to_string(),
            allocated_at: now,
            updated_at: now,
        }
    }

    pub fn load(&self) -> usize {
        self.task_types.len()
    }
}

/// Periodic heartbeat of an ant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AntRegistration {
    pub ant_id: String,
    pub ant_topic: String,
    pub max_capacity: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub methods: Vec<TaskMethod>,
    #[serde(default)]
    pub current_load: i32,
    #[serde(default)]
    pub total_executed: i32,
    #[serde(default)]
    pub allocations: HashMap<u64, AntAllocation>,
    pub created_at: DateTime<Utc>,
    pub ant_started_at: DateTime<Utc>,
    #[serde(default)]
    pub auto_refresh: bool,
    /// Set locally when the heartbeat is received.
    #[serde(skip)]
    pub received_at: Option<DateTime<Utc>>,
}

impl AntRegistration {
    /// Normalizes capacity and checks required fields.
    pub fn validate(&mut self) -> Result<(), AntError> {
        if self.ant_id.is_empty() {
            return Err(AntError::Validation(
                "antID is not specified for registration".into(),
            ));
        }
        if self.methods.is_empty() {
            return Err(AntError::Validation(
                "methods is not specified for registration".into(),
            ));
        }
        if self.max_capacity <= 0 {
            self.max_capacity = 1;
        }
        Ok(())
    }

    pub fn marshal(&mut self) -> Result<Vec<u8>, AntError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(payload: &[u8]) -> Result<Self, AntError> {
        let mut registration: Self = serde_json::from_slice(payload)?;
        registration.validate()?;
        Ok(registration)
    }
}

impl std::fmt::Display for AntRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ID={} Tags={:?} Max={} Load={} Executed={}",
            self.ant_id, self.tags, self.max_capacity, self.current_load, self.total_executed
        )
    }
}

/// Job ids that finished recently; their containers may be reaped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecentlyCompletedJobsEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub job_ids: Vec<String>,
}

impl RecentlyCompletedJobsEvent {
    pub fn new(source: &str, job_ids: Vec<String>) -> Self {
        Self {
            base: BaseEvent::new(source, "RecentlyCompletedJobsEvent"),
            job_ids,
        }
    }

    pub fn marshal(&self) -> Result<Vec<u8>, AntError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(payload: &[u8]) -> Result<Self, AntError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> ContainerLifecycleEvent {
        ContainerLifecycleEvent::new(
            "test",
            "user-1",
            "ant-1",
            TaskMethod::Docker,
            "ants-42-build",
            "c1",
            RequestState::Executing,
            HashMap::from([(REQUEST_ID.to_string(), "42".to_string())]),
            Utc::now(),
            None,
        )
    }

    #[test]
    fn test_lifecycle_event_json_shape() {
        let event = sample_event();
        let value: serde_json::Value = serde_json::from_slice(&event.marshal().unwrap()).unwrap();
        assert_eq!(value["event_type"], "ContainerLifecycleEvent");
        assert_eq!(value["method"], "DOCKER");
        assert_eq!(value["container_state"], "EXECUTING");
        assert_eq!(value["container_name"], "ants-42-build");
        assert!(value["ended_at"].is_null());

        let decoded = ContainerLifecycleEvent::unmarshal(&event.marshal().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_lifecycle_event_key_and_request_id() {
        let event = sample_event();
        assert_eq!(event.key(), "DOCKER:ants-42-build");
        assert_eq!(event.request_id(), 42);
    }

    #[test]
    fn test_lifecycle_event_validate() {
        let mut event = sample_event();
        event.container_id.clear();
        assert!(event.marshal().is_err());
    }

    #[test]
    fn test_registration_normalizes_capacity() {
        let mut reg = AntRegistration {
            ant_id: "ant-1".into(),
            ant_topic: "topic".into(),
            max_capacity: 0,
            tags: vec![],
            methods: vec![TaskMethod::Shell],
            current_load: 0,
            total_executed: 0,
            allocations: HashMap::new(),
            created_at: Utc::now(),
            ant_started_at: Utc::now(),
            auto_refresh: false,
            received_at: None,
        };
        let payload = reg.marshal().unwrap();
        assert_eq!(reg.max_capacity, 1);
        let decoded = AntRegistration::unmarshal(&payload).unwrap();
        assert_eq!(decoded.ant_id, "ant-1");

        reg.methods.clear();
        assert!(reg.validate().is_err());
    }
}
