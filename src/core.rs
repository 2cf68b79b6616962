// src/core.rs
//
// =============================================================================
// LABFLOW: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The data contracts of the lab.
// Every document that lives in the persistent store is defined here, together
// with the state machines (as enums) the managers are allowed to move them
// through.
//
// Design Principles:
// 1. One struct per stored collection, serde end to end.
// 2. Status enums carry their wire names; transition rules live in the managers.
// 3. Ids are UUIDs everywhere; names are human-facing identities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Separator for hierarchical sample position names, e.g. `furnace_1/inside/2`.
pub const POSITION_SEPARATOR: char = '/';

/// Placeholder in a position prefix that expands to the acquired device's name.
pub const DEVICE_PLACEHOLDER: &str = "$";

// ============================================================================
// 1. DEVICES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Idle,
    Occupied,
    Paused,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Idle => "IDLE",
            DeviceStatus::Occupied => "OCCUPIED",
            DeviceStatus::Paused => "PAUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(DeviceStatus::Idle),
            "OCCUPIED" => Some(DeviceStatus::Occupied),
            "PAUSED" => Some(DeviceStatus::Paused),
            _ => None,
        }
    }
}

/// Pause is a request/acknowledge protocol: an operator records the request at
/// any time, but it only takes effect once the device is next idle. A running
/// task is never interrupted by a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseStatus {
    None,
    Requested,
    Paused,
}

impl PauseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseStatus::None => "NONE",
            PauseStatus::Requested => "REQUESTED",
            PauseStatus::Paused => "PAUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(PauseStatus::None),
            "REQUESTED" => Some(PauseStatus::Requested),
            "PAUSED" => Some(PauseStatus::Paused),
            _ => None,
        }
    }
}

/// One registered device as the store sees it.
/// Invariant: `task_id` is Some iff `status == Occupied`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub type_name: String,
    pub description: String,
    pub status: DeviceStatus,
    pub pause_status: PauseStatus,
    pub task_id: Option<Uuid>,
    /// Operator-facing free text ("ramping to 600C", "door open", ...).
    pub message: String,
    pub last_updated: DateTime<Utc>,
}

// ============================================================================
// 2. SAMPLE POSITIONS & SAMPLES
// ============================================================================

/// Definition of a sample-holding position, as declared by a device driver or
/// as a standalone location. A position with capacity > 1 expands into
/// `capacity` independent slots named `<name>/<index>` (index from 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplePositionDef {
    pub name: String,
    pub capacity: usize,
    pub description: String,
}

impl SamplePositionDef {
    pub fn new(name: impl Into<String>, capacity: usize, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity,
            description: description.into(),
        }
    }

    /// The literal slot names this position expands into.
    pub fn slot_names(&self) -> Vec<String> {
        if self.capacity == 1 {
            vec![self.name.clone()]
        } else {
            (1..=self.capacity)
                .map(|i| format!("{}{}{}", self.name, POSITION_SEPARATOR, i))
                .collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Empty,
    Locked,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Empty => "EMPTY",
            SlotStatus::Locked => "LOCKED",
        }
    }
}

/// One physical slot of a sample position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRecord {
    pub name: String,
    /// Name of the owning sample position (prefix of `name`).
    pub position: String,
    pub index: usize,
    pub status: SlotStatus,
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: Uuid,
    pub name: String,
    /// Slot name the sample currently occupies, or None if off-lab.
    pub position: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub last_updated: DateTime<Utc>,
}

// ============================================================================
// 3. TASKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for upstream tasks to complete.
    Pending,
    /// All upstream tasks completed, eligible for dispatch.
    Ready,
    Running,
    /// Blocked inside the resource coordinator.
    RequestingResources,
    Completed,
    Error,
    /// Cancellation requested while running; forced termination in flight.
    Cancelling,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::RequestingResources => "REQUESTING_RESOURCES",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Cancelling => "CANCELLING",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "READY" => Some(TaskStatus::Ready),
            "RUNNING" => Some(TaskStatus::Running),
            "REQUESTING_RESOURCES" => Some(TaskStatus::RequestingResources),
            "COMPLETED" => Some(TaskStatus::Completed),
            "ERROR" => Some(TaskStatus::Error),
            "CANCELLING" => Some(TaskStatus::Cancelling),
            "CANCELLED" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

/// One executable step of an experiment. Kept forever as audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub type_name: String,
    pub parameters: Value,
    /// Role name -> sample id, as declared by the experiment.
    pub samples: HashMap<String, Uuid>,
    pub status: TaskStatus,
    pub prev_tasks: Vec<Uuid>,
    pub next_tasks: Vec<Uuid>,
    pub message: String,
    pub result: Option<Value>,
    pub last_updated: DateTime<Utc>,
}

// ============================================================================
// 4. EXPERIMENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "PENDING",
            ExperimentStatus::Running => "RUNNING",
            ExperimentStatus::Completed => "COMPLETED",
            ExperimentStatus::Error => "ERROR",
            ExperimentStatus::Cancelled => "CANCELLED",
        }
    }
}

/// A sample declared by a submitted experiment. `sample_id` may be supplied by
/// the caller (it is then validated for uniqueness) or assigned at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSample {
    pub name: String,
    #[serde(default)]
    pub sample_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A task declared by a submitted experiment. `next_tasks` are indices into the
/// experiment's own task list; `task_id` is written back at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentTask {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub parameters: Value,
    /// Role name -> declared sample name.
    #[serde(default)]
    pub samples: HashMap<String, String>,
    #[serde(default)]
    pub next_tasks: Vec<usize>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

/// The raw document accepted from the submission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSubmission {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub samples: Vec<ExperimentSample>,
    pub tasks: Vec<ExperimentTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: Uuid,
    pub name: String,
    pub tags: Vec<String>,
    pub samples: Vec<ExperimentSample>,
    pub tasks: Vec<ExperimentTask>,
    pub status: ExperimentStatus,
    pub message: String,
    pub submitted_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ExperimentRecord {
    pub fn from_submission(submission: ExperimentSubmission) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: submission.name,
            tags: submission.tags,
            samples: submission.samples,
            tasks: submission.tasks,
            status: ExperimentStatus::Pending,
            message: String::new(),
            submitted_at: now,
            last_updated: now,
        }
    }
}

// ============================================================================
// 5. OPERATOR INPUT REQUESTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Fulfilled,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Fulfilled => "FULFILLED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Who is asking: a task (with its experiment) or a device needing maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestContext {
    Task { task_id: Uuid, experiment_id: Uuid },
    Maintenance { device: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    pub id: Uuid,
    pub prompt: String,
    /// Finite choice set the operator must pick from.
    pub options: Vec<String>,
    pub context: RequestContext,
    pub status: RequestStatus,
    pub response: Option<String>,
    pub note: String,
    pub last_updated: DateTime<Utc>,
}
