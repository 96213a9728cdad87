//! Error types for the workflow execution core

use thiserror::Error;

use crate::task::MountType;

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────
    // Graph errors
    // ─────────────────────────────────────────────────────────────
    #[error("duplicate node '{id}' in dag")]
    DuplicateNode { id: String },

    #[error("edge {from} -> {to} references unknown node")]
    UnknownNode { from: String, to: String },

    #[error("cycle detected in dag: nodes {remaining:?} are unreachable from the roots")]
    CycleDetected { remaining: Vec<String> },

    // ─────────────────────────────────────────────────────────────
    // Lifecycle errors
    // ─────────────────────────────────────────────────────────────
    #[error("invalid {machine} transition: event '{event}' from state '{state}'")]
    InvalidTransition {
        machine: &'static str,
        state: String,
        event: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("no handler registered for bot '{bot}' rule '{rule_id}'")]
    HandlerNotFound { bot: String, rule_id: String },

    // ─────────────────────────────────────────────────────────────
    // Queue errors
    // ─────────────────────────────────────────────────────────────
    #[error("duplicate task '{id}' within retention window")]
    DuplicateTask { id: String },

    #[error("unknown queue '{queue}'")]
    UnknownQueue { queue: String },

    #[error("queue is shut down")]
    QueueClosed,

    // ─────────────────────────────────────────────────────────────
    // Engine / runtime errors
    // ─────────────────────────────────────────────────────────────
    #[error("engine is not idle (state: {state})")]
    EngineBusy { state: String },

    #[error("invalid CPUs value: {value}")]
    InvalidCpus { value: String },

    #[error("invalid memory value: {value}")]
    InvalidMemory { value: String },

    #[error("invalid duration: {value}")]
    InvalidDuration { value: String },

    #[error("task id is required")]
    TaskIdRequired,

    #[error("{feature} not supported on the shell runtime")]
    ShellUnsupported { feature: &'static str },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("task canceled")]
    Canceled,

    // ─────────────────────────────────────────────────────────────
    // Mount errors
    // ─────────────────────────────────────────────────────────────
    #[error("bind mounts are not allowed")]
    BindMountsDisabled,

    #[error("{mount_type} mount requires a source")]
    MountSourceRequired { mount_type: MountType },

    #[error("{mount_type} mount must not carry a source")]
    MountSourceForbidden { mount_type: MountType },

    #[error("{mount_type} mount requires a target")]
    MountTargetRequired { mount_type: MountType },

    #[error("unknown volume: {name}")]
    UnknownVolume { name: String },
}
