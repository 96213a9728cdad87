//! Flowrun - workflow execution core: DAG decomposition, lifecycle state
//! machines, and sandboxed task runtimes

pub mod config;
pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod handler;
pub mod job;
pub mod manager;
pub mod poll;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod step;
pub mod store;
pub mod task;
pub mod trigger;
pub mod types;

pub use config::AppConfig;
pub use dag::{decompose, Dag, Edge, Node};
pub use engine::{Engine, EngineState};
pub use error::FlowError;
pub use fsm::{JobFsm, StepFsm};
pub use handler::{HandlerRegistry, StepContext, StepHandler};
pub use job::{Job, JobState, Trigger, TriggerState, Workflow, WorkflowState};
pub use manager::{Manager, ManagerIntervals};
pub use queue::{QueueTask, TaskQueue};
pub use runtime::{build_runtime, Mounter, MounterRegistry, Runtime, RuntimeKind};
pub use scheduler::{Scheduler, SchedulerIntervals};
pub use step::{Step, StepAction, StepState};
pub use store::{MemoryStore, Store};
pub use task::{Mount, MountType, Task, TaskLimits, TaskState};
pub use trigger::TriggerScheduler;
pub use types::{parse_duration, KV};
