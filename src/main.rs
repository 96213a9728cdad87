//! Flowrun CLI - run, validate and serve workflow files

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flowrun::config::{AppConfig, EngineConfig};
use flowrun::dispatch;
use flowrun::{
    decompose, Dag, Edge, Engine, FlowError, HandlerRegistry, Job, JobFsm, Manager, MemoryStore,
    Node, RuntimeKind, Scheduler, Step, StepFsm, StepState, Store, Task, TaskQueue, TaskState,
    Trigger, TriggerScheduler, TriggerState, Workflow, KV,
};

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(about = "Flowrun - workflow execution core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file to completion
    Run {
        /// Path to a workflow .yaml file
        file: String,

        /// Path to an application config file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Validate a workflow file (parse and decompose only)
    Validate {
        /// Path to a workflow .yaml file
        file: String,
    },

    /// Load workflow files and run their triggers until interrupted
    Serve {
        /// Workflow .yaml files to load
        files: Vec<String>,

        /// Path to an application config file
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// On-disk workflow document: a dag plus an optional firing interval.
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    id: Option<String>,
    /// Trigger interval duration string; absent means manual runs only.
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl WorkflowFile {
    fn load(path: &str) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    fn workflow_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    fn dag(&self, workflow_id: &str) -> Dag {
        Dag {
            id: format!("{workflow_id}-dag"),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { file, config } => run_workflow(&file, config.as_deref()).await,
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Serve { files, config } => serve(&files, config.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>, default_runtime: RuntimeKind) -> Result<AppConfig, FlowError> {
    match path {
        Some(path) => AppConfig::load(Path::new(path)),
        None => {
            let mut cfg = AppConfig::default();
            cfg.engine.runtime = default_runtime;
            Ok(cfg)
        }
    }
}

struct App {
    store: Arc<MemoryStore>,
    queue: Arc<TaskQueue>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl App {
    fn start(cfg: &AppConfig) -> Result<Self, FlowError> {
        let store = Arc::new(MemoryStore::new());
        let queue = if cfg.queue.priorities.is_empty() {
            Arc::new(TaskQueue::with_default_queues())
        } else {
            let pairs: Vec<(&str, u32)> = cfg
                .queue
                .priorities
                .iter()
                .map(|(name, weight)| (name.as_str(), *weight))
                .collect();
            Arc::new(TaskQueue::new(&pairs))
        };
        let token = CancellationToken::new();

        let handlers = Arc::new(HandlerRegistry::new());
        register_builtin_handlers(&handlers, cfg.engine.clone());

        let job_fsm = Arc::new(JobFsm::new(store.clone()));
        let step_fsm = Arc::new(StepFsm::new(store.clone(), handlers));
        dispatch::register_handlers(&queue, store.clone(), job_fsm.clone(), step_fsm.clone());
        queue.clone().run(cfg.queue.concurrency);

        let mut handles = Vec::new();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            step_fsm,
            token.clone(),
            cfg.poll.scheduler_intervals()?,
        ));
        handles.extend(scheduler.spawn());
        let manager = Arc::new(Manager::new(
            store.clone(),
            queue.clone(),
            job_fsm,
            token.clone(),
            cfg.poll.manager_intervals()?,
        ));
        handles.extend(manager.spawn());

        Ok(Self {
            store,
            queue,
            token,
            handles,
        })
    }

    async fn shutdown(self) {
        self.token.cancel();
        self.queue.shutdown().await;
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// The built-in `task/run` handler: the step's merged input is a task
/// document executed through a single-shot engine.
fn register_builtin_handlers(handlers: &HandlerRegistry, engine_cfg: EngineConfig) {
    let cfg = Arc::new(engine_cfg);
    handlers.register_fn("task", "run", move |_ctx, input| {
        let cfg = Arc::clone(&cfg);
        async move {
            let mut task: Task = serde_json::from_value(serde_json::Value::Object(input.0))?;
            if task.id.is_empty() {
                task.id = Uuid::new_v4().to_string();
            }
            let engine = Engine::from_config(&cfg)?;
            engine.run(CancellationToken::new(), &mut task).await?;

            match task.state {
                TaskState::Completed => {
                    let mut out = KV::new();
                    if let Some(result) = task.result {
                        out.insert("result", json!(result));
                    }
                    Ok(out)
                }
                TaskState::Canceled => Err(FlowError::Canceled),
                _ => Err(FlowError::Execution(
                    task.error.unwrap_or_else(|| "task failed".to_string()),
                )),
            }
        }
    });
}

async fn run_workflow(file: &str, config: Option<&str>) -> Result<(), FlowError> {
    let cfg = load_config(config, RuntimeKind::Shell)?;
    let document = WorkflowFile::load(file)?;
    let workflow_id = document.workflow_id();
    let dag = document.dag(&workflow_id);
    // Reject malformed graphs up front; a bad dag must not become a job
    // that can never settle.
    decompose(&dag, "validate")?;

    let app = App::start(&cfg)?;
    app.store.create_dag(dag.clone()).await?;
    app.store
        .create_workflow(Workflow {
            id: workflow_id.clone(),
            dag_id: dag.id.clone(),
            ..Default::default()
        })
        .await?;
    let job = Job::ready(&workflow_id, &dag.id, "");
    app.store.create_job(job.clone()).await?;

    println!(
        "{} Running workflow {} ({} nodes)",
        "→".cyan(),
        workflow_id.cyan().bold(),
        dag.nodes.len()
    );

    let settled = loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let job = app.store.get_job(&job.id).await?;
        if job.state.is_terminal() {
            break job;
        }
    };

    let mut steps = app.store.get_steps_by_job(&settled.id).await?;
    steps.sort_by_key(|s| s.started_at);
    for step in &steps {
        print_step(step);
    }
    println!(
        "{} Job {}",
        "→".cyan(),
        format!("{:?}", settled.state).to_lowercase().bold()
    );
    app.shutdown().await;

    match settled.state {
        flowrun::JobState::Finished => Ok(()),
        state => Err(FlowError::Execution(format!(
            "job ended in state {state:?}"
        ))),
    }
}

fn print_step(step: &Step) {
    let state = format!("{:?}", step.state).to_lowercase();
    let state = match step.state {
        StepState::Finished => state.green(),
        StepState::Failed => state.red(),
        StepState::Skipped | StepState::Canceled => state.yellow(),
        _ => state.normal(),
    };
    match &step.error {
        Some(error) => println!("  {} {} - {}", state.bold(), step.node_id, error),
        None => println!("  {} {}", state.bold(), step.node_id),
    }
}

fn validate_workflow(file: &str) -> Result<(), FlowError> {
    let document = WorkflowFile::load(file)?;
    let workflow_id = document.workflow_id();
    let dag = document.dag(&workflow_id);
    let steps = decompose(&dag, "validate")?;
    if let Some(schedule) = &document.schedule {
        flowrun::parse_duration(schedule)?;
    }
    println!(
        "{} {} is valid: {} nodes, {} edges, {} root step(s)",
        "✓".green().bold(),
        file,
        dag.nodes.len(),
        dag.edges.len(),
        steps.iter().filter(|s| s.state == StepState::Ready).count()
    );
    Ok(())
}

async fn serve(files: &[String], config: Option<&str>) -> Result<(), FlowError> {
    let cfg = load_config(config, RuntimeKind::Docker)?;
    let app = App::start(&cfg)?;

    for file in files {
        let document = WorkflowFile::load(file)?;
        let workflow_id = document.workflow_id();
        let dag = document.dag(&workflow_id);
        decompose(&dag, "validate")?;
        app.store.create_dag(dag.clone()).await?;
        app.store
            .create_workflow(Workflow {
                id: workflow_id.clone(),
                dag_id: dag.id,
                ..Default::default()
            })
            .await?;
        if let Some(schedule) = &document.schedule {
            flowrun::parse_duration(schedule)?;
            app.store
                .create_trigger(Trigger {
                    id: format!("{workflow_id}-trigger"),
                    workflow_id: workflow_id.clone(),
                    schedule: schedule.clone(),
                    state: TriggerState::Enabled,
                })
                .await?;
        }
        println!("{} Loaded workflow {}", "→".cyan(), workflow_id.cyan().bold());
    }

    let triggers = Arc::new(TriggerScheduler::new(
        app.store.clone(),
        app.queue.clone(),
        app.token.clone(),
        cfg.poll.trigger_sync_interval()?,
    ));
    let trigger_handles = triggers.spawn();

    println!("{} Serving, press ctrl-c to stop", "→".cyan());
    tokio::signal::ctrl_c().await?;
    println!("{} Shutting down", "→".cyan());
    for handle in &trigger_handles {
        handle.abort();
    }
    app.shutdown().await;
    Ok(())
}
