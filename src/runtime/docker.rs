//! Container runtime driving the docker CLI.
//!
//! Images are pulled through a single serialized puller so concurrent tasks
//! never race the same pull. Each task gets a fresh named volume mounted at
//! `/flowrun` holding its entrypoint script, work files and stdout capture;
//! the container is force-removed with its volumes when the task settles.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::FlowError;
use crate::task::{Mount, MountType, RegistryAuth, Task, TaskState};

use super::{MounterRegistry, Runtime};

const WORKDIR: &str = "/flowrun";
const ENTRYPOINT_FILE: &str = "entrypoint";
const STDOUT_FILE: &str = "stdout";

/// Run `docker` with the given arguments, returning trimmed stdout.
pub(crate) async fn run_docker<I, S>(args: I) -> Result<String, FlowError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new("docker").args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FlowError::Execution(format!(
            "docker command failed with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

struct PullRequest {
    image: String,
    auth: Option<RegistryAuth>,
    done: oneshot::Sender<Result<(), FlowError>>,
}

pub struct DockerRuntime {
    containers: DashMap<String, String>,
    images: DashSet<String>,
    pull_tx: mpsc::Sender<PullRequest>,
    mounter: Arc<MounterRegistry>,
    credentials: Option<PathBuf>,
}

impl DockerRuntime {
    pub fn new(mounter: Arc<MounterRegistry>, credentials: Option<PathBuf>) -> Self {
        let (pull_tx, mut pull_rx) = mpsc::channel::<PullRequest>(64);
        tokio::spawn(async move {
            while let Some(req) = pull_rx.recv().await {
                let result = pull_image(&req.image, req.auth.as_ref()).await;
                let _ = req.done.send(result);
            }
        });
        Self {
            containers: DashMap::new(),
            images: DashSet::new(),
            pull_tx,
            mounter,
            credentials,
        }
    }

    /// Ensure the task's image is available locally, pulling it through the
    /// serialized pull queue on a miss. `task.registry` beats the
    /// credentials file.
    async fn ensure_image(&self, task: &Task) -> Result<(), FlowError> {
        if self.images.contains(&task.image) {
            return Ok(());
        }
        if run_docker(["image", "inspect", &task.image]).await.is_ok() {
            self.images.insert(task.image.clone());
            return Ok(());
        }

        let auth = match &task.registry {
            Some(auth) => Some(auth.clone()),
            None => self.file_credentials(&task.image)?,
        };
        let (done, wait) = oneshot::channel();
        self.pull_tx
            .send(PullRequest {
                image: task.image.clone(),
                auth,
                done,
            })
            .await
            .map_err(|_| FlowError::Execution("image puller is gone".to_string()))?;
        wait.await
            .map_err(|_| FlowError::Execution("image pull was dropped".to_string()))??;
        self.images.insert(task.image.clone());
        Ok(())
    }

    fn file_credentials(&self, image: &str) -> Result<Option<RegistryAuth>, FlowError> {
        let Some(path) = &self.credentials else {
            return Ok(None);
        };
        let Some(domain) = registry_domain(image) else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path)?;
        let table: HashMap<String, RegistryAuth> = serde_yaml::from_str(&raw)?;
        Ok(table.get(&domain).cloned())
    }

    async fn run_stages(
        &self,
        token: &CancellationToken,
        task: &mut Task,
    ) -> Result<(), FlowError> {
        for i in 0..task.pre.len() {
            let parent = stage_defaults(task);
            let pre = &mut task.pre[i];
            inherit(pre, &parent);
            if let Err(err) = self.do_run(token, pre).await {
                pre.mark_failed(err.to_string());
                return Err(err);
            }
        }

        let main_result = self.do_run(token, task).await;

        let mut post_error = None;
        for i in 0..task.post.len() {
            let parent = stage_defaults(task);
            let post = &mut task.post[i];
            inherit(post, &parent);
            if let Err(err) = self.do_run(token, post).await {
                post.mark_failed(err.to_string());
                warn!(task_id = %task.id, %err, "post task failed");
                post_error.get_or_insert(err);
            }
        }

        main_result?;
        match post_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[instrument(skip(self, token, task), fields(task_id = %task.id, image = %task.image))]
    async fn do_run(&self, token: &CancellationToken, task: &mut Task) -> Result<(), FlowError> {
        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        self.ensure_image(task).await?;

        // The work volume carries the entrypoint, files and stdout capture.
        let mut work = Mount {
            mount_type: MountType::Volume,
            source: String::new(),
            target: WORKDIR.to_string(),
        };
        self.mounter.mount(&mut work).await?;
        let result = self.run_container(token, task, &work).await;
        if let Err(err) = self.mounter.unmount(&work).await {
            warn!(task_id = %task.id, %err, "failed to remove work volume");
        }
        result
    }

    async fn run_container(
        &self,
        token: &CancellationToken,
        task: &mut Task,
        work: &Mount,
    ) -> Result<(), FlowError> {
        let staging = tempfile::tempdir()?;
        write_file(&staging.path().join(STDOUT_FILE), "", 0o666)?;
        if !task.run.is_empty() {
            write_file(&staging.path().join(ENTRYPOINT_FILE), &task.run, 0o755)?;
        }
        for (name, contents) in &task.files {
            write_file(&staging.path().join(name), contents, 0o444)?;
        }

        let args = create_args(task, work);
        let container = run_docker(args.iter().map(String::as_str)).await?;
        self.containers.insert(task.id.clone(), container.clone());
        let result = self
            .drive_container(token, task, &container, staging.path())
            .await;
        self.containers.remove(&task.id);
        if let Err(err) = run_docker(["rm", "-f", "-v", &container]).await {
            warn!(%container, %err, "failed to remove container");
        }
        result
    }

    async fn drive_container(
        &self,
        token: &CancellationToken,
        task: &mut Task,
        container: &str,
        staging: &Path,
    ) -> Result<(), FlowError> {
        for network in task.networks.iter().skip(1) {
            run_docker(["network", "connect", network, container]).await?;
        }
        let from = format!("{}/.", staging.display());
        let to = format!("{container}:{WORKDIR}");
        run_docker(["cp", &from, &to]).await?;
        run_docker(["start", container]).await?;

        // Stream container logs while it runs.
        let mut logs = Command::new("docker")
            .args(["logs", "-f", container])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(out) = logs.stdout.take() {
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, %line);
                }
            });
        }

        let exit_code = tokio::select! {
            code = run_docker(["wait", container]) => code?,
            _ = token.cancelled() => {
                task.state = TaskState::Canceled;
                return Err(FlowError::Canceled);
            }
        };
        if exit_code != "0" {
            let tail = run_docker(["logs", "--tail", "10", container])
                .await
                .unwrap_or_default();
            return Err(FlowError::Execution(format!(
                "container exited with code {exit_code}: {tail}"
            )));
        }

        let from = format!("{container}:{WORKDIR}/{STDOUT_FILE}");
        let result_path = staging.join("result");
        let to = result_path.display().to_string();
        run_docker(["cp", &from, &to]).await?;
        let output = std::fs::read_to_string(&result_path)?;
        if !output.is_empty() {
            task.result = Some(output);
        }
        task.state = TaskState::Completed;
        task.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// The `docker create` invocation for a task, with the work volume mounted
/// and the script entrypoint wired in.
fn create_args(task: &Task, work: &Mount) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".to_string(),
        "--name".to_string(),
        task.id.clone(),
        "-w".to_string(),
        WORKDIR.to_string(),
        "-e".to_string(),
        format!("OUTPUT={WORKDIR}/{STDOUT_FILE}"),
    ];
    for (key, value) in &task.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in task.mounts.iter().chain(std::iter::once(work)) {
        args.push("--mount".to_string());
        args.push(mount_arg(mount));
    }
    if let Some(network) = task.networks.first() {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    if let Some(limits) = &task.limits {
        if let Some(cpus) = &limits.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.clone());
        }
        if let Some(memory) = &limits.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
    }
    if let Some(gpus) = &task.gpus {
        args.push("--gpus".to_string());
        args.push(gpus.clone());
    }

    let entrypoint = if task.entrypoint.is_empty() {
        vec!["sh".to_string(), "-c".to_string()]
    } else {
        task.entrypoint.clone()
    };
    let cmd = if task.cmd.is_empty() {
        vec![format!("{WORKDIR}/{ENTRYPOINT_FILE}")]
    } else {
        task.cmd.clone()
    };
    args.push("--entrypoint".to_string());
    args.push(entrypoint[0].clone());
    args.push(task.image.clone());
    args.extend(entrypoint.into_iter().skip(1));
    args.extend(cmd);
    args
}

fn mount_arg(mount: &Mount) -> String {
    match mount.mount_type {
        MountType::Tmpfs => format!("type=tmpfs,target={}", mount.target),
        _ => format!(
            "type={},source={},target={}",
            mount.mount_type, mount.source, mount.target
        ),
    }
}

/// Fresh id plus inherited image, mounts, networks and limits for a
/// pre/post stage task.
fn stage_defaults(task: &Task) -> Task {
    Task {
        image: task.image.clone(),
        mounts: task.mounts.clone(),
        networks: task.networks.clone(),
        limits: task.limits.clone(),
        ..Task::default()
    }
}

fn inherit(stage: &mut Task, parent: &Task) {
    stage.id = Uuid::new_v4().to_string();
    if stage.image.is_empty() {
        stage.image = parent.image.clone();
    }
    if stage.mounts.is_empty() {
        stage.mounts = parent.mounts.clone();
    }
    if stage.networks.is_empty() {
        stage.networks = parent.networks.clone();
    }
    if stage.limits.is_none() {
        stage.limits = parent.limits.clone();
    }
}

/// The registry domain of an image reference, if it names one explicitly.
fn registry_domain(image: &str) -> Option<String> {
    let first = image.split('/').next()?;
    if first.contains('.') || first.contains(':') {
        Some(first.to_string())
    } else {
        None
    }
}

async fn pull_image(image: &str, auth: Option<&RegistryAuth>) -> Result<(), FlowError> {
    if let Some(auth) = auth {
        let domain = registry_domain(image).unwrap_or_default();
        run_docker([
            "login",
            &domain,
            "--username",
            &auth.username,
            "--password",
            &auth.password,
        ])
        .await?;
    }
    debug!(%image, "pulling image");
    run_docker(["pull", image]).await?;
    Ok(())
}

fn write_file(path: &Path, contents: &str, mode: u32) -> Result<(), FlowError> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[async_trait::async_trait]
impl Runtime for DockerRuntime {
    async fn run(&self, token: CancellationToken, task: &mut Task) -> Result<(), FlowError> {
        if task.id.is_empty() {
            return Err(FlowError::TaskIdRequired);
        }
        if task.image.is_empty() {
            return Err(FlowError::Execution("task image is required".to_string()));
        }

        // Mount everything up front; unmount all of it afterwards even when
        // the run fails partway.
        let mut mounted: Vec<Mount> = Vec::with_capacity(task.mounts.len());
        let mut mount_err = None;
        for mount in &mut task.mounts {
            match self.mounter.mount(mount).await {
                Ok(()) => mounted.push(mount.clone()),
                Err(err) => {
                    mount_err = Some(err);
                    break;
                }
            }
        }
        let result = match mount_err {
            Some(err) => Err(err),
            None => self.run_stages(&token, task).await,
        };
        for mount in &mounted {
            if let Err(err) = self.mounter.unmount(mount).await {
                warn!(task_id = %task.id, %err, "failed to unmount");
            }
        }
        result
    }

    async fn stop(&self, task: &Task) -> Result<(), FlowError> {
        if let Some((_, container)) = self.containers.remove(&task.id) {
            run_docker(["rm", "-f", "-v", &container]).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), FlowError> {
        run_docker(["version"]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mounts::{BindMounter, TmpfsMounter, VolumeMounter};
    use crate::task::TaskLimits;

    #[test]
    fn registry_domain_detection() {
        assert_eq!(
            registry_domain("registry.example.com/team/app:1"),
            Some("registry.example.com".to_string())
        );
        assert_eq!(
            registry_domain("localhost:5000/app"),
            Some("localhost:5000".to_string())
        );
        assert_eq!(registry_domain("alpine"), None);
        assert_eq!(registry_domain("library/alpine"), None);
    }

    #[test]
    fn create_args_defaults_to_script_entrypoint() {
        let mut task = Task::new();
        task.image = "alpine:3".to_string();
        task.run = "echo hi".to_string();
        let work = Mount {
            mount_type: MountType::Volume,
            source: "vol-1".to_string(),
            target: WORKDIR.to_string(),
        };

        let args = create_args(&task, &work);
        assert!(args.contains(&"--entrypoint".to_string()));
        let ep = args.iter().position(|a| a == "--entrypoint").unwrap();
        assert_eq!(args[ep + 1], "sh");
        let image = args.iter().position(|a| a == "alpine:3").unwrap();
        assert_eq!(args[image + 1], "-c");
        assert_eq!(args[image + 2], format!("{WORKDIR}/{ENTRYPOINT_FILE}"));
        assert!(args
            .iter()
            .any(|a| a == "type=volume,source=vol-1,target=/flowrun"));
    }

    #[test]
    fn create_args_carries_limits_networks_and_mounts() {
        let mut task = Task::new();
        task.image = "alpine:3".to_string();
        task.limits = Some(TaskLimits {
            cpus: Some("0.5".to_string()),
            memory: Some("512m".to_string()),
        });
        task.networks = vec!["net-a".to_string(), "net-b".to_string()];
        task.mounts.push(Mount {
            mount_type: MountType::Tmpfs,
            source: String::new(),
            target: "/scratch".to_string(),
        });
        let work = Mount {
            mount_type: MountType::Volume,
            source: "vol-1".to_string(),
            target: WORKDIR.to_string(),
        };

        let args = create_args(&task, &work);
        let cpus = args.iter().position(|a| a == "--cpus").unwrap();
        assert_eq!(args[cpus + 1], "0.5");
        let memory = args.iter().position(|a| a == "--memory").unwrap();
        assert_eq!(args[memory + 1], "512m");
        // Only the first network lands on create; the rest are connected
        // after the fact.
        let network = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[network + 1], "net-a");
        assert_eq!(args.iter().filter(|a| *a == "--network").count(), 1);
        assert!(args.iter().any(|a| a == "type=tmpfs,target=/scratch"));
    }

    #[test]
    fn stage_inheritance_fills_gaps_only() {
        let mut parent = Task::new();
        parent.image = "alpine:3".to_string();
        parent.networks = vec!["net".to_string()];
        let defaults = stage_defaults(&parent);

        let mut stage = Task::new();
        stage.image = "busybox".to_string();
        let old_id = stage.id.clone();
        inherit(&mut stage, &defaults);
        assert_ne!(stage.id, old_id);
        assert_eq!(stage.image, "busybox");
        assert_eq!(stage.networks, vec!["net"]);
    }

    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn runs_a_container_end_to_end() {
        let mounter = Arc::new(MounterRegistry::new());
        mounter.register(MountType::Bind, Arc::new(BindMounter::new(vec![])));
        mounter.register(MountType::Volume, Arc::new(VolumeMounter::new()));
        mounter.register(MountType::Tmpfs, Arc::new(TmpfsMounter::new()));
        let rt = DockerRuntime::new(mounter, None);

        let mut task = Task::new();
        task.image = "alpine:3".to_string();
        task.run = "echo -n from-container > $OUTPUT".to_string();
        rt.run(CancellationToken::new(), &mut task).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result.as_deref(), Some("from-container"));
    }

    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn failing_container_reports_log_tail() {
        let mounter = Arc::new(MounterRegistry::new());
        mounter.register(MountType::Volume, Arc::new(VolumeMounter::new()));
        let rt = DockerRuntime::new(mounter, None);

        let mut task = Task::new();
        task.image = "alpine:3".to_string();
        task.run = "echo went wrong; exit 2".to_string();
        let err = rt.run(CancellationToken::new(), &mut task).await.unwrap_err();
        match err {
            FlowError::Execution(msg) => {
                assert!(msg.contains("code 2"));
                assert!(msg.contains("went wrong"));
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }
}
