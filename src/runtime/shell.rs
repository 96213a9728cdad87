//! Restricted local-process runtime.
//!
//! Runs the task script through a configured interpreter in a throwaway
//! work directory, optionally dropping to a fixed uid/gid. Container-only
//! task features are rejected up front rather than silently ignored.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::FlowError;
use crate::task::{Task, TaskState};

use super::Runtime;

const STDOUT_FILE: &str = "stdout";

pub struct ShellRuntime {
    cmds: DashMap<String, CancellationToken>,
    shell: Vec<String>,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl ShellRuntime {
    pub fn new(shell: Vec<String>, uid: Option<u32>, gid: Option<u32>) -> Self {
        let shell = if shell.is_empty() {
            vec!["bash".to_string(), "-c".to_string()]
        } else {
            shell
        };
        Self {
            cmds: DashMap::new(),
            shell,
            uid,
            gid,
        }
    }

    fn validate(&self, task: &Task) -> Result<(), FlowError> {
        if task.id.is_empty() {
            return Err(FlowError::TaskIdRequired);
        }
        if !task.image.is_empty() {
            return Err(FlowError::ShellUnsupported { feature: "image" });
        }
        if !task.mounts.is_empty() {
            return Err(FlowError::ShellUnsupported { feature: "mounts" });
        }
        if !task.networks.is_empty() {
            return Err(FlowError::ShellUnsupported { feature: "networks" });
        }
        if !task.entrypoint.is_empty() {
            return Err(FlowError::ShellUnsupported {
                feature: "entrypoint",
            });
        }
        if !task.cmd.is_empty() {
            return Err(FlowError::ShellUnsupported { feature: "cmd" });
        }
        if task.registry.is_some() {
            return Err(FlowError::ShellUnsupported { feature: "registry" });
        }
        if task.gpus.is_some() {
            return Err(FlowError::ShellUnsupported { feature: "gpus" });
        }
        if task.limits.as_ref().is_some_and(|l| !l.is_empty()) {
            return Err(FlowError::ShellUnsupported { feature: "limits" });
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        token: &CancellationToken,
        task: &mut Task,
    ) -> Result<(), FlowError> {
        for i in 0..task.pre.len() {
            let pre = &mut task.pre[i];
            pre.id = Uuid::new_v4().to_string();
            if let Err(err) = self.do_run(token, pre).await {
                pre.mark_failed(err.to_string());
                return Err(err);
            }
        }

        let main_result = self.do_run(token, task).await;

        // Post tasks run regardless of the main result, so cleanup work
        // always happens. The main error still wins the verdict.
        let mut post_error = None;
        for i in 0..task.post.len() {
            let post = &mut task.post[i];
            post.id = Uuid::new_v4().to_string();
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

    #[instrument(skip(self, token, task), fields(task_id = %task.id))]
    async fn do_run(&self, token: &CancellationToken, task: &mut Task) -> Result<(), FlowError> {
        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());

        let workdir = tempfile::tempdir()?;
        let stdout_path = workdir.path().join(STDOUT_FILE);
        write_file(&stdout_path, "", 0o606)?;
        for (name, contents) in &task.files {
            write_file(&workdir.path().join(name), contents, 0o444)?;
        }
        if task.run.is_empty() {
            return Err(FlowError::Execution(
                "task has no run script".to_string(),
            ));
        }

        let mut cmd = Command::new(&self.shell[0]);
        cmd.args(&self.shell[1..])
            .arg(&task.run)
            .current_dir(workdir.path())
            .envs(&task.env)
            .env("OUTPUT", &stdout_path)
            .env("WORKDIR", workdir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(uid) = self.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = self.gid {
            cmd.gid(gid);
        }

        let mut child = cmd.spawn()?;
        let stdout_reader = child.stdout.take().map(|out| {
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, %line);
                }
            })
        });
        let stderr_reader = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut tail: Vec<String> = Vec::new();
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() >= 10 {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
                tail.join("\n")
            })
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                let _ = child.kill().await;
                task.state = TaskState::Canceled;
                return Err(FlowError::Canceled);
            }
        };
        if let Some(reader) = stdout_reader {
            let _ = reader.await;
        }
        let stderr_tail = match stderr_reader {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(FlowError::Execution(format!(
                "process exited with {status}: {stderr_tail}"
            )));
        }

        let output = std::fs::read_to_string(&stdout_path)?;
        if !output.is_empty() {
            task.result = Some(output);
        }
        task.state = TaskState::Completed;
        task.completed_at = Some(Utc::now());
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str, mode: u32) -> Result<(), FlowError> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[async_trait]
impl Runtime for ShellRuntime {
    async fn run(&self, token: CancellationToken, task: &mut Task) -> Result<(), FlowError> {
        self.validate(task)?;
        let task_token = token.child_token();
        self.cmds.insert(task.id.clone(), task_token.clone());
        let result = self.run_stages(&task_token, task).await;
        self.cmds.remove(&task.id);
        result
    }

    async fn stop(&self, task: &Task) -> Result<(), FlowError> {
        if let Some((_, token)) = self.cmds.remove(&task.id) {
            token.cancel();
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), FlowError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> ShellRuntime {
        ShellRuntime::new(vec![], None, None)
    }

    fn task(run: &str) -> Task {
        let mut t = Task::new();
        t.run = run.to_string();
        t
    }

    #[tokio::test]
    async fn captures_output_file_as_result() {
        let rt = runtime();
        let mut t = task("echo -n hello > \"$OUTPUT\"");
        rt.run(CancellationToken::new(), &mut t).await.unwrap();
        assert_eq!(t.state, TaskState::Completed);
        assert_eq!(t.result.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn env_and_files_are_visible_to_the_script() {
        let rt = runtime();
        let mut t = task("test \"$GREETING\" = hi && cat note.txt > \"$OUTPUT\"");
        t.env.insert("GREETING".to_string(), "hi".to_string());
        t.files
            .insert("note.txt".to_string(), "from-file".to_string());
        rt.run(CancellationToken::new(), &mut t).await.unwrap();
        assert_eq!(t.result.as_deref(), Some("from-file"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_execution_error_with_stderr() {
        let rt = runtime();
        let mut t = task("echo bad >&2; exit 3");
        let err = rt.run(CancellationToken::new(), &mut t).await.unwrap_err();
        match err {
            FlowError::Execution(msg) => assert!(msg.contains("bad"), "msg: {msg}"),
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn container_features_are_rejected() {
        let rt = runtime();
        let mut t = task("true");
        t.image = "alpine".to_string();
        assert!(matches!(
            rt.run(CancellationToken::new(), &mut t).await,
            Err(FlowError::ShellUnsupported { feature: "image" })
        ));

        let mut t = task("true");
        t.networks.push("internal".to_string());
        assert!(matches!(
            rt.run(CancellationToken::new(), &mut t).await,
            Err(FlowError::ShellUnsupported { feature: "networks" })
        ));

        let mut t = task("true");
        t.id.clear();
        assert!(matches!(
            rt.run(CancellationToken::new(), &mut t).await,
            Err(FlowError::TaskIdRequired)
        ));
    }

    #[tokio::test]
    async fn pre_failure_skips_main_and_post() {
        let rt = runtime();
        let mut t = task("echo -n main > \"$OUTPUT\"");
        let mut pre = Task::new();
        pre.run = "exit 1".to_string();
        t.pre.push(pre);
        let mut post = Task::new();
        post.run = "true".to_string();
        t.post.push(post);

        assert!(rt.run(CancellationToken::new(), &mut t).await.is_err());
        assert_eq!(t.pre[0].state, TaskState::Failed);
        assert!(t.result.is_none());
        assert_eq!(t.post[0].state, TaskState::Pending);
    }

    #[tokio::test]
    async fn post_runs_even_when_main_fails() {
        let rt = runtime();
        let mut t = task("exit 1");
        let mut post = Task::new();
        post.run = "true".to_string();
        t.post.push(post);

        assert!(rt.run(CancellationToken::new(), &mut t).await.is_err());
        assert_eq!(t.post[0].state, TaskState::Completed);
    }

    #[tokio::test]
    async fn post_failure_fails_an_otherwise_green_run() {
        let rt = runtime();
        let mut t = task("true");
        let mut post = Task::new();
        post.run = "exit 7".to_string();
        t.post.push(post);

        assert!(rt.run(CancellationToken::new(), &mut t).await.is_err());
        assert_eq!(t.post[0].state, TaskState::Failed);
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let rt = runtime();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let mut t = task("sleep 30");
        let err = rt.run(token, &mut t).await.unwrap_err();
        assert!(matches!(err, FlowError::Canceled));
        assert_eq!(t.state, TaskState::Canceled);
    }
}
