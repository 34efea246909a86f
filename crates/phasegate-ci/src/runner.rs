//! Stage runners backed by the local shell.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use phasegate_core::{CancelSignal, StageDefinition, StageOutput, StageRunner};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported for a stage killed by cancellation.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Lines of output kept in a stage summary.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Shell invocation settings shared by every shell-backed action.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub shell: String,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            workdir: None,
            env: BTreeMap::new(),
        }
    }
}

impl ShellConfig {
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// `<shell> -c <script>` with piped output, killed when dropped.
    pub(crate) fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Last `n` non-empty lines of `text`.
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

pub(crate) async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        if let Err(e) = r.read_to_end(&mut buf).await {
            debug!(error = %e, "stage output stream closed early");
        }
    }
    buf
}

/// Runs a stage's `run` command through the shell.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    config: ShellConfig,
    tail_lines: usize,
}

impl ShellRunner {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(mut self, n: usize) -> Self {
        self.tail_lines = n;
        self
    }
}

#[async_trait]
impl StageRunner for ShellRunner {
    async fn run(
        &self,
        stage: &StageDefinition,
        mut cancel: CancelSignal,
    ) -> anyhow::Result<StageOutput> {
        let script = stage
            .run
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .with_context(|| format!("stage {} has no run command", stage.id))?;

        debug!(stage = %stage.id, command = %script, "spawning shell command");
        let mut child = self
            .config
            .command(script)
            .spawn()
            .with_context(|| format!("failed to spawn shell for stage {}", stage.id))?;

        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let exit_code = tokio::select! {
            status = child.wait() => status?.code().unwrap_or(-1),
            _ = cancel.cancelled() => {
                warn!(stage = %stage.id, "cancelling running command");
                if let Err(e) = child.kill().await {
                    warn!(stage = %stage.id, error = %e, "failed to kill command");
                }
                CANCELLED_EXIT_CODE
            }
        };

        let stdout = String::from_utf8_lossy(&stdout.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.await.unwrap_or_default()).into_owned();

        let summary = match exit_code {
            0 => tail(&stdout, self.tail_lines),
            CANCELLED_EXIT_CODE if cancel.is_cancelled() => "terminated by cancellation".to_string(),
            code => {
                let out = tail(&format!("{stdout}\n{stderr}"), self.tail_lines);
                format!("exited with {code}\n{out}").trim_end().to_string()
            }
        };

        Ok(StageOutput {
            exit_code,
            summary,
            detail: Some(json!({
                "stdout_tail": tail(&stdout, self.tail_lines),
                "stderr_tail": tail(&stderr, self.tail_lines),
            })),
        })
    }
}

/// Sends `uses:` stages to the runner registered for that action name and
/// `run:` stages to the fallback shell runner.
#[derive(Clone)]
pub struct RoutingRunner {
    shell: Arc<dyn StageRunner>,
    actions: HashMap<String, Arc<dyn StageRunner>>,
}

impl RoutingRunner {
    pub fn new(shell: Arc<dyn StageRunner>) -> Self {
        Self {
            shell,
            actions: HashMap::new(),
        }
    }

    pub fn register(mut self, action: impl Into<String>, runner: Arc<dyn StageRunner>) -> Self {
        self.actions.insert(action.into(), runner);
        self
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl StageRunner for RoutingRunner {
    async fn run(&self, stage: &StageDefinition, cancel: CancelSignal) -> anyhow::Result<StageOutput> {
        match stage.uses.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(action) => {
                let runner = self
                    .actions
                    .get(action)
                    .with_context(|| format!("no runner registered for action '{action}'"))?;
                runner.run(stage, cancel).await
            }
            None => self.shell.run(stage, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_core::fakes::ScriptedRunner;
    use phasegate_core::CancelHandle;
    use std::time::Duration;

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\n\nc\n", 2), "b\nc");
        assert_eq!(tail("", 3), "");
    }

    #[tokio::test]
    async fn shell_command_success() {
        let runner = ShellRunner::default().with_tail_lines(DEFAULT_TAIL_LINES);
        let stage = StageDefinition::command("echo", "echo hello");
        let output = runner.run(&stage, CancelSignal::never()).await.unwrap();
        assert!(output.passed());
        assert_eq!(output.summary, "hello");
    }

    #[tokio::test]
    async fn shell_command_failure_keeps_stderr() {
        let runner = ShellRunner::new(ShellConfig::default());
        let stage = StageDefinition::command("fail", "echo boom >&2; exit 3");
        let output = runner.run(&stage, CancelSignal::never()).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(output.summary.contains("boom"));
    }

    #[tokio::test]
    async fn shell_env_is_passed() {
        let mut env = BTreeMap::new();
        env.insert("PHASEGATE_GREETING".to_string(), "hi".to_string());
        let runner = ShellRunner::new(ShellConfig::default().with_env(env));
        let stage = StageDefinition::command("env", "echo $PHASEGATE_GREETING");
        let output = runner.run(&stage, CancelSignal::never()).await.unwrap();
        assert_eq!(output.summary, "hi");
    }

    #[tokio::test]
    async fn cancellation_kills_command() {
        let runner = ShellRunner::default();
        let stage = StageDefinition::command("sleep", "sleep 30");
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let task = tokio::spawn(async move { runner.run(&stage, signal).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let output = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(output.exit_code, CANCELLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn routing_dispatches_by_action_name() {
        let deploy = Arc::new(ScriptedRunner::new());
        let router = RoutingRunner::new(Arc::new(ShellRunner::default()))
            .register("deploy", deploy.clone());

        let stage = StageDefinition::action("ship", "deploy");
        assert!(router.run(&stage, CancelSignal::never()).await.unwrap().passed());
        assert_eq!(deploy.invocations(), vec!["ship".to_string()]);

        let unknown = StageDefinition::action("x", "publish");
        let err = router.run(&unknown, CancelSignal::never()).await.unwrap_err();
        assert!(err.to_string().contains("publish"));
    }
}
