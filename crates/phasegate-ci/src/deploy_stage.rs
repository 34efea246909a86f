//! The designated deployment stage (`uses: deploy`).
//!
//! Inputs come from the stage's `with` map:
//! - `input`: JSON file holding the data to deploy (required)
//! - `command`: deployment command; receives the data on stdin and prints the
//!   deployed data as JSON on stdout (required)
//! - `schema`: JSON file with a record schema (optional)
//! - `rollback`: command run when post-deployment validation fails (optional)
//! - `create_snapshot`, `create_golden_baseline`, `verify_checksum`,
//!   `verify_snapshot`: `"true"` / `"false"` overrides of the runner defaults

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use phasegate_core::deploy::Schema;
use phasegate_core::{
    CancelSignal, DeploymentAction, DeploymentOptions, DeploymentValidator, NoopRollback,
    RollbackAction, StageDefinition, StageOutput, StageRunner, ValidationContext,
};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::runner::{read_all, tail, ShellConfig, DEFAULT_TAIL_LINES};

/// Action name routed to [`DeployStageRunner`].
pub const DEPLOY_ACTION: &str = "deploy";

/// Deploys by piping the data through a shell command.
#[derive(Debug, Clone)]
pub struct ShellDeploymentAction {
    pub command: String,
    pub shell: ShellConfig,
}

#[async_trait]
impl DeploymentAction for ShellDeploymentAction {
    async fn deploy(&self, data: &Value, ctx: &ValidationContext) -> anyhow::Result<Value> {
        let mut cmd = self.shell.command(&self.command);
        cmd.stdin(Stdio::piped())
            .env("PHASEGATE_DEPLOYMENT_ID", ctx.deployment_id.to_string());
        let mut child = cmd.spawn().context("failed to spawn deployment command")?;

        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let payload = serde_json::to_vec(data)?;
        if let Some(mut stdin) = child.stdin.take() {
            // Commands that ignore stdin may exit before reading it.
            let written = match stdin.write_all(&payload).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }
        let status = child.wait().await?;
        let stdout = stdout.await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr.await.unwrap_or_default()).into_owned();

        if !status.success() {
            bail!(
                "deployment command exited with {}: {}",
                status.code().unwrap_or(-1),
                tail(&stderr, DEFAULT_TAIL_LINES)
            );
        }
        serde_json::from_slice(&stdout).context("deployment command did not print JSON")
    }
}

/// Restores the previous state by running a shell command.
#[derive(Debug, Clone)]
pub struct ShellRollbackAction {
    pub command: String,
    pub shell: ShellConfig,
}

#[async_trait]
impl RollbackAction for ShellRollbackAction {
    async fn rollback(&self, ctx: &ValidationContext) -> anyhow::Result<()> {
        let mut cmd = self.shell.command(&self.command);
        cmd.env("PHASEGATE_DEPLOYMENT_ID", ctx.deployment_id.to_string());
        let output = cmd
            .output()
            .await
            .context("failed to spawn rollback command")?;
        if !output.status.success() {
            bail!(
                "rollback command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                tail(&String::from_utf8_lossy(&output.stderr), DEFAULT_TAIL_LINES)
            );
        }
        Ok(())
    }
}

/// Runs `deploy_with_validation` for a stage. A rollback, a failed
/// pre-validation and a deployment error all fail the stage; the full
/// deployment summary is attached as the stage detail.
///
/// Cancellation is not honoured once the deployment has started, so a
/// started deployment always reaches validation and, if needed, rollback.
#[derive(Clone)]
pub struct DeployStageRunner {
    validator: DeploymentValidator,
    options: DeploymentOptions,
    shell: ShellConfig,
}

impl DeployStageRunner {
    pub fn new(validator: DeploymentValidator, shell: ShellConfig) -> Self {
        Self {
            validator,
            options: DeploymentOptions::default(),
            shell,
        }
    }

    pub fn with_options(mut self, options: DeploymentOptions) -> Self {
        self.options = options;
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.shell.workdir {
            Some(dir) if Path::new(path).is_relative() => dir.join(path),
            _ => PathBuf::from(path),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let path = self.resolve(path);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("invalid JSON in {}", path.display()))
    }

    fn options_for(&self, stage: &StageDefinition) -> anyhow::Result<DeploymentOptions> {
        let mut options = self.options;
        for (key, slot) in [
            ("create_snapshot", &mut options.create_snapshot),
            ("create_golden_baseline", &mut options.create_golden_baseline),
            ("verify_checksum", &mut options.verify_checksum),
            ("verify_snapshot", &mut options.verify_snapshot),
        ] {
            if let Some(raw) = stage.with.get(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("stage {}: '{key}' must be true or false", stage.id))?;
            }
        }
        Ok(options)
    }
}

#[async_trait]
impl StageRunner for DeployStageRunner {
    async fn run(&self, stage: &StageDefinition, cancel: CancelSignal) -> anyhow::Result<StageOutput> {
        let input = stage
            .with
            .get("input")
            .with_context(|| format!("stage {} needs a 'with.input' data file", stage.id))?;
        let command = stage
            .with
            .get("command")
            .with_context(|| format!("stage {} needs a 'with.command' deployment command", stage.id))?;

        let data: Value = self.read_json(input).await?;
        let schema: Schema = match stage.with.get("schema") {
            Some(path) => self.read_json(path).await?,
            None => Schema::default(),
        };
        let options = self.options_for(stage)?;

        if cancel.is_cancelled() {
            return Ok(StageOutput::failure(
                crate::runner::CANCELLED_EXIT_CODE,
                "cancelled before deployment",
            ));
        }

        let action = ShellDeploymentAction {
            command: command.clone(),
            shell: self.shell.clone(),
        };
        let shell_rollback = stage.with.get("rollback").map(|cmd| ShellRollbackAction {
            command: cmd.clone(),
            shell: self.shell.clone(),
        });
        let rollback: &dyn RollbackAction = match &shell_rollback {
            Some(r) => r,
            None => &NoopRollback,
        };

        let summary = self
            .validator
            .deploy_with_validation(&data, schema, &action, rollback, &options)
            .await;

        let text = if summary.success {
            info!(stage = %stage.id, deployment_id = %summary.deployment_id, "deployment complete");
            format!("deployment {} complete", summary.deployment_id)
        } else {
            warn!(stage = %stage.id, deployment_id = %summary.deployment_id, phase = %summary.phase, "deployment did not complete");
            let mut reasons: Vec<String> = summary.pre.errors.clone();
            if let Some(post) = &summary.post {
                reasons.extend(post.errors.iter().cloned());
                reasons.extend(post.warnings.iter().cloned());
            }
            reasons.extend(summary.deploy_error.iter().cloned());
            reasons.extend(summary.rollback_error.iter().cloned());
            format!("deployment ended in {}: {}", summary.phase, reasons.join("; "))
        };

        let exit_code = if summary.success { 0 } else { 1 };
        Ok(StageOutput {
            exit_code,
            summary: text,
            detail: Some(serde_json::to_value(&summary)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_core::DeploymentPhase;
    use tempfile::TempDir;

    fn runner(dir: &TempDir) -> DeployStageRunner {
        DeployStageRunner::new(
            DeploymentValidator::default(),
            ShellConfig::default().with_workdir(dir.path()),
        )
    }

    fn stage(command: &str) -> StageDefinition {
        StageDefinition::action("ship", DEPLOY_ACTION)
            .with_input("input", "data.json")
            .with_input("command", command)
    }

    fn write_data(dir: &TempDir) {
        std::fs::write(dir.path().join("data.json"), r#"[{"id": 1}, {"id": 2}]"#).unwrap();
    }

    #[tokio::test]
    async fn passthrough_deployment_succeeds() {
        let dir = TempDir::new().unwrap();
        write_data(&dir);
        let output = runner(&dir)
            .run(&stage("cat"), CancelSignal::never())
            .await
            .unwrap();
        assert!(output.passed(), "{}", output.summary);
        let detail = output.detail.unwrap();
        assert_eq!(detail["phase"], "complete");
    }

    #[tokio::test]
    async fn altered_output_rolls_back() {
        let dir = TempDir::new().unwrap();
        write_data(&dir);
        let stage = stage(r#"echo '[{"id": 1}]'"#).with_input("rollback", "touch rolled-back");
        let output = runner(&dir).run(&stage, CancelSignal::never()).await.unwrap();
        assert!(!output.passed());
        let summary: phasegate_core::DeploymentSummary =
            serde_json::from_value(output.detail.unwrap()).unwrap();
        assert_eq!(summary.phase, DeploymentPhase::RolledBack);
        assert!(dir.path().join("rolled-back").exists());
    }

    #[tokio::test]
    async fn missing_input_is_a_runner_error() {
        let dir = TempDir::new().unwrap();
        let stage = StageDefinition::action("ship", DEPLOY_ACTION).with_input("command", "cat");
        let err = runner(&dir).run(&stage, CancelSignal::never()).await.unwrap_err();
        assert!(err.to_string().contains("with.input"));
    }

    #[test]
    fn options_parse_from_inputs() {
        let dir = TempDir::new().unwrap();
        let stage = stage("cat").with_input("verify_checksum", "false");
        let options = runner(&dir).options_for(&stage).unwrap();
        assert!(!options.verify_checksum);

        let bad = stage.with_input("create_snapshot", "maybe");
        assert!(runner(&dir).options_for(&bad).is_err());
    }
}
