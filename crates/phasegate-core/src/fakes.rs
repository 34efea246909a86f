//! In-memory collaborators for tests and local experiments.
//!
//! [`ScriptedRunner`] plays back a per-stage script instead of executing
//! anything, and records what it was asked to run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::StageDefinition;
use crate::executor::{CancelSignal, StageOutput, StageRunner};

/// Scripted behaviour for one stage.
#[derive(Debug, Clone)]
pub enum StageScript {
    Pass,
    Fail(i32),
    /// The runner itself errors.
    Error(String),
    /// Sleep, then pass. Returns early with exit code 130 on cancellation.
    Sleep(Duration),
    /// Wait for cancellation, then report exit code 130.
    Hang,
}

/// Stage runner driven by [`StageScript`]s; unscripted stages pass.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: HashMap<String, StageScript>,
    invocations: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, stage: impl Into<String>, script: StageScript) -> Self {
        self.scripts.insert(stage.into(), script);
        self
    }

    /// Stage ids in the order they were started.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invocation_count(&self, stage: &str) -> usize {
        self.invocations().iter().filter(|s| *s == stage).count()
    }

    /// Highest number of stages observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run(
        &self,
        stage: &StageDefinition,
        mut cancel: CancelSignal,
    ) -> anyhow::Result<StageOutput> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stage.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match self.scripts.get(&stage.id).cloned().unwrap_or(StageScript::Pass) {
            StageScript::Pass => Ok(StageOutput::success(format!("{} ok", stage.id))),
            StageScript::Fail(code) => Ok(StageOutput::failure(
                code,
                format!("{} exited with {code}", stage.id),
            )),
            StageScript::Error(msg) => Err(anyhow::anyhow!(msg)),
            StageScript::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(StageOutput::success(format!("{} ok", stage.id))),
                    _ = cancel.cancelled() => Ok(StageOutput::failure(130, "terminated")),
                }
            }
            StageScript::Hang => {
                cancel.cancelled().await;
                Ok(StageOutput::failure(130, "terminated"))
            }
        }
    }
}
