//! Trial orchestrator: N independent agent-plus-grading trials with
//! per-trial sandbox directories and aggregate statistics.

mod sink;

pub use sink::{JsonlRunSink, RunManifestRecord, RunSink, TrialRow};

use anyhow::{anyhow, Result};
use bench_agent::{AgentConfig, ConversationEngine, ToolRegistry};
use bench_core::{ensure_dir, sha256_bytes};
use bench_model::ModelClient;
use bench_task::Task;
use chrono::Local;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub trials: usize,
    /// Concurrent mode interleaves all trials at their model-call suspension
    /// points and consumes results in completion order; sequential mode runs
    /// each trial to completion before the next starts. Aggregate statistics
    /// are mode-independent.
    pub concurrent: bool,
    pub sandbox_root: PathBuf,
    pub expression_timeout: Duration,
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            concurrent: false,
            sandbox_root: PathBuf::from("sandbox"),
            expression_timeout: Duration::from_secs(30),
            verbose: false,
        }
    }
}

/// Created at trial start, finalized once at grading, immutable after.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub run_id: usize,
    pub total: usize,
    pub passed: bool,
    pub message: String,
    pub answer: Option<String>,
    pub trial_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunStats {
    pub session_dir: PathBuf,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub outcomes: Vec<TrialOutcome>,
}

impl RunStats {
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64 * 100.0
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "session_dir": self.session_dir.display().to_string(),
            "passed": self.passed,
            "failed": self.failed,
            "total": self.total,
            "pass_rate_pct": self.pass_rate(),
            "elapsed_secs": self.elapsed.as_secs_f64(),
            "trials": self.outcomes.iter().map(|o| serde_json::json!({
                "trial_id": trial_label(o.run_id),
                "passed": o.passed,
                "answer_submitted": o.answer.is_some(),
                "trial_dir": o.trial_dir.display().to_string(),
            })).collect::<Vec<_>>(),
        })
    }
}

/// Runs the whole evaluation session: one sandbox root, one `task.setup()`,
/// N trials, aggregate stats. Always completes and reports, even when every
/// trial fails.
pub async fn run_all<C: ModelClient>(
    client: &C,
    task: Arc<dyn Task>,
    agent_config: &AgentConfig,
    config: &RunConfig,
) -> Result<RunStats> {
    let started = Instant::now();
    let session_id = format!("{}_{}", Local::now().format("%Y%m%d-%H%M%S"), task.name());
    let session_dir = config.sandbox_root.join(&session_id);
    ensure_dir(&session_dir)?;
    task.setup()?;

    let mut run_sink = JsonlRunSink::new(&session_dir)?;
    run_sink.write_run_manifest(&RunManifestRecord {
        schema_version: "run_manifest_v1".to_string(),
        run_id: session_id.clone(),
        created_at: Local::now().to_rfc3339(),
        task: task.name().to_string(),
        trials_planned: config.trials,
        concurrent: config.concurrent,
        model: agent_config.model.clone(),
    })?;

    info!(
        trials = config.trials,
        mode = if config.concurrent { "concurrent" } else { "sequential" },
        session_dir = %session_dir.display(),
        "starting evaluation session"
    );

    let mut outcomes = Vec::with_capacity(config.trials);
    if config.concurrent {
        let mut pending = FuturesUnordered::new();
        for run_id in 1..=config.trials {
            pending.push(run_trial(
                client,
                task.clone(),
                agent_config,
                config,
                &session_dir,
                run_id,
            ));
        }
        // First finished, first aggregated.
        while let Some(outcome) = pending.next().await {
            outcomes.push(outcome);
        }
    } else {
        for run_id in 1..=config.trials {
            outcomes.push(
                run_trial(client, task.clone(), agent_config, config, &session_dir, run_id).await,
            );
        }
    }
    outcomes.sort_by_key(|o| o.run_id);

    for outcome in &outcomes {
        run_sink.append_trial_row(&TrialRow {
            run_id: session_id.clone(),
            trial_id: trial_label(outcome.run_id),
            passed: outcome.passed,
            answer_submitted: outcome.answer.is_some(),
            artifact_digest: outcome
                .answer
                .as_ref()
                .map(|code| sha256_bytes(code.as_bytes())),
            message: outcome.message.clone(),
            trial_dir: outcome.trial_dir.display().to_string(),
        })?;
    }
    run_sink.flush()?;

    let passed = outcomes.iter().filter(|o| o.passed).count();
    let stats = RunStats {
        session_dir,
        passed,
        failed: outcomes.len() - passed,
        total: outcomes.len(),
        elapsed: started.elapsed(),
        outcomes,
    };
    info!(
        passed = stats.passed,
        failed = stats.failed,
        pass_rate_pct = format!("{:.1}", stats.pass_rate()),
        elapsed_secs = format!("{:.2}", stats.elapsed.as_secs_f64()),
        "evaluation session complete"
    );
    Ok(stats)
}

fn trial_label(run_id: usize) -> String {
    format!("run_{:03}", run_id)
}

/// One trial end to end. Every fault is folded into the outcome: no trial
/// may terminate the session.
async fn run_trial<C: ModelClient>(
    client: &C,
    task: Arc<dyn Task>,
    agent_config: &AgentConfig,
    config: &RunConfig,
    session_dir: &Path,
    run_id: usize,
) -> TrialOutcome {
    match run_trial_inner(client, task, agent_config, config, session_dir, run_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(run_id, error = %format!("{:#}", e), "trial harness fault");
            TrialOutcome {
                run_id,
                total: config.trials,
                passed: false,
                message: format!("trial harness fault: {:#}", e),
                answer: None,
                trial_dir: session_dir.join(trial_label(run_id)),
            }
        }
    }
}

async fn run_trial_inner<C: ModelClient>(
    client: &C,
    task: Arc<dyn Task>,
    agent_config: &AgentConfig,
    config: &RunConfig,
    session_dir: &Path,
    run_id: usize,
) -> Result<TrialOutcome> {
    info!(run_id, total = config.trials, "trial start");
    let registry = ToolRegistry::standard(config.expression_timeout);
    let engine = ConversationEngine::new(client, agent_config.clone());

    // An engine fault aborts this trial's conversation only; the grader
    // still runs and records the automatic fail.
    let answer = match engine.run(&task.prompt(), &registry).await {
        Ok(answer) => answer,
        Err(e) => {
            error!(run_id, error = %e, "conversation failed; grading with no submission");
            None
        }
    };
    let submission: Option<String> = answer.as_ref().map(|value| match value {
        Value::String(code) => code.clone(),
        other => other.to_string(),
    });

    let trial_dir = session_dir.join(trial_label(run_id));
    ensure_dir(&trial_dir)?;
    let report = {
        let task = task.clone();
        let grade_dir = trial_dir.clone();
        let submission = submission.clone();
        let verbose = config.verbose;
        tokio::task::spawn_blocking(move || task.grade(&grade_dir, submission.as_deref(), verbose))
            .await
            .map_err(|e| anyhow!("grading panicked: {}", e))?
    };

    let final_dir = finalize_trial_dir(&trial_dir, run_id, report.passed, &report.message)?;
    if report.passed {
        info!(run_id, "trial PASSED");
    } else {
        info!(run_id, message = %report.message, "trial FAILED");
    }
    Ok(TrialOutcome {
        run_id,
        total: config.trials,
        passed: report.passed,
        message: report.message,
        answer: submission,
        trial_dir: final_dir,
    })
}

/// Renames the trial directory to encode the outcome and drops the
/// diagnostic into `results.txt`. Idempotent for a re-run of the same trial
/// id: a stale target of the same name is replaced.
fn finalize_trial_dir(
    trial_dir: &Path,
    run_id: usize,
    passed: bool,
    message: &str,
) -> Result<PathBuf> {
    let suffix = if passed { "success" } else { "failure" };
    let parent = trial_dir
        .parent()
        .ok_or_else(|| anyhow!("trial dir {} has no parent", trial_dir.display()))?;
    let target = parent.join(format!("{}_{}", trial_label(run_id), suffix));
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::rename(trial_dir, &target)?;
    fs::write(target.join("results.txt"), message)?;
    Ok(target)
}
