use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::{AgentKind, ScenarioDef, StartupConfig};
use crate::error::{HarnessError, HarnessResult};
use crate::exec::{ScenarioLauncher, ScriptLauncher};
use crate::fsutil::{atomic_write_json_pretty, ensure_dir};
use crate::interrupt::InterruptFlag;
use crate::patch::ConfigPatcher;
use crate::runner::{RunnerSettings, TrialRunner};
use crate::strategy::{SearchStrategy, StrategyReport};
use crate::supervisor::{ProcessSupervisor, SimulatorControl, SupervisorSettings};

pub type ProcessRunner = TrialRunner<ProcessSupervisor, ScriptLauncher>;

/// Wires the real simulator supervisor and execution script for one agent.
/// The script runs in the configuration file's directory, where the result
/// artifact is expected unless configured as an absolute path.
pub fn build_runner(
    config: &StartupConfig,
    scenario: &ScenarioDef,
    agent: AgentKind,
    render: bool,
    interrupt: InterruptFlag,
) -> HarnessResult<ProcessRunner> {
    let space = scenario.space()?;
    let variant = config.launch_variant(agent);
    let workdir = config.base_dir().to_path_buf();
    let supervisor = ProcessSupervisor::new(
        SupervisorSettings::from_config(config, &variant, render),
        interrupt.clone(),
    );
    let launcher = ScriptLauncher::new(&variant.script, &workdir, interrupt.clone());
    let settings = RunnerSettings::from_config(config, &scenario.route_id, &workdir);
    Ok(TrialRunner::new(
        space,
        ConfigPatcher::new(config.route_file(), &scenario.route_id),
        supervisor,
        launcher,
        settings,
        interrupt,
    ))
}

/// `<root>/<name>/<agent>/<MMDDHHMM>_<tag>_<seed>`
pub fn output_dir(
    root: &Path,
    scenario: &str,
    agent: AgentKind,
    tag: &str,
    seed: u64,
    at: DateTime<Local>,
) -> PathBuf {
    root.join(scenario)
        .join(agent.as_str())
        .join(format!("{}_{}_{}", at.format("%m%d%H%M"), tag, seed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub method: String,
    pub status: RunStatus,
    pub trials: usize,
    pub elapsed_secs: f64,
    pub output_dir: PathBuf,
    pub best: Option<(Vec<f64>, f64)>,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn to_json(&self) -> Value {
        json!({
            "method": self.method,
            "status": self.status.as_str(),
            "trials": self.trials,
            "elapsed_secs": self.elapsed_secs,
            "output_dir": self.output_dir.display().to_string(),
            "best_x": self.best.as_ref().map(|(x, _)| x.clone()),
            "best_y": self.best.as_ref().map(|(_, y)| *y),
            "error": self.error,
        })
    }
}

#[derive(Debug, Clone)]
struct ManifestFields {
    method: String,
    seed: u64,
    route_id: String,
    started_at: DateTime<Utc>,
    output_dir: PathBuf,
}

fn write_run_manifest(
    fields: &ManifestFields,
    status: &str,
    trials: usize,
    elapsed_secs: Option<f64>,
    error: Option<&str>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "run_manifest_v1",
        "method": fields.method,
        "seed": fields.seed,
        "route_id": fields.route_id,
        "started_at": fields.started_at.to_rfc3339(),
        "updated_at": Utc::now().to_rfc3339(),
        "elapsed_secs": elapsed_secs,
        "status": status,
        "trials": trials,
        "output_dir": fields.output_dir.display().to_string(),
        "error": error,
    });
    atomic_write_json_pretty(&fields.output_dir.join("run_manifest.json"), &payload)
}

/// Leaves a `failed` manifest behind if the run unwinds before finalizing.
struct RunManifestGuard {
    fields: ManifestFields,
    done: bool,
}

impl RunManifestGuard {
    fn begin(fields: ManifestFields) -> Result<Self> {
        write_run_manifest(&fields, "running", 0, None, None)?;
        Ok(Self {
            fields,
            done: false,
        })
    }

    fn complete(
        &mut self,
        status: RunStatus,
        trials: usize,
        elapsed_secs: f64,
        error: Option<&str>,
    ) -> Result<()> {
        write_run_manifest(&self.fields, status.as_str(), trials, Some(elapsed_secs), error)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunManifestGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_manifest(
                &self.fields,
                RunStatus::Failed.as_str(),
                0,
                None,
                Some("aborted"),
            );
        }
    }
}

/// Runs search strategies against one trial runner with seeding, timing and
/// persistence on every exit path.
pub struct SearchDriver<S, L> {
    runner: TrialRunner<S, L>,
    seed: u64,
    save_data: bool,
}

impl<S: SimulatorControl, L: ScenarioLauncher> SearchDriver<S, L> {
    pub fn new(runner: TrialRunner<S, L>, seed: u64, save_data: bool) -> Self {
        Self {
            runner,
            seed,
            save_data,
        }
    }

    pub fn runner(&self) -> &TrialRunner<S, L> {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut TrialRunner<S, L> {
        &mut self.runner
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fails before any simulator work if a parameter has no patch target on
    /// the configured route.
    pub fn setup(&self) -> HarnessResult<()> {
        self.runner.verify_patch_targets()?;
        info!(
            route_id = %self.runner.settings().route_id,
            dim = self.runner.space().dim(),
            "patch targets verified"
        );
        Ok(())
    }

    pub fn run(&mut self, strategy: &mut dyn SearchStrategy, out_dir: &Path) -> Result<RunSummary> {
        ensure_dir(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
        let method = strategy.method().to_string();
        let mut guard = RunManifestGuard::begin(ManifestFields {
            method: method.clone(),
            seed: self.seed,
            route_id: self.runner.settings().route_id.clone(),
            started_at: Utc::now(),
            output_dir: out_dir.to_path_buf(),
        })?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.runner.log_mut().clear();
        info!(
            method = %method,
            seed = self.seed,
            output_dir = %out_dir.display(),
            "search run start"
        );

        let started = Instant::now();
        let space = self.runner.space().clone();
        let outcome = {
            let runner = &mut self.runner;
            let mut objective = |x: &[f64]| runner.evaluate(x).map(|o| o.loss);
            strategy.run(&space, &mut rng, &mut objective)
        };
        let elapsed_secs = started.elapsed().as_secs_f64();

        let (status, report, failure) = match outcome {
            Ok(report) => (RunStatus::Completed, report, None),
            Err(HarnessError::Interrupted) => {
                warn!(method = %method, "search interrupted; flushing completed trials");
                (RunStatus::Interrupted, None, None)
            }
            Err(e) => {
                error!(method = %method, "search failed: {}", e);
                (RunStatus::Failed, None, Some(e))
            }
        };

        let error_text = failure.as_ref().map(|e| e.to_string());
        let persisted = self.persist(
            &method,
            out_dir,
            elapsed_secs,
            report.as_ref(),
            status,
            error_text.as_deref(),
            &mut guard,
        );
        self.runner.teardown();
        persisted?;

        let summary = RunSummary {
            method,
            status,
            trials: self.runner.log().len(),
            elapsed_secs,
            output_dir: out_dir.to_path_buf(),
            best: self.best(),
            error: error_text,
        };
        info!(
            method = %summary.method,
            status = summary.status.as_str(),
            trials = summary.trials,
            elapsed_secs = summary.elapsed_secs,
            output_dir = %summary.output_dir.display(),
            "search run finished"
        );
        match failure {
            Some(e) => Err(anyhow!("search {} failed: {}", summary.method, e)),
            None => Ok(summary),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &mut self,
        method: &str,
        out_dir: &Path,
        elapsed_secs: f64,
        report: Option<&StrategyReport>,
        status: RunStatus,
        error: Option<&str>,
        guard: &mut RunManifestGuard,
    ) -> Result<()> {
        let log = self.runner.log_mut();
        log.set_elapsed(elapsed_secs);
        log.write_json(&out_dir.join("search_collector.json"))?;
        if self.save_data {
            log.write_csv(&out_dir.join(format!("search_{}.csv", method)))?;
        }
        if let Some(report) = report {
            atomic_write_json_pretty(&out_dir.join(&report.file_name), &report.body)?;
        }
        guard.complete(status, self.runner.log().len(), elapsed_secs, error)
    }

    fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.runner
            .log()
            .records()
            .iter()
            .filter(|r| r.loss.is_finite())
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
            .map(|r| (r.params.clone(), r.loss))
    }
}
