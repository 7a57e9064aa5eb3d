use chrono::Utc;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::artifact::{clear_result_artifact, read_result_artifact, ResultArtifact};
use crate::config::StartupConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::exec::ScenarioLauncher;
use crate::interrupt::InterruptFlag;
use crate::patch::ConfigPatcher;
use crate::space::ParameterSpace;
use crate::supervisor::SimulatorControl;
use crate::trial_log::{TrialLog, TrialRecord};

pub const FAILED_STATUS: &str = "simulation_failed";

/// Maps a result artifact to the scalar the search minimizes.
pub type LossFn = fn(&ResultArtifact) -> f64;

/// Closer calls score lower.
pub fn min_ttc_loss(artifact: &ResultArtifact) -> f64 {
    artifact.min_ttc
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub route_id: String,
    pub result_artifact: PathBuf,
    pub execution_timeout: Duration,
    pub max_attempts: u32,
    pub restart_period: usize,
    pub failure_loss: f64,
}

impl RunnerSettings {
    pub fn from_config(config: &StartupConfig, route_id: &str, workdir: &std::path::Path) -> Self {
        let h = &config.harness;
        let result_artifact = if h.result_artifact.is_absolute() {
            h.result_artifact.clone()
        } else {
            workdir.join(&h.result_artifact)
        };
        Self {
            route_id: route_id.to_string(),
            result_artifact,
            execution_timeout: Duration::from_secs(h.execution_timeout_secs),
            max_attempts: h.max_attempts.max(1),
            restart_period: h.restart_period.max(1),
            failure_loss: h.failure_loss,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub trial_id: String,
    pub loss: f64,
    pub min_ttc: f64,
    pub collision_flag: bool,
    pub collision_status: String,
    pub distance: f64,
    pub attempts: u32,
    /// Attempts ran out; the values come from a last-chance read or are the
    /// failure sentinel.
    pub degraded: bool,
}

pub fn new_trial_id() -> String {
    let now = Utc::now().timestamp_micros() as f64 / 1e6;
    let salt: u32 = rand::thread_rng().gen_range(0..=1000);
    format!("{:.6}-{}", now, salt)
}

/// Evaluates one candidate vector end to end against the simulator and keeps
/// the log of finished trials.
pub struct TrialRunner<S, L> {
    space: ParameterSpace,
    patcher: ConfigPatcher,
    simulator: S,
    launcher: L,
    settings: RunnerSettings,
    interrupt: InterruptFlag,
    loss_fn: LossFn,
    log: TrialLog,
}

impl<S: SimulatorControl, L: ScenarioLauncher> TrialRunner<S, L> {
    pub fn new(
        space: ParameterSpace,
        patcher: ConfigPatcher,
        simulator: S,
        launcher: L,
        settings: RunnerSettings,
        interrupt: InterruptFlag,
    ) -> Self {
        let log = TrialLog::new(&space);
        Self {
            space,
            patcher,
            simulator,
            launcher,
            settings,
            interrupt,
            loss_fn: min_ttc_loss,
            log,
        }
    }

    pub fn with_loss(mut self, loss_fn: LossFn) -> Self {
        self.loss_fn = loss_fn;
        self
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn log(&self) -> &TrialLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut TrialLog {
        &mut self.log
    }

    pub fn simulator(&self) -> &S {
        &self.simulator
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn verify_patch_targets(&self) -> HarnessResult<()> {
        let names: Vec<&str> = self.space.names().collect();
        self.patcher.verify(&names)
    }

    pub fn teardown(&mut self) {
        self.simulator.kill_all();
    }

    /// Only setup-class errors (dimension, patch target, I/O on the route
    /// file) and `Interrupted` escape; simulator failures end in a number.
    pub fn evaluate(&mut self, vector: &[f64]) -> HarnessResult<TrialOutcome> {
        self.space.check_dim(vector)?;
        self.interrupt.check()?;
        let trial_id = new_trial_id();
        let completed = self.log.len();
        info!(trial_id = %trial_id, completed, "trial start");

        if completed % self.settings.restart_period == 0 {
            info!(completed, "periodic simulator restart");
            self.restart_once()?;
        }
        if !self.simulator.is_healthy() {
            self.restart_until_healthy()?;
        }

        let pairs: Vec<(&str, f64)> = self.space.names().zip(vector.iter().copied()).collect();
        self.patcher.patch_many(&pairs)?;

        let mut attempt: u32 = 1;
        let fresh = loop {
            let run = clear_result_artifact(&self.settings.result_artifact)
                .and_then(|()| {
                    self.launcher
                        .execute(&self.settings.route_id, self.settings.execution_timeout)
                })
                .and_then(|()| read_result_artifact(&self.settings.result_artifact));
            match run {
                Ok(artifact) => break Some(artifact),
                // I/O here (spawn, artifact delete/read) is a failed attempt too
                Err(e) if e.is_attempt_failure() || matches!(e, HarnessError::Io(_)) => {
                    warn!(
                        trial_id = %trial_id,
                        attempt,
                        max_attempts = self.settings.max_attempts,
                        "attempt failed: {}",
                        e
                    );
                    if attempt >= self.settings.max_attempts {
                        break None;
                    }
                    attempt += 1;
                    self.restart_until_healthy()?;
                }
                Err(e) => return Err(e),
            }
        };

        let (artifact, degraded) = match fresh {
            Some(artifact) => (Some(artifact), false),
            None => {
                let exhausted = HarnessError::SimulationExhausted { attempts: attempt };
                warn!(trial_id = %trial_id, "{}; tearing simulator down", exhausted);
                self.simulator.kill_all();
                (read_result_artifact(&self.settings.result_artifact).ok(), true)
            }
        };

        let outcome = match artifact {
            Some(a) => TrialOutcome {
                trial_id,
                loss: (self.loss_fn)(&a),
                min_ttc: a.min_ttc,
                collision_flag: a.collision_flag,
                collision_status: a.collision_status,
                distance: a.distance,
                attempts: attempt,
                degraded,
            },
            None => TrialOutcome {
                trial_id,
                loss: self.settings.failure_loss,
                min_ttc: self.settings.failure_loss,
                collision_flag: false,
                collision_status: FAILED_STATUS.to_string(),
                distance: 0.0,
                attempts: attempt,
                degraded,
            },
        };

        self.log.append(TrialRecord {
            trial_id: outcome.trial_id.clone(),
            params: vector.to_vec(),
            loss: outcome.loss,
            min_ttc: outcome.min_ttc,
            collision_flag: outcome.collision_flag,
            collision_status: outcome.collision_status.clone(),
            distance: outcome.distance,
            attempts: outcome.attempts,
            degraded: outcome.degraded,
        })?;
        info!(
            trial_id = %outcome.trial_id,
            loss = outcome.loss,
            attempts = outcome.attempts,
            degraded = outcome.degraded,
            "trial finished"
        );
        Ok(outcome)
    }

    fn restart_once(&mut self) -> HarnessResult<()> {
        match self.simulator.restart() {
            Ok(()) => Ok(()),
            Err(HarnessError::Interrupted) => Err(HarnessError::Interrupted),
            Err(e) => {
                warn!("simulator restart failed: {}", e);
                Ok(())
            }
        }
    }

    /// Restarts until the process table shows the simulator. Unbounded except
    /// by the interrupt flag.
    fn restart_until_healthy(&mut self) -> HarnessResult<()> {
        let mut tries: u64 = 0;
        loop {
            self.interrupt.check()?;
            tries += 1;
            self.restart_once()?;
            if self.simulator.is_healthy() {
                return Ok(());
            }
            warn!(tries, "simulator not healthy after restart");
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::fsutil::scratch_dir;
    use crate::space::ParamBound;
    use crate::supervisor::SimulatorState;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;

    pub const ROUTES: &str = r#"<routes>
  <route id="2" town="Town05">
    <scenarios>
      <scenario name="cut_in_two" type="FrontCutInWithTwoNPC">
        <absolute_v value="1.0"/>
        <relative_p_1 value="1.0"/>
        <relative_v_1 value="1.0"/>
        <relative_p_2 value="-1.0"/>
        <relative_v_2 value="1.0"/>
      </scenario>
    </scenarios>
  </route>
</routes>
"#;

    #[derive(Debug, Default)]
    pub struct FakeSimulator {
        pub events: Vec<&'static str>,
        pub restarts: usize,
        pub kills: usize,
        pub unhealthy_checks: usize,
        pub state: Option<SimulatorState>,
    }

    impl SimulatorControl for FakeSimulator {
        fn restart(&mut self) -> HarnessResult<()> {
            self.events.push("restart");
            self.restarts += 1;
            self.state = Some(SimulatorState::Up);
            Ok(())
        }

        fn is_healthy(&mut self) -> bool {
            self.events.push("check");
            if self.unhealthy_checks > 0 {
                self.unhealthy_checks -= 1;
                return false;
            }
            true
        }

        fn kill_all(&mut self) {
            self.events.push("kill_all");
            self.kills += 1;
            self.state = Some(SimulatorState::Down);
        }

        fn state(&self) -> SimulatorState {
            self.state.unwrap_or(SimulatorState::Down)
        }
    }

    #[derive(Debug, Clone)]
    pub enum FakeRun {
        Finish { min_ttc: f64 },
        Timeout,
        NoArtifact,
        SpawnFails,
        Interrupt,
    }

    pub struct FakeLauncher {
        pub artifact: PathBuf,
        pub route_file: PathBuf,
        pub script: VecDeque<FakeRun>,
        pub fallback: FakeRun,
        pub calls: usize,
        pub seen_routes: Vec<String>,
        pub interrupt: InterruptFlag,
    }

    impl ScenarioLauncher for FakeLauncher {
        fn execute(&mut self, route_id: &str, deadline: Duration) -> HarnessResult<()> {
            self.calls += 1;
            self.seen_routes
                .push(fs::read_to_string(&self.route_file).expect("route file"));
            let _ = route_id;
            match self.script.pop_front().unwrap_or_else(|| self.fallback.clone()) {
                FakeRun::Finish { min_ttc } => {
                    let body = serde_json::json!({
                        "collision_flag": min_ttc == 0.0,
                        "min_ttc": min_ttc,
                        "collision_status": if min_ttc == 0.0 { "collided" } else { "none" },
                        "distance": 20.0,
                    });
                    fs::write(&self.artifact, body.to_string()).expect("artifact");
                    Ok(())
                }
                FakeRun::Timeout => Err(HarnessError::SimulationTimeout(deadline)),
                FakeRun::NoArtifact => Ok(()),
                FakeRun::SpawnFails => Err(HarnessError::Io(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "fork: Resource temporarily unavailable",
                ))),
                FakeRun::Interrupt => {
                    self.interrupt.raise();
                    Err(HarnessError::Interrupted)
                }
            }
        }
    }

    pub fn cut_in_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            ParamBound::new("absolute_v", 0.0, 21.214),
            ParamBound::new("relative_p_1", 0.238, 69.291),
            ParamBound::new("relative_v_1", -8.163, 9.373),
            ParamBound::new("relative_p_2", -89.708, -0.005),
            ParamBound::new("relative_v_2", -10.132, 13.686),
        ])
        .expect("space")
    }

    pub struct Fixture {
        pub root: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    pub fn fake_runner(
        label: &str,
        script: Vec<FakeRun>,
        fallback: FakeRun,
    ) -> (Fixture, TrialRunner<FakeSimulator, FakeLauncher>) {
        let root = scratch_dir(label);
        let route_file = root.join("routes.xml");
        fs::write(&route_file, ROUTES).expect("routes");
        let artifact = root.join("epoch_result.json");
        let interrupt = InterruptFlag::new();
        let settings = RunnerSettings {
            route_id: "2".to_string(),
            result_artifact: artifact.clone(),
            execution_timeout: Duration::from_secs(300),
            max_attempts: 5,
            restart_period: 10,
            failure_loss: 1.0e9,
        };
        let launcher = FakeLauncher {
            artifact,
            route_file: route_file.clone(),
            script: script.into(),
            fallback,
            calls: 0,
            seen_routes: Vec::new(),
            interrupt: interrupt.clone(),
        };
        let runner = TrialRunner::new(
            cut_in_space(),
            ConfigPatcher::new(&route_file, "2"),
            FakeSimulator::default(),
            launcher,
            settings,
            interrupt,
        );
        (Fixture { root }, runner)
    }

    pub fn write_stale_artifact(path: &Path, min_ttc: f64) {
        let body = serde_json::json!({
            "collision_flag": false,
            "min_ttc": min_ttc,
            "collision_status": "none",
            "distance": 99.0,
        });
        fs::write(path, body.to_string()).expect("stale artifact");
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;

    const X: [f64; 5] = [5.0, 10.0, 2.0, -10.0, 5.0];

    #[test]
    fn successful_trial_patches_route_and_logs_one_record() {
        let (_fx, mut runner) = fake_runner("runner_ok", vec![], FakeRun::Finish { min_ttc: 1.5 });
        let outcome = runner.evaluate(&X).expect("evaluate");
        assert_eq!(outcome.loss, 1.5);
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.degraded);
        assert_eq!(runner.log().len(), 1);
        assert_eq!(runner.log().records()[0].params, X.to_vec());

        let seen = &runner.launcher().seen_routes[0];
        assert!(seen.contains(r#"<absolute_v value="5"/>"#), "{}", seen);
        assert!(seen.contains(r#"<relative_p_2 value="-10"/>"#), "{}", seen);
    }

    #[test]
    fn periodic_restart_precedes_health_check() {
        let (_fx, mut runner) =
            fake_runner("runner_cadence", vec![], FakeRun::Finish { min_ttc: 2.0 });
        runner.settings.restart_period = 3;
        for _ in 0..7 {
            runner.evaluate(&X).expect("evaluate");
        }
        assert_eq!(runner.simulator().restarts, 3);

        // trials 0, 3 and 6 start with restart + check; the others check only
        let events = &runner.simulator().events;
        let expected: Vec<&str> = vec![
            "restart", "check", "check", "check", "restart", "check", "check", "check", "restart",
            "check",
        ];
        assert_eq!(events, &expected);
    }

    #[test]
    fn unhealthy_simulator_is_restarted_until_healthy() {
        let (_fx, mut runner) =
            fake_runner("runner_health", vec![], FakeRun::Finish { min_ttc: 2.0 });
        runner.settings.restart_period = 100;
        runner.evaluate(&X).expect("first");
        runner.simulator.unhealthy_checks = 3;
        runner.simulator.restarts = 0;
        runner.evaluate(&X).expect("second");
        assert_eq!(runner.simulator().restarts, 3);
    }

    #[test]
    fn permanent_timeouts_stop_at_max_attempts_and_return_sentinel() {
        let (_fx, mut runner) = fake_runner("runner_exhaust", vec![], FakeRun::Timeout);
        let outcome = runner.evaluate(&X).expect("still a number");
        assert_eq!(runner.launcher().calls, 5);
        assert_eq!(outcome.attempts, 5);
        assert!(outcome.degraded);
        assert_eq!(outcome.loss, 1.0e9);
        assert_eq!(outcome.collision_status, FAILED_STATUS);
        assert_eq!(runner.simulator().kills, 1);
        assert_eq!(runner.simulator().events.last(), Some(&"kill_all"));
        // initial periodic restart + one restart between each failed attempt
        assert_eq!(runner.simulator().restarts, 1 + 4);
        assert_eq!(runner.log().len(), 1);
    }

    #[test]
    fn stale_artifact_is_never_read_as_fresh() {
        let (_fx, mut runner) = fake_runner("runner_stale", vec![], FakeRun::Timeout);
        write_stale_artifact(&runner.settings().result_artifact.clone(), 0.01);
        let outcome = runner.evaluate(&X).expect("evaluate");
        assert_eq!(outcome.loss, 1.0e9);
    }

    #[test]
    fn recovers_after_a_timeout_and_a_missing_artifact() {
        let (_fx, mut runner) = fake_runner(
            "runner_recover",
            vec![FakeRun::Timeout, FakeRun::NoArtifact],
            FakeRun::Finish { min_ttc: 0.0 },
        );
        let outcome = runner.evaluate(&X).expect("evaluate");
        assert_eq!(outcome.attempts, 3);
        assert!(!outcome.degraded);
        assert!(outcome.collision_flag);
        assert_eq!(outcome.loss, 0.0);
        assert_eq!(runner.simulator().kills, 0);
    }

    #[test]
    fn failed_spawn_is_retried_as_an_attempt() {
        let (_fx, mut runner) = fake_runner(
            "runner_spawn",
            vec![FakeRun::SpawnFails],
            FakeRun::Finish { min_ttc: 1.0 },
        );
        let outcome = runner.evaluate(&X).expect("spawn failure stays inside evaluate");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.loss, 1.0);
        assert!(!outcome.degraded);
        assert_eq!(runner.launcher().calls, 2);
        // periodic restart before trial 0, then one restart after the failed spawn
        assert_eq!(runner.simulator().restarts, 2);
    }

    #[test]
    fn unreadable_artifact_path_ends_in_the_sentinel() {
        let (_fx, mut runner) = fake_runner("runner_artifact_dir", vec![], FakeRun::NoArtifact);
        // a non-empty directory where the artifact belongs cannot be deleted or parsed
        let artifact = runner.settings().result_artifact.clone();
        std::fs::create_dir_all(artifact.join("held")).expect("dir in the way");
        let outcome = runner.evaluate(&X).expect("i/o failures stay inside evaluate");
        assert_eq!(runner.launcher().calls, 0);
        assert_eq!(outcome.attempts, 5);
        assert!(outcome.degraded);
        assert_eq!(outcome.loss, 1.0e9);
        assert_eq!(runner.log().len(), 1);
    }

    #[test]
    fn interrupt_mid_trial_writes_no_record() {
        let (_fx, mut runner) = fake_runner(
            "runner_interrupt",
            vec![FakeRun::Finish { min_ttc: 3.0 }, FakeRun::Interrupt],
            FakeRun::Finish { min_ttc: 3.0 },
        );
        runner.evaluate(&X).expect("first trial");
        let err = runner.evaluate(&X).expect_err("interrupted");
        assert!(matches!(err, HarnessError::Interrupted));
        assert_eq!(runner.log().len(), 1);
        assert!(matches!(runner.evaluate(&X), Err(HarnessError::Interrupted)));
    }

    #[test]
    fn wrong_dimension_is_rejected_before_touching_the_simulator() {
        let (_fx, mut runner) = fake_runner("runner_dim", vec![], FakeRun::Finish { min_ttc: 1.0 });
        assert!(matches!(
            runner.evaluate(&[1.0, 2.0]),
            Err(HarnessError::DimensionMismatch { expected: 5, actual: 2 })
        ));
        assert!(runner.simulator().events.is_empty());
    }

    #[test]
    fn custom_loss_is_applied() {
        fn negated(a: &ResultArtifact) -> f64 {
            -a.distance
        }
        let (_fx, runner) = fake_runner("runner_loss", vec![], FakeRun::Finish { min_ttc: 1.0 });
        let mut runner = runner.with_loss(negated);
        let outcome = runner.evaluate(&X).expect("evaluate");
        assert_eq!(outcome.loss, -20.0);
        assert_eq!(outcome.min_ttc, 1.0);
    }

    #[test]
    fn trial_ids_are_timestamp_and_salt() {
        let id = new_trial_id();
        let (ts, salt) = id.split_once('-').expect("dash");
        assert!(ts.parse::<f64>().expect("timestamp") > 1.0e9);
        assert!(salt.parse::<u32>().expect("salt") <= 1000);
    }
}
