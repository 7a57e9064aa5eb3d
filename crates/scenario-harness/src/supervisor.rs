use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{LaunchVariant, StartupConfig};
use crate::error::HarnessResult;
use crate::interrupt::InterruptFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    Down,
    Starting,
    Up,
}

/// Lifecycle operations the trial runner needs from whatever owns the
/// simulator processes.
pub trait SimulatorControl {
    /// Tears everything down, then launches the simulator (and agent, if any)
    /// and waits out the settle delay.
    fn restart(&mut self) -> HarnessResult<()>;

    /// Point-in-time process-table lookup. Lookup failures read as `false`.
    fn is_healthy(&mut self) -> bool;

    /// Kills every process this harness may have started. Safe from any state.
    fn kill_all(&mut self);

    fn state(&self) -> SimulatorState;
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub launcher: PathBuf,
    pub render: bool,
    pub resolution: [u32; 2],
    pub display_fallback: String,
    pub simulator_process: String,
    pub evaluator_process: String,
    pub agent_pattern: Option<String>,
    pub agent_command: Vec<String>,
    pub settle_delay: Duration,
    pub reap_delay: Duration,
    pub kill_repeats: u32,
}

impl SupervisorSettings {
    pub fn from_config(config: &StartupConfig, variant: &LaunchVariant, render: bool) -> Self {
        let h = &config.harness;
        Self {
            launcher: config.simulator_launcher(),
            render,
            resolution: h.resolution,
            display_fallback: h.display_fallback.clone(),
            simulator_process: h.simulator_process.clone(),
            evaluator_process: h.evaluator_process.clone(),
            agent_pattern: Some(variant.process_pattern.clone()).filter(|p| !p.is_empty()),
            agent_command: h.agent_command.clone(),
            settle_delay: Duration::from_secs(h.settle_delay_secs),
            reap_delay: Duration::from_secs(h.reap_delay_secs),
            kill_repeats: h.kill_repeats.max(1),
        }
    }

    fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-ResX={}", self.resolution[0]),
            format!("-ResY={}", self.resolution[1]),
        ];
        if !self.render {
            args.push("-RenderOffScreen".to_string());
        }
        args
    }
}

/// Sole owner of the simulator and auxiliary agent processes.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    interrupt: InterruptFlag,
    simulator: Option<Child>,
    agent: Option<Child>,
    state: SimulatorState,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, interrupt: InterruptFlag) -> Self {
        Self {
            settings,
            interrupt,
            simulator: None,
            agent: None,
            state: SimulatorState::Down,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn display_value(&self) -> String {
        match std::env::var("DISPLAY") {
            Ok(v) if !v.is_empty() => v,
            _ => self.settings.display_fallback.clone(),
        }
    }

    fn spawn_simulator(&self) -> HarnessResult<Child> {
        let mut cmd = Command::new(&self.settings.launcher);
        cmd.args(self.settings.launch_args());
        cmd.env("DISPLAY", self.display_value());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        Ok(cmd.spawn()?)
    }

    fn spawn_agent(&self) -> HarnessResult<Option<Child>> {
        let Some((program, args)) = self.settings.agent_command.split_first() else {
            return Ok(None);
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("DISPLAY", self.display_value());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        Ok(Some(cmd.spawn()?))
    }

    fn reap_owned(&mut self) {
        for child in [self.agent.take(), self.simulator.take()].into_iter().flatten() {
            reap_child(child);
        }
    }
}

impl SimulatorControl for ProcessSupervisor {
    fn restart(&mut self) -> HarnessResult<()> {
        self.kill_all();
        self.interrupt.check()?;
        info!(
            launcher = %self.settings.launcher.display(),
            render = self.settings.render,
            "starting simulator"
        );
        self.simulator = Some(self.spawn_simulator()?);
        self.state = SimulatorState::Starting;
        self.agent = self.spawn_agent()?;
        self.interrupt.sleep(self.settings.settle_delay)?;
        self.state = SimulatorState::Up;
        Ok(())
    }

    fn is_healthy(&mut self) -> bool {
        let healthy = process_running(&self.settings.simulator_process);
        if !healthy && self.state == SimulatorState::Up {
            warn!(
                process = %self.settings.simulator_process,
                "simulator no longer in process table"
            );
            self.state = SimulatorState::Down;
        }
        healthy
    }

    fn kill_all(&mut self) {
        self.reap_owned();
        let repeats = self.settings.kill_repeats;
        for _ in 0..repeats {
            pkill(&self.settings.evaluator_process, true);
        }
        for _ in 0..repeats {
            pkill(&self.settings.simulator_process, false);
        }
        if let Some(pattern) = self.settings.agent_pattern.as_deref() {
            for _ in 0..repeats {
                pkill(pattern, true);
            }
        }
        thread::sleep(self.settings.reap_delay);
        self.state = SimulatorState::Down;
        debug!("simulator processes torn down");
    }

    fn state(&self) -> SimulatorState {
        self.state
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.reap_owned();
    }
}

pub(crate) fn reap_child(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Case-insensitive process-name match. Any failure to query the process table
/// is reported as "not running".
pub fn process_running(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    Command::new("pgrep")
        .arg("-i")
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn pkill(pattern: &str, full_cmdline: bool) {
    if pattern.is_empty() {
        return;
    }
    let mut cmd = Command::new("pkill");
    if full_cmdline {
        cmd.arg("-f");
    }
    cmd.arg(pattern);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    if let Err(e) = cmd.status() {
        debug!(pattern, "pkill unavailable: {}", e);
    }
}
