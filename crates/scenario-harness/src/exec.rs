use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::interrupt::InterruptFlag;
use crate::supervisor::reap_child;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one simulation for a route against the currently running simulator.
pub trait ScenarioLauncher {
    /// Blocks until the run exits (`Ok`), the deadline passes
    /// (`SimulationTimeout`) or the interrupt flag is raised (`Interrupted`).
    /// The child is always gone when this returns.
    fn execute(&mut self, route_id: &str, deadline: Duration) -> HarnessResult<()>;
}

/// `<shell> <script> <route_id>` in the working directory where the result
/// artifact is written.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    shell: PathBuf,
    script: PathBuf,
    workdir: PathBuf,
    interrupt: InterruptFlag,
}

impl ScriptLauncher {
    pub fn new(
        script: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            script: script.into(),
            workdir: workdir.into(),
            interrupt,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl ScenarioLauncher for ScriptLauncher {
    fn execute(&mut self, route_id: &str, deadline: Duration) -> HarnessResult<()> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(&self.script).arg(route_id);
        cmd.current_dir(&self.workdir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        loop {
            if let Some(status) = child.try_wait()? {
                debug!(
                    route_id,
                    status = %status,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "simulation script exited"
                );
                return Ok(());
            }
            if self.interrupt.is_raised() {
                reap_child(child);
                return Err(HarnessError::Interrupted);
            }
            if started.elapsed() >= deadline {
                warn!(route_id, deadline_secs = deadline.as_secs(), "simulation script timed out");
                reap_child(child);
                return Err(HarnessError::SimulationTimeout(deadline));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
