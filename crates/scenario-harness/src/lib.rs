//! Black-box search over simulator scenario parameters.
//!
//! A [`TrialRunner`] turns one candidate vector into one loss value: it patches
//! the route file, keeps the simulator alive through [`SimulatorControl`], runs
//! the execution script through [`ScenarioLauncher`] and reads the result
//! artifact. A [`SearchDriver`] wraps a [`SearchStrategy`] with seeding, timing
//! and persistence of the [`TrialLog`].

pub mod artifact;
pub mod config;
pub mod driver;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod interrupt;
pub mod patch;
pub mod runner;
pub mod space;
pub mod strategy;
pub mod supervisor;
pub mod trial_log;

pub use artifact::ResultArtifact;
pub use config::{AgentKind, ScenarioDef, StartupConfig};
pub use driver::{build_runner, output_dir, ProcessRunner, RunStatus, RunSummary, SearchDriver};
pub use error::{HarnessError, HarnessResult};
pub use exec::{ScenarioLauncher, ScriptLauncher};
pub use interrupt::InterruptFlag;
pub use patch::ConfigPatcher;
pub use runner::{TrialOutcome, TrialRunner};
pub use space::{ParamBound, ParameterSpace};
pub use strategy::{Ga, Pso, RandomSearch, Replay, SearchStrategy, StrategyReport};
pub use supervisor::{ProcessSupervisor, SimulatorControl, SimulatorState};
pub use trial_log::{TrialLog, TrialRecord};
