use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{HarnessError, HarnessResult};
use crate::space::{ParamBound, ParameterSpace};

fn with_path(path: &Path, err: HarnessError) -> HarnessError {
    match err {
        HarnessError::Config(msg) => HarnessError::Config(format!("{}: {}", path.display(), msg)),
        other => HarnessError::Config(format!("{}: {}", path.display(), other)),
    }
}

/// Driving agent the execution script launches next to the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Ba,
    Interfuser,
    Tfpp,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Ba, AgentKind::Interfuser, AgentKind::Tfpp];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Ba => "ba",
            AgentKind::Interfuser => "interfuser",
            AgentKind::Tfpp => "tfpp",
        }
    }

    fn default_script(&self) -> PathBuf {
        PathBuf::from("carla_simulate").join(format!("simulate_{}.sh", self.as_str()))
    }

    fn default_process_pattern(&self) -> &'static str {
        match self {
            AgentKind::Ba => "simulate_ba",
            AgentKind::Interfuser => "interfuser",
            AgentKind::Tfpp => "tfpp",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| HarnessError::config(format!("unknown agent: {}", s)))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvPaths {
    #[serde(rename = "CARLA_ROOT")]
    pub carla_root: PathBuf,
    #[serde(rename = "LEADERBOARD_ROOT")]
    pub leaderboard_root: PathBuf,
    #[serde(rename = "ROUTE_FILE")]
    pub route_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentOverride {
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub process_pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub execution_timeout_secs: u64,
    pub max_attempts: u32,
    pub restart_period: usize,
    pub settle_delay_secs: u64,
    pub reap_delay_secs: u64,
    pub kill_repeats: u32,
    pub display_fallback: String,
    pub resolution: [u32; 2],
    pub simulator_process: String,
    pub simulator_launcher: String,
    pub evaluator_process: String,
    pub agent_command: Vec<String>,
    pub result_artifact: PathBuf,
    pub failure_loss: f64,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 300,
            max_attempts: 5,
            restart_period: 10,
            settle_delay_secs: 10,
            reap_delay_secs: 10,
            kill_repeats: 3,
            display_fallback: ":10.0".to_string(),
            resolution: [400, 300],
            simulator_process: "CarlaUE4".to_string(),
            simulator_launcher: "CarlaUE4.sh".to_string(),
            evaluator_process: "leaderboard_evaluator".to_string(),
            agent_command: Vec::new(),
            result_artifact: PathBuf::from("epoch_result.json"),
            failure_loss: 1.0e9,
        }
    }
}

/// Launch command and kill pattern of one agent flavor.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchVariant {
    pub agent: AgentKind,
    pub script: PathBuf,
    pub process_pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct StartupDoc {
    env: EnvPaths,
    #[serde(default)]
    agents: BTreeMap<String, AgentOverride>,
    #[serde(default)]
    harness: HarnessSettings,
}

/// Static configuration read once at startup.
#[derive(Debug, Clone)]
pub struct StartupConfig {
    pub env: EnvPaths,
    pub agents: BTreeMap<String, AgentOverride>,
    pub harness: HarnessSettings,
    base_dir: PathBuf,
}

impl StartupConfig {
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_json_str(&raw, &base_dir).map_err(|e| with_path(path, e))
    }

    pub fn from_json_str(raw: &str, base_dir: &Path) -> HarnessResult<Self> {
        let doc: StartupDoc = serde_json::from_str(raw)
            .map_err(|e| HarnessError::config(format!("invalid startup config: {}", e)))?;
        for key in doc.agents.keys() {
            key.parse::<AgentKind>()?;
        }
        let config = Self {
            env: doc.env,
            agents: doc.agents,
            harness: doc.harness,
            base_dir: base_dir.to_path_buf(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> HarnessResult<()> {
        let h = &self.harness;
        if h.max_attempts == 0 {
            return Err(HarnessError::config("harness.max_attempts must be >= 1"));
        }
        if h.restart_period == 0 {
            return Err(HarnessError::config("harness.restart_period must be >= 1"));
        }
        if h.execution_timeout_secs == 0 {
            return Err(HarnessError::config(
                "harness.execution_timeout_secs must be >= 1",
            ));
        }
        if !h.failure_loss.is_finite() {
            return Err(HarnessError::config("harness.failure_loss must be finite"));
        }
        if self.env.route_file.trim().is_empty() {
            return Err(HarnessError::config("env.ROUTE_FILE is empty"));
        }
        if h.simulator_process.trim().is_empty() {
            return Err(HarnessError::config("harness.simulator_process is empty"));
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn route_file(&self) -> PathBuf {
        self.env
            .leaderboard_root
            .join("data")
            .join(&self.env.route_file)
    }

    pub fn simulator_launcher(&self) -> PathBuf {
        self.env.carla_root.join(&self.harness.simulator_launcher)
    }

    pub fn launch_variant(&self, agent: AgentKind) -> LaunchVariant {
        let overrides = self.agents.get(agent.as_str());
        let script = overrides
            .and_then(|o| o.script.clone())
            .unwrap_or_else(|| agent.default_script());
        let script = if script.is_absolute() {
            script
        } else {
            self.base_dir.join(script)
        };
        let process_pattern = overrides
            .and_then(|o| o.process_pattern.clone())
            .unwrap_or_else(|| agent.default_process_pattern().to_string());
        LaunchVariant {
            agent,
            script,
            process_pattern,
        }
    }

    pub fn to_json(&self, agent: AgentKind) -> Value {
        let variant = self.launch_variant(agent);
        json!({
            "carla_root": self.env.carla_root.display().to_string(),
            "leaderboard_root": self.env.leaderboard_root.display().to_string(),
            "route_file": self.route_file().display().to_string(),
            "simulator_launcher": self.simulator_launcher().display().to_string(),
            "agent": agent.as_str(),
            "script": variant.script.display().to_string(),
            "process_pattern": variant.process_pattern,
            "harness": serde_json::to_value(&self.harness).unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RouteIdRepr {
    Text(String),
    Number(u64),
}

impl From<RouteIdRepr> for String {
    fn from(value: RouteIdRepr) -> Self {
        match value {
            RouteIdRepr::Text(s) => s,
            RouteIdRepr::Number(n) => n.to_string(),
        }
    }
}

fn route_id_from_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    RouteIdRepr::deserialize(deserializer).map(String::from)
}

/// A scenario file: which route to patch, the parameter bounds in patch
/// order, and optional literal vectors for replay.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioDef {
    pub name: String,
    #[serde(deserialize_with = "route_id_from_scalar")]
    pub route_id: String,
    pub params: Vec<ParamBound>,
    #[serde(default)]
    pub replay: Vec<Vec<f64>>,
}

impl ScenarioDef {
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw).map_err(|e| with_path(path, e))
    }

    pub fn from_yaml_str(raw: &str) -> HarnessResult<Self> {
        let def: ScenarioDef = serde_yaml::from_str(raw)?;
        if def.name.trim().is_empty() {
            return Err(HarnessError::config("scenario name is empty"));
        }
        Ok(def)
    }

    pub fn space(&self) -> HarnessResult<ParameterSpace> {
        ParameterSpace::new(self.params.clone())
    }
}
