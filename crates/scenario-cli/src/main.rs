use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scenario_harness::{
    build_runner, output_dir, AgentKind, Ga, InterruptFlag, Pso, RandomSearch, Replay, RunStatus,
    RunSummary, ScenarioDef, SearchDriver, SearchStrategy, StartupConfig,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scenario-search",
    version = "0.3.0",
    about = "Search simulator scenario parameters for safety-critical cases"
)]
struct Cli {
    /// Startup configuration (JSON).
    config: PathBuf,
    /// Scenario definition (YAML).
    scenario: PathBuf,
    #[arg(long, value_enum, default_value = "ba", global = true)]
    agent: AgentArg,
    #[arg(long, default_value_t = 0, global = true)]
    seed: u64,
    #[arg(long, default_value = "output", global = true)]
    output_root: PathBuf,
    #[arg(long, global = true)]
    no_render: bool,
    #[arg(long, global = true)]
    no_save_data: bool,
    #[arg(long, global = true)]
    debug: bool,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AgentArg {
    #[value(name = "ba")]
    Ba,
    #[value(name = "interfuser")]
    Interfuser,
    #[value(name = "tfpp")]
    Tfpp,
}

impl From<AgentArg> for AgentKind {
    fn from(value: AgentArg) -> Self {
        match value {
            AgentArg::Ba => AgentKind::Ba,
            AgentArg::Interfuser => AgentKind::Interfuser,
            AgentArg::Tfpp => AgentKind::Tfpp,
        }
    }
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Evaluate the scenario's literal `replay` vectors in order.
    Replay,
    Random {
        #[arg(long, default_value_t = 10)]
        n_iter: usize,
    },
    Pso {
        #[arg(long, default_value_t = 4)]
        n_particles: usize,
        #[arg(long, default_value_t = 10)]
        max_iter: usize,
        #[arg(long, default_value_t = 0.8)]
        w: f64,
        #[arg(long, default_value_t = 0.5)]
        c1: f64,
        #[arg(long, default_value_t = 0.5)]
        c2: f64,
    },
    Ga {
        #[arg(long, default_value_t = 4)]
        n_population: usize,
        #[arg(long, default_value_t = 10)]
        n_generation: usize,
        #[arg(long, default_value_t = 0.01)]
        prob_mut: f64,
    },
    /// Print the resolved configuration and parameter space.
    Describe,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let json_mode = cli.json;
    let result = run_command(cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("search_failed", &err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_strategy(command: &Commands, scenario: &ScenarioDef) -> Result<Box<dyn SearchStrategy>> {
    let strategy: Box<dyn SearchStrategy> = match command {
        Commands::Replay => {
            if scenario.replay.is_empty() {
                return Err(anyhow!(
                    "scenario {} has no replay vectors",
                    scenario.name
                ));
            }
            Box::new(Replay::new(scenario.replay.clone()))
        }
        Commands::Random { n_iter } => Box::new(RandomSearch::new(*n_iter)),
        Commands::Pso {
            n_particles,
            max_iter,
            w,
            c1,
            c2,
        } => {
            if *n_particles == 0 {
                return Err(anyhow!("--n-particles must be at least 1"));
            }
            let mut pso = Pso::new(*n_particles, *max_iter);
            pso.w = *w;
            pso.c1 = *c1;
            pso.c2 = *c2;
            Box::new(pso)
        }
        Commands::Ga {
            n_population,
            n_generation,
            prob_mut,
        } => {
            if *n_population < 2 {
                return Err(anyhow!(
                    "--n-population must be at least 2, got {}",
                    n_population
                ));
            }
            if !(0.0..=1.0).contains(prob_mut) {
                return Err(anyhow!("--prob-mut must be within [0, 1], got {}", prob_mut));
            }
            let mut ga = Ga::new(*n_population, *n_generation);
            ga.prob_mut = *prob_mut;
            Box::new(ga)
        }
        Commands::Describe => return Err(anyhow!("describe does not run a search")),
    };
    Ok(strategy)
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let config = StartupConfig::load(&cli.config)?;
    let scenario = ScenarioDef::load(&cli.scenario)?;
    let space = scenario
        .space()
        .with_context(|| format!("scenario {}", cli.scenario.display()))?;
    let agent = AgentKind::from(cli.agent);

    if cli.command == Commands::Describe {
        let params: Vec<Value> = space
            .bounds()
            .iter()
            .map(|b| json!({ "name": b.name, "lo": b.lo, "hi": b.hi }))
            .collect();
        if cli.json {
            return Ok(Some(json!({
                "ok": true,
                "command": "describe",
                "config": config.to_json(agent),
                "scenario": scenario.name,
                "route_id": scenario.route_id,
                "params": params,
                "replay_vectors": scenario.replay.len(),
            })));
        }
        print_describe(&config, &scenario, agent);
        return Ok(None);
    }

    let mut strategy = build_strategy(&cli.command, &scenario)?;
    let interrupt = InterruptFlag::new();
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || handler_flag.raise())
        .map_err(|e| anyhow!("failed to install interrupt handler: {}", e))?;

    let runner = build_runner(&config, &scenario, agent, !cli.no_render, interrupt)?;
    let mut driver = SearchDriver::new(runner, cli.seed, !cli.no_save_data);
    driver.setup()?;

    let out_dir = output_dir(
        &cli.output_root,
        &scenario.name,
        agent,
        &strategy.tag(),
        cli.seed,
        chrono::Local::now(),
    );
    let summary = driver.run(strategy.as_mut(), &out_dir)?;
    if summary.status == RunStatus::Interrupted {
        info!(trials = summary.trials, "interrupted; partial results saved");
    }

    if cli.json {
        return Ok(Some(json!({
            "ok": true,
            "command": summary.method,
            "summary": summary.to_json(),
        })));
    }
    print_run_summary(&summary);
    Ok(None)
}

fn print_describe(config: &StartupConfig, scenario: &ScenarioDef, agent: AgentKind) {
    let variant = config.launch_variant(agent);
    println!("scenario: {}", scenario.name);
    println!("route_id: {}", scenario.route_id);
    println!("route_file: {}", config.route_file().display());
    println!("simulator_launcher: {}", config.simulator_launcher().display());
    println!("agent: {}", agent);
    println!("script: {}", variant.script.display());
    println!("process_pattern: {}", variant.process_pattern);
    println!("execution_timeout_secs: {}", config.harness.execution_timeout_secs);
    println!("max_attempts: {}", config.harness.max_attempts);
    println!("restart_period: {}", config.harness.restart_period);
    for bound in &scenario.params {
        println!("param: {} [{}, {}]", bound.name, bound.lo, bound.hi);
    }
    if !scenario.replay.is_empty() {
        println!("replay_vectors: {}", scenario.replay.len());
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!("method: {}", summary.method);
    println!("status: {}", summary.status.as_str());
    println!("trials: {}", summary.trials);
    println!("elapsed_secs: {:.1}", summary.elapsed_secs);
    println!("output_dir: {}", summary.output_dir.display());
    if let Some((x, y)) = &summary.best {
        println!("best_loss: {}", y);
        println!("best_params: {:?}", x);
    }
}

/// One JSON document per line on stdout; logs go to stderr.
fn emit_json(value: &Value) {
    println!("{}", value);
}

fn json_error(code: &str, err: &anyhow::Error) -> Value {
    let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
    json!({
        "ok": false,
        "error": { "code": code, "message": err.to_string(), "causes": causes }
    })
}
