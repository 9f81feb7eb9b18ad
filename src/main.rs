//! FlowRunner CLI Entry Point
//!
//! Runs a single workflow definition in-process with in-memory
//! repositories and reports how it went.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner order.yaml
//!
//! # With input parameters
//! flowrunner order.yaml --input '{"orderId": "A-17"}'
//! flowrunner order.yaml --input-file input.json
//!
//! # Set worker pool sizes
//! flowrunner order.yaml --parallel 8 --workflows 2
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use serde_json::Value;

use flowrunner::monitoring::ExecutionTimeline;
use flowrunner::persistence::snapshot::SNAPSHOT_DIR;
use flowrunner::persistence::{
    InMemoryDefinitionRepository, InMemoryStepInstanceRepository,
    InMemoryWorkflowInstanceRepository, RunSnapshot,
};
use flowrunner::workflow::parser::load_definition;
use flowrunner::{Engine, EngineConfig, InstanceStatus, WorkflowDefinition, APP_NAME, VERSION};

/// Default definition file used when none is specified.
const DEFAULT_DEFINITION: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    definition_path: String,
    input: Option<String>,
    input_file: Option<PathBuf>,
    max_parallel_steps: Option<usize>,
    max_parallel_workflows: Option<usize>,
    snapshot: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definition_path: DEFAULT_DEFINITION.to_string(),
            input: None,
            input_file: None,
            max_parallel_steps: None,
            max_parallel_workflows: None,
            snapshot: true,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <DEFINITION_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>   Path to workflow definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --input JSON        Workflow input as a JSON object");
    println!("  --input-file PATH   Read workflow input from a JSON file");
    println!("  --parallel N        Maximum parallel steps (default: CPU count)");
    println!("  --workflows N       Maximum parallel workflows (default: 2)");
    println!("  --no-snapshot       Do not write a run snapshot to {}/", SNAPSHOT_DIR);
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Environment:");
    println!("  FLOWRUNNER_*        Engine settings, see EngineConfig::from_env");
    println!();
    println!("Examples:");
    println!("  flowrunner order.yaml");
    println!("  flowrunner order.yaml --input '{{\"orderId\": \"A-17\"}}'");
    println!("  flowrunner order.yaml --parallel 8 --no-snapshot");
}

fn parse_count(flag: &str, value: Option<&String>) -> Result<usize, String> {
    let value = value.ok_or_else(|| format!("{} requires a number argument", flag))?;
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid {} value: {}", flag, value)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--no-snapshot" => {
                config.snapshot = false;
            }
            "--input" => {
                i += 1;
                let value = args.get(i).ok_or("--input requires a JSON argument")?;
                config.input = Some(value.clone());
            }
            "--input-file" => {
                i += 1;
                let value = args.get(i).ok_or("--input-file requires a path argument")?;
                config.input_file = Some(PathBuf::from(value));
            }
            "--parallel" => {
                i += 1;
                config.max_parallel_steps = Some(parse_count("--parallel", args.get(i))?);
            }
            "--workflows" => {
                i += 1;
                config.max_parallel_workflows = Some(parse_count("--workflows", args.get(i))?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.definition_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if config.input.is_some() && config.input_file.is_some() {
        return Err("--input and --input-file cannot be combined".to_string());
    }

    Ok(config)
}

/// Reads the workflow input from `--input` or `--input-file`.
fn load_input(config: &Config) -> Result<HashMap<String, Value>, Box<dyn std::error::Error>> {
    let text = match (&config.input, &config.input_file) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .map_err(|e| format!("Could not read input file '{}': {}", path.display(), e))?,
        (None, None) => return Ok(HashMap::new()),
    };

    let input: HashMap<String, Value> =
        serde_json::from_str(&text).map_err(|e| format!("Workflow input must be a JSON object: {}", e))?;
    Ok(input)
}

fn engine_config(config: &Config) -> EngineConfig {
    let mut engine_config = EngineConfig::from_env();
    if let Some(n) = config.max_parallel_steps {
        engine_config.max_parallel_steps = n;
    }
    if let Some(n) = config.max_parallel_workflows {
        engine_config.max_parallel_workflows = n;
    }
    engine_config
}

fn colored_status(status: InstanceStatus) -> String {
    let text = status.as_str();
    match status {
        InstanceStatus::Completed => text.green().bold().to_string(),
        InstanceStatus::Failed => text.red().bold().to_string(),
        InstanceStatus::Cancelled => text.yellow().bold().to_string(),
        InstanceStatus::Pending | InstanceStatus::Running => text.normal().to_string(),
    }
}

/// Runs the definition to completion and prints the report.
async fn execute(
    config: &Config,
    definition: WorkflowDefinition,
    input: HashMap<String, Value>,
) -> Result<(), Box<dyn std::error::Error>> {
    let workflows = Arc::new(InMemoryWorkflowInstanceRepository::new());
    let steps = Arc::new(InMemoryStepInstanceRepository::new());
    let definition_id = definition.id.clone();

    let engine = Engine::builder()
        .with_config(engine_config(config))
        .with_definitions(Arc::new(InMemoryDefinitionRepository::with_definitions([definition])))
        .with_instance_repositories(workflows.clone(), steps.clone())
        .build()?;

    let mut events = engine.subscribe();
    let instance_id = engine.start_workflow(&definition_id, input).await?;
    info!("Started workflow instance {}", instance_id);

    let instance = engine.wait_for_completion(&instance_id, None).await?;

    let mut timeline = ExecutionTimeline::for_instance(&instance_id);
    timeline.record_available(&mut events);

    println!();
    println!("Workflow {}: {}", instance_id, colored_status(instance.status));
    if let Some(message) = &instance.error_message {
        println!("  {}", message.red());
    }
    if let Some(output) = instance.output.as_ref().filter(|o| !o.is_empty()) {
        println!("Output: {}", serde_json::to_string_pretty(output)?);
    }

    print!("{}", timeline.gantt_chart());
    println!("{}", timeline.summary());

    if config.snapshot {
        let snapshot = RunSnapshot::capture(workflows.as_ref(), steps.as_ref(), &instance_id).await?;
        let path = snapshot.save(SNAPSHOT_DIR)?;
        println!("Snapshot: {}", path.display());
    }

    engine.shutdown().await;

    if instance.status == InstanceStatus::Completed {
        Ok(())
    } else {
        Err(format!(
            "Workflow '{}' {}",
            definition_id,
            instance.status.as_str().to_lowercase()
        )
        .into())
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load definition
    info!("Loading workflow: {}", config.definition_path);
    let definition = load_definition(&config.definition_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.definition_path, e
        )
    })?;
    info!(
        "Workflow loaded: '{}' v{}, {} steps",
        definition.name,
        definition.version,
        definition.len()
    );

    let input = load_input(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(&config, definition, input))
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
