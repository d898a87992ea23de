//! plugin-tests CLI - Sharded, isolated plugin test runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use plugin_tests::config::{
    self, Config, ConfigError, DEFAULT_CONFIG_FILE, RegistryConfig, StageTimeouts, expand_path,
};
use plugin_tests::orchestrator::{EXIT_FATAL, EXIT_SUCCESS, Orchestrator, RunError};
use plugin_tests::pipeline::{IsolationPipeline, PipelineSettings};
use plugin_tests::plugin::{PluginSpec, SkipSet};
use plugin_tests::provider::{GitFetcher, PytestRunner, UvProvisioner};
use plugin_tests::registry::{Registry, source_from_config};
use plugin_tests::report::{ConsoleReporter, JUnitReporter, JsonReporter, MultiReporter};
use plugin_tests::shard::{self, NodeSlot, ShardPlan};

#[derive(Parser)]
#[command(name = "plugin-tests")]
#[command(about = "Sharded, isolated unit-test runs for plugin packages", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: plugin-tests.toml if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which plugins this node is responsible for.
#[derive(Args)]
struct SelectionArgs {
    /// Comma-separated plugins to leave out of the run
    #[arg(long, env = "PLUGIN_TESTS_PLUGINS_TO_SKIP", value_name = "A,B,C")]
    plugins_to_skip: Option<String>,

    /// File listing plugins to leave out, one per line
    #[arg(long)]
    skip_file: Option<PathBuf>,

    /// One-based number of this CI node, as CI matrices count them
    #[arg(long, env = "PLUGIN_TESTS_CI_NODE_INDEX", default_value_t = 1)]
    ci_node_index: usize,

    /// Number of CI nodes sharing the plugin list
    #[arg(long, env = "PLUGIN_TESTS_CI_NODE_TOTAL", default_value_t = 1)]
    ci_node_total: usize,
}

impl SelectionArgs {
    fn skip_set(&self) -> Result<SkipSet> {
        let mut skip = match &self.plugins_to_skip {
            Some(list) => SkipSet::parse_list(list)?,
            None => SkipSet::new(),
        };
        if let Some(path) = &self.skip_file {
            skip.merge(SkipSet::load_file(path)?);
        }
        Ok(skip)
    }

    fn slot(&self) -> Result<NodeSlot, ConfigError> {
        NodeSlot::from_number(self.ci_node_index, self.ci_node_total)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum RegistryKind {
    Pyproject,
    Index,
}

#[derive(Subcommand)]
enum Commands {
    /// Test this node's share of the plugins
    Run {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Override maximum plugins tested at once
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Time bound in seconds for every pipeline stage
        #[arg(long, value_name = "SECS")]
        stage_timeout: Option<u64>,

        /// Override re-runs of failed or errored plugins
        #[arg(long)]
        retries: Option<u32>,

        /// JUnit XML output path (enables JUnit output)
        #[arg(long)]
        junit: Option<PathBuf>,

        /// JSON report output path
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Print the resolved plugin list and its shard assignment
    Plan {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Print the shard of every node instead of just this one
        #[arg(long)]
        all_nodes: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Where the plugin list is declared
        #[arg(short, long, value_enum, default_value = "pyproject")]
        registry: RegistryKind,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run {
            selection,
            parallel,
            stage_timeout,
            retries,
            junit,
            json,
        } => {
            let overrides = RunOverrides {
                parallel,
                stage_timeout,
                retries,
                junit,
                json,
            };
            run_plugins(config_path, &selection, overrides, cli.verbose).await
        }
        Commands::Plan {
            selection,
            all_nodes,
            format,
        } => plan_plugins(config_path, &selection, all_nodes, format),
        Commands::Validate => validate_config(config_path),
        Commands::Init { registry } => init_config(registry),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

/// Logs go to stderr so `plan --format json` output stays parseable.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}

fn load(config_path: Option<&Path>) -> Result<Config> {
    let config = config::load_or_default(config_path)?;
    if let Some(path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }
    Ok(config)
}

struct RunOverrides {
    parallel: Option<usize>,
    stage_timeout: Option<u64>,
    retries: Option<u32>,
    junit: Option<PathBuf>,
    json: Option<PathBuf>,
}

async fn run_plugins(
    config_path: Option<&Path>,
    selection: &SelectionArgs,
    overrides: RunOverrides,
    verbose: bool,
) -> Result<i32> {
    let mut config = load(config_path)?;

    if let Some(parallel) = overrides.parallel {
        config.run.max_parallel = parallel;
    }
    if let Some(secs) = overrides.stage_timeout {
        config.timeouts = StageTimeouts::uniform(secs);
    }
    if let Some(retries) = overrides.retries {
        config.run.retries = retries;
    }

    let skip = selection.skip_set()?;
    let slot = match selection.slot() {
        Ok(slot) => slot,
        Err(e) => {
            let e = RunError::from(e);
            eprintln!("error: {}", e);
            return Ok(e.exit_code());
        }
    };
    let extra_args = config
        .tests
        .extra_args()
        .context("Invalid tests.extra_args")?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining plugins");
            token.cancel();
        }
    });

    let pipeline = IsolationPipeline::new(
        GitFetcher::new(config.git.clone()),
        UvProvisioner::new(config.provision.clone()),
        PytestRunner::new(extra_args),
        PipelineSettings::from_config(&config),
    )
    .with_cancellation(cancel);

    let reporter = create_reporter(&config, overrides.junit, overrides.json, verbose);
    let orchestrator = Orchestrator::new(pipeline, reporter)
        .with_max_parallel(config.run.max_parallel)
        .with_retries(config.run.retries);

    let source = source_from_config(&config.registry);
    info!("Using plugin source: {}", source.describe());
    let registry = Registry::new(source.as_ref()).with_test_paths(&config.tests.paths);

    match orchestrator
        .run(&registry, &skip, slot.index, slot.count)
        .await
    {
        Ok(summary) => Ok(summary.exit_code()),
        Err(e) => {
            eprintln!("error: {}", e);
            Ok(e.exit_code())
        }
    }
}

fn plan_plugins(
    config_path: Option<&Path>,
    selection: &SelectionArgs,
    all_nodes: bool,
    format: OutputFormat,
) -> Result<i32> {
    let config = load(config_path)?;
    let skip = selection.skip_set()?;

    let source = source_from_config(&config.registry);
    let registry = Registry::new(source.as_ref()).with_test_paths(&config.tests.paths);

    let plans = match compute_plans(&registry, &skip, selection, all_nodes) {
        Ok(plans) => plans,
        Err(e) => {
            eprintln!("error: {}", e);
            return Ok(e.exit_code());
        }
    };

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&plans)?;
            println!("{}", json);
        }
        OutputFormat::Text => {
            for plan in &plans {
                let slot = plan.slot();
                println!("Node {}/{}: {} plugins", slot.number(), slot.count, plan.len());
                for plugin in plan.plugins() {
                    println!("  {}{}", plugin.id, plan_marker(plugin));
                }
            }
        }
    }

    Ok(EXIT_SUCCESS)
}

fn compute_plans(
    registry: &Registry<'_>,
    skip: &SkipSet,
    selection: &SelectionArgs,
    all_nodes: bool,
) -> Result<Vec<ShardPlan>, RunError> {
    let plugins = registry.resolve(skip)?;
    let plans = if all_nodes {
        shard::plan_all(&plugins, selection.ci_node_total)?
    } else {
        vec![shard::plan_for(&plugins, selection.slot()?)]
    };
    Ok(plans)
}

fn plan_marker(plugin: &PluginSpec) -> String {
    match (&plugin.source, &plugin.test_target) {
        (None, _) => " (no source, will be skipped)".to_string(),
        (Some(_), Some(target)) => format!(" [{}]", target.display()),
        (Some(_), None) => String::new(),
    }
}

fn validate_config(config_path: Option<&Path>) -> Result<i32> {
    let config = load(config_path)?;
    config
        .tests
        .extra_args()
        .context("Invalid tests.extra_args")?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Max parallel: {}", config.run.max_parallel);
    println!("  Retries: {}", config.run.retries);
    println!("  Log dir: {}", expand_path(&config.run.log_dir).display());
    match &config.run.work_dir {
        Some(dir) => println!("  Work dir: {}", expand_path(dir).display()),
        None => println!("  Work dir: {}", std::env::temp_dir().display()),
    }

    let timeouts = [
        ("fetch", config.timeouts.fetch_secs),
        ("provision", config.timeouts.provision_secs),
        ("test", config.timeouts.test_secs),
    ];
    for (stage, secs) in timeouts {
        match secs {
            Some(secs) => println!("  Timeout ({}): {}s", stage, secs),
            None => println!("  Timeout ({}): none", stage),
        }
    }

    let registry = match &config.registry {
        RegistryConfig::Pyproject(cfg) => format!(
            "pyproject ({}, group '{}')",
            cfg.manifest.display(),
            cfg.group
        ),
        RegistryConfig::Index(cfg) => format!("index ({})", cfg.path.display()),
    };
    println!("  Registry: {}", registry);
    println!("  Python: {}", config.provision.python);
    println!("  Report dir: {}", config.report.output_dir.display());

    Ok(EXIT_SUCCESS)
}

fn init_config(registry: RegistryKind) -> Result<i32> {
    let registry_config = match registry {
        RegistryKind::Pyproject => {
            r#"[registry]
type = "pyproject"
manifest = "pyproject.toml"
lock = "requirements.txt"
group = "plugins""#
        }
        RegistryKind::Index => {
            r#"[registry]
type = "index"
path = "plugins.toml""#
        }
    };

    let config = format!(
        r#"# plugin-tests configuration file

[run]
max_parallel = 1
retries = 0
log_dir = "logs"

[timeouts]
provision_secs = 1200
test_secs = 1800

{}

[provision]
python = "3.12"
requirements = "requirements.txt"

[tests]
extra_args = ""

[report]
output_dir = "plugin-test-results"
junit = true
junit_file = "junit.xml"
"#,
        registry_config
    );

    let path = PathBuf::from(DEFAULT_CONFIG_FILE);
    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            DEFAULT_CONFIG_FILE
        );
    }

    std::fs::write(&path, config)?;
    println!("Created {}", DEFAULT_CONFIG_FILE);
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  plugin-tests run");

    Ok(EXIT_SUCCESS)
}

fn create_reporter(
    config: &Config,
    junit_override: Option<PathBuf>,
    json_override: Option<PathBuf>,
    verbose: bool,
) -> MultiReporter {
    let output_dir = expand_path(&config.report.output_dir);
    let mut multi = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));

    if config.report.junit || junit_override.is_some() {
        let junit_path =
            junit_override.unwrap_or_else(|| output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    let json_path = json_override.unwrap_or_else(|| output_dir.join(&config.report.json_file));
    multi.with_reporter(JsonReporter::new(json_path))
}
