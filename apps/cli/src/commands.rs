//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use irs_core::{
    BatchOrderRequest, BatchOrderView, BatchStrategy, CallbackMode, Engine, JobRequest,
    OrderTimeoutPolicy, ProgressReporter,
};
use irs_shared::{
    AppConfig, BomLifecycle, ClientProfile, Direction, JobParameter, init_config, load_config,
    validate_config,
};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// irs: resolve item relationship graphs from digital twin registries.
#[derive(Parser)]
#[command(
    name = "irs",
    version,
    about = "Crawl item relationship graphs from digital twin registries.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Collaborator profile, overriding the config file.
    #[arg(long, global = true, env = "IRS_PROFILE")]
    pub profile: Option<Profile>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum Profile {
    Stub,
    Live,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum DirectionArg {
    Downward,
    Upward,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum LifecycleArg {
    AsBuilt,
    AsPlanned,
}

/// Traversal options shared by `job` and `batch`.
#[derive(clap::Args, Debug)]
pub(crate) struct TraversalArgs {
    /// Maximum tree depth (defaults to the configured depth).
    #[arg(long)]
    depth: Option<u32>,

    #[arg(long, value_enum)]
    direction: Option<DirectionArg>,

    #[arg(long, value_enum)]
    lifecycle: Option<LifecycleArg>,

    /// Aspect to collect (semantic id or aspect name); repeatable.
    #[arg(long = "aspect")]
    aspects: Vec<String>,

    /// Store aspect payloads in the result.
    #[arg(long)]
    collect_aspects: bool,

    /// Resolve manufacturer business partner names.
    #[arg(long)]
    lookup_bpns: bool,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl the graph below (or above) one item and print the result.
    Job {
        /// Global asset id of the root item (urn:uuid:...).
        global_asset_id: String,

        #[command(flatten)]
        traversal: TraversalArgs,

        /// Job timeout in seconds (defaults to the configured timeout).
        #[arg(long)]
        timeout: Option<u64>,

        /// Callback URL template, e.g. https://host/cb?id={jobId}&state={jobState}.
        #[arg(long)]
        callback: Option<String>,
    },

    /// Crawl many roots as one batch order.
    Batch {
        /// Global asset ids of the root items.
        #[arg(required = true, num_args = 1..)]
        global_asset_ids: Vec<String>,

        #[command(flatten)]
        traversal: TraversalArgs,

        #[arg(long, default_value = "10")]
        batch_size: usize,

        /// Order timeout in seconds.
        #[arg(long, default_value = "3600")]
        order_timeout: u64,

        /// Timeout of each job in seconds.
        #[arg(long, default_value = "1800")]
        job_timeout: u64,

        /// Release one batch at a time instead of all at once.
        #[arg(long)]
        sequential: bool,

        /// Let running jobs finish when the order times out.
        #[arg(long)]
        detach_running: bool,

        /// Fire the callback once per batch instead of once per order.
        #[arg(long)]
        per_batch_callback: bool,

        /// Callback URL template ({orderId}, {orderState}, {batchId}, {batchState}).
        #[arg(long)]
        callback: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr; results to stdout.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "irs=info",
        1 => "irs=debug",
        _ => "irs=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Job {
            global_asset_id,
            traversal,
            timeout,
            callback,
        } => {
            let config = resolve_config(cli.profile)?;
            let parameter = job_parameter(&config, traversal);
            let mut request = JobRequest::new(global_asset_id, parameter);
            request.timeout = timeout.map(Duration::from_secs);
            request.callback_url = callback;
            cmd_job(&config, request).await
        }
        Command::Batch {
            global_asset_ids,
            traversal,
            batch_size,
            order_timeout,
            job_timeout,
            sequential,
            detach_running,
            per_batch_callback,
            callback,
        } => {
            let config = resolve_config(cli.profile)?;
            let mut strategy = if sequential {
                BatchStrategy::preserve_batch_job_order()
            } else {
                BatchStrategy::maximize_throughput()
            };
            if detach_running {
                strategy = strategy.with_timeout_policy(OrderTimeoutPolicy::DetachRunning);
            }
            if per_batch_callback {
                strategy = strategy.with_callback(CallbackMode::PerBatch);
            }
            let request = BatchOrderRequest {
                batch_size,
                order_timeout: Duration::from_secs(order_timeout),
                job_timeout: Duration::from_secs(job_timeout),
                strategy,
                callback_url: callback,
                ..BatchOrderRequest::new(global_asset_ids, job_parameter(&config, traversal))
            };
            cmd_batch(&config, request).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Load the config file and apply global flag overrides.
fn resolve_config(profile: Option<Profile>) -> Result<AppConfig> {
    let mut config = load_config()?;
    if let Some(profile) = profile {
        config.clients.profile = match profile {
            Profile::Stub => ClientProfile::Stub,
            Profile::Live => ClientProfile::Live,
        };
    }
    validate_config(&config)?;
    Ok(config)
}

/// Flags override the `[defaults]` section.
fn job_parameter(config: &AppConfig, args: TraversalArgs) -> JobParameter {
    JobParameter {
        depth: args.depth.unwrap_or(config.defaults.depth),
        direction: match args.direction {
            Some(DirectionArg::Downward) => Direction::Downward,
            Some(DirectionArg::Upward) => Direction::Upward,
            None => config.defaults.direction,
        },
        bom_lifecycle: match args.lifecycle {
            Some(LifecycleArg::AsBuilt) => BomLifecycle::AsBuilt,
            Some(LifecycleArg::AsPlanned) => BomLifecycle::AsPlanned,
            None => config.defaults.bom_lifecycle,
        },
        aspects: args.aspects.into_iter().collect(),
        collect_aspects: args.collect_aspects,
        lookup_bpns: args.lookup_bpns,
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_job(config: &AppConfig, request: JobRequest) -> Result<()> {
    let engine = Engine::from_app_config(config).await?;
    let job_id = engine.jobs.submit(request)?;
    info!(%job_id, "job submitted");

    let view = tokio::select! {
        view = engine.jobs.wait(&job_id) => view?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%job_id, "interrupted, cancelling job");
            engine.jobs.cancel(&job_id).await?;
            engine.jobs.wait(&job_id).await?
        }
    };

    info!(
        state = %view.state,
        shells = view.summary.shells,
        relationships = view.summary.relationships,
        tombstones = view.summary.tombstones,
        "job finished"
    );
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn cmd_batch(config: &AppConfig, request: BatchOrderRequest) -> Result<()> {
    let engine = Engine::from_app_config(config).await?;
    let progress = Arc::new(CliProgress::new()?);
    let order_id = engine.orders.submit(request, progress)?;
    info!(%order_id, "batch order submitted");

    let view = tokio::select! {
        view = engine.orders.wait_order(&order_id) => view?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%order_id, "interrupted, cancelling order");
            engine.orders.cancel_order(&order_id)?;
            engine.orders.wait_order(&order_id).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Batch progress bar over terminal jobs.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} jobs {msg}")?
                .progress_chars("=> ")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Ok(Self { bar })
    }
}

impl ProgressReporter for CliProgress {
    fn batch_released(&self, number: usize, total_batches: usize) {
        self.bar.set_message(format!("(batch {number}/{total_batches})"));
    }

    fn job_finished(&self, done: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
    }

    fn done(&self, order: &BatchOrderView) {
        self.bar.finish_and_clear();
        info!(state = %order.state, jobs = order.total_jobs, "batch order finished");
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_defaults() {
        let cli = Cli::parse_from([
            "irs", "job", "urn:uuid:6c311d29-5753-46d4-b32c-19b918ea93b0", "--depth", "2",
            "--direction", "upward", "--aspect", "SerialPart", "--collect-aspects",
        ]);
        let Command::Job { traversal, .. } = cli.command else {
            panic!("expected job command");
        };
        let parameter = job_parameter(&AppConfig::default(), traversal);
        assert_eq!(parameter.depth, 2);
        assert_eq!(parameter.direction, Direction::Upward);
        assert_eq!(parameter.bom_lifecycle, BomLifecycle::AsBuilt);
        assert!(parameter.wants_aspect("urn:samm:io.catenax.serial_part:3.0.0#SerialPart"));
    }

    #[test]
    fn batch_needs_at_least_one_id() {
        assert!(Cli::try_parse_from(["irs", "batch"]).is_err());
        let cli = Cli::try_parse_from(["irs", "batch", "urn:uuid:a", "urn:uuid:b", "--sequential"]).unwrap();
        assert!(matches!(cli.command, Command::Batch { sequential: true, .. }));
    }
}
