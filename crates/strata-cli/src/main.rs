//! Strata - migration and feature reconciliation
//!
//! Usage:
//!   strata migrate                 # Apply pending migrations
//!   strata migrate --dry-run       # Show what would run
//!   strata feature list            # Features defined in this project
//!   strata feature deploy <name>   # Deploy or redeploy a feature

mod interactive;

use std::io::IsTerminal;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use strata_core::config::{self, ProjectConfig, VarSources};
use strata_core::context::TargetContext;
use strata_core::feature::{
    FeatureDeployer, FeatureOptions, FeatureReport, Prompter, deployed_features, list_features,
};
use strata_core::reconcile::{ReconcileOptions, RunSummary, reconcile};
use strata_core::remote::HttpRemote;
use strata_core::script::CommandLoader;

use crate::interactive::DialoguerPrompter;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Migration and feature reconciliation for remote targets", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// Project directory holding strata.toml
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Target host or URL (overrides [target].server)
    #[arg(long, global = true, env = "STRATA_SERVER")]
    server: Option<String>,

    /// Client id to register and act as (overrides [target].identity)
    #[arg(long, global = true, env = "STRATA_CLIENT_ID")]
    client_id: Option<String>,

    /// Bearer token for the target API
    #[arg(long, global = true, env = "STRATA_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Code version that artifacts upload into
    #[arg(long, global = true)]
    code_version: Option<String>,

    /// Interpreter for script units that are not executable themselves
    #[arg(long, global = true, env = "STRATA_INTERPRETER")]
    interpreter: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Migrate(MigrateArgs),

    /// Manage feature bundles
    Feature(FeatureArgs),
}

#[derive(Args)]
struct VarArgs {
    /// JSON file of variables (lowest precedence)
    #[arg(long)]
    vars_file: Option<PathBuf>,

    /// Inline JSON object of variables
    #[arg(long)]
    vars_json: Option<String>,

    /// KEY=VALUE variable (highest precedence, repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,
}

impl VarArgs {
    fn resolve(&self) -> Result<strata_core::types::VarMap> {
        VarSources {
            file: self.vars_file.clone(),
            inline: self.vars_json.clone(),
            pairs: self.vars.clone(),
        }
        .resolve()
        .context("Failed to resolve variables")
    }
}

#[derive(Args)]
struct MigrateArgs {
    /// Migrations directory (overrides [paths].migrations)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Exclude entries matching this pattern (repeatable)
    #[arg(long, short = 'x')]
    exclude: Vec<String>,

    /// Run units without recording them on the target
    #[arg(long)]
    no_apply: bool,

    /// Only show what would run
    #[arg(long)]
    dry_run: bool,

    /// Bootstrap even when the state looks current
    #[arg(long)]
    force_bootstrap: bool,

    /// Fail instead of bootstrapping
    #[arg(long)]
    no_bootstrap: bool,

    /// Print unit notes before each unit
    #[arg(long)]
    show_notes: bool,

    /// Units between state writes
    #[arg(long)]
    commit_interval: Option<NonZeroUsize>,

    #[command(flatten)]
    vars: VarArgs,
}

#[derive(Args)]
struct FeatureArgs {
    /// Features directory (overrides [paths].features)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: FeatureSubcommand,
}

#[derive(Subcommand)]
enum FeatureSubcommand {
    /// List features defined in the project
    List,

    /// List features deployed on the target
    Deployed {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Deploy or redeploy a feature
    Deploy {
        /// Feature name
        name: String,

        #[command(flatten)]
        deploy: DeployArgs,
    },

    /// Redeploy every deployed feature that is defined locally
    Update {
        #[command(flatten)]
        deploy: DeployArgs,
    },

    /// Remove a deployed feature
    #[command(alias = "rm")]
    Remove {
        /// Feature name
        name: String,

        #[command(flatten)]
        vars: VarArgs,
    },
}

#[derive(Args)]
struct DeployArgs {
    /// Keep secret variables in the protected field on the target
    #[arg(long)]
    persist_secrets: bool,

    /// Fail instead of bootstrapping feature state
    #[arg(long)]
    no_bootstrap: bool,

    /// Bootstrap feature state even when it looks current
    #[arg(long)]
    force_bootstrap: bool,

    /// Print unit notes before each feature unit
    #[arg(long)]
    show_notes: bool,

    /// Never prompt; unanswered questions stay unset
    #[arg(short = 'y', long)]
    yes: bool,

    #[command(flatten)]
    vars: VarArgs,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.project)?;

    match cli.command {
        Commands::Migrate(args) => run_migrate(&cli.target, &config, args).await,
        Commands::Feature(args) => run_feature(&cli.target, &config, args).await,
    }
}

/// Build the per-invocation target context from flags and config.
fn target_context(target: &TargetArgs, config: &ProjectConfig) -> Result<TargetContext> {
    let server = target
        .server
        .clone()
        .or_else(|| config.target.server.clone())
        .context("No target server: pass --server, set STRATA_SERVER, or set [target].server")?;
    let identity = target
        .client_id
        .clone()
        .or_else(|| config.target.identity.clone())
        .context(
            "No client id: pass --client-id, set STRATA_CLIENT_ID, or set [target].identity",
        )?;
    let code_version = target
        .code_version
        .clone()
        .or_else(|| config.target.code_version.clone());

    let remote = HttpRemote::new(parse_server(&server)?, target.token.clone(), code_version)?;
    let loader = match &target.interpreter {
        Some(interpreter) => CommandLoader::with_interpreter(interpreter),
        None => CommandLoader::new(),
    };
    Ok(TargetContext::new(
        Arc::new(remote),
        identity,
        Arc::new(loader),
    ))
}

fn parse_server(server: &str) -> Result<Url> {
    let with_scheme = if server.contains("://") {
        server.to_string()
    } else {
        format!("https://{server}")
    };
    Url::parse(&with_scheme).with_context(|| format!("Invalid target server: {server}"))
}

async fn run_migrate(target: &TargetArgs, config: &ProjectConfig, args: MigrateArgs) -> Result<()> {
    let ctx = target_context(target, config)?;
    let dir = args.dir.clone().unwrap_or_else(|| config.migrations_dir());

    let mut exclude = config.migrate.exclude.clone();
    exclude.extend(args.exclude.iter().cloned());

    let options = ReconcileOptions {
        exclude,
        apply: !args.no_apply,
        dry_run: args.dry_run,
        force_bootstrap: args.force_bootstrap,
        allow_bootstrap: !args.no_bootstrap,
        vars: args.vars.resolve()?,
        show_notes: args.show_notes || config.migrate.show_notes.unwrap_or(false),
        commit_interval: args
            .commit_interval
            .unwrap_or_else(|| config.commit_interval()),
    };

    let summary = reconcile(&ctx, &dir, &options).await?;
    print_summary(&summary);
    Ok(())
}

async fn run_feature(target: &TargetArgs, config: &ProjectConfig, args: FeatureArgs) -> Result<()> {
    let dir = args.dir.clone().unwrap_or_else(|| config.features_dir());

    // Listing local definitions needs no target
    if let FeatureSubcommand::List = args.command {
        return run_feature_list(&dir);
    }

    let ctx = target_context(target, config)?;
    match args.command {
        FeatureSubcommand::List => Ok(()),
        FeatureSubcommand::Deployed { format } => run_feature_deployed(&ctx, format).await,
        FeatureSubcommand::Deploy { name, deploy } => {
            let options = feature_options(&deploy, config)?;
            let prompter = prompter_for(&deploy);
            let deployer = with_prompter(FeatureDeployer::new(&ctx, &dir), prompter.as_ref());
            let report = deployer.deploy(&name, &options).await?;
            print_report(&report);
            Ok(())
        }
        FeatureSubcommand::Update { deploy } => {
            let options = feature_options(&deploy, config)?;
            let prompter = prompter_for(&deploy);
            let deployer = with_prompter(FeatureDeployer::new(&ctx, &dir), prompter.as_ref());
            let reports = deployer.update_all(&options).await?;
            if reports.is_empty() {
                println!("No deployed features are defined locally");
            }
            for report in &reports {
                print_report(report);
            }
            Ok(())
        }
        FeatureSubcommand::Remove { name, vars } => {
            let vars = vars.resolve()?;
            FeatureDeployer::new(&ctx, &dir).remove(&name, &vars).await?;
            println!("{} Removed feature {}", style("✓").green(), style(&name).bold());
            Ok(())
        }
    }
}

fn feature_options(deploy: &DeployArgs, config: &ProjectConfig) -> Result<FeatureOptions> {
    Ok(FeatureOptions {
        vars: deploy.vars.resolve()?,
        persist_secrets: deploy.persist_secrets,
        allow_bootstrap: !deploy.no_bootstrap,
        force_bootstrap: deploy.force_bootstrap,
        show_notes: deploy.show_notes || config.migrate.show_notes.unwrap_or(false),
        commit_interval: config.commit_interval(),
    })
}

/// A prompter only when a human can answer.
fn prompter_for(deploy: &DeployArgs) -> Option<DialoguerPrompter> {
    (!deploy.yes && std::io::stdin().is_terminal()).then(DialoguerPrompter::new)
}

fn with_prompter<'a>(
    deployer: FeatureDeployer<'a>,
    prompter: Option<&'a DialoguerPrompter>,
) -> FeatureDeployer<'a> {
    match prompter {
        Some(prompter) => deployer.with_prompter(prompter as &dyn Prompter),
        None => deployer,
    }
}

fn run_feature_list(dir: &std::path::Path) -> Result<()> {
    let features = list_features(dir)?;
    if features.is_empty() {
        println!("No features defined in {}", dir.display());
        return Ok(());
    }
    println!("{:<24} {:<24} {}", "Name", "Requires", "Path");
    for feature in &features {
        println!(
            "{:<24} {:<24} {}",
            feature.name,
            if feature.requires.is_empty() {
                "-".to_string()
            } else {
                feature.requires.join(", ")
            },
            feature.path.display()
        );
    }
    Ok(())
}

async fn run_feature_deployed(ctx: &TargetContext, format: OutputFormat) -> Result<()> {
    let instances = deployed_features(ctx).await?;
    match format {
        OutputFormat::Table => {
            if instances.is_empty() {
                println!("No features deployed");
                return Ok(());
            }
            println!("{:<24} {:<26} {}", "Name", "Last modified", "Variables");
            for instance in &instances {
                let modified = instance
                    .last_modified_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<26} {}",
                    instance.name,
                    modified,
                    serde_json::Value::Object(instance.variables.clone())
                );
            }
        }
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = instances
                .iter()
                .map(|instance| {
                    serde_json::json!({
                        "name": instance.name,
                        "variables": instance.variables,
                        "appliedUnits": instance.applied_units,
                        "createdAt": instance.created_at,
                        "lastModifiedAt": instance.last_modified_at,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    if summary.bootstrapped {
        println!("{} Bootstrapped migration state", style("✓").green());
    }
    if summary.pending.is_empty() {
        println!("{} No migrations required", style("✓").green());
        return;
    }
    if summary.dry_run {
        println!("{}", style("Dry run, would apply:").bold());
        for unit in &summary.pending {
            println!("  {unit}");
        }
        return;
    }
    for unit in &summary.executed {
        println!("{} {}", style("✓").green(), unit);
    }
    for unit in &summary.vetoed {
        println!("{} {} (skipped)", style("-").dim(), unit);
    }
    for unit in &summary.recovered {
        println!("{} {} (failure handled)", style("!").yellow(), unit);
    }
    println!(
        "{} unit(s) run, {} recorded",
        summary.executed.len() + summary.recovered.len(),
        summary.committed.len()
    );
}

fn print_report(report: &FeatureReport) {
    println!(
        "{} Deployed feature {}",
        style("✓").green(),
        style(&report.name).bold()
    );
    if let Some(migrations) = &report.migrations {
        print_summary(migrations);
    }
    if !report.artifacts.is_empty() {
        println!("  Code: {}", report.artifacts.join(", "));
    }
}
