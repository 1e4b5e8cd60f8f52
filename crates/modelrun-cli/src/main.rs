use clap::{Parser, Subcommand};
use colored::Colorize;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use modelrun_core::{AssertionStatus, Config, RunReport, SkipReason, UnitKind, UnitStatus};
use modelrun_engine::{compile_graph, run_with_options, RunOptions};
use modelrun_executor::{DryRunExecutor, SqlExecutor};
use modelrun_project::{ModelGraph, Project};

/// Config file looked up in the project directory
const CONFIG_FILE: &str = "modelrun.toml";

/// modelrun - run SQL models in dependency order, gated by data tests
#[derive(Parser)]
#[command(name = "modelrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: <project-dir>/modelrun.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project directory containing modelrun_project.yml
    #[arg(short, long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the project and validate the model graph
    Validate,

    /// List units in execution order
    Ls {
        /// Only list units of this kind (source, staging, mart)
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Show downstream impact for a unit
    Impact {
        /// Unit name (model name, `source.table`, or a bare source table name)
        unit: String,
    },

    /// Render every unit and compile every assertion without executing
    Compile {
        /// Directory for compiled SQL (default: <project-dir>/target/compiled)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the project with the dry-run executor
    Run {
        /// Maximum units in flight (overrides run.threads)
        #[arg(short, long, env = "MODELRUN_THREADS")]
        threads: Option<usize>,

        /// Output file for run results
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also output markdown summary
        #[arg(short, long)]
        markdown: Option<PathBuf>,

        /// Write every executed statement under this directory
        #[arg(long)]
        sql_dir: Option<PathBuf>,
    },
}

/// run_results.json
#[derive(Serialize)]
struct RunArtifact<'a> {
    /// RFC 3339 timestamp of when the artifact was written
    generated_at: String,

    project: &'a str,

    executor: &'a str,

    #[serde(flatten)]
    report: &'a RunReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = load_config(&cli)?;

    if cli.verbose {
        eprintln!(
            "{} target: {} schema '{}', threads: {}",
            "Using".cyan(),
            config.target.warehouse_type,
            config.target.schema,
            config.run.threads
        );
    }

    match cli.command {
        Commands::Validate => validate_command(&cli.project_dir, cli.verbose),
        Commands::Ls { kind } => ls_command(&cli.project_dir, kind.as_deref()),
        Commands::Impact { unit } => impact_command(&cli.project_dir, &unit, cli.verbose),
        Commands::Compile { output } => compile_command(&config, &cli.project_dir, output, cli.verbose),
        Commands::Run { threads, output, markdown, sql_dir } => {
            run_command(
                config,
                &cli.project_dir,
                threads,
                output,
                markdown.as_deref(),
                sql_dir,
                cli.verbose,
            )
            .await
        }
    }
}

/// Explicit --config, else modelrun.toml in the project directory, else defaults
fn load_config(cli: &Cli) -> Result<Config> {
    let default_path = cli.project_dir.join(CONFIG_FILE);

    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else if default_path.exists() {
        Config::from_file(&default_path)?
    } else {
        if cli.verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };

    Ok(config.with_env_overrides()?)
}

/// Load the project and build its graph
fn load_graph(project_dir: &Path, verbose: bool) -> Result<(Project, ModelGraph)> {
    if verbose {
        eprintln!("{} {}", "Loading project from:".cyan(), project_dir.display());
    }

    let project = Project::load(project_dir)?;
    let graph = project.graph()?;

    if verbose {
        eprintln!(
            "{} {} units, {} assertions",
            "Loaded".cyan(),
            graph.len(),
            graph.assertions().len()
        );
    }

    Ok((project, graph))
}

/// Validate command - load the project and check the graph
fn validate_command(project_dir: &Path, verbose: bool) -> Result<()> {
    let project = Project::load(project_dir)?;

    match project.graph() {
        Ok(graph) => {
            let count = |kind: UnitKind| graph.units().iter().filter(|u| u.kind == kind).count();

            println!("{} {}", "✓".green().bold(), format!("Project '{}' is valid", project.name).green());
            println!("  Sources:    {}", count(UnitKind::Source));
            println!("  Staging:    {}", count(UnitKind::Staging));
            println!("  Marts:      {}", count(UnitKind::Mart));
            println!("  Assertions: {}", graph.assertions().len());
            if verbose {
                println!("  Digest:     {}", graph.digest());
            }
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red().bold(), e.to_string().red());
            std::process::exit(1);
        }
    }
}

/// Ls command - list units in execution order
fn ls_command(project_dir: &Path, kind: Option<&str>) -> Result<()> {
    let (_, graph) = load_graph(project_dir, false)?;

    for name in graph.topological_order() {
        let Some(unit) = graph.unit(name) else {
            continue;
        };
        if kind.is_some_and(|k| k != unit.kind.as_str()) {
            continue;
        }

        let materialization = unit
            .effective_materialization()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());

        if unit.upstream.is_empty() {
            println!("{:<40} {:<8} {}", name.green(), unit.kind, materialization);
        } else {
            println!(
                "{:<40} {:<8} {:<6} <- {}",
                name.green(),
                unit.kind,
                materialization,
                unit.upstream.join(", ")
            );
        }
    }

    Ok(())
}

/// Impact command - show downstream dependencies
fn impact_command(project_dir: &Path, name: &str, verbose: bool) -> Result<()> {
    let (project, graph) = load_graph(project_dir, verbose)?;

    let unit_id = project.find_unit(name).cloned().ok_or_else(|| {
        anyhow::anyhow!(
            "Unit '{}' not found. Sources are named '<source>.<table>' (e.g., 'tpch.{}')",
            name,
            name
        )
    })?;

    let downstream = graph.downstream(&unit_id);

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Downstream Impact Analysis".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("{} {}", "Unit:".bold(), unit_id.green());
    println!("{} {}", "Downstream units:".bold(), downstream.len());
    println!();

    if downstream.is_empty() {
        println!("{}", "✓ No downstream dependencies".green());
        println!("A failure here does not skip any other unit.");
    } else {
        println!("{}", "Skipped if this unit fails (in execution order):".bold());
        println!();

        for (i, dep) in downstream.iter().enumerate() {
            let info = graph
                .unit(dep)
                .map(|u| format!("{} ({})", dep, u.kind))
                .unwrap_or_else(|| dep.clone());
            println!("  {}. {}", i + 1, info.yellow());
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());

    Ok(())
}

/// Compile command - write rendered SQL without executing anything
fn compile_command(config: &Config, project_dir: &Path, output: Option<PathBuf>, verbose: bool) -> Result<()> {
    let (project, graph) = load_graph(project_dir, verbose)?;
    let output = output.unwrap_or_else(|| project_dir.join("target").join("compiled"));
    let vars = merged_vars(&project, config);

    let compiled = compile_graph(&graph, &config.target, &vars);
    std::fs::create_dir_all(output.join("tests"))?;

    let mut errors = 0;
    for unit in &compiled {
        match &unit.sql {
            Some(Ok(sql)) => {
                std::fs::write(output.join(format!("{}.sql", unit.unit)), sql)?;
                if verbose {
                    eprintln!("  {} {} -> {}", "Compiled".cyan(), unit.unit, unit.relation);
                }
            }
            Some(Err(e)) => {
                errors += 1;
                println!("  {} {}: {}", "ERROR".red().bold(), unit.unit, e);
            }
            None => {}
        }

        for (name, sql) in &unit.assertions {
            match sql {
                Ok(sql) => std::fs::write(output.join("tests").join(format!("{}.sql", name)), sql)?,
                Err(e) => {
                    errors += 1;
                    println!("  {} {}: {}", "ERROR".red().bold(), name, e);
                }
            }
        }
    }

    if errors > 0 {
        println!("{}", format!("{} compile error(s)", errors).red().bold());
        std::process::exit(1);
    }

    println!(
        "{} {} units compiled to {}",
        "✓".green().bold(),
        compiled.iter().filter(|u| u.sql.is_some()).count(),
        output.display()
    );
    Ok(())
}

/// Run command - execute the project with the dry-run executor
async fn run_command(
    config: Config,
    project_dir: &Path,
    threads: Option<usize>,
    output: Option<PathBuf>,
    markdown: Option<&Path>,
    sql_dir: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let (project, graph) = load_graph(project_dir, verbose)?;
    let output = output.unwrap_or_else(|| project_dir.join("target").join("run_results.json"));

    let mut options = RunOptions::from_config(&config);
    options.vars = merged_vars(&project, &config);
    if let Some(threads) = threads {
        if threads == 0 {
            return Err(anyhow::anyhow!("--threads must be at least 1"));
        }
        options.threads = threads;
    }

    let mut executor = DryRunExecutor::new();
    if let Some(dir) = sql_dir {
        executor = executor.with_output_dir(dir);
    }
    let executor: Arc<dyn SqlExecutor> = Arc::new(executor);

    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, finishing units in flight...".yellow());
            on_interrupt.cancel();
        }
    });

    if verbose {
        eprintln!("{} {} with {} thread(s)", "Running".cyan(), project.name, options.threads);
    }

    let report = run_with_options(&graph, Arc::clone(&executor), cancellation, options).await;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let artifact = RunArtifact {
        generated_at: chrono::Utc::now().to_rfc3339(),
        project: &project.name,
        executor: executor.name(),
        report: &report,
    };
    std::fs::write(&output, serde_json::to_string_pretty(&artifact)?)?;
    tracing::debug!(path = %output.display(), "run results written");

    if verbose {
        eprintln!("{} {}", "Run results saved to:".green(), output.display());
    }

    if let Some(md_path) = markdown {
        std::fs::write(md_path, generate_markdown_report(&project.name, &report))?;
        tracing::debug!(path = %md_path.display(), "markdown summary written");
        if verbose {
            eprintln!("{} {}", "Markdown summary saved to:".green(), md_path.display());
        }
    }

    print_run_summary(&report);

    if report.has_failures() {
        std::process::exit(1);
    }

    Ok(())
}

/// Project vars, overridden by config vars
fn merged_vars(project: &Project, config: &Config) -> BTreeMap<String, serde_json::Value> {
    let mut vars = project.vars.clone();
    vars.extend(config.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

fn status_label(status: UnitStatus) -> colored::ColoredString {
    match status {
        UnitStatus::Succeeded => "OK".green().bold(),
        UnitStatus::Failed => "FAIL".red().bold(),
        UnitStatus::Skipped => "SKIP".yellow().bold(),
        UnitStatus::Pending | UnitStatus::Running => status.as_str().normal(),
    }
}

fn skip_text(reason: &SkipReason) -> String {
    match reason {
        SkipReason::UpstreamFailed { blocked_by } => format!("upstream failed: {}", blocked_by.join(", ")),
        SkipReason::Cancelled => "run cancelled".to_string(),
    }
}

/// Print run summary to stdout
fn print_run_summary(report: &RunReport) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Run Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    for name in &report.order {
        let Some(result) = report.unit(name) else {
            continue;
        };

        println!("  [{}] {}", status_label(result.status), name);

        if let Some(error) = &result.error {
            println!("    {}", error.red());
        }
        if let Some(reason) = &result.skip_reason {
            println!("    {}", skip_text(reason).yellow());
        }
        for warning in &result.warnings {
            println!("    {} {}", "warn:".yellow(), warning);
        }
    }

    println!();
    println!("{}", "Summary:".bold());
    println!("  Units:      {}", report.summary.total);
    println!("  Succeeded:  {}", report.summary.succeeded.to_string().green());

    if report.summary.failed > 0 {
        println!("  Failed:     {}", report.summary.failed.to_string().red().bold());
    } else {
        println!("  Failed:     {}", report.summary.failed.to_string().green());
    }

    if report.summary.skipped > 0 {
        println!("  Skipped:    {}", report.summary.skipped.to_string().yellow());
    } else {
        println!("  Skipped:    {}", report.summary.skipped);
    }

    println!(
        "  Assertions: {} passed, {} not passed",
        report.summary.assertions_passed, report.summary.assertions_failed
    );
    if report.summary.warnings > 0 {
        println!("  Warnings:   {}", report.summary.warnings.to_string().yellow());
    }
    if report.cancelled {
        println!("  {}", "Run was cancelled".yellow().bold());
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
}

/// Generate markdown summary
fn generate_markdown_report(project: &str, report: &RunReport) -> String {
    let mut md = String::new();

    md.push_str(&format!("# Run Report: {}\n\n", project));
    md.push_str(&format!("**Version:** {}\n\n", report.version));
    md.push_str(&format!("**Graph digest:** `{}`\n\n", report.graph_digest));

    md.push_str("## Summary\n\n");
    md.push_str(&format!("- Units: {}\n", report.summary.total));
    md.push_str(&format!("- Succeeded: {}\n", report.summary.succeeded));
    md.push_str(&format!("- Failed: {}\n", report.summary.failed));
    md.push_str(&format!("- Skipped: {}\n", report.summary.skipped));
    md.push_str(&format!("- Assertions passed: {}\n", report.summary.assertions_passed));
    md.push_str(&format!("- Assertions not passed: {}\n", report.summary.assertions_failed));
    md.push_str(&format!("- Warnings: {}\n", report.summary.warnings));
    if report.cancelled {
        md.push_str("- Cancelled: yes\n");
    }
    md.push('\n');

    md.push_str("## Units\n\n");
    md.push_str("| Unit | Status | Detail |\n");
    md.push_str("|---|---|---|\n");

    for name in &report.order {
        let Some(result) = report.unit(name) else {
            continue;
        };

        let emoji = match result.status {
            UnitStatus::Succeeded if result.warnings.is_empty() => "✅",
            UnitStatus::Succeeded => "⚠️",
            UnitStatus::Failed => "❌",
            UnitStatus::Skipped => "⏭️",
            UnitStatus::Pending | UnitStatus::Running => "",
        };

        let detail = result
            .error
            .clone()
            .or_else(|| result.skip_reason.as_ref().map(skip_text))
            .unwrap_or_else(|| result.warnings.join("; "));

        md.push_str(&format!(
            "| `{}` | {} {} | {} |\n",
            name,
            emoji,
            result.status,
            detail.replace('|', "\\|")
        ));
    }

    let failing: Vec<_> = report
        .order
        .iter()
        .filter_map(|name| report.unit(name))
        .flat_map(|result| result.assertions.iter())
        .filter(|a| a.status != AssertionStatus::Passed)
        .collect();

    if !failing.is_empty() {
        md.push_str("\n## Assertions not passed\n\n");
        for outcome in failing {
            if let Some(line) = outcome.describe() {
                md.push_str(&format!("- {}\n", line));
            }
        }
    }

    md
}
