//! Kiln CLI.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::assembler::ImageAssembler;
use crate::base::{split_reference, StoreBaseResolver};
use crate::cache::{format_size, CacheManager};
use crate::config::KilnConfig;
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::image::{inspect_local, Image};
use crate::manifest::Kilnfile;
use crate::runner::{CommandRunner, HostRunner, SimulatedRunner};
use crate::validator::{Finding, PipelineValidator, Severity};

/// Kiln - multi-stage image builder
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Configuration file (default: <config dir>/kiln/config.toml)
    #[arg(long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data root for bases, cache and images
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable.
    Text,
    /// One JSON object per event.
    Json,
}

/// Kiln commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build an image
    Build {
        /// Path to the Kilnfile (YAML, TOML, JSON or Containerfile)
        #[arg(short, long, default_value = "Kilnfile.yaml")]
        file: PathBuf,

        /// Build context directory
        #[arg(default_value = ".")]
        context: PathBuf,

        /// Image tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Don't use cache
        #[arg(long)]
        no_cache: bool,

        /// Simulate commands instead of running them
        #[arg(long)]
        simulate: bool,

        /// Run commands directly on the host instead of inside the image
        #[arg(long, conflicts_with = "simulate")]
        unconfined: bool,

        /// Output directory for the OCI image layout (default: <root>/images/<name>/<tag>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a Kilnfile without building it
    Validate {
        /// Path to the Kilnfile
        #[arg(short, long, default_value = "Kilnfile.yaml")]
        file: PathBuf,

        /// Format output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect an exported image
    Inspect {
        /// OCI image layout directory, or the tag of a locally built image
        image: String,

        /// Format output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage build cache
    Cache {
        /// Cache subcommands.
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage local base images
    Base {
        /// Base image subcommands.
        #[command(subcommand)]
        command: BaseCommands,
    },
}

/// Build cache management subcommands.
#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cached layers
    List {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },
    /// Prune old cache entries
    Prune {
        /// Remove entries unused for N days (default from config)
        #[arg(long)]
        older_than: Option<u64>,
    },
    /// Clear all cache
    Clear {
        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show cache statistics
    Stats,
}

/// Base image subcommands.
#[derive(Subcommand)]
pub enum BaseCommands {
    /// Import a root filesystem (directory or tar archive) as a base image
    Import {
        /// Reference to register it under (name[:tag])
        reference: String,

        /// Directory or tar archive
        source: PathBuf,
    },
    /// List imported base images
    List,
}

impl Cli {
    /// Install the tracing subscriber selected by the global flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter directive cannot be parsed.
    pub fn init_tracing(&self) -> Result<()> {
        let level = if self.debug { "debug" } else { "info" };
        let filter =
            EnvFilter::from_default_env().add_directive(format!("kiln_build={level}").parse()?);
        let registry = tracing_subscriber::registry().with(filter);

        match self.log_format {
            LogFormat::Text => registry
                .with(fmt::layer().with_target(true).with_writer(io::stderr))
                .init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(io::stderr))
                .init(),
        }
        Ok(())
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns the first error of the selected command.
    pub async fn execute(self) -> Result<()> {
        let mut config = KilnConfig::load(self.config.as_deref())?;
        if let Some(root) = self.root {
            config = config.with_root(root);
        }

        match self.command {
            Commands::Build {
                file,
                context,
                tag,
                no_cache,
                simulate,
                unconfined,
                output,
            } => {
                let options = BuildArgs {
                    file,
                    context,
                    tag,
                    no_cache,
                    simulate,
                    unconfined,
                    output,
                };
                build(&config, options).await
            }

            Commands::Validate { file, json } => {
                let manifest = Kilnfile::from_file(&file)?;
                let findings = PipelineValidator::new().validate(&manifest);

                if json {
                    println!("{}", serde_json::to_string_pretty(&findings)?);
                } else if findings.is_empty() {
                    println!("{} {}", style("OK").green().bold(), file.display());
                } else {
                    print_findings(&findings);
                }

                let errors = findings.iter().filter(|f| f.is_error()).count();
                if errors > 0 {
                    return Err(eyre!("{} has {errors} error(s)", file.display()));
                }
                Ok(())
            }

            Commands::Inspect { image, json } => {
                let image = resolve_image(&config, &image);
                tracing::info!(image = %image.display(), "Inspecting image");
                let info = inspect_local(&image)?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                    return Ok(());
                }

                println!("Image: {}", image.display());
                println!("Digest: {}", info.digest);
                if let Some(tag) = &info.tag {
                    println!("Tag: {tag}");
                }
                println!("Architecture: {}", info.architecture);
                println!("OS: {}", info.os);
                println!("Layers: {}", info.layer_count);
                println!("Size: {}", format_size(info.size));
                if !info.entrypoint.is_empty() {
                    println!("Entrypoint: {:?}", info.entrypoint);
                }
                if let Some(user) = &info.user {
                    println!("User: {user}");
                }
                if let Some(workdir) = &info.workdir {
                    println!("WorkingDir: {workdir}");
                }
                if !info.labels.is_empty() {
                    println!("Labels:");
                    for (k, v) in &info.labels {
                        println!("  {k}: {v}");
                    }
                }
                if !info.history.is_empty() {
                    println!("History:");
                    for entry in &info.history {
                        println!("  {entry}");
                    }
                }
                Ok(())
            }

            Commands::Cache { command } => cache(&config, command),

            Commands::Base { command } => {
                let resolver = StoreBaseResolver::new(config.paths());
                match command {
                    BaseCommands::Import { reference, source } => {
                        let snapshot = resolver.import(&reference, &source)?;
                        println!(
                            "Imported {reference} ({} entries, {})",
                            snapshot.len(),
                            format_size(snapshot.size())
                        );
                        println!("Digest: {}", snapshot.digest());
                    }
                    BaseCommands::List => {
                        let references = resolver.list();
                        if references.is_empty() {
                            println!("No base images");
                        }
                        for reference in references {
                            println!("{reference}");
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

struct BuildArgs {
    file: PathBuf,
    context: PathBuf,
    tag: Option<String>,
    no_cache: bool,
    simulate: bool,
    unconfined: bool,
    output: Option<PathBuf>,
}

async fn build(config: &KilnConfig, args: BuildArgs) -> Result<()> {
    tracing::info!(
        file = %args.file.display(),
        context = %args.context.display(),
        tag = ?args.tag,
        simulate = args.simulate,
        "Building image"
    );

    let paths = config.paths();
    let manifest = Kilnfile::from_file(&args.file)?;
    let context = BuildContext::load(&args.context)?;

    let runner: Arc<dyn CommandRunner> = if args.simulate {
        Arc::new(SimulatedRunner::new())
    } else if args.unconfined || !config.runner.chroot {
        tracing::warn!("Commands run unconfined on the host; installs and create_user are refused");
        Arc::new(HostRunner::unconfined())
    } else {
        Arc::new(HostRunner::new())
    };

    let resolver = Arc::new(StoreBaseResolver::new(paths.clone()));
    let mut assembler = ImageAssembler::new(resolver, runner).with_context(context);
    if config.cache.enabled && !args.no_cache {
        assembler = assembler.with_cache(CacheManager::new(paths.cache()));
    }
    if let Some(tag) = args.tag {
        assembler = assembler.with_tag(tag);
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
    spinner.set_message(format!("Building {}", args.file.display()));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = tokio::select! {
        result = assembler.build(&manifest) => result,
        _ = tokio::signal::ctrl_c() => Err(BuildError::Cancelled),
    };
    spinner.finish_and_clear();

    let image = match result {
        Ok(image) => image,
        Err(BuildError::ValidationFailed(findings)) => {
            print_findings(&findings);
            return Err(BuildError::ValidationFailed(findings).into());
        }
        Err(e) => return Err(e.into()),
    };

    print_summary(&image);

    let dir = args.output.unwrap_or_else(|| {
        let (name, tag) = split_reference(image.tag());
        paths.image(name, tag)
    });
    let digest = image.export_oci(&dir)?;
    println!("  Exported:   {} ({digest})", dir.display());
    Ok(())
}

/// An existing directory is taken as is; anything else is looked up as a tag
/// under the images directory.
fn resolve_image(config: &KilnConfig, image: &str) -> PathBuf {
    let path = PathBuf::from(image);
    if path.is_dir() {
        return path;
    }
    let (name, tag) = split_reference(image);
    config.paths().image(name, tag)
}

fn print_summary(image: &Image) {
    println!();
    println!("{} {}", style("Built").green().bold(), image.tag());
    println!("  Digest:     {}", image.digest());
    println!("  User:       {}", image.user());
    match image.entrypoint() {
        Some(entrypoint) => println!("  Entrypoint: {entrypoint:?}"),
        None => println!("  Entrypoint: {}", style("none").dim()),
    }
    println!("  Size:       {}", format_size(image.size()));
    println!("  Stages:");
    for stage in image.stages() {
        println!(
            "    {} from {} ({} operations) {}",
            stage.label,
            stage.base,
            stage.operations,
            style(stage.digest.short()).dim()
        );
    }
}

fn print_findings(findings: &[Finding]) {
    for finding in findings {
        let severity = match finding.severity {
            Severity::Error => style(finding.severity.to_string()).red().bold(),
            Severity::Warning => style(finding.severity.to_string()).yellow().bold(),
        };
        let location = match (&finding.stage, finding.operation) {
            (Some(stage), Some(op)) => format!(" [{stage} #{op}]"),
            (Some(stage), None) => format!(" [{stage}]"),
            _ => String::new(),
        };
        println!("{severity}{location}: {}", finding.message);
    }
}

fn cache(config: &KilnConfig, command: CacheCommands) -> Result<()> {
    let mut cache = CacheManager::new(config.paths().cache());

    match command {
        CacheCommands::List { verbose } => {
            let entries = cache.list();

            if entries.is_empty() {
                println!("No cached layers");
                return Ok(());
            }

            println!("Cached layers ({}):", entries.len());
            println!();

            for entry in entries {
                if verbose {
                    println!("Key:      {}", entry.key);
                    println!("Size:     {}", entry.size_human());
                    println!("Created:  {}", format_timestamp(entry.created));
                    println!("Accessed: {}", format_timestamp(entry.last_access));
                    if let Some(cmd) = &entry.command {
                        println!("Command:  {cmd}");
                    }
                    println!();
                } else {
                    println!(
                        "  {} ({}) - {}",
                        &entry.key[..12.min(entry.key.len())],
                        entry.size_human(),
                        format_timestamp(entry.last_access)
                    );
                }
            }

            println!();
            println!(
                "Total: {} entries, {} total",
                cache.entry_count(),
                format_size(cache.total_size())
            );
            Ok(())
        }

        CacheCommands::Prune { older_than } => {
            let days = older_than.unwrap_or(config.cache.max_age_days);
            println!("Pruning cache entries unused for {days} days...");
            let freed = cache.prune(days)?;
            println!("Freed {} of disk space", format_size(freed));
            Ok(())
        }

        CacheCommands::Clear { yes } => {
            if !yes && !confirm("This will delete all cached layers.")? {
                println!("Aborted");
                return Ok(());
            }
            let freed = cache.clear()?;
            println!("Cleared cache, freed {} of disk space", format_size(freed));
            Ok(())
        }

        CacheCommands::Stats => {
            print_cache_stats(&cache, cache.cache_dir());
            Ok(())
        }
    }
}

fn print_cache_stats(cache: &CacheManager, location: &Path) {
    println!("Build Cache Statistics");
    println!("======================");
    println!("Location: {}", location.display());
    println!("Entries:  {}", cache.entry_count());
    println!("Size:     {}", format_size(cache.total_size()));
}

fn confirm(prompt: &str) -> Result<bool> {
    println!("{prompt}");
    print!("Continue? [y/N] ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn format_timestamp(ts: u64) -> String {
    let Some(then) = i64::try_from(ts)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
    else {
        return "unknown".to_string();
    };

    let secs = (chrono::Utc::now() - then).num_seconds();
    if secs < 0 {
        "unknown".to_string()
    } else if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}
