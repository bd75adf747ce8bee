use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marksync::artifacts::{self, CleanupPolicy};
use marksync::{app, config, extract, logging};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "marksync", version, about = "Markdown editor with a scroll-synced page preview")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Markdown file to open
    file: Option<PathBuf>,

    /// Write logs to this file (or directory) instead of the default
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the config file in $EDITOR (default: nvim)
    Config,
    /// Print the scroll anchors extracted from a file
    Anchors {
        file: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove old render artifacts from the build directory
    Clean {
        /// Number of newest artifacts to keep (default: render.keep_last)
        #[arg(long)]
        keep: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Config) = cli.command {
        return config::open_config_in_editor();
    }

    let cfg = config::load_config()?;
    let _log = logging::init(cli.log_file.clone().or_else(|| cfg.log.file.clone()))?;

    match cli.command {
        Some(Commands::Anchors { file, json }) => print_anchors(file, json),
        Some(Commands::Clean { keep }) => clean(&cfg, keep),
        Some(Commands::Config) => Ok(()),
        None => {
            let file = cli
                .file
                .ok_or_else(|| anyhow::anyhow!("No file provided. Try `marksync <file.md>`."))?;
            tracing::info!(path = %file.display(), "opening");
            app::run_app(file, cfg)
        }
    }
}

fn print_anchors(file: PathBuf, json: bool) -> Result<()> {
    let source =
        fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let anchors = extract::extract_anchors(&source);

    if json {
        let values: Vec<_> = anchors
            .iter()
            .map(|anchor| {
                serde_json::json!({
                    "id": anchor.id.as_str(),
                    "line": anchor.line + 1,
                    "column": anchor.column + 1,
                    "offset": anchor.source_offset,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    for anchor in &anchors {
        println!("{:>5}:{:<3} {}", anchor.line + 1, anchor.column + 1, anchor.id);
    }
    Ok(())
}

fn clean(cfg: &config::Config, keep: Option<usize>) -> Result<()> {
    let mut policy = CleanupPolicy::from_config(&cfg.render)
        .ok_or_else(|| anyhow::anyhow!("No build directory configured. Set `render.build_dir` first."))?;
    if let Some(keep) = keep {
        policy = policy.keep_newest(keep);
    }
    let report = artifacts::cleanup(&policy)?;
    println!(
        "Removed {} artifacts ({} bytes) from {}",
        report.files_removed,
        report.bytes_freed,
        policy.dir.display()
    );
    Ok(())
}
