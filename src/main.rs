//! borg-sya - drive borg backups from a declarative config.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use borg_sya::borg::{Borg, BorgError, CreateOptions, ListOptions, PruneOptions};
use borg_sya::config::{Config, ConfigError, ConfigLoader};
use borg_sya::display;
use borg_sya::repo::{Repository, Task};

#[derive(Parser)]
#[command(
    name = "borg-sya",
    about = "Drive borg backups through its machine-readable interface",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Echo the borg command lines instead of executing them.
    #[arg(short = 'n', long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an archive for a configured task.
    Create {
        /// Task name from the configuration.
        task: String,
        /// Render per-file progress while the backup runs.
        #[arg(long)]
        progress: bool,
    },
    /// List archives in a repository.
    List {
        /// Repository name from the configuration.
        repo: String,
        /// Only archives whose name starts with this prefix.
        #[arg(long)]
        prefix: Option<String>,
        /// Only archives matching this shell glob.
        #[arg(long)]
        glob: Option<String>,
        /// Names only.
        #[arg(long)]
        short: bool,
    },
    /// Prune archives according to a task's keep rules.
    Prune {
        /// Task name from the configuration.
        task: String,
    },
    /// Initialize a repository.
    Init {
        /// Repository name from the configuration.
        repo: String,
        /// Encryption mode.
        #[arg(long, default_value = "repokey")]
        encryption: String,
    },
    /// Show repository or archive information.
    Info {
        /// Repository name from the configuration.
        repo: String,
        /// Archive name; whole-repository info when omitted.
        archive: Option<String>,
    },
    /// Delete one archive.
    Delete {
        /// Repository name from the configuration.
        repo: String,
        /// Archive name.
        archive: String,
    },
    /// Mount a repository or archive.
    Mount {
        /// Repository name from the configuration.
        repo: String,
        /// Archive name; mounts the whole repository when omitted.
        #[arg(long)]
        archive: Option<String>,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Stay in the foreground until unmounted.
        #[arg(long)]
        foreground: bool,
    },
    /// Unmount a mountpoint.
    Umount {
        /// Mountpoint directory.
        mountpoint: PathBuf,
    },
    /// Extract paths from an archive into the current directory.
    Extract {
        /// Repository name from the configuration.
        repo: String,
        /// Archive name.
        archive: String,
        /// Paths to extract; everything when omitted.
        paths: Vec<String>,
    },
    /// Re-create archives to apply new settings.
    Recreate {
        /// Repository name from the configuration.
        repo: String,
        /// Archive name; all archives when omitted.
        #[arg(long)]
        archive: Option<String>,
    },
}

/// Error type for the CLI layer.
#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Borg(#[from] BorgError),
    #[error("{0}")]
    Usage(String),
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn find_repo<'a>(config: &'a Config, name: &str) -> Result<&'a Repository, AppError> {
    config
        .repository(name)
        .ok_or_else(|| AppError::Usage(format!("no repository named {name} in the configuration")))
}

fn find_task<'a>(config: &'a Config, name: &str) -> Result<(&'a Task, &'a Repository), AppError> {
    let task = config
        .task(name)
        .ok_or_else(|| AppError::Usage(format!("no task named {name} in the configuration")))?;
    let repo = find_repo(config, &task.repository)?;
    Ok((task, repo))
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    let binary = config.sya.binary.clone().unwrap_or_else(|| "borg".to_string());
    let borg = Borg::with_binary(binary, cli.dry_run, config.sya.verbose);

    match cli.command {
        Commands::Create {
            task: task_name,
            progress,
        } => {
            let (task, repo) = find_task(&config, &task_name)?;
            if !task.enabled {
                tracing::info!(task = %task_name, "task disabled, skipping");
                return Ok(());
            }
            let opts = CreateOptions {
                includes: task.includes.clone(),
                excludes: task.excludes.clone(),
                prefix: task.prefix.clone(),
                stats: true,
            };
            let mut on_progress = display::print_progress;
            let callback: Option<&mut dyn FnMut(&borg_sya::borg::BorgMessage)> = if progress {
                Some(&mut on_progress)
            } else {
                None
            };
            borg.create(repo, &opts, callback).await?;
        }
        Commands::List {
            repo,
            prefix,
            glob,
            short,
        } => {
            let repo = find_repo(&config, &repo)?;
            let opts = ListOptions {
                prefix,
                glob,
                short,
                ..ListOptions::default()
            };
            let records = borg.list(repo, &opts).await?;
            display::print_archives(&records);
        }
        Commands::Prune { task } => {
            let (task, repo) = find_task(&config, &task)?;
            let opts = PruneOptions {
                keep: task.keep.clone(),
                prefix: Some(task.prefix.clone()),
                list_details: config.sya.verbose,
            };
            borg.prune(repo, &opts).await?;
        }
        Commands::Init { repo, encryption } => {
            let repo = find_repo(&config, &repo)?;
            borg.init(repo, &encryption).await?;
        }
        Commands::Info { repo, archive } => {
            let repo = find_repo(&config, &repo)?;
            let outcome = borg.info(repo, archive.as_deref()).await?;
            for line in &outcome.captured {
                println!("{line}");
            }
        }
        Commands::Delete { repo, archive } => {
            let repo = find_repo(&config, &repo)?;
            borg.delete(repo, &archive).await?;
        }
        Commands::Mount {
            repo,
            archive,
            mountpoint,
            foreground,
        } => {
            let repo = find_repo(&config, &repo)?;
            borg.mount(repo, archive.as_deref(), &mountpoint, foreground)
                .await?;
        }
        Commands::Umount { mountpoint } => {
            borg.umount(&mountpoint).await?;
        }
        Commands::Extract {
            repo,
            archive,
            paths,
        } => {
            let repo = find_repo(&config, &repo)?;
            borg.extract(repo, &archive, &paths, None).await?;
        }
        Commands::Recreate { repo, archive } => {
            let repo = find_repo(&config, &repo)?;
            borg.recreate(repo, archive.as_deref()).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        display::print_error(&err.to_string());
        std::process::exit(1);
    }
}
