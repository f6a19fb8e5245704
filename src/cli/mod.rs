//! Command-line front end: argument parsing and the four commands.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    AppConfig, Artifact, ArtifactStatus, BackendPreference, DownloadManager, ProgressEvent,
    ProgressSink, StartOutcome,
};

use progress::{BarSink, make_progress_bar, print_json, print_list, print_report, print_summary};

/// Environment variable holding the bearer token when `--token` is absent.
pub const TOKEN_ENV: &str = "ARTIFACT_DL_TOKEN";

/// How a command ended, for the binary to turn into an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The command did what was asked.
    Success,
    /// The command ran but its result is a failure (a failed transfer, a
    /// missing artifact).
    Failure,
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Config file to load instead of the default location.
    pub config_path: Option<PathBuf>,
    /// Backend override.
    pub backend: Option<BackendPreference>,
    /// What to do.
    pub command: Command,
}

/// A CLI command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Download an artifact, optionally continuing a previous attempt.
    Get {
        artifact_id: String,
        url: String,
        token: Option<String>,
        resume: bool,
    },
    /// Show one artifact, or all recorded artifacts.
    Status {
        artifact_id: Option<String>,
        json: bool,
    },
    /// Remove an artifact and its metadata.
    Delete { artifact_id: String },
    /// Print where a completed artifact lives.
    Path { artifact_id: String },
    /// Print usage.
    Help,
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns a message describing the first invalid argument.
pub fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut config_path = None;
    let mut backend = None;
    let mut token = None;
    let mut resume = false;
    let mut json = false;
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a path")?;
                config_path = Some(PathBuf::from(value));
            }
            "-b" | "--backend" => {
                i += 1;
                backend = Some(match args.get(i).map(String::as_str) {
                    Some("auto") => BackendPreference::Auto,
                    Some("file") => BackendPreference::File,
                    Some("chunked") => BackendPreference::Chunked,
                    _ => return Err("--backend expects auto, file or chunked".into()),
                });
            }
            "-t" | "--token" => {
                i += 1;
                token = Some(args.get(i).ok_or("--token requires a value")?.clone());
            }
            "-r" | "--resume" => resume = true,
            "--json" => json = true,
            "-h" | "--help" => {
                return Ok(Invocation {
                    config_path,
                    backend,
                    command: Command::Help,
                });
            }
            arg if !arg.starts_with('-') => positional.push(arg.to_string()),
            arg => return Err(format!("Unknown option: {arg}")),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let name = positional.next();
    let id = positional.next();
    let extra = positional.next();

    let command = match (name.as_deref(), id, extra) {
        (None, ..) => Command::Help,
        (Some("get"), Some(artifact_id), Some(url)) => Command::Get {
            artifact_id,
            url,
            token,
            resume,
        },
        (Some("get"), ..) => return Err("get requires <id> and <url>".into()),
        (Some("status"), artifact_id, None) => Command::Status { artifact_id, json },
        (Some("delete"), Some(artifact_id), None) => Command::Delete { artifact_id },
        (Some("path"), Some(artifact_id), None) => Command::Path { artifact_id },
        (Some(other @ ("status" | "delete" | "path")), ..) => {
            return Err(format!("invalid arguments for {other}"));
        }
        (Some(other), ..) => return Err(format!("Unknown command: {other}")),
    };

    if positional.next().is_some() {
        return Err("too many arguments".into());
    }

    Ok(Invocation {
        config_path,
        backend,
        command,
    })
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("Usage: artifact-dl [OPTIONS] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  get <id> <url>      Download an artifact (Ctrl-C pauses)");
    eprintln!("  status [<id>]       Show progress of one or all artifacts");
    eprintln!("  delete <id>         Remove an artifact and its state");
    eprintln!("  path <id>           Print the location of a completed artifact");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -r, --resume        Continue from stored bytes (get)");
    eprintln!("      --json          Print reports as JSON (status)");
    eprintln!("  -t, --token <TOK>   Bearer token (default: ${TOKEN_ENV})");
    eprintln!("  -b, --backend <B>   auto, file or chunked");
    eprintln!("  -c, --config <P>    Config file (default: {})", AppConfig::default_path().display());
    eprintln!("  -h, --help          Show this help");
}

/// Runs a parsed invocation.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the manager
/// operation fails.
pub async fn run(invocation: Invocation) -> crate::Result<Exit> {
    if invocation.command == Command::Help {
        print_usage();
        return Ok(Exit::Success);
    }

    let config_path = invocation
        .config_path
        .unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path)?;
    if let Some(backend) = invocation.backend {
        config.download.backend = backend;
    }
    let manager = Arc::new(DownloadManager::new(config).await?);

    match invocation.command {
        Command::Get {
            artifact_id,
            url,
            token,
            resume,
        } => {
            let token = token
                .or_else(|| std::env::var(TOKEN_ENV).ok())
                .unwrap_or_default();
            get(&manager, &artifact_id, &url, &token, resume).await
        }
        Command::Status {
            artifact_id: Some(id),
            json,
        } => {
            let report = manager.status(&id).await?;
            if json {
                print_json(&ProgressEvent {
                    artifact_id: id,
                    report,
                });
            } else {
                print_report(&id, &report);
            }
            Ok(Exit::Success)
        }
        Command::Status {
            artifact_id: None,
            json,
        } => {
            let reports = manager.list().await?;
            if json {
                let events: Vec<_> = reports
                    .into_iter()
                    .map(|(artifact_id, report)| ProgressEvent {
                        artifact_id,
                        report,
                    })
                    .collect();
                print_json(&events);
            } else {
                print_list(&reports);
            }
            Ok(Exit::Success)
        }
        Command::Delete { artifact_id } => {
            manager.delete(&artifact_id).await?;
            println!("Deleted {artifact_id}");
            Ok(Exit::Success)
        }
        Command::Path { artifact_id } => path(&manager, &artifact_id).await,
        Command::Help => Ok(Exit::Success),
    }
}

async fn get(
    manager: &Arc<DownloadManager>,
    artifact_id: &str,
    url: &str,
    token: &str,
    resume: bool,
) -> crate::Result<Exit> {
    let bar = make_progress_bar(artifact_id);
    let sink: Arc<dyn ProgressSink> = Arc::new(BarSink::new(bar.clone()));

    let outcome = if resume {
        manager.resume(artifact_id, url, token, sink).await
    } else {
        manager.start(artifact_id, url, token, sink).await
    };
    let handle = match outcome {
        Ok(StartOutcome::Spawned(handle)) => handle,
        Ok(StartOutcome::AlreadyComplete(report)) => {
            bar.finish_and_clear();
            print_report(artifact_id, &report);
            return Ok(Exit::Success);
        }
        Ok(StartOutcome::AlreadyActive) => {
            bar.finish_and_clear();
            println!("{artifact_id} is already being downloaded");
            return Ok(Exit::Success);
        }
        Err(e) => {
            bar.abandon();
            return Err(e);
        }
    };

    let pauser = Arc::clone(manager);
    let pause_id = artifact_id.to_string();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pauser.pause(&pause_id);
        }
    });

    let outcome = handle.wait().await?;
    ctrl_c.abort();

    match outcome.report.status {
        ArtifactStatus::Completed => bar.finish_and_clear(),
        _ => bar.abandon(),
    }
    print_summary(artifact_id, &outcome);

    match outcome.report.status {
        ArtifactStatus::Paused => {
            println!("Paused. Run again with --resume to continue.");
            Ok(Exit::Success)
        }
        ArtifactStatus::Error => Ok(Exit::Failure),
        _ => Ok(Exit::Success),
    }
}

async fn path(manager: &DownloadManager, artifact_id: &str) -> crate::Result<Exit> {
    match manager.artifact(artifact_id).await? {
        Some(Artifact::File { path, .. }) => {
            println!("{}", path.display());
            Ok(Exit::Success)
        }
        Some(artifact @ Artifact::Memory(_)) => {
            eprintln!(
                "{artifact_id} is only available in memory ({} bytes); its consolidated copy is missing",
                artifact.len()
            );
            Ok(Exit::Failure)
        }
        None => {
            eprintln!("{artifact_id} is not complete");
            Ok(Exit::Failure)
        }
    }
}
