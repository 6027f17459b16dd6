/// ParqueDB command-line interface
///
/// Thin wrapper over the embedded engine: inspect, query and export a
/// database on local disk. Exit code 0 on success, 1 on any error.
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use parquedb::config::{validate_path, ParqueDbConfig};
use parquedb::export::ExportFormat;
use parquedb::query::QueryOptions;
use parquedb::ParqueDb;

#[derive(Debug)]
enum Command {
    Init,
    Query {
        namespace: String,
        filter: serde_json::Value,
        limit: Option<i64>,
        format: String,
        pretty: bool,
        quiet: bool,
    },
    Stats,
    Export {
        namespace: String,
        path: String,
        format: String,
    },
    Log {
        branch: String,
        oneline: bool,
        max: usize,
    },
    Diff {
        target: Option<String>,
        mode: DiffMode,
    },
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DiffMode {
    Stat,
    Json,
    Events,
}

fn print_help() {
    println!(
        r#"
ParqueDB CLI

USAGE:
    parquedb <COMMAND> [OPTIONS]

COMMANDS:
    init
        Initialize a database in the data directory

    query <ns> [<json filter>] [--limit N] [--format json|ndjson] [--pretty] [--quiet]
        Query a namespace with a MongoDB-dialect filter

    stats
        Show engine statistics

    export <ns> <path> [--format json|csv|ndjson]
        Export a namespace to a file

    log [branch] [--oneline] [-n N]
        Show commit history (default branch: main)

    diff [target] [--stat|--json|--events]
        Diff the current head against a commit or branch

    help
        Show this help message

ENVIRONMENT:
    PARQUEDB_DATA    Data directory (default: ./data)
    COMPRESSION      Segment codec: uncompressed|snappy|zstd|gzip|lz4
"#
    );
}

fn data_dir() -> PathBuf {
    std::env::var("PARQUEDB_DATA")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return Ok(Command::Help);
    }

    let flag_value = |name: &str| -> Option<String> {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };
    let has_flag = |name: &str| args.iter().any(|a| a == name);
    let positionals: Vec<&String> = args[2..]
        .iter()
        .take_while(|a| !a.starts_with("--") && !a.starts_with('-'))
        .collect();

    match args[1].as_str() {
        "init" => Ok(Command::Init),
        "query" => {
            let namespace = positionals
                .first()
                .ok_or_else(|| anyhow!("query requires a namespace"))?
                .to_string();
            let filter = match positionals.get(1) {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|e| anyhow!("invalid filter JSON: {e}"))?,
                None => serde_json::json!({}),
            };
            Ok(Command::Query {
                namespace,
                filter,
                limit: flag_value("--limit").map(|v| v.parse()).transpose()?,
                format: flag_value("--format").unwrap_or_else(|| "json".to_string()),
                pretty: has_flag("--pretty"),
                quiet: has_flag("--quiet"),
            })
        }
        "stats" => Ok(Command::Stats),
        "export" => {
            let namespace = positionals
                .first()
                .ok_or_else(|| anyhow!("export requires a namespace"))?
                .to_string();
            let path = positionals
                .get(1)
                .ok_or_else(|| anyhow!("export requires a destination path"))?
                .to_string();
            Ok(Command::Export {
                namespace,
                path,
                format: flag_value("--format").unwrap_or_else(|| "json".to_string()),
            })
        }
        "log" => Ok(Command::Log {
            branch: positionals
                .first()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "main".to_string()),
            oneline: has_flag("--oneline"),
            max: flag_value("-n")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(20),
        }),
        "diff" => {
            let mode = if has_flag("--json") {
                DiffMode::Json
            } else if has_flag("--events") {
                DiffMode::Events
            } else {
                DiffMode::Stat
            };
            Ok(Command::Diff {
                target: positionals.first().map(|s| s.to_string()),
                mode,
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(anyhow!("unknown command `{other}` (try `parquedb help`)")),
    }
}

async fn open_db() -> Result<ParqueDb> {
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = data_dir();
    Ok(ParqueDb::open(config).await?)
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Init => {
            let dir = data_dir();
            std::fs::create_dir_all(&dir)?;
            let config = ParqueDbConfig::default();
            config.save(dir.join("parquedb.toml"))?;
            let _db = open_db().await?;
            println!("Initialized ParqueDB in {}", dir.display());
            Ok(())
        }
        Command::Query {
            namespace,
            filter,
            limit,
            format,
            pretty,
            quiet,
        } => {
            let db = open_db().await?;
            let page = db
                .find(
                    &namespace,
                    &filter,
                    QueryOptions {
                        limit,
                        ..Default::default()
                    },
                )
                .await?;

            match format.as_str() {
                "ndjson" => {
                    for item in &page.items {
                        println!("{}", serde_json::to_string(item)?);
                    }
                }
                "json" => {
                    if pretty {
                        println!("{}", serde_json::to_string_pretty(&page.items)?);
                    } else {
                        println!("{}", serde_json::to_string(&page.items)?);
                    }
                }
                other => return Err(anyhow!("unknown query format `{other}`")),
            }
            if !quiet {
                eprintln!(
                    "{} row(s), {} scanned{}",
                    page.items.len(),
                    page.stats.rows_scanned,
                    if page.stats.used_early_termination {
                        " (early termination)"
                    } else {
                        ""
                    }
                );
            }
            Ok(())
        }
        Command::Stats => {
            let db = open_db().await?;
            println!("{}", serde_json::to_string_pretty(&db.stats())?);
            Ok(())
        }
        Command::Export {
            namespace,
            path,
            format,
        } => {
            let cwd = std::env::current_dir()?;
            let destination = validate_path(&cwd, &path)?;
            let db = open_db().await?;
            let format = ExportFormat::parse(&format)?;
            let text = db.export(&namespace, format).await?;
            std::fs::write(&destination, text)?;
            println!("Exported {namespace} to {}", destination.display());
            Ok(())
        }
        Command::Log {
            branch,
            oneline,
            max,
        } => {
            let db = open_db().await?;
            let commits = db.log_commits(&branch, max).await?;
            if commits.is_empty() {
                println!("no commits on branch {branch}");
                return Ok(());
            }
            for commit in commits {
                if oneline {
                    println!("{} {}", &commit.hash[..12.min(commit.hash.len())], commit.message);
                } else {
                    println!("commit {}", commit.hash);
                    println!("Author: {}", commit.author);
                    println!("Date:   {}", commit.ts.to_rfc3339());
                    println!("\n    {}\n", commit.message);
                }
            }
            Ok(())
        }
        Command::Diff { target, mode } => {
            let db = open_db().await?;
            let head = db
                .branch_head("main")
                .await?
                .ok_or_else(|| anyhow!("branch main has no commits"))?;

            // Default target: the head commit's first parent.
            let target = match target {
                Some(target) => match db.branch_head(&target).await? {
                    Some(hash) => hash,
                    None => target, // treat as a commit hash
                },
                None => {
                    let commits = db.log_commits("main", 2).await?;
                    commits
                        .get(1)
                        .map(|c| c.hash.clone())
                        .ok_or_else(|| anyhow!("nothing to diff against"))?
                }
            };

            let diff = db.diff_commits(&target, &head).await?;
            match mode {
                DiffMode::Json => println!("{}", serde_json::to_string_pretty(&diff)?),
                DiffMode::Stat => println!(
                    "{} added, {} removed, {} modified{}",
                    diff.added.len(),
                    diff.removed.len(),
                    diff.modified.len(),
                    if diff.relationships_changed {
                        ", relationships changed"
                    } else {
                        ""
                    }
                ),
                DiffMode::Events => {
                    for ns in &diff.added {
                        println!("A {ns}");
                    }
                    for ns in &diff.removed {
                        println!("D {ns}");
                    }
                    for ns in &diff.modified {
                        println!("M {ns}");
                    }
                }
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(command).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
