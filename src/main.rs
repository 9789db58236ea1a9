use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use meshgrep::config::Config;
use meshgrep::output;
use meshgrep::query::{FindQuery, IndexQuery, SearchQuery};
use meshgrep::repo::{Meta, RepoStore};
use meshgrep::router::Router;
use meshgrep::server::{NodeClient, NodeServer, PublicQuery, Response, TcpTransport};
use regex::RegexBuilder;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshgrep")]
#[command(about = "Distributed trigram code search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the app data dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Node to talk to (defaults to the configured rpc_addr)
    #[arg(long, global = true)]
    addr: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node in the foreground
    Serve,
    /// Index a source tree on its owning node
    Index {
        key: String,
        root: PathBuf,
        /// Sub-directories of root to index
        #[arg(default_value = ".")]
        dirs: Vec<PathBuf>,
        /// Repo metadata as key=value (`host` selects the owning node)
        #[arg(long = "meta", value_name = "K=V")]
        meta: Vec<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Search file contents
    Search {
        pattern: String,
        #[arg(short = 'r', long = "repo")]
        repos: Vec<String>,
        #[arg(long = "meta", value_name = "K=V")]
        meta: Vec<String>,
        /// Treat --meta values as regular expressions
        #[arg(long)]
        meta_regex: bool,
        #[arg(short = 'i', long)]
        ignore_case: bool,
        #[arg(short = 'A', long, default_value_t = 0)]
        after: usize,
        #[arg(short = 'B', long, default_value_t = 0)]
        before: usize,
        #[arg(short = 'C', long, default_value_t = 0)]
        context: usize,
        /// Only search files whose path matches
        #[arg(long = "path")]
        path_re: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Search file names
    Find {
        pattern: String,
        #[arg(short = 'r', long = "repo")]
        repos: Vec<String>,
        #[arg(long = "meta", value_name = "K=V")]
        meta: Vec<String>,
        #[arg(long)]
        meta_regex: bool,
        #[arg(short = 'i', long)]
        ignore_case: bool,
        /// Stop after this many matches
        #[arg(long = "max", default_value_t = 0)]
        max_matches: u64,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List, show or delete repos
    Repos {
        #[command(subcommand)]
        action: Option<RepoAction>,
    },
    /// Show node status
    Status,
    /// Ask the node to shut down
    Stop,
}

#[derive(Subcommand)]
enum RepoAction {
    List,
    Get { key: String },
    Delete { key: String },
}

fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let color = !cli.no_color;

    if let Commands::Serve = cli.command {
        serve(config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let addr = cli.addr.clone().unwrap_or_else(|| client_addr(&config.rpc_addr));
    let mut client = NodeClient::connect(&addr, None)
        .with_context(|| format!("cannot reach a node at {}", addr))?;
    let mut out = output::stdout(color);
    let mut err = output::stderr(color);

    let response = match cli.command {
        Commands::Serve => return Ok(ExitCode::SUCCESS),
        Commands::Index {
            key,
            root,
            dirs,
            meta,
            timeout_ms,
        } => {
            let root = root
                .canonicalize()
                .with_context(|| format!("invalid root {}", root.display()))?;
            let query = IndexQuery {
                meta: Meta::parse_pairs(meta.iter().map(String::as_str))?,
                timeout_ms,
                ..IndexQuery::new(key, root, dirs)
            };
            client.submit(PublicQuery::Index(query))?
        }
        Commands::Search {
            pattern,
            repos,
            meta,
            meta_regex,
            ignore_case,
            after,
            before,
            context,
            path_re,
            timeout_ms,
        } => {
            let highlight = RegexBuilder::new(&pattern)
                .case_insensitive(ignore_case)
                .build()
                .ok();
            let query = SearchQuery {
                path_re,
                ignore_case,
                meta: Meta::parse_pairs(meta.iter().map(String::as_str))?,
                meta_regexp_match: meta_regex,
                context,
                before,
                after,
                timeout_ms,
                ..SearchQuery::new(pattern).with_repos(repos)
            };
            match client.submit(PublicQuery::Search(query))? {
                Response::Search(result) => {
                    output::write_search(&mut out, &result, highlight.as_ref())?;
                    Response::Search(result)
                }
                other => other,
            }
        }
        Commands::Find {
            pattern,
            repos,
            meta,
            meta_regex,
            ignore_case,
            max_matches,
            timeout_ms,
        } => {
            let query = FindQuery {
                ignore_case,
                meta: Meta::parse_pairs(meta.iter().map(String::as_str))?,
                meta_regexp_match: meta_regex,
                max_matches,
                timeout_ms,
                ..FindQuery::new(pattern).with_repos(repos)
            };
            client.submit(PublicQuery::Find(query))?
        }
        Commands::Repos { action } => match action.unwrap_or(RepoAction::List) {
            RepoAction::List => Response::Repos(client.list_repos()?),
            RepoAction::Get { key } => Response::Repo(client.get_repo(&key)?),
            RepoAction::Delete { key } => Response::Deleted(client.delete_repo(&key)?),
        },
        Commands::Status => Response::Status(client.status()?),
        Commands::Stop => {
            client.shutdown()?;
            Response::ShuttingDown
        }
    };

    let failed = match &response {
        Response::Index(result) => {
            output::write_index(&mut out, result)?;
            output::write_errors(&mut err, &result.errors, result.error.as_ref())?;
            result.error.is_some() || !result.errors.is_empty()
        }
        Response::Search(result) => {
            output::write_errors(&mut err, &result.errors, result.error.as_ref())?;
            result.error.is_some()
        }
        Response::Find(result) => {
            output::write_find(&mut out, result)?;
            output::write_errors(&mut err, &result.errors, result.error.as_ref())?;
            result.error.is_some()
        }
        Response::Repos(repos) => {
            output::write_repos(&mut out, repos)?;
            false
        }
        Response::Repo(repo) | Response::Deleted(repo) => {
            writeln!(out, "{}", serde_json::to_string_pretty(repo)?)?;
            false
        }
        Response::Status(status) => {
            output::write_status(&mut out, status)?;
            false
        }
        Response::ShuttingDown => {
            writeln!(out, "Node stopping")?;
            false
        }
        Response::Pong => false,
        Response::Error(e) => bail!("{}", e),
    };

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let store = match &config.repo_store {
        Some(path) => RepoStore::open(path)
            .with_context(|| format!("failed to open repo store {}", path.display()))?,
        None => RepoStore::in_memory(),
    };
    let router = Router::new(Arc::clone(&config), Arc::new(store), Arc::new(TcpTransport))?;
    let server = NodeServer::bind(Arc::new(router), &config.rpc_addr)?;
    server.run()
}

/// Address a local client should dial for a node listening on `rpc_addr`
fn client_addr(rpc_addr: &str) -> String {
    match rpc_addr.rsplit_once(':') {
        Some(("0.0.0.0", port)) => format!("127.0.0.1:{}", port),
        Some(("[::]", port)) => format!("[::1]:{}", port),
        _ => rpc_addr.to_string(),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("MESHGREP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
