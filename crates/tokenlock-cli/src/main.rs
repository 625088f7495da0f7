//! Tokenlock CLI - inspect and manage lock tokens in the shared lock store

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokenlock_core::config::{Config, MAX_TTL_SECS};
use tokenlock_core::domain::locking::{
    DEFAULT_ASPECT, LockBackend, LockContext, LockInfo, ObjectRef, PersistentTokenService,
    StaticCaller, Token, TokenKind, TokenService, TokenServiceConfig, build_token_service,
    expiry_after,
};
use tokenlock_core::storage::{Database, DatabaseConfig};
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "tokenlock")]
#[command(author, version, about = "Token-based locking of business objects", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Lock store database, overrides `database.path`
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage locks
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum LockAction {
    /// List all locks
    List,

    /// Acquire one token
    Acquire {
        /// Object to lock, as TYPE:ID[@BRANCH]
        #[arg(long, required_unless_present = "global", conflicts_with = "global")]
        target: Option<ObjectRef>,

        /// Take a system-global lock instead of an object lock
        #[arg(long, requires = "aspect")]
        global: bool,

        /// Aspect of the target to lock
        #[arg(long)]
        aspect: Option<String>,

        /// Shared instead of exclusive
        #[arg(long, conflicts_with = "global")]
        shared: bool,

        /// Lifetime of the token (defaults to `locking.default_ttl_secs`)
        #[arg(long)]
        ttl_secs: Option<u64>,

        /// Principal holding the lock, as TYPE:ID[@BRANCH]
        #[arg(long)]
        owner: Option<ObjectRef>,

        /// Operation name recorded with the lock
        #[arg(long)]
        operation: Option<String>,
    },

    /// Check whether previously acquired tokens are still held
    Check {
        /// Tokens as printed by `locks acquire --format json`
        #[arg(long)]
        tokens: String,
    },

    /// Extend previously acquired tokens
    Renew {
        /// Tokens as printed by `locks acquire --format json`
        #[arg(long)]
        tokens: String,

        /// New lifetime (defaults to `locking.default_ttl_secs`)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Release previously acquired tokens
    Release {
        /// Tokens as printed by `locks acquire --format json`
        #[arg(long)]
        tokens: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tokenlock=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let db = cli.db.as_deref();

    match cli.command {
        Commands::Locks { action } => cmd_locks(action, db, cli.format, cli.quiet).await,
        Commands::Config { action } => cmd_config(action, cli.quiet),
        Commands::Doctor => cmd_doctor(db, cli.quiet).await,
    }
}

/// Load the configuration with the `--db` override applied
fn load_config(db: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = Config::load().map_err(config_error)?;
    if let Some(path) = db {
        config.database.path = Some(path.to_path_buf());
    }
    Ok(config)
}

fn config_error(err: anyhow::Error) -> anyhow::Error {
    report(tokenlock_core::Error::ConfigError(format!("{:#}", err)))
}

/// Turn a core error into a message carrying its code and suggestion
fn report(err: impl Into<tokenlock_core::Error>) -> anyhow::Error {
    let err = err.into();
    match err.suggestion() {
        Some(hint) => anyhow::anyhow!("{} ({})\nTry: {}", err, err.code(), hint),
        None => anyhow::anyhow!("{} ({})", err, err.code()),
    }
}

/// Expiry for a lifetime given in seconds on the command line
fn expiry_in(ttl_secs: u64) -> anyhow::Result<DateTime<Utc>> {
    let expires = (1..=MAX_TTL_SECS)
        .contains(&ttl_secs)
        .then(|| expiry_after(Duration::from_secs(ttl_secs)))
        .flatten();

    expires.ok_or_else(|| {
        report(tokenlock_core::Error::InvalidInput(format!(
            "ttl must be between 1 and {} seconds, got {}",
            MAX_TTL_SECS, ttl_secs
        )))
    })
}

fn parse_tokens(json: &str) -> anyhow::Result<Vec<Token>> {
    let tokens: Vec<Token> = serde_json::from_str(json).map_err(|e| {
        report(tokenlock_core::Error::InvalidInput(format!(
            "tokens must be a JSON array as printed by `tokenlock locks acquire --format json`: {}",
            e
        )))
    })?;

    if tokens.iter().any(|token| token.id().is_none()) {
        return Err(report(tokenlock_core::Error::InvalidInput(
            "every token needs the id it was acquired with".to_string(),
        )));
    }
    Ok(tokens)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn open_service(
    config: &Config,
    caller: StaticCaller,
) -> anyhow::Result<Arc<dyn TokenService>> {
    // Every invocation is its own process, only the shared store outlives it
    let mut config = config.clone();
    if config.locking.backend == LockBackend::Ephemeral {
        debug!("Using the persistent lock store for the command line");
        config.locking.backend = LockBackend::Persistent;
    }

    build_token_service(&config, LockContext::default().with_caller(caller))
        .await
        .map_err(report)
}

async fn cmd_locks(
    action: LockAction,
    db: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = load_config(db)?;
    let default_ttl = config.locking.default_ttl_secs;

    match action {
        LockAction::List => {
            let service = open_service(&config, StaticCaller::anonymous()).await?;
            let locks = service.all_locks().await.map_err(report)?;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&locks)?),
                OutputFormat::Text => print_locks(&locks, quiet),
            }
        }

        LockAction::Acquire {
            target,
            global,
            aspect,
            shared,
            ttl_secs,
            owner,
            operation,
        } => {
            let aspect = aspect.unwrap_or_else(|| DEFAULT_ASPECT.to_string());
            let target = if global { None } else { target };
            if target.is_none() && aspect == DEFAULT_ASPECT {
                return Err(report(tokenlock_core::Error::InvalidInput(format!(
                    "a global lock needs an aspect other than '{}'",
                    DEFAULT_ASPECT
                ))));
            }

            let kind = if shared {
                TokenKind::Shared
            } else {
                TokenKind::Exclusive
            };
            let mut caller = match owner {
                Some(owner) => StaticCaller::new(owner),
                None => StaticCaller::anonymous(),
            };
            if let Some(operation) = operation {
                caller = caller.with_operation(operation);
            }

            let expires = expiry_in(ttl_secs.unwrap_or(default_ttl))?;
            let service = open_service(&config, caller).await?;
            let mut tokens = vec![Token::new(kind, target, aspect)];
            service.acquire(expires, &mut tokens).await.map_err(report)?;

            let json = serde_json::to_string(&tokens)?;
            match format {
                OutputFormat::Json => println!("{}", json),
                OutputFormat::Text => {
                    if !quiet {
                        println!("Acquired {} until {}", tokens[0], expires.to_rfc3339());
                        println!();
                        println!("Pass these tokens to check, renew or release:");
                    }
                    println!("{}", json);
                }
            }
        }

        LockAction::Check { tokens } => {
            let tokens = parse_tokens(&tokens)?;
            let service = open_service(&config, StaticCaller::anonymous()).await?;
            let valid = service.all_valid(&tokens).await.map_err(report)?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "valid": valid }));
                }
                OutputFormat::Text => {
                    println!("{}", if valid { "valid" } else { "invalid" });
                }
            }
        }

        LockAction::Renew { tokens, ttl_secs } => {
            let tokens = parse_tokens(&tokens)?;
            let expires = expiry_in(ttl_secs.unwrap_or(default_ttl))?;
            let service = open_service(&config, StaticCaller::anonymous()).await?;
            let renewed = service.renew(expires, &tokens).await.map_err(report)?;

            match format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "renewed": renewed,
                            "expires_at": renewed.then(|| expires.to_rfc3339()),
                        })
                    );
                }
                OutputFormat::Text => {
                    if renewed {
                        println!("Renewed {} token(s) until {}", tokens.len(), expires.to_rfc3339());
                    } else {
                        warn!("Renewal failed, tokens were released");
                        println!("Tokens are no longer held and have been released");
                    }
                }
            }
        }

        LockAction::Release { tokens } => {
            let tokens = parse_tokens(&tokens)?;
            let service = open_service(&config, StaticCaller::anonymous()).await?;
            service.release(&tokens).await.map_err(report)?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "released": tokens.len() }));
                }
                OutputFormat::Text => {
                    if !quiet {
                        println!("Released {} token(s)", tokens.len());
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_locks(locks: &[LockInfo], quiet: bool) {
    if locks.is_empty() {
        if !quiet {
            println!("No locks held.");
        }
        return;
    }

    let now = Utc::now();
    for lock in locks {
        let owner = match (&lock.owner, &lock.owner_name) {
            (Some(owner), Some(name)) => format!("{} ({})", owner, name),
            (Some(owner), None) => owner.to_string(),
            (None, _) => "(anonymous)".to_string(),
        };
        let expiry = if lock.timeout <= now {
            format!("{} (expired)", lock.timeout.to_rfc3339())
        } else {
            lock.timeout.to_rfc3339()
        };

        println!("Owner: {}", owner);
        if !quiet {
            println!("  Expires: {}", expiry);
            if let Some(operation) = &lock.operation {
                println!("  Operation: {}", operation);
            }
            if let Some(node) = lock.cluster_node {
                println!("  Cluster node: {}", node);
            }
        }
        for token in &lock.tokens {
            match token.id() {
                Some(id) => println!("  - {} [{}]", token, id),
                None => println!("  - {}", token),
            }
        }
    }

    if !quiet {
        println!();
        println!("{} lock(s)", locks.len());
    }
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load().map_err(config_error)?;
            let value = config.get(&key).map_err(config_error)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load().map_err(config_error)?;
            config.set(&key, &value).map_err(config_error)?;
            config.save().map_err(config_error)?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load().map_err(config_error)?;
            let items = config.list().map_err(config_error)?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset().map_err(config_error)?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path().map_err(config_error)?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(db: Option<&Path>, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Tokenlock Health Check");
        println!("======================");
        println!();
    }

    let mut all_ok = true;

    // Check configuration
    let config = match load_config(db) {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
                println!("     Backend: {}", config.locking.backend);
                match config.cluster.node_id {
                    Some(node) => println!("     Cluster node: {}", node),
                    None => println!("     Cluster node: (not clustered)"),
                }
            }
            config
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
            Config::default()
        }
    };

    // Check config file location
    if !quiet {
        match Config::config_path() {
            Ok(path) => {
                if path.exists() {
                    println!("[OK] Config file: {}", path.display());
                } else {
                    println!("[--] Config file: {} (using defaults)", path.display());
                }
            }
            Err(e) => {
                println!("[!!] Config file: Error - {}", e);
            }
        }
    }

    // Check database
    match Database::new(DatabaseConfig::from_settings(&config.database)).await {
        Ok(db) => match db.health_check().await {
            Ok(()) => {
                if !quiet {
                    println!("[OK] Database: Connected");
                    println!("     Path: {}", db.path().display());
                }

                match db.migration_status().await {
                    Ok(status) => {
                        if status.needs_migration {
                            all_ok = false;
                            if !quiet {
                                println!(
                                    "[!!] Database: Migrations pending (v{} -> v{})",
                                    status.current_version, status.target_version
                                );
                            }
                        } else if !quiet {
                            println!("[OK] Database: Schema v{}", status.current_version);
                        }
                    }
                    Err(e) => {
                        all_ok = false;
                        if !quiet {
                            println!("[!!] Database: Migration check failed - {}", e);
                        }
                    }
                }

                let service = PersistentTokenService::new(
                    &db,
                    TokenServiceConfig::default(),
                    LockContext::default(),
                );
                match service.all_locks().await {
                    Ok(locks) => {
                        if !quiet {
                            let tokens: usize = locks.iter().map(|lock| lock.tokens.len()).sum();
                            let expired = locks.iter().filter(|lock| lock.is_expired()).count();
                            println!(
                                "     Locks: {} ({} token(s), {} expired)",
                                locks.len(),
                                tokens,
                                expired
                            );
                        }
                    }
                    Err(e) => {
                        all_ok = false;
                        if !quiet {
                            println!("[!!] Lock store: {}", report(e));
                        }
                    }
                }
            }
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Database: Health check failed - {}", e);
                }
            }
        },
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Database: Failed to initialize - {}", e);
            }
        }
    }

    // Summary
    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    Ok(())
}
