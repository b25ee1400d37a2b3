//! relay-send - Relay daemon and operator commands
//!
//! `run` long-polls the source channel and fans every post out to the
//! destination channels while the credential health monitor sweeps in the
//! background. The other subcommands operate on the same database.

use clap::{Parser, Subcommand};
use librelaycast::config::{resolve_config_path, Config};
use librelaycast::credentials::CredentialPool;
use librelaycast::destinations::DestinationResolver;
use librelaycast::health::HealthMonitor;
use librelaycast::logging::{LogFormat, LoggingConfig};
use librelaycast::providers::ProviderRegistry;
use librelaycast::settings::ProviderSwitch;
use librelaycast::types::{Destination, Language, NewCredential, Provider};
use librelaycast::{Database, RelayError, RelayService, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const POLL_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "relay-send")]
#[command(version)]
#[command(about = "Republish source channel posts to translated destination channels")]
#[command(long_about = "\
relay-send - Multilingual channel relay

DESCRIPTION:
    relay-send watches one source channel and republishes every post to
    all registered destination channels. Each destination receives the
    text translated into its bound language, its own footer links and,
    when branding is enabled, media overlaid with its name.

    Translations rotate across DeepL and Mistral credentials. Exhausted
    credentials cool down, rejected ones are dropped by the health sweep.

USAGE:
    # Run the relay in the foreground (logs to stderr)
    relay-send run

    # Show or switch the provider tried first
    relay-send provider
    relay-send provider mistral

    # Probe every credential once
    relay-send sweep

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight fan-outs)

CONFIGURATION:
    Configuration file: ~/.config/relaycast/config.toml (or RELAYCAST_CONFIG)
    Bot token: [telegram] bot_token or RELAYCAST_BOT_TOKEN

EXIT CODES:
    0 - Success
    1 - Runtime error
    2 - Configuration error
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file
    #[arg(long, global = true, env = "RELAYCAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay source channel posts until interrupted
    Run,

    /// Probe every credential of both providers once
    Sweep,

    /// Show the provider tried first, or switch it
    Provider {
        /// deepl or mistral
        name: Option<String>,
    },

    /// Manage translation credentials
    #[command(subcommand)]
    Credentials(CredentialCommand),

    /// Manage destination channels
    #[command(subcommand)]
    Destinations(DestinationCommand),

    /// Manage target languages
    #[command(subcommand)]
    Languages(LanguageCommand),
}

#[derive(Subcommand, Debug)]
enum CredentialCommand {
    List,
    /// Register a DeepL key
    AddDeepl { api_key: String },
    /// Register a Mistral key with its agent, serving one language
    AddMistral {
        api_key: String,
        agent_id: String,
        language: String,
    },
    Remove { id: i64 },
}

#[derive(Subcommand, Debug)]
enum DestinationCommand {
    List,
    Add {
        #[arg(allow_hyphen_values = true)]
        channel_id: String,
        name: String,
        #[arg(long)]
        no_branding: bool,
        #[arg(long, default_value = "")]
        discussion_link: String,
        #[arg(long, default_value = "")]
        discussion_text: String,
        #[arg(long, default_value = "")]
        invitation_link: String,
        #[arg(long, default_value = "")]
        invitation_text: String,
    },
    Remove {
        #[arg(allow_hyphen_values = true)]
        channel_id: String,
    },
    /// Bind a destination to a registered language
    Bind {
        #[arg(allow_hyphen_values = true)]
        channel_id: String,
        language: String,
    },
    Unbind {
        #[arg(allow_hyphen_values = true)]
        channel_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum LanguageCommand {
    List,
    /// Register a language: display name and provider code (e.g. Czech CS)
    Add { name: String, code: String },
    Remove { name: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env().verbose(cli.verbose);
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    logging.init();

    if let Err(e) = execute(cli).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run => run_daemon(config).await,
        Command::Sweep => sweep(config).await,
        Command::Provider { name } => provider(config, name).await,
        Command::Credentials(command) => credentials(config, command).await,
        Command::Destinations(command) => destinations(config, command).await,
        Command::Languages(command) => languages(config, command).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path.clone(),
        None => resolve_config_path()?,
    };
    Config::load_from_path(&path)
}

async fn run_daemon(config: Config) -> Result<()> {
    let service = RelayService::from_config(config).await?;
    let mut poller = service.poller()?;

    info!(
        source = %service.config().telegram.source_channel,
        "relay-send daemon starting"
    );

    let (shutdown_tx, mut shutdown) = watch::channel(false);
    setup_signal_handlers(shutdown_tx)?;

    let monitors = service
        .health()
        .spawn(&service.probe_periods(), shutdown.clone());
    let mut runs: Vec<JoinHandle<()>> = Vec::new();

    loop {
        if *shutdown.borrow() {
            info!("Shutdown requested, stopping intake");
            break;
        }

        tokio::select! {
            polled = poller.poll() => match polled {
                Ok(events) => {
                    for event in events {
                        info!(post = %event.post().source_post_id(), "Authoring event received");
                        runs.push(service.dispatch(event));
                    }
                }
                Err(e) => {
                    warn!("Polling updates failed: {}", e);
                    pause_unless_shutdown(POLL_BACKOFF, &mut shutdown).await;
                }
            },
            _ = shutdown.changed() => {}
        }

        runs.retain(|run| !run.is_finished());
    }

    if !runs.is_empty() {
        info!(in_flight = runs.len(), "Waiting for in-flight fan-outs");
    }
    for run in runs {
        if let Err(e) = run.await {
            error!("Fan-out task crashed: {}", e);
        }
    }
    for monitor in monitors {
        if let Err(e) = monitor.await {
            error!("Health monitor crashed: {}", e);
        }
    }

    info!("relay-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
/// Sleep for `delay` unless shutdown is requested first. Returns true on shutdown.
async fn pause_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn setup_signal_handlers(shutdown: watch::Sender<bool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| RelayError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: watch::Sender<bool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}

async fn sweep(config: Config) -> Result<()> {
    let db = Database::new(&config.database.path).await?;
    let providers = ProviderRegistry::from_config(&config.translation)?;
    let monitor = HealthMonitor::new(
        CredentialPool::new(db),
        providers,
        config.translation.request_timeout,
    );

    for provider in Provider::ALL {
        let report = monitor.sweep(provider).await?;
        println!(
            "{}: probed {}, recovered {}, exhausted {}, invalidated {}, removed {}",
            provider,
            report.probed,
            report.recovered,
            report.exhausted,
            report.invalidated,
            report.removed
        );
    }
    Ok(())
}

async fn provider(config: Config, name: Option<String>) -> Result<()> {
    let db = Database::new(&config.database.path).await?;
    let switch = ProviderSwitch::new(db, config.translation.default_provider);

    match name {
        None => println!("{}", switch.current().await?),
        Some(name) => {
            let provider: Provider = name.parse().map_err(RelayError::InvalidInput)?;
            switch.set(provider).await?;
            println!("{}", provider);
        }
    }
    Ok(())
}

async fn credentials(config: Config, command: CredentialCommand) -> Result<()> {
    let pool = CredentialPool::new(Database::new(&config.database.path).await?);

    match command {
        CredentialCommand::List => {
            for provider in Provider::ALL {
                for credential in pool.list(provider).await? {
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        credential.id,
                        credential.provider,
                        credential.masked_key(),
                        credential.language.as_deref().unwrap_or("*"),
                        credential.status.as_str()
                    );
                }
            }
        }
        CredentialCommand::AddDeepl { api_key } => {
            let stored = pool.add(&NewCredential::deepl(api_key)).await?;
            println!("{}", stored.id);
        }
        CredentialCommand::AddMistral {
            api_key,
            agent_id,
            language,
        } => {
            let stored = pool
                .add(&NewCredential::mistral(api_key, agent_id, language))
                .await?;
            println!("{}", stored.id);
        }
        CredentialCommand::Remove { id } => {
            if !pool.remove(id).await? {
                return Err(RelayError::InvalidInput(format!("No credential with id {}", id)));
            }
        }
    }
    Ok(())
}

async fn destinations(config: Config, command: DestinationCommand) -> Result<()> {
    let resolver = DestinationResolver::new(
        Database::new(&config.database.path).await?,
        config.translation.source_language.clone(),
    );

    match command {
        DestinationCommand::List => {
            for destination in resolver.list().await? {
                let language = resolver.resolve_language(&destination.channel_id).await?;
                println!(
                    "{}\t{}\t{}\t{}",
                    destination.channel_id,
                    destination.name,
                    language.name,
                    if destination.branding { "branded" } else { "plain" }
                );
            }
        }
        DestinationCommand::Add {
            channel_id,
            name,
            no_branding,
            discussion_link,
            discussion_text,
            invitation_link,
            invitation_text,
        } => {
            resolver
                .add(&Destination {
                    channel_id,
                    name,
                    branding: !no_branding,
                    link_discussion: discussion_link,
                    text_discussion: discussion_text,
                    link_invitation: invitation_link,
                    text_invitation: invitation_text,
                })
                .await?;
        }
        DestinationCommand::Remove { channel_id } => {
            if !resolver.remove(&channel_id).await? {
                return Err(RelayError::InvalidInput(format!(
                    "No destination {}",
                    channel_id
                )));
            }
        }
        DestinationCommand::Bind {
            channel_id,
            language,
        } => resolver.bind(&channel_id, &language).await?,
        DestinationCommand::Unbind { channel_id } => {
            resolver.unbind(&channel_id).await?;
        }
    }
    Ok(())
}

async fn languages(config: Config, command: LanguageCommand) -> Result<()> {
    let resolver = DestinationResolver::new(
        Database::new(&config.database.path).await?,
        config.translation.source_language.clone(),
    );

    match command {
        LanguageCommand::List => {
            for language in resolver.languages().await? {
                println!("{}\t{}", language.name, language.code);
            }
        }
        LanguageCommand::Add { name, code } => {
            resolver.register_language(&Language::new(name, code)).await?;
        }
        LanguageCommand::Remove { name } => {
            if !resolver.remove_language(&name).await? {
                return Err(RelayError::InvalidInput(format!("No language {}", name)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            pause_unless_shutdown(Duration::from_secs(60), &mut rx).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let interrupted = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("backoff should end on shutdown")
            .unwrap();
        assert!(interrupted);
    }

    #[tokio::test]
    async fn test_backoff_elapses_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!pause_unless_shutdown(Duration::from_millis(10), &mut rx).await);
    }
}
