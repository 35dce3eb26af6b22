mod constitution;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    ironcurtain_config::{Home, UserConfig, load_config},
    ironcurtain_escalation::AutoApprover,
    ironcurtain_llm::{InteractionLogger, LlmClient},
    ironcurtain_mcp::McpServer,
    ironcurtain_mitm::{MitmConfig, MitmProxy},
    ironcurtain_pipeline::{PipelineConfig, PipelineOutcome, run_pipeline},
    ironcurtain_proxy::{Mediator, MediatorConfig},
    secrecy::SecretString,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "ironcurtain", about = "IronCurtain — secure agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom home directory (overrides default ~/.ironcurtain/).
    #[arg(long, global = true, env = "IRONCURTAIN_HOME")]
    home_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trusted mediator on stdio (default when no subcommand).
    Proxy,
    /// Compile the constitution and tool annotations into policy artifacts.
    CompilePolicy,
    /// Run the TLS-terminating API proxy on a Unix socket.
    Mitm {
        /// Socket path (defaults to <home>/mitm.sock).
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Edit the user constitution overlay.
    Customize,
    /// Signal transport setup instructions.
    SetupSignal,
    /// Agent session entry point (delegated to the agent adapter).
    Session {
        /// Resume a previous session.
        #[arg(long)]
        resume: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config file path.
    Path,
    /// Print the current configuration (credentials omitted).
    Show,
}

fn init_tracing(cli: &Cli) {
    // Logs go to stderr: stdout belongs to the MCP stdio protocol.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let home = Home::resolve(cli.home_dir.as_deref())?;
    home.ensure_layout()?;
    let (config, _raw) = load_config(&home.config_file())?;

    match cli.command.unwrap_or(Commands::Proxy) {
        Commands::Proxy => run_proxy(home, config).await,
        Commands::CompilePolicy => run_compile(home, config).await,
        Commands::Mitm { socket } => run_mitm(home, config, socket).await,
        Commands::Config { action } => run_config(&home, &config, action),
        Commands::Customize => run_customize(&home),
        Commands::SetupSignal => {
            println!(
                "Signal transport runs outside the mediator. Point signal-cli at\n  {}\n\
                 and have the bot answer escalation request files with response files.",
                home.escalations_dir().display()
            );
            Ok(())
        },
        Commands::Session { resume } => {
            match resume {
                Some(id) => println!("Resuming sessions is handled by the agent adapter (session {id})."),
                None => println!("Sessions are started by the agent adapter; run `ironcurtain proxy`."),
            }
            Ok(())
        },
    }
}

async fn run_proxy(home: Home, config: UserConfig) -> Result<()> {
    let auto_approver = if config.auto_approve.enabled {
        match anthropic_key(&config) {
            Some(key) => {
                let logger = Arc::new(InteractionLogger::new(home.llm_interactions()));
                let client = LlmClient::new(key, config.models.auto_approve.clone())
                    .with_logger(logger);
                Some(AutoApprover::new(client, home.user_context()))
            },
            None => {
                warn!("auto-approve enabled but no anthropic API key configured; disabling");
                None
            },
        }
    } else {
        None
    };

    let mediator = Mediator::start(MediatorConfig {
        home,
        user_config: config,
        auto_approver,
        network_socket: None,
    })
    .await?;

    let server = McpServer::new("ironcurtain", mediator);
    tokio::select! {
        result = server.run_stdio() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }
    server.handler().shutdown().await;
    Ok(())
}

async fn run_compile(home: Home, config: UserConfig) -> Result<()> {
    let key = anthropic_key(&config)
        .context("no anthropic API key in config.json or ANTHROPIC_API_KEY")?;
    let logger = Arc::new(InteractionLogger::new(home.llm_interactions()));
    let compiler = LlmClient::new(key.clone(), config.models.compiler.clone())
        .with_logger(Arc::clone(&logger));
    let judge = LlmClient::new(key, config.models.judge.clone()).with_logger(logger);

    let constitution = constitution::load(&home)?;
    let outcome = run_pipeline(PipelineConfig {
        home,
        user_config: config,
        constitution,
        compiler,
        judge,
    })
    .await?;

    match outcome {
        PipelineOutcome::Verified => {
            info!("policy compiled and verified");
            Ok(())
        },
        PipelineOutcome::Cached => {
            info!("all stages cached; artifacts unchanged");
            Ok(())
        },
        PipelineOutcome::VerificationFailed {
            remaining_mismatches,
        } => {
            error!(
                remaining_mismatches,
                "verification did not converge; artifacts written for inspection"
            );
            std::process::exit(2);
        },
    }
}

async fn run_mitm(home: Home, config: UserConfig, socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(|| home.base().join("mitm.sock"));
    let proxy = MitmProxy::new(MitmConfig {
        socket_path,
        ca_dir: home.ca_dir(),
        real_keys: provider_keys(&config),
    })?;
    proxy.start().await?;
    info!(
        socket = %proxy.socket_path().display(),
        "MITM proxy running; ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;
    proxy.shutdown().await;
    Ok(())
}

fn run_config(home: &Home, config: &UserConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Path => println!("{}", home.config_file().display()),
        ConfigAction::Show => {
            let mut value = serde_json::to_value(config)?;
            if let Some(obj) = value.as_object_mut() {
                obj.remove("providers");
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        },
    }
    Ok(())
}

fn run_customize(home: &Home) -> Result<()> {
    let path = home.user_constitution();
    if !path.exists() {
        std::fs::write(&path, "# User constitution overrides\n")?;
    }
    match std::env::var("EDITOR") {
        Ok(editor) => {
            let status = std::process::Command::new(editor).arg(&path).status()?;
            if !status.success() {
                anyhow::bail!("editor exited with {status}");
            }
            println!("Re-run `ironcurtain compile-policy` to apply the changes.");
        },
        Err(_) => println!(
            "Edit {} and re-run `ironcurtain compile-policy`.",
            path.display()
        ),
    }
    Ok(())
}

/// The compiler/judge/auto-approve key: config first, environment second.
fn anthropic_key(config: &UserConfig) -> Option<SecretString> {
    config
        .providers
        .get("anthropic")
        .and_then(|p| p.api_key.clone())
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .map(SecretString::new)
}

/// Real provider keys for the MITM proxy, keyed by provider host.
fn provider_keys(config: &UserConfig) -> HashMap<String, SecretString> {
    let host_for = |name: &str| match name {
        "anthropic" => Some("api.anthropic.com"),
        "openai" => Some("api.openai.com"),
        "google" => Some("generativelanguage.googleapis.com"),
        _ => None,
    };
    config
        .providers
        .iter()
        .filter_map(|(name, provider)| {
            let host = host_for(name)?;
            let key = provider.api_key.clone()?;
            Some((host.to_string(), SecretString::new(key)))
        })
        .collect()
}
