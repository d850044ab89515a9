//! Bull Vision - tool server session host.
//!
//! Starts the configured tool servers and lets you inspect and call their
//! tools from the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bullvision::mcp::{
    extract_text_content, format_tool, parse_arguments, ServerSessionManager, ToolServerSpec,
};
use bullvision::Config;

/// Tool server session host for the Bull Vision trading assistant
#[derive(Parser)]
#[command(name = "bullvision")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to .bullvision.toml, then the user config dir)
    #[arg(short, long, global = true, env = "BULLVISION_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured tool servers without starting them
    Servers,

    /// Start the servers and list their tools
    Tools {
        /// Only start and list a specific server
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Call one tool and print its text output
    Call {
        /// Server name
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },

    /// Start and stop every server, reporting readiness
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for command output
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // `${VAR}` references in server env are expanded against this
    dotenvy::dotenv().ok();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };

    if let Commands::Servers = cli.command {
        cmd_servers(&config);
        return Ok(());
    }

    let specs = select_specs(&config, &cli.command)?;
    let manager = Arc::new(ServerSessionManager::new(config.session_settings()));

    let outcome = tokio::select! {
        result = run_command(&manager, specs, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Err(anyhow::anyhow!("Interrupted"))
        }
    };

    manager.stop().await;
    outcome
}

fn cmd_servers(config: &Config) {
    if config.servers.is_empty() {
        println!("No tool servers configured.");
        println!("\nAdd servers to .bullvision.toml:");
        println!("  [[servers]]");
        println!("  name = \"search-stock-news\"");
        println!("  command = \"uvx\"");
        println!("  args = [\"search-stock-news\"]");
        return;
    }

    println!("Configured tool servers:\n");
    for server in &config.servers {
        println!("  {} - {}", server.name, server.command);
        if !server.args.is_empty() {
            println!("    Args: {}", server.args.join(" "));
        }
        if !server.env.is_empty() {
            let mut keys: Vec<_> = server.env.keys().cloned().collect();
            keys.sort();
            println!("    Env: {}", keys.join(", "));
        }
    }
    println!("\nTotal: {} server(s)", config.servers.len());
}

/// Specs the command needs, in configuration order.
fn select_specs(config: &Config, command: &Commands) -> Result<Vec<ToolServerSpec>> {
    let specs = config.server_specs()?;

    let wanted = match command {
        Commands::Tools { server: Some(name) } | Commands::Call { server: name, .. } => name,
        _ => return Ok(specs),
    };

    let selected: Vec<_> = specs.into_iter().filter(|s| &s.name == wanted).collect();
    if selected.is_empty() {
        anyhow::bail!("Server '{}' not found.", wanted);
    }
    Ok(selected)
}

async fn run_command(
    manager: &ServerSessionManager,
    specs: Vec<ToolServerSpec>,
    command: Commands,
) -> Result<()> {
    if specs.is_empty() {
        anyhow::bail!("No tool servers configured.");
    }

    // Validate before spawning anything
    let arguments = match &command {
        Commands::Call { args: Some(json), .. } => {
            Some(parse_arguments(json).map_err(|e| anyhow::anyhow!(e))?)
        }
        _ => None,
    };

    let handles = manager.start(specs).await?;

    match command {
        Commands::Servers => {}

        Commands::Tools { .. } => {
            println!("Available tools:\n");
            let mut total = 0;

            for handle in &handles {
                let server = manager.server_name(*handle).unwrap_or_default();
                let tools = manager.list_tools(*handle).await?;
                for tool in tools.iter() {
                    println!("  {}", format_tool(tool, Some(&server)).replace('\n', "\n  "));
                }
                total += tools.len();
            }

            if total == 0 {
                println!("  No tools available.");
            } else {
                println!("\nTotal: {} tool(s)", total);
            }
        }

        Commands::Call { server, tool, .. } => {
            let handle = manager
                .handle_by_name(&server)
                .ok_or_else(|| anyhow::anyhow!("Server '{}' not found.", server))?;

            tracing::info!(server = %server, tool = %tool, "Calling tool");
            let result = manager
                .call_tool(handle, &tool, arguments)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to call tool: {}", e))?;

            println!("{}", extract_text_content(&result));
        }

        Commands::Check => {
            for handle in &handles {
                let connection = manager.connection(*handle)?;
                let info = connection
                    .server_info()
                    .map(|info| match &info.version {
                        Some(version) => format!(" ({} {})", info.name, version),
                        None => format!(" ({})", info.name),
                    })
                    .unwrap_or_default();
                println!("  {}: {}{}", connection.name(), connection.state(), info);
            }
            println!("\nAll {} server(s) ready.", handles.len());
        }
    }

    Ok(())
}
