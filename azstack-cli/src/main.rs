use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;

mod commands;
mod config;
mod display;

use config::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(name = "azstack")]
#[command(about = "Manage Azure Stack Hub compute resources", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log debug output (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// Show execution plan without applying changes
    Plan,
    /// Apply changes to reach the desired state
    Apply,
    /// Destroy all managed resources
    Destroy {
        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Bring an existing resource under management
    Import {
        /// Resource address, e.g. azurestack_managed_disk.data
        address: String,
        /// ARM ID of the existing resource
        id: String,
    },
    /// Inspect the saved state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Release a state lock left behind by an interrupted run
    ForceUnlock {
        lock_id: String,
    },
    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List managed resources
    List,
    /// Show the attributes of one managed resource
    Show {
        address: String,
    },
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.config.as_path();
    let result = match cli.command {
        Commands::Validate => commands::run_validate(config),
        Commands::Plan => commands::run_plan(config).await,
        Commands::Apply => commands::run_apply(config).await,
        Commands::Destroy { auto_approve } => commands::run_destroy(config, auto_approve).await,
        Commands::Import { address, id } => commands::run_import(config, &address, &id).await,
        Commands::State { command } => match command {
            StateCommands::List => commands::run_state_list(config).await,
            StateCommands::Show { address } => commands::run_state_show(config, &address).await,
        },
        Commands::ForceUnlock { lock_id } => commands::run_force_unlock(config, &lock_id).await,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "azstack", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "azstack",
            "import",
            "azurestack_image.base",
            "/id",
            "-v",
            "-c",
            "prod.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("prod.json"));
        assert!(matches!(cli.command, Commands::Import { .. }));
    }
}
