//! NodeLink CLI: run a peer-to-peer endpoint from the terminal.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::*;
use clap::Parser;

/// Trace to stderr. `RUST_LOG` wins over the configured level.
fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => cmd::init::cmd_init(cli.config, force),
        Commands::Config(sub) => match sub {
            ConfigCommands::Show => cmd::config::cmd_config_show(cli.config),
            ConfigCommands::Path => cmd::config::cmd_config_path(cli.config),
        },
        Commands::Run { subjects } => {
            let config = config::load_config(cli.config.as_deref());
            init_tracing_stderr(&config.log_level);
            cmd::node::cmd_run(config, subjects);
        }
        Commands::Invoke {
            peer,
            command,
            arguments,
            wait,
        } => {
            let config = config::load_config(cli.config.as_deref());
            init_tracing_stderr(&config.log_level);
            cmd::node::cmd_invoke(config, peer, command, arguments, wait);
        }
        Commands::Completion { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "nodelink", &mut std::io::stdout());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_run_subjects_cli_parse() {
        let cli = Cli::try_parse_from([
            "nodelink",
            "run",
            "--subject",
            "telemetry",
            "--subject",
            "logs",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { subjects } => assert_eq!(subjects, vec!["telemetry", "logs"]),
            _ => panic!("Expected run"),
        }
    }

    #[test]
    fn test_invoke_cli_parse_defaults() {
        let peer = uuid::Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "nodelink",
            "--config",
            "/tmp/node.toml",
            "invoke",
            &peer.to_string(),
            "status",
        ])
        .unwrap();
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/node.toml"))
        );
        match cli.command {
            Commands::Invoke {
                peer: parsed,
                command,
                arguments,
                wait,
            } => {
                assert_eq!(parsed, peer);
                assert_eq!(command, "status");
                assert_eq!(arguments, "null");
                assert_eq!(wait, 10);
            }
            _ => panic!("Expected invoke"),
        }
    }

    #[test]
    fn test_invoke_rejects_bad_uuid() {
        assert!(Cli::try_parse_from(["nodelink", "invoke", "not-a-uuid", "echo"]).is_err());
    }
}
