mod app;
mod chat;
mod common;
mod config;
mod network;
mod pairing;
#[cfg(test)]
mod testing;

use std::error::Error;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;

use app::FindOptions;

#[derive(Parser)]
#[command(
    name = "rust_p2p_match",
    version,
    about = "Find a chat partner by shared token over the libp2p DHT"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Advertise under a token, pair with one peer sharing it, then chat
    Find {
        /// Rendezvous token shared with the partner
        #[arg(short, long, default_value = "chat-public-p2pchat")]
        token: String,
        /// Name shown next to your messages
        #[arg(short, long, default_value = "user")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let app_config = config::load_config(&cli.config);

    match cli.command {
        Command::Find { token, name } => {
            if let Err(err) = app::run_find(app_config, FindOptions { token, name }).await {
                log::error!("Failed to start: {err}");
                return Err(err);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_defaults() {
        let cli = Cli::try_parse_from(["rust_p2p_match", "find"]).unwrap();
        assert_eq!(cli.config, config::DEFAULT_CONFIG_PATH);
        let Command::Find { token, name } = cli.command;
        assert_eq!(token, "chat-public-p2pchat");
        assert_eq!(name, "user");
    }

    #[test]
    fn find_flags() {
        let cli = Cli::try_parse_from(["rust_p2p_match", "find", "-t", "abc", "--name", "eve"])
            .unwrap();
        let Command::Find { token, name } = cli.command;
        assert_eq!((token.as_str(), name.as_str()), ("abc", "eve"));
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["rust_p2p_match"]).is_err());
    }
}
