use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "blive",
    version,
    about = "Follow a Bilibili live room's danmu, gifts and super chats from the terminal"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "BLIVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// SESSDATA cookie, overrides the configuration file
    #[arg(long, global = true, env = "BLIVE_SESSDATA", hide_env_values = true)]
    pub sessdata: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a room and print its events until interrupted
    Listen {
        /// Room id or live room URL, short ids are resolved (defaults to `room_id` from the config)
        room: Option<String>,

        /// Also print every raw command envelope as JSON
        #[arg(long)]
        raw: bool,
    },

    /// Prompt accepting on/off/set/info/reset/reload
    Interactive,

    /// Show or reset the configuration
    Config {
        #[arg(long)]
        show: bool,

        #[arg(long)]
        reset: bool,
    },
}
