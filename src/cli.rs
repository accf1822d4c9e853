use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use syncpoint::sync::SyncActionState;

#[derive(Parser, Debug)]
#[command(name = "syncpoint")]
#[command(about = "Serverless folder synchronization over a shared git history", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Create histories for every configured folder
    syncpoint init

    # Record the current state of one folder
    syncpoint snapshot docs

    # Turn new snapshots into sync actions and conflicts
    syncpoint sync

    # Show what changed in a folder since its first snapshot
    syncpoint diff docs

    # Keep the version from one folder for a conflicted path
    syncpoint resolve notes/todo.txt --keep laptop")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (default: ~/.config/syncpoint/config.toml)
    #[arg(long, global = true, env = "SYNCPOINT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (only show errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Create a history for every configured folder that lacks one
    Init,

    /// Record snapshots of folders (all configured folders by default)
    Snapshot {
        /// Folder names from the settings file
        folders: Vec<String>,
    },

    /// Compute sync actions and conflicts since the last sync point
    Sync,

    /// List the changes between two snapshots of a folder
    Diff {
        folder: String,

        /// Older snapshot (default: the first snapshot)
        #[arg(long)]
        from: Option<String>,

        /// Newer snapshot (default: the latest snapshot)
        #[arg(long)]
        to: Option<String>,
    },

    /// List sync actions
    Actions {
        /// Only actions in this state
        #[arg(long, value_enum)]
        state: Option<StateArg>,

        /// Only actions for this path
        #[arg(long)]
        path: Option<String>,
    },

    /// Move a sync action to another state
    Mark {
        id: String,

        #[arg(value_enum)]
        state: StateArg,
    },

    /// List unresolved conflicts
    Conflicts,

    /// Resolve a conflict
    Resolve {
        path: String,

        /// Queue the version this folder holds
        #[arg(long)]
        keep: Option<String>,
    },

    /// Stop tracking a folder
    Remove { folder: String },

    /// Show histories, the latest sync point and pending work
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StateArg {
    Queued,
    Active,
    Completed,
    Cancelled,
}

impl From<StateArg> for SyncActionState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Queued => SyncActionState::Queued,
            StateArg::Active => SyncActionState::Active,
            StateArg::Completed => SyncActionState::Completed,
            StateArg::Cancelled => SyncActionState::Cancelled,
        }
    }
}

impl Cli {
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }

        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_quiet() {
        let cli = Cli::parse_from(["syncpoint", "-q", "status"]);
        assert_eq!(cli.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_log_level_verbose() {
        assert_eq!(
            Cli::parse_from(["syncpoint", "sync"]).log_level(),
            tracing::Level::INFO
        );
        assert_eq!(
            Cli::parse_from(["syncpoint", "-v", "sync"]).log_level(),
            tracing::Level::DEBUG
        );
        assert_eq!(
            Cli::parse_from(["syncpoint", "sync", "-vvv"]).log_level(),
            tracing::Level::TRACE
        );
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["syncpoint", "snapshot", "docs", "music"]);
        assert_eq!(
            cli.command,
            Command::Snapshot {
                folders: vec!["docs".to_string(), "music".to_string()]
            }
        );

        let cli = Cli::parse_from(["syncpoint", "actions", "--state", "queued"]);
        assert_eq!(
            cli.command,
            Command::Actions {
                state: Some(StateArg::Queued),
                path: None
            }
        );

        let cli = Cli::parse_from(["syncpoint", "resolve", "a.txt", "--keep", "laptop"]);
        assert_eq!(
            cli.command,
            Command::Resolve {
                path: "a.txt".to_string(),
                keep: Some("laptop".to_string())
            }
        );
    }

    #[test]
    fn test_state_arg_maps_to_action_state() {
        assert_eq!(SyncActionState::from(StateArg::Cancelled), SyncActionState::Cancelled);
        assert!(Cli::try_parse_from(["syncpoint", "mark", "id", "bogus"]).is_err());
    }
}
