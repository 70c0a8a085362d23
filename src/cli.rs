use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "planrun",
    about = "Approval-gated autonomous command execution driven by an LLM plan loop",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Work toward a goal through the pass loop
    Run {
        /// Natural-language goal for this session
        goal: String,

        /// Approve every command without asking
        #[arg(long)]
        auto_approve: bool,

        /// Replace the plan wholesale on every update instead of merging
        #[arg(long)]
        no_merge: bool,

        /// Override the configured model
        #[arg(long)]
        model: Option<String>,

        /// Resume from the persisted plan snapshot
        #[arg(long)]
        resume: bool,

        /// Cap on passes for this session
        #[arg(long)]
        max_passes: Option<u32>,
    },

    /// Show the persisted plan snapshot
    Plan {
        /// Emit JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show project configuration
    Config,

    /// Generate shell completions
    Completions { shell: CompletionShell },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
