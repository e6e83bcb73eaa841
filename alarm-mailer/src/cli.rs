use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Mail batched notifications about alarm state changes.
#[derive(Parser, Debug)]
#[command(name = "alarm-mailer", version, about, args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'C', long, global = true, default_value = "daemon.conf.toml")]
    pub config: PathBuf,

    /// Colon-separated list of template directories
    #[arg(short = 'T', long, global = true, default_value = ".")]
    pub template: String,

    /// Also write the log to this file
    #[arg(short = 'L', long, global = true)]
    pub log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the mailer (default)
    Run(RunArgs),

    /// Send a single test mail using the [mail] settings
    TestMail(TestMailArgs),

    /// Render a template against a sample batch and print it
    Expand(ExpandArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// JSON-lines update feed (default: stdin)
    #[arg(long)]
    pub updates: Option<PathBuf>,

    /// Log mails instead of sending them
    #[arg(long)]
    pub nosend: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TestMailArgs {
    /// Recipient address
    #[arg(long)]
    pub to: String,

    /// Sender address
    #[arg(long)]
    pub from: String,

    /// Log the mail instead of sending it
    #[arg(long)]
    pub nosend: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExpandArgs {
    /// Template id (file name in the template path, or builtin:plain / builtin:html)
    pub template: String,
}
