//! CLI argument parsing for stracefile

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "stracefile")]
#[command(version)]
#[command(about = "Convert strace logs into Chrome trace files", long_about = None)]
pub struct Cli {
    /// Only trace the specified syscalls (passed through to strace as -e)
    #[arg(short = 'e', long = "expr", value_name = "EXPR")]
    pub syscalls: Option<String>,

    /// Path of the trace file to write
    #[arg(
        short = 'o',
        long = "output",
        value_name = "FILE",
        default_value = "stracefile.json"
    )]
    pub output: PathBuf,

    /// Stop the traced command after this many seconds
    #[arg(short = 't', long = "timeout", value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Print internal diagnostics to stderr
    #[arg(long)]
    pub debug: bool,

    /// Command to trace (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}
