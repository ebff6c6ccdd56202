//! Resound CLI entry point

use anyhow::Result;
use clap::Parser;

use resound_cli::{Cli, execute};

fn main() -> Result<()> {
    let cli = Cli::parse();
    execute(cli)
}
