use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the vendorlink workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run every test in the workspace
    Test,
    /// Clippy with warnings denied
    Lint,
    /// Run the vendorlink CLI, forwarding the remaining arguments
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(task: &str, args: &[&str]) -> Result<()> {
    println!("{}...", task);
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", task);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => cargo("Building workspace", &["build", "--workspace"]),
        Commands::Test => cargo("Testing workspace", &["test", "--workspace"]),
        Commands::Lint => cargo(
            "Linting workspace",
            &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
        ),
        Commands::Run { args } => {
            let mut full = vec!["run", "-p", "vendorlink-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo("Running vendorlink", &full)
        }
    }
}
