//! Build automation tasks for the pg-cluster workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for pg-cluster")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, test, docs)
    Ci,
    /// Run cargo fmt --check
    Fmt,
    /// Run clippy on all targets
    Clippy,
    /// Run tests
    Test {
        /// Which part of the suite to run
        #[arg(value_enum, default_value_t = Suite::All)]
        suite: Suite,
    },
    /// Generate documentation
    Doc,
    /// Check the workspace against the minimum supported Rust version
    Msrv,
    /// Clean build artifacts
    Clean,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Suite {
    /// Unit and integration tests of every crate
    All,
    /// Unit tests of the pg-cluster crate only
    Unit,
    /// Connection pool integration tests
    Pool,
    /// Cluster routing integration tests
    Cluster,
}

const MSRV: &str = "1.85";

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // Change to workspace root
    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            test(&sh, Suite::All)?;
            doc(&sh)?;
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test { suite } => test(&sh, suite)?,
        Command::Doc => doc(&sh)?,
        Command::Msrv => msrv(&sh)?,
        Command::Clean => clean(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let path = String::from_utf8(output.stdout)
        .context("invalid UTF-8 in cargo output")?
        .trim()
        .to_string();

    Ok(PathBuf::from(path)
        .parent()
        .context("failed to get workspace root")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    println!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    println!("Formatting check passed.");
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    println!("Clippy check passed.");
    Ok(())
}

fn test(sh: &Shell, suite: Suite) -> Result<()> {
    match suite {
        Suite::All => {
            println!("Running all tests...");
            cmd!(sh, "cargo test --workspace").run()?;
        }
        Suite::Unit => {
            println!("Running pg-cluster unit tests...");
            cmd!(sh, "cargo test -p pg-cluster --lib").run()?;
        }
        Suite::Pool => {
            println!("Running pool integration tests...");
            cmd!(sh, "cargo test -p pg-cluster-testing --test pool").run()?;
        }
        Suite::Cluster => {
            println!("Running cluster integration tests...");
            cmd!(sh, "cargo test -p pg-cluster-testing --test cluster").run()?;
        }
    }
    println!("Tests passed.");
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    println!("Generating documentation...");
    cmd!(sh, "cargo doc --workspace --no-deps")
        .env("RUSTDOCFLAGS", "-D warnings")
        .run()?;
    println!("Documentation generated.");
    Ok(())
}

fn msrv(sh: &Shell) -> Result<()> {
    println!("Checking against Rust {MSRV}...");
    let toolchain = format!("+{MSRV}");
    cmd!(sh, "cargo {toolchain} check --workspace --all-targets").run()?;
    println!("MSRV check passed.");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("Cleaning build artifacts...");
    cmd!(sh, "cargo clean").run()?;
    println!("Clean complete.");
    Ok(())
}
