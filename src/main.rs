//! lunet CLI - run a Lua script on a single-writer runtime.
//!
//! The process waits for every invocation and timer to finish, then stops the
//! instance. The exit status is the script's `lunet.exit` code, `0` when it
//! returned normally, or `1` on error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lunet::{Completion, Instance, RuntimeConfig, ScriptError};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "lunet")]
#[command(version, about = "Run Lua scripts with coroutine-based async I/O", long_about = None)]
struct Cli {
    /// JSON runtime configuration. `LUNET_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lua file; remaining arguments are passed as `...`
    Run {
        file: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a Lua snippet
    Eval { code: String },
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    config.with_env_overrides()
}

fn exit_status(result: &Result<Completion, ScriptError>) -> u8 {
    match result {
        Ok(completion) => completion
            .exit_code
            .map_or(0, |code| u8::try_from(code & 0xff).unwrap_or(1)),
        Err(_) => 1,
    }
}

fn run(cli: Cli) -> Result<u8> {
    let config = load_config(cli.config.as_ref())?;
    let instance = Instance::new(config)?;
    instance.start()?;

    let result = match &cli.command {
        Commands::Run { file, args } => instance.run_file(file, args),
        Commands::Eval { code } => instance.run_string(code),
    };
    if let Err(e) = &result {
        eprintln!("lunet: {e}");
    }

    instance.wait();
    instance.stop();

    for error in instance.timer_errors() {
        log::warn!("[timer] {error}");
    }
    Ok(exit_status(&result))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run(Cli::parse()) {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("lunet: {e:#}");
            ExitCode::from(1)
        }
    }
}
