//! The `lyrical` command: compile a source file, execute it, or serve
//! HTTP requests with it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use lyrical_cli::compile::{compile_file, run_compiled, CompileOptions};

#[derive(Parser)]
#[command(name = "lyrical", version, about = "Lyrical toolchain driver")]
struct Cli {
    /// Source file to compile and execute.
    sourcefile: PathBuf,

    /// Write a human-readable compilation log to the cache.
    #[arg(short = 'l')]
    log: bool,

    /// Emit debug information to the cache.
    #[arg(short = 'g')]
    debug: bool,

    /// Serve HTTP over TCP/IPv4, forking per connection; defaults to
    /// 0.0.0.0:8080.
    #[arg(
        long = "tcpipv4addr",
        value_name = "[ip][:port]",
        num_args = 0..=1,
        default_missing_value = ""
    )]
    tcpipv4addr: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("lyrical: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let opts = CompileOptions {
        log: cli.log,
        debug: cli.debug,
        ..Default::default()
    };
    let compiled = compile_file(&cli.sourcefile, &opts)?;

    if let Some(addr) = &cli.tcpipv4addr {
        #[cfg(unix)]
        {
            let addr = lyrical_cli::server::parse_addr(addr)?;
            lyrical_cli::server::serve(addr, &compiled)?;
            return Ok(ExitCode::SUCCESS);
        }
        #[cfg(not(unix))]
        {
            let _ = addr;
            anyhow::bail!("server mode requires a unix platform");
        }
    }

    let outcome = run_compiled(&compiled)?;
    log::debug!("program returned {} after {} steps", outcome.exit, outcome.steps);
    Ok(ExitCode::from(outcome.exit as u8))
}
