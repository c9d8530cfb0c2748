// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sidd`: constructs the daemon's root resource and one worker-control
//! resource under it, then runs the shared event loop until `SIGTERM`/
//! `SIGINT`. Argument parsing, tracing setup, and resource construction are
//! its only jobs — everything else lives in `sid-core`/`sid-worker`.

use tracing_subscriber::EnvFilter;

use sid_daemon::{env, root};
use sid_worker::{WorkerControlConfig, WorkerKindConfig};

const USAGE: &str = "Usage: sidd [options]\n\
\n\
    -h, --help       Show this help information.\n\
    -v, --verbose    Verbose mode, repeat to increase level.\n\
    -V, --version    Show version.\n";

struct Args {
    verbose: u8,
}

enum ParsedArgs {
    Run(Args),
    Exit(i32),
}

fn parse_args(argv: impl Iterator<Item = String>) -> ParsedArgs {
    let mut verbose = 0u8;
    for arg in argv {
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{USAGE}");
                return ParsedArgs::Exit(0);
            }
            "-V" | "--version" => {
                println!("sidd {}", env!("CARGO_PKG_VERSION"));
                return ParsedArgs::Exit(0);
            }
            "-v" | "--verbose" => verbose = verbose.saturating_add(1),
            other => {
                eprintln!("sidd: unrecognized option '{other}'\n{USAGE}");
                return ParsedArgs::Exit(1);
            }
        }
    }
    ParsedArgs::Run(Args { verbose })
}

fn init_tracing(verbose: u8) {
    let default_directive = if verbose > 0 { "debug" } else { env::default_log_directive() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> std::process::ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        ParsedArgs::Exit(code) => return std::process::ExitCode::from(code as u8),
        ParsedArgs::Run(args) => args,
    };

    init_tracing(args.verbose);

    if let Err(e) = run() {
        tracing::error!(error = %e, "sidd exited with an error");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run() -> sid_worker::Result<()> {
    let sid_res = root::create_root().map_err(sid_worker::Error::from)?;

    sid_worker::control::create(
        &sid_res,
        None,
        WorkerControlConfig::new(WorkerKindConfig::Internal).with_default_timeout(env::default_exec_timeout()),
        &[],
    )?;

    tracing::info!("sidd started");
    sid_res.run_event_loop().map_err(sid_worker::Error::from)
}
