//! sockspiped — the pipe-served SOCKS5 bridge daemon.
//!
//! Binds the configured endpoint and bridges framed peer traffic to outgoing
//! SOCKS5 target connections until a peer sends `uninstall_self`.
//!
//! Usage:
//!   sockspiped -c /path/to/config.yaml

use sockspipe::config::Config;
use sockspipe::worker::{ExitReason, Worker};

// Exit-code surface shared with the host-side tooling. Codes 3 (already
// running) and 4 (api) belong to collaborators outside this process:
// single-instance enforcement and service management.
const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_ARG: i32 = 2;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_args(&args);

    match run(&config_path) {
        Ok(reason) => {
            eprintln!("worker stopped ({:?})", reason);
            std::process::exit(EXIT_OK);
        }
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(EXIT_ERROR);
        }
    }
}

fn parse_args(args: &[String]) -> String {
    let mut i = 1;
    while i < args.len() {
        if args[i] == "-c" && i + 1 < args.len() {
            return args[i + 1].clone();
        }
        i += 1;
    }
    eprintln!("Usage: sockspiped -c <config.yaml>");
    std::process::exit(EXIT_ARG);
}

fn run(config_path: &str) -> Result<ExitReason, Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    let worker = Worker::new(config.worker_config());
    worker.launch()?;
    eprintln!("serving endpoint {}", worker.endpoint().display());

    Ok(worker.wait())
}
