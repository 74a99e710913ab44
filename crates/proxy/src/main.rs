// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::{Parser, Subcommand};
use tracing::error;

use authproxy::cli;
use authproxy::config::{ProxyConfig, DAEMON_MARKER_ENV};

/// Local OAuth credential proxy.
#[derive(Parser)]
#[command(name = "authproxy", version, about)]
struct Cli {
    #[command(flatten)]
    config: ProxyConfig,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy daemon in the foreground.
    Serve,
    /// Start the proxy daemon if it is not already running.
    Start,
    /// Stop the running proxy daemon.
    Stop,
    /// Show daemon, refresher and token status.
    Status,
    /// Sign in through the browser and store the tokens.
    Login,
    /// Delete stored tokens.
    Logout,
    /// Print the current bearer token, starting the daemon if needed.
    Token,
    /// Make sure a usable token exists, starting re-authentication if needed.
    Ensure,
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(&args.config);

    // A spawned daemon always serves, whatever arguments it inherited.
    let command = if std::env::var_os(DAEMON_MARKER_ENV).is_some() {
        Command::Serve
    } else {
        args.command.unwrap_or(Command::Status)
    };

    let code = match command {
        Command::Serve => match authproxy::run_daemon(args.config).await {
            Ok(()) => 0,
            Err(e) => {
                error!("fatal: {e:#}");
                1
            }
        },
        Command::Start => cli::start(&args.config).await,
        Command::Stop => cli::stop(&args.config).await,
        Command::Status => cli::status(&args.config).await,
        Command::Login => cli::login(&args.config).await,
        Command::Logout => cli::logout(&args.config),
        Command::Token => cli::token(&args.config).await,
        Command::Ensure => cli::ensure(&args.config).await,
    };
    std::process::exit(code);
}

fn init_tracing(config: &ProxyConfig) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output; logs go to stderr.
    match config.log_format.as_str() {
        "json" => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init();
        }
        _ => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
}
