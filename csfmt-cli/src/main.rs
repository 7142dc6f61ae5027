//! csfmt-cli - Command-line interface for the csfmt formatter bridge.
//!
//! Formats files through a supervised host process, pings a running host,
//! and runs the postinstall smoke test.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use csfmt_client::ClientConfig;
use csfmt_protocol::EndOfLine;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csfmt-cli")]
#[command(about = "Command-line interface for the csfmt formatter bridge")]
#[command(version)]
struct Cli {
    /// Path to the host executable or library
    #[arg(long, env = "CSFMT_HOST_PATH")]
    host: Option<PathBuf>,

    /// Fail instead of returning the input unchanged when the host is down
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum EolArg {
    Lf,
    Crlf,
}

impl From<EolArg> for EndOfLine {
    fn from(value: EolArg) -> Self {
        match value {
            EolArg::Lf => EndOfLine::Lf,
            EolArg::Crlf => EndOfLine::Crlf,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Format a file (or stdin when no file is given)
    Format {
        /// File to format
        file: Option<PathBuf>,

        /// Desired line width
        #[arg(long)]
        width: Option<f64>,

        /// Spaces per indentation level
        #[arg(long)]
        tab_width: Option<u32>,

        /// Indent with tabs
        #[arg(long)]
        use_tabs: bool,

        /// Line terminator for the output
        #[arg(long, value_enum)]
        eol: Option<EolArg>,

        /// Byte range to format, as start..end
        #[arg(long)]
        range: Option<String>,

        /// Rewrite the file in place instead of printing
        #[arg(long)]
        write: bool,
    },

    /// Ping the host and report uptime
    Ping,

    /// Run the postinstall smoke test against the resolved host
    Smoke,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match ClientConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warning: {e}; using environment configuration");
            ClientConfig::from_env()
        }
    };
    if let Some(host) = &cli.host {
        config.host_path = Some(host.clone());
    }
    if cli.strict {
        config.strict = true;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let outcome = match cli.command {
        Commands::Format {
            file,
            width,
            tab_width,
            use_tabs,
            eol,
            range,
            write,
        } => commands::run_format(
            config,
            file,
            width,
            tab_width,
            use_tabs,
            eol.map(Into::into),
            range,
            write,
        ),
        Commands::Ping => commands::run_ping(config),
        Commands::Smoke => commands::run_smoke(config),
    };

    if let Err(e) = outcome {
        use colored::Colorize;
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}
