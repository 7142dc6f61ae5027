//! Subcommand implementations.

use colored::Colorize;
use csfmt_client::{smoke, ClientConfig, FormatClient, FormatSettings};
use csfmt_protocol::EndOfLine;
use std::io::Read;
use std::path::PathBuf;

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

#[allow(clippy::too_many_arguments)]
pub fn run_format(
    config: ClientConfig,
    file: Option<PathBuf>,
    width: Option<f64>,
    tab_width: Option<u32>,
    use_tabs: bool,
    eol: Option<EndOfLine>,
    range: Option<String>,
    write: bool,
) -> CommandResult {
    let source = match &file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    let settings = FormatSettings {
        print_width: width,
        tab_width,
        use_tabs: use_tabs.then_some(true),
        end_of_line: eol,
    };
    let range = range.map(|spec| parse_range(&spec)).transpose()?;

    let mut client = FormatClient::new(config);
    let formatted = client.format(&source, &settings, range)?;

    match (&file, write) {
        (Some(path), true) => {
            std::fs::write(path, &formatted)?;
            eprintln!("{} {}", "formatted".green(), path.display());
        }
        _ => print!("{formatted}"),
    }
    Ok(())
}

pub fn run_ping(config: ClientConfig) -> CommandResult {
    let mut client = FormatClient::new(config);
    let pong = client.ping()?;
    println!(
        "{} uptime {} ms, {} active request(s)",
        "host alive:".green().bold(),
        pong.uptime_ms,
        pong.active_requests
    );
    Ok(())
}

pub fn run_smoke(config: ClientConfig) -> CommandResult {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    match runtime.block_on(smoke::run(&config)) {
        Ok(report) => {
            println!(
                "{} host {} answered in {:?}",
                "smoke test passed:".green().bold(),
                report.host_version.as_deref().unwrap_or("(unversioned)"),
                report.elapsed
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {e}", "smoke test failed:".red().bold());
            std::process::exit(1);
        }
    }
}

/// Parses a `start..end` byte range.
fn parse_range(spec: &str) -> Result<std::ops::Range<usize>, String> {
    let (start, end) = spec
        .split_once("..")
        .ok_or_else(|| format!("invalid range {spec:?}, expected start..end"))?;
    let start: usize = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid range start {start:?}"))?;
    let end: usize = end
        .trim()
        .parse()
        .map_err(|_| format!("invalid range end {end:?}"))?;
    if end <= start {
        return Err(format!("range end must be after start in {spec:?}"));
    }
    Ok(start..end)
}
