//! Command-line interface: convert one magnet link, or a file of them,
//! into `.torrent` files.
use clap::{Parser, Subcommand, ValueEnum};
use demagnetize::core::Demagnetizer;
use demagnetize::magnet::Magnet;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "demagnetize", version, about)]
struct Cli {
    /// Set logging level
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert a magnet URL to a .torrent file
    Get {
        /// The magnet link to fetch
        magnet: String,

        /// Filename template; {name} and {hash} are filled in
        #[arg(short, long, default_value = "{name}.torrent")]
        outfile: String,
    },
    /// Convert a collection of magnet URLs to .torrent files
    Batch {
        /// File with one magnet link per line; blank lines and lines
        /// starting with '#' are skipped
        magnetfile: PathBuf,

        /// Filename template; {name} and {hash} are filled in
        #[arg(short, long, default_value = "{name}.torrent")]
        outfile: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("demagnetize={}", cli.log_level.as_str())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    match cli.command {
        Command::Get { magnet, outfile } => {
            let magnet: Magnet = match magnet.parse() {
                Ok(magnet) => magnet,
                Err(e) => {
                    error!("invalid magnet URL: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let app = Demagnetizer::new();
            let report = app.demagnetize_to_file(&magnet, &outfile).await;
            exit_code(report.ok())
        }
        Command::Batch { magnetfile, outfile } => {
            let contents = match tokio::fs::read_to_string(&magnetfile).await {
                Ok(contents) => contents,
                Err(e) => {
                    error!("error reading {}: {e}", magnetfile.display());
                    return ExitCode::FAILURE;
                }
            };
            let mut magnets = Vec::new();
            for line in yield_lines(&contents) {
                match line.parse::<Magnet>() {
                    Ok(magnet) => magnets.push(magnet),
                    Err(e) => error!("invalid magnet URL: {line}: {e}"),
                }
            }
            if magnets.is_empty() {
                info!("no magnet URLs to fetch");
                return ExitCode::SUCCESS;
            }
            let app = Demagnetizer::new();
            let report = app.download_torrents(magnets, &outfile).await;
            info!(
                "{}/{} magnet URLs successfully converted to torrent files",
                report.finished(),
                report.total()
            );
            exit_code(report.ok())
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Non-blank, non-comment lines of a magnet file.
fn yield_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        let contents = "\n# comment\n  magnet:?xt=a  \n\nmagnet:?xt=b\n";
        let lines: Vec<&str> = yield_lines(contents).collect();
        assert_eq!(lines, vec!["magnet:?xt=a", "magnet:?xt=b"]);
    }
}
