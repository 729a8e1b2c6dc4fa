//! [AMBIENT] A2 — CLI entry point. Parses flags, loads configuration,
//! initializes logging, builds a [`Runtime`], and dispatches to one of the
//! four user actions (§6).

mod config;
mod error;
mod fetch;
mod identity;
mod index;
mod maildir;
mod message;
mod move_op;
mod reconciler;
mod runtime;
mod session;

use clap::{Parser, ValueEnum};
use log::{error, info, LevelFilter};

use config::Config;
use error::EngineError;
use fetch::Scope;
use runtime::Runtime;

/// The four user actions from spec §1/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
enum Op {
    Sync,
    FetchNew,
    FetchAll,
    Move,
}

/// Flag table from spec §6, reproduced verbatim (single-dash long flags to
/// match the original tool's interface).
#[derive(Debug, Parser)]
#[clap(name = "inboxsync", author, version)]
struct Cli {
    /// Path to JSON config, or "-" to read from standard input.
    #[clap(long = "config")]
    config: Option<String>,

    /// One of sync, fetch-new, fetch-all, move.
    #[clap(long = "op", default_value = "sync")]
    op: Op,

    /// Folder for fetch/move.
    #[clap(long = "folder", default_value = "INBOX")]
    folder: String,

    /// Message-ID literal, or filesystem path whose Message-ID header is
    /// parsed, for `-op move`.
    #[clap(long = "mid", default_value = "")]
    mid: String,

    /// For sync: log the delete plan without mutating anything.
    #[clap(long = "dryRun")]
    dry_run: bool,

    /// 0 silent-ish, 1 info, 2 debug.
    #[clap(long = "verbose", default_value_t = 0)]
    verbose: u8,

    /// If set, enable process profiling to the given file. Out of scope
    /// per spec §1; the flag is accepted and acknowledged but unused.
    #[clap(long = "profiler")]
    profiler: Option<String>,
}

/// The original tool's flags are single-dash (`-config`, `-dryRun`, ...),
/// but clap's `long = "..."` only matches a leading `--`. Rewrites argv so a
/// leading single `-` followed by 2+ alphanumeric characters becomes `--`
/// before `Cli::parse_from` sees it, so both spellings work and short flags
/// (single letter, if any are ever added) are left alone.
fn normalize_single_dash_long_flags(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if arg.starts_with("--") {
                return arg;
            }
            let rest = match arg.strip_prefix('-') {
                Some(rest) => rest,
                None => return arg,
            };
            let name_end = rest.find('=').unwrap_or(rest.len());
            let name = &rest[..name_end];
            if name.len() >= 2 && name.chars().all(|c| c.is_ascii_alphanumeric()) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn run(cli: Cli) -> Result<(), EngineError> {
    if let Some(profiler) = &cli.profiler {
        info!("profiler requested at {profiler:?}; profiling is out of scope, ignoring");
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let config = Config::load(&config_path)?;

    let runtime = Runtime::start(config)?;
    let result = dispatch(&runtime, &cli);
    runtime.shutdown();
    result
}

fn dispatch(runtime: &Runtime, cli: &Cli) -> Result<(), EngineError> {
    match cli.op {
        Op::Sync => {
            let count = reconciler::sync(
                &runtime.pool,
                &runtime.index,
                &runtime.maildir_root,
                runtime.config.common_inbox,
                cli.dry_run,
            )?;
            info!("sync: {count} message(s) {}", if cli.dry_run { "would be deleted" } else { "deleted" });
            Ok(())
        }
        Op::FetchNew | Op::FetchAll => {
            let scope = if cli.op == Op::FetchNew {
                Scope::New
            } else {
                Scope::All
            };
            for server_name in runtime.pool.servers.keys() {
                let observed = fetch::fetch(
                    &runtime.pool,
                    &runtime.index,
                    &runtime.maildir_root,
                    runtime.config.common_inbox,
                    server_name,
                    &cli.folder,
                    scope,
                )?;
                info!("{server_name}: fetched {} message(s)", observed.len());
            }
            Ok(())
        }
        Op::Move => {
            if cli.mid.is_empty() {
                return Err(EngineError::ConfigInvalid(
                    "-mid is required for -op move".to_owned(),
                ));
            }
            let target = move_op::MatchTarget::from_cli_arg(&cli.mid);
            let message_id = target.resolve()?;
            let mut moved_any = false;
            for server_name in runtime.pool.servers.keys() {
                if move_op::move_message_by_id(
                    &runtime.pool,
                    server_name,
                    &message_id,
                    &cli.folder,
                )? {
                    info!("moved {message_id:?} on {server_name} to {:?}", cli.folder);
                    moved_any = true;
                }
            }
            if !moved_any {
                info!("{message_id:?} not found on any configured server");
            }
            Ok(())
        }
    }
}

fn main() {
    let args = normalize_single_dash_long_flags(std::env::args());
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code().max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_dash_long_flag_gets_a_second_dash() {
        let out = normalize_single_dash_long_flags(owned(&["inboxsync", "-dryRun", "-op", "sync"]));
        assert_eq!(out, owned(&["inboxsync", "--dryRun", "--op", "sync"]));
    }

    #[test]
    fn single_dash_flag_with_equals_value_is_rewritten() {
        let out = normalize_single_dash_long_flags(owned(&["inboxsync", "-config=/tmp/c.json"]));
        assert_eq!(out, owned(&["inboxsync", "--config=/tmp/c.json"]));
    }

    #[test]
    fn already_double_dash_is_left_alone() {
        let out = normalize_single_dash_long_flags(owned(&["inboxsync", "--op", "sync"]));
        assert_eq!(out, owned(&["inboxsync", "--op", "sync"]));
    }

    #[test]
    fn bare_program_name_and_positional_values_are_left_alone() {
        let out = normalize_single_dash_long_flags(owned(&["inboxsync", "-", "sync"]));
        assert_eq!(out, owned(&["inboxsync", "-", "sync"]));
    }

    #[test]
    fn cli_parses_with_single_dash_spellings() {
        let args = normalize_single_dash_long_flags(owned(&[
            "inboxsync",
            "-op",
            "fetch-new",
            "-folder",
            "Archive",
            "-dryRun",
            "-verbose",
            "2",
        ]));
        let cli = Cli::parse_from(args);
        assert_eq!(cli.op, Op::FetchNew);
        assert_eq!(cli.folder, "Archive");
        assert!(cli.dry_run);
        assert_eq!(cli.verbose, 2);
    }
}
