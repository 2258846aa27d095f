//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use rangefetch_core::{DEFAULT_MAX_RETRIES, DEFAULT_THREAD_COUNT};

/// Resumable multi-connection HTTP downloader.
///
/// Splits a download into byte ranges fetched in parallel when the server
/// allows it. Interrupted downloads resume where they stopped; Ctrl-C pauses.
#[derive(Parser, Debug)]
#[command(name = "rangefetch")]
#[command(author, version, about)]
pub struct Args {
    /// URL to download (resumes it when already registered)
    #[arg(required_unless_present_any = ["list", "delete"])]
    pub url: Option<String>,

    /// Directory the file is saved into
    #[arg(short = 'd', long = "dir", default_value = "downloads")]
    pub save_dir: PathBuf,

    /// Parallel range requests per download (1-32)
    #[arg(short = 't', long, default_value_t = DEFAULT_THREAD_COUNT as u8, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub threads: u8,

    /// Maximum attempts per chunk for transient failures (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    /// Task registry database file
    #[arg(long = "db", default_value = "rangefetch.db")]
    pub db_path: PathBuf,

    /// List registered downloads and exit
    #[arg(long, conflicts_with_all = ["url", "delete"])]
    pub list: bool,

    /// Delete a registered download and its files, then exit
    #[arg(long, value_name = "URL", conflicts_with = "url")]
    pub delete: Option<String>,

    /// Print progress snapshots and registry rows as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Default `tracing` filter directive for the verbosity flags.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/file.iso";

    #[test]
    fn test_cli_url_parses_with_defaults() {
        let args = Args::try_parse_from(["rangefetch", URL]).unwrap();
        assert_eq!(args.url.as_deref(), Some(URL));
        assert_eq!(args.save_dir, PathBuf::from("downloads"));
        assert_eq!(args.threads, 3);
        assert_eq!(args.max_retries, 3);
        assert_eq!(args.db_path, PathBuf::from("rangefetch.db"));
        assert!(!args.list);
        assert!(args.delete.is_none());
        assert!(!args.json);
    }

    #[test]
    fn test_cli_url_required_without_list_or_delete() {
        let err = Args::try_parse_from(["rangefetch"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_list_needs_no_url() {
        let args = Args::try_parse_from(["rangefetch", "--list"]).unwrap();
        assert!(args.list);
        assert!(args.url.is_none());
    }

    #[test]
    fn test_cli_list_conflicts_with_url() {
        let err = Args::try_parse_from(["rangefetch", "--list", URL]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_delete_takes_url() {
        let args = Args::try_parse_from(["rangefetch", "--delete", URL]).unwrap();
        assert_eq!(args.delete.as_deref(), Some(URL));
        assert!(args.url.is_none());
    }

    #[test]
    fn test_cli_threads_range_enforced() {
        let args = Args::try_parse_from(["rangefetch", "-t", "32", URL]).unwrap();
        assert_eq!(args.threads, 32);

        for bad in ["0", "33"] {
            let err = Args::try_parse_from(["rangefetch", "-t", bad, URL]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn test_cli_max_retries_range_enforced() {
        let args = Args::try_parse_from(["rangefetch", "--max-retries", "0", URL]).unwrap();
        assert_eq!(args.max_retries, 0);

        let err = Args::try_parse_from(["rangefetch", "-r", "11", URL]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_dir_and_db_flags() {
        let args =
            Args::try_parse_from(["rangefetch", "-d", "/tmp/out", "--db", "/tmp/t.db", URL])
                .unwrap();
        assert_eq!(args.save_dir, PathBuf::from("/tmp/out"));
        assert_eq!(args.db_path, PathBuf::from("/tmp/t.db"));
    }

    #[test]
    fn test_cli_json_flag_combines_with_list() {
        let args = Args::try_parse_from(["rangefetch", "--list", "--json"]).unwrap();
        assert!(args.list);
        assert!(args.json);
    }

    #[test]
    fn test_cli_log_level_from_flags() {
        let level = |argv: &[&str]| Args::try_parse_from(argv).unwrap().log_level();
        assert_eq!(level(&["rangefetch", URL]), "info");
        assert_eq!(level(&["rangefetch", "-v", URL]), "debug");
        assert_eq!(level(&["rangefetch", "-vv", URL]), "trace");
        assert_eq!(level(&["rangefetch", "-q", "-v", URL]), "error");
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["rangefetch", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err = Args::try_parse_from(["rangefetch", "--invalid-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
