//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use manager_core::{DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES};

/// Long-running download manager: accepts URLs, runs the downloader
/// subprocess for each, fans out live output, and persists job state.
#[derive(Parser, Debug)]
#[command(name = "ytdlp-nfo-server")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Working directory the downloader subprocess runs in
    #[arg(long, env = "DOWNLOAD_DIR", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Directory for the persisted job snapshot; empty disables persistence
    #[arg(long, env = "DATA_DIR", default_value = "")]
    pub data_dir: String,

    /// Maximum number of jobs running at once
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_concurrent: u32,

    /// Maximum retry attempts per job before it is marked failed
    #[arg(long, env = "MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_retries: u32,
}

impl Args {
    /// `data_dir` as an `Option<PathBuf>`, per the spec's "empty disables persistence" rule.
    #[must_use]
    pub fn data_dir_path(&self) -> Option<PathBuf> {
        if self.data_dir.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.data_dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["ytdlp-nfo-server"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.download_dir, PathBuf::from("downloads"));
        assert_eq!(args.data_dir, "");
        assert_eq!(args.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(args.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["ytdlp-nfo-server", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["ytdlp-nfo-server", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["ytdlp-nfo-server", "--verbose", "--verbose"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["ytdlp-nfo-server", "-q"]).unwrap();
        assert!(args.quiet);

        let args = Args::try_parse_from(["ytdlp-nfo-server", "--quiet"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["ytdlp-nfo-server", "--help"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let result = Args::try_parse_from(["ytdlp-nfo-server", "--version"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let result = Args::try_parse_from(["ytdlp-nfo-server", "--invalid-flag"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_cli_download_dir_override() {
        let args = Args::try_parse_from(["ytdlp-nfo-server", "--download-dir", "/tmp/dl"]).unwrap();
        assert_eq!(args.download_dir, PathBuf::from("/tmp/dl"));
    }

    #[test]
    fn test_cli_data_dir_empty_disables_persistence() {
        let args = Args::try_parse_from(["ytdlp-nfo-server"]).unwrap();
        assert_eq!(args.data_dir_path(), None);
    }

    #[test]
    fn test_cli_data_dir_set_enables_persistence() {
        let args = Args::try_parse_from(["ytdlp-nfo-server", "--data-dir", "/tmp/state"]).unwrap();
        assert_eq!(args.data_dir_path(), Some(PathBuf::from("/tmp/state")));
    }

    #[test]
    fn test_cli_max_concurrent_override() {
        let args = Args::try_parse_from(["ytdlp-nfo-server", "--max-concurrent", "5"]).unwrap();
        assert_eq!(args.max_concurrent, 5);
    }

    #[test]
    fn test_cli_max_concurrent_zero_rejected() {
        let result = Args::try_parse_from(["ytdlp-nfo-server", "--max-concurrent", "0"]);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_max_retries_override() {
        let args = Args::try_parse_from(["ytdlp-nfo-server", "--max-retries", "7"]).unwrap();
        assert_eq!(args.max_retries, 7);
    }

    #[test]
    fn test_cli_max_retries_zero_rejected() {
        let result = Args::try_parse_from(["ytdlp-nfo-server", "--max-retries", "0"]);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_combined_all_flags() {
        let args = Args::try_parse_from([
            "ytdlp-nfo-server",
            "--download-dir",
            "dl",
            "--data-dir",
            "data",
            "--max-concurrent",
            "4",
            "--max-retries",
            "2",
        ])
        .unwrap();
        assert_eq!(args.download_dir, PathBuf::from("dl"));
        assert_eq!(args.data_dir, "data");
        assert_eq!(args.max_concurrent, 4);
        assert_eq!(args.max_retries, 2);
    }
}
