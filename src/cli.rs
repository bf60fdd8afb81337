use clap::Parser;
use directories::ProjectDirs;
use std::path::PathBuf;

/// Scan media into target media servers.
#[derive(Parser, Debug)]
#[command(name = "autoscan", version, about = "Scan media into target media servers")]
pub struct Cli {
    /// Config file path
    #[arg(long, env = "AUTOSCAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file path (sqlite backend)
    #[arg(long, env = "AUTOSCAN_DATABASE")]
    pub database: Option<PathBuf>,

    /// Log file path
    #[arg(long, env = "AUTOSCAN_LOG")]
    pub log: Option<PathBuf>,

    /// Log level verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, env = "AUTOSCAN_VERBOSITY")]
    pub verbosity: u8,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| default_config_dir().join("config.yml"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| default_config_dir().join("autoscan.db"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log
            .clone()
            .unwrap_or_else(|| default_config_dir().join("activity.log"))
    }
}

fn default_config_dir() -> PathBuf {
    let dir = ProjectDirs::from("", "", "autoscan")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }

    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_paths_win_over_defaults() {
        let cli = Cli::parse_from([
            "autoscan",
            "--config",
            "/etc/autoscan/config.yml",
            "--database",
            "/data/autoscan.db",
        ]);

        assert_eq!(cli.config_path(), PathBuf::from("/etc/autoscan/config.yml"));
        assert_eq!(cli.database_path(), PathBuf::from("/data/autoscan.db"));
        assert!(cli.log_path().ends_with("activity.log"));
    }

    #[test]
    fn verbosity_flag_is_counted() {
        let cli = Cli::parse_from(["autoscan", "-vv"]);
        assert_eq!(cli.verbosity, 2);

        let cli = Cli::parse_from(["autoscan"]);
        assert_eq!(cli.verbosity, 0);
    }
}
