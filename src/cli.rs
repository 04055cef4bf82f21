use clap::Parser;

/// Helmsman: interactive terminal chat driving a streaming LLM agent
#[derive(Parser, Debug, Clone)]
#[command(name = "helmsman")]
#[command(version)]
#[command(about = "Terminal chat with a streaming, tool-using LLM agent", long_about = None)]
pub struct Cli {
    /// API key for the model provider. When absent, helmsman runs in demo
    /// mode against a mock stream.
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Config file path (default: ~/.config/helmsman/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Transcript store location (default: ~/.helmsman/chat.db)
    #[arg(long, value_name = "FILE")]
    pub db_path: Option<std::path::PathBuf>,

    /// Model id override
    #[arg(long)]
    pub model: Option<String>,

    /// Force demo mode even when an API key is present
    #[arg(long, default_value_t = false)]
    pub demo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["helmsman"]);
        assert!(cli.config.is_none());
        assert!(cli.db_path.is_none());
        assert!(cli.model.is_none());
        assert!(!cli.demo);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_demo_flag() {
        let cli = Cli::parse_from(["helmsman", "--demo"]);
        assert!(cli.demo);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "helmsman",
            "--db-path",
            "/tmp/x.db",
            "--model",
            "claude-3-5-haiku-20241022",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.db_path, Some(std::path::PathBuf::from("/tmp/x.db")));
        assert_eq!(cli.model.as_deref(), Some("claude-3-5-haiku-20241022"));
        assert_eq!(cli.log_level, "debug");
    }
}
