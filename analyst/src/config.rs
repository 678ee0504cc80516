use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_ITERATIONS: usize = 15;
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 400;

/// Tuning knobs for the agent core. `Default` gives the stock setup;
/// `from_env` layers environment overrides on top of it.
#[derive(Debug, Clone)]
pub struct AnalystConfig {
    /// Hard budget on reasoning iterations per run.
    pub max_iterations: usize,
    /// Wall-clock limit for a single code execution.
    pub exec_timeout: Duration,
    /// How often the session poller diffs the execution history.
    pub poll_interval: Duration,
    /// When set, the system prompt asks for an up-front `<plan>` block.
    pub planning_mode: bool,
    /// Interpreter binary override; `python3` when unset.
    pub python: Option<String>,
    pub datasets_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            planning_mode: true,
            python: None,
            datasets_dir: PathBuf::from("datasets"),
            artifacts_dir: PathBuf::from("artifacts"),
        }
    }
}

impl AnalystConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("ANALYST_MAX_ITERATIONS") {
            config.max_iterations = n;
        }
        if let Some(secs) = env_parse::<u64>("ANALYST_TIMEOUT_SECONDS") {
            config.exec_timeout = Duration::from_secs(secs);
        }
        if let Ok(python) = std::env::var("ANALYST_PYTHON") {
            if !python.is_empty() {
                config.python = Some(python);
            }
        }
        config
    }

    pub fn python_bin(&self) -> &str {
        self.python.as_deref().unwrap_or("python3")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnalystConfig::default();
        assert_eq!(config.max_iterations, 15);
        assert_eq!(config.exec_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(400));
        assert!(config.planning_mode);
        assert_eq!(config.python_bin(), "python3");
    }
}
