use std::path::Path;
use std::time::Duration;

use eyre::{bail, Context, ContextCompat};
use itertools::Itertools;
use xdg::BaseDirectories;

use crate::helper::HelperConfig;

pub const CONFIG_FILE: &str = "shrink.conf";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub helper: HelperConfig,
    pub debug: bool,
}

impl Config {
    /// Loads `$XDG_CONFIG_HOME/bti/shrink.conf`, or the defaults when it does
    /// not exist.
    pub fn load() -> eyre::Result<Config> {
        let base_dirs =
            BaseDirectories::with_prefix("bti").context("Failed to get base directories")?;

        let config_path = base_dirs.get_config_file(CONFIG_FILE);
        if config_path.exists() {
            Self::try_from_file(&config_path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn try_from_file(file_path: &Path) -> eyre::Result<Config> {
        let file = std::fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config file {}", file_path.display()))?;

        Self::from_lines(file.lines())
            .with_context(|| format!("Invalid config file {}", file_path.display()))
    }

    /// Parses `key=value` lines. A `#` at the start of a line or after
    /// whitespace starts a comment; keys are case-insensitive.
    pub fn from_lines<'a, I: Iterator<Item = &'a str>>(lines: I) -> eyre::Result<Config> {
        let mut config = Config::default();

        for (number, line) in lines.enumerate() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }

            config
                .apply(line)
                .with_context(|| format!("line {}: `{}`", number + 1, line))?;
        }

        Ok(config)
    }

    /// The helper settings with the verbosity folded in.
    pub fn helper_config(&self) -> HelperConfig {
        HelperConfig { trace: self.debug, ..self.helper.clone() }
    }

    fn apply(&mut self, line: &str) -> eyre::Result<()> {
        let (key, value) = line.split_once('=').context("Invalid setting, no '=' found")?;
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            bail!("Missing value for `{key}`");
        }

        match key.as_str() {
            "helper" => {
                let mut words = value.split_whitespace();
                let program = words.next().context("Missing helper program")?;
                self.helper.program = program.to_string();
                self.helper.args = words.map(str::to_string).collect_vec();
            }
            "prefix" => self.helper.response_prefix = value.to_string(),
            "timeout_ms" => self.helper.timeout = parse_millis(value)?,
            "close_grace_ms" => self.helper.close_grace = parse_millis(value)?,
            "max_response" => {
                self.helper.max_response_len =
                    value.parse().context("max_response must be a byte count")?;
            }
            "debug" => self.debug = parse_bool(value)?,
            _ => bail!("Unknown setting `{key}`"),
        }

        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    let comment = line
        .match_indices('#')
        .map(|(at, _)| at)
        .find(|&at| at == 0 || line[..at].ends_with(char::is_whitespace));

    match comment {
        Some(at) => &line[..at],
        None => line,
    }
}

fn parse_millis(value: &str) -> eyre::Result<Duration> {
    let millis: u64 = value.parse().context("Expected a number of milliseconds")?;
    if millis == 0 {
        bail!("Timeouts must be greater than zero");
    }
    Ok(Duration::from_millis(millis))
}

fn parse_bool(value: &str) -> eyre::Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("Expected true or false, got `{value}`"),
    }
}
