use std::io::stdin;
use std::path::PathBuf;
use std::time::Duration;

use bti_shrink::config::Config;
use bti_shrink::{Shrinker, UrlLocator};
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use eyre::Context;
use log::{debug, LevelFilter};

/// Reads status lines on stdin and prints them with their URLs shrunk.
#[derive(Parser, Debug)]
#[command(name = "bti-shrink", version)]
struct Args {
    /// Config file to use instead of $XDG_CONFIG_HOME/bti/shrink.conf
    #[arg(long)]
    config: Option<PathBuf>,

    /// URL helper program
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    helper: Option<String>,

    /// Prefix a helper response must start with to be accepted
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    prefix: Option<String>,

    /// Per-URL helper timeout in milliseconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: Option<u64>,

    #[arg(long)]
    debug: bool,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::try_from_file(path)?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(helper) = args.helper {
        config.helper.program = helper;
        config.helper.args.clear();
    }
    if let Some(prefix) = args.prefix {
        config.helper.response_prefix = prefix;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.helper.timeout = Duration::from_millis(timeout_ms);
    }
    config.debug |= args.debug;

    let level = if config.debug { LevelFilter::Debug } else { LevelFilter::Warn };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let locator = UrlLocator::new()?;
    debug!("using URL pattern v{}", locator.pattern_version());
    let shrinker = Shrinker::new(locator, config.helper_config());

    let input = stdin().lines();
    for line in input {
        let line = line?;
        let (shrunk, report) = shrinker.shrink_with_report(&line);
        debug!("{report:?}");
        println!("{}", shrunk);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use crate::Args;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args =
            Args::try_parse_from(["bti-shrink", "--prefix", "https://", "--timeout-ms", "250"])
                .unwrap();
        assert_eq!(args.prefix.as_deref(), Some("https://"));
        assert_eq!(args.timeout_ms, Some(250));
    }

    #[test]
    fn test_empty_values_rejected() {
        let input = vec![
            vec!["bti-shrink", "--prefix", ""],
            vec!["bti-shrink", "--helper", ""],
            vec!["bti-shrink", "--timeout-ms", "0"],
        ];

        for argv in input {
            assert!(Args::try_parse_from(argv.clone()).is_err(), "accepted {argv:?}");
        }
    }
}
