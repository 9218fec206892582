//! Logging initialization shared by the Cloudmeter binaries
//!
//! The effective filter is chosen in this order:
//! 1. CLI flags (`-v/-q`)
//! 2. `RUST_LOG`
//! 3. The binary's default filter

use anyhow::Result;
use clap_verbosity_flag::{LogLevel, Verbosity};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Pick the filter directive for the given verbosity and default.
pub fn resolve_filter<L: LogLevel>(
    verbosity: &Verbosity<L>,
    default_filter: &str,
) -> Result<EnvFilter> {
    let filter = if verbosity.is_present() {
        match verbosity.log_level() {
            Some(level) => EnvFilter::try_new(level.as_str().to_lowercase())?,
            None => EnvFilter::new("off"),
        }
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };
    Ok(filter)
}

/// Install the global subscriber.
///
/// Output goes to stderr so that commands printing JSON on stdout stay
/// machine readable.
///
/// # Example
///
/// ```no_run
/// use clap::Parser;
/// use clap_verbosity_flag::{InfoLevel, Verbosity};
/// use cloudmeter_common::logging;
///
/// #[derive(Parser)]
/// struct Args {
///     #[clap(flatten)]
///     verbosity: Verbosity<InfoLevel>,
/// }
///
/// let args = Args::parse();
/// logging::init_logging(&args.verbosity, "cloudmeter_billing=info").unwrap();
/// ```
pub fn init_logging<L: LogLevel>(verbosity: &Verbosity<L>, default_filter: &str) -> Result<()> {
    let filter = resolve_filter(verbosity, default_filter)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .compact(),
        )
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use clap_verbosity_flag::WarnLevel;
    use tracing_subscriber::filter::LevelFilter;

    #[derive(Parser)]
    struct Args {
        #[clap(flatten)]
        verbosity: Verbosity<WarnLevel>,
    }

    #[test]
    fn test_verbose_flag_overrides_default() {
        let args = Args::parse_from(["test", "-vv"]);
        let filter = resolve_filter(&args.verbosity, "cloudmeter_billing=warn").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_quiet_flag_lowers_level() {
        let args = Args::parse_from(["test", "-q"]);
        let filter = resolve_filter(&args.verbosity, "cloudmeter_billing=warn").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::ERROR));
    }
}
