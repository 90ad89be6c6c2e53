use std::env;
use std::io;

use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "DESKCHAT_LOG";

/// Diagnostics go to stderr so stdout stays reserved for events.
/// `DESKCHAT_LOG` overrides the level, `DESKCHAT_LOG_JSON=1` switches to JSON lines.
pub fn init(verbose: bool) {
    let json_logs = env::var("DESKCHAT_LOG_JSON").unwrap_or_default() == "1";
    let filter = filter(verbose, env::var(FILTER_ENV).ok().as_deref());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false);
    // A second init (tests) keeps the first subscriber.
    let _ = if json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn filter(verbose: bool, directives: Option<&str>) -> EnvFilter {
    let fallback = if verbose { "deskchat=debug" } else { "deskchat=warn" };
    match directives.map(str::trim).filter(|value| !value.is_empty()) {
        Some(directives) => {
            EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(fallback))
        }
        None => EnvFilter::new(fallback),
    }
}
