use tracing::{debug, Subscriber};
use tracing_subscriber::{fmt, EnvFilter};

use crate::env::{Env, ENV_CONFIG};

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

fn log_format(env: &Env, pretty_print: bool) -> LogFormat {
    match env {
        _ if pretty_print => LogFormat::Pretty,
        Env::Dev => LogFormat::Pretty,
        Env::Stag | Env::Prod => LogFormat::Json,
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the global subscriber. `RUST_LOG` picks the filter, `info` when unset.
pub fn init() {
    let format = log_format(&ENV_CONFIG.env, ENV_CONFIG.pretty_print);

    let subscriber: Box<dyn Subscriber + Send + Sync> = match format {
        LogFormat::Pretty => Box::new(
            fmt::Subscriber::builder()
                .with_env_filter(env_filter())
                .with_thread_names(true)
                .finish(),
        ),
        LogFormat::Json => Box::new(
            fmt::Subscriber::builder()
                .json()
                .with_env_filter(env_filter())
                .finish(),
        ),
    };

    tracing::subscriber::set_global_default(subscriber)
        .expect("expect to be able to set global default subscriber");

    debug!(?format, env = ?ENV_CONFIG.env, "logging initialized");
}
