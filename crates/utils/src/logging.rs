//! provides logging helpers

use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable naming a directory for a rolling application log.
pub const LOG_PATH_ENV_VAR: &str = "PROVISIONER_LOG_PATH";

const LOG_FILE_PREFIX: &str = "provisioner.log";

/// Build the formatted output layer.
///
/// Writes to stderr, or to a daily-rotated file under `log_path` when given.
/// The returned guard must be held for as long as file logging is needed.
pub fn get_fmt_layer<S>(
    log_path: Option<String>,
) -> (
    Box<dyn Layer<S> + Send + Sync + 'static>,
    Option<tracing_appender::non_blocking::WorkerGuard>,
)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match log_path {
        Some(path) => match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .max_log_files(7)
            .build(&path)
        {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed();
                (layer, Some(guard))
            }
            Err(e) => {
                eprintln!("failed to open log directory {path}: {e}, logging to stderr");
                (stderr_layer(), None)
            }
        },
        None => (stderr_layer(), None),
    }
}

fn stderr_layer<S>() -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}

/// Default filter: `RUST_LOG` if set, INFO otherwise.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = std::env::var(LOG_PATH_ENV_VAR).ok();
    let (fmt_layer, guard) = get_fmt_layer::<tracing_subscriber::Registry>(log_path);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter()))
        .init();
    guard
}
