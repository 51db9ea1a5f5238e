//! Global tracing setup with an optional audit trail file.
//!
//! Events with target [`AUDIT_TARGET`] are written one per line as
//! `<unix millis> key=value ...` to a daily-rotated file when an audit path is
//! configured, and are kept out of the regular log output in that case.

use std::collections::BTreeMap;
use std::fmt::{self};
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use error_stack::Report;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

use crate::error::ProvisionError;
use crate::orchestrator::AUDIT_TARGET;

struct AuditFormatter;

#[derive(Default)]
struct FieldVisitor {
    fields: BTreeMap<&'static str, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name(), format!("{value:?}"));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields.insert(field.name(), format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for AuditFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        write!(writer, "{millis}")?;

        // Display values (`%object`) arrive through record_debug unquoted.
        for (key, value) in &visitor.fields {
            write!(writer, " {key}={value}")?;
        }
        writeln!(writer)
    }
}

fn is_audit(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == AUDIT_TARGET
}

/// Install the global subscriber.
///
/// The returned guards flush the file writers and must live until exit.
pub fn init(audit_log: Option<&Path>) -> Result<Vec<WorkerGuard>, Report<ProvisionError>> {
    let Some(audit_log) = audit_log else {
        return Ok(utils::logging::init().into_iter().collect());
    };

    let directory = audit_log
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = audit_log
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            Report::new(ProvisionError::Config {
                message: format!("audit log path {} has no file name", audit_log.display()),
            })
        })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(7)
        .build(directory)
        .map_err(|e| {
            Report::new(ProvisionError::Config {
                message: format!("failed to open audit log {}: {e}", audit_log.display()),
            })
        })?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let log_path = std::env::var(utils::logging::LOG_PATH_ENV_VAR).ok();
    let (fmt_layer, log_guard) =
        utils::logging::get_fmt_layer::<tracing_subscriber::Registry>(log_path);
    let mut guards: Vec<WorkerGuard> = log_guard.into_iter().collect();
    guards.push(file_guard);

    let fmt_layer = fmt_layer.with_filter(
        utils::logging::env_filter().and(filter::filter_fn(|metadata| !is_audit(metadata))),
    );
    let audit_layer = layer()
        .event_format(AuditFormatter)
        .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_audit));

    registry().with(fmt_layer).with(audit_layer).init();
    Ok(guards)
}
