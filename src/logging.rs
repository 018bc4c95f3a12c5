//! Plain-text log formatter tagged with host and rank
//!
//! Every line reads `[host:rank] timestamp LEVEL span{fields}: target (file:line): message`.
//! Logs from many ranks can be concatenated and still be attributed.

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

use crate::comm::Rank;

/// Event formatter with a `[host:rank]` prefix and no ANSI colors
pub struct HostnameFormatter {
    prefix: String,
}

impl HostnameFormatter {
    pub fn new() -> Self {
        Self {
            prefix: hostname(),
        }
    }

    /// Tag lines with `rank` as well as the host
    pub fn with_rank(rank: Rank) -> Self {
        Self {
            prefix: format!("{}:{}", hostname(), rank),
        }
    }
}

impl Default for HostnameFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn hostname() -> String {
    gethostname::gethostname()
        .to_str()
        .unwrap_or("unknown")
        .to_string()
}

impl<S, N> FormatEvent<S, N> for HostnameFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let now = chrono::Utc::now();
        write!(
            writer,
            "[{}] {} {:<5} ",
            self.prefix,
            now.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            meta.level()
        )?;

        // outermost span first, each followed by its recorded fields
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                match ext.get::<FormattedFields<N>>() {
                    Some(fields) if !fields.is_empty() => write!(writer, "{{{}}}: ", fields)?,
                    _ => write!(writer, ": ")?,
                }
            }
        }

        match (meta.file(), meta.line()) {
            (Some(file), Some(line)) => write!(writer, "{} ({}:{}): ", meta.target(), file, line)?,
            _ => write!(writer, "{}: ", meta.target())?,
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize tracing with the host-only formatter
///
/// `RUST_LOG` overrides `level`. Logs go to stderr so tools can keep stdout
/// for data.
pub fn init_with_hostname(level: &str) {
    install(level, HostnameFormatter::new());
}

/// Initialize tracing with lines tagged by `rank`
pub fn init_for_rank(level: &str, rank: Rank) {
    install(level, HostnameFormatter::with_rank(rank));
}

fn install(level: &str, formatter: HostnameFormatter) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .event_format(formatter)
        .with_writer(std::io::stderr);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
        return;
    }

    tracing::info!("Logging initialized on host: {}", hostname());
}
