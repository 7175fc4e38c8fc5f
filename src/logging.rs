//! A `tracing_subscriber` formatter that enforces a maximum rendered line
//! length, the `tracing` equivalent of the original's `DirpyLogFilter`:
//! `[pid] timestamp LEVEL: message`, truncated to `log_max_line` chars
//! with a trailing `...`.

use std::fmt;

use time::format_description::well_known::Rfc3339;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub struct TruncatingFormatter {
    pub max_line: usize,
}

impl<S, N> FormatEvent<S, N> for TruncatingFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let mut line = String::new();

        let now = time::OffsetDateTime::now_utc();
        let ts = now.format(&Rfc3339).unwrap_or_default();

        line.push_str(&format!("[{}] {} {}: ", std::process::id(), ts, event.metadata().level()));

        let mut buf = String::new();
        {
            let mut w = Writer::new(&mut buf);
            ctx.field_format().format_fields(w.by_ref(), event)?;
        }
        line.push_str(&buf);

        if line.len() > self.max_line {
            line.truncate(self.max_line.saturating_sub(3));
            line.push_str("...");
        }

        writeln!(writer, "{line}")
    }
}
