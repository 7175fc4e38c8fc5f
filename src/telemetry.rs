//! Per-request metadata and statsd emission (spec §4.6): gauge/counter/
//! timing values accumulated during a request, serialized as JSON for the
//! `Dirpy-Data` response header, and optionally fanned out as UDP statsd
//! lines.

use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::time::Instant;

use crate::config::Config;

/// The three metric groups the original keeps: gauges, counters, and
/// millisecond timings. Timings are accumulated as fractional seconds
/// internally (`add_ms_seconds`) and only converted to integer
/// milliseconds when the metadata is flushed.
#[derive(Debug, Clone, Default)]
pub struct MetaData {
    pub g: BTreeMap<String, i64>,
    pub c: BTreeMap<String, i64>,
    ms_seconds: BTreeMap<String, f64>,
}

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ms_seconds(&mut self, name: &str, seconds: f64) {
        *self.ms_seconds.entry(name.to_string()).or_insert(0.0) += seconds;
    }

    pub fn set_ms_seconds(&mut self, name: &str, seconds: f64) {
        self.ms_seconds.insert(name.to_string(), seconds);
    }

    pub fn clear_timings(&mut self) {
        self.ms_seconds.clear();
    }

    /// Finalize timings to integer milliseconds, emit statsd lines if
    /// configured, and return the JSON body for the `Dirpy-Data` header.
    /// Mirrors `yield_meta_data`.
    pub fn flush(mut self, cfg: &Config, started: Instant) -> String {
        self.add_ms_seconds("time_total", started.elapsed().as_secs_f64());

        let ms: BTreeMap<String, i64> = self
            .ms_seconds
            .iter()
            .map(|(k, v)| (k.clone(), (v * 1000.0) as i64))
            .collect();

        if let Some(server) = &cfg.statsd_server {
            emit_statsd(server, cfg.statsd_port, &cfg.statsd_prefix, &self.g, &self.c, &ms);
        }

        let mut flat: BTreeMap<&str, i64> = BTreeMap::new();
        for (k, v) in &self.g {
            flat.insert(k, *v);
        }
        for (k, v) in &self.c {
            flat.insert(k, *v);
        }
        for (k, v) in &ms {
            flat.insert(k, *v);
        }
        serde_json::to_string(&flat).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Build and greedily pack statsd lines into <=512-byte UDP datagrams,
/// exactly as the original's `yield_meta_data` does, then fire them at
/// `statsd_server:statsd_port`. Best-effort: failures are swallowed.
fn emit_statsd(
    server: &str,
    port: u16,
    prefix: &str,
    g: &BTreeMap<String, i64>,
    c: &BTreeMap<String, i64>,
    ms: &BTreeMap<String, i64>,
) {
    let mut lines: Vec<String> = Vec::new();
    for (group, metrics) in [("g", g), ("c", c)] {
        for (name, val) in metrics {
            lines.push(statsd_line(prefix, name, *val, group));
        }
    }
    for (name, val) in ms {
        lines.push(statsd_line(prefix, name, *val, "ms"));
    }

    if lines.is_empty() {
        return;
    }

    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(s) => s,
        Err(_) => return,
    };
    let addr = format!("{server}:{port}");

    let mut pending = lines;
    while let Some(mut buf) = pending.pop() {
        while let Some(next) = pending.last() {
            if buf.len() + next.len() < 512 {
                buf.push_str(&pending.pop().unwrap());
            } else {
                break;
            }
        }
        let _ = socket.send_to(buf.trim_end().as_bytes(), &addr);
    }
}

/// `<prefix>.<group>.<name-with-first-underscore-to-dot>:<value>|<group>\n`
fn statsd_line(prefix: &str, name: &str, val: i64, group: &str) -> String {
    let dotted = match name.find('_') {
        Some(idx) => format!("{}.{}", &name[..idx], &name[idx + 1..]),
        None => name.to_string(),
    };
    format!("{prefix}.{group}.{dotted}:{val}|{group}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statsd_line_replaces_only_first_underscore() {
        let line = statsd_line("dirpy", "in_fmt_jpeg", 1, "c");
        assert_eq!(line, "dirpy.c.in.fmt_jpeg:1|c\n");
    }

    #[test]
    fn flush_converts_seconds_to_integer_milliseconds() {
        let mut md = MetaData::new();
        md.set_ms_seconds("time_resize", 0.0123);
        let cfg = Config::default();
        let json = md.flush(&cfg, Instant::now());
        assert!(json.contains("\"time_resize\":12"));
    }
}
