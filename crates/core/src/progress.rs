use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use tracing::{info, warn};

pub const DEFAULT_EVERY_DOCS: u64 = 100_000;
pub const DEFAULT_EVERY_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub every_docs: u64,
    pub interval: Duration,
    pub label: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            every_docs: DEFAULT_EVERY_DOCS,
            interval: Duration::from_secs(DEFAULT_EVERY_SECONDS),
            label: "encode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardProgress {
    pub index: u32,
    pub docs: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub label: String,
    pub docs: u64,
    pub tokens: u64,
    pub elapsed: Duration,
    pub shard: Option<ShardProgress>,
    pub done: bool,
}

impl ProgressReport {
    pub fn docs_per_sec(&self) -> f64 {
        self.docs as f64 / self.elapsed_secs()
    }

    pub fn tokens_per_sec(&self) -> f64 {
        self.tokens as f64 / self.elapsed_secs()
    }

    fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64().max(1e-9)
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.done { " done" } else { "" };
        write!(
            f,
            "[{}{}] docs={} toks={}",
            self.label,
            tag,
            group_thousands(self.docs),
            group_thousands(self.tokens)
        )?;
        if self.done {
            write!(f, " secs={:.1}", self.elapsed.as_secs_f64())?;
        }
        write!(
            f,
            " dps={} tps={}",
            group_thousands(self.docs_per_sec().round() as u64),
            group_thousands(self.tokens_per_sec().round() as u64)
        )?;
        if let Some(shard) = &self.shard {
            write!(
                f,
                " shard={:05} sdocs={} stoks={}",
                shard.index,
                group_thousands(shard.docs),
                group_thousands(shard.tokens)
            )?;
        }
        Ok(())
    }
}

pub trait StatusSink {
    fn emit(&mut self, report: &ProgressReport) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn emit(&mut self, report: &ProgressReport) -> io::Result<()> {
        info!(target: "spool::progress", "{report}");
        Ok(())
    }
}

#[derive(Debug)]
pub struct WriterSink<W>(pub W);

impl<W: Write> StatusSink for WriterSink<W> {
    fn emit(&mut self, report: &ProgressReport) -> io::Result<()> {
        writeln!(self.0, "{report}")?;
        self.0.flush()
    }
}

#[derive(Debug)]
pub struct Heartbeat<S = TracingSink> {
    config: HeartbeatConfig,
    sink: S,
    start: Instant,
    last: Instant,
    docs: u64,
    tokens: u64,
    next_docs: u64,
    emitted: u64,
}

impl Heartbeat<TracingSink> {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self::with_sink(config, TracingSink)
    }
}

impl<S: StatusSink> Heartbeat<S> {
    pub fn with_sink(config: HeartbeatConfig, sink: S) -> Self {
        Self::starting_at(config, sink, Instant::now())
    }

    fn starting_at(config: HeartbeatConfig, sink: S, start: Instant) -> Self {
        let next_docs = config.every_docs;
        Self {
            config,
            sink,
            start,
            last: start,
            docs: 0,
            tokens: 0,
            next_docs,
            emitted: 0,
        }
    }

    pub fn docs(&self) -> u64 {
        self.docs
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn update(
        &mut self,
        docs: u64,
        tokens: u64,
        shard: Option<ShardProgress>,
    ) -> Option<ProgressReport> {
        self.update_at(Instant::now(), docs, tokens, shard)
    }

    fn update_at(
        &mut self,
        now: Instant,
        docs: u64,
        tokens: u64,
        shard: Option<ShardProgress>,
    ) -> Option<ProgressReport> {
        self.docs += docs;
        self.tokens += tokens;

        let by_docs = self.config.every_docs > 0 && self.docs >= self.next_docs;
        let by_time = now.saturating_duration_since(self.last) >= self.config.interval;
        if !by_docs && !by_time {
            return None;
        }

        let report = self.report(now, shard, false);
        self.send(&report);
        self.last = now;
        if self.config.every_docs > 0 {
            while self.docs >= self.next_docs {
                self.next_docs += self.config.every_docs;
            }
        }
        Some(report)
    }

    pub fn finish(&mut self) -> ProgressReport {
        self.finish_at(Instant::now())
    }

    fn finish_at(&mut self, now: Instant) -> ProgressReport {
        self.update_at(now, 0, 0, None);
        let report = self.report(now, None, true);
        self.send(&report);
        report
    }

    fn report(&self, now: Instant, shard: Option<ShardProgress>, done: bool) -> ProgressReport {
        ProgressReport {
            label: self.config.label.clone(),
            docs: self.docs,
            tokens: self.tokens,
            elapsed: now.saturating_duration_since(self.start),
            shard,
            done,
        }
    }

    fn send(&mut self, report: &ProgressReport) {
        self.emitted += 1;
        if let Err(err) = self.sink.emit(report) {
            warn!(error = %err, "progress sink unavailable; continuing");
        }
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
