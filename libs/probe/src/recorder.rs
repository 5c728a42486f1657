use crate::Metrics;
use std::time::{Duration, Instant};

/// Points in a probe's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    DnsStart,
    DnsDone,
    ConnectStart,
    ConnectDone,
    TlsStart,
    TlsDone,
    FirstByte,
    Complete,
}

#[derive(Debug, Default, Clone, Copy)]
struct Phase {
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl Phase {
    fn start(&mut self, at: Instant) {
        self.started.get_or_insert(at);
    }

    fn finish(&mut self, at: Instant) {
        self.finished = Some(at);
    }

    fn duration(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
            _ => Duration::ZERO,
        }
    }
}

/// Monotonic timestamps for one probe, owned by that probe alone.
///
/// Phases that never start or never finish report zero.
#[derive(Debug, Clone)]
pub struct TraceRecorder {
    start: Instant,
    dns: Phase,
    connect: Phase,
    tls: Phase,
    first_byte: Option<Instant>,
    complete: Option<Instant>,
}

impl TraceRecorder {
    pub fn start() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            start,
            dns: Phase::default(),
            connect: Phase::default(),
            tls: Phase::default(),
            first_byte: None,
            complete: None,
        }
    }

    pub fn record(&mut self, event: TraceEvent) {
        self.record_at(event, Instant::now());
    }

    pub fn record_at(&mut self, event: TraceEvent, at: Instant) {
        match event {
            TraceEvent::DnsStart => self.dns.start(at),
            TraceEvent::DnsDone => self.dns.finish(at),
            TraceEvent::ConnectStart => self.connect.start(at),
            TraceEvent::ConnectDone => self.connect.finish(at),
            TraceEvent::TlsStart => self.tls.start(at),
            TraceEvent::TlsDone => self.tls.finish(at),
            TraceEvent::FirstByte => {
                self.first_byte.get_or_insert(at);
            }
            TraceEvent::Complete => self.complete = Some(at),
        }
    }

    pub fn metrics(&self) -> Metrics {
        let since_start = |at: Option<Instant>| {
            at.map_or(Duration::ZERO, |at| at.saturating_duration_since(self.start))
        };

        Metrics {
            dns: self.dns.duration(),
            connect: self.connect.duration(),
            tls: self.tls.duration(),
            time_to_first_byte: since_start(self.first_byte),
            total: since_start(self.complete),
        }
    }
}
