#![forbid(unsafe_code)]

// Server metrics: lock-free counters plus a latency histogram, rendered as Prometheus text.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const PREFIX: &str = "roomcast";

/// Upper bucket bounds in microseconds, with their Prometheus labels (seconds)
const BUCKETS: [(u64, &str); 8] = [
    (500, "0.0005"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (500_000, "0.5"),
    (1_000_000, "1"),
];

/// Cumulative histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Counters tracked by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    RoomsCreated,
    Joins,
    Leaves,
    ProducersCreated,
    ConsumersCreated,
    ConsumersClosed,
    NotificationsDropped,
}

impl Counter {
    const ALL: [Counter; 11] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RoomsCreated,
        Counter::Joins,
        Counter::Leaves,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
        Counter::ConsumersClosed,
        Counter::NotificationsDropped,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Connections => "connections_total",
            Counter::MessagesReceived => "messages_received_total",
            Counter::MessagesSent => "messages_sent_total",
            Counter::Errors => "errors_total",
            Counter::RoomsCreated => "rooms_created_total",
            Counter::Joins => "joins_total",
            Counter::Leaves => "leaves_total",
            Counter::ProducersCreated => "producers_created_total",
            Counter::ConsumersCreated => "consumers_created_total",
            Counter::ConsumersClosed => "consumers_closed_total",
            Counter::NotificationsDropped => "notifications_dropped_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::Connections => "Total WebSocket connections",
            Counter::MessagesReceived => "Total frames received from clients",
            Counter::MessagesSent => "Total frames sent to clients",
            Counter::Errors => "Total error responses",
            Counter::RoomsCreated => "Total rooms created",
            Counter::Joins => "Total room joins",
            Counter::Leaves => "Total room leaves",
            Counter::ProducersCreated => "Total producers created",
            Counter::ConsumersCreated => "Total consumers created",
            Counter::ConsumersClosed => "Consumers closed by the server",
            Counter::NotificationsDropped => "Notifications dropped for vanished or slow clients",
        }
    }
}

/// Server-wide metrics, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    last_connection_unix: AtomicU64,
    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                last_connection_unix: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        // ALL lists every variant in declaration order
        &self.inner.counters[counter as usize]
    }

    pub fn inc(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Relaxed);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n > 0 {
            self.slot(counter).fetch_add(n, Relaxed);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Relaxed)
    }

    pub fn inc_rooms_created(&self) {
        self.inc(Counter::RoomsCreated);
    }

    pub fn inc_joins(&self) {
        self.inc(Counter::Joins);
    }

    pub fn inc_leaves(&self) {
        self.inc(Counter::Leaves);
    }

    pub fn inc_errors(&self) {
        self.inc(Counter::Errors);
    }

    /// Records a new connection and returns a guard that keeps it counted as active
    pub fn connection_opened(&self) -> ConnectionGuard {
        self.inc(Counter::Connections);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.inner.last_connection_unix.store(now, Relaxed);
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    pub fn connections_total(&self) -> u64 {
        self.get(Counter::Connections)
    }

    /// Unix seconds of the most recent connection, if any
    pub fn last_connection_unix(&self) -> Option<u64> {
        match self.inner.last_connection_unix.load(Relaxed) {
            0 => None,
            t => Some(t),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Renders every metric; room and participant gauges come from the registry
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            let name = format!("{PREFIX}_{}", counter.name());
            render_metric(&mut out, &name, counter.help(), "counter", self.get(counter));
        }

        let gauges = [
            ("connections_active", "Open WebSocket connections", self.connections_active()),
            ("rooms_active", "Rooms currently registered", rooms_active as u64),
            ("participants_active", "Participants across all rooms", participants_active as u64),
        ];
        for (name, help, value) in gauges {
            render_metric(&mut out, &format!("{PREFIX}_{name}"), help, "gauge", value);
        }

        self.inner.message_handling.render(
            &format!("{PREFIX}_message_handling_seconds"),
            "Request handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Keeps a connection counted as active until dropped
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
