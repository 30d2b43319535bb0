//! Per-server health statistics

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Connect latency samples kept for the rolling average
const LATENCY_SAMPLES: usize = 16;

/// Window for upload/download rate estimation
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Rate samples kept per direction
const RATE_SAMPLES: usize = 64;

/// Failure symptoms observed on a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Server host did not resolve
    HostNotFound,
    ConnectionRefused,
    NetworkUnreachable,
    Timeout,
    /// Cipher or obfuscation mismatch
    DecodeError,
    /// Server closed without answering
    EmptyResponse,
    Other,
}

impl FailureKind {
    /// Amount added to the consecutive-error counter
    pub fn weight(&self) -> u64 {
        match self {
            FailureKind::DecodeError => 10,
            FailureKind::HostNotFound => 2,
            _ => 1,
        }
    }
}

/// Running statistics for one server
#[derive(Debug, Clone, Default)]
pub struct HealthLog {
    total_connections: u64,
    active_connections: u64,
    disconnects: u64,
    timeouts: u64,
    decode_errors: u64,
    empty_responses: u64,
    host_not_found: u64,
    other_errors: u64,
    consecutive_errors: u64,
    host_not_found_streak: u64,
    total_upload: u64,
    total_download: u64,
    latencies: VecDeque<Duration>,
    upload_samples: VecDeque<(Instant, u64)>,
    download_samples: VecDeque<(Instant, u64)>,
    last_error: Option<FailureKind>,
}

fn push_sample(samples: &mut VecDeque<(Instant, u64)>, bytes: u64) {
    let now = Instant::now();
    while let Some(&(at, _)) = samples.front() {
        if now.duration_since(at) > RATE_WINDOW || samples.len() >= RATE_SAMPLES {
            samples.pop_front();
        } else {
            break;
        }
    }
    samples.push_back((now, bytes));
}

fn rate(samples: &VecDeque<(Instant, u64)>) -> f64 {
    let now = Instant::now();
    let bytes: u64 = samples
        .iter()
        .filter(|(at, _)| now.duration_since(*at) <= RATE_WINDOW)
        .map(|(_, b)| *b)
        .sum();
    bytes as f64 / RATE_WINDOW.as_secs_f64()
}

impl HealthLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session started using this server
    pub fn record_connect_start(&mut self) {
        self.total_connections += 1;
        self.active_connections += 1;
    }

    /// The TCP connection to the server succeeded
    pub fn record_connected(&mut self, latency: Duration) {
        if self.latencies.len() >= LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
        self.relax_errors();
    }

    /// A session using this server ended
    pub fn record_disconnect(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
        self.disconnects += 1;
    }

    /// A remote failure was observed
    pub fn record_failure(&mut self, kind: FailureKind) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(kind.weight());
        self.last_error = Some(kind);
        match kind {
            FailureKind::Timeout => self.timeouts += 1,
            FailureKind::DecodeError => self.decode_errors += 1,
            FailureKind::EmptyResponse => self.empty_responses += 1,
            FailureKind::HostNotFound => self.host_not_found += 1,
            _ => self.other_errors += 1,
        }
        if kind == FailureKind::HostNotFound {
            self.host_not_found_streak += 1;
        } else {
            self.host_not_found_streak = 0;
        }
    }

    /// Decrease the consecutive-error counter by one, never below zero
    pub fn relax_errors(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_sub(1);
        self.host_not_found_streak = 0;
    }

    /// Data made a clean round trip: the server is healthy
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.host_not_found_streak = 0;
        self.last_error = None;
    }

    pub fn add_upload(&mut self, bytes: u64) {
        self.total_upload += bytes;
        push_sample(&mut self.upload_samples, bytes);
    }

    pub fn add_download(&mut self, bytes: u64) {
        self.total_download += bytes;
        push_sample(&mut self.download_samples, bytes);
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors
    }

    pub fn host_not_found_streak(&self) -> u64 {
        self.host_not_found_streak
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections
    }

    /// Rolling average connect latency
    pub fn avg_connect_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    /// Recent download rate in bytes per second
    pub fn download_rate(&self) -> f64 {
        rate(&self.download_samples)
    }

    /// Recent upload rate in bytes per second
    pub fn upload_rate(&self) -> f64 {
        rate(&self.upload_samples)
    }

    /// Immutable copy for display
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            server_id: String::new(),
            enabled: true,
            total_connections: self.total_connections,
            active_connections: self.active_connections,
            disconnects: self.disconnects,
            timeouts: self.timeouts,
            decode_errors: self.decode_errors,
            empty_responses: self.empty_responses,
            host_not_found: self.host_not_found,
            other_errors: self.other_errors,
            consecutive_errors: self.consecutive_errors,
            total_upload: self.total_upload,
            total_download: self.total_download,
            upload_rate: self.upload_rate(),
            download_rate: self.download_rate(),
            avg_connect_latency_ms: self.avg_connect_latency().map(|d| d.as_millis() as u64),
            last_error: self.last_error,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_consecutive_errors(&mut self, n: u64) {
        self.consecutive_errors = n;
    }
}

/// Point-in-time copy of a server's health
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub server_id: String,
    pub enabled: bool,
    pub total_connections: u64,
    pub active_connections: u64,
    pub disconnects: u64,
    pub timeouts: u64,
    pub decode_errors: u64,
    pub empty_responses: u64,
    pub host_not_found: u64,
    pub other_errors: u64,
    pub consecutive_errors: u64,
    pub total_upload: u64,
    pub total_download: u64,
    pub upload_rate: f64,
    pub download_rate: f64,
    pub avg_connect_latency_ms: Option<u64>,
    pub last_error: Option<FailureKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_saturate_at_zero() {
        let mut log = HealthLog::new();
        for _ in 0..5 {
            log.relax_errors();
            log.record_disconnect();
        }
        assert_eq!(log.consecutive_errors(), 0);
        assert_eq!(log.active_connections(), 0);
    }

    #[test]
    fn test_failure_weights() {
        let mut log = HealthLog::new();
        log.record_failure(FailureKind::DecodeError);
        assert_eq!(log.consecutive_errors(), 10);
        log.record_failure(FailureKind::HostNotFound);
        assert_eq!(log.consecutive_errors(), 12);
        log.record_failure(FailureKind::Timeout);
        assert_eq!(log.consecutive_errors(), 13);

        log.relax_errors();
        assert_eq!(log.consecutive_errors(), 12);
        log.record_success();
        assert_eq!(log.consecutive_errors(), 0);

        let snap = log.snapshot();
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.host_not_found, 1);
        assert_eq!(snap.timeouts, 1);
    }

    #[test]
    fn test_host_not_found_streak() {
        let mut log = HealthLog::new();
        log.record_failure(FailureKind::HostNotFound);
        log.record_failure(FailureKind::HostNotFound);
        assert_eq!(log.host_not_found_streak(), 2);
        log.record_failure(FailureKind::ConnectionRefused);
        assert_eq!(log.host_not_found_streak(), 0);
    }

    #[test]
    fn test_latency_average() {
        let mut log = HealthLog::new();
        assert_eq!(log.avg_connect_latency(), None);
        log.record_connected(Duration::from_millis(100));
        log.record_connected(Duration::from_millis(300));
        assert_eq!(log.avg_connect_latency(), Some(Duration::from_millis(200)));

        for _ in 0..LATENCY_SAMPLES {
            log.record_connected(Duration::from_millis(50));
        }
        assert_eq!(log.avg_connect_latency(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_traffic_totals() {
        let mut log = HealthLog::new();
        log.record_connect_start();
        log.add_upload(1000);
        log.add_download(5000);
        let snap = log.snapshot();
        assert_eq!(snap.total_upload, 1000);
        assert_eq!(snap.total_download, 5000);
        assert_eq!(snap.active_connections, 1);
        assert!(snap.download_rate > 0.0);
    }
}
