//! Server selection
//!
//! Picks the server for a new tunnel session. Most algorithms draw a
//! weighted lottery over a per-server *chance* score derived from the
//! server's health, so degraded servers still see occasional traffic and
//! their recovery gets noticed. A stickiness cache keeps a destination on
//! the server it used last while that server stays healthy.

use crate::server::ServerProfile;
use lru::LruCache;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Selector errors
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("Unknown balance algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Score of a perfectly healthy idle server
pub const MAX_CHANCE: f64 = 10000.0;

/// Score floor for servers with more than 10 consecutive errors
pub const MIN_CHANCE: f64 = 10.0;

/// Consecutive errors at which a sticky or preferred server is abandoned
pub const UNHEALTHY_ERRORS: u64 = 10;

/// How long the `Timer` algorithm keeps its choice
pub const TIMER_INTERVAL: Duration = Duration::from_secs(60);

const STICKY_CAPACITY: usize = 4096;

/// Balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAlgorithm {
    /// Round robin
    OneByOne,
    /// Uniform
    Random,
    /// Weighted by chance and recent download rate
    FastDownloadSpeed,
    /// Weighted by chance
    LowException,
    /// Preferred server while healthy, otherwise `LowException`
    SelectedFirst,
    /// `LowException`, re-drawn once per interval
    Timer,
}

impl BalanceAlgorithm {
    pub const ALL: [BalanceAlgorithm; 6] = [
        BalanceAlgorithm::OneByOne,
        BalanceAlgorithm::Random,
        BalanceAlgorithm::FastDownloadSpeed,
        BalanceAlgorithm::LowException,
        BalanceAlgorithm::SelectedFirst,
        BalanceAlgorithm::Timer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BalanceAlgorithm::OneByOne => "OneByOne",
            BalanceAlgorithm::Random => "Random",
            BalanceAlgorithm::FastDownloadSpeed => "FastDownloadSpeed",
            BalanceAlgorithm::LowException => "LowException",
            BalanceAlgorithm::SelectedFirst => "SelectedFirst",
            BalanceAlgorithm::Timer => "Timer",
        }
    }
}

impl FromStr for BalanceAlgorithm {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace(['_', '-', ' '], "");
        BalanceAlgorithm::ALL
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| SelectorError::UnknownAlgorithm(s.to_string()))
    }
}

impl fmt::Display for BalanceAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs of one selection
#[derive(Debug, Clone, Copy)]
pub struct SelectRequest<'a> {
    pub algorithm: BalanceAlgorithm,
    /// Balance at all; otherwise use `current_index`
    pub random: bool,
    /// Preferred server index
    pub current_index: usize,
    /// Only servers of this group
    pub group: Option<&'a str>,
    /// Destination key for the stickiness cache
    pub target: Option<&'a str>,
    /// Index of a server that just failed this session
    pub exclude: Option<usize>,
    /// Stickiness lifetime; zero disables it
    pub sticky_ttl: Duration,
}

impl<'a> SelectRequest<'a> {
    pub fn new(algorithm: BalanceAlgorithm) -> Self {
        Self {
            algorithm,
            random: true,
            current_index: 0,
            group: None,
            target: None,
            exclude: None,
            sticky_ttl: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct StickyEntry {
    server_id: String,
    at: Instant,
}

struct SelectorState {
    sticky: LruCache<String, StickyEntry>,
    round_robin: usize,
    timer_choice: Option<(String, Instant)>,
    rng: StdRng,
}

/// Selection state of one listener
pub struct ServerSelector {
    state: Mutex<SelectorState>,
}

impl Default for ServerSelector {
    fn default() -> Self {
        Self::new()
    }
}

fn is_healthy(server: &ServerProfile) -> bool {
    server.is_enabled() && server.health().consecutive_errors() < UNHEALTHY_ERRORS
}

/// Chance score of one server
pub fn chance(server: &ServerProfile, algorithm: BalanceAlgorithm, avg_download: f64) -> f64 {
    let health = server.health();
    let errors = health.consecutive_errors();

    let mut score = if errors > 20 {
        1.0
    } else {
        (MAX_CHANCE / 2f64.powi(errors as i32)).max(MIN_CHANCE)
    };

    score /= 1.0 + 0.1 * health.active_connections() as f64;

    if let Some(latency) = health.avg_connect_latency() {
        let ms = latency.as_secs_f64() * 1000.0;
        score *= (500.0 / (ms + 100.0)).clamp(0.25, 4.0);
    }

    if algorithm == BalanceAlgorithm::FastDownloadSpeed {
        let factor = (health.download_rate() + 1.0) / (avg_download + 1.0);
        score *= factor.clamp(0.1, 10.0);
    }

    score.max(f64::MIN_POSITIVE)
}

impl ServerSelector {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic selector for tests and simulations
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(SelectorState {
                sticky: LruCache::new(
                    NonZeroUsize::new(STICKY_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                ),
                round_robin: 0,
                timer_choice: None,
                rng,
            }),
        }
    }

    /// Pick a server index, or `None` when no server is usable
    pub fn select(&self, servers: &[Arc<ServerProfile>], req: &SelectRequest<'_>) -> Option<usize> {
        let mut candidates: Vec<usize> = servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_enabled())
            .filter(|(_, s)| req.group.map_or(true, |g| g.is_empty() || s.group == g))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        if let Some(excluded) = req.exclude {
            if candidates.len() > 1 {
                candidates.retain(|&i| i != excluded);
            }
        }

        if !req.random {
            if candidates.contains(&req.current_index) {
                return Some(req.current_index);
            }
            return candidates.first().copied();
        }

        let mut state = self.state.lock();
        let sticky_key = req.target.filter(|_| !req.sticky_ttl.is_zero());

        if let Some(key) = sticky_key {
            if let Some(entry) = state.sticky.get(key).cloned() {
                let fresh = entry.at.elapsed() < req.sticky_ttl;
                let pos = servers.iter().position(|s| s.id == entry.server_id);
                match pos {
                    Some(i) if candidates.contains(&i) && is_healthy(&servers[i]) => {
                        if fresh {
                            return Some(i);
                        }
                        // Expired: a fresh draw over the whole pool
                        trace!("Sticky server {} for {} expired", entry.server_id, key);
                    }
                    Some(i) if candidates.len() > 1 => {
                        debug!("Dropping sticky server {} for {}", entry.server_id, key);
                        candidates.retain(|&c| c != i);
                    }
                    _ => {}
                }
                state.sticky.pop(key);
            }
        }

        let index = self.pick(&mut state, servers, &candidates, req);

        if let Some(key) = sticky_key {
            state.sticky.put(
                key.to_string(),
                StickyEntry {
                    server_id: servers[index].id.clone(),
                    at: Instant::now(),
                },
            );
        }
        Some(index)
    }

    fn pick(
        &self,
        state: &mut SelectorState,
        servers: &[Arc<ServerProfile>],
        candidates: &[usize],
        req: &SelectRequest<'_>,
    ) -> usize {
        match req.algorithm {
            BalanceAlgorithm::OneByOne => {
                let index = candidates[state.round_robin % candidates.len()];
                state.round_robin = state.round_robin.wrapping_add(1);
                index
            }
            BalanceAlgorithm::Random => candidates[state.rng.gen_range(0..candidates.len())],
            BalanceAlgorithm::SelectedFirst => {
                let current = req.current_index;
                if candidates.contains(&current) && is_healthy(&servers[current]) {
                    current
                } else {
                    Self::lottery(state, servers, candidates, BalanceAlgorithm::LowException)
                }
            }
            BalanceAlgorithm::Timer => {
                if let Some((id, at)) = &state.timer_choice {
                    if at.elapsed() < TIMER_INTERVAL {
                        if let Some(i) = candidates.iter().copied().find(|&i| &servers[i].id == id) {
                            if is_healthy(&servers[i]) {
                                return i;
                            }
                        }
                    }
                }
                let index =
                    Self::lottery(state, servers, candidates, BalanceAlgorithm::LowException);
                state.timer_choice = Some((servers[index].id.clone(), Instant::now()));
                index
            }
            algorithm => Self::lottery(state, servers, candidates, algorithm),
        }
    }

    /// Weighted draw over the cumulative chance partition
    fn lottery(
        state: &mut SelectorState,
        servers: &[Arc<ServerProfile>],
        candidates: &[usize],
        algorithm: BalanceAlgorithm,
    ) -> usize {
        let avg_download = if algorithm == BalanceAlgorithm::FastDownloadSpeed {
            let total: f64 = candidates
                .iter()
                .map(|&i| servers[i].health().download_rate())
                .sum();
            total / candidates.len() as f64
        } else {
            0.0
        };

        let mut cumulative = Vec::with_capacity(candidates.len());
        let mut total = 0.0;
        for &i in candidates {
            total += chance(&servers[i], algorithm, avg_download);
            cumulative.push(total);
        }

        let draw = state.rng.gen_range(0.0..total);
        let slot = cumulative
            .partition_point(|&c| c <= draw)
            .min(candidates.len() - 1);
        candidates[slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::FailureKind;

    fn servers(n: usize) -> Vec<Arc<ServerProfile>> {
        (0..n)
            .map(|i| Arc::new(ServerProfile::for_test(&format!("s{}", i), "127.0.0.1", 8000 + i as u16)))
            .collect()
    }

    fn lottery_request() -> SelectRequest<'static> {
        SelectRequest::new(BalanceAlgorithm::LowException)
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(
            "lowexception".parse::<BalanceAlgorithm>().unwrap(),
            BalanceAlgorithm::LowException
        );
        assert_eq!(
            "fast_download_speed".parse::<BalanceAlgorithm>().unwrap(),
            BalanceAlgorithm::FastDownloadSpeed
        );
        assert!("Fastest".parse::<BalanceAlgorithm>().is_err());
    }

    #[test]
    fn test_chance_decreases_with_errors() {
        let list = servers(1);
        let mut last = f64::MAX;
        for errors in 0..25 {
            list[0].health().set_consecutive_errors(errors);
            let c = chance(&list[0], BalanceAlgorithm::LowException, 0.0);
            assert!(c <= last, "errors={} chance={} last={}", errors, c, last);
            last = c;
        }
        list[0].health().set_consecutive_errors(15);
        assert_eq!(chance(&list[0], BalanceAlgorithm::LowException, 0.0), MIN_CHANCE);
        list[0].health().set_consecutive_errors(21);
        assert_eq!(chance(&list[0], BalanceAlgorithm::LowException, 0.0), 1.0);
    }

    #[test]
    fn test_equal_health_splits_evenly() {
        let list = servers(2);
        let selector = ServerSelector::with_seed(7);
        let req = lottery_request();

        let mut counts = [0usize; 2];
        for _ in 0..10_000 {
            counts[selector.select(&list, &req).unwrap()] += 1;
        }
        assert!(counts[0] > 4_500 && counts[0] < 5_500, "{:?}", counts);
    }

    #[test]
    fn test_degraded_server_loses_share() {
        let list = servers(2);
        let req = lottery_request();
        let mut last_share = usize::MAX;

        for errors in [0u64, 1, 2, 4] {
            list[1].health().set_consecutive_errors(errors);
            let selector = ServerSelector::with_seed(11);
            let share = (0..10_000)
                .filter(|_| selector.select(&list, &req) == Some(1))
                .count();
            assert!(share < last_share, "errors={} share={}", errors, share);
            last_share = share;
        }
    }

    #[test]
    fn test_stickiness() {
        let list = servers(3);
        let selector = ServerSelector::with_seed(3);
        let mut req = lottery_request();
        req.target = Some("example.com:443");
        req.sticky_ttl = Duration::from_secs(60);

        let first = selector.select(&list, &req).unwrap();
        for _ in 0..20 {
            assert_eq!(selector.select(&list, &req), Some(first));
        }

        for _ in 0..UNHEALTHY_ERRORS {
            list[first].health().record_failure(FailureKind::Timeout);
        }
        let next = selector.select(&list, &req).unwrap();
        assert_ne!(next, first);
        assert_eq!(selector.select(&list, &req), Some(next));
    }

    #[test]
    fn test_sticky_disabled_server_replaced() {
        let list = servers(2);
        let selector = ServerSelector::with_seed(5);
        let mut req = lottery_request();
        req.target = Some("a:1");
        req.sticky_ttl = Duration::from_secs(60);

        let first = selector.select(&list, &req).unwrap();
        list[first].set_enabled(false);
        assert_eq!(selector.select(&list, &req), Some(1 - first));
    }

    #[test]
    fn test_expired_sticky_server_stays_eligible() {
        let list = servers(2);
        let selector = ServerSelector::with_seed(13);
        let targets: Vec<String> = (0..200).map(|i| format!("host{}:443", i)).collect();
        let mut req = lottery_request();
        req.sticky_ttl = Duration::from_millis(1);

        let mut first = Vec::with_capacity(targets.len());
        for target in &targets {
            req.target = Some(target.as_str());
            first.push(selector.select(&list, &req).unwrap());
        }
        std::thread::sleep(Duration::from_millis(3));

        let mut kept = 0;
        for (target, before) in targets.iter().zip(&first) {
            req.target = Some(target.as_str());
            if selector.select(&list, &req) == Some(*before) {
                kept += 1;
            }
        }
        // Expiry means a fresh draw, not a forced move
        assert!(kept > 50 && kept < 150, "kept={}", kept);
    }

    #[test]
    fn test_exclude_previous() {
        let list = servers(2);
        let selector = ServerSelector::with_seed(9);
        let mut req = lottery_request();
        req.exclude = Some(0);
        for _ in 0..100 {
            assert_eq!(selector.select(&list, &req), Some(1));
        }

        let single = servers(1);
        assert_eq!(selector.select(&single, &req), Some(0));
    }

    #[test]
    fn test_one_by_one_rotates() {
        let list = servers(3);
        let selector = ServerSelector::with_seed(1);
        let req = SelectRequest::new(BalanceAlgorithm::OneByOne);
        let picks: Vec<usize> = (0..6).filter_map(|_| selector.select(&list, &req)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_selected_first_and_fixed() {
        let list = servers(3);
        let selector = ServerSelector::with_seed(1);
        let mut req = SelectRequest::new(BalanceAlgorithm::SelectedFirst);
        req.current_index = 2;
        assert_eq!(selector.select(&list, &req), Some(2));

        list[2].health().set_consecutive_errors(UNHEALTHY_ERRORS);
        assert_ne!(selector.select(&list, &req), Some(2));

        req.random = false;
        assert_eq!(selector.select(&list, &req), Some(2));

        // A fixed server that just failed gives way on reconnect
        req.exclude = Some(2);
        assert_eq!(selector.select(&list, &req), Some(0));
    }

    #[test]
    fn test_timer_keeps_choice() {
        let list = servers(4);
        let selector = ServerSelector::with_seed(21);
        let req = SelectRequest::new(BalanceAlgorithm::Timer);
        let first = selector.select(&list, &req).unwrap();
        for _ in 0..50 {
            assert_eq!(selector.select(&list, &req), Some(first));
        }
    }

    #[test]
    fn test_group_filter_and_empty() {
        let list = servers(2);
        let selector = ServerSelector::with_seed(1);
        let mut req = lottery_request();
        req.group = Some("nope");
        assert_eq!(selector.select(&list, &req), None);

        for s in &list {
            s.set_enabled(false);
        }
        assert_eq!(selector.select(&list, &lottery_request()), None);
    }
}
