//! Selection strategies over the live client set.

use crate::client::HostClient;
use crate::config::LbStrategy;
use crate::lb_client::LbClient;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// One selection policy. Implementations are called under the balancer's
/// read lock and must keep any stepping state internally synchronized.
pub(crate) trait Strategy: Send + Sync {
    /// Pick one client. Returns `None` only when the slice is empty or the
    /// policy has no viable candidate.
    fn select(&self, cs: &[Arc<LbClient>]) -> Option<Arc<LbClient>>;

    /// Called after every pool swap with the new pool list.
    fn rebuild(&self, _clients: &[Arc<HostClient>]) {}
}

/// Uniform random pick from a strategy-owned generator.
pub(crate) struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    pub(crate) fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }
}

impl Strategy for RandomStrategy {
    fn select(&self, cs: &[Arc<LbClient>]) -> Option<Arc<LbClient>> {
        if cs.is_empty() {
            return None;
        }
        let index = self
            .rng
            .lock()
            .expect("rng lock poisoned")
            .random_range(0..cs.len());
        Some(Arc::clone(&cs[index]))
    }
}

/// Monotonic rotation. The counter advances before use, so the first pick
/// lands on index 1.
pub(crate) struct RoundRobinStrategy {
    index: AtomicU32,
}

impl RoundRobinStrategy {
    pub(crate) fn new() -> Self {
        Self {
            index: AtomicU32::new(0),
        }
    }
}

impl Strategy for RoundRobinStrategy {
    fn select(&self, cs: &[Arc<LbClient>]) -> Option<Arc<LbClient>> {
        if cs.is_empty() {
            return None;
        }
        let turn = self.index.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Some(Arc::clone(&cs[turn as usize % cs.len()]))
    }
}

/// Smooth weighted round-robin.
///
/// The classic current-weight walk: each full pass over the clients lowers
/// the scheduling weight `cw` by the gcd of all weights, resetting it to the
/// maximum weight when it reaches zero; a client is picked when its weight
/// is at least `cw`. Heavier clients are interleaved rather than burst.
pub(crate) struct WeightedRoundRobinStrategy {
    state: Mutex<WrrState>,
}

struct WrrState {
    /// Index of the last pick, -1 before the first.
    i: i64,
    /// Current scheduling weight.
    cw: i64,
    /// Gcd of all client weights.
    gcd: u16,
    /// Largest client weight.
    max_weight: u16,
}

impl WeightedRoundRobinStrategy {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WrrState {
                i: -1,
                cw: 0,
                gcd: 0,
                max_weight: 0,
            }),
        }
    }
}

impl Strategy for WeightedRoundRobinStrategy {
    fn select(&self, cs: &[Arc<LbClient>]) -> Option<Arc<LbClient>> {
        if cs.is_empty() {
            return None;
        }
        let mut state = self.state.lock().expect("wrr state lock poisoned");
        if state.max_weight == 0 {
            return None;
        }
        let n = cs.len() as i64;
        loop {
            state.i = (state.i + 1) % n;
            if state.i == 0 {
                state.cw -= i64::from(state.gcd);
                if state.cw <= 0 {
                    state.cw = i64::from(state.max_weight);
                }
            }
            let index = state.i as usize;
            if i64::from(cs[index].node().weight) >= state.cw {
                return Some(Arc::clone(&cs[index]));
            }
        }
    }

    fn rebuild(&self, clients: &[Arc<HostClient>]) {
        let mut state = self.state.lock().expect("wrr state lock poisoned");
        state.i = -1;
        state.cw = 0;
        state.gcd = clients
            .iter()
            .fold(0, |acc, client| gcd(acc, client.node().weight));
        state.max_weight = clients
            .iter()
            .map(|client| client.node().weight)
            .max()
            .unwrap_or(0);
    }
}

fn gcd(a: u16, b: u16) -> u16 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Fewest in-flight requests wins; ties break to the fewest completed
/// requests, and the earliest client wins any remaining tie.
pub(crate) struct LeastLoadedStrategy;

impl Strategy for LeastLoadedStrategy {
    fn select(&self, cs: &[Arc<LbClient>]) -> Option<Arc<LbClient>> {
        let mut iter = cs.iter();
        let first = iter.next()?;
        let mut best = first;
        let mut best_pending = first.pending_requests();
        let mut best_total = first.total();
        for client in iter {
            let pending = client.pending_requests();
            let total = client.total();
            if pending < best_pending || (pending == best_pending && total < best_total) {
                best = client;
                best_pending = pending;
                best_total = total;
            }
        }
        Some(Arc::clone(best))
    }
}

/// Static dispatch over the four selection policies.
pub(crate) enum StrategyContainer {
    Random(RandomStrategy),
    RoundRobin(RoundRobinStrategy),
    WeightedRoundRobin(WeightedRoundRobinStrategy),
    LeastConnection(LeastLoadedStrategy),
}

impl StrategyContainer {
    pub(crate) fn new(strategy: LbStrategy) -> Self {
        match strategy {
            LbStrategy::Random => Self::Random(RandomStrategy::new()),
            LbStrategy::RoundRobin => Self::RoundRobin(RoundRobinStrategy::new()),
            LbStrategy::WeightedRoundRobin => {
                Self::WeightedRoundRobin(WeightedRoundRobinStrategy::new())
            }
            LbStrategy::LeastConnection => Self::LeastConnection(LeastLoadedStrategy),
        }
    }

    fn as_strategy(&self) -> &dyn Strategy {
        match self {
            Self::Random(s) => s,
            Self::RoundRobin(s) => s,
            Self::WeightedRoundRobin(s) => s,
            Self::LeastConnection(s) => s,
        }
    }

    pub(crate) fn select(&self, cs: &[Arc<LbClient>]) -> Option<Arc<LbClient>> {
        self.as_strategy().select(cs)
    }

    pub(crate) fn rebuild(&self, clients: &[Arc<HostClient>]) {
        self.as_strategy().rebuild(clients);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Opts;
    use crate::node::Node;
    use std::collections::HashMap;

    fn make_set(weights: &[u16]) -> (Vec<Arc<HostClient>>, Vec<Arc<LbClient>>) {
        let opts = Opts::default();
        let clients: Vec<Arc<HostClient>> = weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                Arc::new(HostClient::new(
                    Node::new(format!("10.0.0.{}", i + 1), 80, *weight),
                    &opts,
                ))
            })
            .collect();
        let cs = clients
            .iter()
            .map(|client| Arc::new(LbClient::new(Arc::clone(client), None)))
            .collect();
        (clients, cs)
    }

    #[test]
    fn test_round_robin_starts_at_one_and_rotates() {
        let (_, cs) = make_set(&[100, 100, 100]);
        let strategy = RoundRobinStrategy::new();

        let first = strategy.select(&cs).unwrap();
        assert_eq!(first.name(), cs[1].name());

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..11 {
            let picked = strategy.select(&cs).unwrap();
            *counts.entry(picked.name().to_string()).or_default() += 1;
        }
        // 12 picks total over 3 clients: each seen exactly 4 times.
        *counts.entry(first.name().to_string()).or_default() += 1;
        assert!(counts.values().all(|count| *count == 4), "{counts:?}");
    }

    #[test]
    fn test_round_robin_empty() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.select(&[]).is_none());
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let (_, cs) = make_set(&[100, 100]);
        let strategy = RandomStrategy::new();
        for _ in 0..50 {
            let picked = strategy.select(&cs).unwrap();
            assert!(cs.iter().any(|c| c.name() == picked.name()));
        }
        assert!(strategy.select(&[]).is_none());
    }

    #[test]
    fn test_weighted_round_robin_cycle_counts() {
        let (clients, cs) = make_set(&[4, 2, 1]);
        let strategy = WeightedRoundRobinStrategy::new();
        strategy.rebuild(&clients);

        // gcd=1, max=4: one cycle is 7 picks with counts 4/2/1.
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..7 {
            let picked = strategy.select(&cs).unwrap();
            *counts.entry(picked.name().to_string()).or_default() += 1;
        }
        assert_eq!(counts[cs[0].name()], 4);
        assert_eq!(counts[cs[1].name()], 2);
        assert_eq!(counts[cs[2].name()], 1);

        // The next cycle repeats the same distribution.
        for _ in 0..7 {
            let picked = strategy.select(&cs).unwrap();
            *counts.entry(picked.name().to_string()).or_default() += 1;
        }
        assert_eq!(counts[cs[0].name()], 8);
        assert_eq!(counts[cs[1].name()], 4);
        assert_eq!(counts[cs[2].name()], 2);
    }

    #[test]
    fn test_weighted_round_robin_equal_weights_rotate() {
        let (clients, cs) = make_set(&[100, 100, 100]);
        let strategy = WeightedRoundRobinStrategy::new();
        strategy.rebuild(&clients);

        let picks: Vec<String> = (0..6)
            .map(|_| strategy.select(&cs).unwrap().name().to_string())
            .collect();
        assert_eq!(picks[0], cs[0].name());
        assert_eq!(picks[1], cs[1].name());
        assert_eq!(picks[2], cs[2].name());
        assert_eq!(picks[..3], picks[3..]);
    }

    #[test]
    fn test_weighted_round_robin_without_rebuild_yields_none() {
        let (_, cs) = make_set(&[4, 2]);
        let strategy = WeightedRoundRobinStrategy::new();
        assert!(strategy.select(&cs).is_none());
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(0, 5), 5);
        assert_eq!(gcd(4, 6), 2);
        assert_eq!([2u16, 4, 8].iter().fold(0, |acc, w| gcd(acc, *w)), 2);
        assert_eq!([4u16, 2, 1].iter().fold(0, |acc, w| gcd(acc, *w)), 1);
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_lowest_pending() {
        let (clients, cs) = make_set(&[100, 100]);
        clients[0].add_pending(5);
        clients[1].add_pending(3);

        let strategy = LeastLoadedStrategy;
        let picked = strategy.select(&cs).unwrap();
        assert_eq!(picked.name(), cs[1].name());
    }

    #[tokio::test]
    async fn test_least_loaded_penalty_shifts_selection() {
        let (clients, cs) = make_set(&[100, 100]);
        clients[0].add_pending(5);
        clients[1].add_pending(3);

        // Three unhealthy calls on the second client tie it at 6 against 5.
        cs[1].penalize();
        cs[1].penalize();
        cs[1].penalize();

        let strategy = LeastLoadedStrategy;
        let picked = strategy.select(&cs).unwrap();
        assert_eq!(picked.name(), cs[0].name());
    }

    #[tokio::test]
    async fn test_least_loaded_ties_break_to_lower_total_then_first() {
        let (_, cs) = make_set(&[100, 100, 100]);
        cs[0].add_total(4);
        cs[1].add_total(2);
        cs[2].add_total(2);

        let strategy = LeastLoadedStrategy;
        let picked = strategy.select(&cs).unwrap();
        assert_eq!(picked.name(), cs[1].name());

        assert!(strategy.select(&[]).is_none());
    }

    #[test]
    fn test_container_dispatch() {
        let (clients, cs) = make_set(&[100]);
        for strategy in [
            LbStrategy::Random,
            LbStrategy::RoundRobin,
            LbStrategy::WeightedRoundRobin,
            LbStrategy::LeastConnection,
        ] {
            let container = StrategyContainer::new(strategy);
            container.rebuild(&clients);
            assert!(container.select(&cs).is_some(), "{strategy:?}");
        }
    }
}
