use std::time::Duration;

use natrix_proto::ServerAddr;
use rand::{seq::SliceRandom, Rng};
use tokio::time::Instant;
use tracing::debug;

/// The set of servers the client may connect to
///
/// Seeded from user-supplied addresses and extended by the cluster
/// topology gossiped through `INFO.connect_urls`. Reconnect attempts
/// walk the pool round-robin starting after the last-tried entry,
/// with a jittered linear backoff per entry.
#[derive(Debug)]
pub(crate) struct ServerPool {
    entries: Vec<ServerEntry>,
    last_index: Option<usize>,
    randomize: bool,
    reconnect_time_wait: Duration,
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug)]
struct ServerEntry {
    addr: ServerAddr,
    discovered: bool,
    reconnect_attempts: u32,
    last_connected_at: Option<Instant>,
}

/// The pool membership delta produced by an `INFO.connect_urls` update
#[derive(Debug, Default)]
pub(crate) struct PoolUpdate {
    pub(crate) added: Vec<ServerAddr>,
    pub(crate) removed: Vec<ServerAddr>,
}

impl PoolUpdate {
    pub(crate) fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl ServerPool {
    pub(crate) fn new(
        seeds: Vec<ServerAddr>,
        randomize: bool,
        reconnect_time_wait: Duration,
        max_reconnect_attempts: Option<u32>,
    ) -> Self {
        debug_assert!(!seeds.is_empty());

        let mut entries = seeds
            .into_iter()
            .map(|addr| ServerEntry {
                addr,
                discovered: false,
                reconnect_attempts: 0,
                last_connected_at: None,
            })
            .collect::<Vec<_>>();
        if randomize {
            entries.shuffle(&mut rand::thread_rng());
        }

        Self {
            entries,
            last_index: None,
            randomize,
            reconnect_time_wait,
            max_reconnect_attempts,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pick the next server to try
    ///
    /// Walks the pool round-robin starting after the last-tried entry,
    /// skipping entries that exhausted their attempt budget. Returns
    /// the address together with the backoff delay to wait before
    /// dialing it, or `None` once every entry is exhausted.
    pub(crate) fn next(&mut self) -> Option<(ServerAddr, Duration)> {
        let n = self.entries.len();
        let start = self.last_index.map_or(0, |i| (i + 1) % n);

        for offset in 0..n {
            let i = (start + offset) % n;
            if self
                .max_reconnect_attempts
                .is_some_and(|max| self.entries[i].reconnect_attempts >= max)
            {
                continue;
            }

            let entry = &mut self.entries[i];
            entry.reconnect_attempts += 1;
            self.last_index = Some(i);

            let delay = backoff(self.reconnect_time_wait, entry.reconnect_attempts);
            return Some((entry.addr.clone(), delay));
        }

        None
    }

    /// Reset the attempt accounting of `addr` after a successful connect
    pub(crate) fn mark_connected(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.addr.is_same_endpoint(addr))
        {
            entry.reconnect_attempts = 0;
            entry.last_connected_at = Some(Instant::now());
        }
    }

    /// Reconcile the pool with a gossiped `connect_urls` list
    ///
    /// Newly seen endpoints are appended as discovered entries; known
    /// endpoints absent from the gossip are removed unless they were
    /// user-seeded. An empty gossip list carries no topology and is
    /// ignored.
    pub(crate) fn apply_connect_urls(&mut self, connect_urls: &[ServerAddr]) -> PoolUpdate {
        if connect_urls.is_empty() {
            return PoolUpdate::default();
        }

        let mut update = PoolUpdate::default();

        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            let keep = !entry.discovered
                || connect_urls
                    .iter()
                    .any(|url| url.is_same_endpoint(&entry.addr));
            if !keep {
                removed.push(entry.addr.clone());
            }
            keep
        });
        update.removed = removed;

        for url in connect_urls {
            if self
                .entries
                .iter()
                .any(|entry| entry.addr.is_same_endpoint(url))
            {
                continue;
            }

            let entry = ServerEntry {
                addr: url.clone(),
                discovered: true,
                reconnect_attempts: 0,
                last_connected_at: None,
            };
            if self.randomize {
                let i = rand::thread_rng().gen_range(0..=self.entries.len());
                self.entries.insert(i, entry);
            } else {
                self.entries.push(entry);
            }
            update.added.push(url.clone());
        }

        // Removal shifts indices; restart the rotation rather than
        // chasing the previous position
        if !update.removed.is_empty() {
            self.last_index = None;
        }

        if !update.is_empty() {
            debug!(
                added = update.added.len(),
                removed = update.removed.len(),
                pool = self.entries.len(),
                "server pool updated from gossip"
            );
        }

        update
    }
}

fn backoff(base: Duration, attempts: u32) -> Duration {
    if attempts <= 1 {
        return Duration::ZERO;
    }

    let scaled = base.saturating_mul(attempts - 1);
    scaled.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use natrix_proto::ServerAddr;

    use super::ServerPool;

    fn addr(s: &str) -> ServerAddr {
        s.parse().unwrap()
    }

    fn pool(seeds: &[&str]) -> ServerPool {
        ServerPool::new(
            seeds.iter().map(|s| addr(s)).collect(),
            false,
            Duration::from_millis(100),
            Some(2),
        )
    }

    #[test]
    fn round_robin_after_last_tried() {
        let mut pool = pool(&["nats://a", "nats://b", "nats://c"]);

        let (first, delay) = pool.next().unwrap();
        assert_eq!("nats://a", first.to_string());
        assert_eq!(Duration::ZERO, delay);

        let (second, _) = pool.next().unwrap();
        assert_eq!("nats://b", second.to_string());

        pool.mark_connected(&second);
        let (third, _) = pool.next().unwrap();
        assert_eq!("nats://c", third.to_string());
    }

    #[test]
    fn exhausts_after_per_server_cap() {
        let mut pool = pool(&["nats://a", "nats://b"]);

        for _ in 0..4 {
            assert!(pool.next().is_some());
        }
        assert!(pool.next().is_none());
    }

    #[test]
    fn success_resets_attempts() {
        let mut pool = pool(&["nats://a"]);

        let (a, _) = pool.next().unwrap();
        let _ = pool.next().unwrap();
        assert!(pool.next().is_none());

        pool.mark_connected(&a);
        assert!(pool.next().is_some());
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let mut pool = ServerPool::new(
            vec![addr("nats://a")],
            false,
            Duration::from_millis(100),
            None,
        );

        let (_, first) = pool.next().unwrap();
        assert_eq!(Duration::ZERO, first);

        let (_, second) = pool.next().unwrap();
        assert!(second >= Duration::from_millis(50));
        assert!(second < Duration::from_millis(150));

        let (_, third) = pool.next().unwrap();
        assert!(third >= Duration::from_millis(100));
        assert!(third < Duration::from_millis(300));
    }

    #[test]
    fn gossip_adds_and_removes_discovered() {
        let mut pool = pool(&["nats://a"]);

        let update = pool.apply_connect_urls(&[addr("nats://b"), addr("nats://c")]);
        assert_eq!(2, update.added.len());
        assert!(update.removed.is_empty());
        assert_eq!(3, pool.len());

        // `b` disappears from the gossip and is dropped
        let update = pool.apply_connect_urls(&[addr("nats://c")]);
        assert!(update.added.is_empty());
        assert_eq!(1, update.removed.len());
        assert_eq!("nats://b", update.removed[0].to_string());
        assert_eq!(2, pool.len());
    }

    #[test]
    fn gossip_never_drops_seeds() {
        let mut pool = pool(&["nats://a", "nats://b"]);

        let update = pool.apply_connect_urls(&[addr("nats://c")]);
        assert_eq!(1, update.added.len());
        assert!(update.removed.is_empty());
        assert_eq!(3, pool.len());
    }

    #[test]
    fn repeated_gossip_is_idempotent() {
        let mut pool = pool(&["nats://a"]);

        let update = pool.apply_connect_urls(&[addr("nats://b")]);
        assert_eq!(1, update.added.len());

        let update = pool.apply_connect_urls(&[addr("nats://b")]);
        assert!(update.is_empty());
    }

    #[test]
    fn empty_gossip_is_ignored() {
        let mut pool = pool(&["nats://a"]);
        pool.apply_connect_urls(&[addr("nats://b")]);

        let update = pool.apply_connect_urls(&[]);
        assert!(update.is_empty());
        assert_eq!(2, pool.len());
    }
}
