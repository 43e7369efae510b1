//! Known-peer bookkeeping.
//!
//! Peers arrive through handshakes and keeplives; stale entries age out.
//! Random selection feeds bootstrap and block queries.

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use strand_types::{Account, Amount};

/// One reachable peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub account: Account,
    pub endpoint: SocketAddr,
    pub weight: Amount,
    pub last_contact: Instant,
}

/// The peer table.
pub struct Peers {
    inner: Mutex<HashMap<Account, Peer>>,
    cutoff: Duration,
}

impl Peers {
    /// Peers silent for this long are dropped.
    pub const DEFAULT_CUTOFF: Duration = Duration::from_secs(300);

    pub fn new(cutoff: Duration) -> Self {
        Peers {
            inner: Mutex::new(HashMap::new()),
            cutoff,
        }
    }

    pub fn insert(&self, account: Account, endpoint: SocketAddr, weight: Amount) {
        self.inner.lock().insert(
            account,
            Peer {
                account,
                endpoint,
                weight,
                last_contact: Instant::now(),
            },
        );
    }

    /// Refreshes the liveness timestamp of a known peer.
    pub fn contact(&self, account: &Account) {
        if let Some(peer) = self.inner.lock().get_mut(account) {
            peer.last_contact = Instant::now();
        }
    }

    pub fn update_weight(&self, account: &Account, weight: Amount) {
        if let Some(peer) = self.inner.lock().get_mut(account) {
            peer.weight = weight;
        }
    }

    pub fn get(&self, account: &Account) -> Option<Peer> {
        self.inner.lock().get(account).cloned()
    }

    pub fn random_peer(&self) -> Option<Peer> {
        let inner = self.inner.lock();
        inner.values().choose(&mut rand::thread_rng()).cloned()
    }

    pub fn random_peers(&self, count: usize) -> Vec<Peer> {
        let inner = self.inner.lock();
        inner
            .values()
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.inner.lock().values().map(|p| p.endpoint).collect()
    }

    /// Drops peers past the liveness cutoff.
    pub fn age(&self) {
        let cutoff = Instant::now() - self.cutoff;
        self.inner.lock().retain(|_, p| p.last_contact >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for Peers {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CUTOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::U256;

    #[test]
    fn insert_select_age() {
        let peers = Peers::new(Duration::from_millis(0));
        assert!(peers.random_peer().is_none());

        let account = U256::from_u64(1);
        peers.insert(account, "127.0.0.1:7175".parse().unwrap(), Amount(10));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.random_peer().unwrap().account, account);

        std::thread::sleep(Duration::from_millis(5));
        peers.age();
        assert!(peers.is_empty());
    }

    #[test]
    fn random_peers_bounded() {
        let peers = Peers::default();
        for i in 0..5 {
            peers.insert(
                U256::from_u64(i),
                format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
                Amount(1),
            );
        }
        assert_eq!(peers.random_peers(3).len(), 3);
        assert_eq!(peers.random_peers(10).len(), 5);
    }
}
