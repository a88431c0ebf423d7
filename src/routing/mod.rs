/// Key-to-server routing for one cluster
///
/// A `BucketRouter` is built once from the cluster's weighted server list and
/// is read-only afterwards. `route` returns the primary server for a key
/// followed by every other server in failover order.
pub mod hash;

use std::collections::BTreeMap;

use crate::core::ServerSpec;
use crate::utils::gcd;

pub use hash::HashingAlgorithm;

/// Distribution table derived from server weights
#[derive(Debug, Clone)]
pub enum DistributionTable {
    /// Each server occupies `weight / gcd` consecutive slots
    Buckets(Vec<usize>),
    /// Ring point -> server index
    Ring(BTreeMap<u32, usize>),
}

impl DistributionTable {
    pub fn len(&self) -> usize {
        match self {
            DistributionTable::Buckets(slots) => slots.len(),
            DistributionTable::Ring(ring) => ring.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct BucketRouter {
    servers: Vec<ServerSpec>,
    algorithm: HashingAlgorithm,
    table: DistributionTable,
    /// Servers present in the table, counted once each
    distinct: usize,
    /// Zero-weight servers, offered only after every weighted server
    last_resort: Vec<usize>,
}

impl BucketRouter {
    pub fn new(servers: Vec<ServerSpec>, algorithm: HashingAlgorithm) -> Self {
        let table = if algorithm.is_consistent() {
            DistributionTable::Ring(build_ring(&servers))
        } else {
            DistributionTable::Buckets(build_buckets(&servers))
        };
        let distinct = servers.iter().filter(|s| s.weight > 0).count();
        let last_resort = servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.weight == 0)
            .map(|(i, _)| i)
            .collect();

        Self {
            servers,
            algorithm,
            table,
            distinct,
            last_resort,
        }
    }

    pub fn servers(&self) -> &[ServerSpec] {
        &self.servers
    }

    pub fn algorithm(&self) -> HashingAlgorithm {
        self.algorithm
    }

    pub fn table(&self) -> &DistributionTable {
        &self.table
    }

    /// Primary server for a key
    pub fn primary(&self, key: &str) -> Option<&ServerSpec> {
        self.route_indices(key)
            .first()
            .and_then(|&i| self.servers.get(i))
    }

    /// Primary server followed by distinct failover candidates
    pub fn route(&self, key: &str) -> Vec<ServerSpec> {
        self.route_indices(key)
            .into_iter()
            .filter_map(|i| self.servers.get(i).cloned())
            .collect()
    }

    fn route_indices(&self, key: &str) -> Vec<usize> {
        let mut order: Vec<usize> = Vec::with_capacity(self.servers.len());

        match &self.table {
            DistributionTable::Buckets(slots) if !slots.is_empty() => {
                let start = self.algorithm.bucket(key, slots.len());
                for step in 0..slots.len() {
                    if order.len() == self.distinct {
                        break;
                    }
                    let server = slots[(start + step) % slots.len()];
                    if !order.contains(&server) {
                        order.push(server);
                    }
                }
            }
            DistributionTable::Ring(ring) if !ring.is_empty() => {
                let point = hash::md5_hash(key);
                let clockwise = ring.range(point..).chain(ring.range(..point));
                for (_, &server) in clockwise {
                    if order.len() == self.distinct {
                        break;
                    }
                    if !order.contains(&server) {
                        order.push(server);
                    }
                }
            }
            _ => {}
        }

        order.extend(self.last_resort.iter().copied());
        order
    }
}

fn build_buckets(servers: &[ServerSpec]) -> Vec<usize> {
    let divisor = servers
        .iter()
        .map(|s| s.weight)
        .filter(|&w| w > 0)
        .fold(0, gcd)
        .max(1);

    let mut slots = Vec::new();
    for (index, server) in servers.iter().enumerate() {
        for _ in 0..server.weight / divisor {
            slots.push(index);
        }
    }
    slots
}

fn build_ring(servers: &[ServerSpec]) -> BTreeMap<u32, usize> {
    let mut ring = BTreeMap::new();
    for (index, server) in servers.iter().enumerate() {
        for point in hash::ring_points(&server.addr, server.weight) {
            // First server to claim a point keeps it
            ring.entry(point).or_insert(index);
        }
    }
    ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::{Rng, SeedableRng};

    fn servers(weights: &[u32]) -> Vec<ServerSpec> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| ServerSpec::new(format!("10.0.0.{}:11211", i + 1), w))
            .collect()
    }

    fn random_keys(count: usize) -> Vec<String> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        (0..count)
            .map(|_| {
                let len = rng.gen_range(4..24);
                (&mut rng).sample_iter(&Alphanumeric).take(len).map(char::from).collect()
            })
            .collect()
    }

    fn primary_share(router: &BucketRouter, keys: &[String]) -> Vec<f64> {
        let mut counts = vec![0usize; router.servers().len()];
        for key in keys {
            let primary = router.primary(key).unwrap();
            let index = router.servers().iter().position(|s| s == primary).unwrap();
            counts[index] += 1;
        }
        counts.iter().map(|&c| c as f64 / keys.len() as f64).collect()
    }

    #[test]
    fn test_equal_weights_reduce_to_one_slot_each() {
        let router = BucketRouter::new(servers(&[2, 2]), HashingAlgorithm::NewCompat);
        match router.table() {
            DistributionTable::Buckets(slots) => assert_eq!(slots, &vec![0, 1]),
            other => panic!("Expected bucket table, got {:?}", other),
        }
    }

    #[test]
    fn test_weights_reduce_by_gcd() {
        let router = BucketRouter::new(servers(&[3, 6, 9]), HashingAlgorithm::Native);
        match router.table() {
            DistributionTable::Buckets(slots) => assert_eq!(slots, &vec![0, 1, 1, 2, 2, 2]),
            other => panic!("Expected bucket table, got {:?}", other),
        }
    }

    #[test]
    fn test_route_lists_every_server_once() {
        for algorithm in [
            HashingAlgorithm::Native,
            HashingAlgorithm::OldCompat,
            HashingAlgorithm::NewCompat,
            HashingAlgorithm::Consistent,
        ] {
            let router = BucketRouter::new(servers(&[1, 3, 2]), algorithm);
            let route = router.route("session:abc");
            assert_eq!(route.len(), 3, "{}", algorithm);
            let mut addrs: Vec<_> = route.iter().map(|s| s.addr.clone()).collect();
            addrs.sort();
            addrs.dedup();
            assert_eq!(addrs.len(), 3, "{}", algorithm);
        }
    }

    #[test]
    fn test_modulo_failover_walks_the_table() {
        let router = BucketRouter::new(servers(&[1, 1, 1]), HashingAlgorithm::NewCompat);
        let key = "user:42";
        let start = HashingAlgorithm::NewCompat.bucket(key, 3);
        let route = router.route(key);
        for (step, server) in route.iter().enumerate() {
            assert_eq!(server, &router.servers()[(start + step) % 3]);
        }
    }

    #[test]
    fn test_route_is_deterministic() {
        let keys = random_keys(200);
        for algorithm in [HashingAlgorithm::NewCompat, HashingAlgorithm::Consistent] {
            let first = BucketRouter::new(servers(&[1, 2, 3]), algorithm);
            let rebuilt = BucketRouter::new(servers(&[1, 2, 3]), algorithm);
            for key in &keys {
                assert_eq!(first.route(key), first.route(key));
                assert_eq!(first.route(key), rebuilt.route(key));
            }
        }
    }

    #[test]
    fn test_modulo_distribution_follows_weights() {
        let keys = random_keys(20_000);
        let router = BucketRouter::new(servers(&[3, 1]), HashingAlgorithm::NewCompat);
        let share = primary_share(&router, &keys);
        assert!((share[0] - 0.75).abs() < 0.03, "share {:?}", share);
    }

    #[test]
    fn test_ring_distribution_follows_weights() {
        let keys = random_keys(20_000);
        let router = BucketRouter::new(servers(&[3, 1]), HashingAlgorithm::Consistent);
        let share = primary_share(&router, &keys);
        assert!((share[0] - 0.75).abs() < 0.06, "share {:?}", share);
    }

    #[test]
    fn test_zero_weight_server_is_last_resort_only() {
        for algorithm in [HashingAlgorithm::NewCompat, HashingAlgorithm::Consistent] {
            let router = BucketRouter::new(servers(&[1, 0, 1]), algorithm);
            for key in random_keys(500) {
                let route = router.route(&key);
                assert_eq!(route.len(), 3);
                assert_ne!(route[0].addr, "10.0.0.2:11211");
                assert_eq!(route[2].addr, "10.0.0.2:11211");
            }
        }
    }

    #[test]
    fn test_ring_size() {
        let router = BucketRouter::new(servers(&[1, 2]), HashingAlgorithm::Consistent);
        // Collisions between 32-bit points are possible but vanishingly rare
        assert!(router.table().len() > 470);
        assert!(router.table().len() <= 480);
    }

    #[test]
    fn test_adding_server_only_moves_keys_to_it() {
        let before = BucketRouter::new(servers(&[1, 2]), HashingAlgorithm::Consistent);
        let after = BucketRouter::new(servers(&[1, 2, 1]), HashingAlgorithm::Consistent);
        assert!(after.table().len() > before.table().len());

        let mut moved = 0;
        for key in random_keys(2000) {
            let old = &before.primary(&key).unwrap().addr;
            let new = &after.primary(&key).unwrap().addr;
            if old != new {
                assert_eq!(new, "10.0.0.3:11211");
                moved += 1;
            }
        }
        assert!(moved > 0);
    }
}
