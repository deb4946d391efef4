//! Connection-to-worker assignment for the main/sub reactor topology.
//!
//! The worker set is registered during startup and immutable afterwards,
//! so `next` runs lock-free on the accepting thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::config::Lb;
use crate::poller::Poller;

/// The cross-thread face of one worker: enough to hand it a connection
/// and to ask how loaded it is.
pub(crate) struct WorkerHandle {
    pub(crate) index: usize,
    pub(crate) poller: Arc<Poller>,
    pub(crate) conn_count: Arc<AtomicI32>,
}

pub(crate) enum Balancer {
    RoundRobin {
        next_index: AtomicUsize,
        workers: Vec<WorkerHandle>,
    },
    LeastConnections {
        workers: Vec<WorkerHandle>,
    },
    SourceAddrHash {
        workers: Vec<WorkerHandle>,
    },
}

impl Balancer {
    pub(crate) fn new(kind: Lb) -> Self {
        match kind {
            Lb::RoundRobin => Balancer::RoundRobin {
                next_index: AtomicUsize::new(0),
                workers: Vec::new(),
            },
            Lb::LeastConnections => Balancer::LeastConnections {
                workers: Vec::new(),
            },
            Lb::SourceAddrHash => Balancer::SourceAddrHash {
                workers: Vec::new(),
            },
        }
    }

    /// Add a worker. Startup only; the set never changes once `next` is
    /// in use.
    pub(crate) fn register(&mut self, mut handle: WorkerHandle) {
        let workers = self.workers_mut();
        handle.index = workers.len();
        workers.push(handle);
    }

    /// Pick the worker for a connection from `remote`.
    pub(crate) fn next(&self, remote: &SocketAddr) -> &WorkerHandle {
        match self {
            Balancer::RoundRobin {
                next_index,
                workers,
            } => {
                let i = next_index.fetch_add(1, Ordering::Relaxed) % workers.len();
                &workers[i]
            }
            Balancer::LeastConnections { workers } => workers
                .iter()
                .min_by_key(|w| w.conn_count.load(Ordering::Acquire))
                .expect("balancer has no workers"),
            Balancer::SourceAddrHash { workers } => {
                let hash = crc32(remote.to_string().as_bytes()) as usize;
                &workers[hash % workers.len()]
            }
        }
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, WorkerHandle> {
        self.workers().iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.workers().len()
    }

    fn workers(&self) -> &Vec<WorkerHandle> {
        match self {
            Balancer::RoundRobin { workers, .. }
            | Balancer::LeastConnections { workers }
            | Balancer::SourceAddrHash { workers } => workers,
        }
    }

    fn workers_mut(&mut self) -> &mut Vec<WorkerHandle> {
        match self {
            Balancer::RoundRobin { workers, .. }
            | Balancer::LeastConnections { workers }
            | Balancer::SourceAddrHash { workers } => workers,
        }
    }
}

// CRC32 (IEEE), table-driven. Small enough to keep in-crate rather than
// pulling a dependency for one digest.

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(n: usize) -> Vec<WorkerHandle> {
        (0..n)
            .map(|_| WorkerHandle {
                index: 0,
                poller: Arc::new(Poller::new().unwrap()),
                conn_count: Arc::new(AtomicI32::new(0)),
            })
            .collect()
    }

    fn build(kind: Lb, n: usize) -> Balancer {
        let mut balancer = Balancer::new(kind);
        for h in handles(n) {
            balancer.register(h);
        }
        balancer
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn register_assigns_indices() {
        let balancer = build(Lb::RoundRobin, 3);
        assert_eq!(balancer.len(), 3);
        let indices: Vec<_> = balancer.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn round_robin_cycles() {
        let balancer = build(Lb::RoundRobin, 3);
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let picks: Vec<_> = (0..6).map(|_| balancer.next(&addr).index).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_connections_picks_min() {
        let balancer = build(Lb::LeastConnections, 3);
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        for (i, w) in balancer.iter().enumerate() {
            w.conn_count.store(10 - i as i32, Ordering::Release);
        }
        assert_eq!(balancer.next(&addr).index, 2);

        balancer
            .iter()
            .nth(1)
            .unwrap()
            .conn_count
            .store(0, Ordering::Release);
        assert_eq!(balancer.next(&addr).index, 1);
    }

    #[test]
    fn source_hash_is_stable_per_peer() {
        let balancer = build(Lb::SourceAddrHash, 4);
        let a: SocketAddr = "198.51.100.9:40001".parse().unwrap();
        let b: SocketAddr = "203.0.113.77:40002".parse().unwrap();

        let pick_a = balancer.next(&a).index;
        let pick_b = balancer.next(&b).index;
        for _ in 0..10 {
            assert_eq!(balancer.next(&a).index, pick_a);
            assert_eq!(balancer.next(&b).index, pick_b);
        }
        assert_eq!(pick_a, crc32(a.to_string().as_bytes()) as usize % 4);
        assert_eq!(pick_b, crc32(b.to_string().as_bytes()) as usize % 4);
    }
}
