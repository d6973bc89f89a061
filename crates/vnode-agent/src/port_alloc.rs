use std::sync::atomic::{AtomicU32, Ordering};

use vnode_env::EnvironmentRecord;

use crate::error::{EnvError, EnvResult};

/// Monotonic RPC / P2P port issuer.
///
/// Ports are never handed back, even after the owning environment is
/// deallocated, so a port value identifies at most one environment for the
/// lifetime of the state file.
#[derive(Debug)]
pub struct PortAllocator {
    next_rpc: AtomicU32,
    next_p2p: AtomicU32,
}

impl PortAllocator {
    pub fn new(rpc_base: u16, p2p_base: u16) -> Self {
        Self {
            next_rpc: AtomicU32::new(rpc_base as u32),
            next_p2p: AtomicU32::new(p2p_base as u32),
        }
    }

    fn take(counter: &AtomicU32, kind: &'static str) -> EnvResult<u16> {
        let port = counter.fetch_add(1, Ordering::SeqCst);
        u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(EnvError::PortsExhausted(kind))
    }

    pub fn assign_rpc_port(&self, env_id: &str) -> EnvResult<u16> {
        let port = Self::take(&self.next_rpc, "rpc")?;
        tracing::debug!(env_id, port, "assigned rpc port");
        Ok(port)
    }

    pub fn assign_p2p_port(&self, env_id: &str) -> EnvResult<u16> {
        let port = Self::take(&self.next_p2p, "p2p")?;
        tracing::debug!(env_id, port, "assigned p2p port");
        Ok(port)
    }

    /// Moves both counters past every port already recorded, so ports held by
    /// environments that are not yet restarted are never issued again.
    pub fn seed_from_existing(&self, records: &[EnvironmentRecord]) {
        let max_rpc = records.iter().map(|r| r.rpc_port).max().unwrap_or(0);
        let max_p2p = records.iter().map(|r| r.p2p_port).max().unwrap_or(0);
        if max_rpc != 0 {
            self.next_rpc.fetch_max(max_rpc as u32 + 1, Ordering::SeqCst);
        }
        if max_p2p != 0 {
            self.next_p2p.fetch_max(max_p2p as u32 + 1, Ordering::SeqCst);
        }
        tracing::info!(
            next_rpc = self.peek_rpc(),
            next_p2p = self.peek_p2p(),
            "port counters seeded"
        );
    }

    pub fn peek_rpc(&self) -> u32 {
        self.next_rpc.load(Ordering::SeqCst)
    }

    pub fn peek_p2p(&self) -> u32 {
        self.next_p2p.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, path::PathBuf, sync::Arc};

    use vnode_env::EnvStatus;

    use super::*;

    fn rec(rpc: u16, p2p: u16) -> EnvironmentRecord {
        EnvironmentRecord {
            env_id: format!("env-{rpc}"),
            allocated_rom: 1,
            allocated_ram: 1,
            used_rom: 0,
            used_ram: 0,
            base_path: PathBuf::from("/virtual-envs/x"),
            rpc_port: rpc,
            p2p_port: p2p,
            public_url: String::new(),
            status: EnvStatus::Allocated,
            created_at: Default::default(),
        }
    }

    #[test]
    fn counters_are_independent_and_monotonic() {
        let ports = PortAllocator::new(8545, 30333);
        assert_eq!(ports.assign_rpc_port("a").unwrap(), 8545);
        assert_eq!(ports.assign_rpc_port("b").unwrap(), 8546);
        assert_eq!(ports.assign_p2p_port("a").unwrap(), 30333);
        assert_eq!(ports.assign_rpc_port("c").unwrap(), 8547);
        assert_eq!(ports.assign_p2p_port("b").unwrap(), 30334);
    }

    #[test]
    fn seeding_skips_past_recorded_ports() {
        let ports = PortAllocator::new(8545, 30333);
        ports.seed_from_existing(&[rec(8545, 30333), rec(8600, 30340), rec(0, 0)]);
        assert_eq!(ports.assign_rpc_port("n").unwrap(), 8601);
        assert_eq!(ports.assign_p2p_port("n").unwrap(), 30341);
    }

    #[test]
    fn seeding_never_moves_counters_backwards() {
        let ports = PortAllocator::new(9000, 31000);
        ports.seed_from_existing(&[rec(8550, 30400)]);
        assert_eq!(ports.assign_rpc_port("n").unwrap(), 9000);
        assert_eq!(ports.assign_p2p_port("n").unwrap(), 31000);
    }

    #[test]
    fn no_port_repeats_across_simulated_restart() {
        let before = PortAllocator::new(8545, 30333);
        let mut issued = Vec::new();
        for i in 0..5 {
            let id = format!("env-{i}");
            issued.push(rec(
                before.assign_rpc_port(&id).unwrap(),
                before.assign_p2p_port(&id).unwrap(),
            ));
        }

        // Only a subset survives in the store (others were deallocated).
        let survivors = vec![issued[1].clone(), issued[4].clone()];
        let after = PortAllocator::new(8545, 30333);
        after.seed_from_existing(&survivors);

        let mut rpc: HashSet<u16> = issued.iter().map(|r| r.rpc_port).collect();
        let mut p2p: HashSet<u16> = issued.iter().map(|r| r.p2p_port).collect();
        for _ in 0..5 {
            assert!(rpc.insert(after.assign_rpc_port("new").unwrap()));
            assert!(p2p.insert(after.assign_p2p_port("new").unwrap()));
        }
    }

    #[test]
    fn concurrent_assignment_yields_distinct_ports() {
        let ports = Arc::new(PortAllocator::new(20000, 40000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| ports.assign_rpc_port("t").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for p in h.join().unwrap() {
                assert!(seen.insert(p), "port {p} issued twice");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let ports = PortAllocator::new(65535, 30333);
        assert_eq!(ports.assign_rpc_port("a").unwrap(), 65535);
        assert!(matches!(
            ports.assign_rpc_port("b"),
            Err(EnvError::PortsExhausted("rpc"))
        ));
    }
}
