//! Worker-thread core assignment.
//!
//! Co-located processes each want to pin one progress thread, so they must
//! pick distinct cores, preferring cores near their own workload. Each
//! process discovers a starting CPU set (its GPU's locality, or its
//! current binding widened to the NUMA node), the sets are exchanged over
//! the node-local communicator, and each process takes an offset among the
//! ranks sharing its set. Cores are assigned from the back of the set to
//! bias away from the CPUs most likely to host user threads.
//!
//! Everything after the topology version check is best-effort: on any
//! failure the engine logs a diagnostic and runs its worker unbound.

use tracing::{debug, warn};

use crate::comm::LocalComm;
use crate::device::{DeviceId, DeviceRuntime};

use super::{CpuSet, Topology, TopologyError};

/// Computes the core the worker should bind to, collectively with the
/// other processes on this node.
///
/// Returns `-1` when binding should be skipped; the engine stays fully
/// functional either way.
///
/// # Errors
///
/// Returns [`TopologyError::VersionMismatch`] if the topology interface
/// version check fails. Every other failure is downgraded to a warning.
pub(crate) fn bind_init(
    comm: &dyn LocalComm,
    devices: &dyn DeviceRuntime,
    device: Option<DeviceId>,
) -> Result<i32, TopologyError> {
    let topology = Topology::load()?;

    let Some(cpuset) = discovery_cpuset(&topology, devices, device) else {
        warn!(
            local_rank = comm.local_rank(),
            "could not get a starting cpu set; not binding progress thread"
        );
        return Ok(-1);
    };

    let local_cpusets = match exchange_cpusets(comm, &cpuset) {
        Ok(sets) => sets,
        Err(error) => {
            warn!(
                local_rank = comm.local_rank(),
                %error,
                "cpu set exchange failed; not binding progress thread"
            );
            return Ok(-1);
        }
    };
    let offset = assignment_offset(&local_cpusets, comm.local_rank());

    let cores = topology.cores_in(&cpuset);
    if cores.is_empty() {
        warn!(
            local_rank = comm.local_rank(),
            "no cores inside the cpu set; not binding progress thread"
        );
        return Ok(-1);
    }
    let Some(core) = core_index(cores.len(), offset) else {
        warn!(
            local_rank = comm.local_rank(),
            offset,
            cores = cores.len(),
            "more co-located ranks than cores; not binding progress thread"
        );
        return Ok(-1);
    };

    Ok(i32::try_from(core).unwrap_or(-1))
}

/// Binds the calling thread to the core picked by [`bind_init`].
///
/// Reloads the topology, re-derives the CPU set, singlifies the chosen
/// core to one PU, and binds with thread scope. All failures are
/// warnings; the worker simply runs unbound.
pub(crate) fn bind(
    core_to_bind: i32,
    local_rank: usize,
    devices: &dyn DeviceRuntime,
    device: Option<DeviceId>,
) {
    if core_to_bind < 0 {
        debug!(local_rank, "core assignment not initialized; progress thread runs unbound");
        return;
    }
    #[allow(clippy::cast_sign_loss)]
    let core_to_bind = core_to_bind as usize;

    let topology = match Topology::load() {
        Ok(topology) => topology,
        Err(error) => {
            warn!(local_rank, %error, "topology reload failed; not binding progress thread");
            return;
        }
    };
    let Some(cpuset) = discovery_cpuset(&topology, devices, device) else {
        warn!(
            local_rank,
            "could not get a starting cpu set; not binding progress thread"
        );
        return;
    };

    let cores = topology.cores_in(&cpuset);
    let Some(core) = cores.get(core_to_bind) else {
        warn!(
            local_rank,
            core = core_to_bind,
            cores = cores.len(),
            "assigned core not present; not binding progress thread"
        );
        return;
    };

    let mut pu = core.clone();
    pu.singlify();
    match Topology::bind_thread(&pu) {
        Ok(()) => debug!(local_rank, ?pu, "progress thread bound"),
        Err(error) => warn!(local_rank, %error, "failed to bind progress thread"),
    }
}

/// The CPU set the binder starts from: the selected device's locality if
/// a device is in use, otherwise the calling thread's binding widened to
/// its NUMA node. `None` means binding should be skipped.
fn discovery_cpuset(
    topology: &Topology,
    devices: &dyn DeviceRuntime,
    device: Option<DeviceId>,
) -> Option<CpuSet> {
    let cpuset = match device {
        Some(device) => devices.device_cpuset(topology, device)?,
        None => {
            let bound = topology.current_thread_cpuset()?;
            topology.widen_to_first_node(&bound)
        }
    };
    if cpuset.is_empty() {
        None
    } else {
        Some(cpuset)
    }
}

/// Exchanges CPU sets across the local communicator, returning one set per
/// local rank in local-rank order.
///
/// Sets may serialize to different word counts, so the word lengths are
/// all-gathered first, then the words themselves.
///
/// # Errors
///
/// Returns [`TopologyError::InfiniteCpuSet`] if this rank's set has no
/// finite word representation.
fn exchange_cpusets(
    comm: &dyn LocalComm,
    cpuset: &CpuSet,
) -> Result<Vec<CpuSet>, TopologyError> {
    let words = cpuset.to_words()?;
    let counts = comm.allgather_u32(u32::try_from(words.len()).unwrap_or(u32::MAX));
    let gathered = comm.allgather_words(&words, &counts);

    let mut cpusets = Vec::with_capacity(counts.len());
    let mut offset = 0;
    for &count in &counts {
        let count = count as usize;
        cpusets.push(CpuSet::from_words(&gathered[offset..offset + count]));
        offset += count;
    }
    Ok(cpusets)
}

/// The zero-based position of `local_rank` among the ranks sharing its CPU
/// set.
///
/// Ranks with identical sets split that set between them by rank order;
/// ranks with different sets are assumed disjoint and each start at 0.
fn assignment_offset(cpusets: &[CpuSet], local_rank: usize) -> usize {
    cpusets[..local_rank]
        .iter()
        .filter(|set| **set == cpusets[local_rank])
        .count()
}

/// The core picked for a rank with `offset` among `num_cores` candidates,
/// counted from the end of the set. `None` if there are not enough cores.
fn core_index(num_cores: usize, offset: usize) -> Option<usize> {
    (offset < num_cores).then(|| num_cores - offset - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SoloComm;
    use crate::device::NoDevice;

    /// A seeded node-local communicator: every rank's contribution is
    /// known up front, so collectives resolve immediately.
    struct FixtureComm {
        rank: usize,
        word_sets: Vec<Vec<u64>>,
    }

    impl LocalComm for FixtureComm {
        fn local_rank(&self) -> usize {
            self.rank
        }

        fn local_size(&self) -> usize {
            self.word_sets.len()
        }

        fn allgather_u32(&self, value: u32) -> Vec<u32> {
            assert_eq!(value as usize, self.word_sets[self.rank].len());
            self.word_sets
                .iter()
                .map(|w| u32::try_from(w.len()).unwrap())
                .collect()
        }

        fn allgather_words(&self, words: &[u64], counts: &[u32]) -> Vec<u64> {
            assert_eq!(words, self.word_sets[self.rank].as_slice());
            assert_eq!(counts.len(), self.word_sets.len());
            self.word_sets.iter().flatten().copied().collect()
        }
    }

    fn cpuset(bits: &[usize]) -> CpuSet {
        bits.iter().copied().collect()
    }

    #[test]
    fn test_offset_identical_sets() {
        let set = cpuset(&[0, 1, 2, 3]);
        let sets = vec![set.clone(), set.clone(), set.clone(), set];
        assert_eq!(assignment_offset(&sets, 0), 0);
        assert_eq!(assignment_offset(&sets, 2), 2);
        assert_eq!(assignment_offset(&sets, 3), 3);
    }

    #[test]
    fn test_offset_alternating_sets() {
        let a = cpuset(&[0, 1]);
        let b = cpuset(&[2, 3]);
        let sets = vec![a.clone(), b.clone(), a, b];
        assert_eq!(assignment_offset(&sets, 2), 1);
        assert_eq!(assignment_offset(&sets, 3), 1);
    }

    #[test]
    fn test_offset_disjoint_sets() {
        let sets = vec![cpuset(&[0]), cpuset(&[1]), cpuset(&[2])];
        for rank in 0..3 {
            assert_eq!(assignment_offset(&sets, rank), 0);
        }
    }

    #[test]
    fn test_core_index_counts_from_the_end() {
        // Three ranks sharing an 8-core set land on cores 7, 6, 5.
        assert_eq!(core_index(8, 0), Some(7));
        assert_eq!(core_index(8, 1), Some(6));
        assert_eq!(core_index(8, 2), Some(5));
        assert_eq!(core_index(2, 2), None);
        assert_eq!(core_index(0, 0), None);
    }

    #[test]
    fn test_exchange_round_trips_every_rank() {
        let sets = [cpuset(&[0, 1, 64]), cpuset(&[2]), CpuSet::new()];
        let word_sets: Vec<Vec<u64>> = sets.iter().map(|s| s.to_words().unwrap()).collect();

        for rank in 0..3 {
            let comm = FixtureComm {
                rank,
                word_sets: word_sets.clone(),
            };
            let exchanged = exchange_cpusets(&comm, &sets[rank]).unwrap();
            assert_eq!(exchanged.len(), 3);
            for (got, want) in exchanged.iter().zip(&sets) {
                assert_eq!(got, want);
            }
        }
    }

    #[test]
    fn test_exchange_rejects_infinite_set() {
        let comm = SoloComm;
        assert!(matches!(
            exchange_cpusets(&comm, &CpuSet::full()),
            Err(TopologyError::InfiniteCpuSet)
        ));
    }

    #[test]
    fn test_identical_ranks_get_distinct_cores() {
        // Per-rank view of three processes with the same 8-core set.
        let set = cpuset(&(0..8).collect::<Vec<_>>());
        let words = set.to_words().unwrap();
        let word_sets = vec![words.clone(), words.clone(), words];

        let mut cores = Vec::new();
        for rank in 0..3 {
            let comm = FixtureComm {
                rank,
                word_sets: word_sets.clone(),
            };
            let exchanged = exchange_cpusets(&comm, &set).unwrap();
            let offset = assignment_offset(&exchanged, rank);
            cores.push(core_index(8, offset).unwrap());
        }
        assert_eq!(cores, vec![7, 6, 5]);
    }

    #[test]
    fn test_bind_init_solo() {
        // On any machine this must either pick a core or cleanly skip.
        let core = bind_init(&SoloComm, &NoDevice, None).unwrap();
        assert!(core >= -1);
    }

    #[test]
    fn test_discovery_skips_empty_device_locality() {
        struct EmptyLocality;
        impl DeviceRuntime for EmptyLocality {
            fn device_cpuset(&self, _topology: &Topology, _device: DeviceId) -> Option<CpuSet> {
                Some(CpuSet::new())
            }
        }

        let topology = Topology::load().unwrap();
        assert!(discovery_cpuset(&topology, &EmptyLocality, Some(DeviceId(0))).is_none());
    }

    #[test]
    fn test_bind_with_negative_core_is_a_no_op() {
        bind(-1, 0, &NoDevice, None);
    }
}
