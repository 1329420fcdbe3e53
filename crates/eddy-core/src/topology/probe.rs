//! Topology probing and thread binding.
//!
//! Builds a PU/core/NUMA model of the machine:
//! 1. hwloc via the `hwlocality` crate (if the `hwloc` feature is enabled)
//! 2. sysfs parsing on Linux (fallback)
//! 3. Flat single-node fallback on other platforms
//!
//! Loading always begins with the interface version check; a mismatch is
//! the one fatal topology error.

use super::{CpuSet, TopologyError};

/// The topology interface version this crate was compiled against
/// (major, minor).
pub const API_VERSION: (u32, u32) = (2, 11);

/// Fails if the loaded topology interface differs from [`API_VERSION`]
/// in major or minor version.
pub(crate) fn check_api_version(runtime: (u32, u32)) -> Result<(), TopologyError> {
    if runtime != API_VERSION {
        return Err(TopologyError::VersionMismatch {
            runtime: runtime.0,
            runtime_minor: runtime.1,
            compiled: API_VERSION.0,
            compiled_minor: API_VERSION.1,
        });
    }
    Ok(())
}

/// The interface version reported by the topology backend linked into this
/// process. The built-in probes are compiled with the crate and report
/// [`API_VERSION`].
fn loaded_api_version() -> (u32, u32) {
    API_VERSION
}

/// The machine's CPU topology: PUs (hardware threads), the cores grouping
/// them, and the NUMA nodes they belong to.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Total number of PUs (index space for all per-PU vectors)
    num_pus: usize,
    /// PU -> core ordinal
    pu_core: Vec<usize>,
    /// PU -> NUMA node
    pu_node: Vec<usize>,
    /// Number of NUMA nodes
    num_nodes: usize,
}

impl Topology {
    /// Loads the machine topology.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::VersionMismatch`] if the loaded topology
    /// interface does not match the compiled-against version. Probe
    /// failures never error; detection falls back to a flat single-node
    /// model.
    pub fn load() -> Result<Self, TopologyError> {
        check_api_version(loaded_api_version())?;

        #[cfg(feature = "hwloc")]
        {
            if let Ok(topology) = Self::probe_hwloc() {
                return Ok(topology);
            }
        }

        #[cfg(target_os = "linux")]
        {
            if let Ok(topology) = Self::probe_sysfs() {
                return Ok(topology);
            }
        }

        Ok(Self::flat_fallback())
    }

    /// Total number of PUs.
    #[must_use]
    pub fn num_pus(&self) -> usize {
        self.num_pus
    }

    /// Number of NUMA nodes.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// The set of PUs belonging to a NUMA node.
    #[must_use]
    pub fn node_cpuset(&self, node: usize) -> CpuSet {
        (0..self.num_pus)
            .filter(|&pu| self.pu_node[pu] == node)
            .collect()
    }

    /// The cores whose PUs all lie inside `cpuset`, each returned as its
    /// full PU set, in the topology's natural order (ascending first PU).
    ///
    /// A core only partially covered by `cpuset` is excluded.
    #[must_use]
    pub fn cores_in(&self, cpuset: &CpuSet) -> Vec<CpuSet> {
        let mut cores: Vec<(usize, CpuSet)> = Vec::new();
        for pu in 0..self.num_pus {
            let core = self.pu_core[pu];
            match cores.iter_mut().find(|(id, _)| *id == core) {
                Some((_, set)) => set.set(pu),
                None => cores.push((core, std::iter::once(pu).collect())),
            }
        }
        cores.sort_by_key(|(_, set)| set.iter().next().unwrap_or(usize::MAX));
        cores
            .into_iter()
            .map(|(_, set)| set)
            .filter(|set| set.is_subset(cpuset))
            .collect()
    }

    /// The CPUs the calling thread is currently allowed to run on.
    ///
    /// Returns `None` if the binding cannot be queried on this platform.
    #[must_use]
    pub fn current_thread_cpuset(&self) -> Option<CpuSet> {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: sched_getaffinity fills a properly sized, zeroed
            // cpu_set_t for the calling thread (pid 0).
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                let rc = libc::sched_getaffinity(
                    0,
                    std::mem::size_of::<libc::cpu_set_t>(),
                    std::ptr::addr_of_mut!(set),
                );
                if rc != 0 {
                    return None;
                }
                let mut out = CpuSet::new();
                for pu in 0..self.num_pus {
                    if libc::CPU_ISSET(pu, &set) {
                        out.set(pu);
                    }
                }
                Some(out)
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    /// Widens `cpuset` to the full PU set of the first NUMA node it
    /// touches. Returns the empty set if `cpuset` touches no node.
    #[must_use]
    pub fn widen_to_first_node(&self, cpuset: &CpuSet) -> CpuSet {
        for node in 0..self.num_nodes {
            let node_set = self.node_cpuset(node);
            if !node_set.intersection(cpuset).is_empty() {
                return node_set;
            }
        }
        CpuSet::new()
    }

    /// Binds the calling thread (thread scope, not process) to `cpuset`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::BindFailed`] if the kernel rejects the
    /// binding, or [`TopologyError::NotSupported`] off Linux.
    pub fn bind_thread(cpuset: &CpuSet) -> Result<(), TopologyError> {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: the cpu_set_t is zero-initialized, populated with
            // CPU_SET, and passed by pointer to the calling thread (pid 0).
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                for pu in cpuset.iter() {
                    libc::CPU_SET(pu, &mut set);
                }
                let rc = libc::sched_setaffinity(
                    0,
                    std::mem::size_of::<libc::cpu_set_t>(),
                    std::ptr::addr_of!(set),
                );
                if rc != 0 {
                    return Err(TopologyError::BindFailed(
                        std::io::Error::last_os_error().to_string(),
                    ));
                }
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = cpuset;
            Err(TopologyError::NotSupported)
        }
    }

    /// Probes topology through hwloc.
    #[cfg(feature = "hwloc")]
    fn probe_hwloc() -> Result<Self, TopologyError> {
        use hwlocality::object::types::ObjectType;
        use hwlocality::Topology as HwlocTopology;

        let topology = HwlocTopology::new()
            .map_err(|e| TopologyError::Probe(format!("hwloc init failed: {e}")))?;

        let num_pus = topology.objects_with_type(ObjectType::PU).count();
        if num_pus == 0 {
            return Err(TopologyError::Probe("no PUs found via hwloc".to_string()));
        }

        let mut pu_core = vec![0usize; num_pus];
        let mut pu_node = vec![0usize; num_pus];

        for (ordinal, core) in topology.objects_with_type(ObjectType::Core).enumerate() {
            if let Some(cpuset) = core.cpuset() {
                for pu in cpuset.iter_set() {
                    let pu = pu as usize;
                    if pu < num_pus {
                        pu_core[pu] = ordinal;
                    }
                }
            }
        }

        let mut num_nodes = 0;
        for (ordinal, node) in topology
            .objects_with_type(ObjectType::NUMANode)
            .enumerate()
        {
            num_nodes = ordinal + 1;
            if let Some(cpuset) = node.cpuset() {
                for pu in cpuset.iter_set() {
                    let pu = pu as usize;
                    if pu < num_pus {
                        pu_node[pu] = ordinal;
                    }
                }
            }
        }

        Ok(Self {
            num_pus,
            pu_core,
            pu_node,
            num_nodes: num_nodes.max(1),
        })
    }

    /// Probes topology from sysfs.
    #[cfg(target_os = "linux")]
    fn probe_sysfs() -> Result<Self, TopologyError> {
        use std::fs;
        use std::path::Path;

        let online = fs::read_to_string("/sys/devices/system/cpu/online")
            .map_err(|e| TopologyError::Probe(format!("failed to read online cpus: {e}")))?;
        let online_pus = Self::parse_cpulist(online.trim());
        let num_pus = online_pus
            .iter()
            .max()
            .map(|max| max + 1)
            .ok_or_else(|| TopologyError::Probe("no online cpus".to_string()))?;

        // Group PUs into cores by (package, core) id pairs, in ascending
        // PU order so core ordinals follow the kernel's enumeration.
        let mut pu_core = vec![0usize; num_pus];
        let mut seen_cores: Vec<(u32, u32)> = Vec::new();
        for &pu in &online_pus {
            let base = format!("/sys/devices/system/cpu/cpu{pu}/topology");
            let package = Self::read_id(&format!("{base}/physical_package_id"));
            let core = Self::read_id(&format!("{base}/core_id"));
            let key = match (package, core) {
                (Some(p), Some(c)) => (p, c),
                // No topology files: treat the PU as its own core.
                _ => (u32::MAX, u32::try_from(pu).unwrap_or(u32::MAX)),
            };
            let ordinal = match seen_cores.iter().position(|k| *k == key) {
                Some(i) => i,
                None => {
                    seen_cores.push(key);
                    seen_cores.len() - 1
                }
            };
            pu_core[pu] = ordinal;
        }
        // Offline holes in the PU space each get their own core ordinal so
        // they never merge into a real core's PU set.
        for pu in 0..num_pus {
            if !online_pus.contains(&pu) {
                pu_core[pu] = seen_cores.len() + pu;
            }
        }

        let mut pu_node = vec![0usize; num_pus];
        let mut num_nodes = 1;
        let node_path = Path::new("/sys/devices/system/node");
        if let Ok(entries) = fs::read_dir(node_path) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok())
                else {
                    continue;
                };
                num_nodes = num_nodes.max(id + 1);
                if let Ok(cpulist) = fs::read_to_string(entry.path().join("cpulist")) {
                    for pu in Self::parse_cpulist(cpulist.trim()) {
                        if pu < num_pus {
                            pu_node[pu] = id;
                        }
                    }
                }
            }
        }

        Ok(Self {
            num_pus,
            pu_core,
            pu_node,
            num_nodes,
        })
    }

    /// Reads a small numeric sysfs attribute.
    #[cfg(target_os = "linux")]
    fn read_id(path: &str) -> Option<u32> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Parses a CPU list string like "0-7,16-23".
    #[cfg(target_os = "linux")]
    fn parse_cpulist(s: &str) -> Vec<usize> {
        let mut pus = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((start, end)) = part.split_once('-') {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    pus.extend(start..=end);
                }
            } else if let Ok(pu) = part.parse::<usize>() {
                pus.push(pu);
            }
        }
        pus
    }

    /// A flat model: every PU its own core, one NUMA node.
    fn flat_fallback() -> Self {
        let num_pus = num_cpus::get();
        Self {
            num_pus,
            pu_core: (0..num_pus).collect(),
            pu_node: vec![0; num_pus],
            num_nodes: 1,
        }
    }

    /// Builds a topology directly from per-PU core and node assignments.
    #[cfg(test)]
    pub(crate) fn synthetic(pu_core: Vec<usize>, pu_node: Vec<usize>) -> Self {
        assert_eq!(pu_core.len(), pu_node.len());
        let num_pus = pu_core.len();
        let num_nodes = pu_node.iter().max().map_or(1, |max| max + 1);
        Self {
            num_pus,
            pu_core,
            pu_node,
            num_nodes,
        }
    }
}
