use std::fmt;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// CPU affinity of the device a communicator runs on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreMask {
    cpus: Vec<usize>,
}

impl CoreMask {
    pub fn from_cpu_set(cpu_set: u64) -> Self {
        let cpus = (0..64).filter(|i| cpu_set & (1 << i) != 0).collect();
        CoreMask { cpus }
    }

    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        let mut cpus: Vec<_> = cpus.into_iter().collect();
        cpus.sort_unstable();
        cpus.dedup();
        CoreMask { cpus }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    #[inline]
    pub fn is_set(&self, cpu: usize) -> bool {
        self.cpus.binary_search(&cpu).is_ok()
    }

    pub fn count(&self) -> usize {
        self.cpus.len()
    }

    /// Pins the calling thread to the cores in this mask.
    pub fn sched_set_affinity_for_current_thread(&self) -> nix::Result<()> {
        let mut cpu_set = CpuSet::new();
        for &cpu in self.cpus.iter() {
            cpu_set.set(cpu)?;
        }
        sched_setaffinity(Pid::from_raw(0), &cpu_set)
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let num_cpus = self.cpus.last().map_or(0, |&max| max + 1);
        let mut masks = Vec::with_capacity((num_cpus + 32 - 1) / 32);
        for i in (0..num_cpus).step_by(32) {
            let mut mask = 0u32;
            let nbits = (num_cpus - i).min(32);
            for j in 0..nbits {
                if self.is_set(i + j) {
                    mask |= 1 << j;
                }
            }
            masks.push(format!("{:08x}", mask));
        }
        masks.reverse();
        write!(f, "{:?}", masks)
    }
}
