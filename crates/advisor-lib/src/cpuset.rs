//! CPU set arithmetic over integer core identifiers
//!
//! A `CpuSet` is an ordered set of core IDs with the union/intersection/
//! difference operations the advisor needs, plus parsing and formatting of
//! the kernel cpulist syntax ("0-3,8,10-11"). The same type doubles as a set
//! of NUMA node IDs where a component tracks node bindings.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Ordered set of CPU core identifiers.
///
/// Accessors hand out owned values, so a set obtained from another component
/// can be mutated freely without aliasing its source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuSet(BTreeSet<usize>);

impl CpuSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Create a set from any collection of core IDs.
    pub fn from_cores(cores: impl IntoIterator<Item = usize>) -> Self {
        Self(cores.into_iter().collect())
    }

    /// Parse the kernel cpulist syntax: comma-separated core IDs or
    /// inclusive ranges, e.g. "1-23,48-71". An empty string is the empty set.
    pub fn parse(cpulist: &str) -> Result<Self> {
        let mut cores = BTreeSet::new();
        for group in cpulist.split(',') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            match group.split_once('-') {
                Some((lo, hi)) => {
                    let lo: usize = lo.trim().parse()?;
                    let hi: usize = hi.trim().parse()?;
                    if hi < lo {
                        bail!("invalid cpulist range {}: end precedes start", group);
                    }
                    cores.extend(lo..=hi);
                }
                None => {
                    cores.insert(group.parse()?);
                }
            }
        }
        Ok(Self(cores))
    }

    pub fn add(&mut self, core: usize) {
        self.0.insert(core);
    }

    pub fn contains(&self, core: usize) -> bool {
        self.0.contains(&core)
    }

    /// Number of cores in the set.
    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.0.iter().copied().collect()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CpuSet {
    /// Formats as cpulist syntax, collapsing consecutive IDs into ranges.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cores = self.0.iter().copied().peekable();
        while let Some(start) = cores.next() {
            let mut end = start;
            while cores.peek() == Some(&(end + 1)) {
                end = cores.next().unwrap_or(end);
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if end > start {
                write!(f, "{}-{}", start, end)?;
            } else {
                write!(f, "{}", start)?;
            }
        }
        Ok(())
    }
}
