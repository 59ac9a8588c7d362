// Copyright (c) Facebook, Inc. and its affiliates.
//! Socket -> core -> hyperthread tree built from /proc/cpuinfo.
//!
//! Hyperthreads missing "physical id" or "core id" (some VMs and non-x86
//! firmware omit them) stay in the flat index but are not reachable through
//! sockets. All sampling is random without replacement so that repeated runs
//! land on different physical units.
use log::{debug, trace};
use rand::seq::index;
use rand::Rng;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read CPU topology from {path:?}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed processor id {value:?} on line {line}")]
    Malformed { line: usize, value: String },
}

/// Pick up to `count` distinct items uniformly at random, in random order.
fn unique<'a, T, R>(items: impl Iterator<Item = &'a T>, count: usize, rng: &mut R) -> Vec<&'a T>
where
    R: Rng + ?Sized,
{
    let items: Vec<&T> = items.collect();
    let amount = count.min(items.len());
    index::sample(rng, items.len(), amount)
        .into_iter()
        .map(|i| items[i])
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperThread {
    pub id: u32,
    pub raw: BTreeMap<String, String>,
}

impl HyperThread {
    fn new(id: u32) -> Self {
        Self {
            id,
            raw: BTreeMap::new(),
        }
    }

    fn raw_id(&self, key: &str) -> Option<u32> {
        self.raw.get(key).and_then(|v| v.parse::<u32>().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Core {
    pub id: u32,
    pub hyper_threads: BTreeMap<u32, HyperThread>,
}

impl Core {
    pub fn unique_hyper_threads<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<&HyperThread> {
        unique(self.hyper_threads.values(), count, rng)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    pub id: u32,
    pub cores: BTreeMap<u32, Core>,
}

impl Socket {
    pub fn unique_cores<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<&Core> {
        unique(self.cores.values(), count, rng)
    }

    pub fn nr_hyper_threads(&self) -> usize {
        self.cores.values().map(|c| c.hyper_threads.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub sockets: BTreeMap<u32, Socket>,
    pub hyper_threads: BTreeMap<u32, HyperThread>,
}

impl Topology {
    pub fn load<P: AsRef<Path>>(path_in: P) -> Result<Self, TopologyError> {
        let path = path_in.as_ref();
        let buf = fs::read_to_string(path).map_err(|source| TopologyError::Unreadable {
            path: path.into(),
            source,
        })?;
        let topo = Self::parse(&buf)?;
        debug!(
            "topology: {:?} has {} sockets, {} cores and {} hyperthreads",
            path,
            topo.sockets.len(),
            topo.nr_cores(),
            topo.hyper_threads.len()
        );
        for socket in topo.sockets.values() {
            debug!(
                "topology: socket {} has {} cores and {} hyperthreads",
                socket.id,
                socket.cores.len(),
                socket.nr_hyper_threads()
            );
        }
        Ok(topo)
    }

    pub fn parse(input: &str) -> Result<Self, TopologyError> {
        let mut hyper_threads = BTreeMap::new();
        let mut cur: Option<HyperThread> = None;

        for (idx, line) in input.lines().enumerate() {
            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            };

            if key == "processor" {
                if let Some(ht) = cur.take() {
                    hyper_threads.insert(ht.id, ht);
                }
                let id = value
                    .parse::<u32>()
                    .map_err(|_| TopologyError::Malformed {
                        line: idx + 1,
                        value: value.into(),
                    })?;
                cur = Some(HyperThread::new(id));
            }

            match cur.as_mut() {
                Some(ht) => {
                    ht.raw.insert(key.into(), value.into());
                }
                None => trace!("topology: ignoring {:?} before the first processor", key),
            }
        }
        if let Some(ht) = cur.take() {
            hyper_threads.insert(ht.id, ht);
        }

        let mut sockets = BTreeMap::<u32, Socket>::new();
        for ht in hyper_threads.values() {
            let (socket_id, core_id) = match (ht.raw_id("physical id"), ht.raw_id("core id")) {
                (Some(s), Some(c)) => (s, c),
                _ => {
                    debug!(
                        "topology: hyperthread {} has no usable physical/core id, not grouping",
                        ht.id
                    );
                    continue;
                }
            };

            sockets
                .entry(socket_id)
                .or_insert_with(|| Socket {
                    id: socket_id,
                    cores: BTreeMap::new(),
                })
                .cores
                .entry(core_id)
                .or_insert_with(|| Core {
                    id: core_id,
                    hyper_threads: BTreeMap::new(),
                })
                .hyper_threads
                .insert(ht.id, ht.clone());
        }

        Ok(Self {
            sockets,
            hyper_threads,
        })
    }

    pub fn unique_sockets<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<&Socket> {
        unique(self.sockets.values(), count, rng)
    }

    pub fn nr_cores(&self) -> usize {
        self.sockets.values().map(|s| s.cores.len()).sum()
    }

    /// Socket which `ht_id` was grouped under, if any.
    #[cfg(test)]
    pub fn socket_of(&self, ht_id: u32) -> Option<&Socket> {
        self.sockets
            .values()
            .find(|s| s.cores.values().any(|c| c.hyper_threads.contains_key(&ht_id)))
    }

    /// Core which `ht_id` was grouped under, if any.
    #[cfg(test)]
    pub fn core_of(&self, ht_id: u32) -> Option<&Core> {
        self.sockets
            .values()
            .flat_map(|s| s.cores.values())
            .find(|c| c.hyper_threads.contains_key(&ht_id))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;
    use std::fmt::Write;

    const I7_SINGLE: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
cpu family\t: 6
model\t\t: 61
model name\t: Intel(R) Core(TM) i7-5557U CPU @ 3.10GHz
physical id\t: 0
siblings\t: 1
core id\t\t: 0
cpu cores\t: 1
flags\t\t: fpu vme de pse tsc msr pae mce cx8 apic sep mtrr

";

    /// Generate cpuinfo for `nr_sockets` x `core_ids` x `nr_threads` with
    /// processors numbered the way Linux does on Intel: all first threads of
    /// every socket, then all second threads and so on.
    pub fn fake_cpuinfo(nr_sockets: u32, core_ids: &[u32], nr_threads: u32) -> String {
        let mut buf = String::new();
        let mut id = 0;
        for _thread in 0..nr_threads {
            for socket in 0..nr_sockets {
                for core in core_ids {
                    writeln!(buf, "processor\t: {}", id).unwrap();
                    writeln!(buf, "model name\t: Intel(R) Xeon(R) CPU E5-2690 v2 @ 3.00GHz").unwrap();
                    writeln!(buf, "physical id\t: {}", socket).unwrap();
                    writeln!(buf, "core id\t\t: {}", core).unwrap();
                    writeln!(buf, "cpu cores\t: {}", core_ids.len()).unwrap();
                    writeln!(buf).unwrap();
                    id += 1;
                }
            }
        }
        buf
    }

    pub const XEON_CORE_IDS: [u32; 10] = [0, 1, 2, 3, 4, 8, 9, 10, 11, 12];

    #[test]
    fn test_single_cpu() {
        let topo = Topology::parse(I7_SINGLE).unwrap();
        assert_eq!(topo.hyper_threads.len(), 1);
        assert_eq!(topo.sockets.len(), 1);
        assert_eq!(topo.sockets[&0].cores.len(), 1);
        assert_eq!(topo.sockets[&0].cores[&0].hyper_threads.len(), 1);

        let ht = &topo.hyper_threads[&0];
        assert_eq!(
            ht.raw["model name"],
            "Intel(R) Core(TM) i7-5557U CPU @ 3.10GHz"
        );
        assert_eq!(ht.raw["flags"], "fpu vme de pse tsc msr pae mce cx8 apic sep mtrr");
    }

    #[test]
    fn test_dual_core() {
        let topo = Topology::parse(&fake_cpuinfo(1, &[0, 1], 1)).unwrap();
        assert_eq!(topo.hyper_threads.len(), 2);
        assert_eq!(topo.sockets.len(), 1);
        assert_eq!(topo.sockets[&0].cores.len(), 2);
        assert_eq!(topo.sockets[&0].cores[&0].hyper_threads.len(), 1);
        assert_eq!(topo.sockets[&0].cores[&1].hyper_threads.len(), 1);
    }

    #[test]
    fn test_multi_socket_hyper_threaded() {
        let topo = Topology::parse(&fake_cpuinfo(2, &XEON_CORE_IDS, 2)).unwrap();

        assert_eq!(topo.hyper_threads.len(), 40);
        assert_eq!(topo.sockets.len(), 2);
        for socket in topo.sockets.values() {
            assert_eq!(socket.cores.len(), 10);
            for core in socket.cores.values() {
                assert_eq!(core.hyper_threads.len(), 2);
            }
        }

        let ht_of = |s: u32, c: u32, h: u32| topo.sockets[&s].cores[&c].hyper_threads[&h].id;
        assert_eq!(ht_of(0, 0, 0), 0);
        assert_eq!(ht_of(0, 8, 5), 5);
        assert_eq!(ht_of(1, 0, 10), 10);
        assert_eq!(ht_of(1, 12, 19), 19);
        assert_eq!(ht_of(0, 0, 20), 20);
        assert_eq!(ht_of(0, 12, 29), 29);
        assert_eq!(ht_of(1, 4, 34), 34);
        assert_eq!(ht_of(1, 12, 39), 39);

        assert_eq!(topo.socket_of(25).unwrap().id, 0);
        assert_eq!(topo.core_of(25).unwrap().id, 8);
        assert!(topo.socket_of(40).is_none());
    }

    #[test]
    fn test_every_hyper_thread_reachable_once() {
        for (nr_sockets, cores, threads) in &[(1, &[0u32][..], 1), (2, &[0, 1, 2][..], 2), (4, &[0, 5][..], 4)] {
            let topo = Topology::parse(&fake_cpuinfo(*nr_sockets, cores, *threads)).unwrap();
            let mut seen = BTreeSet::new();
            for socket in topo.sockets.values() {
                for core in socket.cores.values() {
                    for ht in core.hyper_threads.keys() {
                        assert!(seen.insert(*ht), "hyperthread {} seen twice", ht);
                    }
                }
            }
            assert_eq!(seen.len(), topo.hyper_threads.len());
            assert_eq!(
                seen.len() as u32,
                nr_sockets * cores.len() as u32 * threads
            );
            assert_eq!(topo.sockets.len() as u32, *nr_sockets);
        }
    }

    #[test]
    fn test_missing_ids_are_not_grouped() {
        let input = "\
processor : 0
physical id : 0
core id : 0

processor : 1
core id : 1

processor : 2
physical id : 0

processor : 3
physical id : x
core id : 3
";
        let topo = Topology::parse(input).unwrap();
        assert_eq!(topo.hyper_threads.len(), 4);
        assert_eq!(topo.sockets.len(), 1);
        assert_eq!(topo.nr_cores(), 1);
        assert_eq!(topo.sockets[&0].nr_hyper_threads(), 1);
    }

    #[test]
    fn test_malformed() {
        assert!(Topology::parse("").unwrap().hyper_threads.is_empty());
        assert!(Topology::parse("garbage\nvendor_id : x\n").unwrap().hyper_threads.is_empty());

        match Topology::parse("processor : 0\n\nprocessor : one\n") {
            Err(TopologyError::Malformed { line, value }) => {
                assert_eq!(line, 3);
                assert_eq!(value, "one");
            }
            v => panic!("unexpected {:?}", v),
        }

        let dir = tempfile::tempdir().unwrap();
        match Topology::load(dir.path().join("cpuinfo")) {
            Err(TopologyError::Unreadable { .. }) => (),
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuinfo");
        std::fs::write(&path, fake_cpuinfo(2, &[0, 1], 2)).unwrap();
        let topo = Topology::load(&path).unwrap();
        assert_eq!(topo.hyper_threads.len(), 8);
        assert_eq!(topo.nr_cores(), 4);
    }

    #[test]
    fn test_unique() {
        let mut rng = SmallRng::seed_from_u64(1);
        let src: Vec<u32> = (0..10).collect();

        for _ in 0..50 {
            for count in 0..=12 {
                let picked = unique(src.iter(), count, &mut rng);
                assert_eq!(picked.len(), count.min(src.len()));
                let set: BTreeSet<u32> = picked.iter().map(|x| **x).collect();
                assert_eq!(set.len(), picked.len());
                assert!(set.iter().all(|x| src.contains(x)));
            }
        }

        let empty: Vec<u32> = vec![];
        assert!(unique(empty.iter(), 3, &mut rng).is_empty());
    }

    #[test]
    fn test_unique_covers_all_units() {
        let topo = Topology::parse(&fake_cpuinfo(2, &XEON_CORE_IDS, 2)).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);

        let mut first_sockets = BTreeSet::new();
        let mut first_cores = BTreeSet::new();
        for _ in 0..200 {
            let sockets = topo.unique_sockets(2, &mut rng);
            assert_eq!(sockets.len(), 2);
            assert_ne!(sockets[0].id, sockets[1].id);
            first_sockets.insert(sockets[0].id);

            let cores = sockets[0].unique_cores(3, &mut rng);
            first_cores.insert(cores[0].id);

            let hts = cores[0].unique_hyper_threads(5, &mut rng);
            assert_eq!(hts.len(), 2);
            assert_ne!(hts[0].id, hts[1].id);
        }
        assert_eq!(first_sockets.len(), 2);
        assert_eq!(first_cores.len(), 10);
    }
}
