// Copyright (c) Facebook, Inc. and its affiliates.
use enum_iterator::IntoEnumIterator;
use log::{debug, warn};
use rand::Rng;
use std::collections::BTreeSet;
use thiserror::Error;

use super::topology::{Core, Socket, Topology};
use pb_agent_intf::{CgroupSpec, Placement, Role, Slot};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("insufficient topology: {0}")]
    Insufficient(String),
}

/// Concrete hardware assignment of all roles of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub placement: Option<Placement>,
    pub workload: Slot,
    pub victim: Slot,
    pub aggressor: Option<Slot>,
    /// The placement couldn't be honored exactly.
    pub degraded: bool,
}

fn pick_slot<R: Rng + ?Sized>(socket: &Socket, core: &Core, rng: &mut R) -> Slot {
    // A core is only created together with its first hyperthread.
    let ht = core.unique_hyper_threads(1, rng)[0];
    Slot {
        socket: socket.id,
        core: core.id,
        hyper_thread: ht.id,
        // Memory node is assumed to match the socket.
        mem_node: socket.id,
    }
}

fn join_ids(ids: &BTreeSet<u32>) -> String {
    ids.iter()
        .map(|x| x.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

/// Pick sockets, cores and hyperthreads for the workload, the victim and,
/// if `placement` is set, the aggressor.
///
/// The workload and the victim always get different sockets. The victim
/// takes a random core on its socket; the aggressor's position is then a
/// fixed function of `placement`.
pub fn plan<R: Rng + ?Sized>(
    topo: &Topology,
    placement: Option<Placement>,
    rng: &mut R,
) -> Result<Plan, PlanError> {
    if topo.sockets.len() < 2 {
        return Err(PlanError::Insufficient(format!(
            "{} socket(s) available, at least 2 are needed",
            topo.sockets.len()
        )));
    }

    let sockets = topo.unique_sockets(2, rng);
    let (workload_socket, victim_socket) = (sockets[0], sockets[1]);

    let workload_cores = workload_socket.unique_cores(2, rng);
    let workload = pick_slot(workload_socket, workload_cores[0], rng);

    let victim_cores = victim_socket.unique_cores(2, rng);
    let victim_hts = victim_cores[0].unique_hyper_threads(2, rng);
    let victim = Slot {
        socket: victim_socket.id,
        core: victim_cores[0].id,
        hyper_thread: victim_hts[0].id,
        mem_node: victim_socket.id,
    };

    let mut degraded = false;
    let aggressor = match placement {
        None => None,
        Some(Placement::SameHyperThread) => Some(victim),
        Some(Placement::SameCore) => {
            let ht = match victim_hts.get(1) {
                Some(ht) => ht,
                None => {
                    warn!(
                        "placement: core {} on socket {} is not hyperthreaded, \
                         aggressor shares the victim's hyperthread",
                        victim.core, victim.socket
                    );
                    degraded = true;
                    victim_hts[0]
                }
            };
            Some(Slot {
                hyper_thread: ht.id,
                ..victim
            })
        }
        Some(Placement::SameSocket) => match victim_cores.get(1) {
            Some(core) => Some(pick_slot(victim_socket, core, rng)),
            None => {
                return Err(PlanError::Insufficient(format!(
                    "same_socket needs 2 cores on socket {}",
                    victim_socket.id
                )))
            }
        },
        Some(Placement::DifferentSocket) => match workload_cores.get(1) {
            Some(core) => Some(pick_slot(workload_socket, core, rng)),
            None => {
                return Err(PlanError::Insufficient(format!(
                    "different_socket needs 2 cores on socket {}",
                    workload_socket.id
                )))
            }
        },
    };

    let plan = Plan {
        placement,
        workload,
        victim,
        aggressor,
        degraded,
    };
    debug!("placement: {:?}", &plan);
    Ok(plan)
}

impl Plan {
    pub fn slot(&self, role: Role) -> Option<&Slot> {
        match role {
            Role::Workload => Some(&self.workload),
            Role::Victim => Some(&self.victim),
            Role::Aggressor => self.aggressor.as_ref(),
        }
    }

    pub fn slots(&self) -> Vec<(Role, Slot)> {
        Role::into_enum_iter()
            .filter_map(|role| self.slot(role).map(|slot| (role, *slot)))
            .collect()
    }

    /// cpuset configuration for the plan under `root`. The parent group
    /// carries the union of everything the children use as a child's
    /// cpuset must be a subset of its parent's.
    pub fn cgroup_spec(&self, root: &str) -> CgroupSpec {
        let slots = self.slots();
        let cpus: BTreeSet<u32> = slots.iter().map(|(_, s)| s.hyper_thread).collect();
        let mems: BTreeSet<u32> = slots.iter().map(|(_, s)| s.mem_node).collect();

        let mut spec = CgroupSpec::new();
        spec.push(root, "cpuset.cpus", &join_ids(&cpus));
        spec.push(root, "cpuset.mems", &join_ids(&mems));
        for (role, slot) in slots.iter() {
            let path = role.cgrp(root);
            spec.push(&path, "cpuset.cpus", &slot.hyper_thread.to_string());
            spec.push(&path, "cpuset.mems", &slot.mem_node.to_string());
        }
        spec
    }
}
