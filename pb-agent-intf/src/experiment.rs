// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use enum_iterator::IntoEnumIterator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use pb_util::*;

const EXPERIMENT_DOC: &str = "\
//
// pinbench experiment definition
//
// The victim, workload and aggressor each run in their own cpuset cgroup
// under NAME. The victim and workload are placed on two different sockets.
//
//  name: Top-level cgroup path, e.g. /pinbench
//  placement: Aggressor placement relative to the victim, null for baseline
//             (same_hyperthread, same_core, same_socket, different_socket)
//  termination: await_all or await_first (kill the rest on the first exit)
//  ROLE.command: Shell command to run
//  ROLE.delay: Seconds to wait before starting the command
//  ROLE.duration: Seconds to run the command for, null for unbounded
//  ROLE.signal: Signal sent when the duration expires
//  ROLE.cpus: Extra taskset CPU list inside the cgroup, empty to skip
//  ROLE.sched.policy: other, idle, batch, rr or fifo
//  ROLE.sched.priority: 0 for non-realtime policies, >= 1 for rr and fifo
//  ROLE.perf.events[]: perf events to count, empty for the perf defaults
//  ROLE.perf.interval: perf sampling interval in msecs, null for totals only
//  ROLE.perf.output: perf output file
//
";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    SameHyperThread,
    SameCore,
    SameSocket,
    DifferentSocket,
}

impl Placement {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SameHyperThread => "same_hyperthread",
            Self::SameCore => "same_core",
            Self::SameSocket => "same_socket",
            Self::DifferentSocket => "different_socket",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Placement {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input.replace('-', "_").as_str() {
            "same_hyperthread" | "same_ht" => Self::SameHyperThread,
            "same_core" => Self::SameCore,
            "same_socket" => Self::SameSocket,
            "different_socket" => Self::DifferentSocket,
            _ => bail!("unknown placement {:?}", input),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    AwaitAll,
    AwaitFirst,
}

impl Default for Termination {
    fn default() -> Self {
        Self::AwaitAll
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, IntoEnumIterator)]
pub enum Role {
    Workload,
    Victim,
    Aggressor,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Workload => "workload",
            Self::Victim => "victim",
            Self::Aggressor => "aggressor",
        }
    }

    /// Path of the role's cgroup under the experiment root.
    pub fn cgrp(&self, root: &str) -> String {
        format!("{}/{}", root.trim_end_matches('/'), self.name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    Other,
    Idle,
    Batch,
    Rr,
    Fifo,
}

impl SchedPolicy {
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Other => "--other",
            Self::Idle => "--idle",
            Self::Batch => "--batch",
            Self::Rr => "--rr",
            Self::Fifo => "--fifo",
        }
    }

    pub fn realtime(&self) -> bool {
        match self {
            Self::Rr | Self::Fifo => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedSpec {
    pub policy: SchedPolicy,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfSpec {
    pub events: Vec<String>,
    pub interval: Option<u64>,
    pub output: String,
}

impl Default for PerfSpec {
    fn default() -> Self {
        Self {
            events: vec![],
            interval: Some(1000),
            output: "perf.txt".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdSpec {
    pub command: String,
    pub delay: u64,
    pub duration: Option<u64>,
    pub signal: String,
    pub cpus: Vec<u32>,
    pub sched: Option<SchedSpec>,
    pub perf: Option<PerfSpec>,
}

impl Default for CmdSpec {
    fn default() -> Self {
        Self {
            command: "".into(),
            delay: 0,
            duration: None,
            signal: "SIGINT".into(),
            cpus: vec![],
            sched: None,
            perf: None,
        }
    }
}

impl CmdSpec {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSpec {
    pub name: String,
    pub placement: Option<Placement>,
    pub termination: Termination,
    pub workload: CmdSpec,
    pub victim: CmdSpec,
    pub aggressor: Option<CmdSpec>,
}

impl Default for ExperimentSpec {
    fn default() -> Self {
        Self {
            name: "/pinbench".into(),
            placement: None,
            termination: Termination::AwaitAll,
            workload: CmdSpec {
                delay: 3,
                ..CmdSpec::new("mutilate -s 127.0.0.1 -t 26 -T 2 -c 8")
            },
            victim: CmdSpec {
                duration: Some(30),
                ..CmdSpec::new("memcached -u root -t 2")
            },
            aggressor: None,
        }
    }
}

impl ExperimentSpec {
    pub fn cmd(&self, role: Role) -> Option<&CmdSpec> {
        match role {
            Role::Workload => Some(&self.workload),
            Role::Victim => Some(&self.victim),
            Role::Aggressor => self.aggressor.as_ref(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.name.starts_with('/') || self.name.trim_matches('/').is_empty() {
            bail!("experiment name {:?} must be an absolute cgroup path", &self.name);
        }
        if self.placement.is_some() && self.aggressor.is_none() {
            bail!("placement {:?} requires an aggressor command", self.placement);
        }
        if self.placement.is_none() && self.aggressor.is_some() {
            bail!("aggressor command requires a placement");
        }
        for role in Role::into_enum_iter() {
            if let Some(cmd) = self.cmd(role) {
                if cmd.command.trim().is_empty() {
                    bail!("{} command is empty", role.name());
                }
            }
        }
        Ok(())
    }
}

impl JsonLoad for ExperimentSpec {
    fn loaded(&mut self) -> Result<()> {
        self.validate()
    }
}

impl JsonSave for ExperimentSpec {
    fn preamble() -> Option<String> {
        Some(EXPERIMENT_DOC.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_names() {
        for pl in &[
            Placement::SameHyperThread,
            Placement::SameCore,
            Placement::SameSocket,
            Placement::DifferentSocket,
        ] {
            assert_eq!(pl.name().parse::<Placement>().unwrap(), *pl);
        }
        assert_eq!(
            "different-socket".parse::<Placement>().unwrap(),
            Placement::DifferentSocket
        );
        assert!("same_die".parse::<Placement>().is_err());
    }

    #[test]
    fn test_role_cgrp() {
        assert_eq!(Role::Victim.cgrp("/pinbench"), "/pinbench/victim");
        assert_eq!(Role::Aggressor.cgrp("/exp/"), "/exp/aggressor");
    }

    #[test]
    fn test_validate() {
        let mut spec = ExperimentSpec::default();
        spec.validate().unwrap();

        spec.placement = Some(Placement::SameCore);
        assert!(spec.validate().is_err());
        spec.aggressor = Some(CmdSpec::new("stress -c 1"));
        spec.validate().unwrap();

        spec.name = "pinbench".into();
        assert!(spec.validate().is_err());
        spec.name = "/".into();
        assert!(spec.validate().is_err());
        spec.name = "/pinbench".into();

        spec.victim.command = " ".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.json");
        std::fs::write(
            &path,
            "// comment\n{\n  \"placement\": \"same_socket\",\n  \
             \"aggressor\": { \"command\": \"l3 30\", \"duration\": 30 }\n}\n",
        )
        .unwrap();

        let cfg = JsonConfigFile::<ExperimentSpec>::load(&path).unwrap();
        assert_eq!(cfg.data.placement, Some(Placement::SameSocket));
        let aggr = cfg.data.aggressor.as_ref().unwrap();
        assert_eq!(aggr.duration, Some(30));
        assert_eq!(aggr.signal, "SIGINT");
        assert_eq!(cfg.data.victim, ExperimentSpec::default().victim);
    }
}
