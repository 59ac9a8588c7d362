// Copyright (c) Facebook, Inc. and its affiliates.
pub mod args;
pub mod cgroup_spec;
pub mod experiment;
pub mod report;

pub use args::{Args, CgroupBackendKind};
pub use cgroup_spec::CgroupSpec;
pub use experiment::{
    CmdSpec, ExperimentSpec, PerfSpec, Placement, Role, SchedPolicy, SchedSpec, Termination,
};
pub use report::{ExitRecord, RunReport, Slot};

pub const DFL_CPUINFO_PATH: &str = "/proc/cpuinfo";
pub const DFL_CGROUP_ROOT: &str = "/sys/fs/cgroup";
