// Copyright (c) Facebook, Inc. and its affiliates.
use clap;
use lazy_static::lazy_static;
use log::error;
use serde::{Deserialize, Serialize};
use std::process::exit;

use super::{Placement, DFL_CGROUP_ROOT, DFL_CPUINFO_PATH};
use pb_util::*;

const HELP_BODY: &str = "\
CPU placement and isolation harness for sensitivity experiments.

pb-agent pins a victim service, its load generator (workload) and an optional
interference process (aggressor) to hardware threads picked at random from the
CPU topology, isolates them in cpuset cgroups, runs them concurrently and
reports how each one exited.

The victim and the workload always land on different sockets. The aggressor
is placed relative to the victim according to --placement:

 * same_hyperthread: share the victim's hyperthread

 * same_core: the sibling hyperthread on the victim's core

 * same_socket: another core on the victim's socket

 * different_socket: another core on the workload's socket

At least two sockets are required. The cgroup tree is destroyed after every
run, also when it is interrupted.
";

lazy_static! {
    static ref ARGS_STR: String = format!(
        "-e, --experiment=[FILE]   'Experiment definition, created with defaults if missing'
         -c, --cpuinfo=[FILE]      'CPU enumeration source (default: {dfl_cpuinfo})'
         -C, --cgroup-root=[DIR]   'cgroup filesystem root (default: {dfl_cgroot})'
         -b, --backend=[NAME]      'cgroup backend, cgtools or fs (default: cgtools)'
         -s, --cgroup-spec=[FILE]  'Apply the cgroup spec in FILE instead of planning one'
         -p, --placement=[POLICY]  'Override aggressor placement of the experiment'
         -o, --output=[FILE]       'Shared output file of all commands (default: {dfl_output})'
         -r, --report=[FILE]       'Write the run report to FILE'
             --poll-interval=[DUR] 'Reaping poll interval (default: {dfl_poll}s)'
             --settle=[DUR]        'Delay after cgroup teardown (default: {dfl_settle}s)'
             --seed=[SEED]         'Seed the placement sampler for reproducible runs'
             --await-first         'Kill the remaining commands when the first one exits'
             --dry-run             'Show the placement, cgroups and commands and exit'
         -a, --args=[FILE]         'Load base command line arguments from FILE'
         -v...                     'Sets the level of verbosity'",
        dfl_cpuinfo = DFL_CPUINFO_PATH,
        dfl_cgroot = DFL_CGROUP_ROOT,
        dfl_output = Args::default().output,
        dfl_poll = Args::default().poll_interval,
        dfl_settle = Args::default().settle,
    );
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CgroupBackendKind {
    /// libcgroup tools: cgcreate, cgdelete and cgexec
    CgTools,
    /// Direct mkdir, rmdir and tasks file writes
    Fs,
}

impl std::str::FromStr for CgroupBackendKind {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> anyhow::Result<Self> {
        match input {
            "cgtools" | "cg_tools" => Ok(Self::CgTools),
            "fs" => Ok(Self::Fs),
            _ => anyhow::bail!("unknown cgroup backend {:?}", input),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub experiment: Option<String>,
    pub cpuinfo: String,
    pub cgroup_root: String,
    pub backend: CgroupBackendKind,
    pub output: String,
    pub report: Option<String>,
    pub poll_interval: f64,
    pub settle: f64,

    #[serde(skip)]
    pub cgroup_spec: Option<String>,
    #[serde(skip)]
    pub placement: Option<Placement>,
    #[serde(skip)]
    pub seed: Option<u64>,
    #[serde(skip)]
    pub await_first: bool,
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            experiment: None,
            cpuinfo: DFL_CPUINFO_PATH.into(),
            cgroup_root: DFL_CGROUP_ROOT.into(),
            backend: CgroupBackendKind::CgTools,
            output: "output.txt".into(),
            report: None,
            poll_interval: 0.1,
            settle: 1.0,
            cgroup_spec: None,
            placement: None,
            seed: None,
            await_first: false,
            dry_run: false,
        }
    }
}

impl JsonLoad for Args {}
impl JsonSave for Args {}

fn parse_or_exit<T, F>(name: &str, v: &str, parse: F) -> T
where
    F: FnOnce(&str) -> anyhow::Result<T>,
{
    match parse(v) {
        Ok(v) => v,
        Err(e) => {
            error!("invalid --{} {:?} ({})", name, v, &e);
            exit(1);
        }
    }
}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("pb-agent")
            .version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> bool {
        let dfl = Args::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("experiment") {
            self.experiment = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("cpuinfo") {
            self.cpuinfo = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.cpuinfo.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("cgroup-root") {
            self.cgroup_root = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.cgroup_root.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("backend") {
            self.backend = if v.len() > 0 {
                parse_or_exit("backend", v, |x| x.parse())
            } else {
                dfl.backend
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("output") {
            self.output = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.output.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("report") {
            self.report = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("poll-interval") {
            self.poll_interval = if v.len() > 0 {
                parse_or_exit("poll-interval", v, parse_duration)
            } else {
                dfl.poll_interval
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("settle") {
            self.settle = if v.len() > 0 {
                parse_or_exit("settle", v, parse_duration)
            } else {
                dfl.settle
            };
            updated_base = true;
        }

        self.cgroup_spec = matches.value_of("cgroup-spec").map(|x| x.to_string());
        self.placement = matches
            .value_of("placement")
            .map(|v| parse_or_exit("placement", v, |x| x.parse()));
        self.seed = matches
            .value_of("seed")
            .map(|v| parse_or_exit("seed", v, |x| Ok(x.parse::<u64>()?)));
        self.await_first = matches.is_present("await-first");
        self.dry_run = matches.is_present("dry-run");

        updated_base
    }
}
