// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::UNIX_EPOCH;

use super::Placement;
use pb_util::*;

const REPORT_DOC: &str = "\
//
// pinbench run report
//
//  timestamp: When the run finished
//  name: Top-level cgroup path of the experiment
//  placement: Aggressor placement, null for baseline runs
//  degraded: The placement could not be honored exactly (e.g. same_core
//            on a core without a second hyperthread)
//  aborted: The run was interrupted before all commands finished
//  slots.ROLE: socket, core, hyperthread and memory node of each role
//  cgroup_spec[]: cgroup configuration the commands ran under
//  commands.ROLE: Final command line of each role
//  exits.PID: Command, exit code and terminating signal of each process
//  wall_time: Seconds between the first spawn and the last reap
//
";

/// Hardware position of one role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub socket: u32,
    pub core: u32,
    pub hyper_thread: u32,
    pub mem_node: u32,
}

/// Outcome of one supervised command. Exactly one of `code` and `signal`
/// is set for a reaped process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub command: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitRecord {
    pub fn new(command: &str, status: &ExitStatus) -> Self {
        Self {
            command: command.into(),
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub timestamp: DateTime<Local>,
    pub name: String,
    pub placement: Option<Placement>,
    pub degraded: bool,
    pub aborted: bool,
    pub slots: BTreeMap<String, Slot>,
    pub cgroup_spec: Vec<String>,
    pub commands: BTreeMap<String, String>,
    pub exits: BTreeMap<u32, ExitRecord>,
    pub wall_time: f64,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            timestamp: DateTime::from(UNIX_EPOCH),
            name: "".into(),
            placement: None,
            degraded: false,
            aborted: false,
            slots: Default::default(),
            cgroup_spec: vec![],
            commands: Default::default(),
            exits: Default::default(),
            wall_time: 0.0,
        }
    }
}

impl JsonLoad for RunReport {}

impl JsonSave for RunReport {
    fn preamble() -> Option<String> {
        Some(REPORT_DOC.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_exit_record() {
        let st = Command::new("sh").args(&["-c", "exit 3"]).status().unwrap();
        let rec = ExitRecord::new("exit 3", &st);
        assert_eq!(rec.code, Some(3));
        assert!(!rec.success());
        assert_eq!(rec.signal, None);

        let st = Command::new("sh")
            .args(&["-c", "kill -s INT $$"])
            .status()
            .unwrap();
        let rec = ExitRecord::new("kill -s INT $$", &st);
        assert_eq!(rec.code, None);
        assert_eq!(rec.signal, Some(2));
    }

    #[test]
    fn test_report_json() {
        let mut rep = RunReport::default();
        rep.exits.insert(
            42,
            ExitRecord {
                command: "exit 0".into(),
                code: Some(0),
                signal: None,
            },
        );
        let json = rep.as_json().unwrap();
        assert!(json.starts_with("//\n// pinbench run report"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        rep.save(&path).unwrap();
        let loaded = RunReport::load(&path).unwrap();
        assert_eq!(loaded.exits, rep.exits);
    }
}
