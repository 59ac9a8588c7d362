// Copyright (c) Facebook, Inc. and its affiliates.
//! cgroup tree built from a flat `<path>/<type>.<param>=<value>` list.
//!
//! Groups are created depth-first in pre-order and every parameter of a
//! group is written before any of its children is created, as cpuset
//! children can only subset what the parent already allows. Teardown is
//! post-order. The actual cgroup manipulation is done by a
//! [`CgroupBackend`] which is passed in by the caller.
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::decor::shell_quote;
use pb_util::*;

lazy_static! {
    static ref SEGMENT_RE: Regex = Regex::new(r"^[A-Za-z0-9_.:@-]+$").unwrap();
}

pub const DFL_SETTLE_DELAY: Duration = Duration::from_secs(1);
const RMDIR_TIMEOUT: Duration = Duration::from_secs(10);
const ROOT: usize = 0;

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("failed to create cgroup {path:?}")]
    Create {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to set {param}={value:?} on cgroup {path:?}")]
    SetParam {
        path: String,
        param: String,
        value: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to destroy cgroup {path:?}")]
    Destroy {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Primitive cgroup operations. `path` always starts with '/' and is
/// relative to the cgroup hierarchy root; `types` is the controller list
/// shared by the whole tree, e.g. `["cpuset", "cpu"]`.
pub trait CgroupBackend {
    fn create(&self, types: &[String], path: &str) -> Result<()>;
    fn destroy(&self, types: &[String], path: &str) -> Result<()>;
    /// `param` is the full file name, e.g. `cpuset.cpus`.
    fn set_param(&self, cg_type: &str, path: &str, param: &str, value: &str) -> Result<()>;

    /// `command` may be a compound shell command. It's handed over as a
    /// single `sh -c` argument so that all of it runs in the group.
    fn wrap(&self, types: &[String], path: &str, command: &str) -> String {
        format!(
            "cgexec -g {}:{} sh -c {}",
            types.join(","),
            path,
            shell_quote(command)
        )
    }
}

/// libcgroup command line tools plus direct parameter writes.
pub struct CgToolsBackend {
    root: PathBuf,
}

impl CgToolsBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl CgroupBackend for CgToolsBackend {
    fn create(&self, types: &[String], path: &str) -> Result<()> {
        run_command(
            Command::new("cgcreate")
                .arg("-g")
                .arg(format!("{}:{}", types.join(","), path)),
            "cgcreate failed",
        )
    }

    fn destroy(&self, types: &[String], path: &str) -> Result<()> {
        run_command(
            Command::new("cgdelete").arg(format!("{}:{}", types.join(","), path)),
            "cgdelete failed",
        )
    }

    fn set_param(&self, cg_type: &str, path: &str, param: &str, value: &str) -> Result<()> {
        write_one_line(
            self.root.join(format!("{}{}", cg_type, path)).join(param),
            value,
        )
    }
}

/// Manipulates the cgroup filesystem directly, for hosts without libcgroup.
pub struct CgroupFsBackend {
    root: PathBuf,
}

impl CgroupFsBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, cg_type: &str, path: &str) -> PathBuf {
        self.root.join(format!("{}{}", cg_type, path))
    }

    fn really_remove_dir(dir: &PathBuf) -> Result<()> {
        let started_at = Instant::now();

        loop {
            let e = match fs::remove_dir(dir) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match e.raw_os_error() {
                Some(libc::ENOENT) => return Ok(()),
                Some(libc::EBUSY) => {}
                _ => return Err(anyhow!("failed to remove {:?} ({})", dir, &e)),
            }

            if Instant::now().duration_since(started_at) > RMDIR_TIMEOUT {
                return Err(anyhow!("{:?} still busy after trying for 10s", dir));
            }

            debug!("cgroup: {:?} busy, trying to remove again", dir);
            sleep(Duration::from_millis(100));
        }
    }
}

impl CgroupBackend for CgroupFsBackend {
    fn create(&self, types: &[String], path: &str) -> Result<()> {
        for cg_type in types.iter() {
            let dir = self.dir(cg_type, path);
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("cgroup: {:?} already exists", &dir);
                }
                Err(e) => return Err(anyhow!("failed to create {:?} ({})", &dir, &e)),
            }
        }
        Ok(())
    }

    fn destroy(&self, types: &[String], path: &str) -> Result<()> {
        for cg_type in types.iter() {
            Self::really_remove_dir(&self.dir(cg_type, path))?;
        }
        Ok(())
    }

    fn set_param(&self, cg_type: &str, path: &str, param: &str, value: &str) -> Result<()> {
        write_one_line(self.dir(cg_type, path).join(param), value)
    }

    fn wrap(&self, types: &[String], path: &str, command: &str) -> String {
        let mut script = String::new();
        for cg_type in types.iter() {
            script += &format!(
                "echo $$ > {} && ",
                self.dir(cg_type, path).join("cgroup.procs").display()
            );
        }
        script += command;
        format!("sh -c {}", shell_quote(&script))
    }
}

/// Logs the operations without touching the system. Commands are wrapped
/// the way `inner` would wrap them.
pub struct DryRunBackend<'a> {
    inner: &'a dyn CgroupBackend,
}

impl<'a> DryRunBackend<'a> {
    pub fn new(inner: &'a dyn CgroupBackend) -> Self {
        Self { inner }
    }
}

impl<'a> CgroupBackend for DryRunBackend<'a> {
    fn create(&self, types: &[String], path: &str) -> Result<()> {
        debug!("cgroup: [dry-run] create {}:{}", types.join(","), path);
        Ok(())
    }

    fn destroy(&self, types: &[String], path: &str) -> Result<()> {
        debug!("cgroup: [dry-run] destroy {}:{}", types.join(","), path);
        Ok(())
    }

    fn set_param(&self, cg_type: &str, path: &str, param: &str, value: &str) -> Result<()> {
        debug!("cgroup: [dry-run] {} {}/{}={}", cg_type, path, param, value);
        Ok(())
    }

    fn wrap(&self, types: &[String], path: &str, command: &str) -> String {
        self.inner.wrap(types, path, command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Setting {
    cg_type: String,
    param: String,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    segments: Vec<String>,
    setting: Setting,
}

/// Split `<path>/<type>.<param>=<value>` at the first '='. Anything that
/// doesn't fit is skipped with a warning.
fn parse_entry(entry: &str) -> Option<Entry> {
    let (lhs, value) = match entry.split_once('=') {
        Some(v) => v,
        None => {
            warn!("cgroup: {:?} has no '=', skipping", entry);
            return None;
        }
    };
    if value.is_empty() {
        warn!("cgroup: {:?} has an empty value, skipping", entry);
        return None;
    }

    let mut segments: Vec<&str> = lhs.split('/').collect();
    let leaf = segments.pop().unwrap_or_default();
    if segments.first() == Some(&"") {
        segments.remove(0);
    }

    let cg_type = match leaf.split_once('.') {
        Some((t, p)) if !t.is_empty() && !p.is_empty() => t,
        _ => {
            warn!("cgroup: {:?} is not <type>.<param>, skipping {:?}", leaf, entry);
            return None;
        }
    };
    if segments.is_empty() {
        warn!("cgroup: {:?} has no cgroup path, skipping", entry);
        return None;
    }
    if let Some(seg) = segments.iter().find(|s| !SEGMENT_RE.is_match(s)) {
        warn!("cgroup: invalid path segment {:?} in {:?}, skipping", seg, entry);
        return None;
    }

    Some(Entry {
        segments: segments.iter().map(|s| s.to_string()).collect(),
        setting: Setting {
            cg_type: cg_type.into(),
            param: leaf.into(),
            value: value.into(),
        },
    })
}

#[derive(Debug)]
struct Node {
    name: String,
    path: String,
    settings: Vec<Setting>,
    children: Vec<usize>,
}

/// A created cgroup tree. Must be torn down with [`Cgroup::destroy`].
pub struct Cgroup<'a> {
    backend: &'a dyn CgroupBackend,
    types: Vec<String>,
    nodes: Vec<Node>,
    settle_delay: Duration,
}

impl<'a> Cgroup<'a> {
    fn build<S: AsRef<str>>(backend: &'a dyn CgroupBackend, entries: &[S]) -> Self {
        let mut cg = Self {
            backend,
            types: vec![],
            nodes: vec![Node {
                name: "".into(),
                path: "".into(),
                settings: vec![],
                children: vec![],
            }],
            settle_delay: DFL_SETTLE_DELAY,
        };

        for entry in entries.iter().filter_map(|e| parse_entry(e.as_ref())) {
            if !cg.types.contains(&entry.setting.cg_type) {
                cg.types.push(entry.setting.cg_type.clone());
            }

            let mut cur = ROOT;
            for seg in entry.segments.iter() {
                let found = cg.nodes[cur]
                    .children
                    .iter()
                    .copied()
                    .find(|&idx| cg.nodes[idx].name == *seg);
                cur = match found {
                    Some(idx) => idx,
                    None => {
                        let path = format!("{}/{}", cg.nodes[cur].path, seg);
                        cg.nodes.push(Node {
                            name: seg.clone(),
                            path,
                            settings: vec![],
                            children: vec![],
                        });
                        let idx = cg.nodes.len() - 1;
                        cg.nodes[cur].children.push(idx);
                        idx
                    }
                };
            }
            cg.nodes[cur].settings.push(entry.setting);
        }
        cg
    }

    /// Parse `entries` and create the tree through `backend`. The first
    /// failing operation aborts creation; groups created up to that point
    /// are left in place.
    pub fn create<S: AsRef<str>>(
        backend: &'a dyn CgroupBackend,
        entries: &[S],
    ) -> Result<Self, CgroupError> {
        let cg = Self::build(backend, entries);
        cg.create_node(ROOT)?;
        Ok(cg)
    }

    fn create_node(&self, idx: usize) -> Result<(), CgroupError> {
        let node = &self.nodes[idx];

        if idx != ROOT {
            info!("cgroup: creating {}:{}", self.types.join(","), &node.path);
            self.backend
                .create(&self.types, &node.path)
                .map_err(|source| CgroupError::Create {
                    path: node.path.clone(),
                    source,
                })?;
        }

        for set in node.settings.iter() {
            debug!("cgroup: {}/{}={}", &node.path, &set.param, &set.value);
            self.backend
                .set_param(&set.cg_type, &node.path, &set.param, &set.value)
                .map_err(|source| CgroupError::SetParam {
                    path: node.path.clone(),
                    param: set.param.clone(),
                    value: set.value.clone(),
                    source,
                })?;
        }

        for &child in node.children.iter() {
            self.create_node(child)?;
        }
        Ok(())
    }

    fn destroy_node(&self, idx: usize) -> Result<(), CgroupError> {
        let node = &self.nodes[idx];

        for &child in node.children.iter() {
            self.destroy_node(child)?;
        }

        if idx != ROOT {
            info!("cgroup: destroying {}:{}", self.types.join(","), &node.path);
            self.backend
                .destroy(&self.types, &node.path)
                .map_err(|source| CgroupError::Destroy {
                    path: node.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Delay after teardown before returning from [`Cgroup::destroy`].
    pub fn set_settle_delay(&mut self, delay: Duration) -> &mut Self {
        self.settle_delay = delay;
        self
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// Group paths in creation order.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths = vec![];
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if idx != ROOT {
                paths.push(node.path.as_str());
            }
            stack.extend(node.children.iter().rev());
        }
        paths
    }

    /// Wrap `command` so that it runs inside the group at `path`. Nothing
    /// is executed.
    pub fn execute(&self, path: &str, command: &str) -> String {
        self.backend.wrap(&self.types, path, command)
    }

    /// Remove all groups, children before parents. Some kernels finish
    /// removal asynchronously, so a non-empty tree is followed by the
    /// settle delay.
    pub fn destroy(self) -> Result<(), CgroupError> {
        if let Err(e) = self.destroy_node(ROOT) {
            error!("cgroup: {}", &e);
            return Err(e);
        }
        if self.nodes.len() > 1 && !self.settle_delay.is_zero() {
            debug!("cgroup: settling for {:?}", self.settle_delay);
            sleep(self.settle_delay);
        }
        Ok(())
    }
}
