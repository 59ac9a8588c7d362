// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Flat, ordered cgroup configuration. Each entry has the form
/// `<cgroup path>/<type>.<param>=<value>`, e.g.
/// `/pinbench/victim/cpuset.cpus=3,23`.
///
/// Order matters: entries are applied in the order they appear within each
/// group and groups are created in the order they first appear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CgroupSpec {
    pub entries: Vec<String>,
}

impl CgroupSpec {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, path: &str, param: &str, value: &str) {
        self.entries.push(format!(
            "{}/{}={}",
            path.trim_end_matches('/'),
            param,
            value
        ));
    }

    /// Newline-delimited form. Blank lines and `#` comments are ignored.
    pub fn from_lines(input: &str) -> Self {
        Self {
            entries: input
                .lines()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| line.to_string())
                .collect(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        Ok(Self::from_lines(&buf))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for CgroupSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for entry in self.entries.iter() {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CgroupSpec;

    #[test]
    fn test_push() {
        let mut spec = CgroupSpec::new();
        spec.push("/exp/", "cpuset.cpus", "1,2");
        spec.push("/exp/victim", "cpuset.mems", "0");
        assert_eq!(
            spec.entries,
            vec!["/exp/cpuset.cpus=1,2", "/exp/victim/cpuset.mems=0"]
        );
    }

    #[test]
    fn test_lines() {
        let spec = CgroupSpec::from_lines(
            "# parent\n/A/bar.baz=2\n\n   /A/B/bar.foo=1  \n",
        );
        assert_eq!(spec.entries, vec!["/A/bar.baz=2", "/A/B/bar.foo=1"]);
        assert_eq!(CgroupSpec::from_lines(&spec.to_string()), spec);
    }

    #[test]
    fn test_json_is_a_list() {
        let spec = CgroupSpec::from_lines("/A/bar.foo=1");
        assert_eq!(
            serde_json::to_string(&spec).unwrap(),
            "[\"/A/bar.foo=1\"]"
        );
    }
}
