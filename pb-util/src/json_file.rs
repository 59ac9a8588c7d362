// Copyright (c) Facebook, Inc. and its affiliates.
//! JSON files with a leading `//` comment block documenting their fields.
//!
//! Config and args files are created with the defaults on first use so that
//! the user has a documented template to edit. Comment lines are accepted
//! anywhere in the file.
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn is_comment(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("//") || line.starts_with('#')
}

/// Strip comment lines, keeping the line count intact so that serde_json
/// error positions still point at the right place.
fn strip_comments(input: &str) -> String {
    input
        .lines()
        .map(|line| if is_comment(line) { "" } else { line })
        .collect::<Vec<&str>>()
        .join("\n")
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    /// Called after a successful load, e.g. to validate.
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        serde_json::from_str::<Self>(&strip_comments(&buf))
            .with_context(|| format!("parsing {:?}", path))
    }
}

pub trait JsonSave
where
    Self: Default + Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut out = Self::preamble().unwrap_or_default();
        out += &serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.as_json()?).with_context(|| format!("writing {:?}", path))
    }

    /// Write the defaults to `path` unless it already exists. Returns
    /// whether the file was created.
    fn write_default_if_missing<P: AsRef<Path>>(path: P) -> Result<bool> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut f = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("creating {:?}", path)),
        };
        f.write_all(Self::default().as_json()?.as_bytes())?;
        Ok(true)
    }
}

/// Loaded config along with where it came from. `path` is `None` when
/// running on the built-in defaults.
#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut data = T::load(path)?;
        data.loaded()
            .with_context(|| format!("validating {:?}", path))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            data,
        })
    }

    pub fn load_or_create<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let path = match path {
            Some(v) => v,
            None => {
                let mut data = T::default();
                data.loaded()?;
                return Ok(Self { path: None, data });
            }
        };

        if T::write_default_if_missing(&path)? {
            info!("cfg: Created {:?} with the defaults", path.as_ref());
        }
        Self::load(path)
    }

    pub fn save(&self) -> Result<()> {
        match self.path.as_ref() {
            Some(path) => self.data.save(path),
            None => Ok(()),
        }
    }
}

/// Command line arguments which can also be stored in a JSON file given
/// with `--args`. Options given on the command line override the file and
/// are written back to it.
pub trait JsonArgs
where
    Self: JsonLoad + JsonSave,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    /// Apply `matches`. Returns whether anything stored in the args file
    /// changed.
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> bool;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T: JsonArgs> JsonArgsHelper for T {
    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args"))?;
        if args_file.data.process_cmdline(&matches) {
            if let Some(path) = args_file.path.as_ref() {
                info!("cfg: Updating args file {:?}", path);
                args_file.save()?;
            }
        }
        Ok(args_file)
    }
}

/// Report which becomes visible at `path` only once complete. `commit()`
/// writes `<path>.staging` and renames it over `path`.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: Option<PathBuf>,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path: Option<P>) -> Self {
        let path = path.map(|p| p.as_ref().to_path_buf());
        let staging = match path.as_ref() {
            Some(p) => {
                let mut name = p.as_os_str().to_owned();
                name.push(".staging");
                PathBuf::from(name)
            }
            None => PathBuf::new(),
        };
        Self {
            path,
            staging,
            data: T::default(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        if let Some(path) = self.path.as_ref() {
            self.data.save(&self.staging)?;
            fs::rename(&self.staging, path)
                .with_context(|| format!("renaming {:?} to {:?}", &self.staging, path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Knobs {
        period: u64,
        name: String,
    }

    impl Default for Knobs {
        fn default() -> Self {
            Self {
                period: 30,
                name: "dfl".into(),
            }
        }
    }

    impl JsonLoad for Knobs {}
    impl JsonSave for Knobs {
        fn preamble() -> Option<String> {
            Some("// knobs\n".into())
        }
    }

    #[test]
    fn test_strip_comments() {
        assert_eq!(
            strip_comments("// a\n{\n  # b\n  \"x\": 1\n}"),
            "\n{\n\n  \"x\": 1\n}"
        );
    }

    #[test]
    fn test_load_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/knobs.json");

        let cfg = JsonConfigFile::<Knobs>::load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.data, Knobs::default());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("// knobs\n{"));

        fs::write(&path, "// edited\n{\n  // inline\n  \"period\": 5\n}\n").unwrap();
        let cfg = JsonConfigFile::<Knobs>::load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.data.period, 5);
        assert_eq!(cfg.data.name, "dfl");

        fs::write(&path, "{ \"period\": \"x\" }").unwrap();
        assert!(JsonConfigFile::<Knobs>::load(&path).is_err());

        let cfg = JsonConfigFile::<Knobs>::load_or_create(Option::<&Path>::None).unwrap();
        assert!(cfg.path.is_none());
        cfg.save().unwrap();
    }

    #[test]
    fn test_report_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut rep = JsonReportFile::<Knobs>::new(Some(&path));
        assert_eq!(rep.staging, dir.path().join("report.json.staging"));
        rep.data.period = 7;
        rep.commit().unwrap();
        assert!(!rep.staging.exists());
        assert_eq!(Knobs::load(&path).unwrap().period, 7);

        JsonReportFile::<Knobs>::new(Option::<&Path>::None)
            .commit()
            .unwrap();
    }
}
