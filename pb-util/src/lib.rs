// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use log::info;
use simplelog as sl;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub mod json_file;

pub use json_file::{
    JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave,
};

// (seconds per unit, suffix, unit count before moving to the next unit)
const DURATION_UNITS: [(f64, &str, f64); 7] = [
    (0.000_000_001, "n", 1000.0),
    (0.000_001, "u", 1000.0),
    (0.001, "m", 1000.0),
    (1.0, "s", 60.0),
    (60.0, "M", 60.0),
    (3600.0, "H", 24.0),
    (86400.0, "D", 365.0),
];

/// Short human readable form of `dur` seconds, e.g. "100m" or "2.5M".
pub fn format_duration(dur: f64) -> String {
    if dur <= 0.0 {
        return "0".into();
    }
    for (secs, suffix, limit) in DURATION_UNITS.iter() {
        let val = dur / secs;
        if val < *limit {
            return match val < 99.95 {
                true => format!("{:.1}{}", val, suffix),
                false => format!("{:.0}{}", val, suffix),
            };
        }
    }
    "INF".into()
}

fn duration_unit(ch: char) -> Option<f64> {
    DURATION_UNITS
        .iter()
        .find(|(_, suffix, _)| suffix.starts_with(ch))
        .map(|(secs, _, _)| *secs)
}

/// Parse a duration like "1.5s", "100m" or "1M_30s" into seconds. Numbers
/// without a unit are seconds.
pub fn parse_duration(input: &str) -> Result<f64> {
    let to_num = |num: &str| {
        num.parse::<f64>()
            .with_context(|| format!("invalid duration {:?}", input))
    };

    let mut total = 0.0;
    let mut num = String::new();
    for ch in input.chars().filter(|c| *c != '_' && !c.is_whitespace()) {
        match duration_unit(ch) {
            Some(secs) => {
                total += to_num(&num)? * secs;
                num.clear();
            }
            None => num.push(ch),
        }
    }
    if !num.is_empty() {
        total += to_num(&num)?;
    }

    if total < 0.0 {
        bail!("duration {:?} is negative", input);
    }
    Ok(total)
}

/// Look up `name` in `prepend` (a PATH-style list) and then in $PATH.
pub fn find_bin<N: AsRef<OsStr>, P: AsRef<OsStr>>(name: N, prepend: Option<P>) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = vec![];
    if let Some(pre) = prepend.as_ref() {
        dirs.extend(env::split_paths(pre));
    }
    dirs.extend(env::split_paths(&env::var_os("PATH").unwrap_or_else(OsString::new)));

    dirs.into_iter()
        .map(|dir| dir.join(name.as_ref()))
        .find(|path| match path.metadata() {
            Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        })
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let buf = fs::read_to_string(path)?;
    buf.lines()
        .next()
        .map(|line| line.to_string())
        .ok_or_else(|| anyhow!("{:?} is empty", path))
}

/// Write `line` to an existing file, e.g. a cgroup or sysfs knob.
pub fn write_one_line<P: AsRef<Path>>(path: P, line: &str) -> Result<()> {
    let path = path.as_ref();
    let mut f = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {:?}", path))?;
    f.write_all(line.as_bytes())
        .with_context(|| format!("writing {:?} to {:?}", line, path))
}

pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("{:?}: {}", cmd, emsg))?;
    if !status.success() {
        bail!("{:?} ({}): {}", cmd, status, emsg);
    }
    Ok(())
}

/// `RUST_LOG` selects env_logger. Otherwise log to stderr through simplelog
/// at a level picked by the number of `-v`s.
pub fn init_logging(verbosity: u32) {
    if env::var_os("RUST_LOG").is_some() {
        env_logger::init();
        return;
    }

    let level = match verbosity {
        0 | 1 => sl::LevelFilter::Info,
        2 => sl::LevelFilter::Debug,
        _ => sl::LevelFilter::Trace,
    };
    let lcfg = sl::ConfigBuilder::new()
        .set_time_level(sl::LevelFilter::Off)
        .set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off)
        .build();

    let term_ok = console::user_attended_stderr()
        && sl::TermLogger::init(
            level,
            lcfg.clone(),
            sl::TerminalMode::Stderr,
            sl::ColorChoice::Auto,
        )
        .is_ok();
    if !term_ok {
        let _ = sl::SimpleLogger::init(level, lcfg);
    }
}

lazy_static! {
    static ref EXITING: Mutex<bool> = Mutex::new(false);
    static ref EXITING_CV: Condvar = Condvar::new();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

/// Mark the program exiting on SIGINT and SIGTERM.
pub fn setup_prog_state() -> Result<()> {
    ctrlc::set_handler(|| {
        info!("Signal received, exiting...");
        set_prog_exiting();
    })?;
    Ok(())
}

pub fn set_prog_exiting() {
    *EXITING.lock().unwrap() = true;
    EXITING_CV.notify_all();
}

pub fn prog_exiting() -> bool {
    *EXITING.lock().unwrap()
}

/// Sleep for `dur`, returning early if the program starts exiting.
pub fn wait_prog_state(dur: Duration) -> ProgState {
    let exiting = EXITING.lock().unwrap();
    let (exiting, _) = EXITING_CV
        .wait_timeout_while(exiting, dur, |exiting| !*exiting)
        .unwrap();
    match *exiting {
        true => ProgState::Exiting,
        false => ProgState::Running,
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    #[test]
    fn test_format_duration() {
        for (dur, formatted) in &[
            (0.0, "0"),
            (0.000003932, "3.9u"),
            (0.1, "100m"),
            (1.5, "1.5s"),
            (150.0, "2.5M"),
            (7200.0, "2.0H"),
        ] {
            assert_eq!(super::format_duration(*dur), *formatted);
        }
    }

    #[test]
    fn test_parse_duration() {
        for (secs, input) in &[
            (0.1, "100m"),
            (1.0, "1s"),
            (1.0, "1"),
            (90.5, "1M_30s_500m"),
            (0.0, ""),
        ] {
            let result = super::parse_duration(input).unwrap();
            assert!((secs - result).abs() < 1e-9, "{} -> {}", input, result);
        }
        assert!(super::parse_duration("1x").is_err());
        assert!(super::parse_duration("-3s").is_err());
    }

    #[test]
    fn test_one_line_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuset.cpus");
        std::fs::write(&path, "").unwrap();
        assert!(super::read_one_line(&path).is_err());
        super::write_one_line(&path, "0-3").unwrap();
        assert_eq!(super::read_one_line(&path).unwrap(), "0-3");
        assert!(super::write_one_line(dir.path().join("missing"), "1").is_err());
    }

    #[test]
    fn test_find_bin() {
        assert!(super::find_bin("sh", Option::<&str>::None).is_some());
        assert!(super::find_bin("pb-no-such-binary", Option::<&str>::None).is_none());
    }

    #[test]
    fn test_run_command() {
        super::run_command(std::process::Command::new("true").arg("x"), "true").unwrap();
        assert!(super::run_command(&mut std::process::Command::new("false"), "false").is_err());
    }

    #[test]
    fn test_wait_prog_state() {
        let started_at = Instant::now();
        assert_eq!(
            super::wait_prog_state(Duration::from_millis(20)),
            super::ProgState::Running
        );
        assert!(started_at.elapsed() >= Duration::from_millis(10));
    }
}
