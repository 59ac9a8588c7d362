// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

use pb_agent_intf::{ExitRecord, Termination};
use pb_util::*;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("empty command in batch {0:?}")]
    EmptyCommand(Vec<String>),
    #[error("failed to spawn {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for pid {pid} ({command:?})")]
    Wait {
        pid: u32,
        command: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub poll_interval: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Open the output file shared by all commands of a batch for appending.
pub fn open_output<P: AsRef<Path>>(path: P) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

struct Running {
    command: String,
    child: Child,
}

fn spawn(command: &str, output: &File) -> io::Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(output.try_clone()?)
        .stderr(output.try_clone()?)
        .process_group(0)
        .spawn()
}

/// SIGKILL the process group of every child in `running`.
fn kill_all(running: &BTreeMap<u32, Running>) {
    for (pid, run) in running.iter() {
        debug!("shell: killing {:?} (pid {})", &run.command, pid);
        match killpg(Pid::from_raw(*pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("shell: failed to kill pid {} ({})", pid, &e),
        }
    }
}

/// Kill and reap everything in `running`. Used when the batch can't
/// complete normally.
fn abort(mut running: BTreeMap<u32, Running>) {
    kill_all(&running);
    for (pid, run) in running.iter_mut() {
        if let Err(e) = run.child.wait() {
            warn!("shell: failed to reap pid {} ({})", pid, &e);
        }
    }
}

pub struct Shell {
    cfg: ShellConfig,
}

impl Shell {
    pub fn new(cfg: ShellConfig) -> Self {
        Self { cfg }
    }

    /// Run `commands` concurrently with `sh -c`, each as its own process
    /// group with stdout and stderr going to `output`, and wait for them
    /// according to `mode`. Returns the exit of every command keyed by pid.
    ///
    /// If the program is asked to exit while waiting, the remaining
    /// commands are killed and reaped before returning.
    pub fn run<S: AsRef<str>>(
        &self,
        commands: &[S],
        output: &File,
        mode: Termination,
    ) -> Result<BTreeMap<u32, ExitRecord>, ShellError> {
        if commands.iter().any(|c| c.as_ref().is_empty()) {
            let batch: Vec<String> = commands.iter().map(|c| c.as_ref().to_string()).collect();
            warn!("shell: empty command in {:?}, not running anything", &batch);
            return Err(ShellError::EmptyCommand(batch));
        }

        let mut running = BTreeMap::<u32, Running>::new();
        for cmd in commands.iter().map(|c| c.as_ref()) {
            let child = match spawn(cmd, output) {
                Ok(v) => v,
                Err(source) => {
                    abort(running);
                    return Err(ShellError::Spawn {
                        command: cmd.into(),
                        source,
                    });
                }
            };
            info!("shell: started {:?} (pid {})", cmd, child.id());
            running.insert(
                child.id(),
                Running {
                    command: cmd.into(),
                    child,
                },
            );
        }

        let started_at = Instant::now();
        let mut exits = BTreeMap::new();
        let mut killed = false;

        while !running.is_empty() {
            let mut exited = vec![];
            let mut wait_err = None;
            for (pid, run) in running.iter_mut() {
                match run.child.try_wait() {
                    Ok(Some(status)) => {
                        info!("shell: {:?} (pid {}) ended with {}", &run.command, pid, status);
                        exits.insert(*pid, ExitRecord::new(&run.command, &status));
                        exited.push(*pid);
                    }
                    Ok(None) => {}
                    Err(source) => {
                        wait_err = Some(ShellError::Wait {
                            pid: *pid,
                            command: run.command.clone(),
                            source,
                        });
                        break;
                    }
                }
            }
            if let Some(e) = wait_err {
                abort(running);
                return Err(e);
            }
            for pid in exited.iter() {
                running.remove(pid);
            }
            if running.is_empty() {
                break;
            }

            if !killed {
                if mode == Termination::AwaitFirst && !exited.is_empty() {
                    info!(
                        "shell: first command exited after {}, killing {} remaining",
                        format_duration(started_at.elapsed().as_secs_f64()),
                        running.len()
                    );
                    kill_all(&running);
                    killed = true;
                } else if prog_exiting() {
                    info!("shell: exiting, killing {} remaining", running.len());
                    kill_all(&running);
                    killed = true;
                }
            }

            if killed {
                sleep(self.cfg.poll_interval);
            } else {
                wait_prog_state(self.cfg.poll_interval);
            }
        }

        debug!(
            "shell: {} commands done in {}",
            exits.len(),
            format_duration(started_at.elapsed().as_secs_f64())
        );
        Ok(exits)
    }
}
