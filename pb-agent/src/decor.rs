// Copyright (c) Facebook, Inc. and its affiliates.
//! Command line wrappers which are rendered into a single `sh -c` string.
use std::fmt;
use thiserror::Error;

use pb_agent_intf::{CmdSpec, PerfSpec, SchedPolicy};

#[derive(Debug, Error)]
pub enum DecorError {
    #[error(
        "priority {priority} is invalid for {policy:?}, \
         realtime policies need 1 or higher and others 0"
    )]
    Priority { policy: SchedPolicy, priority: u32 },
}

/// Quote `input` so that `sh` sees it as one word.
pub fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decor {
    Raw(String),
    /// `taskset -c CPUS`, CPU 0 if empty
    Taskset { cpus: Vec<u32>, inner: Box<Decor> },
    /// `timeout -s SIGNAL SECS`
    RunFor {
        secs: u64,
        signal: String,
        inner: Box<Decor>,
    },
    /// `sleep SECS &&`, nothing if zero
    Delay { secs: u64, inner: Box<Decor> },
    Perf {
        events: Vec<String>,
        interval: Option<u64>,
        output: String,
        inner: Box<Decor>,
    },
    /// `chrt --POLICY PRIO`
    Sched {
        policy: SchedPolicy,
        priority: u32,
        inner: Box<Decor>,
    },
}

impl Decor {
    pub fn raw(command: &str) -> Self {
        Self::Raw(command.into())
    }

    pub fn taskset(self, cpus: &[u32]) -> Self {
        Self::Taskset {
            cpus: cpus.to_vec(),
            inner: Box::new(self),
        }
    }

    pub fn run_for(self, secs: u64, signal: &str) -> Self {
        Self::RunFor {
            secs,
            signal: signal.into(),
            inner: Box::new(self),
        }
    }

    pub fn delay(self, secs: u64) -> Self {
        Self::Delay {
            secs,
            inner: Box::new(self),
        }
    }

    pub fn perf(self, spec: &PerfSpec) -> Self {
        Self::Perf {
            events: spec.events.clone(),
            interval: spec.interval,
            output: spec.output.clone(),
            inner: Box::new(self),
        }
    }

    pub fn sched(self, policy: SchedPolicy, priority: u32) -> Result<Self, DecorError> {
        let valid = match policy.realtime() {
            true => priority >= 1,
            false => priority == 0,
        };
        if !valid {
            return Err(DecorError::Priority { policy, priority });
        }
        Ok(Self::Sched {
            policy,
            priority,
            inner: Box::new(self),
        })
    }

    /// Everything `spec` asks for except the delay. The delay has to stay
    /// outermost, so it's applied after the command is placed in its cgroup.
    pub fn from_cmd_spec(spec: &CmdSpec) -> Result<Self, DecorError> {
        let mut decor = Self::raw(&spec.command);
        if !spec.cpus.is_empty() {
            decor = decor.taskset(&spec.cpus);
        }
        if let Some(sched) = spec.sched.as_ref() {
            decor = decor.sched(sched.policy, sched.priority)?;
        }
        if let Some(perf) = spec.perf.as_ref() {
            decor = decor.perf(perf);
        }
        if let Some(secs) = spec.duration {
            decor = decor.run_for(secs, &spec.signal);
        }
        Ok(decor)
    }

    /// Form of `self` which can follow a wrapper command such as taskset.
    /// Raw commands and delays may be compound, so they're handed over as
    /// a single `sh -c` argument.
    fn as_argv(&self) -> String {
        match self {
            Self::Raw(_) | Self::Delay { .. } if !self.is_nop_delay() => {
                format!("sh -c {}", shell_quote(&self.to_string()))
            }
            Self::Delay { inner, .. } => inner.as_argv(),
            _ => self.to_string(),
        }
    }

    fn is_nop_delay(&self) -> bool {
        matches!(self, Self::Delay { secs: 0, .. })
    }
}

impl fmt::Display for Decor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Raw(cmd) => write!(f, "{}", cmd),
            Self::Taskset { cpus, inner } => {
                let list = match cpus.len() {
                    0 => "0".to_string(),
                    _ => cpus
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<String>>()
                        .join(","),
                };
                write!(f, "taskset -c {} {}", list, inner.as_argv())
            }
            Self::RunFor {
                secs,
                signal,
                inner,
            } => write!(f, "timeout -s {} {} {}", signal, secs, inner.as_argv()),
            Self::Delay { secs: 0, inner } => write!(f, "{}", inner),
            Self::Delay { secs, inner } => write!(f, "sleep {} && {}", secs, inner),
            Self::Perf {
                events,
                interval,
                output,
                inner,
            } => {
                write!(f, "perf stat -x ',' --append ")?;
                if !events.is_empty() {
                    write!(f, "-e {} ", events.join(","))?;
                }
                if let Some(intv) = interval {
                    write!(f, "-I {} ", intv)?;
                }
                write!(f, "-o {} {}", output, inner.as_argv())
            }
            Self::Sched {
                policy,
                priority,
                inner,
            } => write!(f, "chrt {} {} {}", policy.flag(), priority, inner.as_argv()),
        }
    }
}
