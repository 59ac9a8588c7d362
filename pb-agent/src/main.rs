// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use chrono::prelude::*;
use enum_iterator::IntoEnumIterator;
use log::{error, info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::process::exit;
use std::time::{Duration, Instant};

mod cgroup;
mod decor;
mod placement;
mod shell;
mod topology;

use cgroup::{CgToolsBackend, Cgroup, CgroupBackend, CgroupFsBackend, DryRunBackend};
use decor::Decor;
use placement::Plan;
use shell::{open_output, Shell, ShellConfig};
use topology::Topology;

use pb_agent_intf::{
    Args, CgroupBackendKind, CgroupSpec, ExperimentSpec, Role, RunReport, Termination,
};
use pb_util::*;

fn startup_checks(args: &Args, exp: &ExperimentSpec) -> Result<()> {
    let mut bins = vec!["sh"];
    if args.backend == CgroupBackendKind::CgTools {
        bins.extend_from_slice(&["cgcreate", "cgdelete", "cgexec"]);
    }
    for cmd in Role::into_enum_iter().filter_map(|role| exp.cmd(role)) {
        if !cmd.cpus.is_empty() {
            bins.push("taskset");
        }
        if cmd.duration.is_some() {
            bins.push("timeout");
        }
        if cmd.sched.is_some() {
            bins.push("chrt");
        }
        if cmd.perf.is_some() {
            bins.push("perf");
        }
    }
    bins.sort();
    bins.dedup();

    let missing: Vec<&str> = bins
        .into_iter()
        .filter(|bin| find_bin(bin, Option::<&str>::None).is_none())
        .collect();
    if !missing.is_empty() {
        bail!("required binaries not found: {}", missing.join(", "));
    }
    Ok(())
}

/// Decorated command of each role, delay not applied yet.
fn decorate(exp: &ExperimentSpec) -> Result<Vec<(Role, String, u64)>> {
    let mut cmds = vec![];
    for role in Role::into_enum_iter() {
        if let Some(spec) = exp.cmd(role) {
            let decor = Decor::from_cmd_spec(spec)
                .with_context(|| format!("decorating {} command", role.name()))?;
            cmds.push((role, decor.to_string(), spec.delay));
        }
    }
    Ok(cmds)
}

/// Place each decorated command in its role's cgroup. The delay goes
/// outside so that only the command itself runs in the cgroup.
fn finalize(cg: &Cgroup, exp: &ExperimentSpec, cmds: &[(Role, String, u64)]) -> Vec<(Role, String)> {
    cmds.iter()
        .map(|(role, cmd, delay)| {
            let wrapped = cg.execute(&role.cgrp(&exp.name), cmd);
            (*role, Decor::raw(&wrapped).delay(*delay).to_string())
        })
        .collect()
}

fn print_plan(plan: Option<&Plan>, spec: &CgroupSpec, cmds: &[(Role, String)]) {
    if let Some(plan) = plan {
        for (role, slot) in plan.slots() {
            println!(
                "{:<10} socket {} core {} hyperthread {} mem {}",
                role.name(),
                slot.socket,
                slot.core,
                slot.hyper_thread,
                slot.mem_node
            );
        }
        if plan.degraded {
            println!("(placement degraded)");
        }
        println!();
    }
    print!("{}", spec);
    println!();
    for (role, cmd) in cmds.iter() {
        println!("{:<10} {}", role.name(), cmd);
    }
}

fn run(args: &Args) -> Result<()> {
    let mut exp = JsonConfigFile::<ExperimentSpec>::load_or_create(args.experiment.as_ref())?.data;
    if args.placement.is_some() {
        exp.placement = args.placement;
    }
    if args.await_first {
        exp.termination = Termination::AwaitFirst;
    }
    exp.validate()?;

    if !args.dry_run {
        startup_checks(args, &exp)?;
    }

    let backend: Box<dyn CgroupBackend> = match args.backend {
        CgroupBackendKind::CgTools => Box::new(CgToolsBackend::new(&args.cgroup_root)),
        CgroupBackendKind::Fs => Box::new(CgroupFsBackend::new(&args.cgroup_root)),
    };

    let (plan, spec) = match args.cgroup_spec.as_ref() {
        Some(path) => {
            info!("pb-agent: using cgroup spec {:?}", path);
            (None, CgroupSpec::load(path)?)
        }
        None => {
            let topo = Topology::load(&args.cpuinfo)?;
            let mut rng = match args.seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_entropy(),
            };
            let plan = placement::plan(&topo, exp.placement, &mut rng)?;
            let spec = plan.cgroup_spec(&exp.name);
            (Some(plan), spec)
        }
    };
    let decorated = decorate(&exp)?;

    if args.dry_run {
        let dry = DryRunBackend::new(backend.as_ref());
        let cg = Cgroup::create(&dry, &spec.entries)?;
        print_plan(plan.as_ref(), &spec, &finalize(&cg, &exp, &decorated));
        return Ok(());
    }

    let mut report = JsonReportFile::<RunReport>::new(args.report.as_ref());
    let rep = &mut report.data;
    rep.name = exp.name.clone();
    rep.placement = exp.placement;
    rep.cgroup_spec = spec.entries.clone();
    if let Some(plan) = plan.as_ref() {
        rep.degraded = plan.degraded;
        for (role, slot) in plan.slots() {
            rep.slots.insert(role.name().into(), slot);
        }
    }

    let output = open_output(&args.output)
        .with_context(|| format!("opening output file {:?}", &args.output))?;

    if spec.is_empty() {
        warn!("pb-agent: cgroup spec is empty, commands run unconstrained");
    }
    let mut cg = Cgroup::create(backend.as_ref(), &spec.entries)?;
    info!(
        "pb-agent: created {} groups for {}",
        cg.paths().len(),
        cg.types().join(",")
    );
    cg.set_settle_delay(Duration::from_secs_f64(args.settle.max(0.0)));

    let cmds = finalize(&cg, &exp, &decorated);
    for (role, cmd) in cmds.iter() {
        rep.commands.insert(role.name().into(), cmd.clone());
    }

    let shell = Shell::new(ShellConfig {
        poll_interval: Duration::from_secs_f64(args.poll_interval.max(0.001)),
    });
    let started_at = Instant::now();
    let result = shell.run(
        &cmds.iter().map(|(_, cmd)| cmd.as_str()).collect::<Vec<&str>>(),
        &output,
        exp.termination,
    );
    rep.wall_time = started_at.elapsed().as_secs_f64();

    let destroyed = cg.destroy();
    let exits = result?;

    for rec in exits.values() {
        match (rec.code, rec.signal) {
            (Some(0), _) => info!("pb-agent: {:?} succeeded", &rec.command),
            (Some(code), _) => warn!("pb-agent: {:?} exited with {}", &rec.command, code),
            (_, Some(sig)) => info!("pb-agent: {:?} killed by signal {}", &rec.command, sig),
            _ => {}
        }
    }

    rep.exits = exits;
    rep.aborted = prog_exiting();
    rep.timestamp = Local::now();
    info!(
        "pb-agent: {} commands finished in {}",
        rep.exits.len(),
        format_duration(rep.wall_time)
    );
    report.commit()?;
    destroyed?;
    Ok(())
}

fn main() {
    let args_file = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("cfg: Failed to process args file ({:#})", &e);
        exit(1);
    });

    if let Err(e) = setup_prog_state() {
        error!("pb-agent: Failed to install signal handler ({:#})", &e);
        exit(1);
    }

    if let Err(e) = run(&args_file.data) {
        error!("pb-agent: {:#}", &e);
        exit(1);
    }
}
