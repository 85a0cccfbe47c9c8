// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! The state machine that realises one derivation.
//!
//! ```text
//! init → haveDerivation → outputsSubstituted → inputsRealised
//!      → tryToBuild → buildDone
//! ```
//!
//! `init` makes sure the derivation file itself is present (substituting
//! it if needed); `haveDerivation` tries substitutes for the missing
//! outputs; `outputsSubstituted` queues the inputs; `tryToBuild`
//! negotiates with the build hook, acquires the output locks and forks
//! the builder; `buildDone` reaps the child, scans and registers the
//! outputs.

use std::collections::BTreeSet;
use std::fs::File;
use std::os::unix::fs::PermissionsExt as _;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use silo_store_core::archive;
use silo_store_core::hash::{hash_reader, HashAlgo};
use silo_store_core::{Derivation, StorePath};
use tempfile::TempDir;
use tracing::{debug, error, info};

use crate::canonicalise::canonicalise_path_metadata;
use crate::error::{Error, IoContext, Result};
use crate::references::scan_for_references;
use crate::store::{delete_path, show_paths, RegisterPathParams};

use super::hook::{self, HookComm, HookReply};
use super::{describe_status, Goal, GoalId, GoalKind, StepResult, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    HaveDerivation,
    OutputsSubstituted,
    InputsRealised,
    TryToBuild,
    BuildDone,
}

pub(crate) struct DerivationGoal {
    pub drv_path: StorePath,
    /// Loaded in `haveDerivation`.
    pub drv: Option<Derivation>,
    state: State,
    /// Held from `prepareBuild` until the outputs are registered.
    output_locks: Option<crate::pathlocks::PathLocks>,
    /// Closure of all immediate inputs.
    pub input_paths: BTreeSet<StorePath>,
    /// Input closure plus the outputs: the reference-scan candidates.
    all_paths: BTreeSet<StorePath>,
    /// Builder working directory, or the hook communication directory.
    pub tmp_dir: Option<TempDir>,
    pub log_file: Option<File>,
    pub pid: Option<u32>,
    pub hook: Option<HookComm>,
}

impl DerivationGoal {
    pub fn new(drv_path: StorePath) -> DerivationGoal {
        DerivationGoal {
            drv_path,
            drv: None,
            state: State::Init,
            output_locks: None,
            input_paths: BTreeSet::new(),
            all_paths: BTreeSet::new(),
            tmp_dir: None,
            log_file: None,
            pid: None,
            hook: None,
        }
    }
}

/// Project the derivation payload out of a checked-out goal.
pub(crate) fn drv(goal: &mut Goal) -> &mut DerivationGoal {
    match &mut goal.kind {
        GoalKind::Derivation(d) => d,
        GoalKind::Substitution(_) => unreachable!("derivation step on a substitution goal"),
    }
}

pub(crate) fn step(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    match drv(goal).state {
        State::Init => init(goal, worker, id),
        State::HaveDerivation => have_derivation(goal, worker, id),
        State::OutputsSubstituted => outputs_substituted(goal, worker, id),
        State::InputsRealised => inputs_realised(goal, worker, id),
        State::TryToBuild => try_to_build(goal, worker, id),
        State::BuildDone => build_done(goal, worker, id),
    }
}

/// The derivation file itself may have to be substituted first.
fn init(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let drv_path = drv(goal).drv_path.clone();
    debug!("building of `{drv_path}`: init");

    let waitee = worker.make_substitution_goal(drv_path);
    worker.add_waitee(id, goal, waitee);

    drv(goal).state = State::HaveDerivation;
    Ok(StepResult::Continue)
}

fn have_derivation(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let drv_path = drv(goal).drv_path.clone();
    debug!("building of `{drv_path}`: loading derivation");

    if goal.nr_failed != 0 {
        worker.record_failure(format!("cannot build missing derivation `{drv_path}`"));
        return Ok(StepResult::Done(false));
    }

    let derivation = worker.store.read_derivation(&drv_path)?;
    let invalid = invalid_outputs(worker, &derivation)?;
    if invalid.is_empty() {
        return Ok(StepResult::Done(true));
    }

    // Try substitutes for the missing outputs before resorting to a
    // build. Outputs without substitutes get no goal at all.
    for output in &invalid {
        if worker.store.has_substitutes(output)? {
            let waitee = worker.make_substitution_goal(output.clone());
            worker.add_waitee(id, goal, waitee);
        }
    }

    drv(goal).drv = Some(derivation);
    drv(goal).state = State::OutputsSubstituted;
    if goal.waitees.is_empty() {
        // No wake-up event will come; carry on directly.
        return outputs_substituted(goal, worker, id);
    }
    Ok(StepResult::Continue)
}

fn outputs_substituted(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let drv_path = drv(goal).drv_path.clone();
    debug!("building of `{drv_path}`: all outputs substituted (maybe)");

    if goal.nr_failed > 0 && !worker.store.settings().try_fallback {
        return Err(Error::Other(format!(
            "some substitutes for the outputs of derivation `{drv_path}` failed; \
             try `--fallback'"
        )));
    }
    goal.nr_failed = 0;

    let derivation = drv(goal).drv.clone().expect("derivation loaded");
    if invalid_outputs(worker, &derivation)?.is_empty() {
        return Ok(StepResult::Done(true));
    }

    // Build it is. The inputs come first.
    for input_drv in derivation.input_drvs.keys() {
        let waitee = worker.make_derivation_goal(input_drv.clone());
        worker.add_waitee(id, goal, waitee);
    }
    for input_src in &derivation.input_srcs {
        let waitee = worker.make_substitution_goal(input_src.clone());
        worker.add_waitee(id, goal, waitee);
    }

    drv(goal).state = State::InputsRealised;
    if goal.waitees.is_empty() {
        return inputs_realised(goal, worker, id);
    }
    Ok(StepResult::Continue)
}

fn inputs_realised(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let drv_path = drv(goal).drv_path.clone();
    debug!("building of `{drv_path}`: all inputs realised");

    if goal.nr_failed != 0 {
        worker.record_failure(format!(
            "cannot build derivation `{drv_path}`: {} inputs could not be realised",
            goal.nr_failed
        ));
        return Ok(StepResult::Done(false));
    }

    // No build slot needed yet; the hook might take the job.
    drv(goal).state = State::TryToBuild;
    worker.wake_up(id);
    Ok(StepResult::Continue)
}

fn try_to_build(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    match try_to_build_inner(goal, worker, id) {
        Err(Error::Build(msg)) => {
            worker.record_failure(msg);
            Ok(StepResult::Done(false))
        }
        other => other,
    }
}

fn try_to_build_inner(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let drv_path = drv(goal).drv_path.clone();
    debug!("building of `{drv_path}`: trying to build");

    match hook::try_build_hook(goal, worker, id)? {
        HookReply::Accept => {
            // The hook builds; wait for EOF on its log pipe.
            drv(goal).state = State::BuildDone;
            return Ok(StepResult::Continue);
        }
        HookReply::Postpone => {
            worker.wait_for_build_slot(id, true)?;
            return Ok(StepResult::Continue);
        }
        HookReply::AlreadyDone => return Ok(StepResult::Done(true)),
        HookReply::Decline => {}
    }

    if !worker.can_build_more() {
        worker.wait_for_build_slot(id, false)?;
        return Ok(StepResult::Continue);
    }

    // Under the output locks it may turn out someone else already built
    // this derivation.
    if !prepare_build(goal, worker)? {
        return Ok(StepResult::Done(true));
    }

    start_builder(goal, worker, id)?;
    drv(goal).state = State::BuildDone;
    Ok(StepResult::Continue)
}

/// Acquire the output locks and gather the input closure. Returns
/// `false` when the outputs became valid while we waited for the locks
/// (someone else built them; reuse their work).
pub(crate) fn prepare_build(goal: &mut Goal, worker: &mut Worker<'_>) -> Result<bool> {
    let derivation = drv(goal).drv.clone().expect("derivation loaded");
    let drv_path = drv(goal).drv_path.clone();
    let outputs = derivation.output_paths();

    let mut locks = crate::pathlocks::PathLocks::lock(outputs.iter().map(|p| p.as_path()))?;

    let mut nr_valid = 0;
    for output in &outputs {
        if worker.store.is_valid_path(output)? {
            nr_valid += 1;
        }
    }
    if nr_valid == outputs.len() {
        debug!("skipping build of derivation `{drv_path}`, someone beat us to it");
        locks.set_deletion(true);
        return Ok(false);
    }
    if nr_valid > 0 {
        return Err(Error::Other(format!(
            "derivation `{drv_path}` is blocked by its output paths"
        )));
    }
    drv(goal).output_locks = Some(locks);

    // Full input closure: the relevant output closures of every input
    // derivation, plus the closures of the direct sources.
    let mut input_paths = BTreeSet::new();
    for (input_drv_path, wanted_outputs) in &derivation.input_drvs {
        if !worker.store.is_valid_path(input_drv_path)? {
            return Err(Error::Other(format!(
                "input derivation `{input_drv_path}` of `{drv_path}` is not valid"
            )));
        }
        let input_drv = worker.store.read_derivation(input_drv_path)?;
        for name in wanted_outputs {
            match input_drv.outputs.get(name) {
                Some(output) => {
                    worker.store.compute_fs_closure(&output.path, &mut input_paths)?;
                }
                None => {
                    return Err(Error::Other(format!(
                        "derivation `{drv_path}` requires non-existent output `{name}` \
                         from input derivation `{input_drv_path}`"
                    )))
                }
            }
        }
    }
    for input_src in &derivation.input_srcs {
        worker.store.compute_fs_closure(input_src, &mut input_paths)?;
    }
    debug!("added input paths {}", show_paths(input_paths.iter()));

    let d = drv(goal);
    d.all_paths = outputs.union(&input_paths).cloned().collect();
    d.input_paths = input_paths;
    Ok(true)
}

fn start_builder(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<()> {
    let derivation = drv(goal).drv.clone().expect("derivation loaded");
    let drv_path = drv(goal).drv_path.clone();
    let outputs = derivation.output_paths();

    info!("building path(s) {}", show_paths(outputs.iter()));

    let settings = worker.store.settings();
    if derivation.platform != settings.platform {
        return Err(Error::Build(format!(
            "a `{}` is required to build `{drv_path}`, but I am a `{}`",
            derivation.platform, settings.platform
        )));
    }

    // Stray files at output locations are garbage from interrupted runs;
    // a *registered* output here would be a bug, prepareBuild ruled it
    // out.
    for output in &outputs {
        if output.as_path().symlink_metadata().is_ok() {
            debug!("removing unregistered path `{output}`");
            delete_path(output.as_path())?;
        }
    }

    let tmp_dir = tempfile::Builder::new()
        .prefix("silo-build-")
        .tempdir()
        .io_context(|| "creating build directory".to_string())?;

    // The builder sees only a scrubbed environment; the derivation's own
    // bindings are overlaid last and win.
    let mut env = std::collections::BTreeMap::new();
    env.insert("PATH".to_string(), "/path-not-set".to_string());
    env.insert("HOME".to_string(), "/homeless-shelter".to_string());
    env.insert(
        "NIX_STORE".to_string(),
        worker.store.store_dir().to_string(),
    );
    let tmp_str = tmp_dir.path().to_string_lossy().into_owned();
    for var in ["NIX_BUILD_TOP", "TMPDIR", "TEMPDIR", "TMP", "TEMP"] {
        env.insert(var.to_string(), tmp_str.clone());
    }
    for (key, value) in &derivation.env {
        env.insert(key.clone(), value.clone());
    }

    let log_file = File::create(worker.store.log_file_for(&drv_path))
        .io_context(|| format!("creating log file for `{drv_path}`"))?;
    let (log_read, log_write) =
        pipe2(OFlag::O_CLOEXEC).io_context(|| "creating builder log pipe".to_string())?;

    debug!("executing builder `{}`", derivation.builder);
    let builder_base = Path::new(&derivation.builder)
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| derivation.builder.clone().into());

    let mut cmd = Command::new(&derivation.builder);
    cmd.arg0(builder_base)
        .args(&derivation.args)
        .env_clear()
        .envs(&env)
        .current_dir(tmp_dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::from(
            log_write
                .try_clone()
                .io_context(|| "duplicating builder log pipe".to_string())?,
        ))
        .stderr(Stdio::from(log_write))
        .process_group(0);

    let child = cmd.spawn().map_err(|e| {
        Error::Build(format!(
            "cannot execute builder `{}` for `{drv_path}`: {e}",
            derivation.builder
        ))
    })?;

    let d = drv(goal);
    d.tmp_dir = Some(tmp_dir);
    d.log_file = Some(log_file);
    d.pid = Some(child.id());
    worker.child_started(id, child, File::from(log_read), true);
    Ok(())
}

/// EOF on the log pipe: the builder (or hook) is presumed gone.
fn build_done(goal: &mut Goal, worker: &mut Worker<'_>, _id: GoalId) -> Result<StepResult> {
    let drv_path = drv(goal).drv_path.clone();
    debug!("building of `{drv_path}`: build done");

    let pid = drv(goal)
        .pid
        .take()
        .ok_or_else(|| Error::Other(format!("no child recorded for `{drv_path}`")))?;
    let mut child = worker.take_child(pid, true)?;
    let status = child
        .process
        .wait()
        .io_context(|| format!("waiting for builder of `{drv_path}`"))?;
    drop(child);

    let d = drv(goal);
    d.log_file = None;
    d.hook = None;

    if !status.success() {
        delete_tmp_dir(goal, worker, false);
        worker.record_failure(format!(
            "builder for `{drv_path}` {}",
            describe_status(status)
        ));
        return Ok(StepResult::Done(false));
    }
    delete_tmp_dir(goal, worker, true);

    match compute_closure(goal, worker) {
        Ok(()) => Ok(StepResult::Done(true)),
        Err(Error::Build(msg)) => {
            worker.record_failure(msg);
            Ok(StepResult::Done(false))
        }
        Err(e) => Err(e),
    }
}

/// Validate, canonicalise, scan and register every output in one
/// transaction, so a crash registers either all outputs or none.
fn compute_closure(goal: &mut Goal, worker: &mut Worker<'_>) -> Result<()> {
    let derivation = drv(goal).drv.clone().expect("derivation loaded");
    let drv_path = drv(goal).drv_path.clone();
    let input_paths = drv(goal).input_paths.clone();
    let all_paths = drv(goal).all_paths.clone();
    debug!("determining closure for `{drv_path}`");

    let mut registrations = Vec::new();
    for output in derivation.outputs.values() {
        let path = &output.path;
        if path.as_path().symlink_metadata().is_err() {
            return Err(Error::Build(format!(
                "builder for `{drv_path}` failed to produce output path `{path}`"
            )));
        }

        // A fixed-output derivation promises the content of its single
        // output up front; hold it to that promise.
        if let Some(fixed) = &output.fixed {
            let meta = path
                .as_path()
                .symlink_metadata()
                .io_context(|| format!("getting attributes of `{path}`"))?;
            if !meta.is_file() || meta.permissions().mode() & 0o111 != 0 {
                return Err(Error::Build(format!(
                    "output path `{path}` should be a non-executable regular file"
                )));
            }
            let file = File::open(path.as_path())
                .io_context(|| format!("opening `{path}`"))?;
            let actual = hash_reader(fixed.algo, file)
                .io_context(|| format!("hashing `{path}`"))?;
            if actual != fixed.hash {
                return Err(Error::Build(format!(
                    "output path `{path}` should have {} hash `{}`, instead has `{}`",
                    fixed.algo,
                    fixed.hash.to_hex(),
                    actual.to_hex()
                )));
            }
        }

        canonicalise_path_metadata(path.as_path())?;

        let references = scan_for_references(path.as_path(), &all_paths)?;
        for input in &input_paths {
            if references.contains(input) {
                debug!("referenced input: `{input}`");
            } else {
                debug!("unreferenced input: `{input}`");
            }
        }

        let content_hash = archive::hash_path(HashAlgo::Sha256, path.as_path())?;
        registrations.push(RegisterPathParams {
            path: path.clone(),
            hash: content_hash,
            references,
            deriver: Some(drv_path.clone()),
        });
    }

    let txn = worker.store.begin()?;
    txn.register_valid_paths(&registrations)?;
    txn.commit()?;

    // Only now may the lock files disappear: everyone else will see
    // valid outputs and never try to lock them again.
    if let Some(locks) = &mut drv(goal).output_locks {
        locks.set_deletion(true);
    }
    Ok(())
}

fn delete_tmp_dir(goal: &mut Goal, worker: &Worker<'_>, force: bool) {
    let drv_path = drv(goal).drv_path.clone();
    if let Some(tmp_dir) = drv(goal).tmp_dir.take() {
        if worker.store.settings().keep_failed && !force {
            let kept = tmp_dir.keep();
            error!(
                "builder for `{drv_path}` failed; keeping build directory `{}`",
                kept.display()
            );
        }
    }
}

fn invalid_outputs(worker: &Worker<'_>, derivation: &Derivation) -> Result<Vec<StorePath>> {
    let mut invalid = Vec::new();
    for output in derivation.output_paths() {
        if !worker.store.is_valid_path(&output)? {
            invalid.push(output);
        }
    }
    Ok(invalid)
}
