// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! The state machine that realises one path through substitutes.
//!
//! ```text
//! init → referencesValid → tryNext → tryToRun → finished
//!                             ↑__________________|  (on failure)
//! ```
//!
//! The path's declared references are realised first (closure before
//! self), then each registered substitute is run in turn until one
//! produces the path. Substituted contents are canonicalised and hashed,
//! but not re-scanned: the references registered are the ones previously
//! declared in the metadata store.

use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use silo_store_core::archive;
use silo_store_core::hash::HashAlgo;
use silo_store_core::StorePath;
use silo_store_db::Substitute;
use tracing::{debug, info};

use crate::canonicalise::canonicalise_path_metadata;
use crate::error::{Error, IoContext, Result};
use crate::pathlocks::PathLocks;
use crate::store::{delete_path, RegisterPathParams};

use super::{describe_status, Goal, GoalId, GoalKind, StepResult, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    ReferencesValid,
    TryNext,
    TryToRun,
    Finished,
}

pub(crate) struct SubstitutionGoal {
    pub store_path: StorePath,
    /// Substitutes not yet tried, front first.
    subs: VecDeque<Substitute>,
    /// The substitute currently running.
    current: Option<Substitute>,
    /// References declared for this path; must be valid before we run.
    references: BTreeSet<StorePath>,
    lock: Option<PathLocks>,
    pid: Option<u32>,
    state: State,
}

impl SubstitutionGoal {
    pub fn new(store_path: StorePath) -> SubstitutionGoal {
        SubstitutionGoal {
            store_path,
            subs: VecDeque::new(),
            current: None,
            references: BTreeSet::new(),
            lock: None,
            pid: None,
            state: State::Init,
        }
    }
}

fn sub(goal: &mut Goal) -> &mut SubstitutionGoal {
    match &mut goal.kind {
        GoalKind::Substitution(s) => s,
        GoalKind::Derivation(_) => unreachable!("substitution step on a derivation goal"),
    }
}

pub(crate) fn step(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    match sub(goal).state {
        State::Init => init(goal, worker, id),
        State::ReferencesValid => references_valid(goal, worker, id),
        State::TryNext => try_next(goal, worker, id),
        State::TryToRun => try_to_run(goal, worker, id),
        State::Finished => finished(goal, worker, id),
    }
}

fn init(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let path = sub(goal).store_path.clone();
    debug!("substitution of `{path}`: init");

    if worker.store.is_valid_path(&path)? {
        return Ok(StepResult::Done(true));
    }

    sub(goal).subs = worker.store.query_substitutes(&path)?.into();

    // Realise the references first, so the closure invariant holds the
    // moment this path becomes valid. A path with no metadata at all has
    // nothing to wait for (and no substitutes; tryNext reports that).
    if worker.store.is_usable_path(&path)? {
        sub(goal).references = worker.store.query_references(&path)?;
    }
    let references = sub(goal).references.clone();
    for reference in &references {
        if *reference != path {
            let waitee = worker.make_substitution_goal(reference.clone());
            worker.add_waitee(id, goal, waitee);
        }
    }

    sub(goal).state = State::ReferencesValid;
    if goal.waitees.is_empty() {
        return references_valid(goal, worker, id);
    }
    Ok(StepResult::Continue)
}

fn references_valid(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let path = sub(goal).store_path.clone();
    debug!("substitution of `{path}`: all references realised");

    if goal.nr_failed > 0 {
        return Err(Error::Other(format!(
            "some references of path `{path}` could not be realised"
        )));
    }

    sub(goal).state = State::TryNext;
    try_next(goal, worker, id)
}

fn try_next(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let path = sub(goal).store_path.clone();
    debug!("substitution of `{path}`: trying next substitute");

    let Some(next) = sub(goal).subs.pop_front() else {
        worker.record_failure(format!(
            "path `{path}` is required, but it has no (remaining) substitutes"
        ));
        return Ok(StepResult::Done(false));
    };
    sub(goal).current = Some(next);

    sub(goal).state = State::TryToRun;
    worker.wait_for_build_slot(id, false)?;
    Ok(StepResult::Continue)
}

fn try_to_run(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let path = sub(goal).store_path.clone();
    debug!("substitution of `{path}`: trying to run");

    if !worker.can_build_more() {
        worker.wait_for_build_slot(id, false)?;
        return Ok(StepResult::Continue);
    }

    let mut lock = PathLocks::lock([path.as_path()])?;

    // Someone else may have produced the path while we waited.
    if worker.store.is_valid_path(&path)? {
        debug!("store path `{path}` has become valid");
        lock.set_deletion(true);
        return Ok(StepResult::Done(true));
    }
    sub(goal).lock = Some(lock);

    let substitute = sub(goal).current.clone().expect("substitute selected");
    info!(
        "substituting path `{path}` using substituter `{}`",
        substitute.program
    );

    // Stale leftovers from an interrupted run.
    if path.as_path().symlink_metadata().is_ok() {
        delete_path(path.as_path())?;
    }

    let (log_read, log_write) =
        pipe2(OFlag::O_CLOEXEC).io_context(|| "creating substituter log pipe".to_string())?;

    let program_base = Path::new(&substitute.program)
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| substitute.program.clone().into());

    let mut cmd = Command::new(&substitute.program);
    cmd.arg0(program_base)
        .arg(path.as_str())
        .args(&substitute.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(
            log_write
                .try_clone()
                .io_context(|| "duplicating substituter log pipe".to_string())?,
        ))
        .stderr(Stdio::from(log_write))
        .process_group(0);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            info!(
                "substitution of path `{path}` using substituter `{}` failed: {e}",
                substitute.program
            );
            sub(goal).lock = None;
            sub(goal).state = State::TryNext;
            worker.wake_up(id);
            return Ok(StepResult::Continue);
        }
    };

    sub(goal).pid = Some(child.id());
    worker.child_started(id, child, File::from(log_read), true);

    sub(goal).state = State::Finished;
    Ok(StepResult::Continue)
}

fn finished(goal: &mut Goal, worker: &mut Worker<'_>, id: GoalId) -> Result<StepResult> {
    let path = sub(goal).store_path.clone();
    debug!("substitution of `{path}`: substitute finished");

    let pid = sub(goal)
        .pid
        .take()
        .ok_or_else(|| Error::Other(format!("no substituter recorded for `{path}`")))?;
    let mut child = worker.take_child(pid, true)?;
    let status = child
        .process
        .wait()
        .io_context(|| format!("waiting for substituter of `{path}`"))?;
    drop(child);

    let substitute = sub(goal).current.clone().expect("substitute selected");

    let outcome = if !status.success() {
        Err(Error::Subst(format!(
            "substituter for `{path}` {}",
            describe_status(status)
        )))
    } else if path.as_path().symlink_metadata().is_err() {
        Err(Error::Subst(format!(
            "substitute did not produce path `{path}`"
        )))
    } else {
        Ok(())
    };

    if let Err(e) = outcome {
        info!(
            "substitution of path `{path}` using substituter `{}` failed: {e}",
            substitute.program
        );
        // Release the lock before the next round re-acquires it.
        sub(goal).lock = None;
        sub(goal).state = State::TryNext;
        worker.wake_up(id);
        return Ok(StepResult::Continue);
    }

    canonicalise_path_metadata(path.as_path())?;
    let content_hash = archive::hash_path(HashAlgo::Sha256, path.as_path())?;

    let deriver = match substitute.deriver.as_str() {
        "" => None,
        d => Some(worker.store.store_dir().parse(d)?),
    };
    let references = sub(goal).references.clone();

    let txn = worker.store.begin()?;
    txn.register_valid_path(&RegisterPathParams {
        path: path.clone(),
        hash: content_hash,
        references,
        deriver,
    })?;
    txn.commit()?;

    if let Some(lock) = &mut sub(goal).lock {
        lock.set_deletion(true);
    }

    debug!("substitution of path `{path}` succeeded");
    Ok(StepResult::Done(true))
}
