// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! The goal scheduler.
//!
//! A single-threaded cooperative loop owns a population of goals, each a
//! small state machine working towards "this derivation is built" or
//! "this path is substituted". Goals suspend by waiting on other goals,
//! by parking for a build slot, or by awaiting EOF on a child's log pipe;
//! the loop multiplexes those pipes with `poll` and never blocks on a
//! single child. All parallelism is child processes (builders,
//! substituters, hooks) — nothing here shares memory across threads.
//!
//! Goals live in an id-indexed arena; the waitee/waiter edges between
//! them are plain ids, so completed goals simply drop out of the arena
//! and stale edges resolve to nothing.

pub(crate) mod derivation_goal;
pub(crate) mod hook;
pub(crate) mod substitution_goal;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{Read as _, Write as _};
use std::os::fd::AsFd as _;
use std::os::unix::process::ExitStatusExt as _;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use silo_store_core::StorePath;
use tracing::{debug, error};

use crate::error::{Error, IoContext, Result};
use crate::interrupt::check_interrupt;
use crate::store::LocalStore;

use derivation_goal::DerivationGoal;
use substitution_goal::SubstitutionGoal;

/// Handle to a goal in the worker's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GoalId(u64);

pub(crate) enum GoalKind {
    Derivation(DerivationGoal),
    Substitution(SubstitutionGoal),
}

pub(crate) struct Goal {
    pub kind: GoalKind,
    /// Goals this one is blocked on.
    pub waitees: HashSet<GoalId>,
    /// Goals blocked on this one.
    pub waiters: HashSet<GoalId>,
    /// How many waitees finished unsuccessfully.
    pub nr_failed: u32,
}

impl Goal {
    fn new(kind: GoalKind) -> Goal {
        Goal {
            kind,
            waitees: HashSet::new(),
            waiters: HashSet::new(),
            nr_failed: 0,
        }
    }

    pub fn name(&self) -> String {
        match &self.kind {
            GoalKind::Derivation(d) => format!("building of `{}`", d.drv_path),
            GoalKind::Substitution(s) => format!("substitution of `{}`", s.store_path),
        }
    }
}

/// What a state transition decided.
pub(crate) enum StepResult {
    /// The goal installed a new state and is waiting for something.
    Continue,
    /// The goal finished, successfully or not.
    Done(bool),
}

/// A running child process whose log pipe the loop multiplexes.
pub(crate) struct Child {
    pub goal: GoalId,
    pub process: std::process::Child,
    /// Read side of the merged stdout/stderr pipe. EOF means the child
    /// is gone (or, pathologically, closed its own stderr).
    pub log: File,
    /// Build hooks run outside the build-slot budget.
    pub in_build_slot: bool,
}

pub struct Worker<'s> {
    pub(crate) store: &'s mut LocalStore,
    goals: HashMap<GoalId, Goal>,
    next_id: u64,
    top_goals: HashSet<GoalId>,
    top_failed: bool,
    awake: BTreeSet<GoalId>,
    wanting_to_build: BTreeSet<GoalId>,
    children: HashMap<u32, Child>,
    /// Children currently occupying build slots (hooks excluded).
    nr_build_slots: u32,
    derivation_goals: HashMap<StorePath, GoalId>,
    substitution_goals: HashMap<StorePath, GoalId>,
    /// One human-readable message per failed goal, for the caller's
    /// aggregate error.
    failures: Vec<String>,
}

impl<'s> Worker<'s> {
    pub fn new(store: &'s mut LocalStore) -> Worker<'s> {
        Worker {
            store,
            goals: HashMap::new(),
            next_id: 0,
            top_goals: HashSet::new(),
            top_failed: false,
            awake: BTreeSet::new(),
            wanting_to_build: BTreeSet::new(),
            children: HashMap::new(),
            nr_build_slots: 0,
            derivation_goals: HashMap::new(),
            substitution_goals: HashMap::new(),
            failures: Vec::new(),
        }
    }

    /// Report a per-goal failure: logged immediately, and folded into
    /// the aggregate error the caller sees.
    pub(crate) fn record_failure(&mut self, message: String) {
        error!("{message}");
        self.failures.push(message);
    }

    /// The failure messages collected during [`Worker::run`].
    pub fn take_failures(&mut self) -> Vec<String> {
        std::mem::take(&mut self.failures)
    }

    fn insert_goal(&mut self, kind: GoalKind) -> GoalId {
        let id = GoalId(self.next_id);
        self.next_id += 1;
        self.goals.insert(id, Goal::new(kind));
        self.wake_up(id);
        id
    }

    /// Goal for building `drv_path`, de-duplicated per path so two
    /// waiters can never race for the same output locks.
    pub fn make_derivation_goal(&mut self, drv_path: StorePath) -> GoalId {
        if let Some(id) = self.derivation_goals.get(&drv_path) {
            return *id;
        }
        let id = self.insert_goal(GoalKind::Derivation(DerivationGoal::new(drv_path.clone())));
        self.derivation_goals.insert(drv_path, id);
        id
    }

    /// Goal for making `path` valid via substitution, de-duplicated.
    pub fn make_substitution_goal(&mut self, path: StorePath) -> GoalId {
        if let Some(id) = self.substitution_goals.get(&path) {
            return *id;
        }
        let id = self.insert_goal(GoalKind::Substitution(SubstitutionGoal::new(path.clone())));
        self.substitution_goals.insert(path, id);
        id
    }

    /// Block `waiter` (currently checked out of the arena as `goal`) on
    /// `waitee`.
    pub(crate) fn add_waitee(&mut self, waiter: GoalId, goal: &mut Goal, waitee: GoalId) {
        if waitee == waiter {
            return;
        }
        goal.waitees.insert(waitee);
        if let Some(other) = self.goals.get_mut(&waitee) {
            other.waiters.insert(waiter);
        }
    }

    pub(crate) fn wake_up(&mut self, id: GoalId) {
        self.awake.insert(id);
    }

    pub(crate) fn can_build_more(&self) -> bool {
        self.nr_build_slots < self.store.settings().max_build_jobs
    }

    pub(crate) fn child_started(
        &mut self,
        goal: GoalId,
        process: std::process::Child,
        log: File,
        in_build_slot: bool,
    ) {
        let pid = process.id();
        if in_build_slot {
            self.nr_build_slots += 1;
        }
        self.children.insert(
            pid,
            Child {
                goal,
                process,
                log,
                in_build_slot,
            },
        );
    }

    /// Deregister a child for reaping. Unless the child was torn down as
    /// uninteresting (a declined hook), any goal parked for a build slot
    /// gets another chance.
    pub(crate) fn take_child(&mut self, pid: u32, wake_sleepers: bool) -> Result<Child> {
        let child = self
            .children
            .remove(&pid)
            .ok_or_else(|| Error::Other(format!("unknown child process {pid}")))?;
        if child.in_build_slot {
            self.nr_build_slots -= 1;
        }
        if wake_sleepers {
            let sleepers: Vec<GoalId> = self.wanting_to_build.iter().copied().collect();
            self.wanting_to_build.clear();
            for id in sleepers {
                self.wake_up(id);
            }
        }
        Ok(child)
    }

    /// Park `id` until a build slot frees up. With `really_wait`, the
    /// goal insists on an actual child exiting first — a hook that says
    /// "postpone" while nothing is running would otherwise sleep forever.
    pub(crate) fn wait_for_build_slot(&mut self, id: GoalId, really_wait: bool) -> Result<()> {
        debug!("wait for build slot");
        if really_wait && self.children.is_empty() {
            return Err(Error::Other(
                "waiting for a build slot, yet there are no children - \
                 maybe the build hook gave an inappropriate `postpone' reply?"
                    .into(),
            ));
        }
        if !really_wait && self.can_build_more() {
            self.wake_up(id);
        } else {
            self.wanting_to_build.insert(id);
        }
        Ok(())
    }

    /// Run the loop until every goal in `tops` has finished. Returns
    /// whether all of them succeeded.
    pub fn run(&mut self, tops: &[GoalId]) -> Result<bool> {
        self.top_goals = tops.iter().copied().collect();
        self.top_failed = false;

        debug!("entered goal loop");
        loop {
            check_interrupt()?;

            while let Some(id) = self.awake.pop_first() {
                check_interrupt()?;
                self.work(id)?;
            }

            if self.top_goals.is_empty() {
                break;
            }

            if self.children.is_empty() {
                return Err(Error::Other(
                    "scheduler stalled: goals remain but no children are running".into(),
                ));
            }
            self.wait_for_input()?;
        }

        Ok(!self.top_failed)
    }

    /// Drive one goal's current state function.
    fn work(&mut self, id: GoalId) -> Result<()> {
        // The goal is checked out of the arena while it runs, so its
        // state function can freely borrow the worker.
        let Some(mut goal) = self.goals.remove(&id) else {
            return Ok(());
        };
        let is_derivation = matches!(goal.kind, GoalKind::Derivation(_));
        let result = if is_derivation {
            derivation_goal::step(&mut goal, self, id)
        } else {
            substitution_goal::step(&mut goal, self, id)
        };
        match result {
            Ok(StepResult::Continue) => {
                self.goals.insert(id, goal);
                Ok(())
            }
            Ok(StepResult::Done(success)) => self.finish_goal(id, goal, success),
            Err(e) => {
                // Check the goal back in so teardown still sees it.
                self.goals.insert(id, goal);
                Err(e)
            }
        }
    }

    fn finish_goal(&mut self, id: GoalId, mut goal: Goal, success: bool) -> Result<()> {
        debug!("{}: done", goal.name());
        let keep_going = self.store.settings().keep_going;

        let waiters: Vec<GoalId> = goal.waiters.drain().collect();
        for waiter_id in waiters {
            let mut detached = Vec::new();
            {
                let Some(waiter) = self.goals.get_mut(&waiter_id) else {
                    continue;
                };
                waiter.waitees.remove(&id);
                if !success {
                    waiter.nr_failed += 1;
                }
                if waiter.waitees.is_empty() || (!success && !keep_going) {
                    // A failure without keep-going wakes the waiter now;
                    // it must stop watching its remaining waitees.
                    detached.extend(waiter.waitees.drain());
                } else {
                    continue;
                }
            }
            for other_id in detached {
                if let Some(other) = self.goals.get_mut(&other_id) {
                    other.waiters.remove(&waiter_id);
                }
            }
            self.wake_up(waiter_id);
        }

        match &goal.kind {
            GoalKind::Derivation(d) => {
                self.derivation_goals.remove(&d.drv_path);
            }
            GoalKind::Substitution(s) => {
                self.substitution_goals.remove(&s.store_path);
            }
        }
        if self.top_goals.remove(&id) && !success {
            self.top_failed = true;
        }
        self.awake.remove(&id);
        self.wanting_to_build.remove(&id);
        Ok(())
    }

    /// Block in `poll` over the children's log pipes. Data is forwarded
    /// to the owning goal's log sink; EOF wakes the goal so its state
    /// function can reap the child.
    fn wait_for_input(&mut self) -> Result<()> {
        let pids: Vec<u32> = self.children.keys().copied().collect();
        {
            let mut fds: Vec<PollFd> = pids
                .iter()
                .map(|pid| PollFd::new(self.children[pid].log.as_fd(), PollFlags::POLLIN))
                .collect();
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => {
                    return Err(Error::Sys {
                        context: "waiting for input from children".into(),
                        source: std::io::Error::from(e),
                    })
                }
            }
            // Keep only the pids whose pipe has something to say.
            let mut ready = Vec::new();
            for (pid, fd) in pids.iter().zip(&fds) {
                let readable = fd.revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                });
                if readable {
                    ready.push(*pid);
                }
            }
            drop(fds);

            for pid in ready {
                check_interrupt()?;
                let (goal_id, data) = {
                    let child = self.children.get(&pid).expect("child still registered");
                    let mut buf = [0u8; 4096];
                    match (&child.log).read(&mut buf) {
                        Ok(0) => (child.goal, None),
                        Ok(n) => (child.goal, Some(buf[..n].to_vec())),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            return Err(Error::Sys {
                                context: format!("reading log output of child {pid}"),
                                source: e,
                            })
                        }
                    }
                };
                match data {
                    None => {
                        if let Some(goal) = self.goals.get(&goal_id) {
                            debug!("{}: got EOF", goal.name());
                        }
                        self.wake_up(goal_id);
                    }
                    Some(data) => self.write_goal_log(goal_id, &data)?,
                }
            }
        }
        Ok(())
    }

    fn write_goal_log(&mut self, id: GoalId, data: &[u8]) -> Result<()> {
        if self.store.settings().print_build_output {
            let _ = std::io::stderr().write_all(data);
        }
        if let Some(goal) = self.goals.get_mut(&id) {
            if let GoalKind::Derivation(d) = &mut goal.kind {
                let drv_path = &d.drv_path;
                if let Some(log) = &mut d.log_file {
                    log.write_all(data)
                        .io_context(|| format!("writing build log for `{drv_path}`"))?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        // Tear down whatever is still running: signal each child's whole
        // process group, then reap. Never propagate errors from here.
        for (pid, child) in self.children.drain() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            let mut process = child.process;
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

/// Human-readable rendering of a child exit status.
pub(crate) fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("failed with exit code {code}"),
        (None, Some(sig)) => format!("was killed by signal {sig}"),
        (None, None) => "exited abnormally".into(),
    }
}
