// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! The build hook protocol.
//!
//! Before building locally, the coordinator offers every derivation to an
//! external hook (`build_hook` in the settings, usually a program that
//! forwards builds to other machines). The hook is spawned with
//!
//! ```text
//! argv = [hook, canBuildLocally, localSystem, drvPlatform, drvPath]
//! ```
//!
//! and two extra pipes: it writes its verdict on fd 3 and reads the
//! go-ahead on fd 4. A first line of `decline`, `postpone` or `accept`
//! decides what happens; on `accept` the coordinator shares the input
//! and output sets through files in a temporary directory, answers
//! `okay` (or `cancel` if someone else finished the build in the
//! meantime), and waits for the hook's log pipe to reach EOF.

use std::fs::{self, File};
use std::io::{Read as _, Write as _};
use std::os::fd::{AsRawFd as _, OwnedFd, RawFd};
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use silo_store_core::StorePath;
use tracing::{debug, info};

use crate::error::{Error, IoContext, Result};
use crate::store::show_paths;

use super::derivation_goal::{self, prepare_build};
use super::{Goal, GoalId, Worker};

/// First-line verdict of the hook, plus the outcome where the hook never
/// ran or the work turned out to be already done.
pub(crate) enum HookReply {
    /// Hook takes the build; wait for its log EOF.
    Accept,
    /// Retry after any child exits.
    Postpone,
    /// Build locally.
    Decline,
    /// Outputs became valid while negotiating; nothing to do.
    AlreadyDone,
}

/// Parent-side ends of the hook control pipes.
pub(crate) struct HookComm {
    pub to_hook: File,
    pub from_hook: File,
}

/// Offer the goal's derivation to the configured hook, if any.
pub(crate) fn try_build_hook(
    goal: &mut Goal,
    worker: &mut Worker<'_>,
    id: GoalId,
) -> Result<HookReply> {
    let Some(hook_path) = worker.store.settings().build_hook.clone() else {
        return Ok(HookReply::Decline);
    };

    let d = derivation_goal::drv(goal);
    let drv_path = d.drv_path.clone();
    let derivation = d.drv.clone().expect("derivation loaded before hook");

    // Directory for the files shared with an accepting hook.
    let comm_dir = tempfile::Builder::new()
        .prefix("silo-hook-")
        .tempdir()
        .io_context(|| "creating hook communication directory".to_string())?;

    let log_file = File::create(worker.store.log_file_for(&drv_path))
        .io_context(|| format!("creating log file for `{drv_path}`"))?;
    let (log_read, log_write) =
        pipe2(OFlag::O_CLOEXEC).io_context(|| "creating hook log pipe".to_string())?;

    let local_platform = worker.store.settings().platform.clone();
    let can_build_locally =
        worker.can_build_more() && derivation.platform == local_platform;

    let (process, comm) = spawn_hook(
        &hook_path,
        can_build_locally,
        &local_platform,
        &derivation.platform,
        &drv_path,
        comm_dir.path(),
        log_write,
    )?;
    let pid = process.id();

    {
        let d = derivation_goal::drv(goal);
        d.tmp_dir = Some(comm_dir);
        d.log_file = Some(log_file);
        d.pid = Some(pid);
        d.hook = Some(comm);
    }
    worker.child_started(id, process, File::from(log_read), false);

    // The hook is expected to answer before producing serious log
    // volume; the log pipe is drained only after the verdict.
    let reply = read_line(&mut derivation_goal::drv(goal).hook.as_mut().unwrap().from_hook)?;
    debug!("hook reply is `{reply}`");

    match reply.as_str() {
        "decline" => {
            terminate_hook(goal, worker, pid)?;
            Ok(HookReply::Decline)
        }
        "postpone" => {
            terminate_hook(goal, worker, pid)?;
            Ok(HookReply::Postpone)
        }
        "accept" => {
            if !prepare_build(goal, worker)? {
                let d = derivation_goal::drv(goal);
                write_line(&mut d.hook.as_mut().unwrap().to_hook, "cancel")?;
                terminate_hook(goal, worker, pid)?;
                return Ok(HookReply::AlreadyDone);
            }

            write_build_files(goal, worker)?;

            info!(
                "running hook to build path(s) {}",
                show_paths(derivation.output_paths().iter())
            );
            let d = derivation_goal::drv(goal);
            write_line(&mut d.hook.as_mut().unwrap().to_hook, "okay")?;
            Ok(HookReply::Accept)
        }
        other => Err(Error::Other(format!("bad hook reply `{other}`"))),
    }
}

/// Share the build's inputs, outputs, and the reference graph of the
/// inputs with an accepting hook.
fn write_build_files(goal: &mut Goal, worker: &mut Worker<'_>) -> Result<()> {
    let d = derivation_goal::drv(goal);
    let derivation = d.drv.clone().expect("derivation loaded");
    let input_paths = d.input_paths.clone();
    let dir = d
        .tmp_dir
        .as_ref()
        .expect("hook communication directory exists")
        .path()
        .to_owned();

    let mut inputs = String::new();
    for path in input_paths.iter().chain(derivation.input_drvs.keys()) {
        inputs.push_str(path.as_str());
        inputs.push('\n');
    }
    fs::write(dir.join("inputs"), inputs)
        .io_context(|| "writing hook inputs file".to_string())?;

    let mut outputs = String::new();
    for path in derivation.output_paths() {
        outputs.push_str(path.as_str());
        outputs.push('\n');
    }
    fs::write(dir.join("outputs"), outputs)
        .io_context(|| "writing hook outputs file".to_string())?;

    // Adjacency list: each input followed by its direct references.
    let mut references = String::new();
    for path in &input_paths {
        references.push_str(path.as_str());
        for reference in worker.store.query_references(path)? {
            references.push(' ');
            references.push_str(reference.as_str());
        }
        references.push('\n');
    }
    fs::write(dir.join("references"), references)
        .io_context(|| "writing hook references file".to_string())?;

    Ok(())
}

/// Reap a hook that is not going to build (decline/postpone/cancel).
fn terminate_hook(goal: &mut Goal, worker: &mut Worker<'_>, pid: u32) -> Result<()> {
    debug!("terminating build hook");
    let mut child = worker.take_child(pid, false)?;

    // Whatever the hook logged still belongs in the build log.
    let mut rest = Vec::new();
    let _ = child.log.read_to_end(&mut rest);
    let d = derivation_goal::drv(goal);
    if let Some(log) = &mut d.log_file {
        let _ = log.write_all(&rest);
    }

    let _ = child.process.wait();

    d.hook = None;
    d.log_file = None;
    d.pid = None;
    d.tmp_dir = None;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_hook(
    hook_path: &Path,
    can_build_locally: bool,
    local_platform: &str,
    drv_platform: &str,
    drv_path: &StorePath,
    comm_dir: &Path,
    log_write: OwnedFd,
) -> Result<(std::process::Child, HookComm)> {
    // Verdict pipe (hook's fd 3) and go-ahead pipe (hook's fd 4).
    let (from_read, from_write) =
        pipe2(OFlag::O_CLOEXEC).io_context(|| "creating hook reply pipe".to_string())?;
    let (to_read, to_write) =
        pipe2(OFlag::O_CLOEXEC).io_context(|| "creating hook control pipe".to_string())?;

    let mut cmd = Command::new(hook_path);
    cmd.arg(if can_build_locally { "1" } else { "0" })
        .arg(local_platform)
        .arg(drv_platform)
        .arg(drv_path.as_str())
        // The shared `inputs`/`outputs`/`references` files are found
        // relative to the hook's working directory.
        .current_dir(comm_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(
            log_write
                .try_clone()
                .io_context(|| "duplicating hook log pipe".to_string())?,
        ))
        .stderr(Stdio::from(log_write))
        .process_group(0);

    let reply_fd = from_write.as_raw_fd();
    let control_fd = to_read.as_raw_fd();
    // SAFETY: only async-signal-safe calls (dup2/fcntl) between fork and
    // exec.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(move || {
            install_fd(reply_fd, 3)?;
            install_fd(control_fd, 4)?;
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| Error::Sys {
        context: format!("executing build hook `{}`", hook_path.display()),
        source: e,
    })?;

    Ok((
        child,
        HookComm {
            to_hook: File::from(to_write),
            from_hook: File::from(from_read),
        },
    ))
}

/// Make `fd` available as `target` across the coming exec.
fn install_fd(fd: RawFd, target: RawFd) -> std::io::Result<()> {
    #[allow(unsafe_code)]
    if fd == target {
        // Already in place; just clear close-on-exec.
        let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let ret = unsafe { libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
    } else {
        let ret = unsafe { libc::dup2(fd, target) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read one newline-terminated line, byte by byte.
pub(crate) fn read_line(file: &mut File) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = file
            .read(&mut byte)
            .io_context(|| "reading a line from the build hook".to_string())?;
        if n == 0 {
            return Err(Error::Other("unexpected EOF from the build hook".into()));
        }
        if byte[0] == b'\n' {
            return String::from_utf8(line)
                .map_err(|_| Error::Other("build hook sent a non-UTF-8 reply".into()));
        }
        line.push(byte[0]);
    }
}

pub(crate) fn write_line(file: &mut File, line: &str) -> Result<()> {
    file.write_all(line.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .io_context(|| "writing to the build hook".to_string())
}
