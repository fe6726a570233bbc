//! Helper processes that build and enter containers.
//!
//! The `pkgjail` binary re-executes itself under two argv[0] names:
//!
//! - `pkgjail-init CONFIG CAPS -- ARGV...` creates the namespaces, assembles
//!   the root filesystem and execs the init process. It stays behind as a shim
//!   that reaps init, so killing the shim tears the container down.
//! - `pkgjail-exec PID CWD CAPS -- ARGV...` joins the namespaces and root of
//!   `PID`, then runs `ARGV` and mirrors its exit status.
//!
//! Both run before any thread is spawned, which `unshare(CLONE_NEWUSER)` and
//! `setns` into a user namespace require. Each writes exactly one
//! [`HelperStatus`] JSON line to fd 3.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::{CloneFlags, setns, unshare};
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, chroot, execv, fork, pipe2};
use serde::{Deserialize, Serialize};

use super::capabilities::{apply_capabilities, parse_capabilities};
use super::mounts;
use super::runtime::RuntimeConfig;
use super::spec::{IdMapping, NamespaceKind};
use crate::error::{SetupFailure, SetupStage};

pub const INIT_ARGV0: &str = "pkgjail-init";
pub const EXEC_ARGV0: &str = "pkgjail-exec";

/// Descriptor the helpers report their [`HelperStatus`] on.
pub const STATUS_FD: RawFd = 3;

/// The single line a helper writes to [`STATUS_FD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum HelperStatus {
    /// Init is running as `pid` (host pid namespace).
    Ready {
        pid: i32,
        #[serde(default)]
        notes: Vec<String>,
    },
    /// The command is running as `pid`.
    Started { pid: i32 },
    Failed { failure: SetupFailure },
}

impl HelperStatus {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// What the forked child tells its helper parent before exec.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum ChildReport {
    Note { message: String },
    Failure { failure: SetupFailure },
}

/// `argv[0]` dispatch for the helpers. Returns only for other names.
pub fn dispatch(argv0: &str) {
    let name = Path::new(argv0)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    match name {
        INIT_ARGV0 => init_main(),
        EXEC_ARGV0 => exec_main(),
        _ => {}
    }
}

struct StatusPipe(File);

impl StatusPipe {
    fn open() -> io::Result<Self> {
        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(STATUS_FD, libc::F_GETFD) } == -1 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "status descriptor 3 is not open",
            ));
        }
        // Neither init nor the command may inherit it.
        // SAFETY: fd 3 is open and was handed to us for exclusive use.
        if unsafe { libc::fcntl(STATUS_FD, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above; from here on the File owns it.
        Ok(Self(unsafe { File::from_raw_fd(STATUS_FD) }))
    }

    fn report(&mut self, status: &HelperStatus) {
        let Ok(mut line) = serde_json::to_string(status) else {
            return;
        };
        line.push('\n');
        let _ = self.0.write_all(line.as_bytes());
    }
}

fn open_status_or_exit(prog: &str) -> StatusPipe {
    match StatusPipe::open() {
        Ok(status) => status,
        Err(err) => {
            eprintln!("{prog}: {err}");
            std::process::exit(1);
        }
    }
}

fn config_failure(message: impl Into<String>) -> SetupFailure {
    SetupFailure::new(SetupStage::Config, message)
}

/// Split `[fixed..., "--", argv...]`.
fn split_args(args: &[String], fixed: usize) -> Result<(&[String], Vec<CString>), SetupFailure> {
    if args.len() < fixed + 2 || args[fixed] != "--" {
        return Err(config_failure(format!(
            "expected {fixed} arguments, `--` and a command"
        )));
    }
    let argv = args[fixed + 1..]
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| config_failure(e.to_string()))?;
    Ok((&args[..fixed], argv))
}

fn parse_caps_arg(csv: &str) -> Result<caps::CapsHashSet, SetupFailure> {
    let names: Vec<&str> = csv.split(',').filter(|name| !name.is_empty()).collect();
    parse_capabilities(&names)
}

fn send_report(pipe: &mut File, report: &ChildReport) {
    if let Ok(mut line) = serde_json::to_string(report) {
        line.push('\n');
        let _ = pipe.write_all(line.as_bytes());
    }
}

/// Collect what the child reported before exec. Exec closes the pipe, so EOF
/// without a failure means the command is running.
fn read_child_reports(pipe: OwnedFd) -> Result<Vec<String>, SetupFailure> {
    let mut notes = Vec::new();
    for line in BufReader::new(File::from(pipe)).lines() {
        let line = line.map_err(|e| SetupFailure::from_io(SetupStage::Exec, &e))?;
        match serde_json::from_str::<ChildReport>(&line) {
            Ok(ChildReport::Note { message }) => notes.push(message),
            Ok(ChildReport::Failure { failure }) => return Err(failure),
            Err(err) => return Err(SetupFailure::new(SetupStage::Exec, err.to_string())),
        }
    }
    Ok(notes)
}

/// Fork; the child runs `setup` and execs `argv`, the parent waits until the
/// exec happened (or failed).
fn spawn_child(
    setup: impl FnOnce(&mut File) -> Result<(), SetupFailure>,
    argv: &[CString],
) -> Result<(Pid, Vec<String>), SetupFailure> {
    let (reader, writer) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| SetupFailure::from_errno(SetupStage::Exec, e))?;

    // SAFETY: the helper is single-threaded.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(reader);
            let mut pipe = File::from(writer);
            let failure = match setup(&mut pipe) {
                Ok(()) => match execv(&argv[0], argv) {
                    Ok(never) => match never {},
                    Err(err) => SetupFailure::from_errno(SetupStage::Exec, err)
                        .with_target(argv[0].to_string_lossy()),
                },
                Err(failure) => failure,
            };
            send_report(&mut pipe, &ChildReport::Failure { failure });
            // SAFETY: leave without running the parent's atexit handlers.
            unsafe { libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(writer);
            match read_child_reports(reader) {
                Ok(notes) => Ok((child, notes)),
                Err(failure) => {
                    let _ = waitpid(child, None);
                    Err(failure)
                }
            }
        }
        Err(err) => Err(SetupFailure::from_errno(SetupStage::Exec, err)),
    }
}

/// Exit code for a child's wait status, shell style.
fn wait_exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

fn wait_for(child: Pid) -> WaitStatus {
    loop {
        match waitpid(child, None) {
            Ok(status) if wait_exit_code(status).is_some() => return status,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return WaitStatus::Exited(child, 1),
        }
    }
}

// --- pkgjail-init ---------------------------------------------------------

fn init_main() -> ! {
    let mut status = open_status_or_exit(INIT_ARGV0);
    let args: Vec<String> = std::env::args().collect();

    match run_init(&args[1..]) {
        Ok((pid, notes)) => {
            status.report(&HelperStatus::Ready {
                pid: pid.as_raw(),
                notes,
            });
            drop(status);
            let code = wait_exit_code(wait_for(pid)).unwrap_or(1);
            std::process::exit(code);
        }
        Err(failure) => {
            status.report(&HelperStatus::Failed { failure });
            std::process::exit(1);
        }
    }
}

fn run_init(args: &[String]) -> Result<(Pid, Vec<String>), SetupFailure> {
    let (fixed, argv) = split_args(args, 2)?;
    let config = RuntimeConfig::read_from(Path::new(&fixed[0]))
        .map_err(|e| config_failure(e.to_string()).with_target(&fixed[0]))?;
    let caps = parse_caps_arg(&fixed[1])?;

    if config.spec.namespaces.contains(&NamespaceKind::User) {
        enter_user_namespace(&config.spec.uid_mappings, &config.spec.gid_mappings)?;
    }
    let flags = config
        .spec
        .namespaces
        .iter()
        .filter(|ns| **ns != NamespaceKind::User)
        .fold(CloneFlags::empty(), |flags, ns| flags | clone_flag(*ns));
    unshare(flags).map_err(|e| SetupFailure::from_errno(SetupStage::Namespace, e))?;

    spawn_child(
        |pipe| {
            let _ = set_pdeathsig(Signal::SIGKILL);
            build_container(&config, pipe)?;
            chdir("/").map_err(|e| SetupFailure::from_errno(SetupStage::Exec, e).with_target("/"))?;
            apply_capabilities(&caps)
        },
        &argv,
    )
}

fn clone_flag(ns: NamespaceKind) -> CloneFlags {
    match ns {
        NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
        NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
        NamespaceKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        NamespaceKind::Network => CloneFlags::CLONE_NEWNET,
    }
}

fn id_map(mappings: &[IdMapping]) -> String {
    mappings.iter().map(IdMapping::map_line).collect()
}

fn enter_user_namespace(uids: &[IdMapping], gids: &[IdMapping]) -> Result<(), SetupFailure> {
    unshare(CloneFlags::CLONE_NEWUSER)
        .map_err(|e| SetupFailure::from_errno(SetupStage::Namespace, e).with_target("user"))?;

    // setgroups must be denied before an unprivileged gid_map write.
    for (file, contents) in [
        ("/proc/self/setgroups", "deny".to_string()),
        ("/proc/self/uid_map", id_map(uids)),
        ("/proc/self/gid_map", id_map(gids)),
    ] {
        fs::write(file, contents)
            .map_err(|e| SetupFailure::from_io(SetupStage::IdMap, &e).with_target(file))?;
    }
    Ok(())
}

/// Assemble the root filesystem and pivot into it.
fn build_container(config: &RuntimeConfig, pipe: &mut File) -> Result<(), SetupFailure> {
    let rootfs = &config.spec.root;
    let mut note = |message: String| send_report(pipe, &ChildReport::Note { message });

    mounts::prepare_rootfs(rootfs)?;
    for entry in &config.spec.mounts {
        if let mounts::MountResult::Skipped(reason) = mounts::mount_entry(rootfs, entry)? {
            note(format!("skipped {}: {reason}", entry.destination.display()));
        }
    }
    for skipped in mounts::bind_devices(rootfs, &config.devices)? {
        note(skipped);
    }
    mounts::create_dev_symlinks(rootfs, &config.dev_symlinks)?;
    mounts::pivot_into(rootfs)?;
    mounts::mask_paths(&config.spec.masked_paths)
}

// --- pkgjail-exec ---------------------------------------------------------

/// Order of `setns`: user first for the privileges to join the rest, mount
/// last so `/proc/<pid>` stays reachable until then.
const JOIN_ORDER: [NamespaceKind; 7] = [
    NamespaceKind::User,
    NamespaceKind::Ipc,
    NamespaceKind::Uts,
    NamespaceKind::Network,
    NamespaceKind::Pid,
    NamespaceKind::Cgroup,
    NamespaceKind::Mount,
];

static FORWARD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = FORWARD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill is async-signal-safe.
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

const FORWARDED_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

fn exec_main() -> ! {
    let mut status = open_status_or_exit(EXEC_ARGV0);
    let args: Vec<String> = std::env::args().collect();

    match run_exec(&args[1..]) {
        Ok(pid) => {
            FORWARD_PID.store(pid.as_raw(), Ordering::SeqCst);
            let action = SigAction::new(
                SigHandler::Handler(forward_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            for sig in FORWARDED_SIGNALS {
                // SAFETY: the handler only reads an atomic and calls kill.
                let _ = unsafe { signal::sigaction(sig, &action) };
            }
            status.report(&HelperStatus::Started { pid: pid.as_raw() });
            drop(status);
            mirror_exit(wait_for(pid))
        }
        Err(failure) => {
            status.report(&HelperStatus::Failed { failure });
            std::process::exit(1);
        }
    }
}

/// Exit the way the command did, re-raising its signal when it was killed.
fn mirror_exit(status: WaitStatus) -> ! {
    if let WaitStatus::Signaled(_, sig, _) = status {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: restoring the default disposition.
        let _ = unsafe { signal::sigaction(sig, &default) };
        let _ = signal::raise(sig);
    }
    std::process::exit(wait_exit_code(status).unwrap_or(1))
}

struct JoinTarget {
    kind: NamespaceKind,
    file: File,
}

/// Open the namespaces of `pid` that differ from ours. All of them are opened
/// before joining any, while `/proc/<pid>` is still accessible.
fn open_namespaces(pid: i32) -> Result<Vec<JoinTarget>, SetupFailure> {
    let mut targets = Vec::new();
    for kind in JOIN_ORDER {
        let path = PathBuf::from(format!("/proc/{pid}/ns/{}", kind.proc_name()));
        let theirs = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(SetupFailure::from_io(SetupStage::Join, &err).with_target(path.display()));
            }
        };
        let ours = fs::metadata(format!("/proc/self/ns/{}", kind.proc_name()));
        if ours.is_ok_and(|ours| ours.ino() == theirs.ino() && ours.dev() == theirs.dev()) {
            continue;
        }
        let file = File::open(&path)
            .map_err(|e| SetupFailure::from_io(SetupStage::Join, &e).with_target(path.display()))?;
        targets.push(JoinTarget { kind, file });
    }
    Ok(targets)
}

fn run_exec(args: &[String]) -> Result<Pid, SetupFailure> {
    let (fixed, argv) = split_args(args, 3)?;
    let pid: i32 = fixed[0]
        .parse()
        .map_err(|_| config_failure(format!("invalid pid {:?}", fixed[0])))?;
    let cwd = PathBuf::from(&fixed[1]);
    let caps = parse_caps_arg(&fixed[2])?;

    let root_path = format!("/proc/{pid}/root");
    let root = File::open(&root_path)
        .map_err(|e| SetupFailure::from_io(SetupStage::Join, &e).with_target(&root_path))?;
    for target in open_namespaces(pid)? {
        setns(&target.file, clone_flag(target.kind)).map_err(|e| {
            SetupFailure::from_errno(SetupStage::Join, e).with_target(target.kind.proc_name())
        })?;
    }
    enter_root(&root)?;

    let (child, _) = spawn_child(
        |_| {
            let _ = set_pdeathsig(Signal::SIGKILL);
            chdir(&cwd).map_err(|e| {
                SetupFailure::from_errno(SetupStage::Exec, e).with_target(cwd.display())
            })?;
            apply_capabilities(&caps)
        },
        &argv,
    )?;
    Ok(child)
}

fn enter_root(root: &File) -> Result<(), SetupFailure> {
    let failure = |e: Errno| SetupFailure::from_errno(SetupStage::Join, e).with_target("root");
    // SAFETY: fchdir on a descriptor we own.
    Errno::result(unsafe { libc::fchdir(root.as_raw_fd()) }).map_err(failure)?;
    chroot(".").map_err(failure)?;
    chdir("/").map_err(failure)
}

/// Read a helper's status line from `reader`. `None` when the helper closed
/// the pipe without writing one.
pub fn read_status(reader: impl Read) -> io::Result<Option<HelperStatus>> {
    let mut line = String::new();
    if BufReader::new(reader).read_line(&mut line)? == 0 {
        return Ok(None);
    }
    HelperStatus::parse(&line)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
