//! Kernel-enforced confinement for the process sandbox.
//!
//! A [`ConfinePlan`] is built in the parent before spawning and applied by a
//! `pre_exec` hook in the forked child, right before the interpreter is
//! exec'd. The hook only issues syscalls over data prepared up front: no
//! allocation, no locks, no logging between fork and exec.
//!
//! Layers, outermost first:
//! - strict mode (Linux): private user, mount, network, IPC and UTS
//!   namespaces; the root is swapped for a tmpfs holding read-only binds of
//!   the interpreter's directories and a size-capped `/sandbox` scratch area
//! - resource limits: address space, file size, open files, processes,
//!   CPU seconds, no core dumps
//! - a seccomp filter (Linux x86_64/aarch64) that refuses sockets, new
//!   processes and namespace or mount changes

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use verdict_common::config::{GraderConfig, ProcessConfinement};
use verdict_common::types::Limits;

/// Writable directory of a strictly confined interpreter
pub const SANDBOX_WORKDIR: &str = "/sandbox";

/// Host trees an interpreter needs to start, mounted read-only when present
const SYSTEM_PATHS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libx32", "/etc/ld.so.cache", "/etc/alternatives",
];
const DEVICE_PATHS: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

/// Confinement settings shared by every load of one process sandbox
#[derive(Debug, Clone)]
pub struct ConfinementSettings {
    pub mode: ProcessConfinement,
    pub scratch_bytes: u64,
    pub open_files: u64,
    /// Added to the call timeout to get the CPU-seconds ceiling of one interpreter
    pub cpu_slack: Duration,
    pub read_only_paths: Vec<PathBuf>,
}

impl ConfinementSettings {
    pub fn from_config(config: &GraderConfig) -> Self {
        Self {
            mode: config.confinement,
            scratch_bytes: config.scratch_limit_bytes(),
            open_files: config.open_files_limit,
            cpu_slack: config.grading_overhead(),
            read_only_paths: config.read_only_paths.clone(),
        }
    }
}

impl Default for ConfinementSettings {
    fn default() -> Self {
        Self::from_config(&GraderConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResourceLimits {
    memory_bytes: u64,
    file_bytes: u64,
    open_files: u64,
    processes: u64,
    cpu_seconds: u64,
}

impl ResourceLimits {
    fn new(settings: &ConfinementSettings, limits: &Limits, processes: u64) -> Self {
        let budget = limits.timeout() + settings.cpu_slack;
        Self {
            memory_bytes: limits.memory_bytes(),
            file_bytes: settings.scratch_bytes,
            open_files: settings.open_files,
            processes: processes.max(1),
            cpu_seconds: budget.as_secs() + u64::from(budget.subsec_nanos() > 0),
        }
    }
}

/// Everything the child applies to itself before exec
pub struct ConfinePlan {
    limits: ResourceLimits,
    workdir: PathBuf,
    #[cfg(target_os = "linux")]
    isolation: Option<linux::IsolationPlan>,
    #[cfg(target_os = "linux")]
    filter: Option<Vec<libc::sock_filter>>,
}

impl ConfinePlan {
    /// Prepare the confinement of one interpreter whose session lives in `session_dir`
    pub fn new(
        settings: &ConfinementSettings,
        limits: &Limits,
        processes: u64,
        session_dir: &Path,
    ) -> io::Result<Self> {
        let limits = ResourceLimits::new(settings, limits, processes);

        #[cfg(target_os = "linux")]
        {
            let (isolation, workdir) = match settings.mode {
                ProcessConfinement::Strict => (
                    Some(linux::IsolationPlan::new(settings, session_dir)?),
                    PathBuf::from(SANDBOX_WORKDIR),
                ),
                ProcessConfinement::Relaxed => (None, session_dir.to_path_buf()),
            };
            Ok(Self {
                limits,
                workdir,
                isolation,
                filter: linux::syscall_filter(),
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            match settings.mode {
                ProcessConfinement::Strict => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "strict process confinement needs Linux namespaces",
                )),
                ProcessConfinement::Relaxed => Ok(Self {
                    limits,
                    workdir: session_dir.to_path_buf(),
                }),
            }
        }
    }

    /// Directory the interpreter runs in, as the interpreter sees it
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_isolated(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.isolation.is_some()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    pub fn filters_syscalls(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.filter.is_some()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    /// Runs in the forked child. Only async-signal-safe calls from here on.
    #[cfg(unix)]
    pub fn apply(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        if let Some(isolation) = &self.isolation {
            isolation.enter()?;
        }

        apply_rlimits(&self.limits)?;

        #[cfg(target_os = "linux")]
        if let Some(filter) = &self.filter {
            linux::install_filter(filter)?;
        }

        Ok(())
    }
}

#[cfg(unix)]
fn apply_rlimits(limits: &ResourceLimits) -> io::Result<()> {
    fn set(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(resource, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    type Resource = libc::c_int;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    set(libc::RLIMIT_AS, limits.memory_bytes, limits.memory_bytes)?;
    set(libc::RLIMIT_FSIZE, limits.file_bytes, limits.file_bytes)?;
    set(libc::RLIMIT_NOFILE, limits.open_files, limits.open_files)?;
    set(libc::RLIMIT_CORE, 0, 0)?;
    // soft limit raises SIGXCPU, the hard one a second later SIGKILL
    set(libc::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds + 1)?;
    // last: a lowered process count must not affect the exec itself
    set(libc::RLIMIT_NPROC, limits.processes, limits.processes)?;
    Ok(())
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{ConfinementSettings, DEVICE_PATHS, SANDBOX_WORKDIR, SYSTEM_PATHS};
    use std::collections::BTreeSet;
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Component, Path, PathBuf};
    use std::ptr;

    /// Uid and gid the interpreter runs as inside its user namespace
    const INSIDE_ID: u32 = 1000;
    const ROOT_TMPFS_OPTIONS: &str = "size=1048576,mode=0755";

    // statvfs f_flag bits (kernel ABI), see statfs(2)
    const ST_NODEV: libc::c_ulong = 4;
    const ST_NOEXEC: libc::c_ulong = 8;
    const ST_NOATIME: libc::c_ulong = 1024;
    const ST_NODIRATIME: libc::c_ulong = 2048;
    const ST_RELATIME: libc::c_ulong = 4096;

    fn c_path(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("path {} contains NUL", path.display()))
        })
    }

    #[derive(Debug)]
    enum MountStep {
        Dir(CString),
        File(CString),
        Symlink {
            target: CString,
            link: CString,
        },
        Bind {
            source: CString,
            target: CString,
            /// None for device nodes, which stay writable
            remount_flags: Option<libc::c_ulong>,
        },
        Tmpfs {
            target: CString,
            options: CString,
        },
    }

    #[derive(Debug)]
    pub(super) struct IsolationPlan {
        root: CString,
        root_options: CString,
        workdir: CString,
        uid_map: Vec<u8>,
        gid_map: Vec<u8>,
        steps: Vec<MountStep>,
    }

    impl IsolationPlan {
        pub(super) fn new(settings: &ConfinementSettings, session_dir: &Path) -> io::Result<Self> {
            let root = session_dir.join("root");
            std::fs::create_dir_all(&root)?;

            let mut builder = RootBuilder::new(root.clone());
            for path in SYSTEM_PATHS {
                builder.expose(Path::new(path), false)?;
            }
            for path in &settings.read_only_paths {
                builder.expose(path, false)?;
            }
            for path in DEVICE_PATHS {
                builder.expose(Path::new(path), true)?;
            }

            let workdir = builder.inside(Path::new(SANDBOX_WORKDIR));
            builder.dir(&workdir)?;
            builder.steps.push(MountStep::Tmpfs {
                target: c_path(&workdir)?,
                options: CString::new(format!("size={},mode=0755", settings.scratch_bytes))?,
            });
            let tmp = builder.inside(Path::new("/tmp"));
            if !builder.created.contains(&tmp) {
                builder.steps.push(MountStep::Symlink {
                    target: CString::new(SANDBOX_WORKDIR)?,
                    link: c_path(&tmp)?,
                });
            }

            // SAFETY: getuid/getgid cannot fail
            let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

            Ok(Self {
                root: c_path(&root)?,
                root_options: CString::new(ROOT_TMPFS_OPTIONS)?,
                workdir: CString::new(SANDBOX_WORKDIR)?,
                uid_map: format!("{} {} 1\n", INSIDE_ID, uid).into_bytes(),
                gid_map: format!("{} {} 1\n", INSIDE_ID, gid).into_bytes(),
                steps: builder.steps,
            })
        }

        /// Move the calling (forked) process into fresh namespaces rooted at the prepared tree
        pub(super) fn enter(&self) -> io::Result<()> {
            let flags = libc::CLONE_NEWUSER
                | libc::CLONE_NEWNS
                | libc::CLONE_NEWNET
                | libc::CLONE_NEWIPC
                | libc::CLONE_NEWUTS;
            check(unsafe { libc::unshare(flags) })?;

            match write_file(c"/proc/self/setgroups", b"deny") {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                other => other?,
            }
            write_file(c"/proc/self/uid_map", &self.uid_map)?;
            write_file(c"/proc/self/gid_map", &self.gid_map)?;

            unsafe {
                check(libc::mount(
                    ptr::null(),
                    c"/".as_ptr(),
                    ptr::null(),
                    libc::MS_REC | libc::MS_PRIVATE,
                    ptr::null(),
                ))?;
                check(libc::mount(
                    c"tmpfs".as_ptr(),
                    self.root.as_ptr(),
                    c"tmpfs".as_ptr(),
                    libc::MS_NOSUID | libc::MS_NODEV,
                    self.root_options.as_ptr().cast(),
                ))?;
            }

            for step in &self.steps {
                step.run()?;
            }

            unsafe {
                check(libc::chdir(self.root.as_ptr()))?;
                check(libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()) as libc::c_int)?;
                check(libc::umount2(c".".as_ptr(), libc::MNT_DETACH))?;
                check(libc::chdir(c"/".as_ptr()))?;
                check(libc::mount(
                    ptr::null(),
                    c"/".as_ptr(),
                    ptr::null(),
                    libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
                    ptr::null(),
                ))?;
                check(libc::chdir(self.workdir.as_ptr()))?;
            }
            Ok(())
        }
    }

    impl MountStep {
        fn run(&self) -> io::Result<()> {
            unsafe {
                match self {
                    MountStep::Dir(path) => {
                        if libc::mkdir(path.as_ptr(), 0o755) != 0 {
                            let error = io::Error::last_os_error();
                            if error.raw_os_error() != Some(libc::EEXIST) {
                                return Err(error);
                            }
                        }
                    }
                    MountStep::File(path) => {
                        let fd = libc::open(path.as_ptr(), libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC, 0o644 as libc::c_uint);
                        check(fd)?;
                        libc::close(fd);
                    }
                    MountStep::Symlink { target, link } => {
                        check(libc::symlink(target.as_ptr(), link.as_ptr()))?;
                    }
                    MountStep::Bind {
                        source,
                        target,
                        remount_flags,
                    } => {
                        check(libc::mount(
                            source.as_ptr(),
                            target.as_ptr(),
                            ptr::null(),
                            libc::MS_BIND | libc::MS_REC,
                            ptr::null(),
                        ))?;
                        if let Some(flags) = remount_flags {
                            check(libc::mount(
                                ptr::null(),
                                target.as_ptr(),
                                ptr::null(),
                                libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | flags,
                                ptr::null(),
                            ))?;
                        }
                    }
                    MountStep::Tmpfs { target, options } => {
                        check(libc::mount(
                            c"tmpfs".as_ptr(),
                            target.as_ptr(),
                            c"tmpfs".as_ptr(),
                            libc::MS_NOSUID | libc::MS_NODEV,
                            options.as_ptr().cast(),
                        ))?;
                    }
                }
            }
            Ok(())
        }
    }

    /// Collects the mount steps that rebuild a minimal tree under `root`
    struct RootBuilder {
        root: PathBuf,
        created: BTreeSet<PathBuf>,
        steps: Vec<MountStep>,
    }

    impl RootBuilder {
        fn new(root: PathBuf) -> Self {
            Self {
                root,
                created: BTreeSet::new(),
                steps: Vec::new(),
            }
        }

        /// Host path of `path` inside the new root
        fn inside(&self, path: &Path) -> PathBuf {
            let mut joined = self.root.clone();
            for component in path.components() {
                if let Component::Normal(part) = component {
                    joined.push(part);
                }
            }
            joined
        }

        fn dir(&mut self, target: &Path) -> io::Result<()> {
            let mut ancestors: Vec<&Path> = target
                .ancestors()
                .take_while(|p| p.starts_with(&self.root) && *p != self.root.as_path())
                .collect();
            ancestors.reverse();
            for dir in ancestors {
                if self.created.insert(dir.to_path_buf()) {
                    self.steps.push(MountStep::Dir(c_path(dir)?));
                }
            }
            Ok(())
        }

        fn expose(&mut self, path: &Path, device: bool) -> io::Result<()> {
            let Ok(metadata) = std::fs::symlink_metadata(path) else {
                return Ok(());
            };
            let target = self.inside(path);
            if self.created.contains(&target) {
                return Ok(());
            }
            if let Some(parent) = target.parent() {
                self.dir(parent)?;
            }

            if metadata.file_type().is_symlink() {
                let link_target = std::fs::read_link(path)?;
                self.created.insert(target.clone());
                self.steps.push(MountStep::Symlink {
                    target: c_path(&link_target)?,
                    link: c_path(&target)?,
                });
                return Ok(());
            }

            if metadata.is_dir() {
                self.dir(&target)?;
            } else {
                self.created.insert(target.clone());
                self.steps.push(MountStep::File(c_path(&target)?));
            }

            let source = c_path(path)?;
            let remount_flags = if device { None } else { Some(locked_flags(&source)?) };
            self.steps.push(MountStep::Bind {
                source,
                target: c_path(&target)?,
                remount_flags,
            });
            Ok(())
        }
    }

    /// Mount flags a read-only remount of a bind of `path` has to keep
    fn locked_flags(path: &CString) -> io::Result<libc::c_ulong> {
        let mut stat = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
        // SAFETY: statvfs fills the buffer on success
        let stat = unsafe {
            check(libc::statvfs(path.as_ptr(), stat.as_mut_ptr()))?;
            stat.assume_init()
        };

        let mut flags = libc::MS_NOSUID;
        for (bit, flag) in [
            (ST_NODEV, libc::MS_NODEV),
            (ST_NOEXEC, libc::MS_NOEXEC),
            (ST_NOATIME, libc::MS_NOATIME),
            (ST_NODIRATIME, libc::MS_NODIRATIME),
            (ST_RELATIME, libc::MS_RELATIME),
        ] {
            if stat.f_flag as libc::c_ulong & bit != 0 {
                flags |= flag;
            }
        }
        Ok(flags)
    }

    fn write_file(path: &std::ffi::CStr, contents: &[u8]) -> io::Result<()> {
        unsafe {
            let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
            check(fd)?;
            let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
            libc::close(fd);
            if written < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    // classic BPF opcodes and seccomp return values (kernel ABI)
    const BPF_LD_W_ABS: u16 = 0x20;
    const BPF_JEQ_K: u16 = 0x15;
    const BPF_JGE_K: u16 = 0x35;
    const BPF_JSET_K: u16 = 0x45;
    const BPF_RET_K: u16 = 0x06;
    const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
    const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

    // offsets into struct seccomp_data
    const DATA_NR: u32 = 0;
    const DATA_ARCH: u32 = 4;
    const DATA_ARG0: u32 = 16;

    const X32_SYSCALL_BIT: u32 = 0x4000_0000;
    const CLONE_THREAD: u32 = 0x0001_0000;

    // same numbers on every architecture using the generic table
    const SYS_IO_URING_SETUP: u32 = 425;
    const SYS_IO_URING_ENTER: u32 = 426;
    const SYS_IO_URING_REGISTER: u32 = 427;
    const SYS_OPEN_TREE: u32 = 428;
    const SYS_MOVE_MOUNT: u32 = 429;
    const SYS_FSOPEN: u32 = 430;
    const SYS_FSCONFIG: u32 = 431;
    const SYS_FSMOUNT: u32 = 432;
    const SYS_FSPICK: u32 = 433;
    const SYS_CLONE3: u32 = 435;

    #[cfg(target_arch = "x86_64")]
    const AUDIT_ARCH: Option<u32> = Some(0xC000_003E);
    #[cfg(target_arch = "aarch64")]
    const AUDIT_ARCH: Option<u32> = Some(0xC000_00B7);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    const AUDIT_ARCH: Option<u32> = None;

    fn stmt(code: u16, k: u32) -> libc::sock_filter {
        libc::sock_filter { code, jt: 0, jf: 0, k }
    }

    fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
        libc::sock_filter { code, jt, jf, k }
    }

    fn denied_syscalls() -> Vec<u32> {
        let mut denied = vec![
            libc::SYS_socket as u32,
            libc::SYS_socketpair as u32,
            libc::SYS_unshare as u32,
            libc::SYS_setns as u32,
            libc::SYS_mount as u32,
            libc::SYS_umount2 as u32,
            libc::SYS_pivot_root as u32,
            libc::SYS_chroot as u32,
            libc::SYS_ptrace as u32,
            libc::SYS_process_vm_readv as u32,
            libc::SYS_process_vm_writev as u32,
            libc::SYS_bpf as u32,
            libc::SYS_perf_event_open as u32,
            libc::SYS_keyctl as u32,
            libc::SYS_add_key as u32,
            libc::SYS_request_key as u32,
            libc::SYS_userfaultfd as u32,
            SYS_IO_URING_SETUP,
            SYS_IO_URING_ENTER,
            SYS_IO_URING_REGISTER,
            SYS_OPEN_TREE,
            SYS_MOVE_MOUNT,
            SYS_FSOPEN,
            SYS_FSCONFIG,
            SYS_FSMOUNT,
            SYS_FSPICK,
        ];
        #[cfg(target_arch = "x86_64")]
        denied.extend([libc::SYS_fork as u32, libc::SYS_vfork as u32]);
        denied
    }

    /// Seccomp program refusing sockets, new processes and namespace changes.
    /// Threads stay possible: `clone` passes only with `CLONE_THREAD` set and
    /// `clone3` reports ENOSYS so libc falls back to `clone`.
    pub(super) fn syscall_filter() -> Option<Vec<libc::sock_filter>> {
        let arch = AUDIT_ARCH?;
        let deny = SECCOMP_RET_ERRNO | libc::EPERM as u32;

        let mut program = vec![
            stmt(BPF_LD_W_ABS, DATA_ARCH),
            jump(BPF_JEQ_K, arch, 1, 0),
            stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS),
            stmt(BPF_LD_W_ABS, DATA_NR),
        ];
        if cfg!(target_arch = "x86_64") {
            program.push(jump(BPF_JGE_K, X32_SYSCALL_BIT, 0, 1));
            program.push(stmt(BPF_RET_K, deny));
        }
        for nr in denied_syscalls() {
            program.push(jump(BPF_JEQ_K, nr, 0, 1));
            program.push(stmt(BPF_RET_K, deny));
        }
        program.push(jump(BPF_JEQ_K, SYS_CLONE3, 0, 1));
        program.push(stmt(BPF_RET_K, SECCOMP_RET_ERRNO | libc::ENOSYS as u32));

        program.push(jump(BPF_JEQ_K, libc::SYS_clone as u32, 0, 3));
        program.push(stmt(BPF_LD_W_ABS, DATA_ARG0));
        program.push(jump(BPF_JSET_K, CLONE_THREAD, 1, 0));
        program.push(stmt(BPF_RET_K, deny));
        program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
        Some(program)
    }

    pub(super) fn install_filter(filter: &[libc::sock_filter]) -> io::Result<()> {
        let program = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_ptr() as *mut libc::sock_filter,
        };
        unsafe {
            let (on, unused): (libc::c_ulong, libc::c_ulong) = (1, 0);
            check(libc::prctl(libc::PR_SET_NO_NEW_PRIVS, on, unused, unused, unused))?;
            check(libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &program as *const libc::sock_fprog,
            ))?;
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_root_builder_layout() {
            let session = tempfile::tempdir().unwrap();
            let root = session.path().join("root");
            let mut builder = RootBuilder::new(root.clone());

            assert_eq!(builder.inside(Path::new("/etc/ld.so.cache")), root.join("etc/ld.so.cache"));

            builder.dir(&root.join("a/b")).unwrap();
            builder.dir(&root.join("a/c")).unwrap();
            let dirs: Vec<_> = builder
                .steps
                .iter()
                .filter_map(|step| match step {
                    MountStep::Dir(path) => Some(path.to_str().unwrap().to_string()),
                    _ => None,
                })
                .collect();
            assert_eq!(
                dirs,
                vec![
                    root.join("a").display().to_string(),
                    root.join("a/b").display().to_string(),
                    root.join("a/c").display().to_string(),
                ]
            );

            builder.expose(Path::new("/definitely/not/here"), false).unwrap();
            assert_eq!(builder.steps.len(), 3);
        }

        #[test]
        fn test_expose_binds_and_links() {
            let host = tempfile::tempdir().unwrap();
            std::fs::create_dir(host.path().join("tree")).unwrap();
            std::os::unix::fs::symlink("tree", host.path().join("alias")).unwrap();

            let session = tempfile::tempdir().unwrap();
            let mut builder = RootBuilder::new(session.path().join("root"));
            builder.expose(&host.path().join("tree"), false).unwrap();
            builder.expose(&host.path().join("alias"), false).unwrap();
            builder.expose(&host.path().join("tree"), false).unwrap();

            let binds = builder
                .steps
                .iter()
                .filter(|s| matches!(s, MountStep::Bind { remount_flags: Some(_), .. }))
                .count();
            let links = builder
                .steps
                .iter()
                .filter(|s| matches!(s, MountStep::Symlink { .. }))
                .count();
            assert_eq!(binds, 1);
            assert_eq!(links, 1);
        }

        #[test]
        fn test_filter_shape() {
            let Some(filter) = syscall_filter() else {
                return;
            };
            assert_eq!(filter[0].code, BPF_LD_W_ABS);
            assert_eq!(filter[0].k, DATA_ARCH);
            assert_eq!(filter.last().unwrap().k, SECCOMP_RET_ALLOW);
            assert!(filter.len() < u16::MAX as usize);
            assert!(filter
                .iter()
                .any(|f| f.code == BPF_JEQ_K && f.k == libc::SYS_socket as u32));
        }
    }
}
