//! GOROOT patches for the hypervisor's incomplete epoll implementation.
//!
//! ESXi's Linux personality rejects `epoll_pwait` with ENOSYS and refuses
//! `EPOLLRDHUP` registrations with EINVAL. Each patch here installs one
//! runtime workaround: a fallback syscall number, an ENOSYS retry in the
//! syscall wrapper, and an EINVAL flag-clearing retry in the netpoller.
//! Anchors are exact lines from the targeted Go release; a miss means the
//! toolchain version no longer matches and the run must stop.

use crate::patch::{insert_after, replace_once, AnchorPatch, TransformError};

pub const DEFS_FILE: &str = "src/internal/runtime/syscall/defs_linux_amd64.go";
pub const SYSCALL_FILE: &str = "src/internal/runtime/syscall/syscall_linux.go";
pub const NETPOLL_FILE: &str = "src/runtime/netpoll_epoll.go";

pub const PATCHES: [AnchorPatch; 3] = [
    AnchorPatch {
        id: "epoll-wait-syscall-number",
        description: "define SYS_EPOLL_WAIT next to its sibling constants",
        relative_path: DEFS_FILE,
        markers: &["SYS_EPOLL_WAIT"],
        transform: patch_defs,
    },
    AnchorPatch {
        id: "epoll-pwait-enosys-fallback",
        description: "retry EpollWait via epoll_wait when epoll_pwait is unimplemented",
        relative_path: SYSCALL_FILE,
        markers: &["if e == 38 { // ENOSYS"],
        transform: patch_syscall,
    },
    AnchorPatch {
        id: "epollrdhup-einval-retry",
        description: "drop EPOLLRDHUP and retry registration on EINVAL",
        relative_path: NETPOLL_FILE,
        markers: &["ev.Events &^= syscall.EPOLLRDHUP"],
        transform: patch_netpoll,
    },
];

const DEFS_ANCHOR: &str = "\tSYS_EPOLL_CTL     = 233\n";
const DEFS_INSERT: &str = "\tSYS_EPOLL_WAIT    = 232\n";

fn patch_defs(content: &str) -> Result<String, TransformError> {
    insert_after(content, DEFS_ANCHOR, DEFS_INSERT, "SYS_EPOLL_CTL")
}

const SYSCALL_ANCHOR: &str = concat!(
    "\tr1, _, e := Syscall6(SYS_EPOLL_PWAIT, uintptr(epfd), uintptr(ev), ",
    "uintptr(maxev), uintptr(waitms), 0, 0)\n",
    "\treturn int32(r1), e",
);

const SYSCALL_REPLACEMENT: &str = concat!(
    "\tr1, _, e := Syscall6(SYS_EPOLL_PWAIT, uintptr(epfd), uintptr(ev), ",
    "uintptr(maxev), uintptr(waitms), 0, 0)\n",
    "\tif e == 38 { // ENOSYS\n",
    "\t\tr1, _, e = Syscall6(SYS_EPOLL_WAIT, uintptr(epfd), uintptr(ev), ",
    "uintptr(maxev), uintptr(waitms), 0, 0)\n",
    "\t}\n",
    "\treturn int32(r1), e",
);

fn patch_syscall(content: &str) -> Result<String, TransformError> {
    replace_once(content, SYSCALL_ANCHOR, SYSCALL_REPLACEMENT, "EpollWait body")
}

const NETPOLL_ANCHOR: &str =
    "\treturn syscall.EpollCtl(epfd, syscall.EPOLL_CTL_ADD, int32(fd), &ev)";

const NETPOLL_REPLACEMENT: &str = concat!(
    "\terrno := syscall.EpollCtl(epfd, syscall.EPOLL_CTL_ADD, int32(fd), &ev)\n",
    "\tif errno == _EINVAL && ev.Events&syscall.EPOLLRDHUP != 0 {\n",
    "\t\tev.Events &^= syscall.EPOLLRDHUP\n",
    "\t\terrno = syscall.EpollCtl(epfd, syscall.EPOLL_CTL_ADD, int32(fd), &ev)\n",
    "\t}\n",
    "\treturn errno",
);

fn patch_netpoll(content: &str) -> Result<String, TransformError> {
    replace_once(content, NETPOLL_ANCHOR, NETPOLL_REPLACEMENT, "EpollCtl add")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{apply_patch, PatchError, PatchOutcome};
    use std::fs;
    use std::path::Path;

    const DEFS_FIXTURE: &str = concat!(
        "package syscall\n",
        "\n",
        "const (\n",
        "\tSYS_MPROTECT      = 10\n",
        "\tSYS_FCNTL         = 72\n",
        "\tSYS_EPOLL_CTL     = 233\n",
        "\tSYS_EPOLL_PWAIT   = 281\n",
        "\tSYS_EPOLL_CREATE1 = 291\n",
        ")\n",
    );

    const SYSCALL_FIXTURE: &str = concat!(
        "package syscall\n",
        "\n",
        "func EpollWait(epfd int32, ev *EpollEvent, maxev, waitms int32) (int32, uintptr) {\n",
        "\tr1, _, e := Syscall6(SYS_EPOLL_PWAIT, uintptr(epfd), uintptr(ev), ",
        "uintptr(maxev), uintptr(waitms), 0, 0)\n",
        "\treturn int32(r1), e\n",
        "}\n",
    );

    const NETPOLL_FIXTURE: &str = concat!(
        "package runtime\n",
        "\n",
        "func netpollopen(fd uintptr, pd *pollDesc) uintptr {\n",
        "\tvar ev syscall.EpollEvent\n",
        "\tev.Events = syscall.EPOLLIN | syscall.EPOLLOUT | syscall.EPOLLRDHUP | syscall.EPOLLET\n",
        "\t*(**pollDesc)(unsafe.Pointer(&ev.Data)) = pd\n",
        "\treturn syscall.EpollCtl(epfd, syscall.EPOLL_CTL_ADD, int32(fd), &ev)\n",
        "}\n",
    );

    fn write_target(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn defs_patch_inserts_constant_after_sibling() {
        let dir = tempfile::tempdir().unwrap();
        write_target(dir.path(), DEFS_FILE, DEFS_FIXTURE);

        let outcome = apply_patch(&PATCHES[0], dir.path()).unwrap();
        assert_eq!(outcome, PatchOutcome::Applied);

        let patched = fs::read_to_string(dir.path().join(DEFS_FILE)).unwrap();
        assert!(patched.contains(concat!(
            "\tSYS_EPOLL_CTL     = 233\n",
            "\tSYS_EPOLL_WAIT    = 232\n",
            "\tSYS_EPOLL_PWAIT   = 281\n",
        )));

        let again = apply_patch(&PATCHES[0], dir.path()).unwrap();
        assert_eq!(again, PatchOutcome::AlreadyApplied);
        assert_eq!(fs::read_to_string(dir.path().join(DEFS_FILE)).unwrap(), patched);
    }

    #[test]
    fn syscall_patch_wraps_epoll_pwait_invocation() {
        let dir = tempfile::tempdir().unwrap();
        write_target(dir.path(), SYSCALL_FILE, SYSCALL_FIXTURE);

        let outcome = apply_patch(&PATCHES[1], dir.path()).unwrap();
        assert_eq!(outcome, PatchOutcome::Applied);

        let patched = fs::read_to_string(dir.path().join(SYSCALL_FILE)).unwrap();
        assert!(patched.contains("\tif e == 38 { // ENOSYS\n"));
        assert!(patched.contains("Syscall6(SYS_EPOLL_WAIT, uintptr(epfd)"));
        // Everything outside the wrapped invocation survives untouched.
        assert!(patched.starts_with("package syscall\n\nfunc EpollWait"));
        assert!(patched.ends_with("\treturn int32(r1), e\n}\n"));

        let again = apply_patch(&PATCHES[1], dir.path()).unwrap();
        assert_eq!(again, PatchOutcome::AlreadyApplied);
    }

    #[test]
    fn netpoll_patch_installs_einval_retry() {
        let dir = tempfile::tempdir().unwrap();
        write_target(dir.path(), NETPOLL_FILE, NETPOLL_FIXTURE);

        let outcome = apply_patch(&PATCHES[2], dir.path()).unwrap();
        assert_eq!(outcome, PatchOutcome::Applied);

        let patched = fs::read_to_string(dir.path().join(NETPOLL_FILE)).unwrap();
        assert!(patched.contains("\terrno := syscall.EpollCtl(epfd"));
        assert!(patched.contains("\t\tev.Events &^= syscall.EPOLLRDHUP\n"));
        assert!(patched.ends_with("\treturn errno\n}\n"));

        let again = apply_patch(&PATCHES[2], dir.path()).unwrap();
        assert_eq!(again, PatchOutcome::AlreadyApplied);
    }

    #[test]
    fn version_drift_fails_without_modifying_the_file() {
        let dir = tempfile::tempdir().unwrap();
        // A defs file from some other release: sibling constant renumbered.
        let drifted = "package syscall\n\nconst (\n\tSYS_EPOLL_CTL     = 21\n)\n";
        write_target(dir.path(), DEFS_FILE, drifted);

        let err = apply_patch(&PATCHES[0], dir.path()).unwrap_err();
        match err {
            PatchError::AnchorNotFound { path, anchor } => {
                assert!(path.ends_with(DEFS_FILE));
                assert_eq!(anchor, "SYS_EPOLL_CTL");
            }
            other => panic!("expected AnchorNotFound, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(dir.path().join(DEFS_FILE)).unwrap(), drifted);
    }
}
