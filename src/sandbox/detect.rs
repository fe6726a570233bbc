use std::path::{Path, PathBuf};

/// What the host offers for rootless containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapabilities {
    /// `kernel.unprivileged_userns_clone`, on kernels that carry the knob.
    pub unprivileged_userns_clone: Option<bool>,

    /// `user.max_user_namespaces`.
    pub max_user_namespaces: Option<u64>,

    /// AppArmor denies unprivileged user namespaces (Ubuntu 23.10+ default).
    pub apparmor_restricts_userns: bool,

    /// The unified cgroup hierarchy is mounted.
    pub cgroup_v2: bool,

    pub euid: u32,
}

/// Inspect the running host.
pub fn detect_capabilities() -> HostCapabilities {
    detect_in(Path::new("/"))
}

/// Inspect a host whose `/proc` and `/sys` live below `root`.
fn detect_in(root: &Path) -> HostCapabilities {
    let at = |path: &str| -> PathBuf { root.join(path.trim_start_matches('/')) };

    HostCapabilities {
        unprivileged_userns_clone: read_number(&at("/proc/sys/kernel/unprivileged_userns_clone"))
            .map(|v| v != 0),
        max_user_namespaces: read_number(&at("/proc/sys/user/max_user_namespaces")),
        apparmor_restricts_userns: read_number(&at(
            "/proc/sys/kernel/apparmor_restrict_unprivileged_userns",
        ))
        .is_some_and(|v| v != 0),
        cgroup_v2: at("/sys/fs/cgroup/cgroup.controllers").exists(),
        euid: nix::unistd::geteuid().as_raw(),
    }
}

fn read_number(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl HostCapabilities {
    /// Unprivileged processes may create user namespaces.
    pub fn user_namespaces(&self) -> bool {
        self.unprivileged_userns_clone != Some(false)
            && self.max_user_namespaces != Some(0)
            && !self.apparmor_restricts_userns
    }

    /// Human-readable status lines for the `status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        let userns = match (self.user_namespaces(), self.max_user_namespaces) {
            (true, Some(max)) => format!("  User NS:   available (max {max:<8})  ok"),
            (true, None) => "  User NS:   available               ok".to_string(),
            (false, _) => "  User NS:   not available           --".to_string(),
        };
        lines.push(userns);

        if self.apparmor_restricts_userns {
            lines.push("  AppArmor:  restricts user NS       --".to_string());
        }

        if self.cgroup_v2 {
            lines.push("  Cgroups:   v2                      ok".to_string());
        } else {
            lines.push("  Cgroups:   v1 or hybrid            --".to_string());
        }

        lines.push(format!(
            "  User:      uid {:<6}{}",
            self.euid,
            if self.euid == 0 { "(root)" } else { "(rootless)" }
        ));

        lines
    }
}
