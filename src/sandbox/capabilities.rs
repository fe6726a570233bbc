//! The fixed capability set of sandboxed processes.
//!
//! Every process in a container, the init process included, runs with exactly
//! this set in its bounding, effective and permitted sets. It never varies per
//! command or per package.

use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};

use crate::error::{SetupFailure, SetupStage};

pub const SANDBOX_CAPABILITIES: [Capability; 11] = [
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_KILL,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_SETFCAP,
    Capability::CAP_SETGID,
    Capability::CAP_SETPCAP,
    Capability::CAP_SETUID,
    Capability::CAP_SYS_CHROOT,
];

/// `CAP_*` names of [`SANDBOX_CAPABILITIES`].
pub fn default_capabilities() -> Vec<String> {
    SANDBOX_CAPABILITIES.iter().map(|cap| cap.to_string()).collect()
}

pub fn parse_capabilities<S: AsRef<str>>(names: &[S]) -> Result<CapsHashSet, SetupFailure> {
    names
        .iter()
        .map(|name| {
            Capability::from_str(name.as_ref()).map_err(|e| {
                SetupFailure::new(SetupStage::Capabilities, e.to_string()).with_target(name.as_ref())
            })
        })
        .collect()
}

/// Restrict the calling thread to `allowed`.
///
/// The bounding set is narrowed first, while `CAP_SETPCAP` is still effective;
/// then effective, then permitted.
pub fn apply_capabilities(allowed: &CapsHashSet) -> Result<(), SetupFailure> {
    let failure = |set: &str, e: caps::errors::CapsError| {
        SetupFailure::new(SetupStage::Capabilities, e.to_string()).with_target(set)
    };

    let bounding = caps::read(None, CapSet::Bounding).map_err(|e| failure("bounding", e))?;
    for cap in bounding.difference(allowed) {
        caps::drop(None, CapSet::Bounding, *cap).map_err(|e| failure("bounding", e))?;
    }

    caps::set(None, CapSet::Effective, allowed).map_err(|e| failure("effective", e))?;
    caps::set(None, CapSet::Permitted, allowed).map_err(|e| failure("permitted", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_names() {
        let names = default_capabilities();
        assert_eq!(names.len(), 11);
        assert_eq!(names[0], "CAP_CHOWN");
        assert!(names.contains(&"CAP_SYS_CHROOT".to_string()));
        assert!(!names.contains(&"CAP_SYS_ADMIN".to_string()));
    }

    #[test]
    fn test_parse_roundtrip() {
        let parsed = parse_capabilities(&default_capabilities()).unwrap();
        assert_eq!(parsed.len(), SANDBOX_CAPABILITIES.len());
        for cap in SANDBOX_CAPABILITIES {
            assert!(parsed.contains(&cap));
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = parse_capabilities(&["CAP_CHOWN", "CAP_MAKE_COFFEE"]).unwrap_err();
        assert_eq!(err.stage, SetupStage::Capabilities);
        assert_eq!(err.target.as_deref(), Some("CAP_MAKE_COFFEE"));
    }
}
