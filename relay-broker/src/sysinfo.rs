//! Minimal host facts for the registration message's `hostname`,
//! `container-info` and `vm-info` fields (§4.I). The original's
//! `landscape.lib.network.get_fqdn`/`landscape.lib.vm_info` probe a wide
//! range of platform-specific sources (DMI tables, `/proc`, `lxc-is-container`
//! etc.); this is the narrow slice that matters for the wire payload, read
//! straight off `/etc` rather than shelling out.

use std::fs;

pub fn hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `Some("lxc")`/`Some("docker")` when running inside one of those, else
/// `None`. Detection is best-effort; an undetected container is not an
/// error, just an absent field.
pub fn container_info() -> Option<String> {
    if std::path::Path::new("/.dockerenv").exists() {
        return Some("docker".to_string());
    }
    if let Ok(contents) = fs::read_to_string("/proc/1/environ") {
        if contents.split('\0').any(|var| var == "container=lxc") {
            return Some("lxc".to_string());
        }
    }
    None
}

/// No hypervisor/DMI probing implemented; always absent.
pub fn vm_info() -> Option<String> {
    None
}
