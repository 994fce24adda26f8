//! Network interface discovery from OS state.
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub is_up: bool,
    pub is_loopback: bool,
}

/// Interfaces known to the OS. Empty when nothing can be read.
pub fn list_interfaces() -> Vec<NetworkInterface> {
    let from_sysfs = read_sysfs(Path::new("/sys/class/net"));
    if !from_sysfs.is_empty() {
        return from_sysfs;
    }
    fs::read_to_string("/proc/net/dev")
        .map(|text| parse_proc_net_dev(&text))
        .unwrap_or_default()
}

/// First interface that is up and not loopback.
pub fn default_interface() -> Option<String> {
    pick_default(&list_interfaces())
}

pub fn pick_default(interfaces: &[NetworkInterface]) -> Option<String> {
    interfaces
        .iter()
        .find(|i| i.is_up && !i.is_loopback)
        .map(|i| i.name.clone())
}

fn read_sysfs(root: &Path) -> Vec<NetworkInterface> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut interfaces: Vec<NetworkInterface> = entries
        .flatten()
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();
            let state = fs::read_to_string(dir.join("operstate")).unwrap_or_default();
            // IFF_LOOPBACK
            let flags = fs::read_to_string(dir.join("flags"))
                .ok()
                .and_then(|f| u32::from_str_radix(f.trim().trim_start_matches("0x"), 16).ok())
                .unwrap_or(0);
            let is_loopback = flags & 0x8 != 0 || name == "lo";
            // Loopback reports "unknown" while fully usable
            let is_up = state.trim() == "up" || (is_loopback && state.trim() == "unknown");
            NetworkInterface { name, is_up, is_loopback }
        })
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}

/// Fallback when sysfs is unavailable; state is unknown, so all are reported up.
fn parse_proc_net_dev(text: &str) -> Vec<NetworkInterface> {
    text.lines()
        .skip(2)
        .filter_map(|line| line.split_once(':'))
        .map(|(name, _)| {
            let name = name.trim().to_string();
            NetworkInterface {
                is_loopback: name == "lo",
                is_up: true,
                name,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_iface(root: &Path, name: &str, state: &str, flags: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("operstate"), state).unwrap();
        fs::write(dir.join("flags"), flags).unwrap();
    }

    #[test]
    fn sysfs_interfaces_and_default_choice() {
        let root = tempfile::tempdir().unwrap();
        fake_iface(root.path(), "lo", "unknown\n", "0x9\n");
        fake_iface(root.path(), "eth0", "down\n", "0x1002\n");
        fake_iface(root.path(), "wlan0", "up\n", "0x1003\n");

        let found = read_sysfs(root.path());
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], NetworkInterface { name: "eth0".into(), is_up: false, is_loopback: false });
        assert_eq!(found[1], NetworkInterface { name: "lo".into(), is_up: true, is_loopback: true });
        assert_eq!(pick_default(&found).as_deref(), Some("wlan0"));
    }

    #[test]
    fn proc_net_dev_fallback() {
        let text = "Inter-|   Receive\n face |bytes    packets\n    lo: 100 1 0 0\n  eth0: 2000 20 0 0\n";
        let found = parse_proc_net_dev(text);
        assert_eq!(found.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(), vec!["lo", "eth0"]);
        assert_eq!(pick_default(&found).as_deref(), Some("eth0"));
    }

    #[test]
    fn missing_sysfs_is_empty() {
        assert!(read_sysfs(Path::new("/definitely/not/here")).is_empty());
        assert_eq!(pick_default(&[]), None);
    }
}
