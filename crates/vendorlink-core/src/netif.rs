//! Network interfaces raised by a tethered peripheral.
//!
//! Some peripherals bring up a USB ethernet function next to the vendor
//! interface. The watcher lists the host's interfaces at an interval, reports
//! each one that appears, and reports an empty name once the last reported
//! interface goes away.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_channel::Sender;
use tracing::{debug, info, warn};

use crate::events::PlatformEvent;

/// Where Linux lists network interfaces.
pub const SYSFS_NET: &str = "/sys/class/net";

const LOOPBACK: &str = "lo";

/// Interface names found in `dir`, loopback excluded.
pub fn list_interfaces(dir: &Path) -> io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name != LOOPBACK {
            names.insert(name);
        }
    }
    Ok(names)
}

/// Turns successive interface listings into change notifications.
#[derive(Debug, Default)]
pub struct InterfaceWatcher {
    known: Option<BTreeSet<String>>,
    current: Option<String>,
}

impl InterfaceWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last interface reported as appeared and still present.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Compare `listing` with the previous one. The first listing is the
    /// baseline and reports nothing.
    pub fn update(&mut self, listing: BTreeSet<String>) -> Vec<String> {
        let Some(known) = self.known.replace(listing.clone()) else {
            return Vec::new();
        };

        let mut changes = Vec::new();
        if self.current.as_ref().is_some_and(|c| !listing.contains(c)) {
            info!(interface = ?self.current, "Network interface removed");
            self.current = None;
            changes.push(String::new());
        }
        for name in listing.difference(&known) {
            info!(interface = %name, "Network interface appeared");
            self.current = Some(name.clone());
            changes.push(name.clone());
        }
        changes
    }
}

/// Report interface changes under `dir` as platform events until the
/// receiver goes away. A listing that fails is logged and retried on the
/// next tick.
pub async fn watch_network_interfaces(
    dir: PathBuf,
    interval: Duration,
    events: Sender<PlatformEvent>,
) {
    let mut watcher = InterfaceWatcher::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let listing = match list_interfaces(&dir) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Could not list network interfaces");
                continue;
            }
        };
        for name in watcher.update(listing) {
            if events.send(PlatformEvent::NetworkInterface(name)).await.is_err() {
                debug!("Platform event receiver gone, network watch stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_baseline_reports_nothing() {
        let mut watcher = InterfaceWatcher::new();
        assert!(watcher.update(set(&["eth0", "wlan0"])).is_empty());
        assert_eq!(watcher.current(), None);
    }

    #[test]
    fn test_appear_then_vanish() {
        let mut watcher = InterfaceWatcher::new();
        watcher.update(set(&["eth0"]));

        assert_eq!(watcher.update(set(&["eth0", "usb0"])), vec!["usb0".to_string()]);
        assert_eq!(watcher.current(), Some("usb0"));
        assert!(watcher.update(set(&["eth0", "usb0"])).is_empty());

        assert_eq!(watcher.update(set(&["eth0"])), vec![String::new()]);
        assert_eq!(watcher.current(), None);
    }

    #[test]
    fn test_unrelated_removal_is_silent() {
        let mut watcher = InterfaceWatcher::new();
        watcher.update(set(&["eth0", "wlan0"]));
        watcher.update(set(&["eth0", "wlan0", "usb0"]));
        assert!(watcher.update(set(&["eth0", "usb0"])).is_empty());
    }

    #[test]
    fn test_list_skips_loopback() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["lo", "eth0", "usb0"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(list_interfaces(dir.path()).unwrap(), set(&["eth0", "usb0"]));
    }

    #[tokio::test]
    async fn test_watch_reports_new_interface() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("eth0")).unwrap();
        let (tx, rx) = async_channel::unbounded();
        let watch = tokio::spawn(watch_network_interfaces(
            dir.path().to_path_buf(),
            Duration::from_millis(10),
            tx,
        ));

        // Let the baseline listing happen first
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::create_dir(dir.path().join("usb0")).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PlatformEvent::NetworkInterface("usb0".into()));
        watch.abort();
    }
}
