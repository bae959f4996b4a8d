//! Board detection
//!
//! [`PortWatcher`] turns serial port arrivals and removals into
//! [`DeviceDetector`] calls. The detector matches the USB ids against the
//! catalog and publishes the latest detection in a single-slot channel:
//! a newer detection replaces one the coordinator has not looked at yet.

use std::collections::BTreeMap;
use std::time::Duration;

use serialport::SerialPortType;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::catalog::{BoardId, SharedCatalog};
use crate::error::Result;
use crate::events::{UiEvent, UiHandle};
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "devices";

/// A known board that just showed up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub board_id: BoardId,
    /// Serial device path (`/dev/ttyACM0`, `COM3`)
    pub port: String,
    pub in_bootloader: bool,
    pub board_type: String,
}

pub struct DeviceDetector {
    catalog: SharedCatalog,
    slot: watch::Sender<Option<Detection>>,
    ui: UiHandle,
}

impl DeviceDetector {
    pub fn new(catalog: SharedCatalog, ui: UiHandle) -> Self {
        let (slot, _) = watch::channel(None);
        Self { catalog, slot, ui }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Detection>> {
        self.slot.subscribe()
    }

    /// The board currently managed, if any
    pub fn current(&self) -> Option<Detection> {
        self.slot.borrow().clone()
    }

    /// A serial device appeared. Normal-mode ids are matched first.
    pub fn attach(&self, port: &str, vendor_id: u16, product_id: u16) -> Option<Detection> {
        let id = BoardId::new(vendor_id, product_id);
        let catalog = self.catalog.snapshot();

        let in_bootloader = if catalog.is_normal(id) {
            false
        } else if catalog.is_bootloader(id) {
            true
        } else {
            log_debug!(MODULE, "Ignoring {} {}: not a known board", port, id);
            return None;
        };

        let Some(board_type) = catalog.board_type(id) else {
            log_warn!(MODULE, "{} {} has no board type", port, id);
            return None;
        };

        let detection = Detection {
            board_id: id,
            port: port.to_string(),
            in_bootloader,
            board_type: board_type.to_string(),
        };
        log_info!(
            MODULE,
            "Detected {} {} on {} ({} mode)",
            detection.board_type,
            id,
            port,
            if in_bootloader { "bootloader" } else { "normal" }
        );

        self.ui.set_controls(false);
        self.slot.send_replace(Some(detection.clone()));
        Some(detection)
    }

    /// A serial device went away. Returns true if it was the managed board.
    pub fn detach(&self, port: &str) -> bool {
        let managed = self
            .slot
            .borrow()
            .as_ref()
            .is_some_and(|current| current.port == port);
        if !managed {
            return false;
        }

        if let Some(previous) = self.slot.send_replace(None) {
            log_info!(MODULE, "{} removed from {}", previous.board_type, port);
            self.ui.send(UiEvent::SessionTeardown {
                port: previous.port,
                board_type: previous.board_type,
            });
            self.ui.set_controls(false);
        }
        true
    }
}

/// USB serial ports with their ids
pub type PortMap = BTreeMap<String, BoardId>;

/// Ports added and removed between two scans
pub fn diff_ports(previous: &PortMap, current: &PortMap) -> (Vec<(String, BoardId)>, Vec<String>) {
    let added = current
        .iter()
        .filter(|(port, id)| previous.get(*port) != Some(*id))
        .map(|(port, id)| (port.clone(), *id))
        .collect();
    let removed = previous
        .keys()
        .filter(|port| !current.contains_key(*port))
        .cloned()
        .collect();
    (added, removed)
}

pub fn scan_usb_ports() -> Result<PortMap> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => Some((port.port_name, BoardId::new(usb.vid, usb.pid))),
            _ => None,
        })
        .collect())
}

/// Polls the system's serial ports and feeds the detector
pub struct PortWatcher {
    detector: DeviceDetector,
    interval: Duration,
}

impl PortWatcher {
    pub fn new(detector: DeviceDetector, interval: Duration) -> Self {
        Self { detector, interval }
    }

    pub fn detector(&self) -> &DeviceDetector {
        &self.detector
    }

    /// Apply one scan; boards already present on the first scan count as arrivals
    pub fn apply(&self, previous: &PortMap, current: &PortMap) {
        let (added, removed) = diff_ports(previous, current);
        for port in removed {
            self.detector.detach(&port);
        }
        for (port, id) in added {
            // a port whose ids changed was replugged as a different device
            if previous.contains_key(&port) {
                self.detector.detach(&port);
            }
            self.detector.attach(&port, id.vendor_id, id.product_id);
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        log_info!(
            MODULE,
            "Watching serial ports every {} ms",
            self.interval.as_millis()
        );
        let mut known = PortMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let scan = match tokio::task::spawn_blocking(scan_usb_ports).await {
                Ok(Ok(scan)) => scan,
                Ok(Err(e)) => {
                    log_warn!(MODULE, "Port scan failed: {}", e);
                    continue;
                }
                Err(e) => {
                    log_warn!(MODULE, "Port scan task failed: {}", e);
                    continue;
                }
            };

            self.apply(&known, &scan);
            known = scan;
        }

        log_debug!(MODULE, "Port watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::SAMPLE;
    use crate::catalog::Catalog;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn detector() -> (DeviceDetector, UnboundedReceiver<UiEvent>) {
        let catalog = SharedCatalog::with_catalog(
            std::path::Path::new("info.json"),
            Catalog::parse(SAMPLE).unwrap(),
        );
        let (ui, rx) = UiHandle::channel();
        (DeviceDetector::new(catalog, ui), rx)
    }

    fn ports(entries: &[(&str, u16, u16)]) -> PortMap {
        entries
            .iter()
            .map(|(port, vid, pid)| (port.to_string(), BoardId::new(*vid, *pid)))
            .collect()
    }

    #[test]
    fn test_attach_matches_normal_first() {
        let (detector, _rx) = detector();
        let detection = detector.attach("/dev/ttyACM0", 0x2886, 0x0018).unwrap();
        assert!(!detection.in_bootloader);
        assert_eq!(detection.board_type, "xiao");

        let detection = detector.attach("/dev/ttyACM1", 0x2886, 0x002D).unwrap();
        assert!(detection.in_bootloader);
        assert_eq!(detection.board_type, "wio_terminal");
        // newest detection replaces the pending one
        assert_eq!(detector.current().unwrap().port, "/dev/ttyACM1");
    }

    #[test]
    fn test_unknown_board_is_ignored() {
        let (detector, _rx) = detector();
        let rx = detector.subscribe();
        assert!(detector.attach("/dev/ttyUSB0", 0x0403, 0x6001).is_none());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_detach_tears_down_managed_board_only() {
        let (detector, mut rx) = detector();
        detector.attach("/dev/ttyACM0", 0x2886, 0x802D).unwrap();
        assert!(!detector.detach("/dev/ttyACM9"));
        assert!(detector.detach("/dev/ttyACM0"));
        assert!(detector.current().is_none());

        let mut teardown = None;
        while let Ok(event) = rx.try_recv() {
            if let UiEvent::SessionTeardown { port, board_type } = event {
                teardown = Some((port, board_type));
            }
        }
        assert_eq!(
            teardown,
            Some(("/dev/ttyACM0".to_string(), "wio_terminal".to_string()))
        );
    }

    #[test]
    fn test_diff_ports() {
        let before = ports(&[("a", 1, 1), ("b", 2, 2)]);
        let after = ports(&[("b", 2, 2), ("c", 3, 3)]);
        let (added, removed) = diff_ports(&before, &after);
        assert_eq!(added, vec![("c".to_string(), BoardId::new(3, 3))]);
        assert_eq!(removed, vec!["a".to_string()]);

        let (added, removed) = diff_ports(&after, &after);
        assert!(added.is_empty() && removed.is_empty());
    }

    #[test]
    fn test_one_attach_per_arrival() {
        let (detector, _rx) = detector();
        let mut rx = detector.subscribe();
        let watcher = PortWatcher::new(detector, Duration::from_secs(1));

        let empty = PortMap::new();
        let present = ports(&[("/dev/ttyACM0", 0x2886, 0x802D)]);

        watcher.apply(&empty, &present);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        // board still there on the next scan: nothing new
        watcher.apply(&present, &present);
        assert!(!rx.has_changed().unwrap());

        // re-enumerated in bootloader mode on the same port
        let replugged = ports(&[("/dev/ttyACM0", 0x2886, 0x002D)]);
        watcher.apply(&present, &replugged);
        assert!(rx.borrow_and_update().as_ref().unwrap().in_bootloader);
    }
}
