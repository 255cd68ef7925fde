//! Network and device rewrites for lab hosts
//!
//! Reduces the Host Configuration's network to the single management
//! interface of a bare-metal machine and makes the engine wait for that
//! interface before it starts.

use crate::error::{Result, RolloutError};
use crate::host_config::{
    AdditionalFile, Ethernet, HostConfiguration, InterfaceMatch, MountPoint, Network, Route,
};
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DEFAULT_PREFIX_LEN: u8 = 23;

/// Drop-in that orders the engine service after the interface is online.
pub const ENGINE_SERVICE_OVERRIDE: &str = "/etc/systemd/system/trident.service.d/override.conf";

const WRITABLE_ETC_OVERLAY_HOOKS: &str = "writableEtcOverlayHooks";
const UKI: &str = "uki";
const OVERRIDE_PCRLOCK_ENCRYPTION: &str = "overridePcrlockEncryption";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub interface_name: String,
    pub address: String,
    pub prefix_len: u8,
    pub mac_address: Option<String>,
    pub gateway: Option<String>,
    pub dhcp: bool,
    /// Disk id to device path.
    pub disk_devices: BTreeMap<String, String>,
}

impl NetworkParams {
    pub fn new(interface_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            interface_name: interface_name.into(),
            address: address.into(),
            prefix_len: DEFAULT_PREFIX_LEN,
            mac_address: None,
            gateway: None,
            dhcp: false,
            disk_devices: BTreeMap::new(),
        }
    }

    pub fn wait_online_service(&self) -> String {
        format!("systemd-networkd-wait-online@{}.service", self.interface_name)
    }

    fn ethernet(&self) -> Ethernet {
        Ethernet {
            addresses: Some(vec![format!("{}/{}", self.address, self.prefix_len)]),
            dhcp4: Some(self.dhcp),
            match_rule: self.mac_address.as_ref().map(|mac| InterfaceMatch {
                macaddress: Some(mac.clone()),
                ..Default::default()
            }),
            routes: self.gateway.as_ref().map(|gw| {
                vec![Route {
                    to: "0.0.0.0/0".to_string(),
                    via: gw.clone(),
                    ..Default::default()
                }]
            }),
            set_name: Some(self.interface_name.clone()),
            ..Default::default()
        }
    }
}

/// Replace the network section with the management interface described by
/// `params` and apply the matching service and device adjustments.
pub fn rewrite_network(current: &HostConfiguration, params: &NetworkParams) -> Result<HostConfiguration> {
    if params.interface_name.trim().is_empty() {
        return Err(RolloutError::Config("interface name must not be empty".to_string()));
    }

    let mut next = current.clone();
    let root_verity = is_root_verity(current)?;
    let service = params.wait_online_service();

    let os = next.os.get_or_insert_with(Default::default);
    let mut ethernets = BTreeMap::new();
    ethernets.insert(params.interface_name.clone(), params.ethernet());
    os.network = Some(Network {
        version: Some(2),
        ethernets: Some(ethernets),
        ..Default::default()
    });

    let enable = os
        .services
        .get_or_insert_with(Default::default)
        .enable
        .get_or_insert_with(Vec::new);
    if !enable.contains(&service) {
        enable.push(service.clone());
    }

    // Replace an existing drop-in so repeated runs do not stack copies.
    let files = os.additional_files.get_or_insert_with(Vec::new);
    files.retain(|f| f.destination != ENGINE_SERVICE_OVERRIDE);
    files.push(AdditionalFile {
        destination: ENGINE_SERVICE_OVERRIDE.to_string(),
        content: Some(format!("[Unit]\nRequires={service}\nAfter={service}\n")),
        ..Default::default()
    });

    if !params.disk_devices.is_empty() {
        let storage = next.storage.as_mut().ok_or_else(|| {
            RolloutError::TransformPrecondition(
                "disk devices were given but the configuration has no storage section".to_string(),
            )
        })?;
        for disk in storage.disks.iter_mut().flatten() {
            if let Some(device) = params.disk_devices.get(&disk.id) {
                debug!(disk = %disk.id, device = %device, "Remapping disk device");
                disk.device = Some(device.clone());
            }
        }
    }

    let internal = next.internal_params.get_or_insert_with(Default::default);
    if root_verity {
        info!("Root verity detected, enabling writable /etc overlay hooks");
        internal.insert(Value::from(WRITABLE_ETC_OVERLAY_HOOKS), Value::Bool(true));
    }
    if internal.get(UKI).and_then(Value::as_bool) == Some(true) {
        info!("UKI image detected, overriding pcrlock encryption");
        internal.insert(Value::from(OVERRIDE_PCRLOCK_ENCRYPTION), Value::Bool(true));
    }
    if internal.is_empty() {
        next.internal_params = None;
    }

    info!(interface = %params.interface_name, "Rewrote host network configuration");
    Ok(next)
}

/// Whether the root filesystem sits on the configuration's verity device.
pub fn is_root_verity(hc: &HostConfiguration) -> Result<bool> {
    let Some(storage) = hc.storage() else {
        return Ok(false);
    };
    let verity = match storage.verity() {
        [] => return Ok(false),
        [single] => single,
        many => {
            return Err(RolloutError::TransformPrecondition(format!(
                "expected at most one verity device, found {}",
                many.len()
            )))
        }
    };

    Ok(storage
        .filesystems()
        .iter()
        .find(|fs| fs.device_id.as_deref() == Some(verity.id.as_str()))
        .and_then(|fs| fs.mount_point.as_ref())
        .map(MountPoint::path)
        == Some("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERITY: &str = r#"
storage:
  disks:
    - id: os
      device: /dev/disk/by-path/pci-0000:00:1f.2-ata-1
      partitions:
        - id: esp
          type: esp
        - id: root-data-a
          type: root
        - id: root-hash-a
          type: root-verity
  verity:
    - id: root
      name: root
      dataDeviceId: root-data
      hashDeviceId: root-hash
  filesystems:
    - deviceId: root
      mountPoint:
        path: /
        options: ro
internalParams:
  uki: true
"#;

    #[test]
    fn test_root_verity_detection() {
        let hc = HostConfiguration::parse(VERITY).unwrap();
        assert!(is_root_verity(&hc).unwrap());

        let plain = HostConfiguration::parse("storage:\n  filesystems:\n    - deviceId: root\n      mountPoint: /\n").unwrap();
        assert!(!is_root_verity(&plain).unwrap());
    }

    #[test]
    fn test_multiple_verity_devices_rejected() {
        let hc = HostConfiguration::parse(
            r#"
storage:
  verity:
    - {id: a, dataDeviceId: a-data, hashDeviceId: a-hash}
    - {id: b, dataDeviceId: b-data, hashDeviceId: b-hash}
"#,
        )
        .unwrap();
        assert!(matches!(
            is_root_verity(&hc),
            Err(RolloutError::TransformPrecondition(_))
        ));
    }

    #[test]
    fn test_rewrite_network_single_interface() {
        let hc = HostConfiguration::parse(VERITY).unwrap();
        let mut params = NetworkParams::new("eno8303", "10.1.2.3");
        params.gateway = Some("10.1.2.1".to_string());
        params.mac_address = Some("aa:bb:cc:dd:ee:ff".to_string());
        params.disk_devices.insert("os".to_string(), "/dev/sda".to_string());

        let out = rewrite_network(&hc, &params).unwrap();
        let os = out.os.as_ref().unwrap();
        let ethernets = os.network.as_ref().unwrap().ethernets.as_ref().unwrap();
        assert_eq!(ethernets.len(), 1);
        let eth = &ethernets["eno8303"];
        assert_eq!(eth.addresses.as_deref(), Some(&["10.1.2.3/23".to_string()][..]));
        assert_eq!(eth.dhcp4, Some(false));
        assert_eq!(eth.routes.as_ref().unwrap()[0].via, "10.1.2.1");
        assert_eq!(
            eth.match_rule.as_ref().unwrap().macaddress.as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );

        let service = "systemd-networkd-wait-online@eno8303.service";
        assert!(os.services.as_ref().unwrap().enable.as_ref().unwrap().contains(&service.to_string()));
        assert_eq!(
            out.storage().unwrap().disks()[0].device.as_deref(),
            Some("/dev/sda")
        );

        let internal = out.internal_params.as_ref().unwrap();
        assert_eq!(internal.get(WRITABLE_ETC_OVERLAY_HOOKS), Some(&Value::Bool(true)));
        assert_eq!(internal.get(OVERRIDE_PCRLOCK_ENCRYPTION), Some(&Value::Bool(true)));

        // Input is untouched.
        assert!(hc.os.is_none());
    }

    #[test]
    fn test_rewrite_network_is_repeatable() {
        let hc = HostConfiguration::parse(VERITY).unwrap();
        let params = NetworkParams::new("eth0", "192.168.0.10");
        let once = rewrite_network(&hc, &params).unwrap();
        let twice = rewrite_network(&once, &params).unwrap();
        assert_eq!(once, twice);

        let os = twice.os.as_ref().unwrap();
        assert_eq!(os.additional_files.as_ref().unwrap().len(), 1);
        assert_eq!(os.services.as_ref().unwrap().enable.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_disk_remap_without_storage_is_precondition_error() {
        let mut params = NetworkParams::new("eth0", "192.168.0.10");
        params.disk_devices.insert("os".to_string(), "/dev/sda".to_string());
        let err = rewrite_network(&HostConfiguration::default(), &params).unwrap_err();
        assert!(matches!(err, RolloutError::TransformPrecondition(_)));
    }
}
