//! Host Configuration model
//!
//! Typed view over the declarative document consumed by the remote engine.
//! Only the fields the orchestrator reads or rewrites are typed; everything
//! else is carried in a flattened `extra` mapping on each level so a
//! read-modify-write cycle keeps unknown fields. Key order and formatting are
//! not preserved.

use crate::error::{Result, RolloutError};
use crate::yaml_tags::TagRegistry;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Root document
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Os>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trident: Option<TridentSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Health>,

    /// Lifecycle operations the engine may perform for this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_operations: Option<Vec<AllowedOperation>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_params: Option<Mapping>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl HostConfiguration {
    /// Parse a Host Configuration document, resolving custom tags first.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, &TagRegistry::with_defaults())
    }

    pub fn parse_with(text: &str, registry: &TagRegistry) -> Result<Self> {
        let value = registry.parse(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Mapping(_) => {
                serde_yaml::from_value(value).map_err(|e| RolloutError::Parse(e.to_string()))
            }
            other => Err(RolloutError::Parse(format!(
                "host configuration must be a mapping, found {}",
                crate::yaml_tags::value_kind(&other)
            ))),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    /// Id of the first partition typed `esp`, scanning disks in order.
    pub fn esp_partition_id(&self) -> Option<&str> {
        self.storage()?
            .disks()
            .iter()
            .flat_map(|disk| disk.partitions())
            .find(|partition| partition.is_esp())
            .map(|partition| partition.id.as_str())
    }

    /// Ids of every A/B volume pair, in declaration order.
    pub fn ab_volume_pair_ids(&self) -> Vec<&str> {
        self.storage()
            .and_then(|s| s.ab_update.as_ref())
            .map(|ab| ab.volume_pairs.iter().map(|p| p.id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn self_upgrade(&self) -> Option<bool> {
        self.trident.as_ref().and_then(|t| t.self_upgrade)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.os
            .as_ref()?
            .users
            .as_ref()?
            .iter()
            .find(|u| u.name == name)
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<Disk>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystems: Option<Vec<Filesystem>>,

    /// Older schema: verity pairs carrying their own image sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verity_filesystems: Option<Vec<VerityFilesystem>>,

    /// Newer schema: verity devices referenced by a filesystem's `deviceId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verity: Option<Vec<VerityDevice>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_update: Option<AbUpdate>,

    /// Opaque to the transforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Value>,

    /// Opaque to the transforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raid: Option<Value>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl Storage {
    pub fn disks(&self) -> &[Disk] {
        self.disks.as_deref().unwrap_or_default()
    }

    pub fn filesystems(&self) -> &[Filesystem] {
        self.filesystems.as_deref().unwrap_or_default()
    }

    pub fn verity_filesystems(&self) -> &[VerityFilesystem] {
        self.verity_filesystems.as_deref().unwrap_or_default()
    }

    pub fn verity(&self) -> &[VerityDevice] {
        self.verity.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<Vec<Partition>>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl Disk {
    pub fn partitions(&self) -> &[Partition] {
        self.partitions.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub id: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub partition_type: Option<String>,

    /// Either a size string (`1G`, `512M`) or `grow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Value>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl Partition {
    pub fn is_esp(&self) -> bool {
        self.partition_type.as_deref() == Some("esp")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filesystem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<MountPoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FilesystemSource>,

    #[serde(flatten)]
    pub extra: Mapping,
}

/// A mount point written either as a bare path or as `{path, options}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountPoint {
    Path(String),
    Detailed(MountPointDetail),
}

impl MountPoint {
    pub fn path(&self) -> &str {
        match self {
            MountPoint::Path(path) => path,
            MountPoint::Detailed(detail) => &detail.path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountPointDetail {
    pub path: String,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemSource {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl FilesystemSource {
    /// Sources whose content is streamed from an image file.
    pub fn is_image(&self) -> bool {
        matches!(self.kind.as_str(), "image" | "esp-image")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerityFilesystem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub data_device_id: String,
    pub hash_device_id: String,
    pub data_image: ImageRef,
    pub hash_image: ImageRef,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerityDevice {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub data_device_id: String,
    pub hash_device_id: String,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbUpdate {
    #[serde(default)]
    pub volume_pairs: Vec<VolumePair>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePair {
    pub id: String,
    pub volume_a_id: String,
    pub volume_b_id: String,

    #[serde(flatten)]
    pub extra: Mapping,
}

// ============================================================================
// OS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Os {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<User>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Services>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_files: Option<Vec<AdditionalFile>>,

    #[serde(flatten)]
    pub extra: Mapping,
}

/// Netplan-style network section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethernets: Option<BTreeMap<String, Ethernet>>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ethernet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp4: Option<bool>,

    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_rule: Option<InterfaceMatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,

    #[serde(rename = "set-name", default, skip_serializing_if = "Option::is_none")]
    pub set_name: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macaddress: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub to: String,
    pub via: String,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_keys: Option<Vec<String>>,

    /// Older schema spelling of `sshPublicKeys`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Services {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdditionalFile {
    pub destination: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

// ============================================================================
// Engine settings and health checks
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TridentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_upgrade: Option<bool>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Health {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<HealthCheck>>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_on: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systemd_services: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(flatten)]
    pub extra: Mapping,
}

/// Lifecycle operation the engine may be allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowedOperation {
    Stage,
    Finalize,
}

impl AllowedOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Finalize => "finalize",
        }
    }

    /// Operations for the given stage/finalize request, in engine order.
    pub fn requested(stage: bool, finalize: bool) -> Vec<AllowedOperation> {
        let mut ops = Vec::new();
        if stage {
            ops.push(Self::Stage);
        }
        if finalize {
            ops.push(Self::Finalize);
        }
        ops
    }

    pub fn join(ops: &[AllowedOperation]) -> String {
        ops.iter()
            .map(|op| op.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for AllowedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllowedOperation {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stage" => Ok(Self::Stage),
            "finalize" => Ok(Self::Finalize),
            other => Err(RolloutError::Config(format!(
                "unknown allowed operation '{}' (expected stage or finalize)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
storage:
  disks:
    - id: os
      device: /dev/sda
      partitionTableType: gpt
      partitions:
        - id: esp
          type: esp
          size: 1G
        - id: root-a
          type: root
          size: 8G
        - id: root-b
          type: root
          size: 8G
        - id: home
          type: home
          size: grow
  abUpdate:
    volumePairs:
      - id: root
        volumeAId: root-a
        volumeBId: root-b
  filesystems:
    - deviceId: esp
      mountPoint:
        path: /boot/efi
        options: umask=0077
      source:
        type: esp-image
        url: http://host/files/esp.rawzst
    - deviceId: root
      mountPoint: /
      source:
        type: image
        url: http://host/files/root.rawzst
        sha256: ignored
    - deviceId: home
      mountPoint: /home
      source:
        type: new
os:
  network:
    version: 2
    ethernets:
      eth0:
        dhcp4: true
  users:
    - name: testing-user
      sshPublicKeys: ["ssh-rsa AAAA"]
      sshMode: key-only
trident:
  selfUpgrade: true
  phonehome: http://10.0.0.1/phonehome
scripts:
  postConfigure:
    - name: hello
      content: echo hi
"#;

    #[test]
    fn test_parse_reads_typed_fields() {
        let hc = HostConfiguration::parse(SAMPLE).unwrap();
        assert_eq!(hc.esp_partition_id(), Some("esp"));
        assert_eq!(hc.ab_volume_pair_ids(), vec!["root"]);
        assert_eq!(hc.self_upgrade(), Some(true));

        let storage = hc.storage().unwrap();
        assert_eq!(storage.filesystems().len(), 3);
        assert_eq!(
            storage.filesystems()[0].mount_point.as_ref().map(MountPoint::path),
            Some("/boot/efi")
        );
        assert!(storage.filesystems()[1].source.as_ref().unwrap().is_image());
        assert!(!storage.filesystems()[2].source.as_ref().unwrap().is_image());
        assert_eq!(
            hc.user("testing-user").unwrap().ssh_public_keys.as_deref(),
            Some(&["ssh-rsa AAAA".to_string()][..])
        );
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let hc = HostConfiguration::parse(SAMPLE).unwrap();
        let text = hc.to_yaml().unwrap();

        let original: Value = serde_yaml::from_str(SAMPLE).unwrap();
        let reparsed: Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(original, reparsed);

        assert!(text.contains("partitionTableType"));
        assert!(text.contains("sshMode"));
        assert!(text.contains("phonehome"));
    }

    #[test]
    fn test_empty_run_on_survives_round_trip() {
        let text = "health:\n  checks:\n    - name: noop\n      content: \"true\"\n      runOn: []\n";
        let hc = HostConfiguration::parse(text).unwrap();
        let check = &hc.health.as_ref().unwrap().checks.as_ref().unwrap()[0];
        assert_eq!(check.run_on, Some(Vec::new()));

        let out = hc.to_yaml().unwrap();
        assert!(out.contains("runOn: []"));
        assert_eq!(HostConfiguration::parse(&out).unwrap(), hc);
    }

    #[test]
    fn test_empty_document_is_default() {
        let hc = HostConfiguration::parse("").unwrap();
        assert_eq!(hc, HostConfiguration::default());
        assert_eq!(hc.esp_partition_id(), None);
        assert!(hc.ab_volume_pair_ids().is_empty());
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        let err = HostConfiguration::parse("- a\n- b\n").unwrap_err();
        assert!(matches!(err, RolloutError::Parse(_)));
    }

    #[test]
    fn test_allowed_operations_join() {
        assert_eq!(AllowedOperation::join(&AllowedOperation::requested(true, true)), "stage,finalize");
        assert_eq!(AllowedOperation::join(&AllowedOperation::requested(false, true)), "finalize");
        assert!(AllowedOperation::requested(false, false).is_empty());
        assert_eq!("Finalize".parse::<AllowedOperation>().unwrap(), AllowedOperation::Finalize);
        assert!("rollback".parse::<AllowedOperation>().is_err());
    }
}
