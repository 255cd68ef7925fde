//! Host Status
//!
//! Document printed by `trident get`: the Host Configuration the host was
//! provisioned from (`spec`) plus runtime servicing state.

use crate::error::{Result, RolloutError};
use crate::host_config::HostConfiguration;
use crate::yaml_tags::TagRegistry;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    #[serde(default)]
    pub spec: HostConfiguration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servicing_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servicing_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_active_volume: Option<AbVolume>,

    /// Runtime block device paths, kept opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Value>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl HostStatus {
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, &TagRegistry::with_defaults())
    }

    pub fn parse_with(text: &str, registry: &TagRegistry) -> Result<Self> {
        let value = registry.parse(text)?;
        if !value.is_mapping() {
            return Err(RolloutError::Parse(
                "host status output is not a YAML mapping".to_string(),
            ));
        }
        serde_yaml::from_value(value).map_err(|e| RolloutError::Parse(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn has_error(&self) -> bool {
        self.last_error.as_ref().is_some_and(|e| !e.is_null())
    }
}

/// Side of every A/B pair currently serving the running OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbVolume {
    VolumeA,
    VolumeB,
}

impl AbVolume {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VolumeA => "volume-a",
            Self::VolumeB => "volume-b",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::VolumeA => Self::VolumeB,
            Self::VolumeB => Self::VolumeA,
        }
    }
}

impl fmt::Display for AbVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = r#"
spec:
  image: !image
    url: http://files/regular.cosi
    sha384: ignored
  storage:
    disks:
      - id: os
        partitions:
          - id: esp
            type: esp
            size: 1G
    abUpdate:
      volumePairs:
        - id: root
          volumeAId: root-a
          volumeBId: root-b
servicingState: provisioned
servicingType: no-active-servicing
abActiveVolume: volume-a
storage:
  blockDevices:
    esp:
      path: /dev/sda1
lastError: null
"#;

    #[test]
    fn test_parse_host_status_with_image_tag() {
        let status = HostStatus::parse(STATUS).unwrap();
        assert_eq!(status.ab_active_volume, Some(AbVolume::VolumeA));
        assert_eq!(status.servicing_state.as_deref(), Some("provisioned"));
        assert_eq!(status.spec.esp_partition_id(), Some("esp"));
        assert!(!status.has_error());

        let image = status.spec.extra.get("image").unwrap();
        assert_eq!(image.get("url").and_then(Value::as_str), Some("http://files/regular.cosi"));
    }

    #[test]
    fn test_round_trip_is_semantically_equal() {
        let status = HostStatus::parse(STATUS).unwrap();
        let text = status.to_yaml().unwrap();
        let again = HostStatus::parse(&text).unwrap();
        assert_eq!(status, again);
    }

    #[test]
    fn test_other_volume() {
        assert_eq!(AbVolume::VolumeA.other(), AbVolume::VolumeB);
        assert_eq!(AbVolume::VolumeB.to_string(), "volume-b");
    }

    #[test]
    fn test_scalar_output_is_parse_error() {
        let err = HostStatus::parse("permission denied").unwrap_err();
        assert!(matches!(err, RolloutError::Parse(_)));
    }
}
