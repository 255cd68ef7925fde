//! A/B staging transform
//!
//! Rewrites image source URLs so the remote engine stages a new OS version
//! onto the inactive side of every A/B volume pair (plus the ESP). Devices
//! outside that set are never touched.
//!
//! Raw images are referenced per filesystem. A COSI bundle is referenced once,
//! by the top-level `image.url`, and filesystems carry no image source.

use crate::engine::RuntimeEnv;
use crate::error::{Result, RolloutError};
use crate::host_config::HostConfiguration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Trailing `_v<N>` left by a previous staging run.
static VERSION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<base>.+?)(?:_v\d+)?$").unwrap());

// ============================================================================
// Packaging format
// ============================================================================

/// How OS images are packaged on the host, which fixes the file extension the
/// base image name is extracted from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagingFormat {
    /// Per-partition zstd-compressed raw images.
    #[default]
    RawZst,
    /// Composable OS image bundle.
    Cosi,
}

impl PackagingFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawZst => "rawzst",
            Self::Cosi => "cosi",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::RawZst => ".rawzst",
            Self::Cosi => ".cosi",
        }
    }

    /// Extract the base image name from a URL's final path segment, dropping
    /// the extension and any `_v<N>` suffix.
    pub fn base_name<'a>(&self, url: &'a str) -> Result<&'a str> {
        let file_name = url.rsplit('/').next().unwrap_or(url);
        let stem = file_name.strip_suffix(self.extension()).ok_or_else(|| {
            RolloutError::TransformPrecondition(format!(
                "image URL '{}' does not end in '{}' as required by the {} packaging format",
                url,
                self.extension(),
                self.as_str()
            ))
        })?;

        let base = VERSION_SUFFIX
            .captures(stem)
            .and_then(|c| c.name("base"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if base.is_empty() {
            return Err(RolloutError::TransformPrecondition(format!(
                "image URL '{}' has an empty image name",
                url
            )));
        }
        Ok(base)
    }
}

impl fmt::Display for PackagingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackagingFormat {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('.').to_lowercase().as_str() {
            "rawzst" => Ok(Self::RawZst),
            "cosi" => Ok(Self::Cosi),
            other => Err(RolloutError::Config(format!(
                "unknown packaging format '{}' (expected rawzst or cosi)",
                other
            ))),
        }
    }
}

// ============================================================================
// Stage parameters
// ============================================================================

/// Rollout parameters for one staging run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageParams {
    pub version: String,
    /// Directory on the host holding the new images.
    pub destination_dir: String,
    pub runtime_env: RuntimeEnv,
    pub packaging: PackagingFormat,
}

impl StageParams {
    pub fn new(version: impl Into<String>, destination_dir: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            destination_dir: destination_dir.into(),
            runtime_env: RuntimeEnv::Host,
            packaging: PackagingFormat::RawZst,
        }
    }

    pub fn with_runtime_env(mut self, runtime_env: RuntimeEnv) -> Self {
        self.runtime_env = runtime_env;
        self
    }

    pub fn with_packaging(mut self, packaging: PackagingFormat) -> Self {
        self.packaging = packaging;
        self
    }

    fn validate(&self) -> Result<()> {
        let version = self.version.trim();
        if version.is_empty() || version.contains('/') || version.contains(char::is_whitespace) {
            return Err(RolloutError::Config(format!(
                "invalid image version '{}'",
                self.version
            )));
        }
        Ok(())
    }

    /// New URL for an image currently served from `old_url`.
    pub fn rewrite_url(&self, old_url: &str) -> Result<String> {
        let base = self.packaging.base_name(old_url)?;
        let dir = self.destination_dir.trim_matches('/');
        let mut url = format!("file://{}", self.runtime_env.host_root());
        if !dir.is_empty() {
            url.push_str(dir);
            url.push('/');
        }
        url.push_str(&format!(
            "{}_v{}{}",
            base,
            self.version.trim(),
            self.packaging.extension()
        ));
        Ok(url)
    }
}

// ============================================================================
// Update targets
// ============================================================================

/// Device ids whose images are rewritten by a staging run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateTargets {
    pub esp_id: Option<String>,
    pub ab_ids: BTreeSet<String>,
    /// Verity device ids whose data device belongs to an A/B pair.
    pub verity_ids: BTreeSet<String>,
}

impl UpdateTargets {
    /// Collect the targets and check that every A/B volume pair is backed by
    /// a filesystem or a verity data/hash device.
    pub fn collect(hc: &HostConfiguration) -> Result<Self> {
        let esp_id = hc.esp_partition_id().map(str::to_string);
        let ab_ids: BTreeSet<String> = hc
            .ab_volume_pair_ids()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut referenced = BTreeSet::new();
        let mut verity_ids = BTreeSet::new();
        if let Some(storage) = hc.storage() {
            referenced.extend(
                storage
                    .filesystems()
                    .iter()
                    .filter_map(|fs| fs.device_id.as_deref()),
            );
            for vfs in storage.verity_filesystems() {
                referenced.insert(vfs.data_device_id.as_str());
                referenced.insert(vfs.hash_device_id.as_str());
            }
            for verity in storage.verity() {
                referenced.insert(verity.data_device_id.as_str());
                referenced.insert(verity.hash_device_id.as_str());
                if ab_ids.contains(&verity.data_device_id) {
                    verity_ids.insert(verity.id.clone());
                }
            }
        }

        if let Some(missing) = ab_ids.iter().find(|id| !referenced.contains(id.as_str())) {
            return Err(RolloutError::TransformPrecondition(format!(
                "A/B volume pair '{}' is not referenced by any filesystem or verity device",
                missing
            )));
        }

        Ok(Self {
            esp_id,
            ab_ids,
            verity_ids,
        })
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.esp_id.as_deref() == Some(device_id)
            || self.ab_ids.contains(device_id)
            || self.verity_ids.contains(device_id)
    }
}

// ============================================================================
// Transform
// ============================================================================

/// Produce the configuration that stages `params.version` onto the inactive
/// A/B volumes. The input is left untouched.
pub fn stage_update(current: &HostConfiguration, params: &StageParams) -> Result<HostConfiguration> {
    params.validate()?;
    let targets = UpdateTargets::collect(current)?;
    debug!(?targets, "Collected A/B update targets");

    let mut next = current.clone();
    let rewritten = match params.packaging {
        PackagingFormat::RawZst => rewrite_raw_images(&mut next, &targets, params)?,
        PackagingFormat::Cosi => rewrite_cosi_image(&mut next, params)?,
    };

    next.trident.get_or_insert_with(Default::default).self_upgrade = Some(false);

    info!(
        version = %params.version,
        packaging = %params.packaging,
        rewritten,
        "Prepared host configuration for A/B staging"
    );
    Ok(next)
}

/// Point every eligible filesystem and verity image at the new version.
fn rewrite_raw_images(
    next: &mut HostConfiguration,
    targets: &UpdateTargets,
    params: &StageParams,
) -> Result<usize> {
    let mut rewritten = 0usize;

    if let Some(storage) = next.storage.as_mut() {
        for fs in storage.filesystems.iter_mut().flatten() {
            let Some(device_id) = fs.device_id.as_deref() else {
                continue;
            };
            let Some(source) = fs.source.as_mut() else {
                continue;
            };
            if !source.is_image() || !targets.contains(device_id) {
                continue;
            }
            let old = source.url.as_deref().ok_or_else(|| {
                RolloutError::TransformPrecondition(format!(
                    "image source of filesystem '{}' has no url",
                    device_id
                ))
            })?;
            let new = params.rewrite_url(old)?;
            debug!(device_id, old, new = %new, "Rewriting filesystem image");
            source.url = Some(new);
            rewritten += 1;
        }

        for vfs in storage.verity_filesystems.iter_mut().flatten() {
            if targets.contains(&vfs.data_device_id) {
                vfs.data_image.url = params.rewrite_url(&vfs.data_image.url)?;
                rewritten += 1;
            }
            if targets.contains(&vfs.hash_device_id) {
                vfs.hash_image.url = params.rewrite_url(&vfs.hash_image.url)?;
                rewritten += 1;
            }
        }
    }

    Ok(rewritten)
}

/// Point the top-level `image.url` at the new bundle.
fn rewrite_cosi_image(next: &mut HostConfiguration, params: &StageParams) -> Result<usize> {
    let url = next
        .extra
        .get_mut("image")
        .and_then(Value::as_mapping_mut)
        .and_then(|image| image.get_mut("url"))
        .ok_or_else(|| {
            RolloutError::TransformPrecondition(
                "COSI packaging requires a top-level image.url".to_string(),
            )
        })?;
    let old = url.as_str().ok_or_else(|| {
        RolloutError::TransformPrecondition("image.url must be a string".to_string())
    })?;

    let new = params.rewrite_url(old)?;
    debug!(old, new = %new, "Rewriting COSI image");
    *url = Value::String(new);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name_strips_extension_and_version() {
        let raw = PackagingFormat::RawZst;
        assert_eq!(raw.base_name("http://host/files/root.rawzst").unwrap(), "root");
        assert_eq!(raw.base_name("file:///abupdate/esp_v2.rawzst").unwrap(), "esp");
        assert_eq!(
            raw.base_name("file:///run/verity_roothash_v12.rawzst").unwrap(),
            "verity_roothash"
        );
        assert_eq!(raw.base_name("file:///x/root_var.rawzst").unwrap(), "root_var");

        let cosi = PackagingFormat::Cosi;
        assert_eq!(cosi.base_name("http://host/regular_v3.cosi").unwrap(), "regular");
    }

    #[test]
    fn test_base_name_rejects_other_packaging() {
        let err = PackagingFormat::Cosi
            .base_name("http://host/files/root.rawzst")
            .unwrap_err();
        assert!(matches!(err, RolloutError::TransformPrecondition(_)));

        let err = PackagingFormat::RawZst.base_name("file:///x/.rawzst").unwrap_err();
        assert!(matches!(err, RolloutError::TransformPrecondition(_)));
    }

    #[test]
    fn test_rewrite_url_per_runtime() {
        let host = StageParams::new("5", "/abupdate/");
        assert_eq!(
            host.rewrite_url("http://host/files/root.rawzst").unwrap(),
            "file:///abupdate/root_v5.rawzst"
        );

        let container = StageParams::new("5", "abupdate").with_runtime_env(RuntimeEnv::Container);
        assert_eq!(
            container.rewrite_url("http://host/files/root.rawzst").unwrap(),
            "file:///host/abupdate/root_v5.rawzst"
        );

        let no_dir = StageParams::new("7", "/");
        assert_eq!(
            no_dir.rewrite_url("http://host/files/esp.rawzst").unwrap(),
            "file:///esp_v7.rawzst"
        );
    }

    #[test]
    fn test_packaging_from_str() {
        assert_eq!("cosi".parse::<PackagingFormat>().unwrap(), PackagingFormat::Cosi);
        assert_eq!(".RAWZST".parse::<PackagingFormat>().unwrap(), PackagingFormat::RawZst);
        assert!("vhd".parse::<PackagingFormat>().is_err());
    }

    #[test]
    fn test_invalid_version_is_rejected() {
        let hc = HostConfiguration::default();
        let err = stage_update(&hc, &StageParams::new("", "/abupdate")).unwrap_err();
        assert!(matches!(err, RolloutError::Config(_)));
        let err = stage_update(&hc, &StageParams::new("1/2", "/abupdate")).unwrap_err();
        assert!(matches!(err, RolloutError::Config(_)));
    }
}
