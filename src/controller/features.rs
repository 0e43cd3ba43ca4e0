//! ArangoDB version parsing and version gated capabilities

use std::cmp::Ordering;
use std::fmt;

use crate::controller::error::{Error, Result};
use crate::crd::ImageInfo;

/// A semantic ArangoDB version such as 3.7.10
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArangoVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ArangoVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse "3.7.10", "3.7" or "v3.7.10-1"; trailing build suffixes are ignored
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().trim_start_matches('v');
        let core = value.split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl PartialOrd for ArangoVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArangoVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for ArangoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Derive version and edition from an image reference such as
/// "arangodb/enterprise:3.7.10" or "registry:5000/arangodb/arangodb:3.6.4@sha256:..."
pub fn discover_image(image: &str) -> Result<ImageInfo> {
    let without_digest = image.split('@').next().unwrap_or(image);
    let name_start = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let last = &without_digest[name_start..];
    let (name, tag) = match last.split_once(':') {
        Some((name, tag)) => (name, tag),
        None => (last, "latest"),
    };

    let version = ArangoVersion::parse(tag).ok_or_else(|| {
        Error::ValidationError(format!(
            "cannot determine ArangoDB version of image {} from tag {:?}",
            image, tag
        ))
    })?;

    let enterprise = name.contains("enterprise") || tag.contains("enterprise");

    Ok(ImageInfo {
        image: image.to_string(),
        image_id: image.split_once('@').map(|(_, digest)| digest.to_string()),
        arangodb_version: version.to_string(),
        enterprise,
    })
}

/// Capabilities that depend on the running ArangoDB version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// arangod reads the JWT secret from a keyfile
    JwtSecretKeyfile,
    /// arangod reads all JWT secrets from a folder and reloads them at runtime
    JwtRotation,
    /// arangod reloads its TLS keyfile at runtime
    TlsRotation,
}

impl Feature {
    pub fn name(&self) -> &'static str {
        match self {
            Feature::JwtSecretKeyfile => "jwt-secret-keyfile",
            Feature::JwtRotation => "jwt-rotation",
            Feature::TlsRotation => "tls-rotation",
        }
    }

    /// Whether the feature is available on the given version and edition
    pub fn supported(&self, version: ArangoVersion, enterprise: bool) -> bool {
        match self {
            Feature::JwtSecretKeyfile => {
                (version >= ArangoVersion::new(3, 3, 22) && version < ArangoVersion::new(3, 4, 0))
                    || version >= ArangoVersion::new(3, 4, 2)
            }
            Feature::JwtRotation | Feature::TlsRotation => {
                enterprise && version >= ArangoVersion::new(3, 7, 0)
            }
        }
    }

    pub fn supported_by(&self, image: &ImageInfo) -> bool {
        ArangoVersion::parse(&image.arangodb_version)
            .map(|v| self.supported(v, image.enterprise))
            .unwrap_or(false)
    }
}

/// Check that members may move from one version to another in place
///
/// Patch changes are always allowed. Minor upgrades may not skip a minor
/// release, minor downgrades and major changes are refused.
pub fn validate_version_change(from: ArangoVersion, to: ArangoVersion) -> Result<()> {
    if from.major != to.major {
        return Err(Error::UnsupportedUpgrade(format!(
            "major version change from {} to {} is not supported",
            from, to
        )));
    }
    if to.minor < from.minor {
        return Err(Error::UnsupportedUpgrade(format!(
            "downgrade from {} to {} is not supported",
            from, to
        )));
    }
    if to.minor > from.minor + 1 {
        return Err(Error::UnsupportedUpgrade(format!(
            "upgrade from {} to {} skips a minor version",
            from, to
        )));
    }
    Ok(())
}
