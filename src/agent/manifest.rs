//! Deployment manifest and generation naming
//!
//! A deployment pairs a version string with the two resource groups the
//! agent pre-caches. Each group is stored in its own generation named
//! `<prefix>-static-v<version>` or `<prefix>-audio-v<version>`.

use serde::{Deserialize, Serialize};

/// URLs designated for pre-caching, per group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceManifest {
    /// Application shell resources
    #[serde(default)]
    pub static_resources: Vec<String>,
    /// Audio clips
    #[serde(default)]
    pub audio_resources: Vec<String>,
}

impl ResourceManifest {
    /// Resources belonging to one generation kind
    pub fn resources(&self, kind: GenerationKind) -> &[String] {
        match kind {
            GenerationKind::Static => &self.static_resources,
            GenerationKind::Audio => &self.audio_resources,
        }
    }
}

/// A deployed version of the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Deployment version, embedded in generation names
    pub version: String,
    #[serde(flatten)]
    pub manifest: ResourceManifest,
}

impl Deployment {
    /// Parse a JSON deployment descriptor
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// The two classes of stored resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
    Static,
    Audio,
}

impl GenerationKind {
    pub fn label(self) -> &'static str {
        match self {
            GenerationKind::Static => "static",
            GenerationKind::Audio => "audio",
        }
    }
}

/// Generation names for one deployment version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationNames {
    prefix: String,
    static_name: String,
    audio_name: String,
}

impl GenerationNames {
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            static_name: format!("{}-{}-v{}", prefix, GenerationKind::Static.label(), version),
            audio_name: format!("{}-{}-v{}", prefix, GenerationKind::Audio.label(), version),
        }
    }

    pub fn name(&self, kind: GenerationKind) -> &str {
        match kind {
            GenerationKind::Static => &self.static_name,
            GenerationKind::Audio => &self.audio_name,
        }
    }

    /// Both current names, static first
    pub fn current(&self) -> [&str; 2] {
        [&self.static_name, &self.audio_name]
    }

    /// Whether a store name belongs to this subsystem
    pub fn is_owned(&self, name: &str) -> bool {
        is_owned_by(&self.prefix, name)
    }

    /// Owned by this subsystem but not one of the current generations
    pub fn is_stale(&self, name: &str) -> bool {
        self.is_owned(name) && !self.current().contains(&name)
    }
}

/// Whether a store name carries the given subsystem prefix
pub fn is_owned_by(prefix: &str, name: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_names_follow_convention() {
        let names = GenerationNames::new("offline-cache", "1.0.0");
        assert_eq!(names.name(GenerationKind::Static), "offline-cache-static-v1.0.0");
        assert_eq!(names.name(GenerationKind::Audio), "offline-cache-audio-v1.0.0");
    }

    #[test]
    fn test_stale_detection_spares_foreign_and_current_names() {
        let names = GenerationNames::new("offline-cache", "2");
        assert!(names.is_stale("offline-cache-static-v1"));
        assert!(names.is_stale("offline-cache-web-v1"));
        assert!(!names.is_stale("offline-cache-static-v2"));
        assert!(!names.is_stale("offline-cache-audio-v2"));
        assert!(!names.is_stale("other-app-static-v1"));
        // Shares the characters but not the prefix boundary
        assert!(!names.is_stale("offline-cachex-static-v1"));
    }

    #[test]
    fn test_deployment_descriptor_parses_flat_json() {
        let json = br#"{"version":"1.0.0","staticResources":["/","/index.html"],"audioResources":["/audio/a1.mp3"]}"#;
        let deployment = Deployment::from_json(json).unwrap();
        assert_eq!(deployment.version, "1.0.0");
        assert_eq!(deployment.manifest.static_resources, vec!["/", "/index.html"]);
        assert_eq!(deployment.manifest.resources(GenerationKind::Audio), ["/audio/a1.mp3"]);
    }
}
