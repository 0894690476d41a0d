//! Installed application snapshots

use std::path::Path;

use plist::{Dictionary, Value};

/// Metadata of one installed application as reported by the installation proxy
///
/// A snapshot: it does not change when the device does.
#[derive(Clone, Debug, PartialEq)]
pub struct Application {
    info: Dictionary,
}

impl Application {
    /// Wraps an application dictionary, `None` if it has no bundle identifier
    pub fn from_dictionary(info: Dictionary) -> Option<Self> {
        match info.get("CFBundleIdentifier").and_then(|v| v.as_string()) {
            Some(id) if !id.is_empty() => Some(Self { info }),
            _ => None,
        }
    }

    pub fn bundle_id(&self) -> &str {
        self.string_attribute("CFBundleIdentifier").unwrap_or_default()
    }

    /// Display name, falling back to the bundle name and then the bundle id
    pub fn name(&self) -> &str {
        self.string_attribute("CFBundleDisplayName")
            .or_else(|| self.string_attribute("CFBundleName"))
            .unwrap_or_else(|| self.bundle_id())
    }

    /// Install directory of the `.app` bundle on the device
    pub fn app_dir(&self) -> Option<&Path> {
        self.string_attribute("Path").map(Path::new)
    }

    /// `User`, `System` or `Internal`
    pub fn application_type(&self) -> Option<&str> {
        self.string_attribute("ApplicationType")
    }

    pub fn version(&self) -> Option<&str> {
        self.string_attribute("CFBundleShortVersionString")
            .or_else(|| self.string_attribute("CFBundleVersion"))
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.info.get(key)
    }

    pub fn string_attribute(&self, key: &str) -> Option<&str> {
        self.info.get(key).and_then(|v| v.as_string())
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.info.contains_key(key)
    }

    pub fn attributes(&self) -> &Dictionary {
        &self.info
    }
}

impl std::fmt::Display for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.bundle_id())
    }
}
