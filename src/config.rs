//! Build configuration loaded from TOML and overridden by CLI flags.
//!
//! ```toml
//! [build]
//! release = "bookworm"
//! target_root = "build/chroot"
//! output_dir = "out"
//! label = "FORGE_OS"
//! version = "1.0"
//!
//! [identity]
//! hostname = "forge"
//! timezone = "UTC"
//!
//! [[accounts]]
//! name = "analyst"
//! uid = 1000
//! groups = ["sudo"]
//!
//! [inputs]
//! package_lists = ["packages/base.list", "packages/forensics.list"]
//! branding_dir = "branding"
//! service_units_dir = "units"
//!
//! [timeouts]
//! install_secs = 3600
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildConfig {
    pub build: BuildSection,
    pub identity: IdentitySection,
    pub accounts: Vec<Account>,
    pub inputs: InputsSection,
    pub timeouts: TimeoutsSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildSection {
    /// Distribution release handed to the bootstrap tool.
    pub release: String,
    pub mirror: String,
    pub arch: String,
    pub target_root: PathBuf,
    pub output_dir: PathBuf,
    /// Volume label, used by the bootloader to find the live medium.
    pub label: String,
    pub version: String,
    pub image_name: String,
    /// Allow bootstrapping over a non-empty target root.
    pub reuse_target: bool,
    /// Also write an `.md5` checksum next to the image.
    pub md5: bool,
    pub require_root: bool,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            release: "bookworm".to_string(),
            mirror: "http://deb.debian.org/debian".to_string(),
            arch: "amd64".to_string(),
            target_root: PathBuf::from("build/chroot"),
            output_dir: PathBuf::from("out"),
            label: "FORGE_OS".to_string(),
            version: "0.1.0".to_string(),
            image_name: "forge-os".to_string(),
            reuse_target: false,
            md5: false,
            require_root: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IdentitySection {
    pub hostname: String,
    pub locale: String,
    pub timezone: String,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            hostname: "forge".to_string(),
            locale: "en_US.UTF-8".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InputsSection {
    pub package_lists: Vec<PathBuf>,
    pub branding_dir: Option<PathBuf>,
    pub service_units_dir: Option<PathBuf>,
}

/// Per-operation deadlines in seconds. Absent means no deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeoutsSection {
    pub bootstrap_secs: Option<u64>,
    pub install_secs: Option<u64>,
    pub squashfs_secs: Option<u64>,
    pub iso_secs: Option<u64>,
}

impl TimeoutsSection {
    pub fn bootstrap(&self) -> Option<Duration> {
        self.bootstrap_secs.map(Duration::from_secs)
    }

    pub fn install(&self) -> Option<Duration> {
        self.install_secs.map(Duration::from_secs)
    }

    pub fn squashfs(&self) -> Option<Duration> {
        self.squashfs_secs.map(Duration::from_secs)
    }

    pub fn iso(&self) -> Option<Duration> {
        self.iso_secs.map(Duration::from_secs)
    }
}

impl BuildConfig {
    /// Load a config file, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        let mut config = Self::parse(&raw)
            .with_context(|| format!("parsing build config '{}'", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_relative_to(base);
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.build.release.trim().is_empty() {
            anyhow::bail!("build.release must not be empty");
        }
        if self.build.label.trim().is_empty() {
            anyhow::bail!("build.label must not be empty");
        }
        for account in &self.accounts {
            if account.name.is_empty() || account.name.contains(':') {
                anyhow::bail!("invalid account name '{}'", account.name);
            }
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.build.target_root);
        resolve(&mut self.build.output_dir);
        for list in &mut self.inputs.package_lists {
            resolve(list);
        }
        if let Some(dir) = self.inputs.branding_dir.as_mut() {
            resolve(dir);
        }
        if let Some(dir) = self.inputs.service_units_dir.as_mut() {
            resolve(dir);
        }
    }

    /// File name of the authored disk image.
    pub fn image_file_name(&self) -> String {
        format!(
            "{}-{}-{}.iso",
            self.build.image_name, self.build.version, self.build.arch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = BuildConfig::parse("").unwrap();
        assert_eq!(config, BuildConfig::default());
        assert_eq!(config.image_file_name(), "forge-os-0.1.0-amd64.iso");
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [build]
            release = "trixie"
            label = "FORGE_TEST"
            md5 = true

            [identity]
            hostname = "lab"

            [[accounts]]
            name = "analyst"
            uid = 1000
            groups = ["sudo", "wireshark"]

            [inputs]
            package_lists = ["base.list"]

            [timeouts]
            install_secs = 60
        "#;
        let config = BuildConfig::parse(raw).unwrap();
        assert_eq!(config.build.release, "trixie");
        assert!(config.build.md5);
        assert_eq!(config.identity.hostname, "lab");
        assert_eq!(config.identity.timezone, "UTC");
        assert_eq!(config.accounts[0].shell, "/bin/bash");
        assert_eq!(config.accounts[0].groups, vec!["sudo", "wireshark"]);
        assert_eq!(config.timeouts.install(), Some(Duration::from_secs(60)));
        assert_eq!(config.timeouts.iso(), None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(BuildConfig::parse("[build]\nrelase = \"bookworm\"\n").is_err());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("forge.toml");
        fs::write(
            &path,
            "[build]\noutput_dir = \"out\"\n[inputs]\npackage_lists = [\"lists/base.list\"]\n",
        )
        .unwrap();

        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.build.output_dir, temp.path().join("out"));
        assert_eq!(
            config.inputs.package_lists,
            vec![temp.path().join("lists/base.list")]
        );
    }
}
