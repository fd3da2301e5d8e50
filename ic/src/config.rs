//! instancectl configuration types and loading
//!
//! The configuration is the declarative source of truth for which instances
//! exist. It is loaded once per invocation, validated, and saved back only by
//! operations that add or remove instances.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::properties::PropertyMap;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "INSTANCECTL_CONFIG";

/// File name of the runtime state file inside `paths.run`
pub const STATE_FILE: &str = "instance-states.yaml";

/// File name of the operation lock inside `paths.run`
pub const LOCK_FILE: &str = "instancectl.lock";

/// Main instancectl configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Critical filesystem locations
    pub paths: PathsConfig,

    /// Global launch defaults
    pub defaults: DefaultsConfig,

    /// Process identity and timing
    pub runtime: RuntimeConfig,

    /// Files copied into new instances
    pub provisioning: ProvisioningConfig,

    /// Managed instances
    pub instances: Vec<InstanceConfig>,
}

/// Critical filesystem locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Server install root
    pub jboss: PathBuf,

    /// Directory holding one base directory per instance
    pub instances: PathBuf,

    /// Runtime state directory
    pub run: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            jboss: PathBuf::from("/opt/jboss"),
            instances: PathBuf::from("/opt/app/jboss"),
            run: PathBuf::from("/var/run/jboss"),
        }
    }
}

impl PathsConfig {
    /// Base directory of instance `name`
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances.join(name)
    }

    pub fn state_file(&self) -> PathBuf {
        self.run.join(STATE_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.run.join(LOCK_FILE)
    }

    /// Properties file handed to the management CLI for `name`
    pub fn cli_properties_file(&self, name: &str) -> PathBuf {
        self.run.join(format!("{}-cli.properties", name))
    }

    pub fn standalone_script(&self) -> PathBuf {
        self.jboss.join("bin").join("standalone.sh")
    }

    pub fn cli_script(&self) -> PathBuf {
        self.jboss.join("bin").join("jboss-cli.sh")
    }
}

/// Global launch defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Server-level defaults
    pub jboss: JbossDefaults,

    /// Default `-D` properties for every instance
    #[serde(skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,

    /// Default JVM options for every instance
    #[serde(skip_serializing_if = "PropertyMap::is_empty")]
    pub options: PropertyMap,
}

/// Server-level defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JbossDefaults {
    /// Server profile booted by default
    pub profile: String,
}

impl Default for JbossDefaults {
    fn default() -> Self {
        Self {
            profile: "standalone-full.xml".to_string(),
        }
    }
}

/// Longest accepted wait between SIGTERM and SIGKILL (one day)
pub const MAX_STOP_TIMEOUT_SECS: u64 = 86_400;

/// Process identity and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Executable name of the server worker process
    pub binary: String,

    /// First argument the worker is launched with
    pub marker: String,

    /// Seconds to wait after SIGTERM before SIGKILL
    pub stop_timeout_secs: u64,

    /// Interval between process table polls
    pub poll_interval_ms: u64,

    /// Polls to wait for the launch script's worker to appear
    pub spawn_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "java".to_string(),
            marker: "-D[Standalone]".to_string(),
            stop_timeout_secs: 10,
            poll_interval_ms: 100,
            spawn_attempts: 50,
        }
    }
}

/// Files copied into new instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    /// Source tree, relative to `paths.jboss` unless absolute
    pub source: PathBuf,

    /// Allow-list of glob patterns relative to the source tree
    pub include: Vec<String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("standalone"),
            include: vec![
                "configuration/*".to_string(),
                "deployments".to_string(),
                "lib".to_string(),
            ],
        }
    }
}

/// A managed instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,

    /// Instance `-D` property overrides
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,

    /// Instance JVM option overrides
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub options: PropertyMap,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: PropertyMap::new(),
            options: PropertyMap::new(),
        }
    }
}

/// Check that `name` can be used as a directory name under `paths.instances`
pub fn validate_instance_name(name: &str) -> std::result::Result<(), String> {
    if name.trim().is_empty() {
        return Err("instance name is empty".to_string());
    }
    if name == "." || name == ".." {
        return Err(format!("'{}' is not a valid instance name", name));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(format!("instance name '{}' contains a path separator", name));
    }
    Ok(())
}

impl Config {
    /// Resolve which config file this invocation uses
    ///
    /// Order: explicit path, `$INSTANCECTL_CONFIG`, `./.instancectl.yml`,
    /// `<config_dir>/instancectl/instancectl.yml`. When none exists the user
    /// config location is returned so that a later save creates it.
    pub fn locate(explicit: Option<&PathBuf>) -> PathBuf {
        debug!(?explicit, "Config::locate: called");
        if let Some(path) = explicit {
            return path.clone();
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                debug!(%path, "Config::locate: using environment override");
                return PathBuf::from(path);
            }
        }

        let local = PathBuf::from(".instancectl.yml");
        if local.exists() {
            return local;
        }

        let user = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("instancectl")
            .join("instancectl.yml");
        debug!(?user, "Config::locate: returning user config path");
        user
    }

    /// Load and validate the config at `path`; an absent file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load: called");
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io(path, e)),
        };

        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content).map_err(|e| Error::CorruptConfig {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        config.validate().map_err(|reason| Error::CorruptConfig {
            path: path.to_path_buf(),
            reason,
        })?;

        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Read only the log level, ignoring every error
    ///
    /// Used before logging is initialised.
    pub fn load_log_level(explicit: Option<&PathBuf>) -> Option<String> {
        let content = fs::read_to_string(Self::locate(explicit)).ok()?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
        value.get("log-level")?.as_str().map(str::to_string)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for instance in &self.instances {
            validate_instance_name(&instance.name)?;
            if !seen.insert(instance.name.as_str()) {
                return Err(format!("instance '{}' is defined more than once", instance.name));
            }
        }

        if self.runtime.binary.trim().is_empty() {
            return Err("runtime.binary must not be empty".to_string());
        }
        if self.runtime.poll_interval_ms == 0 {
            return Err("runtime.poll-interval-ms must be positive".to_string());
        }
        if self.runtime.stop_timeout_secs > MAX_STOP_TIMEOUT_SECS {
            return Err(format!(
                "runtime.stop-timeout-secs must be at most {}",
                MAX_STOP_TIMEOUT_SECS
            ));
        }
        if self.provisioning.include.iter().any(|p| p.trim().is_empty()) {
            return Err("provisioning.include contains an empty pattern".to_string());
        }
        Ok(())
    }

    /// Save the config to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "Config::save: called");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let content = serde_yaml::to_string(self).map_err(|e| Error::CorruptConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, content).map_err(|e| Error::io(path, e))?;

        info!("Saved config to: {}", path.display());
        Ok(())
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn has_instance(&self, name: &str) -> bool {
        self.instance(name).is_some()
    }

    /// Append `name` unless already configured
    pub fn add_instance(&mut self, name: &str) -> bool {
        if self.has_instance(name) {
            return false;
        }
        self.instances.push(InstanceConfig::new(name));
        true
    }

    /// Drop the entry for `name`; returns whether one existed
    pub fn remove_instance(&mut self, name: &str) -> bool {
        let before = self.instances.len();
        self.instances.retain(|i| i.name != name);
        before != self.instances.len()
    }

    /// Provisioning source tree resolved against the install root
    pub fn provisioning_source(&self) -> PathBuf {
        self.paths.jboss.join(&self.provisioning.source)
    }
}
