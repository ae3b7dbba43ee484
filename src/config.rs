//! Mount configuration.

use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

const PROJECT_PREFIXES: [&str; 2] = ["project-", "container-"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid project id {0:?}: expected a project- or container- identifier")]
    InvalidProjectId(String),

    #[error("refresh interval must be at least one second")]
    InvalidRefreshInterval,
}

/// Checks that `id` names a project or container.
pub fn validate_project_id(id: &str) -> Result<String, ConfigError> {
    let ok = PROJECT_PREFIXES
        .iter()
        .any(|p| id.strip_prefix(p).is_some_and(|rest| !rest.is_empty()));
    if ok {
        Ok(id.to_string())
    } else {
        Err(ConfigError::InvalidProjectId(id.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct MountConfig {
    pub project_id: String,
    /// Pause between two refresh cycles.
    pub refresh_interval: Duration,
    /// Owner reported for every entry.
    pub uid: u32,
    pub gid: u32,
    /// Attribute and entry TTL handed to the kernel.
    pub attr_ttl: Duration,
    pub fs_name: String,
    pub debug: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            project_id: String::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            uid,
            gid,
            attr_ttl: DEFAULT_ATTR_TTL,
            fs_name: "projectfs".to_string(),
            debug: false,
        }
    }
}

impl MountConfig {
    pub fn new(project_id: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            project_id: validate_project_id(project_id)?,
            ..Self::default()
        })
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval < Duration::from_secs(1) {
            return Err(ConfigError::InvalidRefreshInterval);
        }
        self.refresh_interval = interval;
        Ok(self)
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_prefixes() {
        assert!(validate_project_id("project-B1x2").is_ok());
        assert!(validate_project_id("container-9").is_ok());
        assert_eq!(
            validate_project_id("file-123"),
            Err(ConfigError::InvalidProjectId("file-123".into()))
        );
        assert!(validate_project_id("project-").is_err());
        assert!(validate_project_id("").is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg = MountConfig::new("project-1").unwrap();
        assert_eq!(cfg.refresh_interval, Duration::from_secs(5));
        assert_eq!(cfg.attr_ttl, Duration::from_secs(1));
        assert_eq!(cfg.fs_name, "projectfs");
        assert!(!cfg.debug);
    }

    #[test]
    fn test_refresh_interval_lower_bound() {
        let cfg = MountConfig::new("project-1").unwrap();
        assert_eq!(
            cfg.clone()
                .with_refresh_interval(Duration::from_millis(10))
                .unwrap_err(),
            ConfigError::InvalidRefreshInterval
        );
        let cfg = cfg.with_refresh_interval(Duration::from_secs(30)).unwrap();
        assert_eq!(cfg.refresh_interval, Duration::from_secs(30));
    }
}
