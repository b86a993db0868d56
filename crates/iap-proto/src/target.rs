//! Tunnel target identifier

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Network interface used when none is given
pub const DEFAULT_INTERFACE: &str = "nic0";

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

/// Errors parsing a target from its textual form
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("Invalid target '{0}': expected project/zone/instance:port")]
    InvalidFormat(String),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}

/// The remote resource a tunnel connects to
///
/// A target is immutable once built. It doubles as the key of a relay session
/// and of the tunnel manager registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    project: String,
    zone: String,
    instance: String,
    #[serde(default = "default_interface")]
    interface: String,
    port: u16,
}

impl Target {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            interface: default_interface(),
            port,
        }
    }

    /// Use a network interface other than `nic0`
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.project, self.zone, self.instance, self.port
        )
    }
}

impl FromStr for Target {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TargetParseError::InvalidFormat(s.to_string()))?;

        let port: u16 = port
            .parse()
            .map_err(|_| TargetParseError::InvalidPort(port.to_string()))?;

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [project, zone, instance]
                if !project.is_empty() && !zone.is_empty() && !instance.is_empty() =>
            {
                Ok(Target::new(*project, *zone, *instance, port))
            }
            _ => Err(TargetParseError::InvalidFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let target = Target::new("my-project", "us-central1-a", "windows-vm", 3389);
        assert_eq!(target.to_string(), "my-project/us-central1-a/windows-vm:3389");

        let parsed: Target = "my-project/us-central1-a/windows-vm:3389".parse().unwrap();
        assert_eq!(parsed, target);
        assert_eq!(parsed.interface(), DEFAULT_INTERFACE);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "project/zone:3389".parse::<Target>(),
            Err(TargetParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            "project/zone/vm:rdp".parse::<Target>(),
            Err(TargetParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "project//vm:3389".parse::<Target>(),
            Err(TargetParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_deserialize_defaults_interface() {
        let json = r#"{"project":"p","zone":"z","instance":"i","port":22}"#;
        let target: Target = serde_json::from_str(json).unwrap();
        assert_eq!(target.interface(), "nic0");
        assert_eq!(target.port(), 22);
    }
}
