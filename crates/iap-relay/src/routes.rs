//! Target to backend routing

use crate::error::RelayServerError;
use iap_proto::Target;
use std::collections::HashMap;

/// Maps targets to the TCP address the relay forwards them to
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<Target, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the backend for `target`
    pub fn insert(&mut self, target: Target, backend: impl Into<String>) {
        self.routes.insert(target, backend.into());
    }

    pub fn with_route(mut self, target: Target, backend: impl Into<String>) -> Self {
        self.insert(target, backend);
        self
    }

    pub fn resolve(&self, target: &Target) -> Option<&str> {
        self.routes.get(target).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Parse `project/zone/instance:port=host:port`
    pub fn parse_route(route: &str) -> Result<(Target, String), RelayServerError> {
        let (target, backend) = route
            .split_once('=')
            .ok_or_else(|| RelayServerError::InvalidRoute(route.to_string()))?;

        let target: Target = target
            .trim()
            .parse()
            .map_err(|_| RelayServerError::InvalidRoute(route.to_string()))?;

        let backend = backend.trim();
        match backend.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(RelayServerError::InvalidRoute(route.to_string())),
        }

        Ok((target, backend.to_string()))
    }
}
