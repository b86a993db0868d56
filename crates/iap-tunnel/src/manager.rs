//! Registry of live tunnel sessions

use crate::config::TunnelConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::TunnelSession;
use futures_util::future::join_all;
use iap_auth::Authorizer;
use iap_proto::Target;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How `get_or_create` treats an existing session for the same target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelPolicy {
    /// Reuse the live session for the target
    #[default]
    SingleFlight,
    /// Always open a new session
    AlwaysNew,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<Target, Vec<Arc<TunnelSession>>>,
    shut_down: bool,
}

impl Registry {
    fn prune(&mut self) {
        self.sessions.retain(|_, sessions| {
            sessions.retain(|session| !session.is_closed());
            !sessions.is_empty()
        });
    }
}

/// Tracks tunnel sessions by target and closes them all on shutdown
pub struct TunnelManager {
    config: TunnelConfig,
    policy: TunnelPolicy,
    registry: Mutex<Registry>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            policy: TunnelPolicy::default(),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn with_policy(mut self, policy: TunnelPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> TunnelPolicy {
        self.policy
    }

    /// Return the live session for `target` or open a new one, per policy
    ///
    /// Serialized with other calls and with [`close_all`](Self::close_all).
    pub async fn get_or_create(
        &self,
        target: Target,
        authorizer: Arc<dyn Authorizer>,
    ) -> TunnelResult<Arc<TunnelSession>> {
        let mut registry = self.registry.lock().await;
        if registry.shut_down {
            return Err(TunnelError::TunnelClosed);
        }
        registry.prune();

        if self.policy == TunnelPolicy::SingleFlight {
            let existing = registry
                .sessions
                .get(&target)
                .and_then(|sessions| sessions.iter().find(|s| s.state().is_live()));
            if let Some(session) = existing {
                debug!("[{}] Reusing tunnel to {}", session.session_id(), target);
                return Ok(session.clone());
            }
        }

        let session = Arc::new(
            TunnelSession::create(target.clone(), authorizer, self.config.clone()).await?,
        );
        registry
            .sessions
            .entry(target)
            .or_default()
            .push(session.clone());

        Ok(session)
    }

    /// Live sessions
    pub async fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        let mut registry = self.registry.lock().await;
        registry.prune();
        registry.sessions.values().flatten().cloned().collect()
    }

    /// Close every session; later `get_or_create` calls fail with
    /// [`TunnelError::TunnelClosed`]
    pub async fn close_all(&self) {
        let mut registry = self.registry.lock().await;
        registry.shut_down = true;

        let sessions: Vec<_> = registry.sessions.drain().flat_map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }

        info!("Closing {} tunnel(s)", sessions.len());
        join_all(sessions.iter().map(|session| session.close())).await;
    }
}
