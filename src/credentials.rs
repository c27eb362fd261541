use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::{GantryError, Result};

/// A credential a job needs before its backend may be contacted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialRequirement {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl CredentialRequirement {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            vo: None,
            role: None,
        }
    }

    pub fn with_vo(mut self, vo: impl Into<String>) -> Self {
        self.vo = Some(vo.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Formats as `kind[:vo][/role]`.
impl std::fmt::Display for CredentialRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(vo) = &self.vo {
            write!(f, ":{}", vo)?;
        }
        if let Some(role) = &self.role {
            write!(f, "/{}", role)?;
        }
        Ok(())
    }
}

impl FromStr for CredentialRequirement {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (rest, role) = match s.split_once('/') {
            Some((rest, role)) => (rest, Some(role.to_string())),
            None => (s, None),
        };
        let (kind, vo) = match rest.split_once(':') {
            Some((kind, vo)) => (kind, Some(vo.to_string())),
            None => (rest, None),
        };
        if kind.is_empty() {
            return Err(format!("credential requirement '{}' has no kind", s));
        }
        Ok(Self {
            kind: kind.to_string(),
            vo,
            role,
        })
    }
}

/// Answers whether a credential is currently usable.
#[async_trait]
pub trait CredentialGate: Send + Sync {
    async fn is_valid(&self, requirement: &CredentialRequirement) -> bool;

    async fn ensure(&self, requirement: &CredentialRequirement) -> Result<()> {
        if self.is_valid(requirement).await {
            Ok(())
        } else {
            Err(GantryError::Credential {
                requirement: requirement.to_string(),
                reason: "not valid".to_string(),
            })
        }
    }
}

/// In-memory gate with an explicit set of valid credentials.
#[derive(Debug, Default)]
pub struct StaticCredentialGate {
    allow_all: bool,
    valid: RwLock<HashSet<CredentialRequirement>>,
}

impl StaticCredentialGate {
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            valid: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_valid(requirements: impl IntoIterator<Item = CredentialRequirement>) -> Self {
        Self {
            allow_all: false,
            valid: RwLock::new(requirements.into_iter().collect()),
        }
    }

    pub async fn grant(&self, requirement: CredentialRequirement) {
        self.valid.write().await.insert(requirement);
    }

    pub async fn revoke(&self, requirement: &CredentialRequirement) {
        self.valid.write().await.remove(requirement);
    }
}

#[async_trait]
impl CredentialGate for StaticCredentialGate {
    async fn is_valid(&self, requirement: &CredentialRequirement) -> bool {
        self.allow_all || self.valid.read().await.contains(requirement)
    }
}

/// Caches validity answers of another gate for a fixed time and remembers
/// which requirements were found invalid.
pub struct CachedCredentialGate<G> {
    inner: G,
    ttl: Duration,
    cache: Mutex<HashMap<CredentialRequirement, (bool, Instant)>>,
    needed: Mutex<HashSet<CredentialRequirement>>,
}

impl<G: CredentialGate> CachedCredentialGate<G> {
    pub fn new(inner: G, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
            needed: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    /// Drop every cached answer so the next check asks the wrapped gate.
    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }

    /// Requirements found invalid that are still invalid.
    pub async fn needed_credentials(&self) -> Vec<CredentialRequirement> {
        let candidates: Vec<CredentialRequirement> =
            self.needed.lock().await.iter().cloned().collect();
        let mut still_needed = Vec::new();
        for requirement in candidates {
            if !self.is_valid(&requirement).await {
                still_needed.push(requirement);
            }
        }
        still_needed.sort();
        still_needed
    }
}

#[async_trait]
impl<G: CredentialGate> CredentialGate for CachedCredentialGate<G> {
    async fn is_valid(&self, requirement: &CredentialRequirement) -> bool {
        if let Some((valid, checked_at)) = self.cache.lock().await.get(requirement) {
            if checked_at.elapsed() < self.ttl {
                return *valid;
            }
        }

        let valid = self.inner.is_valid(requirement).await;
        self.cache
            .lock()
            .await
            .insert(requirement.clone(), (valid, Instant::now()));

        let mut needed = self.needed.lock().await;
        if valid {
            needed.remove(requirement);
        } else if needed.insert(requirement.clone()) {
            tracing::warn!(credential = %requirement, "Credential needed");
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGate {
        calls: AtomicUsize,
        inner: StaticCredentialGate,
    }

    #[async_trait]
    impl CredentialGate for CountingGate {
        async fn is_valid(&self, requirement: &CredentialRequirement) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.is_valid(requirement).await
        }
    }

    #[test]
    fn requirement_display_and_parse() {
        let req = CredentialRequirement::new("proxy")
            .with_vo("atlas")
            .with_role("production");
        assert_eq!(req.to_string(), "proxy:atlas/production");
        assert_eq!(req.to_string().parse::<CredentialRequirement>().unwrap(), req);
        assert_eq!(
            "token".parse::<CredentialRequirement>().unwrap(),
            CredentialRequirement::new("token")
        );
        assert!(":atlas".parse::<CredentialRequirement>().is_err());
    }

    #[tokio::test]
    async fn static_gate_grant_and_revoke() {
        let req = CredentialRequirement::new("proxy");
        let gate = StaticCredentialGate::default();
        assert!(gate.ensure(&req).await.is_err());
        gate.grant(req.clone()).await;
        assert!(gate.ensure(&req).await.is_ok());
        gate.revoke(&req).await;
        assert!(!gate.is_valid(&req).await);
        assert!(StaticCredentialGate::allow_all().is_valid(&req).await);
    }

    #[tokio::test]
    async fn cached_gate_reuses_answers_within_ttl() {
        let req = CredentialRequirement::new("proxy");
        let gate = CachedCredentialGate::new(
            CountingGate {
                calls: AtomicUsize::new(0),
                inner: StaticCredentialGate::with_valid([req.clone()]),
            },
            Duration::from_secs(60),
        );

        assert!(gate.is_valid(&req).await);
        assert!(gate.is_valid(&req).await);
        assert_eq!(gate.inner().calls.load(Ordering::SeqCst), 1);

        gate.invalidate().await;
        assert!(gate.is_valid(&req).await);
        assert_eq!(gate.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn needed_credentials_tracks_invalid_ones() {
        let req = CredentialRequirement::new("proxy").with_vo("lhcb");
        let gate = CachedCredentialGate::new(StaticCredentialGate::default(), Duration::ZERO);

        assert!(!gate.is_valid(&req).await);
        assert_eq!(gate.needed_credentials().await, vec![req.clone()]);

        gate.inner().grant(req.clone()).await;
        assert!(gate.needed_credentials().await.is_empty());
    }
}
