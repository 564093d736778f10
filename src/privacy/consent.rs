use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use super::PrivacyPolicy;

/// Read-only access to the user's current consent choices
pub trait ConsentStore: Send + Sync {
    /// Snapshot of the policy in force right now
    fn current_policy(&self) -> PrivacyPolicy;
}

/// Consent store fed by the external consent collaborator.
///
/// Readers always see a complete snapshot; updates replace it atomically.
#[derive(Clone)]
pub struct SharedConsentStore {
    tx: Arc<watch::Sender<PrivacyPolicy>>,
}

impl SharedConsentStore {
    pub fn new(policy: PrivacyPolicy) -> Self {
        let (tx, _rx) = watch::channel(policy);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new policy
    pub fn update(&self, policy: PrivacyPolicy) {
        info!("Privacy policy updated: {:?}", policy);
        self.tx.send_replace(policy);
    }

    /// Watch for policy changes
    pub fn subscribe(&self) -> watch::Receiver<PrivacyPolicy> {
        self.tx.subscribe()
    }
}

impl ConsentStore for SharedConsentStore {
    fn current_policy(&self) -> PrivacyPolicy {
        self.tx.borrow().clone()
    }
}
