use std::collections::HashMap;

use crate::link::registry::PeerLinkRegistry;

/// Stable user id to current transport id.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    transports: HashMap<String, String>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `user_id` is now reachable at `transport_id` and moves an existing link of
    /// that user to the new key. Returns true when the mapping changed.
    pub fn remap(
        &mut self,
        user_id: &str,
        transport_id: &str,
        registry: &mut PeerLinkRegistry,
    ) -> bool {
        let previous = self
            .transports
            .insert(user_id.to_owned(), transport_id.to_owned());
        if previous.as_deref() == Some(transport_id) {
            return false;
        }
        tracing::debug!(
            "user {} remapped from {:?} to {}",
            user_id,
            previous,
            transport_id
        );
        registry.rebind(user_id, transport_id);
        true
    }

    pub fn transport_of(&self, user_id: &str) -> Option<&str> {
        self.transports.get(user_id).map(String::as_str)
    }

    pub fn user_of(&self, transport_id: &str) -> Option<&str> {
        self.transports
            .iter()
            .find(|(_, tid)| tid.as_str() == transport_id)
            .map(|(user, _)| user.as_str())
    }

    pub fn forget(&mut self, user_id: &str) -> Option<String> {
        self.transports.remove(user_id)
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{link::mock::MockConnector, media::LocalMedia};

    #[tokio::test]
    async fn remap_rebinds_existing_link() {
        let connector = Arc::new(MockConnector::default());
        let (sender, _) = mpsc::unbounded_channel();
        let mut registry = PeerLinkRegistry::new(connector.clone(), LocalMedia::new(), sender, 8);
        let mut identities = IdentityMap::new();

        assert!(identities.remap("alice", "t1", &mut registry));
        let id = registry.create_link("t1", "alice").await.unwrap();

        assert!(!identities.remap("alice", "t1", &mut registry));
        assert!(identities.remap("alice", "t2", &mut registry));
        assert_eq!(identities.transport_of("alice"), Some("t2"));
        assert_eq!(identities.user_of("t2"), Some("alice"));
        assert_eq!(identities.user_of("t1"), None);
        assert_eq!(registry.get("t2").map(|l| l.id.clone()), Some(id));
        assert_eq!(connector.connected(), 1);
    }

    #[tokio::test]
    async fn remap_without_link_only_records() {
        let (sender, _) = mpsc::unbounded_channel();
        let mut registry = PeerLinkRegistry::new(
            Arc::new(MockConnector::default()),
            LocalMedia::new(),
            sender,
            8,
        );
        let mut identities = IdentityMap::new();
        identities.remap("bob", "t7", &mut registry);
        assert!(registry.is_empty());
        assert_eq!(identities.forget("bob").as_deref(), Some("t7"));
        assert!(identities.is_empty());
    }
}
