//! Read-only access to cluster nodes.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{Node, NodeRef, ProviderId};

/// Source of cluster nodes. Lookups never mutate the node.
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// Find the node whose provider ID matches.
    async fn by_provider_id(&self, provider_id: &ProviderId) -> anyhow::Result<Option<Node>>;

    /// Find the node a stored back-reference points at.
    async fn by_ref(&self, node_ref: &NodeRef) -> anyhow::Result<Option<Node>>;
}

/// In-memory node source for testing and development.
#[derive(Default)]
pub struct InMemoryNodes {
    nodes: RwLock<Vec<Node>>,
}

impl InMemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, node: Node) {
        self.nodes.write().await.push(node);
    }

    pub async fn remove(&self, name: &str) {
        self.nodes.write().await.retain(|n| n.name != name);
    }

    /// Flip a node's readiness in place.
    pub async fn set_ready(&self, name: &str, ready: bool) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.name == name) {
            node.ready = ready;
        }
    }
}

#[async_trait]
impl NodeSource for InMemoryNodes {
    async fn by_provider_id(&self, provider_id: &ProviderId) -> anyhow::Result<Option<Node>> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .iter()
            .find(|n| n.provider_id.as_ref() == Some(provider_id))
            .cloned())
    }

    async fn by_ref(&self, node_ref: &NodeRef) -> anyhow::Result<Option<Node>> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .iter()
            .find(|n| n.name == node_ref.name && n.namespace == node_ref.namespace)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, provider_id: Option<&str>) -> Node {
        Node {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: format!("uid-{name}"),
            provider_id: provider_id.map(ProviderId::new),
            ready: true,
            version: "v1.29.2".to_string(),
        }
    }

    #[tokio::test]
    async fn lookup_by_provider_id() {
        let nodes = InMemoryNodes::new();
        nodes.add(node("n1", Some("vmss_a"))).await;
        nodes.add(node("n2", None)).await;

        let found = nodes
            .by_provider_id(&ProviderId::new("vmss_a"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().name, "n1");

        let missing = nodes
            .by_provider_id(&ProviderId::new("vmss_b"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn lookup_by_reference() {
        let nodes = InMemoryNodes::new();
        let n = node("n1", Some("vmss_a"));
        let node_ref = NodeRef::from_node(&n);
        nodes.add(n).await;

        assert!(nodes.by_ref(&node_ref).await.unwrap().is_some());

        nodes.remove("n1").await;
        assert!(nodes.by_ref(&node_ref).await.unwrap().is_none());
    }
}
