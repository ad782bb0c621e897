//! Data structures used throughout the daemon.
//!
//! A [`Node`] is one healthy endpoint of a service as reported by the
//! registry.  The watcher diffs successive snapshots of nodes into
//! [`Changes`], grouped per canonical service in a [`ChangeBatch`], and
//! hands the batch to the reconciliation side.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use sha2::{Digest, Sha256};

/// A discovered endpoint.
///
/// Equality and hashing cover every field, so a node whose tags or
/// attributes changed compares unequal to its previous incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    pub address: String,
    pub port: String,
    /// Short host name, the first label of the registry's node name.
    pub name: String,
    /// Tags of the form `key=value`.
    pub attrs: BTreeMap<String, String>,
    /// Tags without `=`.
    pub tags: BTreeSet<String>,
}

impl Node {
    /// Builds a node from the registry's view of it, splitting tags into
    /// attributes and plain tags.
    pub fn from_registry<I, S>(address: &str, port: &str, node_name: &str, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut attrs = BTreeMap::new();
        let mut plain = BTreeSet::new();
        for tag in tags {
            let tag = tag.as_ref();
            match tag.split_once('=') {
                Some((key, value)) => {
                    attrs.insert(key.to_string(), value.to_string());
                }
                None => {
                    plain.insert(tag.to_string());
                }
            }
        }

        let name = node_name.split('.').next().unwrap_or(node_name).to_string();

        Self {
            address: address.to_string(),
            port: port.to_string(),
            name,
            attrs,
            tags: plain,
        }
    }

    /// The slot this node occupies, ignoring its metadata.
    pub fn identity(&self) -> NodeIdentity<'_> {
        NodeIdentity {
            address: &self.address,
            port: &self.port,
        }
    }
}

/// Address/port view of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdentity<'a> {
    pub address: &'a str,
    pub port: &'a str,
}

/// Difference between two snapshots of one service.
///
/// A given address/port appears in at most one of the three sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub added: BTreeSet<Node>,
    pub removed: BTreeSet<Node>,
    pub updated: BTreeSet<Node>,
}

impl Changes {
    pub fn between(old: &[Node], new: &[Node]) -> Self {
        let old_ids: HashMap<NodeIdentity<'_>, &Node> =
            old.iter().map(|n| (n.identity(), n)).collect();
        let new_ids: HashMap<NodeIdentity<'_>, &Node> =
            new.iter().map(|n| (n.identity(), n)).collect();

        let added: BTreeSet<Node> = new_ids
            .iter()
            .filter(|(id, _)| !old_ids.contains_key(*id))
            .map(|(_, n)| (*n).clone())
            .collect();
        let removed: BTreeSet<Node> = old_ids
            .iter()
            .filter(|(id, _)| !new_ids.contains_key(*id))
            .map(|(_, n)| (*n).clone())
            .collect();

        // new - old - added, by full equality: what is left are slots that
        // survived but whose metadata moved.
        let old_nodes: HashSet<&Node> = old.iter().collect();
        let updated = new
            .iter()
            .filter(|n| !old_nodes.contains(n) && !added.contains(*n))
            .cloned()
            .collect();

        Self {
            added,
            removed,
            updated,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Changes keyed by canonical service name.
pub type ChangeBatch = BTreeMap<String, Changes>;

/// Deterministic but host-specific ordering of nodes.
///
/// Each controller instance salts the hash with its own host name so that
/// a fleet of load balancers doesn't list the same server first.
#[derive(Debug, Clone)]
pub struct NodeOrder {
    salt: String,
}

impl NodeOrder {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    pub fn sort_key(&self, node: &Node) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(format!("{}:{}", node.address, node.port).as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn sort(&self, nodes: &mut [Node]) {
        nodes.sort_by_cached_key(|n| self.sort_key(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: &str, port: &str, name: &str, tags: &[&str]) -> Node {
        Node::from_registry(address, port, name, tags.iter().copied())
    }

    #[test]
    fn test_node_from_registry_splits_tags() {
        let n = node("10.0.0.1", "8080", "web-01.dc1.example.com", &["weight=5", "primary", "rack=a=b"]);
        assert_eq!(n.name, "web-01");
        assert_eq!(n.attrs.get("weight").map(String::as_str), Some("5"));
        assert_eq!(n.attrs.get("rack").map(String::as_str), Some("a=b"));
        assert!(n.tags.contains("primary"));
        assert_eq!(n.tags.len(), 1);
    }

    #[test]
    fn test_diff_against_itself_is_empty() {
        let nodes = vec![
            node("1.1.1.1", "80", "a", &["weight=10"]),
            node("2.2.2.2", "80", "b", &[]),
        ];
        assert!(Changes::between(&nodes, &nodes).is_empty());
    }

    #[test]
    fn test_diff_classifies_added_removed_updated() {
        let old = vec![
            node("1.1.1.1", "80", "a", &[]),
            node("2.2.2.2", "80", "b", &["weight=10"]),
            node("3.3.3.3", "80", "c", &[]),
        ];
        let new = vec![
            node("2.2.2.2", "80", "b", &["weight=20"]),
            node("3.3.3.3", "80", "c", &[]),
            node("4.4.4.4", "80", "d", &[]),
        ];

        let changes = Changes::between(&old, &new);
        let names = |set: &BTreeSet<Node>| set.iter().map(|n| n.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&changes.added), vec!["d"]);
        assert_eq!(names(&changes.removed), vec!["a"]);
        assert_eq!(names(&changes.updated), vec!["b"]);
        assert_eq!(
            changes.updated.iter().next().unwrap().attrs["weight"],
            "20"
        );
    }

    #[test]
    fn test_diff_sets_are_disjoint_and_partition_new() {
        let old = vec![
            node("1.1.1.1", "80", "a", &[]),
            node("1.1.1.1", "81", "a", &["x"]),
            node("5.5.5.5", "80", "e", &[]),
        ];
        let new = vec![
            node("1.1.1.1", "81", "a", &["y"]),
            node("5.5.5.5", "80", "e", &[]),
            node("6.6.6.6", "80", "f", &[]),
        ];
        let changes = Changes::between(&old, &new);

        let ids = |set: &BTreeSet<Node>| {
            set.iter()
                .map(|n| (n.address.clone(), n.port.clone()))
                .collect::<HashSet<_>>()
        };
        let (added, removed, updated) = (
            ids(&changes.added),
            ids(&changes.removed),
            ids(&changes.updated),
        );
        assert!(added.is_disjoint(&removed));
        assert!(added.is_disjoint(&updated));
        assert!(removed.is_disjoint(&updated));

        let old_set: HashSet<&Node> = old.iter().collect();
        let unchanged: HashSet<_> = new
            .iter()
            .filter(|n| old_set.contains(n))
            .map(|n| (n.address.clone(), n.port.clone()))
            .collect();
        let mut covered = added.clone();
        covered.extend(updated.iter().cloned());
        covered.extend(unchanged.iter().cloned());
        let all_new: HashSet<_> = new
            .iter()
            .map(|n| (n.address.clone(), n.port.clone()))
            .collect();
        assert_eq!(covered, all_new);
        assert_eq!(added.len() + updated.len() + unchanged.len(), all_new.len());
    }

    #[test]
    fn test_node_order_depends_on_salt_only_through_address() {
        let a = node("1.1.1.1", "80", "a", &[]);
        let a_renamed = node("1.1.1.1", "80", "z", &["weight=3"]);
        let order = NodeOrder::new("lb-01.example.com");
        assert_eq!(order.sort_key(&a), order.sort_key(&a_renamed));
        assert_ne!(order.sort_key(&a), NodeOrder::new("lb-02.example.com").sort_key(&a));
    }
}
