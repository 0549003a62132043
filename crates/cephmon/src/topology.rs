//! CRUSH tree walk mapping OSD names to the host bucket above them.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::telemetry::{CrushNode, OsdTreeDoc};

pub const LOCALHOST: &str = "localhost";

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("CRUSH node {parent} references missing child {child}")]
    MissingNode { parent: i64, child: i64 },
    #[error("CRUSH tree revisits node {node} below host {host}")]
    Cycle { host: String, node: i64 },
    #[error("Duplicate CRUSH node id {0}")]
    DuplicateId(i64),
}

/// Bucket type names used to recognise hosts and OSDs in the tree.
#[derive(Debug, Clone)]
pub struct CrushTypes {
    pub host: String,
    pub osd: String,
}

impl Default for CrushTypes {
    fn default() -> Self {
        Self {
            host: "host".to_string(),
            osd: "osd".to_string(),
        }
    }
}

/// OSD name (`osd.N`) to CRUSH host name.
#[derive(Debug, Clone, Default)]
pub struct OsdHostIndex {
    hosts: HashMap<String, String>,
}

impl OsdHostIndex {
    pub fn build(tree: &OsdTreeDoc, types: &CrushTypes) -> Result<Self, TopologyError> {
        let mut nodes_by_id: HashMap<i64, &CrushNode> = HashMap::with_capacity(tree.nodes.len());
        for node in &tree.nodes {
            if nodes_by_id.insert(node.id, node).is_some() {
                return Err(TopologyError::DuplicateId(node.id));
            }
        }

        let mut hosts = HashMap::new();
        for node in tree.nodes.iter().filter(|n| n.node_type == types.host) {
            if node.name == LOCALHOST {
                continue;
            }
            for osd in find_descendants(node, &nodes_by_id, &types.osd)? {
                hosts.insert(osd.name.clone(), node.name.clone());
            }
        }

        tracing::debug!(osds = hosts.len(), "built CRUSH host index");
        Ok(Self { hosts })
    }

    pub fn host_of(&self, osd_name: &str) -> Option<&str> {
        self.hosts.get(osd_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Nodes of `leaf_type` below `root`. Does not descend past a leaf.
fn find_descendants<'a>(
    root: &'a CrushNode,
    nodes_by_id: &HashMap<i64, &'a CrushNode>,
    leaf_type: &str,
) -> Result<Vec<&'a CrushNode>, TopologyError> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root];

    while let Some(cursor) = stack.pop() {
        if !visited.insert(cursor.id) {
            return Err(TopologyError::Cycle {
                host: root.name.clone(),
                node: cursor.id,
            });
        }
        if cursor.node_type == leaf_type {
            found.push(cursor);
            continue;
        }
        // Reverse so children are visited in listed order.
        for child_id in cursor.children.iter().rev() {
            let child = nodes_by_id
                .get(child_id)
                .copied()
                .ok_or(TopologyError::MissingNode {
                    parent: cursor.id,
                    child: *child_id,
                })?;
            stack.push(child);
        }
    }

    Ok(found)
}
