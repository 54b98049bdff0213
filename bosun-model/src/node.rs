use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, EntityKind};
use crate::job::Job;
use crate::log::LogEntry;
use crate::metrics::{JobMetrics, LogMetrics, ProcessMetrics};
use crate::process::{Process, ProcessGroup};
use crate::project::{Project, Workspace};
use crate::system::System;

/// A typed record that can live in the entity store.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Tag every ID of this entity must decode to.
    const KIND: EntityKind;

    fn id(&self) -> &EntityId;

    /// Zero value carrying only `id`.
    fn zero(id: EntityId) -> Self;

    fn into_node(self) -> Node;

    fn from_node(node: Node) -> Option<Self>;

    fn from_node_ref(node: &Node) -> Option<&Self>;
}

macro_rules! nodes {
    ($($kind:ident),+ $(,)?) => {
        /// Closed set of every entity kind, as held by the store.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "__typename")]
        pub enum Node {
            $($kind($kind),)+
        }

        impl Node {
            pub fn kind(&self) -> EntityKind {
                match self {
                    $(Node::$kind(_) => EntityKind::$kind,)+
                }
            }

            pub fn id(&self) -> &EntityId {
                match self {
                    $(Node::$kind(inner) => &inner.id,)+
                }
            }
        }

        $(
            impl Entity for $kind {
                const KIND: EntityKind = EntityKind::$kind;

                fn id(&self) -> &EntityId {
                    &self.id
                }

                fn zero(id: EntityId) -> Self {
                    $kind {
                        id,
                        ..Default::default()
                    }
                }

                fn into_node(self) -> Node {
                    Node::$kind(self)
                }

                fn from_node(node: Node) -> Option<Self> {
                    match node {
                        Node::$kind(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn from_node_ref(node: &Node) -> Option<&Self> {
                    match node {
                        Node::$kind(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }

            impl From<$kind> for Node {
                fn from(value: $kind) -> Self {
                    Node::$kind(value)
                }
            }
        )+
    };
}

nodes!(
    System,
    Workspace,
    Project,
    Job,
    JobMetrics,
    Process,
    ProcessGroup,
    ProcessMetrics,
    LogEntry,
    LogMetrics,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    #[test]
    fn zero_value_only_carries_id() {
        let id = EntityId::new(EntityKind::Job, ["1"]);
        let job = Job::zero(id.clone());

        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.name.is_empty());
    }

    #[test]
    fn node_conversion_is_kind_checked() {
        let job = Job::zero(EntityId::new(EntityKind::Job, ["1"]));
        let node = job.clone().into_node();

        assert_eq!(node.kind(), EntityKind::Job);
        assert_eq!(Job::from_node_ref(&node), Some(&job));
        assert!(Process::from_node(node).is_none());
    }
}
