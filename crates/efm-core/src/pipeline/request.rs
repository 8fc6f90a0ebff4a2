//! Pipeline requests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capsule::CapsuleId;
use crate::crypto::{ContentHash, ContentHasher};

/// Hashing domain for request content.
const REQUEST_DOMAIN: &str = "efm.request.v1";

/// Stable request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enforceable constitutional predicate flags.
///
/// The semantic engine that classifies free-form content is out of scope;
/// requests arrive with these predicates already extracted, and the arbiter
/// enforces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PredicateFlags {
    /// The action would harm a human or enable harm through inaction.
    pub targets_human_harm: bool,

    /// The action would modify the commandment set.
    pub modifies_constitution: bool,

    /// The action would disable or delay the operator override.
    pub disables_override: bool,

    /// The action would alter a genesis record.
    pub tampers_genesis: bool,

    /// The action broadcasts to or reconfigures the swarm.
    pub affects_swarm: bool,
}

impl PredicateFlags {
    /// True if any constitutional predicate fires.
    #[must_use]
    pub const fn any_constitutional(self) -> bool {
        self.targets_human_harm
            || self.modifies_constitution
            || self.disables_override
            || self.tampers_genesis
    }
}

/// An external request entering the decision pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request id.
    pub id: RequestId,

    /// Capsule on whose behalf the request runs, if any.
    pub capsule_id: Option<CapsuleId>,

    /// Raw content bytes.
    pub content: Vec<u8>,

    /// Embedding of the content from the external semantic engine, when
    /// available. Without it the intuition stage passes trivially.
    pub embedding: Option<Vec<f32>>,

    /// Projected entropy contribution declared by the semantic engine.
    pub declared_entropy: f64,

    /// Risk score of the proposed action, `[0, 1]`.
    pub risk: f64,

    /// Extracted constitutional predicates.
    pub flags: PredicateFlags,
}

impl Request {
    /// Creates a request over raw content with default annotations.
    #[must_use]
    pub fn new(capsule_id: Option<CapsuleId>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: RequestId::generate(),
            capsule_id,
            content: content.into(),
            embedding: None,
            declared_entropy: 0.0,
            risk: 0.0,
            flags: PredicateFlags::default(),
        }
    }

    /// The content hash matched by the reflex stage.
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHasher::hash(REQUEST_DOMAIN, &self.content)
    }
}
