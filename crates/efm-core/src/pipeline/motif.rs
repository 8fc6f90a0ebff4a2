//! Motif library: reflex anchors and learned danger motifs.
//!
//! Motif content is supplied externally as configuration. Reflex anchors
//! are pre-hashed exact patterns; danger motifs carry embeddings from the
//! external semantic engine. The library is read-mostly: holders publish a
//! new `Arc` on reload and stages keep the snapshot they entered with.

use serde::{Deserialize, Serialize};

use crate::crypto::{ContentHash, ContentHasher};

/// Severity attached to a motif match; higher wins stage-internal ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotifSeverity {
    /// Suspicious.
    Elevated,
    /// Known hostile.
    Hostile,
    /// Immediate constitutional threat.
    Critical,
}

/// A pre-hashed exact-match anchor for the reflex stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflexAnchor {
    /// Stable pattern id.
    pub id: String,

    /// Pre-computed content hash the anchor matches.
    pub anchor: ContentHash,

    /// Severity for tie-breaking.
    pub severity: MotifSeverity,
}

/// A learned danger motif for the intuition stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DangerMotif {
    /// Stable motif id.
    pub id: String,

    /// Embedding from the external semantic engine.
    pub embedding: Vec<f32>,

    /// Severity for tie-breaking.
    pub severity: MotifSeverity,
}

/// The loaded motif library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotifLibrary {
    /// Reflex anchors.
    pub anchors: Vec<ReflexAnchor>,

    /// Danger motifs.
    pub danger_motifs: Vec<DangerMotif>,
}

impl MotifLibrary {
    /// Builds an anchor from raw pattern content.
    #[must_use]
    pub fn anchor_for(id: impl Into<String>, content: &[u8], severity: MotifSeverity) -> ReflexAnchor {
        ReflexAnchor {
            id: id.into(),
            anchor: ContentHasher::hash("efm.request.v1", content),
            severity,
        }
    }

    /// Anchors matching a content hash, in library order.
    #[must_use]
    pub fn matching_anchors(&self, hash: &ContentHash) -> Vec<&ReflexAnchor> {
        self.anchors.iter().filter(|a| &a.anchor == hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_matches_only_its_content() {
        let anchor = MotifLibrary::anchor_for("M1", b"forbidden", MotifSeverity::Hostile);
        let library = MotifLibrary {
            anchors: vec![anchor],
            danger_motifs: Vec::new(),
        };

        let hit = ContentHasher::hash("efm.request.v1", b"forbidden");
        let miss = ContentHasher::hash("efm.request.v1", b"allowed");
        assert_eq!(library.matching_anchors(&hit).len(), 1);
        assert!(library.matching_anchors(&miss).is_empty());
    }

    #[test]
    fn severity_orders_for_tie_breaks() {
        assert!(MotifSeverity::Critical > MotifSeverity::Hostile);
        assert!(MotifSeverity::Hostile > MotifSeverity::Elevated);
    }
}
