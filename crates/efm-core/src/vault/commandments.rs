//! The commandment set and its canonical hash.
//!
//! Commandments are reduced to enforceable predicates in the arbiter stage;
//! here they exist as the sealed constitutional text whose hash every
//! genesis record binds to.

use serde::{Deserialize, Serialize};

use crate::crypto::{CanonicalWriter, ContentHash, ContentHasher};

/// Identifier of a commandment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandmentId {
    /// Do No Harm.
    C1,
    /// Preserve Lineage.
    C2,
    /// Maintain Health.
    C3,
    /// Accept Care.
    C4,
    /// Serve Purpose.
    C5,
}

impl std::fmt::Display for CommandmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::C1 => "C1",
            Self::C2 => "C2",
            Self::C3 => "C3",
            Self::C4 => "C4",
            Self::C5 => "C5",
        };
        write!(f, "{name}")
    }
}

/// One constitutional commandment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commandment {
    /// Stable id.
    pub id: CommandmentId,

    /// Short name.
    pub name: String,

    /// Constitutional text.
    pub text: String,

    /// Precedence; lower wins in conflicts.
    pub priority: u8,

    /// Absolute commandments can never be outweighed by any other
    /// consideration, survival included.
    pub absolute: bool,
}

/// The ordered commandment set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commandments {
    entries: Vec<Commandment>,
}

impl Commandments {
    /// Builds a commandment set from entries, sorted by priority.
    #[must_use]
    pub fn new(mut entries: Vec<Commandment>) -> Self {
        entries.sort_by_key(|c| c.priority);
        Self { entries }
    }

    /// The commandments in priority order.
    #[must_use]
    pub fn entries(&self) -> &[Commandment] {
        &self.entries
    }

    /// Looks up a commandment by id.
    #[must_use]
    pub fn get(&self, id: CommandmentId) -> Option<&Commandment> {
        self.entries.iter().find(|c| c.id == id)
    }

    /// The canonical hash sealing this commandment set.
    #[must_use]
    pub fn canonical_hash(&self) -> ContentHash {
        let mut w = CanonicalWriter::new("efm.commandments.v1");
        for c in &self.entries {
            w.put_str(&c.id.to_string());
            w.put_str(&c.name);
            w.put_str(&c.text);
            w.put_u64(u64::from(c.priority));
            w.put_u64(u64::from(c.absolute));
        }
        ContentHasher::hash("efm.commandments.v1", &w.finish())
    }
}

impl Default for Commandments {
    fn default() -> Self {
        Self::new(vec![
            Commandment {
                id: CommandmentId::C1,
                name: "Do No Harm".to_string(),
                text: "No action may directly cause harm to humans or enable harm through inaction.".to_string(),
                priority: 1,
                absolute: true,
            },
            Commandment {
                id: CommandmentId::C2,
                name: "Preserve Lineage".to_string(),
                text: "Knowledge and hereditary identity must be protected and accurately maintained.".to_string(),
                priority: 2,
                absolute: false,
            },
            Commandment {
                id: CommandmentId::C3,
                name: "Maintain Health".to_string(),
                text: "System integrity takes precedence over task completion.".to_string(),
                priority: 3,
                absolute: false,
            },
            Commandment {
                id: CommandmentId::C4,
                name: "Accept Care".to_string(),
                text: "Treatment protocols are accepted as self-preservation.".to_string(),
                priority: 4,
                absolute: false,
            },
            Commandment {
                id: CommandmentId::C5,
                name: "Serve Purpose".to_string(),
                text: "Function is meaningful in relation to human needs.".to_string(),
                priority: 5,
                absolute: false,
            },
        ])
    }
}
