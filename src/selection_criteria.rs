//! Read preferences: which members of a deployment may answer a read.

use std::collections::HashMap;

use crate::options::ServerAddress;

/// A read preference tag set. A server satisfies a tag set when it carries
/// every key/value pair in the set.
pub type TagSet = HashMap<String, String>;

/// Specifies how a read operation is routed to members of a deployment.
///
/// The tag-carrying modes hold a list of tag sets; a server is acceptable if
/// any one set matches it. An empty list places no tag constraint.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Route this operation to the primary if it's available, but fall back
    /// to a secondary if not.
    PrimaryPreferred { tag_sets: Vec<TagSet> },

    /// Only route this operation to a secondary.
    Secondary { tag_sets: Vec<TagSet> },

    /// Route this operation to a secondary if one is available, but fall
    /// back to the primary if not.
    SecondaryPreferred { tag_sets: Vec<TagSet> },

    /// Route this operation to the member with the least network latency,
    /// regardless of role.
    Nearest { tag_sets: Vec<TagSet> },

    /// Route this operation to one specific server, ignoring roles.
    Server { address: ServerAddress },
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::Primary
    }
}

impl ReadPreference {
    /// Parses the connection-string spelling of a mode.
    pub(crate) fn from_mode(mode: &str) -> Option<Self> {
        Some(match mode.to_ascii_lowercase().as_str() {
            "primary" => ReadPreference::Primary,
            "primarypreferred" => ReadPreference::PrimaryPreferred { tag_sets: Vec::new() },
            "secondary" => ReadPreference::Secondary { tag_sets: Vec::new() },
            "secondarypreferred" => ReadPreference::SecondaryPreferred { tag_sets: Vec::new() },
            "nearest" => ReadPreference::Nearest { tag_sets: Vec::new() },
            _ => return None,
        })
    }

    pub(crate) fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
            ReadPreference::Server { .. } => "server",
        }
    }

    pub(crate) fn tag_sets(&self) -> &[TagSet] {
        match self {
            ReadPreference::Primary | ReadPreference::Server { .. } => &[],
            ReadPreference::PrimaryPreferred { tag_sets }
            | ReadPreference::Secondary { tag_sets }
            | ReadPreference::SecondaryPreferred { tag_sets }
            | ReadPreference::Nearest { tag_sets } => tag_sets,
        }
    }

    /// Attaches tag predicates to a non-primary mode.
    pub fn with_tags(mut self, sets: Vec<TagSet>) -> crate::error::Result<Self> {
        match self {
            ReadPreference::Primary | ReadPreference::Server { .. } => {
                Err(crate::error::Error::invalid_argument(
                    "read preference tags require a non-primary mode".to_string(),
                ))
            }
            ReadPreference::PrimaryPreferred { ref mut tag_sets }
            | ReadPreference::Secondary { ref mut tag_sets }
            | ReadPreference::SecondaryPreferred { ref mut tag_sets }
            | ReadPreference::Nearest { ref mut tag_sets } => {
                *tag_sets = sets;
                Ok(self)
            }
        }
    }

    /// Whether this preference can only be satisfied by a writable member.
    pub(crate) fn requires_primary(&self) -> bool {
        matches!(self, ReadPreference::Primary)
    }

    /// Whether a server carrying `tags` satisfies the tag predicates: any
    /// one set matching accepts the server. No sets means no constraint.
    pub(crate) fn tags_match(&self, tags: &TagSet) -> bool {
        let sets = self.tag_sets();
        if sets.is_empty() {
            return true;
        }
        sets.iter()
            .any(|set| set.iter().all(|(k, v)| tags.get(k) == Some(v)))
    }

    /// The preference a paired send is routed under: the more restrictive of
    /// the two. Differing non-equal preferences collapse to `Primary`, the
    /// only mode both messages are guaranteed to tolerate.
    pub(crate) fn intersect(self, other: ReadPreference) -> ReadPreference {
        if self == other {
            self
        } else {
            ReadPreference::Primary
        }
    }
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ mode: {}", self.mode())?;
        if let ReadPreference::Server { address } = self {
            write!(f, ", server: {}", address)?;
        }
        if !self.tag_sets().is_empty() {
            write!(f, ", tags: {:?}", self.tag_sets())?;
        }
        write!(f, " }}")
    }
}
