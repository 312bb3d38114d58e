//! Candidate identity

use std::fmt;

use ulid::Ulid;

/// A participant racing for one election key
///
/// The id is the value written under the election key when campaigning, so it
/// must be unique across every process that may join the same election.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    id: String,
    election_key: String,
}

impl Candidate {
    /// Create a candidate with a freshly generated id
    ///
    /// The id is `"{prefix}-{ulid}"` when a prefix is given, otherwise a bare ULID.
    pub fn new(election_key: impl Into<String>, prefix: Option<&str>) -> Self {
        let ulid = Ulid::new();
        let id = match prefix {
            Some(prefix) => format!("{}-{}", prefix, ulid),
            None => ulid.to_string(),
        };
        Self::with_id(election_key, id)
    }

    /// Create a candidate with a caller-supplied id
    pub fn with_id(election_key: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            election_key: election_key.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn election_key(&self) -> &str {
        &self.election_key
    }

    /// Whether an observed leader value names this candidate
    pub fn is(&self, leader: &str) -> bool {
        self.id == leader
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.election_key)
    }
}
