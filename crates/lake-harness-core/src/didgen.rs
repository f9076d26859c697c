//! Deterministic domain ids.
//!
//! Domain ids are derived from the source system, the domain entity type,
//! the connection id and the connector-local id, so re-running a conversion
//! (or converting the same entity from another scope) lands on the same row.

use std::fmt::{self, Display};

/// Generates `"{system}:{Entity}:{connection_id}:{local_id}"` ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdGenerator {
    prefix: String,
}

impl DomainIdGenerator {
    /// `system` is the connector name (`"github"`), `entity` the domain
    /// entity type (`"Issue"`).
    pub fn new(system: &str, entity: &str) -> Self {
        Self {
            prefix: format!("{}:{}", system, entity),
        }
    }

    pub fn generate(&self, connection_id: u64, local_id: impl Display) -> String {
        format!("{}:{}:{}", self.prefix, connection_id, local_id)
    }

    /// Id for entities keyed by several local parts, joined with `:`.
    pub fn generate_composite(&self, connection_id: u64, parts: &[&dyn Display]) -> String {
        let mut id = format!("{}:{}", self.prefix, connection_id);
        for part in parts {
            id.push(':');
            id.push_str(&part.to_string());
        }
        id
    }

    /// Like [`generate`](Self::generate), but an absent local id yields an
    /// empty key instead of an id pointing at nothing.
    pub fn generate_or_empty<D: Display>(&self, connection_id: u64, local_id: Option<D>) -> String {
        match local_id {
            Some(id) => self.generate(connection_id, id),
            None => String::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Display for DomainIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_deterministic() {
        let a = DomainIdGenerator::new("X", "Issue");
        let b = DomainIdGenerator::new("X", "Issue");
        assert_eq!(a.generate(1, 42), "X:Issue:1:42");
        assert_eq!(a.generate(1, 42), b.generate(1, 42));
    }

    #[test]
    fn entity_and_connection_disambiguate() {
        let issue = DomainIdGenerator::new("github", "Issue");
        let board = DomainIdGenerator::new("github", "Board");
        assert_ne!(issue.generate(1, 42), board.generate(1, 42));
        assert_ne!(issue.generate(1, 42), issue.generate(2, 42));
    }

    #[test]
    fn composite_and_empty_ids() {
        let gen = DomainIdGenerator::new("zentao", "IssueComment");
        assert_eq!(gen.generate_composite(3, &[&"story", &17]), "zentao:IssueComment:3:story:17");
        assert_eq!(gen.generate_or_empty::<u64>(3, None), "");
        assert_eq!(gen.generate_or_empty(3, Some("a")), "zentao:IssueComment:3:a");
    }
}
