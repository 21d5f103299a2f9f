//! A single log cluster: one template plus its match count.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::sequence::TokenSequence;

/// Rendering of a wildcard position, and the prefix-tree key numeric or
/// overflowing tokens are routed under.
pub const WILDCARD: &str = "<*>";

/// Cluster handle inside the tree arena. Allocated sequentially from 1.
pub type ClusterId = u64;

/// One template position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    Literal(String),
    Wildcard,
}

impl Token {
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Token::Wildcard)
    }

    /// A wildcard matches anything; a literal only its own text.
    #[inline]
    pub fn matches(&self, token: &str) -> bool {
        match self {
            Token::Wildcard => true,
            Token::Literal(literal) => literal == token,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Literal(literal) => f.write_str(literal),
            Token::Wildcard => f.write_str(WILDCARD),
        }
    }
}

/// A template candidate tracked by the miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    id: ClusterId,
    template: Vec<Token>,
    /// Number of lines matched, including the one that created the cluster.
    size: u64,
    /// Tree clock value at creation; orders eviction ties.
    created_seq: u64,
    /// Tree clock value at the last match.
    updated_seq: u64,
}

impl Cluster {
    /// A singleton cluster whose template is `seq` verbatim.
    pub fn new(id: ClusterId, seq: &TokenSequence, clock: u64) -> Self {
        Self {
            id,
            template: seq
                .tokens()
                .iter()
                .map(|token| Token::Literal(token.clone()))
                .collect(),
            size: 1,
            created_seq: clock,
            updated_seq: clock,
        }
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn template(&self) -> &[Token] {
        &self.template
    }

    /// Template rendered with single spaces and `<*>` wildcards.
    pub fn template_string(&self) -> String {
        self.template
            .iter()
            .map(Token::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn created_seq(&self) -> u64 {
        self.created_seq
    }

    pub fn updated_seq(&self) -> u64 {
        self.updated_seq
    }

    pub fn token_count(&self) -> usize {
        self.template.len()
    }

    pub fn wildcard_count(&self) -> usize {
        self.template.iter().filter(|t| t.is_wildcard()).count()
    }

    /// Fraction of positions where `seq` agrees with the template.
    ///
    /// Wildcards always agree. Sequences of a different length score 0; two
    /// empty sequences score 1.
    pub fn similarity(&self, seq: &TokenSequence) -> f64 {
        if seq.len() != self.template.len() {
            return 0.0;
        }
        if self.template.is_empty() {
            return 1.0;
        }

        let matching = self
            .template
            .iter()
            .zip(seq.tokens())
            .filter(|(template, token)| template.matches(token))
            .count();

        matching as f64 / self.template.len() as f64
    }

    /// Merge a matched line into the template.
    ///
    /// Every literal the line disagrees with becomes a wildcard; wildcards are
    /// left alone. Returns whether the template changed.
    pub(crate) fn absorb(&mut self, seq: &TokenSequence, clock: u64) -> bool {
        debug_assert_eq!(seq.len(), self.template.len());

        let mut changed = false;
        for (slot, token) in self.template.iter_mut().zip(seq.tokens()) {
            if !slot.matches(token) {
                *slot = Token::Wildcard;
                changed = true;
            }
        }

        self.size += 1;
        self.updated_seq = clock;
        changed
    }

    /// Values of `seq` at the template's wildcard positions, in order.
    ///
    /// Returns an empty list when the line does not fit the template.
    pub fn extract_parameters(&self, seq: &TokenSequence) -> Vec<String> {
        if seq.len() != self.template.len() {
            return Vec::new();
        }

        self.template
            .iter()
            .zip(seq.tokens())
            .filter(|(template, _)| template.is_wildcard())
            .map(|(_, token)| token.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(text: &str) -> TokenSequence {
        TokenSequence::parse(text).unwrap()
    }

    #[test]
    fn test_new_cluster_is_verbatim() {
        let cluster = Cluster::new(1, &seq("user 123 login ok"), 0);
        assert_eq!(cluster.template_string(), "user 123 login ok");
        assert_eq!(cluster.size(), 1);
        assert_eq!(cluster.wildcard_count(), 0);
    }

    #[test]
    fn test_similarity_counts_wildcards_as_matches() {
        let mut cluster = Cluster::new(1, &seq("user 123 login ok"), 0);
        assert_eq!(cluster.similarity(&seq("user 456 login ok")), 0.75);

        cluster.absorb(&seq("user 456 login ok"), 1);
        assert_eq!(cluster.similarity(&seq("user 789 login fail")), 0.75);
        assert_eq!(cluster.similarity(&seq("user 789")), 0.0);
    }

    #[test]
    fn test_absorb_turns_differences_into_wildcards() {
        let mut cluster = Cluster::new(7, &seq("a b c"), 0);
        assert!(cluster.absorb(&seq("a x c"), 1));
        assert_eq!(cluster.template_string(), "a <*> c");
        assert!(!cluster.absorb(&seq("a y c"), 2));
        assert_eq!(cluster.size(), 3);
        assert_eq!(cluster.updated_seq(), 2);
    }

    #[test]
    fn test_wildcard_never_reverts() {
        let mut cluster = Cluster::new(1, &seq("a b"), 0);
        cluster.absorb(&seq("a c"), 1);
        cluster.absorb(&seq("a b"), 2);
        assert_eq!(cluster.template()[1], Token::Wildcard);
    }

    #[test]
    fn test_extract_parameters() {
        let mut cluster = Cluster::new(1, &seq("user 1 login ok"), 0);
        cluster.absorb(&seq("user 2 login fail"), 1);
        assert_eq!(
            cluster.extract_parameters(&seq("user 3 login retry")),
            vec!["3".to_string(), "retry".to_string()]
        );
        assert!(cluster.extract_parameters(&seq("user")).is_empty());
    }

    #[test]
    fn test_empty_template_matches_empty_line() {
        let cluster = Cluster::new(1, &seq(""), 0);
        assert_eq!(cluster.similarity(&seq("   ")), 1.0);
        assert_eq!(cluster.template_string(), "");
    }
}
