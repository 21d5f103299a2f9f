//! Tokenization of a log line into the sequence the miner clusters on.

use crate::error::InputError;

/// A log line split on whitespace. The token count is the primary partition
/// key of the cluster tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TokenSequence {
    tokens: Vec<String>,
}

impl TokenSequence {
    /// Tokenize `text`, rejecting lines that carry binary garbage.
    ///
    /// Whitespace control characters (tab, newline, carriage return, ...) are
    /// separators. Any other control character, NUL included, is an
    /// [`InputError`].
    pub fn parse(text: &str) -> Result<Self, InputError> {
        for (offset, ch) in text.char_indices() {
            if ch == '\0' {
                return Err(InputError::NulByte { offset });
            }
            if ch.is_control() && !ch.is_whitespace() {
                return Err(InputError::ControlCharacter {
                    code: ch as u32,
                    offset,
                });
            }
        }

        Ok(Self {
            tokens: text.split_whitespace().map(str::to_string).collect(),
        })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_any_whitespace() {
        let seq = TokenSequence::parse("  user\t123   login\nok ").unwrap();
        assert_eq!(seq.tokens(), &["user", "123", "login", "ok"]);
        assert_eq!(seq.len(), 4);
    }

    #[test]
    fn test_empty_and_blank_lines_have_no_tokens() {
        assert!(TokenSequence::parse("").unwrap().is_empty());
        assert!(TokenSequence::parse("   \t ").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_nul_and_control_characters() {
        assert_eq!(
            TokenSequence::parse("abc\0def"),
            Err(InputError::NulByte { offset: 3 })
        );
        assert_eq!(
            TokenSequence::parse("a\u{7}b"),
            Err(InputError::ControlCharacter { code: 7, offset: 1 })
        );
    }
}
