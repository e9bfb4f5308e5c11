//! Token → index vocabularies.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::{Error, Result};

/// How tokens map to indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum TokenizerKind {
    /// Vocabulary file of pinyin syllables and characters.
    #[default]
    Pinyin,
    /// Vocabulary file of characters.
    Char,
    /// UTF-8 bytes, no file.
    Byte,
    /// Vocabulary file without the space-at-zero check.
    Custom,
}

impl FromStr for TokenizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pinyin" => Ok(Self::Pinyin),
            "char" => Ok(Self::Char),
            "byte" => Ok(Self::Byte),
            "custom" => Ok(Self::Custom),
            other => Err(Error::InvalidVocabulary(format!(
                "unknown tokenizer kind {other:?}"
            ))),
        }
    }
}

impl TryFrom<String> for TokenizerKind {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Immutable token → index map.
///
/// Index 0 doubles as the unknown index, so a lookup of the space and of an
/// unknown token land on the same id after the +1 shift.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    kind: TokenizerKind,
    map: HashMap<String, u32>,
}

impl Vocabulary {
    /// Read a newline-delimited vocabulary file, one token per line.
    pub fn from_file(path: impl AsRef<Path>, kind: TokenizerKind) -> Result<Self> {
        let path = path.as_ref();
        if kind == TokenizerKind::Byte {
            return Ok(Self::bytes());
        }
        let contents = std::fs::read_to_string(path)?;
        let vocab = Self::from_lines(&contents, kind)?;
        tracing::info!(path = %path.display(), size = vocab.len(), ?kind, "loaded vocabulary");
        Ok(vocab)
    }

    /// Parse vocabulary text. Line `i` gets index `i`; a repeated token keeps
    /// its last index.
    pub fn from_lines(contents: &str, kind: TokenizerKind) -> Result<Self> {
        if kind == TokenizerKind::Byte {
            return Ok(Self::bytes());
        }
        let mut lines: Vec<&str> = contents.split('\n').collect();
        if lines.last() == Some(&"") {
            lines.pop();
        }
        let map: HashMap<String, u32> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| (line.to_string(), i as u32))
            .collect();

        if map.is_empty() {
            return Err(Error::InvalidVocabulary("vocabulary is empty".into()));
        }
        if matches!(kind, TokenizerKind::Pinyin | TokenizerKind::Char)
            && map.get(" ") != Some(&0)
        {
            return Err(Error::InvalidVocabulary(
                "the space must be at index 0, which also serves as the unknown token".into(),
            ));
        }
        Ok(Self { kind, map })
    }

    /// The 256-entry UTF-8 byte vocabulary.
    pub fn bytes() -> Self {
        Self {
            kind: TokenizerKind::Byte,
            map: HashMap::new(),
        }
    }

    pub fn kind(&self) -> TokenizerKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        match self.kind {
            TokenizerKind::Byte => 256,
            _ => self.map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw index of a token; unknown tokens map to 0.
    pub fn index(&self, token: &str) -> u32 {
        self.map.get(token).copied().unwrap_or(0)
    }

    /// Shifted ids of one token list (every index + 1; 0 stays the filler).
    pub fn encode(&self, tokens: &[String]) -> Vec<u32> {
        match self.kind {
            TokenizerKind::Byte => tokens
                .iter()
                .flat_map(|t| t.bytes())
                .map(|b| b as u32 + 1)
                .collect(),
            _ => tokens.iter().map(|t| self.index(t) + 1).collect(),
        }
    }

    /// Encode every token list and right-pad with 0 to `max_len`.
    pub fn list_str_to_idx(&self, texts: &[Vec<String>], max_len: usize) -> Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|tokens| {
                let mut ids = self.encode(tokens);
                if ids.len() > max_len {
                    return Err(Error::SequenceTooLong {
                        len: ids.len(),
                        max: max_len,
                    });
                }
                ids.resize(max_len, 0);
                Ok(ids)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tokens(s: &str) -> Vec<String> {
        s.chars().map(String::from).collect()
    }

    #[test]
    fn space_and_unknown_collide() {
        let vocab = Vocabulary::from_lines(" \na\nb\n", TokenizerKind::Char).unwrap();
        assert_eq!(vocab.encode(&tokens(" ")), vec![1]);
        assert_eq!(vocab.encode(&tokens("z")), vec![1]);
        assert_eq!(vocab.encode(&tokens("ab")), vec![2, 3]);
    }

    #[test]
    fn space_must_be_first() {
        let err = Vocabulary::from_lines("a\n \n", TokenizerKind::Pinyin).unwrap_err();
        assert!(matches!(err, Error::InvalidVocabulary(_)));
        assert!(Vocabulary::from_lines("a\n \n", TokenizerKind::Custom).is_ok());
    }

    #[test]
    fn padding_and_overflow() {
        let vocab = Vocabulary::from_lines(" \na\n", TokenizerKind::Char).unwrap();
        let ids = vocab.list_str_to_idx(&[tokens("aa")], 5).unwrap();
        assert_eq!(ids, vec![vec![2, 2, 0, 0, 0]]);
        let err = vocab.list_str_to_idx(&[tokens("aaaaaa")], 5).unwrap_err();
        assert!(matches!(err, Error::SequenceTooLong { len: 6, max: 5 }));
    }

    #[test]
    fn byte_kind_encodes_utf8() {
        let vocab = Vocabulary::bytes();
        assert_eq!(vocab.len(), 256);
        assert_eq!(vocab.encode(&["é".to_string()]), vec![0xc3 + 1, 0xa9 + 1]);
    }

    #[test]
    fn kind_tags() {
        assert_eq!("custom".parse::<TokenizerKind>().unwrap(), TokenizerKind::Custom);
        assert!("phoneme".parse::<TokenizerKind>().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, " \nni3\nhao3\n").unwrap();
        let vocab = Vocabulary::from_file(file.path(), TokenizerKind::Pinyin).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.index("hao3"), 2);
    }
}
