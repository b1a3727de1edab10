//! Short human-readable transfer codes: `{nameplate}-{word}-{word}...`
//!
//! The nameplate only routes the two peers to the same mailbox and may be
//! small and sequential. All of the secrecy comes from the words, which are
//! drawn uniformly from a fixed 1024-entry list (10 bits each).

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use rand::Rng;

use crate::error::{Error, Result};

/// Minimum number of words after the nameplate.
pub const MIN_WORDS: usize = 2;

static WORDLIST: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| include_str!("wordlist.txt").lines().map(str::trim).filter(|w| !w.is_empty()).collect());

/// The fixed list code words are drawn from.
pub fn wordlist() -> &'static [&'static str] {
    &WORDLIST
}

/// Mailbox routing key: a positive integer, kept in canonical decimal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nameplate(u64);

impl Nameplate {
    pub fn new(value: u64) -> Result<Self> {
        if value == 0 {
            return Err(Error::MalformedCode("nameplate must be a positive integer".into()));
        }
        Ok(Nameplate(value))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Nameplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Nameplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedCode(format!("nameplate '{s}' is not a positive integer")));
        }
        let value = s
            .parse::<u64>()
            .map_err(|_| Error::MalformedCode(format!("nameplate '{s}' is out of range")))?;
        Nameplate::new(value)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TransferCode {
    nameplate: Nameplate,
    words: Vec<String>,
}

impl TransferCode {
    /// Build a fresh code on an allocated nameplate.
    ///
    /// # Arguments
    /// * `nameplate` - Nameplate handed out by the broker
    /// * `word_count` - Number of random words, at least [`MIN_WORDS`]
    pub fn generate(nameplate: Nameplate, word_count: usize) -> Self {
        let list = wordlist();
        let mut rng = rand::rng();
        let words = (0..word_count.max(MIN_WORDS))
            .map(|_| list[rng.random_range(0..list.len())].to_string())
            .collect();
        TransferCode { nameplate, words }
    }

    /// Parse a code typed or pasted by a user. Surrounding whitespace is
    /// ignored and words are lower-cased; unknown words are accepted so a
    /// typo surfaces as a key-confirmation failure rather than a parse error.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let mut segments = text.split('-');
        let nameplate = segments
            .next()
            .ok_or_else(|| Error::MalformedCode("empty code".into()))?
            .parse::<Nameplate>()?;

        let words: Vec<String> = segments.map(|w| w.trim().to_lowercase()).collect();
        if words.len() < MIN_WORDS {
            return Err(Error::MalformedCode(format!(
                "expected at least {MIN_WORDS} words after the nameplate, found {}",
                words.len()
            )));
        }
        if let Some(bad) = words.iter().find(|w| w.is_empty() || !w.chars().all(|c| c.is_alphanumeric())) {
            return Err(Error::MalformedCode(format!("invalid word segment '{bad}'")));
        }

        Ok(TransferCode { nameplate, words })
    }

    pub fn nameplate(&self) -> Nameplate {
        self.nameplate
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Canonical text used as the PAKE password.
    pub(crate) fn password_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nameplate)?;
        for word in &self.words {
            write!(f, "-{word}")?;
        }
        Ok(())
    }
}

// Codes are secrets; keep the words out of debug logs.
impl fmt::Debug for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCode")
            .field("nameplate", &self.nameplate)
            .field("words", &self.words.len())
            .finish()
    }
}

impl FromStr for TransferCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TransferCode::parse(s)
    }
}
