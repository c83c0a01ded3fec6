use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MIN_SYMBOL_LEN: usize = 2;
const MAX_SYMBOL_LEN: usize = 20;

/// Characters allowed between the base and quote legs of a pair.
const SEPARATORS: [char; 3] = ['-', '_', '/'];

/// Exchange ticker of a crypto instrument.
///
/// Accepts the spellings venues use for the same pair (`BTCUSDT`, `BTC-USDT`,
/// `BTC_USDT`, `btc/usdt`) and multiplier-prefixed contracts such as
/// `1000PEPEUSDT`. The value is uppercased; separators are kept as given so a
/// symbol round-trips to the provider that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let normalized = input.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }

        let chars = normalized.chars().collect::<Vec<_>>();
        if !(MIN_SYMBOL_LEN..=MAX_SYMBOL_LEN).contains(&chars.len()) {
            return Err(ValidationError::SymbolLength {
                len: chars.len(),
                min: MIN_SYMBOL_LEN,
                max: MAX_SYMBOL_LEN,
            });
        }

        let last = chars.len() - 1;
        for (index, &ch) in chars.iter().enumerate() {
            if ch.is_ascii_alphanumeric() {
                continue;
            }
            if !SEPARATORS.contains(&ch) {
                return Err(ValidationError::SymbolInvalidChar { ch, index });
            }
            let isolated = index != 0 && index != last && chars[index - 1].is_ascii_alphanumeric();
            if !isolated {
                return Err(ValidationError::SymbolMisplacedSeparator { ch, index });
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Symbol {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Symbol {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}
