//! The program decoder/executor boundary.
//!
//! A decoded token sequence either parses into a program or fails with an
//! explicit `ParseFailure`; executing a program against an input string either
//! yields an output or fails with an explicit `RuntimeFailure`. Callers
//! pattern-match on these instead of relying on a blanket catch-all, and both
//! failures are localized: they score as non-matches, never as a crash.

use thiserror::Error;

/// A token sequence that does not form a valid program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("unknown token id {0}")]
    UnknownToken(u32),
    #[error("empty program")]
    Empty,
}

/// A program that fails when executed against an input string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeFailure {
    #[error("execution aborted: {0}")]
    Aborted(String),
}

/// DSL boundary: decode token sequences into programs and execute them.
pub trait ProgramExecutor {
    type Program;

    fn decode(&self, tokens: &[u32]) -> Result<Self::Program, ParseFailure>;
    fn execute(&self, program: &Self::Program, input: &str) -> Result<String, RuntimeFailure>;
    fn program_text(&self, program: &Self::Program) -> String;
}

/// Truncate a decoded sequence at the first end token, inclusive.
///
/// Padding and anything after the end token is decoder noise and never fed to
/// the parser.
pub fn truncate_at_eos(tokens: &[u32], eos: u32) -> &[u32] {
    match tokens.iter().position(|&t| t == eos) {
        Some(pos) => &tokens[..=pos],
        None => tokens,
    }
}

/// Character table mapping input/output token ids to characters.
///
/// Id 0 is reserved for padding; id `i+1` maps to `chars[i]`.
#[derive(Debug, Clone)]
pub struct CharTable {
    chars: Vec<char>,
}

impl CharTable {
    pub fn new(chars: Vec<char>) -> Self {
        Self { chars }
    }

    /// Printable ASCII table, the character set of the string-transformation
    /// tasks.
    pub fn ascii_printable() -> Self {
        Self {
            chars: (32u8..127).map(|b| b as char).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn char_for(&self, id: u32) -> Option<char> {
        if id == 0 {
            return None;
        }
        self.chars.get(id as usize - 1).copied()
    }

    pub fn id_for(&self, c: char) -> Option<u32> {
        self.chars.iter().position(|&x| x == c).map(|i| i as u32 + 1)
    }

    /// Decode a padded id sequence into a string, skipping padding.
    pub fn decode_str(&self, ids: &[u32]) -> String {
        ids.iter().filter_map(|&id| self.char_for(id)).collect()
    }
}

/// Reference DSL where a program is a literal output string.
///
/// Program tokens: 0 = padding, `bos`/`eos` special ids, and every id at
/// `char_offset()` or above names one character. Used by the synthetic
/// pipeline and the engine tests; real task DSLs plug in through the same
/// trait.
#[derive(Debug, Clone)]
pub struct ConstStringDsl {
    table: CharTable,
    bos: u32,
    eos: u32,
}

impl ConstStringDsl {
    pub fn new(table: CharTable, bos: u32, eos: u32) -> Self {
        Self { table, bos, eos }
    }

    /// First program token id that names a character.
    pub fn char_offset(&self) -> u32 {
        self.bos.max(self.eos) + 1
    }

    /// Program vocabulary size including padding and specials.
    pub fn vocab_size(&self) -> usize {
        self.char_offset() as usize + self.table.len()
    }

    /// Encode a literal string as program tokens (no BOS, EOS-terminated).
    pub fn encode(&self, s: &str) -> Option<Vec<u32>> {
        let mut tokens = Vec::with_capacity(s.len() + 1);
        for c in s.chars() {
            tokens.push(self.table.id_for(c)? - 1 + self.char_offset());
        }
        tokens.push(self.eos);
        Some(tokens)
    }

    pub fn eos(&self) -> u32 {
        self.eos
    }

    pub fn table(&self) -> &CharTable {
        &self.table
    }
}

impl ProgramExecutor for ConstStringDsl {
    type Program = String;

    fn decode(&self, tokens: &[u32]) -> Result<String, ParseFailure> {
        let mut out = String::new();
        for &t in truncate_at_eos(tokens, self.eos) {
            if t == 0 || t == self.bos {
                continue;
            }
            if t == self.eos {
                break;
            }
            if t < self.char_offset() {
                return Err(ParseFailure::UnknownToken(t));
            }
            match self.table.char_for(t - self.char_offset() + 1) {
                Some(c) => out.push(c),
                None => return Err(ParseFailure::UnknownToken(t)),
            }
        }
        if out.is_empty() {
            return Err(ParseFailure::Empty);
        }
        Ok(out)
    }

    fn execute(&self, program: &String, _input: &str) -> Result<String, RuntimeFailure> {
        Ok(program.clone())
    }

    fn program_text(&self, program: &String) -> String {
        format!("Const({:?})", program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsl() -> ConstStringDsl {
        ConstStringDsl::new(CharTable::ascii_printable(), 1, 2)
    }

    #[test]
    fn test_truncate_at_eos() {
        assert_eq!(truncate_at_eos(&[5, 6, 2, 9, 0], 2), &[5, 6, 2]);
        assert_eq!(truncate_at_eos(&[5, 6], 2), &[5, 6]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let dsl = dsl();
        let tokens = dsl.encode("ab c").unwrap();
        assert_eq!(*tokens.last().unwrap(), dsl.eos());
        let program = dsl.decode(&tokens).unwrap();
        assert_eq!(program, "ab c");
        assert_eq!(dsl.execute(&program, "whatever").unwrap(), "ab c");
    }

    #[test]
    fn test_decode_ignores_trailing_padding() {
        let dsl = dsl();
        let mut tokens = dsl.encode("x").unwrap();
        tokens.extend([0, 7, 0]);
        assert_eq!(dsl.decode(&tokens).unwrap(), "x");
    }

    #[test]
    fn test_decode_rejects_out_of_range_token() {
        let dsl = dsl();
        let bad = dsl.vocab_size() as u32 + 10;
        assert_eq!(
            dsl.decode(&[bad, dsl.eos()]),
            Err(ParseFailure::UnknownToken(bad))
        );
    }

    #[test]
    fn test_decode_rejects_empty_program() {
        let dsl = dsl();
        assert_eq!(dsl.decode(&[1, 2]), Err(ParseFailure::Empty));
    }

    #[test]
    fn test_char_table_lookup() {
        let table = CharTable::ascii_printable();
        assert_eq!(table.char_for(0), None);
        assert_eq!(table.char_for(1), Some(' '));
        assert_eq!(table.id_for('a').and_then(|id| table.char_for(id)), Some('a'));
        assert_eq!(table.decode_str(&[0, 1, 0]), " ");
    }
}
