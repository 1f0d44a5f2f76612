//! Source buffer and position tracker.
//!
//! A `Scanner` owns a cursor over one source file's bytes and provides the
//! lexical helpers the preprocessor is built from: identifier reading with a
//! case-class filter, whitespace skipping with several stop conditions,
//! string/char constant skipping that honors `\` escapes, and on-demand line
//! counting from an absolute byte offset.

use bitflags::bitflags;

bitflags! {
    /// Case classes accepted by [`Scanner::read_symbol`], plus whether the
    /// trailing whitespace after the symbol is kept in place.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Symbol: u8 {
        const UPPER = 1;
        const LOWER = 1 << 1;
        /// Leave the cursor immediately after the symbol instead of
        /// skipping the whitespace that follows it.
        const KEEP_TRAILING_SPACE = 1 << 2;
    }
}

/// How [`Scanner::read_string_constant`] interprets the bytes between the
/// quotes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringMode {
    /// Preprocessor interpretation: bytes are kept as written; only `\"`
    /// and `\\` collapse to the quoted character. Used for include paths
    /// and `foreach` parameters.
    Raw,
    /// C-style escape interpretation (`\n`, `\t`, `\r`, `\0`, `\\`, `\"`,
    /// `\'`); unknown escapes keep the escaped character.
    Cooked,
}

/// A scan-level failure: a message anchored at a byte offset. The
/// preprocessor converts these into located [`crate::Error`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanError {
    pub offset: usize,
    pub message: &'static str,
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Cursor over one source file.
pub struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        debug_assert!(pos <= self.src.len());
        self.pos = pos;
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    pub fn peek_at(&self, n: usize) -> Option<u8> {
        self.src.get(self.pos + n).copied()
    }

    pub fn bump(&mut self) {
        if self.pos < self.src.len() {
            self.pos += 1;
        }
    }

    pub fn bump_by(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.src.len());
    }

    /// The source text between two byte offsets.
    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        std::str::from_utf8(&self.src[start..end]).expect("source is valid utf-8")
    }

    /// Does the text at the cursor start with `prefix`?
    pub fn looking_at(&self, prefix: &str) -> bool {
        self.src[self.pos..].starts_with(prefix.as_bytes())
    }

    /// Skip spaces, tabs, carriage returns and newlines.
    pub fn skip_space(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    /// Skip spaces, tabs and carriage returns, but not newlines.
    pub fn skip_inline_space(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r')) {
            self.pos += 1;
        }
    }

    /// Skip whitespace but stop right after the first newline consumed.
    /// Used after a directive has been handled so at most the directive's
    /// own line terminator is swallowed.
    pub fn skip_space_stop_after_newline(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r') => self.pos += 1,
                Some(b'\n') => {
                    self.pos += 1;
                    break;
                }
                _ => break,
            }
        }
    }

    /// Move the cursor backwards past any whitespace so a diagnostic points
    /// at the last real token instead of the gap after it.
    pub fn reverse_skip_space(&mut self) {
        while self.pos > 0
            && matches!(self.src[self.pos - 1], b' ' | b'\t' | b'\r' | b'\n')
        {
            self.pos -= 1;
        }
    }

    /// Read an identifier made of the allowed letter classes plus digits,
    /// not digit-initial. Returns `None` (cursor untouched) if the first
    /// character does not qualify.
    pub fn read_symbol(&mut self, flags: Symbol) -> Option<String> {
        let first = self.peek()?;
        if !is_symbol_letter(first, flags) {
            return None;
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_symbol_letter(c, flags) || c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let s = self.slice(start, self.pos).to_owned();
        if !flags.contains(Symbol::KEEP_TRAILING_SPACE) {
            self.skip_space();
        }
        Some(s)
    }

    /// Check whether the directive `name` is at the cursor. Directives are
    /// made of lowercase letters only; the match requires that the next
    /// character not be lowercase, so `ifdef` never matches a prefix of
    /// `ifdefsomething`. On a match the cursor ends after the directive.
    pub fn check_for_directive(&mut self, name: &str) -> bool {
        debug_assert!(!name.is_empty());
        if !self.looking_at(name) {
            return false;
        }
        match self.src.get(self.pos + name.len()) {
            Some(c) if c.is_ascii_lowercase() => false,
            _ => {
                self.pos += name.len();
                true
            }
        }
    }

    /// Skip a double-quoted string constant, honoring `\` escapes. The
    /// cursor must be at the opening quote.
    pub fn skip_string_constant(&mut self, keep_trailing_space: bool) -> ScanResult<()> {
        let start = self.pos;
        debug_assert_eq!(self.peek(), Some(b'"'));
        self.pos += 1;
        loop {
            match self.peek() {
                None => {
                    self.pos = start;
                    return Err(ScanError {
                        offset: start,
                        message: "unterminated string constant",
                    });
                }
                Some(b'\\') => self.bump_by(2),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        if !keep_trailing_space {
            self.skip_space();
        }
        Ok(())
    }

    /// Skip a single-quoted character constant, honoring `\` escapes.
    pub fn skip_char_constant(&mut self, keep_trailing_space: bool) -> ScanResult<()> {
        let start = self.pos;
        debug_assert_eq!(self.peek(), Some(b'\''));
        self.pos += 1;
        loop {
            match self.peek() {
                None => {
                    self.pos = start;
                    return Err(ScanError {
                        offset: start,
                        message: "unterminated char constant",
                    });
                }
                Some(b'\\') => self.bump_by(2),
                Some(b'\'') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        if !keep_trailing_space {
            self.skip_space();
        }
        Ok(())
    }

    /// Read the content of a double-quoted string constant. The cursor must
    /// be at the opening quote and ends right after the closing quote;
    /// trailing whitespace is left for the caller, which often needs to see
    /// the line terminator.
    pub fn read_string_constant(&mut self, mode: StringMode) -> ScanResult<String> {
        let start = self.pos;
        debug_assert_eq!(self.peek(), Some(b'"'));
        self.pos += 1;
        let mut out: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.pos = start;
                    return Err(ScanError {
                        offset: start,
                        message: "unterminated string constant",
                    });
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let Some(c) = self.peek() else {
                        self.pos = start;
                        return Err(ScanError {
                            offset: start,
                            message: "unterminated string constant",
                        });
                    };
                    self.pos += 1;
                    match mode {
                        StringMode::Raw => match c {
                            b'"' | b'\\' => out.push(c),
                            _ => {
                                out.push(b'\\');
                                out.push(c);
                            }
                        },
                        StringMode::Cooked => out.push(match c {
                            b'n' => b'\n',
                            b't' => b'\t',
                            b'r' => b'\r',
                            b'0' => 0,
                            _ => c,
                        }),
                    }
                }
                Some(c) => {
                    self.pos += 1;
                    out.push(c);
                }
            }
        }
        Ok(String::from_utf8(out).expect("escape removal preserves utf-8"))
    }

    /// 1-based line number of a byte offset, computed on demand by counting
    /// line feeds from the start of the buffer.
    pub fn line_of(&self, offset: usize) -> u32 {
        let offset = offset.min(self.src.len());
        1 + self.src[..offset].iter().filter(|&&c| c == b'\n').count() as u32
    }

    /// 1-based column of a byte offset within its line.
    pub fn column_of(&self, offset: usize) -> u32 {
        let offset = offset.min(self.src.len());
        let line_start = self.src[..offset]
            .iter()
            .rposition(|&c| c == b'\n')
            .map_or(0, |p| p + 1);
        (offset - line_start) as u32 + 1
    }

    /// Byte offset of the start of the line containing `offset`.
    pub fn line_start_of(&self, offset: usize) -> usize {
        let offset = offset.min(self.src.len());
        self.src[..offset]
            .iter()
            .rposition(|&c| c == b'\n')
            .map_or(0, |p| p + 1)
    }
}

fn is_symbol_letter(c: u8, flags: Symbol) -> bool {
    (flags.contains(Symbol::UPPER) && c.is_ascii_uppercase())
        || (flags.contains(Symbol::LOWER) && c.is_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_respect_case_class() {
        let mut s = Scanner::new("FOO bar");
        assert_eq!(
            s.read_symbol(Symbol::UPPER | Symbol::KEEP_TRAILING_SPACE),
            Some("FOO".to_owned())
        );
        assert_eq!(s.pos(), 3);
        s.skip_space();
        assert_eq!(s.read_symbol(Symbol::UPPER), None);
        assert_eq!(
            s.read_symbol(Symbol::UPPER | Symbol::LOWER),
            Some("bar".to_owned())
        );
    }

    #[test]
    fn symbols_take_trailing_digits_but_not_leading() {
        let mut s = Scanner::new("A1B2 9X");
        assert_eq!(
            s.read_symbol(Symbol::UPPER | Symbol::KEEP_TRAILING_SPACE),
            Some("A1B2".to_owned())
        );
        s.skip_space();
        assert_eq!(s.read_symbol(Symbol::UPPER), None);
    }

    #[test]
    fn directive_match_requires_word_boundary() {
        let mut s = Scanner::new("ifdefsomething");
        assert!(!s.check_for_directive("ifdef"));
        assert_eq!(s.pos(), 0);
        let mut s = Scanner::new("ifdef X");
        assert!(s.check_for_directive("ifdef"));
        assert_eq!(s.pos(), 5);
        let mut s = Scanner::new("ifdef2");
        assert!(s.check_for_directive("ifdef"));
    }

    #[test]
    fn string_skipping_honors_escapes() {
        let mut s = Scanner::new(r#""a\"b" x"#);
        s.skip_string_constant(true).unwrap();
        assert_eq!(s.peek(), Some(b' '));
    }

    #[test]
    fn unterminated_string_restores_cursor() {
        let mut s = Scanner::new("\"abc");
        let err = s.skip_string_constant(true).unwrap_err();
        assert_eq!(err.offset, 0);
        assert_eq!(s.pos(), 0);
    }

    #[test]
    fn raw_strings_keep_bytes() {
        let mut s = Scanner::new(r#""a\nb\"c""#);
        let out = s.read_string_constant(StringMode::Raw).unwrap();
        assert_eq!(out, "a\\nb\"c");
    }

    #[test]
    fn cooked_strings_interpret_escapes() {
        let mut s = Scanner::new(r#""a\nb""#);
        let out = s.read_string_constant(StringMode::Cooked).unwrap();
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn line_counting_is_on_demand() {
        let s = Scanner::new("a\nbb\nccc");
        assert_eq!(s.line_of(0), 1);
        assert_eq!(s.line_of(2), 2);
        assert_eq!(s.line_of(5), 3);
        assert_eq!(s.column_of(6), 2);
        assert_eq!(s.line_start_of(7), 5);
    }
}
