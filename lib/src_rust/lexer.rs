//! Character-level access to the input for lex functions and external
//! scanners.
//!
//! The lexer pulls chunks of text from an [`Input`] only while a token is
//! being scanned, decodes one code point at a time and keeps track of the
//! included ranges so that excluded text is never seen by a grammar.

use std::fmt;

use crate::{
    language::Symbol,
    length::Length,
    parser::{LogType, Logger},
    point::{Point, Range},
    unicode::InputEncoding,
};

/// Maximum number of bytes an external scanner may serialize.
pub const SERIALIZATION_BUFFER_SIZE: usize = 1024;

/// Upper bound on how much of a chunk the lexer copies at once.
const MAX_CHUNK_SIZE: usize = 4096;

const BYTE_ORDER_MARK: char = '\u{FEFF}';

/// A source of text to parse.
pub trait Input {
    /// Return the text starting at `byte_offset` (which lies at `position`).
    /// The chunk may have any non-zero length; an empty chunk signals the
    /// end of the document.
    fn read(&mut self, byte_offset: u32, position: Point) -> &[u8];
}

impl Input for &[u8] {
    fn read(&mut self, byte_offset: u32, _: Point) -> &[u8] {
        self.get(byte_offset as usize..).unwrap_or_default()
    }
}

impl Input for &str {
    fn read(&mut self, byte_offset: u32, _: Point) -> &[u8] {
        self.as_bytes()
            .get(byte_offset as usize..)
            .unwrap_or_default()
    }
}

impl Input for Vec<u8> {
    fn read(&mut self, byte_offset: u32, _: Point) -> &[u8] {
        self.get(byte_offset as usize..).unwrap_or_default()
    }
}

impl Input for String {
    fn read(&mut self, byte_offset: u32, _: Point) -> &[u8] {
        self.as_bytes()
            .get(byte_offset as usize..)
            .unwrap_or_default()
    }
}

/// Adapts a callback to the [`Input`] trait, for text stored in pieces
/// such as a rope.
pub struct ChunkedInput<'a, F>
where
    F: FnMut(u32, Point) -> &'a [u8],
{
    callback: F,
    _text: std::marker::PhantomData<&'a [u8]>,
}

impl<'a, F> ChunkedInput<'a, F>
where
    F: FnMut(u32, Point) -> &'a [u8],
{
    pub const fn new(callback: F) -> Self {
        Self {
            callback,
            _text: std::marker::PhantomData,
        }
    }
}

impl<'a, F> Input for ChunkedInput<'a, F>
where
    F: FnMut(u32, Point) -> &'a [u8],
{
    fn read(&mut self, byte_offset: u32, position: Point) -> &[u8] {
        (self.callback)(byte_offset, position)
    }
}

/// A grammar-defined scanner for tokens that a lex function cannot
/// describe, such as indentation or heredocs.
pub trait ExternalScanner {
    /// Try to recognize one of the `valid_symbols` (indexed by external
    /// token) at the lexer's position, storing its index with
    /// [`Lexer::set_result_symbol`].
    fn scan(&mut self, lexer: &mut Lexer<'_>, valid_symbols: &[bool]) -> bool;

    /// Write the scanner's state into `buffer`, returning the byte count.
    fn serialize(&self, buffer: &mut [u8]) -> usize;

    /// Restore the scanner from bytes produced by `serialize`. An empty
    /// buffer means the initial state.
    fn deserialize(&mut self, buffer: &[u8]);
}

pub struct Lexer<'a> {
    input: &'a mut dyn Input,
    encoding: InputEncoding,
    included_ranges: &'a [Range],
    logger: Option<&'a mut Logger>,

    lookahead: char,
    decode_error: bool,
    lookahead_size: u32,
    result_symbol: Symbol,

    pub(crate) current_position: Length,
    pub(crate) token_start_position: Length,
    pub(crate) token_end_position: Length,

    current_included_range_index: usize,
    chunk: Vec<u8>,
    chunk_start: u32,
    pub(crate) did_get_column: bool,
    column: Option<u32>,
}

impl fmt::Debug for Lexer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lexer")
            .field("lookahead", &self.lookahead)
            .field("current_position", &self.current_position)
            .field("result_symbol", &self.result_symbol)
            .finish_non_exhaustive()
    }
}

impl<'a> Lexer<'a> {
    /// `included_ranges` must be non-empty and sorted.
    pub(crate) fn new(
        input: &'a mut dyn Input,
        encoding: InputEncoding,
        included_ranges: &'a [Range],
        logger: Option<&'a mut Logger>,
    ) -> Self {
        let mut lexer = Self {
            input,
            encoding,
            included_ranges,
            logger,
            lookahead: '\0',
            decode_error: false,
            lookahead_size: 0,
            result_symbol: 0,
            current_position: Length::ZERO,
            token_start_position: Length::ZERO,
            token_end_position: Length::UNDEFINED,
            current_included_range_index: 0,
            chunk: Vec::new(),
            chunk_start: 0,
            did_get_column: false,
            column: None,
        };
        lexer.goto(Length::ZERO);
        lexer
    }

    // -----------------------------------------------------------------------
    // The vocabulary used by lex functions and external scanners
    // -----------------------------------------------------------------------

    /// The current code point. `'\0'` at the end of input and U+FFFD for
    /// bytes that are invalid in the input's encoding.
    #[inline]
    #[must_use]
    pub const fn lookahead(&self) -> char {
        self.lookahead
    }

    #[inline]
    #[must_use]
    pub const fn result_symbol(&self) -> Symbol {
        self.result_symbol
    }

    #[inline]
    pub fn set_result_symbol(&mut self, symbol: Symbol) {
        self.result_symbol = symbol;
    }

    /// Whether the lexer has consumed all included text.
    #[inline]
    #[must_use]
    pub fn eof(&self) -> bool {
        self.current_included_range_index == self.included_ranges.len()
    }

    /// Advance to the next character. Skipped characters are treated as
    /// whitespace and excluded from the token.
    pub fn advance(&mut self, skip: bool) {
        if self.chunk.is_empty() {
            return;
        }
        if self.is_logging() {
            let c = self.lookahead;
            let verb = if skip { "skip" } else { "consume" };
            if (' '..='~').contains(&c) {
                self.log_lex(format_args!("{verb} character:'{c}'"));
            } else {
                self.log_lex(format_args!("{verb} character:{}", c as u32));
            }
        }
        self.do_advance(skip);
    }

    /// Mark the current position as the end of the token being scanned.
    pub fn mark_end(&mut self) {
        if !self.eof() {
            // At the start of an included range, the token ends where the
            // previous range ended.
            let index = self.current_included_range_index;
            let current_range = self.included_ranges[index];
            if index > 0 && self.current_position.bytes == current_range.start_byte {
                let previous_range = self.included_ranges[index - 1];
                self.token_end_position =
                    Length::new(previous_range.end_byte, previous_range.end_point);
                return;
            }
        }
        self.token_end_position = self.current_position;
    }

    /// The column of the current position, counted in code points.
    pub fn get_column(&mut self) -> u32 {
        self.did_get_column = true;

        if self.column.is_none() {
            let goal_byte = self.current_position.bytes;
            let start_of_line = Length::new(
                self.current_position
                    .bytes
                    .saturating_sub(self.current_position.extent.column),
                Point::new(self.current_position.extent.row, 0),
            );
            self.goto(start_of_line);
            self.column = Some(0);
            self.get_chunk();

            if !self.eof() {
                self.get_lookahead();
                while self.current_position.bytes < goal_byte
                    && !self.eof()
                    && !self.chunk.is_empty()
                {
                    self.do_advance(false);
                }
            }
        }

        self.column.unwrap_or_default()
    }

    /// Whether the lexer is at the first byte of an included range that
    /// follows an excluded gap.
    #[must_use]
    pub fn is_at_included_range_start(&self) -> bool {
        self.included_ranges
            .get(self.current_included_range_index)
            .is_some_and(|range| self.current_position.bytes == range.start_byte)
    }

    /// Write a message to the parser's lex log.
    pub fn log(&mut self, args: fmt::Arguments<'_>) {
        self.log_lex(args);
    }

    // -----------------------------------------------------------------------
    // Parser-facing operations
    // -----------------------------------------------------------------------

    pub(crate) fn reset(&mut self, position: Length) {
        if position.bytes != self.current_position.bytes {
            self.goto(position);
        }
    }

    /// Prepare to scan a new token at the current position.
    pub(crate) fn start(&mut self) {
        self.token_start_position = self.current_position;
        self.token_end_position = Length::UNDEFINED;
        self.result_symbol = 0;
        self.did_get_column = false;
        if !self.eof() {
            if self.chunk.is_empty() {
                self.get_chunk();
            }
            if self.lookahead_size == 0 {
                self.get_lookahead();
            }
            if self.current_position.bytes == 0 {
                if self.lookahead == BYTE_ORDER_MARK {
                    self.advance(true);
                }
                self.column = Some(0);
            }
        }
    }

    /// Finish the current token, widening `lookahead_end_byte` to cover
    /// every byte the scan looked at.
    pub(crate) fn finish(&mut self, lookahead_end_byte: &mut u32) {
        if self.token_end_position.is_undefined() {
            self.mark_end();
        }

        // A token that ended at an included range boundary has had its end
        // moved back to the previous range.
        if self.token_end_position.bytes < self.token_start_position.bytes {
            self.token_start_position = self.token_end_position;
        }

        let mut current_lookahead_end_byte = self.current_position.bytes + 1;

        // Detecting an invalid sequence may have required peeking further.
        if self.decode_error {
            current_lookahead_end_byte += 4;
        }

        if current_lookahead_end_byte > *lookahead_end_byte {
            *lookahead_end_byte = current_lookahead_end_byte;
        }
    }

    pub(crate) fn included_ranges(&self) -> &'a [Range] {
        self.included_ranges
    }

    pub(crate) fn is_logging(&self) -> bool {
        self.logger.is_some() || tracing::enabled!(target: "tree_sitter_engine::lex", tracing::Level::TRACE)
    }

    pub(crate) fn log_parse(&mut self, args: fmt::Arguments<'_>) {
        self.emit(LogType::Parse, args);
    }

    fn log_lex(&mut self, args: fmt::Arguments<'_>) {
        self.emit(LogType::Lex, args);
    }

    fn emit(&mut self, log_type: LogType, args: fmt::Arguments<'_>) {
        let message = args.to_string();
        match log_type {
            LogType::Parse => tracing::trace!(target: "tree_sitter_engine::parse", "{message}"),
            LogType::Lex => tracing::trace!(target: "tree_sitter_engine::lex", "{message}"),
        }
        if let Some(logger) = self.logger.as_deref_mut() {
            logger(log_type, &message);
        }
    }

    // -----------------------------------------------------------------------
    // Chunk and position management
    // -----------------------------------------------------------------------

    fn clear_chunk(&mut self) {
        self.chunk.clear();
        self.chunk_start = 0;
    }

    fn chunk_end(&self) -> u32 {
        self.chunk_start + self.chunk.len() as u32
    }

    fn get_chunk(&mut self) {
        self.chunk_start = self.current_position.bytes;
        self.chunk.clear();
        let text = self
            .input
            .read(self.current_position.bytes, self.current_position.extent);
        let len = text.len().min(MAX_CHUNK_SIZE);
        self.chunk.extend_from_slice(&text[..len]);
        if self.chunk.is_empty() {
            self.current_included_range_index = self.included_ranges.len();
        }
    }

    fn get_lookahead(&mut self) {
        let position_in_chunk = (self.current_position.bytes - self.chunk_start) as usize;
        let available = self.chunk.len().saturating_sub(position_in_chunk);

        if available == 0 {
            self.lookahead_size = 1;
            self.lookahead = '\0';
            self.decode_error = false;
            return;
        }

        let (mut size, mut decoded) = self.encoding.decode(&self.chunk[position_in_chunk..]);

        // The chunk may have ended in the middle of a multi-byte character.
        if decoded.is_none() && available < self.encoding.max_code_point_len() {
            self.get_chunk();
            (size, decoded) = self.encoding.decode(&self.chunk);
        }

        match decoded {
            Some(c) => {
                self.lookahead = c;
                self.lookahead_size = size.max(1);
                self.decode_error = false;
            }
            None => {
                self.lookahead = char::REPLACEMENT_CHARACTER;
                self.lookahead_size = 1;
                self.decode_error = true;
            }
        }
    }

    /// Move to `position`, or to the first included byte after it.
    fn goto(&mut self, position: Length) {
        if position.bytes != self.current_position.bytes {
            self.column = None;
        }
        self.current_position = position;

        let found = self
            .included_ranges
            .iter()
            .enumerate()
            .find(|(_, range)| {
                range.end_byte > position.bytes && range.end_byte > range.start_byte
            })
            .map(|(index, range)| (index, *range));

        if let Some((index, range)) = found {
            if range.start_byte >= self.current_position.bytes {
                self.current_position = Length::new(range.start_byte, range.start_point);
            }
            self.current_included_range_index = index;

            if !self.chunk.is_empty()
                && (self.current_position.bytes < self.chunk_start
                    || self.current_position.bytes >= self.chunk_end())
            {
                self.clear_chunk();
            }
            self.lookahead_size = 0;
            self.lookahead = '\0';
        } else {
            // Past every included range.
            self.current_included_range_index = self.included_ranges.len();
            if let Some(last) = self.included_ranges.last() {
                self.current_position = Length::new(last.end_byte, last.end_point);
            }
            self.clear_chunk();
            self.lookahead_size = 1;
            self.lookahead = '\0';
        }
        self.decode_error = false;
    }

    fn do_advance(&mut self, skip: bool) {
        if self.lookahead_size != 0 {
            if self.lookahead == '\n' {
                self.current_position.extent.row += 1;
                self.current_position.extent.column = 0;
                self.column = Some(0);
            } else {
                let is_bom =
                    self.current_position.bytes == 0 && self.lookahead == BYTE_ORDER_MARK;
                if !is_bom {
                    if let Some(column) = self.column.as_mut() {
                        *column += 1;
                    }
                }
                self.current_position.extent.column += self.lookahead_size;
            }
            self.current_position.bytes += self.lookahead_size;
        }

        let mut in_range = false;
        while let Some(range) = self.included_ranges.get(self.current_included_range_index) {
            if self.current_position.bytes < range.end_byte && range.end_byte != range.start_byte {
                in_range = true;
                break;
            }
            self.current_included_range_index += 1;
            if let Some(next) = self.included_ranges.get(self.current_included_range_index) {
                self.current_position = Length::new(next.start_byte, next.start_point);
            }
        }

        if skip {
            self.token_start_position = self.current_position;
        }

        if in_range {
            if self.current_position.bytes < self.chunk_start
                || self.current_position.bytes >= self.chunk_end()
            {
                self.get_chunk();
            }
            self.get_lookahead();
        } else {
            self.clear_chunk();
            self.lookahead = '\0';
            self.lookahead_size = 1;
            self.decode_error = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexer<'a>(input: &'a mut dyn Input, ranges: &'a [Range]) -> Lexer<'a> {
        Lexer::new(input, InputEncoding::Utf8, ranges, None)
    }

    fn range(start: u32, end: u32) -> Range {
        Range {
            start_byte: start,
            end_byte: end,
            start_point: Point::new(0, start),
            end_point: Point::new(0, end),
        }
    }

    #[test]
    fn walks_characters_and_tracks_rows() {
        let mut text = String::from("ab\ncd");
        let ranges = [Range::ALL];
        let mut lexer = lexer(&mut text, &ranges);
        lexer.start();
        let mut seen = String::new();
        while !lexer.eof() {
            seen.push(lexer.lookahead());
            lexer.advance(false);
        }
        assert_eq!(seen, "ab\ncd");
        assert_eq!(lexer.current_position, Length::new(5, Point::new(1, 2)));
        assert_eq!(lexer.lookahead(), '\0');
    }

    #[test]
    fn skipping_moves_token_start() {
        let mut text = String::from("  x");
        let ranges = [Range::ALL];
        let mut lexer = lexer(&mut text, &ranges);
        lexer.start();
        lexer.advance(true);
        lexer.advance(true);
        assert_eq!(lexer.token_start_position.bytes, 2);
        lexer.advance(false);
        lexer.mark_end();
        let mut lookahead_end = 0;
        lexer.finish(&mut lookahead_end);
        assert_eq!(lexer.token_end_position.bytes, 3);
        assert_eq!(lookahead_end, 4);
    }

    #[test]
    fn excluded_text_is_never_seen() {
        let mut text = String::from("ab--cd");
        let ranges = [range(0, 2), range(4, 6)];
        let mut lexer = lexer(&mut text, &ranges);
        lexer.start();
        let mut seen = String::new();
        while !lexer.eof() {
            if lexer.is_at_included_range_start() && !seen.is_empty() {
                seen.push('|');
            }
            seen.push(lexer.lookahead());
            lexer.advance(false);
        }
        assert_eq!(seen, "ab|cd");
    }

    #[test]
    fn column_counts_code_points() {
        let mut text = String::from("é€x");
        let ranges = [Range::ALL];
        let mut lexer = lexer(&mut text, &ranges);
        lexer.start();
        lexer.advance(false);
        lexer.advance(false);
        assert_eq!(lexer.lookahead(), 'x');
        assert_eq!(lexer.get_column(), 2);
        assert_eq!(lexer.current_position.extent.column, 5);
    }

    #[test]
    fn reads_input_in_chunks() {
        let pieces: [&[u8]; 3] = [b"12", b"+3", b""];
        let mut input = ChunkedInput::new(|offset, _| match offset {
            0 | 1 => &pieces[0][offset as usize..],
            2 | 3 => &pieces[1][offset as usize - 2..],
            _ => pieces[2],
        });
        let ranges = [Range::ALL];
        let mut lexer = lexer(&mut input, &ranges);
        lexer.start();
        let mut seen = String::new();
        while !lexer.eof() {
            seen.push(lexer.lookahead());
            lexer.advance(false);
        }
        assert_eq!(seen, "12+3");
    }

    #[test]
    fn invalid_bytes_decode_to_replacement_character() {
        let mut bytes = vec![b'a', 0xFF, b'b'];
        let ranges = [Range::ALL];
        let mut lexer = lexer(&mut bytes, &ranges);
        lexer.start();
        lexer.advance(false);
        assert_eq!(lexer.lookahead(), char::REPLACEMENT_CHARACTER);
        lexer.advance(false);
        assert_eq!(lexer.lookahead(), 'b');
    }
}
