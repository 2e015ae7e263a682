//! Handwritten grammars and text-editing utilities shared by the
//! integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tree_sitter_engine::{
    FieldMapEntry, InputEdit, Language, LanguageBuilder, Lexer, ParseAction, Parser, Point,
    StateId, Symbol, SymbolMetadata,
};

pub const END: Symbol = 0;

/// Arithmetic with the usual precedence, as an SLR table:
///
/// ```text
/// expression -> expression '+' term    (fields: left, right)
///             | term
/// term       -> term '*' number
///             | number
/// ```
///
/// `#` starts a comment that runs to the end of the line and may appear
/// anywhere.
pub mod arithmetic {
    use super::Symbol;

    pub const NUMBER: Symbol = 1;
    pub const PLUS: Symbol = 2;
    pub const STAR: Symbol = 3;
    pub const COMMENT: Symbol = 4;
    pub const EXPRESSION: Symbol = 5;
    pub const TERM: Symbol = 6;

    pub const FIELD_LEFT: u16 = 1;
    pub const FIELD_RIGHT: u16 = 2;

    pub(super) const TOKENS: [(char, Symbol); 2] = [('+', PLUS), ('*', STAR)];
}

/// `expression -> expression '+' expression | number`, with the
/// shift/reduce conflict left in the table so that the parser must fork.
pub mod ambiguous {
    use super::Symbol;

    pub const NUMBER: Symbol = 1;
    pub const PLUS: Symbol = 2;
    pub const EXPRESSION: Symbol = 3;

    pub(super) const TOKENS: [(char, Symbol); 1] = [('+', PLUS)];
}

fn lex_operators(lexer: &mut Lexer<'_>, number: Symbol, operators: &[(char, Symbol)]) -> bool {
    while lexer.lookahead().is_whitespace() {
        lexer.advance(true);
    }
    if lexer.eof() {
        lexer.set_result_symbol(END);
        lexer.mark_end();
        return true;
    }

    let c = lexer.lookahead();
    if c.is_ascii_digit() {
        while lexer.lookahead().is_ascii_digit() {
            lexer.advance(false);
        }
        lexer.set_result_symbol(number);
    } else if let Some(&(_, symbol)) = operators.iter().find(|(op, _)| *op == c) {
        lexer.advance(false);
        lexer.set_result_symbol(symbol);
    } else {
        return false;
    }
    lexer.mark_end();
    true
}

fn lex_arithmetic(lexer: &mut Lexer<'_>, _state: StateId) -> bool {
    while lexer.lookahead().is_whitespace() {
        lexer.advance(true);
    }
    if lexer.lookahead() == '#' && !lexer.eof() {
        while !lexer.eof() && lexer.lookahead() != '\n' {
            lexer.advance(false);
        }
        lexer.set_result_symbol(arithmetic::COMMENT);
        lexer.mark_end();
        return true;
    }
    lex_operators(lexer, arithmetic::NUMBER, &arithmetic::TOKENS)
}

fn lex_ambiguous(lexer: &mut Lexer<'_>, _state: StateId) -> bool {
    lex_operators(lexer, ambiguous::NUMBER, &ambiguous::TOKENS)
}

pub fn arithmetic_language() -> Arc<Language> {
    use arithmetic::{COMMENT, EXPRESSION, FIELD_LEFT, FIELD_RIGHT, NUMBER, PLUS, STAR, TERM};

    let reduce_term = [ParseAction::reduce(TERM, 1, 0)];
    let reduce_product = [ParseAction::reduce(TERM, 3, 0)];
    let reduce_expression = [ParseAction::reduce(EXPRESSION, 1, 0)];
    let reduce_sum = [ParseAction::reduce(EXPRESSION, 3, 1)];

    let language = LanguageBuilder::new("arithmetic", lex_arithmetic)
        .token("number", SymbolMetadata::NAMED)
        .token("+", SymbolMetadata::ANONYMOUS)
        .token("*", SymbolMetadata::ANONYMOUS)
        .token("comment", SymbolMetadata::NAMED)
        .non_terminal("expression", SymbolMetadata::NAMED)
        .non_terminal("term", SymbolMetadata::NAMED)
        .field("left")
        .field("right")
        .state_count(9)
        .extra(COMMENT)
        // 1: start
        .actions(1, NUMBER, &[ParseAction::shift(4)])
        .goto(1, EXPRESSION, 2)
        .goto(1, TERM, 3)
        // 2: expression .
        .actions(2, END, &[ParseAction::Accept])
        .actions(2, PLUS, &[ParseAction::shift(5)])
        // 3: term . (expression) / term . '*'
        .actions(3, STAR, &[ParseAction::shift(6)])
        .actions(3, END, &reduce_expression)
        .actions(3, PLUS, &reduce_expression)
        // 4: number .
        .actions(4, END, &reduce_term)
        .actions(4, PLUS, &reduce_term)
        .actions(4, STAR, &reduce_term)
        // 5: expression '+' . term
        .actions(5, NUMBER, &[ParseAction::shift(4)])
        .goto(5, TERM, 7)
        // 6: term '*' . number
        .actions(6, NUMBER, &[ParseAction::shift(8)])
        // 7: expression '+' term .
        .actions(7, STAR, &[ParseAction::shift(6)])
        .actions(7, END, &reduce_sum)
        .actions(7, PLUS, &reduce_sum)
        // 8: term '*' number .
        .actions(8, END, &reduce_product)
        .actions(8, PLUS, &reduce_product)
        .actions(8, STAR, &reduce_product)
        .production(
            1,
            &[
                FieldMapEntry {
                    field_id: FIELD_LEFT,
                    child_index: 0,
                    inherited: false,
                },
                FieldMapEntry {
                    field_id: FIELD_RIGHT,
                    child_index: 2,
                    inherited: false,
                },
            ],
            &[],
        )
        .build()
        .expect("arithmetic tables are valid");
    Arc::new(language)
}

pub fn ambiguous_language() -> Arc<Language> {
    use ambiguous::{EXPRESSION, NUMBER, PLUS};

    let reduce_number = [ParseAction::reduce(EXPRESSION, 1, 0)];
    let reduce_sum = ParseAction::reduce(EXPRESSION, 3, 0);

    let language = LanguageBuilder::new("ambiguous", lex_ambiguous)
        .token("number", SymbolMetadata::NAMED)
        .token("+", SymbolMetadata::ANONYMOUS)
        .non_terminal("expression", SymbolMetadata::NAMED)
        .state_count(6)
        // 1: start
        .actions(1, NUMBER, &[ParseAction::shift(3)])
        .goto(1, EXPRESSION, 2)
        // 2: expression .
        .actions(2, END, &[ParseAction::Accept])
        .actions(2, PLUS, &[ParseAction::shift(4)])
        // 3: number .
        .actions(3, END, &reduce_number)
        .actions(3, PLUS, &reduce_number)
        // 4: expression '+' . expression
        .actions(4, NUMBER, &[ParseAction::shift(3)])
        .goto(4, EXPRESSION, 5)
        // 5: expression '+' expression . / expression . '+' expression
        .actions(5, END, &[reduce_sum])
        .actions(5, PLUS, &[ParseAction::shift(4), reduce_sum])
        .build()
        .expect("ambiguous tables are valid");
    Arc::new(language)
}

pub fn parser_for(language: &Arc<Language>) -> Parser {
    let mut parser = Parser::new();
    parser
        .set_language(language.clone())
        .expect("test languages use the current ABI version");
    parser
}

fn position_at(text: &str, byte: usize) -> Point {
    let before = &text.as_bytes()[..byte];
    let row = before.iter().filter(|&&b| b == b'\n').count();
    let column = before
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(byte, |newline| byte - newline - 1);
    Point::new(row as u32, column as u32)
}

/// Replace `deleted_len` bytes at `start` with `inserted`, returning the
/// edit that describes the change.
pub fn perform_edit(text: &mut String, start: usize, deleted_len: usize, inserted: &str) -> InputEdit {
    let old_end = start + deleted_len;
    let start_position = position_at(text, start);
    let old_end_position = position_at(text, old_end);
    text.replace_range(start..old_end, inserted);
    let new_end = start + inserted.len();
    InputEdit {
        start_byte: start as u32,
        old_end_byte: old_end as u32,
        new_end_byte: new_end as u32,
        start_position,
        old_end_position,
        new_end_position: position_at(text, new_end),
    }
}
