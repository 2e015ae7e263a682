//! Language tables: symbol metadata, the parse table, lex modes and the
//! functions a generated grammar provides for tokenization.
//!
//! A [`Language`] is immutable once built and is shared between parsers and
//! trees behind an `Arc`.

use std::{collections::HashMap, fmt};

use crate::{
    error::LanguageError,
    error_costs::ERROR_STATE,
    lexer::{ExternalScanner, Lexer},
    LANGUAGE_VERSION, MIN_COMPATIBLE_LANGUAGE_VERSION,
};

pub type Symbol = u16;
pub type StateId = u16;
pub type FieldId = u16;

pub const BUILTIN_SYM_END: Symbol = 0;
pub const BUILTIN_SYM_ERROR: Symbol = Symbol::MAX;
pub const BUILTIN_SYM_ERROR_REPEAT: Symbol = Symbol::MAX - 1;

/// Lex state marking the end of a non-terminal extra, where no token is
/// expected.
pub const LEX_STATE_NONE: u16 = u16::MAX;

/// A function that recognizes one token starting at the lexer's position,
/// for the given lex state. Returns `false` if no token matched.
pub type LexFn = fn(&mut Lexer<'_>, StateId) -> bool;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SymbolMetadata {
    pub visible: bool,
    pub named: bool,
    pub supertype: bool,
}

impl SymbolMetadata {
    /// A named node such as `identifier`.
    pub const NAMED: Self = Self {
        visible: true,
        named: true,
        supertype: false,
    };
    /// An anonymous token such as `"+"`.
    pub const ANONYMOUS: Self = Self {
        visible: true,
        named: false,
        supertype: false,
    };
    /// An auxiliary symbol that never appears in the tree's public view.
    pub const HIDDEN: Self = Self {
        visible: false,
        named: false,
        supertype: false,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParseAction {
    Shift {
        state: StateId,
        extra: bool,
        repetition: bool,
    },
    Reduce {
        symbol: Symbol,
        child_count: u8,
        dynamic_precedence: i16,
        production_id: u16,
    },
    Accept,
    Recover,
}

impl ParseAction {
    #[must_use]
    pub const fn shift(state: StateId) -> Self {
        Self::Shift {
            state,
            extra: false,
            repetition: false,
        }
    }

    #[must_use]
    pub const fn shift_repeat(state: StateId) -> Self {
        Self::Shift {
            state,
            extra: false,
            repetition: true,
        }
    }

    #[must_use]
    pub const fn shift_extra() -> Self {
        Self::Shift {
            state: 0,
            extra: true,
            repetition: false,
        }
    }

    #[must_use]
    pub const fn reduce(symbol: Symbol, child_count: u8, production_id: u16) -> Self {
        Self::Reduce {
            symbol,
            child_count,
            dynamic_precedence: 0,
            production_id,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LexMode {
    pub lex_state: u16,
    pub external_lex_state: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldMapEntry {
    pub field_id: FieldId,
    pub child_index: u8,
    pub inherited: bool,
}

/// The actions available for one `(state, terminal)` pair.
#[derive(Clone, Copy, Debug)]
pub struct TableEntry<'a> {
    pub actions: &'a [ParseAction],
    pub is_reusable: bool,
}

/// Describes a grammar's hand-written scanner for context-sensitive tokens.
pub struct ExternalScannerDef {
    /// For each external lex state, which external tokens are valid. Row 0
    /// is the state where the scanner is not consulted.
    pub states: Vec<Vec<bool>>,
    /// Maps external token indices to grammar symbols.
    pub symbol_map: Vec<Symbol>,
    pub create: fn() -> Box<dyn ExternalScanner>,
}

#[derive(Clone, Debug, Default)]
struct ActionList {
    actions: Vec<ParseAction>,
    reusable: bool,
}

/// Compiled tables for one grammar.
pub struct Language {
    name: &'static str,
    abi_version: u32,
    symbol_names: Vec<&'static str>,
    symbol_metadata: Vec<SymbolMetadata>,
    token_count: u32,
    external_token_count: u32,
    state_count: u32,
    parse_table: Vec<u16>,
    action_lists: Vec<ActionList>,
    lex_modes: Vec<LexMode>,
    field_names: Vec<&'static str>,
    field_map_slices: Vec<(u16, u16)>,
    field_map_entries: Vec<FieldMapEntry>,
    alias_sequences: Vec<Vec<Symbol>>,
    pub(crate) lex_fn: LexFn,
    pub(crate) keyword_lex_fn: Option<LexFn>,
    pub(crate) keyword_capture_token: Symbol,
    pub(crate) external_scanner: Option<ExternalScannerDef>,
}

impl fmt::Debug for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Language")
            .field("name", &self.name)
            .field("abi_version", &self.abi_version)
            .field("symbol_count", &self.symbol_names.len())
            .field("state_count", &self.state_count)
            .finish_non_exhaustive()
    }
}

impl Language {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn abi_version(&self) -> u32 {
        self.abi_version
    }

    #[must_use]
    pub fn symbol_count(&self) -> u32 {
        self.symbol_names.len() as u32
    }

    #[must_use]
    pub const fn token_count(&self) -> u32 {
        self.token_count
    }

    #[must_use]
    pub const fn external_token_count(&self) -> u32 {
        self.external_token_count
    }

    #[must_use]
    pub const fn state_count(&self) -> u32 {
        self.state_count
    }

    #[must_use]
    pub fn field_count(&self) -> u32 {
        self.field_names.len().saturating_sub(1) as u32
    }

    #[must_use]
    pub fn symbol_name(&self, symbol: Symbol) -> &'static str {
        match symbol {
            BUILTIN_SYM_ERROR => "ERROR",
            BUILTIN_SYM_ERROR_REPEAT => "_ERROR",
            _ => self.symbol_names.get(usize::from(symbol)).copied().unwrap_or(""),
        }
    }

    #[must_use]
    pub fn symbol_metadata(&self, symbol: Symbol) -> SymbolMetadata {
        match symbol {
            BUILTIN_SYM_ERROR => SymbolMetadata::NAMED,
            BUILTIN_SYM_ERROR_REPEAT => SymbolMetadata::HIDDEN,
            _ => self
                .symbol_metadata
                .get(usize::from(symbol))
                .copied()
                .unwrap_or_default(),
        }
    }

    /// Look up a symbol id by its name and whether it is named.
    #[must_use]
    pub fn symbol_for_name(&self, name: &str, is_named: bool) -> Option<Symbol> {
        if is_named && name == "ERROR" {
            return Some(BUILTIN_SYM_ERROR);
        }
        self.symbol_names
            .iter()
            .zip(&self.symbol_metadata)
            .position(|(symbol_name, metadata)| {
                *symbol_name == name && metadata.visible && metadata.named == is_named
            })
            .map(|index| index as Symbol)
    }

    #[must_use]
    pub fn field_name_for_id(&self, field_id: FieldId) -> Option<&'static str> {
        if field_id == 0 {
            return None;
        }
        self.field_names.get(usize::from(field_id)).copied()
    }

    #[must_use]
    pub fn field_id_for_name(&self, name: &str) -> Option<FieldId> {
        self.field_names
            .iter()
            .skip(1)
            .position(|field_name| *field_name == name)
            .map(|index| index as FieldId + 1)
    }

    #[inline]
    fn lookup(&self, state: StateId, symbol: Symbol) -> u16 {
        if usize::from(symbol) >= self.symbol_names.len() {
            return 0;
        }
        let index = usize::from(state) * self.symbol_names.len() + usize::from(symbol);
        self.parse_table.get(index).copied().unwrap_or(0)
    }

    /// The actions for a terminal in a given state. Non-terminals and the
    /// error symbols never have actions.
    #[must_use]
    pub fn table_entry(&self, state: StateId, symbol: Symbol) -> TableEntry<'_> {
        if symbol == BUILTIN_SYM_ERROR || symbol == BUILTIN_SYM_ERROR_REPEAT {
            return TableEntry {
                actions: &[],
                is_reusable: false,
            };
        }
        if u32::from(symbol) >= self.token_count {
            return TableEntry {
                actions: &[],
                is_reusable: false,
            };
        }
        let list = &self.action_lists[usize::from(self.lookup(state, symbol))];
        TableEntry {
            actions: &list.actions,
            is_reusable: list.reusable,
        }
    }

    #[inline]
    #[must_use]
    pub fn actions(&self, state: StateId, symbol: Symbol) -> &[ParseAction] {
        self.table_entry(state, symbol).actions
    }

    #[inline]
    #[must_use]
    pub fn has_reduce_action(&self, state: StateId, symbol: Symbol) -> bool {
        matches!(
            self.actions(state, symbol).first(),
            Some(ParseAction::Reduce { .. })
        )
    }

    #[inline]
    #[must_use]
    pub fn has_actions(&self, state: StateId, symbol: Symbol) -> bool {
        self.lookup(state, symbol) != 0
    }

    /// The state reached after consuming `symbol` in `state`. For terminals
    /// this follows the final shift action; extras leave the state as is.
    #[must_use]
    pub fn next_state(&self, state: StateId, symbol: Symbol) -> StateId {
        if symbol == BUILTIN_SYM_ERROR || symbol == BUILTIN_SYM_ERROR_REPEAT {
            return 0;
        }
        if u32::from(symbol) < self.token_count {
            match self.actions(state, symbol).last() {
                Some(&ParseAction::Shift { state: next, extra, .. }) => {
                    if extra {
                        state
                    } else {
                        next
                    }
                }
                _ => 0,
            }
        } else {
            self.lookup(state, symbol)
        }
    }

    #[must_use]
    pub fn lex_mode(&self, state: StateId) -> LexMode {
        self.lex_modes
            .get(usize::from(state))
            .copied()
            .unwrap_or_default()
    }

    /// Which external tokens are valid in the given external lex state.
    #[must_use]
    pub fn enabled_external_tokens(&self, external_lex_state: u16) -> Option<&[bool]> {
        if external_lex_state == 0 {
            return None;
        }
        self.external_scanner
            .as_ref()
            .and_then(|scanner| scanner.states.get(usize::from(external_lex_state)))
            .map(Vec::as_slice)
    }

    pub(crate) fn external_symbol(&self, index: Symbol) -> Symbol {
        self.external_scanner
            .as_ref()
            .and_then(|scanner| scanner.symbol_map.get(usize::from(index)))
            .copied()
            .unwrap_or(BUILTIN_SYM_ERROR)
    }

    #[must_use]
    pub fn alias_sequence(&self, production_id: u16) -> Option<&[Symbol]> {
        if production_id == 0 {
            return None;
        }
        self.alias_sequences
            .get(usize::from(production_id))
            .filter(|sequence| !sequence.is_empty())
            .map(Vec::as_slice)
    }

    #[must_use]
    pub fn alias_at(&self, production_id: u16, child_index: u32) -> Symbol {
        self.alias_sequence(production_id)
            .and_then(|sequence| sequence.get(child_index as usize))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn field_map(&self, production_id: u16) -> &[FieldMapEntry] {
        let Some(&(index, length)) = self.field_map_slices.get(usize::from(production_id)) else {
            return &[];
        };
        let start = usize::from(index);
        self.field_map_entries
            .get(start..start + usize::from(length))
            .unwrap_or(&[])
    }

    /// Iterate over the symbols that are valid in `state`.
    #[must_use]
    pub fn lookaheads(&self, state: StateId) -> LookaheadIterator<'_> {
        LookaheadIterator {
            language: self,
            state,
            symbol: 0,
        }
    }

    pub(crate) fn check_version(&self) -> Result<(), LanguageError> {
        if (MIN_COMPATIBLE_LANGUAGE_VERSION..=LANGUAGE_VERSION).contains(&self.abi_version) {
            Ok(())
        } else {
            Err(LanguageError::Version {
                version: self.abi_version,
            })
        }
    }

    /// Write a symbol's name with the characters that are special in the
    /// dot format escaped.
    pub(crate) fn write_symbol_as_dot_string(
        &self,
        f: &mut impl std::io::Write,
        symbol: Symbol,
    ) -> std::io::Result<()> {
        for c in self.symbol_name(symbol).chars() {
            match c {
                '"' | '\\' => write!(f, "\\{c}")?,
                '\n' => write!(f, "\\n")?,
                '\t' => write!(f, "\\t")?,
                _ => write!(f, "{c}")?,
            }
        }
        Ok(())
    }
}

/// One valid lookahead of a state.
#[derive(Clone, Copy, Debug)]
pub struct Lookahead<'a> {
    pub symbol: Symbol,
    /// The actions, if the symbol is a terminal.
    pub actions: &'a [ParseAction],
    /// The goto state, if the symbol is a non-terminal.
    pub next_state: StateId,
}

pub struct LookaheadIterator<'a> {
    language: &'a Language,
    state: StateId,
    symbol: u32,
}

impl<'a> Iterator for LookaheadIterator<'a> {
    type Item = Lookahead<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let language = self.language;
        while self.symbol < language.symbol_count() {
            let symbol = self.symbol as Symbol;
            self.symbol += 1;
            let table_value = language.lookup(self.state, symbol);
            if table_value == 0 {
                continue;
            }
            return Some(if u32::from(symbol) < language.token_count {
                Lookahead {
                    symbol,
                    actions: &language.action_lists[usize::from(table_value)].actions,
                    next_state: 0,
                }
            } else {
                Lookahead {
                    symbol,
                    actions: &[],
                    next_state: table_value,
                }
            });
        }
        None
    }
}

/// Assembles a [`Language`] from its parts, the way a generated grammar
/// would describe it.
///
/// Symbols must be declared in table order: `end` first, then the rest of
/// the terminals, then the non-terminals.
pub struct LanguageBuilder {
    name: &'static str,
    abi_version: u32,
    symbols: Vec<(&'static str, SymbolMetadata)>,
    token_count: u32,
    external_token_count: u32,
    state_count: u32,
    actions: HashMap<(StateId, Symbol), ActionList>,
    gotos: HashMap<(StateId, Symbol), StateId>,
    extras: Vec<Symbol>,
    lex_modes: HashMap<StateId, LexMode>,
    field_names: Vec<&'static str>,
    productions: HashMap<u16, (Vec<FieldMapEntry>, Vec<Symbol>)>,
    lex_fn: LexFn,
    keyword_lex_fn: Option<LexFn>,
    keyword_capture_token: Symbol,
    external_scanner: Option<ExternalScannerDef>,
}

impl LanguageBuilder {
    #[must_use]
    pub fn new(name: &'static str, lex_fn: LexFn) -> Self {
        Self {
            name,
            abi_version: LANGUAGE_VERSION,
            symbols: vec![("end", SymbolMetadata::HIDDEN)],
            token_count: 0,
            external_token_count: 0,
            state_count: 0,
            actions: HashMap::new(),
            gotos: HashMap::new(),
            extras: Vec::new(),
            lex_modes: HashMap::new(),
            field_names: vec![""],
            productions: HashMap::new(),
            lex_fn,
            keyword_lex_fn: None,
            keyword_capture_token: 0,
            external_scanner: None,
        }
    }

    #[must_use]
    pub fn abi_version(mut self, version: u32) -> Self {
        self.abi_version = version;
        self
    }

    /// Declare the next terminal symbol.
    #[must_use]
    pub fn token(mut self, name: &'static str, metadata: SymbolMetadata) -> Self {
        self.symbols.push((name, metadata));
        self
    }

    /// Declare the next non-terminal symbol.
    #[must_use]
    pub fn non_terminal(mut self, name: &'static str, metadata: SymbolMetadata) -> Self {
        if self.token_count == 0 {
            self.token_count = self.symbols.len() as u32;
        }
        self.symbols.push((name, metadata));
        self
    }

    #[must_use]
    pub fn external_token_count(mut self, count: u32) -> Self {
        self.external_token_count = count;
        self
    }

    #[must_use]
    pub fn state_count(mut self, count: u32) -> Self {
        self.state_count = count;
        self
    }

    #[must_use]
    pub fn actions(mut self, state: StateId, symbol: Symbol, actions: &[ParseAction]) -> Self {
        let list = self.actions.entry((state, symbol)).or_insert(ActionList {
            actions: Vec::new(),
            reusable: true,
        });
        list.actions.extend_from_slice(actions);
        self
    }

    /// Mark a `(state, terminal)` entry as one whose tokens must not be
    /// reused across lex modes.
    #[must_use]
    pub fn non_reusable(mut self, state: StateId, symbol: Symbol) -> Self {
        if let Some(list) = self.actions.get_mut(&(state, symbol)) {
            list.reusable = false;
        }
        self
    }

    #[must_use]
    pub fn goto(mut self, state: StateId, symbol: Symbol, next_state: StateId) -> Self {
        self.gotos.insert((state, symbol), next_state);
        self
    }

    /// Register a token that may appear anywhere, such as a comment.
    #[must_use]
    pub fn extra(mut self, symbol: Symbol) -> Self {
        self.extras.push(symbol);
        self
    }

    #[must_use]
    pub fn lex_mode(mut self, state: StateId, mode: LexMode) -> Self {
        self.lex_modes.insert(state, mode);
        self
    }

    #[must_use]
    pub fn field(mut self, name: &'static str) -> Self {
        self.field_names.push(name);
        self
    }

    /// Attach field names and aliases to the children of a production.
    #[must_use]
    pub fn production(
        mut self,
        production_id: u16,
        fields: &[FieldMapEntry],
        aliases: &[Symbol],
    ) -> Self {
        self.productions
            .insert(production_id, (fields.to_vec(), aliases.to_vec()));
        self
    }

    #[must_use]
    pub fn keyword_lex_fn(mut self, lex_fn: LexFn, capture_token: Symbol) -> Self {
        self.keyword_lex_fn = Some(lex_fn);
        self.keyword_capture_token = capture_token;
        self
    }

    #[must_use]
    pub fn external_scanner(mut self, scanner: ExternalScannerDef) -> Self {
        self.external_scanner = Some(scanner);
        self
    }

    pub fn build(self) -> Result<Language, LanguageError> {
        let invalid = |message: String| Err(LanguageError::InvalidTable(message));

        let symbol_count = self.symbols.len();
        let token_count = if self.token_count == 0 {
            symbol_count as u32
        } else {
            self.token_count
        };
        if self.state_count == 0 {
            return invalid("a language needs at least one state".into());
        }
        if symbol_count >= usize::from(BUILTIN_SYM_ERROR_REPEAT) {
            return invalid(format!("too many symbols: {symbol_count}"));
        }

        let mut action_lists = vec![ActionList {
            actions: Vec::new(),
            reusable: true,
        }];
        let mut list_indices = HashMap::<(Vec<ParseAction>, bool), u16>::new();
        let mut parse_table = vec![0_u16; self.state_count as usize * symbol_count];

        let mut entries = self.actions;
        for state in 0..self.state_count as StateId {
            for &extra in &self.extras {
                entries.entry((state, extra)).or_insert_with(|| ActionList {
                    actions: vec![ParseAction::shift_extra()],
                    reusable: true,
                });
            }
        }
        for symbol in 0..token_count as Symbol {
            entries
                .entry((ERROR_STATE, symbol))
                .or_insert_with(|| ActionList {
                    actions: vec![ParseAction::Recover],
                    reusable: true,
                });
        }

        let mut sorted_entries = entries.into_iter().collect::<Vec<_>>();
        sorted_entries.sort_by_key(|(key, _)| *key);
        for ((state, symbol), list) in sorted_entries {
            if u32::from(state) >= self.state_count {
                return invalid(format!("state {state} is out of range"));
            }
            if u32::from(symbol) >= token_count {
                return invalid(format!("symbol {symbol} is not a terminal"));
            }
            for action in &list.actions {
                match *action {
                    ParseAction::Shift { state: next, .. } if u32::from(next) >= self.state_count => {
                        return invalid(format!("shift to unknown state {next}"));
                    }
                    ParseAction::Reduce { symbol: lhs, .. }
                        if u32::from(lhs) < token_count || usize::from(lhs) >= symbol_count =>
                    {
                        return invalid(format!("reduce to non-existent non-terminal {lhs}"));
                    }
                    _ => {}
                }
            }
            let key = (list.actions.clone(), list.reusable);
            let index = match list_indices.get(&key) {
                Some(&index) => index,
                None => {
                    let index = action_lists.len() as u16;
                    action_lists.push(list);
                    list_indices.insert(key, index);
                    index
                }
            };
            parse_table[usize::from(state) * symbol_count + usize::from(symbol)] = index;
        }

        for (&(state, symbol), &next_state) in &self.gotos {
            if u32::from(symbol) < token_count || usize::from(symbol) >= symbol_count {
                return invalid(format!("goto on non-existent non-terminal {symbol}"));
            }
            if u32::from(state) >= self.state_count || u32::from(next_state) >= self.state_count {
                return invalid(format!("goto from {state} to {next_state} is out of range"));
            }
            parse_table[usize::from(state) * symbol_count + usize::from(symbol)] = next_state;
        }

        let lex_modes = (0..self.state_count as StateId)
            .map(|state| self.lex_modes.get(&state).copied().unwrap_or_default())
            .collect();

        let production_count = self
            .productions
            .keys()
            .copied()
            .max()
            .map_or(0, |max| usize::from(max) + 1);
        let mut field_map_slices = vec![(0, 0); production_count];
        let mut field_map_entries = Vec::new();
        let mut alias_sequences = vec![Vec::new(); production_count];
        let mut productions = self.productions.into_iter().collect::<Vec<_>>();
        productions.sort_by_key(|(id, _)| *id);
        for (production_id, (fields, aliases)) in productions {
            for field in &fields {
                if usize::from(field.field_id) >= self.field_names.len() || field.field_id == 0 {
                    return invalid(format!("unknown field id {}", field.field_id));
                }
            }
            field_map_slices[usize::from(production_id)] =
                (field_map_entries.len() as u16, fields.len() as u16);
            field_map_entries.extend(fields);
            alias_sequences[usize::from(production_id)] = aliases;
        }

        let (symbol_names, symbol_metadata) = self.symbols.into_iter().unzip();
        let language = Language {
            name: self.name,
            abi_version: self.abi_version,
            symbol_names,
            symbol_metadata,
            token_count,
            external_token_count: self.external_token_count,
            state_count: self.state_count,
            parse_table,
            action_lists,
            lex_modes,
            field_names: self.field_names,
            field_map_slices,
            field_map_entries,
            alias_sequences,
            lex_fn: self.lex_fn,
            keyword_lex_fn: self.keyword_lex_fn,
            keyword_capture_token: self.keyword_capture_token,
            external_scanner: self.external_scanner,
        };
        language.check_version()?;
        Ok(language)
    }
}
