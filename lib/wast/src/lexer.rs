//! The table-driven lexer.
//!
//! All token recognition lives in one statically-built DFA: the literal
//! classes (numbers, strings, names) are lowered from regular expressions,
//! and every keyword and operator mnemonic is threaded into the same
//! machine as a literal string. Whitespace and comments are skipped by hand
//! before each `feed`, which also keeps the line-start table for later
//! locus resolution.

use crate::token::{Token, TokenType};
use crate::TextFileLocus;
use once_cell::sync::Lazy;
use wavelet_ir::for_each_operator;
use wavelet_nfa::{
    regexp, Builder, CharSet, Machine, StateIndex, EDGE_DOESNT_CONSUME_INPUT_FLAG,
    MAXIMUM_TERMINAL_STATE_INDEX, UNMATCHED_CHARACTER_TERMINAL,
};

/// Byte offsets of the start of every line, for locus resolution.
#[derive(Debug, Clone)]
pub struct LineInfo {
    line_starts: Vec<u32>,
}

impl LineInfo {
    /// Resolves a byte offset to a line/column locus by binary search over
    /// the line starts, then a scan over the line to count tabs.
    pub fn locus(&self, input: &str, char_offset: u32) -> TextFileLocus {
        let mut min_line_index = 0usize;
        let mut max_line_index = self.line_starts.len() - 1;
        while max_line_index > min_line_index {
            let median_line_index = (min_line_index + max_line_index + 1) / 2;
            if char_offset < self.line_starts[median_line_index] {
                max_line_index = median_line_index - 1;
            } else {
                min_line_index = median_line_index;
            }
        }

        let mut locus = TextFileLocus {
            newlines: min_line_index as u32,
            ..TextFileLocus::default()
        };
        let bytes = input.as_bytes();
        for index in self.line_starts[min_line_index]..char_offset {
            if bytes.get(index as usize) == Some(&b'\t') {
                locus.tabs += 1;
            } else {
                locus.characters += 1;
            }
        }
        locus
    }
}

fn terminal_for(token: TokenType) -> StateIndex {
    MAXIMUM_TERMINAL_STATE_INDEX - token.index() as StateIndex
}

fn token_for(terminal: StateIndex) -> Option<TokenType> {
    TokenType::from_index((MAXIMUM_TERMINAL_STATE_INDEX - terminal) as u16)
}

/// Adds a state whose only edges peek at a token-separator character and
/// accept without consuming it. Routing matches through one of these keeps
/// the machine from accepting a token that is a prefix of a longer word.
fn token_separator_peek_state(builder: &mut Builder, final_state: StateIndex) -> StateIndex {
    let mut separators = CharSet::new();
    separators.add(b' ');
    separators.add(b'\t');
    separators.add(b'\r');
    separators.add(b'\n');
    separators.add(b'=');
    separators.add(b'(');
    separators.add(b')');
    separators.add(b';');
    separators.add(0);
    let separator_state = builder.add_state();
    builder.add_edge(
        separator_state,
        separators,
        final_state | EDGE_DOESNT_CONSUME_INPUT_FLAG,
    );
    separator_state
}

/// Threads a literal string into the machine, sharing prefix states with
/// previously added literals.
fn add_literal(builder: &mut Builder, literal: &str, final_state: StateIndex) {
    let bytes = literal.as_bytes();
    let mut state: StateIndex = 0;
    for (index, &c) in bytes.iter().enumerate() {
        let last = index + 1 == bytes.len();
        let next = match builder.non_terminal_edge(state, c) {
            Some(next) if !last => next,
            _ => {
                let next = if last { final_state } else { builder.add_state() };
                builder.add_edge(state, CharSet::from_char(c), next);
                next
            }
        };
        state = next;
    }
}

fn add_literal_token(
    builder: &mut Builder,
    literal: &str,
    token: TokenType,
    is_token_separator: bool,
) {
    let mut final_state = terminal_for(token);
    if !is_token_separator {
        final_state = token_separator_peek_state(builder, final_state);
    }
    add_literal(builder, literal, final_state);
}

macro_rules! add_operator_tokens {
    ( $( ($name:ident, $mnemonic:literal, { $($field:ident : $ty:ty),* }) )* ) => {
        fn add_operator_tokens(builder: &mut Builder) {
            $( add_literal_token(builder, $mnemonic, TokenType::$name, false); )*
        }
    };
}

for_each_operator!(add_operator_tokens);

static MACHINE: Lazy<Machine> = Lazy::new(|| {
    let regexp_token_pairs: &[(TokenType, &str)] = &[
        (TokenType::DecimalInt, "[+\\-]?\\d+(_\\d+)*"),
        (
            TokenType::DecimalFloat,
            "[+\\-]?\\d+(_\\d+)*\\.(\\d+(_\\d+)*)*([eE][+\\-]?\\d+(_\\d+)*)?",
        ),
        (
            TokenType::DecimalFloat,
            "[+\\-]?\\d+(_\\d+)*[eE][+\\-]?\\d+(_\\d+)*",
        ),
        (TokenType::HexInt, "[+\\-]?0[xX][\\da-fA-F]+(_[\\da-fA-F]+)*"),
        (
            TokenType::HexFloat,
            "[+\\-]?0[xX][\\da-fA-F]+(_[\\da-fA-F]+)*\\.([\\da-fA-F]+(_[\\da-fA-F]+)*)*([pP][+\\-]?\\d+(_\\d+)*)?",
        ),
        (
            TokenType::HexFloat,
            "[+\\-]?0[xX][\\da-fA-F]+(_[\\da-fA-F]+)*[pP][+\\-]?\\d+(_\\d+)*",
        ),
        (
            TokenType::FloatNan,
            "[+\\-]?nan(:0[xX][\\da-fA-F]+(_[\\da-fA-F]+)*)?",
        ),
        (TokenType::FloatInf, "[+\\-]?inf"),
        (
            TokenType::String,
            "\"([^\"\\n\\\\]|\\\\([^0-9a-fA-Fu]|[0-9a-fA-F][0-9a-fA-F]|u{[0-9a-fA-F]+}))*\"",
        ),
        (
            TokenType::Name,
            "\\$[a-zA-Z0-9'_+*/~=<>!?@#$%&|:`.\\-\\^\\\\]+",
        ),
        (
            TokenType::QuotedName,
            "\\$\"([^\"\\n\\\\]|\\\\([^0-9a-fA-Fu]|[0-9a-fA-F][0-9a-fA-F]|u{[0-9a-fA-F]+}))*\"",
        ),
    ];

    let keyword_tokens: &[(TokenType, &str)] = &[
        (TokenType::Module, "module"),
        (TokenType::Type, "type"),
        (TokenType::Func, "func"),
        (TokenType::Param, "param"),
        (TokenType::Result, "result"),
        (TokenType::Local, "local"),
        (TokenType::Global, "global"),
        (TokenType::Table, "table"),
        (TokenType::Memory, "memory"),
        (TokenType::Elem, "elem"),
        (TokenType::Data, "data"),
        (TokenType::Passive, "passive"),
        (TokenType::Import, "import"),
        (TokenType::Export, "export"),
        (TokenType::Start, "start"),
        (TokenType::Offset, "offset"),
        (TokenType::Align, "align"),
        (TokenType::Mut, "mut"),
        (TokenType::Shared, "shared"),
        (TokenType::ExceptionType, "exception_type"),
        (TokenType::RefNull, "ref.null"),
        (TokenType::AnyFunc, "anyfunc"),
        (TokenType::FuncRefKeyword, "funcref"),
        (TokenType::I32, "i32"),
        (TokenType::I64, "i64"),
        (TokenType::F32, "f32"),
        (TokenType::F64, "f64"),
        (TokenType::V128, "v128"),
    ];

    let mut builder = Builder::new();

    for &(token, pattern) in regexp_token_pairs {
        let final_state = token_separator_peek_state(&mut builder, terminal_for(token));
        regexp::add_to_nfa(pattern, &mut builder, 0, final_state);
    }

    add_literal_token(&mut builder, "(", TokenType::LeftParenthesis, true);
    add_literal_token(&mut builder, ")", TokenType::RightParenthesis, true);
    add_literal_token(&mut builder, "=", TokenType::Equals, true);
    for &(token, literal) in keyword_tokens {
        add_literal_token(&mut builder, literal, token, false);
    }
    add_operator_tokens(&mut builder);

    Machine::new(builder)
});

fn is_recovery_point_char(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n' | b'\x0c' | b'(' | b')')
}

/// Lexes `input` into a token stream.
///
/// Comments and whitespace are skipped; a span no token matches produces an
/// [`TokenType::Unrecognized`] token and recovery resumes at the next
/// whitespace or bracket. The stream always ends with an
/// [`TokenType::Eof`] token.
pub fn lex(input: &str) -> (Vec<Token>, LineInfo) {
    // The DFA's feed loop reads ahead of the cursor; the trailing NUL is the
    // fence it stops at.
    let mut bytes = Vec::with_capacity(input.len() + 1);
    bytes.extend_from_slice(input.as_bytes());
    bytes.push(0);
    let len = bytes.len();

    let mut tokens: Vec<Token> = Vec::new();
    let mut line_starts: Vec<u32> = vec![0];
    let mut next = 0usize;

    'tokens: loop {
        // Skip whitespace and comments.
        loop {
            match bytes[next] {
                b';' => {
                    if bytes[next + 1] != b';' {
                        break;
                    }
                    next += 2;
                    while bytes[next] != 0 {
                        if bytes[next] == b'\n' {
                            line_starts.push(next as u32 + 1);
                            next += 1;
                            break;
                        }
                        next += 1;
                    }
                }
                b'(' => {
                    if bytes[next + 1] != b';' {
                        break;
                    }
                    let first_comment_char = next;
                    next += 2;
                    let mut comment_depth = 1u32;
                    while comment_depth != 0 {
                        if bytes[next] == b';' && bytes[next + 1] == b')' {
                            comment_depth -= 1;
                            next += 2;
                        } else if bytes[next] == b'(' && bytes[next + 1] == b';' {
                            comment_depth += 1;
                            next += 2;
                        } else if next == len - 1 {
                            tokens.push(Token {
                                ty: TokenType::UnterminatedComment,
                                begin: first_comment_char as u32,
                            });
                            break;
                        } else {
                            if bytes[next] == b'\n' {
                                line_starts.push(next as u32 + 1);
                            }
                            next += 1;
                        }
                    }
                }
                b'\n' => {
                    line_starts.push(next as u32 + 1);
                    next += 1;
                }
                b' ' | b'\t' | b'\r' | b'\x0c' => next += 1,
                _ => break,
            }
        }

        let begin = next as u32;
        let terminal_state = MACHINE.feed(&bytes, &mut next);
        if terminal_state != UNMATCHED_CHARACTER_TERMINAL {
            let ty = token_for(terminal_state)
                .expect("the lexer machine only encodes known token types");
            tokens.push(Token { ty, begin });
        } else if (begin as usize) < len - 1 {
            tokens.push(Token {
                ty: TokenType::Unrecognized,
                begin,
            });
            while next < len - 1 && !is_recovery_point_char(bytes[next]) {
                next += 1;
            }
        } else {
            // The unmatched character was the trailing NUL.
            break 'tokens;
        }
    }

    tokens.push(Token {
        ty: TokenType::Eof,
        begin: (len - 1) as u32,
    });
    line_starts.push(len as u32);

    (tokens, LineInfo { line_starts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types_of(tokens: &[Token]) -> Vec<TokenType> {
        tokens.iter().map(|token| token.ty).collect()
    }

    #[test]
    fn comment_then_module() {
        let (tokens, _) = lex(";; comment\n(module)\n");
        assert_eq!(
            types_of(&tokens),
            vec![
                TokenType::LeftParenthesis,
                TokenType::Module,
                TokenType::RightParenthesis,
                TokenType::Eof,
            ]
        );
        // The comment and newline span bytes 0..=10; the '(' is at 11 and
        // the keyword right after it.
        assert_eq!(tokens[0].begin, 11);
        assert_eq!(tokens[1].begin, 12);
    }

    #[test]
    fn numbers_and_names() {
        let (tokens, _) = lex("42 -0x1F 1.5 $foo nan inf");
        assert_eq!(
            types_of(&tokens),
            vec![
                TokenType::DecimalInt,
                TokenType::HexInt,
                TokenType::DecimalFloat,
                TokenType::Name,
                TokenType::FloatNan,
                TokenType::FloatInf,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn keywords_and_operators_share_prefixes() {
        let (tokens, _) = lex("(func (result i32) i32.const 42)");
        assert_eq!(
            types_of(&tokens),
            vec![
                TokenType::LeftParenthesis,
                TokenType::Func,
                TokenType::LeftParenthesis,
                TokenType::Result,
                TokenType::I32,
                TokenType::RightParenthesis,
                TokenType::I32Const,
                TokenType::DecimalInt,
                TokenType::RightParenthesis,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn strings() {
        let (tokens, _) = lex("\"hello\" \"a\\n0\" \"\\u{1F600}\"");
        assert_eq!(
            types_of(&tokens),
            vec![
                TokenType::String,
                TokenType::String,
                TokenType::String,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn nested_block_comments() {
        let (tokens, _) = lex("(; outer (; inner ;) still outer ;)(module)");
        assert_eq!(
            types_of(&tokens),
            vec![
                TokenType::LeftParenthesis,
                TokenType::Module,
                TokenType::RightParenthesis,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_block_comment() {
        let (tokens, _) = lex("(; never closed");
        assert_eq!(
            types_of(&tokens),
            vec![TokenType::UnterminatedComment, TokenType::Eof]
        );
    }

    #[test]
    fn unrecognized_input_recovers_at_separator() {
        let (tokens, _) = lex("#bogus (module)");
        assert_eq!(
            types_of(&tokens),
            vec![
                TokenType::Unrecognized,
                TokenType::LeftParenthesis,
                TokenType::Module,
                TokenType::RightParenthesis,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn locus_counts_lines_and_tabs() {
        let input = "(module)\n\t(func)\n";
        let (tokens, line_info) = lex(input);
        // The `func` keyword: line 2, after one tab and one '('.
        let func_token = tokens
            .iter()
            .find(|token| token.ty == TokenType::Func)
            .unwrap();
        let locus = line_info.locus(input, func_token.begin);
        assert_eq!(locus.line_number(), 2);
        assert_eq!(locus.newlines, 1);
        assert_eq!(locus.tabs, 1);
        assert_eq!(locus.characters, 1);
    }
}
