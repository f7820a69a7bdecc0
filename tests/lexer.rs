//! Lexer integration tests: the token stream over realistic module text.

use wavelet::wast::{lex, TokenType};

#[test]
fn comment_then_module_token_offsets() {
    let (tokens, _) = lex(";; comment\n(module)\n");
    let types: Vec<TokenType> = tokens.iter().map(|token| token.ty).collect();
    assert_eq!(
        types,
        vec![
            TokenType::LeftParenthesis,
            TokenType::Module,
            TokenType::RightParenthesis,
            TokenType::Eof,
        ]
    );
    // The comment and its newline cover bytes 0..=10: the '(' token begins
    // at byte 11 and the `module` keyword right after it.
    assert_eq!(tokens[0].begin, 11);
    assert_eq!(tokens[1].begin, 12);
}

#[test]
fn a_small_module_lexes_to_the_expected_stream() {
    let source = "(module\n  (memory 1)\n  (func (export \"f\") (result i32)\n    i32.const 42))";
    let (tokens, line_info) = lex(source);
    let types: Vec<TokenType> = tokens.iter().map(|token| token.ty).collect();
    assert_eq!(
        types,
        vec![
            TokenType::LeftParenthesis,
            TokenType::Module,
            TokenType::LeftParenthesis,
            TokenType::Memory,
            TokenType::DecimalInt,
            TokenType::RightParenthesis,
            TokenType::LeftParenthesis,
            TokenType::Func,
            TokenType::LeftParenthesis,
            TokenType::Export,
            TokenType::String,
            TokenType::RightParenthesis,
            TokenType::LeftParenthesis,
            TokenType::Result,
            TokenType::I32,
            TokenType::RightParenthesis,
            TokenType::I32Const,
            TokenType::DecimalInt,
            TokenType::RightParenthesis,
            TokenType::RightParenthesis,
            TokenType::Eof,
        ]
    );

    // The i32.const mnemonic is on line 4.
    let i32_const = tokens
        .iter()
        .find(|token| token.ty == TokenType::I32Const)
        .unwrap();
    let locus = line_info.locus(source, i32_const.begin);
    assert_eq!(locus.line_number(), 4);
}

#[test]
fn numeric_literal_classes() {
    let (tokens, _) = lex("1 -2 0x3F 1.25 2e10 0x1p4 nan nan:0x7f inf -inf");
    let types: Vec<TokenType> = tokens.iter().map(|token| token.ty).collect();
    assert_eq!(
        types,
        vec![
            TokenType::DecimalInt,
            TokenType::DecimalInt,
            TokenType::HexInt,
            TokenType::DecimalFloat,
            TokenType::DecimalFloat,
            TokenType::HexFloat,
            TokenType::FloatNan,
            TokenType::FloatNan,
            TokenType::FloatInf,
            TokenType::FloatInf,
            TokenType::Eof,
        ]
    );
}

#[test]
fn names_and_quoted_names() {
    let (tokens, _) = lex("$foo $foo-bar $\"quoted name\"");
    let types: Vec<TokenType> = tokens.iter().map(|token| token.ty).collect();
    assert_eq!(
        types,
        vec![
            TokenType::Name,
            TokenType::Name,
            TokenType::QuotedName,
            TokenType::Eof,
        ]
    );
}

#[test]
fn unrecognized_spans_recover_at_brackets() {
    let (tokens, _) = lex("@@@(module)");
    let types: Vec<TokenType> = tokens.iter().map(|token| token.ty).collect();
    assert_eq!(
        types,
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
fn operator_mnemonics_lex_as_their_tokens() {
    let (tokens, _) = lex("call_indirect br_table i64.trunc_sat_f64_u memory.grow local.get");
    let types: Vec<TokenType> = tokens.iter().map(|token| token.ty).collect();
    assert_eq!(
        types,
        vec![
            TokenType::CallIndirect,
            TokenType::BrTable,
            TokenType::I64TruncSatF64U,
            TokenType::MemoryGrow,
            TokenType::LocalGet,
            TokenType::Eof,
        ]
    );
}
