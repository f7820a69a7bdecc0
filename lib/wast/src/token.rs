//! The token set: literal punctuation, literal-class tokens recognized by
//! regular expressions, structural keywords, and one token per operator
//! mnemonic (generated from the ir operator table).

use wavelet_ir::for_each_operator;

macro_rules! define_token_types {
    ( $( ($op_name:ident, $op_mnemonic:literal, { $($field:ident : $ty:ty),* }) )* ) => {
        /// The type of a lexed token.
        ///
        /// The discriminant doubles as the token's terminal-state encoding in
        /// the lexer DFA, so the enum must stay dense.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum TokenType {
            /// The end of the input.
            Eof,
            /// A block comment with no closing `;)`.
            UnterminatedComment,
            /// A span the lexer could not match; it recovers at the next
            /// whitespace or bracket.
            Unrecognized,
            /// `(`
            LeftParenthesis,
            /// `)`
            RightParenthesis,
            /// `=`
            Equals,
            /// A decimal integer literal.
            DecimalInt,
            /// A decimal float literal.
            DecimalFloat,
            /// A hexadecimal integer literal.
            HexInt,
            /// A hexadecimal float literal.
            HexFloat,
            /// A NaN literal, optionally with an explicit payload.
            FloatNan,
            /// An infinity literal.
            FloatInf,
            /// A quoted string literal.
            String,
            /// A `$`-prefixed name.
            Name,
            /// A `$`-prefixed quoted name.
            QuotedName,

            /// The `module` keyword.
            Module,
            /// The `type` keyword.
            Type,
            /// The `func` keyword.
            Func,
            /// The `param` keyword.
            Param,
            /// The `result` keyword.
            Result,
            /// The `local` keyword.
            Local,
            /// The `global` keyword.
            Global,
            /// The `table` keyword.
            Table,
            /// The `memory` keyword.
            Memory,
            /// The `elem` keyword.
            Elem,
            /// The `data` keyword.
            Data,
            /// The `passive` keyword.
            Passive,
            /// The `import` keyword.
            Import,
            /// The `export` keyword.
            Export,
            /// The `start` keyword.
            Start,
            /// The `offset` keyword.
            Offset,
            /// The `align` keyword.
            Align,
            /// The `mut` keyword.
            Mut,
            /// The `shared` keyword.
            Shared,
            /// The `exception_type` keyword.
            ExceptionType,
            /// The `ref.null` keyword.
            RefNull,
            /// The `anyfunc` keyword (the MVP spelling of `funcref`).
            AnyFunc,
            /// The `funcref` keyword.
            FuncRefKeyword,
            /// The `i32` value type keyword.
            I32,
            /// The `i64` value type keyword.
            I64,
            /// The `f32` value type keyword.
            F32,
            /// The `f64` value type keyword.
            F64,
            /// The `v128` value type keyword.
            V128,

            $(
                #[doc = concat!("The `", $op_mnemonic, "` operator mnemonic.")]
                $op_name,
            )*
        }

        impl TokenType {
            pub(crate) const ALL: &'static [TokenType] = &[
                TokenType::Eof,
                TokenType::UnterminatedComment,
                TokenType::Unrecognized,
                TokenType::LeftParenthesis,
                TokenType::RightParenthesis,
                TokenType::Equals,
                TokenType::DecimalInt,
                TokenType::DecimalFloat,
                TokenType::HexInt,
                TokenType::HexFloat,
                TokenType::FloatNan,
                TokenType::FloatInf,
                TokenType::String,
                TokenType::Name,
                TokenType::QuotedName,
                TokenType::Module,
                TokenType::Type,
                TokenType::Func,
                TokenType::Param,
                TokenType::Result,
                TokenType::Local,
                TokenType::Global,
                TokenType::Table,
                TokenType::Memory,
                TokenType::Elem,
                TokenType::Data,
                TokenType::Passive,
                TokenType::Import,
                TokenType::Export,
                TokenType::Start,
                TokenType::Offset,
                TokenType::Align,
                TokenType::Mut,
                TokenType::Shared,
                TokenType::ExceptionType,
                TokenType::RefNull,
                TokenType::AnyFunc,
                TokenType::FuncRefKeyword,
                TokenType::I32,
                TokenType::I64,
                TokenType::F32,
                TokenType::F64,
                TokenType::V128,
                $( TokenType::$op_name, )*
            ];

            /// A human-readable description for parse errors.
            pub fn describe(self) -> &'static str {
                match self {
                    TokenType::Eof => "eof",
                    TokenType::UnterminatedComment => "unterminated comment",
                    TokenType::Unrecognized => "unrecognized token",
                    TokenType::LeftParenthesis => "'('",
                    TokenType::RightParenthesis => "')'",
                    TokenType::Equals => "'='",
                    TokenType::DecimalInt => "int literal",
                    TokenType::DecimalFloat => "float literal",
                    TokenType::HexInt => "hexadecimal int literal",
                    TokenType::HexFloat => "hexadecimal float literal",
                    TokenType::FloatNan => "NaN literal",
                    TokenType::FloatInf => "infinity literal",
                    TokenType::String => "string literal",
                    TokenType::Name => "name",
                    TokenType::QuotedName => "quoted name",
                    other => other.literal().unwrap_or("keyword"),
                }
            }

            /// The literal spelling of keyword and operator tokens.
            pub fn literal(self) -> Option<&'static str> {
                Some(match self {
                    TokenType::Module => "module",
                    TokenType::Type => "type",
                    TokenType::Func => "func",
                    TokenType::Param => "param",
                    TokenType::Result => "result",
                    TokenType::Local => "local",
                    TokenType::Global => "global",
                    TokenType::Table => "table",
                    TokenType::Memory => "memory",
                    TokenType::Elem => "elem",
                    TokenType::Data => "data",
                    TokenType::Passive => "passive",
                    TokenType::Import => "import",
                    TokenType::Export => "export",
                    TokenType::Start => "start",
                    TokenType::Offset => "offset",
                    TokenType::Align => "align",
                    TokenType::Mut => "mut",
                    TokenType::Shared => "shared",
                    TokenType::ExceptionType => "exception_type",
                    TokenType::RefNull => "ref.null",
                    TokenType::AnyFunc => "anyfunc",
                    TokenType::FuncRefKeyword => "funcref",
                    TokenType::I32 => "i32",
                    TokenType::I64 => "i64",
                    TokenType::F32 => "f32",
                    TokenType::F64 => "f64",
                    TokenType::V128 => "v128",
                    $( TokenType::$op_name => $op_mnemonic, )*
                    _ => return None,
                })
            }
        }
    };
}

for_each_operator!(define_token_types);

impl TokenType {
    /// Recovers a token type from its dense index.
    pub(crate) fn from_index(index: u16) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// The token type's dense index; the inverse of `from_index`.
    pub(crate) fn index(self) -> u16 {
        self as u16
    }
}

/// A single lexed token: its type and the byte offset where it begins. The
/// token's text runs to the next token's `begin` (less trailing
/// whitespace), which is all the parser needs to re-read literals.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Token {
    /// The token's type.
    pub ty: TokenType,
    /// The byte offset of the token's first character.
    pub begin: u32,
}
