//! The WebAssembly text format, as far as the runtime core owns it: the
//! token set and the table-driven lexer. The recursive-descent parser that
//! turns the token stream into a [`wavelet_ir::Module`] is an external
//! collaborator; [`ParseError`] is the error currency it reports with.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod lexer;
mod token;

pub use crate::lexer::{lex, LineInfo};
pub use crate::token::{Token, TokenType};

use std::fmt;
use thiserror::Error;

/// A resolved position within a text file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TextFileLocus {
    /// The number of newlines before the position.
    pub newlines: u32,
    /// The number of tabs on the position's line, before the position.
    pub tabs: u32,
    /// The number of non-tab characters on the line, before the position.
    pub characters: u32,
}

impl TextFileLocus {
    /// The 1-based line number.
    pub fn line_number(&self) -> u32 {
        self.newlines + 1
    }

    /// The 1-based column, rendering each tab as `tab_size` columns.
    pub fn column(&self, tab_size: u32) -> u32 {
        self.tabs * tab_size + self.characters + 1
    }
}

impl fmt::Display for TextFileLocus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line_number(), self.column(8))
    }
}

/// A parse error: where it happened and what the parser expected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{locus}: {message}")]
pub struct ParseError {
    /// Where the error occurred.
    pub locus: TextFileLocus,
    /// What went wrong.
    pub message: String,
}
