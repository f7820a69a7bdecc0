//! A small regular-expression front end that lowers patterns directly into
//! [`Builder`](crate::Builder) states and edges.
//!
//! The supported syntax is the subset the text-format lexer needs: literal
//! bytes, `\`-escapes (including `\d`, `\n`, `\t`, `\r` and escaped
//! punctuation), `[...]`/`[^...]` classes with ranges, `(...)` groups, `|`
//! alternation and the `*`, `+`, `?` postfix operators. An unescaped `.`
//! matches any byte except NUL. Patterns are compiled-in constants, so a
//! malformed pattern is a programmer error and panics.

use crate::{Builder, CharSet, StateIndex};

enum Node {
    Lit(CharSet),
    Seq(Vec<Node>),
    Alt(Vec<Node>),
    ZeroOrMore(Box<Node>),
    OneOrMore(Box<Node>),
    Optional(Box<Node>),
}

struct Parser<'a> {
    pattern: &'a [u8],
    next: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.pattern.get(self.next).copied()
    }

    fn bump(&mut self) -> u8 {
        let c = self.pattern[self.next];
        self.next += 1;
        c
    }

    fn fail(&self, message: &str) -> ! {
        panic!(
            "malformed regular expression {:?} at offset {}: {}",
            String::from_utf8_lossy(self.pattern),
            self.next,
            message
        );
    }

    fn parse_alternation(&mut self) -> Node {
        let mut branches = vec![self.parse_sequence()];
        while self.peek() == Some(b'|') {
            self.bump();
            branches.push(self.parse_sequence());
        }
        if branches.len() == 1 {
            branches.pop().unwrap()
        } else {
            Node::Alt(branches)
        }
    }

    fn parse_sequence(&mut self) -> Node {
        let mut items = Vec::new();
        while let Some(c) = self.peek() {
            if c == b'|' || c == b')' {
                break;
            }
            items.push(self.parse_postfix());
        }
        if items.len() == 1 {
            items.pop().unwrap()
        } else {
            Node::Seq(items)
        }
    }

    fn parse_postfix(&mut self) -> Node {
        let mut node = self.parse_atom();
        loop {
            node = match self.peek() {
                Some(b'*') => {
                    self.bump();
                    Node::ZeroOrMore(Box::new(node))
                }
                Some(b'+') => {
                    self.bump();
                    Node::OneOrMore(Box::new(node))
                }
                Some(b'?') => {
                    self.bump();
                    Node::Optional(Box::new(node))
                }
                _ => return node,
            };
        }
    }

    fn parse_atom(&mut self) -> Node {
        match self.bump() {
            b'(' => {
                let node = self.parse_alternation();
                if self.peek() != Some(b')') {
                    self.fail("expected ')'");
                }
                self.bump();
                node
            }
            b'[' => Node::Lit(self.parse_class()),
            b'\\' => Node::Lit(self.parse_escape()),
            b'.' => {
                // Any byte but the NUL that terminates lexer input.
                let mut set = CharSet::new().complement();
                set.remove(0);
                Node::Lit(set)
            }
            c => Node::Lit(CharSet::from_char(c)),
        }
    }

    fn parse_class(&mut self) -> CharSet {
        let negated = if self.peek() == Some(b'^') {
            self.bump();
            true
        } else {
            false
        };
        let mut set = CharSet::new();
        loop {
            let first = match self.peek() {
                None => self.fail("unterminated character class"),
                Some(b']') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    let escaped = self.parse_escape();
                    set = set.union(&escaped);
                    continue;
                }
                Some(_) => self.bump(),
            };
            if self.peek() == Some(b'-') && self.pattern.get(self.next + 1) != Some(&b']') {
                self.bump();
                let last = if self.peek() == Some(b'\\') {
                    self.bump();
                    self.parse_single_escape()
                } else {
                    self.bump()
                };
                if last < first {
                    self.fail("inverted range in character class");
                }
                set.add_range(first, last);
            } else {
                set.add(first);
            }
        }
        if negated {
            let mut complement = set.complement();
            // A negated class never matches the terminating NUL.
            complement.remove(0);
            complement
        } else {
            set
        }
    }

    fn parse_escape(&mut self) -> CharSet {
        match self.peek() {
            Some(b'd') => {
                self.bump();
                CharSet::from_range(b'0', b'9')
            }
            _ => CharSet::from_char(self.parse_single_escape()),
        }
    }

    fn parse_single_escape(&mut self) -> u8 {
        match self.bump() {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            c if c.is_ascii_alphanumeric() => {
                self.fail("unknown escape");
            }
            c => c,
        }
    }
}

fn emit(node: &Node, builder: &mut Builder, from: StateIndex, to: StateIndex) {
    match node {
        Node::Lit(set) => builder.add_edge(from, *set, to),
        Node::Seq(items) => {
            let mut current = from;
            for (index, item) in items.iter().enumerate() {
                let next = if index + 1 == items.len() {
                    to
                } else {
                    builder.add_state()
                };
                emit(item, builder, current, next);
                current = next;
            }
            if items.is_empty() {
                builder.add_epsilon_edge(from, to);
            }
        }
        Node::Alt(branches) => {
            for branch in branches {
                emit(branch, builder, from, to);
            }
        }
        Node::ZeroOrMore(inner) => {
            let hub = builder.add_state();
            builder.add_epsilon_edge(from, hub);
            emit(inner, builder, hub, hub);
            builder.add_epsilon_edge(hub, to);
        }
        Node::OneOrMore(inner) => {
            let hub = builder.add_state();
            emit(inner, builder, from, hub);
            emit(inner, builder, hub, hub);
            builder.add_epsilon_edge(hub, to);
        }
        Node::Optional(inner) => {
            emit(inner, builder, from, to);
            builder.add_epsilon_edge(from, to);
        }
    }
}

/// Lowers `pattern` into `builder` as a sub-automaton from `initial_state`
/// to `final_state`.
///
/// `final_state` must be a non-terminal state: token machines route matches
/// through a separator-peek state, and the repetition operators need to be
/// able to reach the final state through ε-edges.
pub fn add_to_nfa(pattern: &str, builder: &mut Builder, initial_state: StateIndex, final_state: StateIndex) {
    let mut parser = Parser {
        pattern: pattern.as_bytes(),
        next: 0,
    };
    let node = parser.parse_alternation();
    if parser.next != parser.pattern.len() {
        parser.fail("trailing characters");
    }
    emit(&node, builder, initial_state, final_state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Machine, EDGE_DOESNT_CONSUME_INPUT_FLAG, MAXIMUM_TERMINAL_STATE_INDEX, UNMATCHED_CHARACTER_TERMINAL};

    fn machine_for(pattern: &str) -> Machine {
        let mut builder = Builder::new();
        let peek = builder.add_state();
        let mut separator = CharSet::new();
        separator.add(b' ');
        separator.add(0);
        builder.add_edge(
            peek,
            separator,
            MAXIMUM_TERMINAL_STATE_INDEX | EDGE_DOESNT_CONSUME_INPUT_FLAG,
        );
        add_to_nfa(pattern, &mut builder, 0, peek);
        Machine::new(builder)
    }

    fn matches(machine: &Machine, text: &str) -> bool {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let mut next = 0;
        let state = machine.feed(&bytes, &mut next);
        state == MAXIMUM_TERMINAL_STATE_INDEX && next == text.len()
    }

    #[test]
    fn decimal_integers() {
        let machine = machine_for("[+\\-]?\\d+(_\\d+)*");
        assert!(matches(&machine, "0"));
        assert!(matches(&machine, "+123"));
        assert!(matches(&machine, "-1_000_000"));
        assert!(!matches(&machine, "_1"));
        assert!(!matches(&machine, "1_"));
        assert!(!matches(&machine, "+"));
    }

    #[test]
    fn hexadecimal_integers() {
        let machine = machine_for("[+\\-]?0[xX][\\da-fA-F]+(_[\\da-fA-F]+)*");
        assert!(matches(&machine, "0x1f"));
        assert!(matches(&machine, "-0XABC_DEF"));
        assert!(!matches(&machine, "0x"));
        assert!(!matches(&machine, "123"));
    }

    #[test]
    fn alternation_and_optionals() {
        let machine = machine_for("a(b|c)d?");
        assert!(matches(&machine, "ab"));
        assert!(matches(&machine, "acd"));
        assert!(!matches(&machine, "ad"));
    }

    #[test]
    fn negated_class_excludes_members() {
        let machine = machine_for("\"[^\"\\n]*\"");
        assert!(matches(&machine, "\"hello world\""));
        assert!(!matches(&machine, "\"unterminated"));
    }

    #[test]
    fn unmatched_byte_is_reported() {
        let machine = machine_for("\\d+");
        let mut next = 0;
        assert_eq!(machine.feed(b"x\0", &mut next), UNMATCHED_CHARACTER_TERMINAL);
    }
}
