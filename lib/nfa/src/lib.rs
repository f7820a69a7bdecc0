//! Finite-automaton machinery for the Wavelet text-format lexer.
//!
//! A [`Builder`] accumulates a non-deterministic automaton whose edges are
//! labeled with [`CharSet`]s (plus ε-edges). [`Machine::new`] translates it
//! into a deterministic automaton stored as a single dense transition table,
//! with the 256 input bytes compressed into equivalence classes. The
//! [`Machine::feed`] loop is the lexer's hot path: it advances
//! `state ← table[state + class[byte]]` until the state goes negative.
//!
//! Terminal states live in the negative half of the index space. The two
//! sentinel patterns are [`UNMATCHED_CHARACTER_TERMINAL`] (no edge matched
//! the input byte) and [`EDGE_DOESNT_CONSUME_INPUT_FLAG`] (the terminal was
//! reached by peeking at a byte that belongs to the next token).

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod charset;
pub mod regexp;

pub use crate::charset::CharSet;

use more_asserts::assert_le;
use std::collections::HashMap;

/// An index of a DFA state. A negative index indicates an accepting or
/// terminal state.
pub type StateIndex = i16;

/// A flag that's set on terminal DFA state transitions that don't consume
/// any input.
pub const EDGE_DOESNT_CONSUME_INPUT_FLAG: StateIndex = 0x4000;

/// An implicit terminal state that indicates the DFA didn't recognize the
/// input.
pub const UNMATCHED_CHARACTER_TERMINAL: StateIndex = i16::MIN;

/// The largest negative state index that doesn't have
/// [`EDGE_DOESNT_CONSUME_INPUT_FLAG`] set. Terminal states for token type
/// `n` are conventionally encoded as `MAXIMUM_TERMINAL_STATE_INDEX - n`.
pub const MAXIMUM_TERMINAL_STATE_INDEX: StateIndex = -0x4001;

const INTERNAL_MAX_STATES: usize = i16::MAX as usize;

struct NfaState {
    epsilon_next_states: Vec<StateIndex>,
    edges: Vec<(StateIndex, CharSet)>,
}

/// Holds the state of an under-construction non-deterministic automaton.
pub struct Builder {
    nfa_states: Vec<NfaState>,
}

impl Builder {
    /// Creates a builder holding only the start state (state 0).
    pub fn new() -> Self {
        let mut builder = Self { nfa_states: Vec::new() };
        builder.add_state();
        builder
    }

    /// Adds a state and returns its index.
    pub fn add_state(&mut self) -> StateIndex {
        assert_le!(self.nfa_states.len(), INTERNAL_MAX_STATES);
        self.nfa_states.push(NfaState {
            epsilon_next_states: Vec::new(),
            edges: Vec::new(),
        });
        (self.nfa_states.len() - 1) as StateIndex
    }

    /// Adds an edge from `initial_state` to `next_state` taken for any byte
    /// in `predicate`. `next_state` may be a (negative) terminal encoding.
    pub fn add_edge(&mut self, initial_state: StateIndex, predicate: CharSet, next_state: StateIndex) {
        self.nfa_states[initial_state as usize]
            .edges
            .push((next_state, predicate));
    }

    /// Adds an ε-edge between two non-terminal states.
    pub fn add_epsilon_edge(&mut self, initial_state: StateIndex, next_state: StateIndex) {
        assert!(next_state >= 0, "ε-edges may not target terminal states");
        self.nfa_states[initial_state as usize]
            .epsilon_next_states
            .push(next_state);
    }

    /// Looks up the non-terminal state reached from `initial_state` on byte
    /// `c`, if any. Used to share prefixes when threading literal strings
    /// into the automaton.
    pub fn non_terminal_edge(&self, initial_state: StateIndex, c: u8) -> Option<StateIndex> {
        self.nfa_states[initial_state as usize]
            .edges
            .iter()
            .find(|(next, predicate)| *next >= 0 && predicate.contains(c))
            .map(|(next, _)| *next)
    }

    fn epsilon_closure(&self, states: &mut Vec<StateIndex>) {
        let mut scan = 0;
        while scan < states.len() {
            let state = states[scan];
            for &next in &self.nfa_states[state as usize].epsilon_next_states {
                if !states.contains(&next) {
                    states.push(next);
                }
            }
            scan += 1;
        }
        states.sort_unstable();
        states.dedup();
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encapsulates an NFA that has been translated into a DFA that can be
/// efficiently executed.
pub struct Machine {
    char_to_offset_map: [u32; 256],
    state_and_offset_to_next_state_map: Box<[i16]>,
    num_classes: usize,
    num_states: usize,
}

impl Machine {
    /// Constructs a DFA from the builder (which is consumed).
    ///
    /// Performs subset construction over ε-closures, then compresses the 256
    /// transition columns into equivalence classes so the final table is
    /// `num_states × num_classes` entries. The table is stored column-major:
    /// the byte map holds `class × num_states`, so `feed` reaches the next
    /// state with a single add and the table entries stay raw 16-bit state
    /// indices. Panics if the state count exceeds the signed 16-bit range.
    pub fn new(builder: Builder) -> Self {
        // Subset construction. Each DFA state is a sorted set of NFA states;
        // per input byte the successor is either another DFA state (when any
        // non-terminal NFA successor exists, to implement maximal munch) or
        // the best terminal among the terminal successors.
        let mut initial: Vec<StateIndex> = vec![0];
        builder.epsilon_closure(&mut initial);

        let mut dfa_state_sets: Vec<Vec<StateIndex>> = vec![initial.clone()];
        let mut dfa_state_map: HashMap<Vec<StateIndex>, usize> = HashMap::new();
        dfa_state_map.insert(initial, 0);

        // Raw transitions: per DFA state, per byte, either a non-negative DFA
        // state index or a negative terminal encoding (widened to i32 so DFA
        // indices don't collide with terminals during construction).
        let mut transitions: Vec<[i32; 256]> = Vec::new();

        let mut scan = 0;
        while scan < dfa_state_sets.len() {
            let current = dfa_state_sets[scan].clone();
            let mut row = [UNMATCHED_CHARACTER_TERMINAL as i32; 256];

            for c in 0..256usize {
                let mut next_states: Vec<StateIndex> = Vec::new();
                let mut best_terminal: Option<StateIndex> = None;
                for &nfa_state in &current {
                    for &(next, ref predicate) in &builder.nfa_states[nfa_state as usize].edges {
                        if !predicate.contains(c as u8) {
                            continue;
                        }
                        if next >= 0 {
                            if !next_states.contains(&next) {
                                next_states.push(next);
                            }
                        } else {
                            // Among conflicting terminals the numerically
                            // greatest wins, which prefers the token type
                            // registered first.
                            best_terminal = Some(match best_terminal {
                                Some(best) if best >= next => best,
                                _ => next,
                            });
                        }
                    }
                }

                row[c] = if !next_states.is_empty() {
                    builder.epsilon_closure(&mut next_states);
                    let next_index = match dfa_state_map.get(&next_states) {
                        Some(&index) => index,
                        None => {
                            dfa_state_sets.push(next_states.clone());
                            dfa_state_map.insert(next_states, dfa_state_sets.len() - 1);
                            dfa_state_sets.len() - 1
                        }
                    };
                    next_index as i32
                } else {
                    best_terminal.unwrap_or(UNMATCHED_CHARACTER_TERMINAL) as i32
                };
            }

            transitions.push(row);
            scan += 1;
        }

        let num_states = transitions.len();

        // Equivalence-class compression: bytes with identical transition
        // columns share a class offset.
        let mut char_to_offset_map = [0u32; 256];
        let mut class_columns: Vec<Vec<i32>> = Vec::new();
        let mut column_map: HashMap<Vec<i32>, u32> = HashMap::new();
        for c in 0..256usize {
            let column: Vec<i32> = transitions.iter().map(|row| row[c]).collect();
            let class = match column_map.get(&column) {
                Some(&class) => class,
                None => {
                    let class = class_columns.len() as u32;
                    class_columns.push(column.clone());
                    column_map.insert(column, class);
                    class
                }
            };
            char_to_offset_map[c] = class;
        }
        let num_classes = class_columns.len();

        assert_le!(
            num_states,
            INTERNAL_MAX_STATES,
            "DFA too large for 16-bit state indices"
        );

        // Emit the dense table column-major and fold the column base into
        // the byte map.
        for offset in char_to_offset_map.iter_mut() {
            *offset *= num_states as u32;
        }
        let mut table = vec![UNMATCHED_CHARACTER_TERMINAL; num_states * num_classes];
        for (class, column) in class_columns.iter().enumerate() {
            for (state, &raw) in column.iter().enumerate() {
                table[class * num_states + state] = raw as i16;
            }
        }

        Self {
            char_to_offset_map,
            state_and_offset_to_next_state_map: table.into_boxed_slice(),
            num_classes,
            num_states,
        }
    }

    /// Number of byte equivalence classes in the compressed table.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Number of (non-terminal) DFA states.
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Feeds bytes into the DFA until it reaches a terminal state.
    ///
    /// Upon reaching a terminal state, the state is returned and `next` is
    /// left pointing at the first byte not consumed by the automaton.
    ///
    /// The caller must guarantee that `bytes[*next..]` ends with a NUL byte;
    /// every state maps NUL to a terminal, so the loop below can read ahead
    /// without a length check against anything but the slice bound.
    #[inline]
    pub fn feed(&self, bytes: &[u8], next: &mut usize) -> StateIndex {
        let table = &self.state_and_offset_to_next_state_map;
        let classes = &self.char_to_offset_map;
        let mut state: i32 = 0;
        loop {
            state = table[(state + classes[bytes[*next] as usize] as i32) as usize] as i32;
            if state < 0 {
                *next += 1;
                break;
            }
            state = table[(state + classes[bytes[*next + 1] as usize] as i32) as usize] as i32;
            if state < 0 {
                *next += 2;
                break;
            }
            state = table[(state + classes[bytes[*next + 2] as usize] as i32) as usize] as i32;
            if state < 0 {
                *next += 3;
                break;
            }
            state = table[(state + classes[bytes[*next + 3] as usize] as i32) as usize] as i32;
            *next += 4;
            if state < 0 {
                break;
            }
        }
        if state & EDGE_DOESNT_CONSUME_INPUT_FLAG as i32 != 0 {
            *next -= 1;
            state &= !(EDGE_DOESNT_CONSUME_INPUT_FLAG as i32);
        }
        state as StateIndex
    }
}
