//! Process-wide string interning.
//!
//! Every identifier, mangled name, and class/field name that flows through
//! the pipeline is interned exactly once. Equality and hashing on [`Symbol`]
//! are then a single `usize` comparison, which matters because scope lookup
//! and TAC operand name comparisons happen on the order of once per AST node.

use std::cell::RefCell;
use hashbrown::HashMap;

/// An interned string. Cheap to copy, compare, and hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl std::fmt::Debug for Symbol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    with_interner(|i| write!(f, "{:?}", i.strings[self.0 as usize]))
  }
}

impl std::fmt::Display for Symbol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    with_interner(|i| write!(f, "{}", i.strings[self.0 as usize]))
  }
}

impl Symbol {
  /// Get the underlying string. Allocates a fresh `String`; prefer
  /// `Display`/`Debug` when you just need to print it.
  #[must_use] pub fn as_str(self) -> String {
    with_interner(|i| i.strings[self.0 as usize].clone())
  }
}

#[derive(Default)]
struct Interner {
  strings: Vec<Box<str>>,
  map: HashMap<Box<str>, Symbol>,
}

impl Interner {
  fn intern(&mut self, s: &str) -> Symbol {
    if let Some(&sym) = self.map.get(s) { return sym }
    let sym = Symbol(u32::try_from(self.strings.len()).expect("interner overflow"));
    let boxed: Box<str> = s.into();
    self.strings.push(boxed.clone());
    self.map.insert(boxed, sym);
    sym
  }
}

thread_local! {
  static INTERNER: RefCell<Interner> = RefCell::new(Interner::default());
}

fn with_interner<R>(f: impl FnOnce(&Interner) -> R) -> R {
  INTERNER.with(|i| f(&i.borrow()))
}

/// Intern a string, returning the same [`Symbol`] on every call with
/// equal contents.
pub fn intern(s: &str) -> Symbol {
  INTERNER.with(|i| i.borrow_mut().intern(s))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reinterning_returns_same_symbol() {
    let a = intern("foo_bar");
    let b = intern("foo_bar");
    assert_eq!(a, b);
  }

  #[test]
  fn distinct_strings_get_distinct_symbols() {
    assert_ne!(intern("alpha_one"), intern("beta_two"));
  }

  #[test]
  fn as_str_round_trips() {
    let s = intern("roundtrip_me");
    assert_eq!(s.as_str(), "roundtrip_me");
  }
}
