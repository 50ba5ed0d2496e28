//! §4.1: the type system and operand width/decay rules.

use std::rc::Rc;
use crate::error::{CompileError, Result};
use crate::types::ast::Span;

/// The primitive category a [`Type`] is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Basic {
  /// `void` — only legal as a function return type or behind a pointer.
  Void,
  U8,
  U16,
  U32,
  /// A named `class`; see [`Type::class_name`].
  Class,
}

/// A single Classical type: a primitive or class, behind zero or more
/// pointer indirections, optionally an array of some size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Type {
  pub basic: Basic,
  /// Number of `*` applied on top of `basic`/`class_name`.
  pub indirection: u8,
  /// `0` unless this entity is a storage array; see the decay rule below.
  pub array_size: u32,
  /// Set iff `basic == Basic::Class`.
  pub class_name: Option<Rc<str>>,
  /// Compile-time initializer bytes for a global, if any. For an array this
  /// is the concatenation of each element's bytes (`array_size` chunks of
  /// `sizeOf(element)` each); for a scalar it is exactly `sizeOf(self)`
  /// bytes.
  pub initializer_bytes: Option<Rc<[u8]>>,
}

impl Type {
  /// Build a bare primitive type with no indirection, no array, no init.
  #[must_use] pub fn primitive(basic: Basic) -> Self {
    Type { basic, indirection: 0, array_size: 0, class_name: None, initializer_bytes: None }
  }

  /// Build a named-class value type (only legal as a member or local; see
  /// §3 and §10.6 item 3 for the top-level-assignment restriction).
  #[must_use] pub fn class(name: Rc<str>) -> Self {
    Type { basic: Basic::Class, indirection: 0, array_size: 0, class_name: Some(name), initializer_bytes: None }
  }

  /// `true` iff this is a value-class instance: `basic=class`, no
  /// indirection, not an array (§3 invariant).
  #[must_use] pub fn is_value_class(&self) -> bool {
    self.basic == Basic::Class && self.indirection == 0 && self.array_size == 0
  }

  /// `true` iff this entity is a storage array (§3: `arraySize>0`).
  #[must_use] pub fn is_array(&self) -> bool { self.array_size > 0 }

  /// `true` iff this is a pointer (possibly to a pointer, etc).
  #[must_use] pub fn is_pointer(&self) -> bool { self.indirection > 0 }

  /// The element type of an array (same basic/indirection/class, with
  /// `array_size` cleared). Panics if this is not an array — callers are
  /// expected to check [`Type::is_array`] first.
  #[must_use] pub fn element_type(&self) -> Type {
    debug_assert!(self.is_array());
    Type { array_size: 0, initializer_bytes: None, ..self.clone() }
  }

  /// Decay an array to a pointer-to-element for rvalue use (§4.1 "Array
  /// decay"): clear `array_size`, bump `indirection` by one. Idempotent on
  /// non-arrays.
  #[must_use] pub fn decay(&self) -> Type {
    if !self.is_array() { return self.clone() }
    Type {
      array_size: 0,
      indirection: self.indirection + 1,
      initializer_bytes: None,
      ..self.clone()
    }
  }

  /// `sizeOf(Type)` (§4.1).
  pub fn size_of(&self) -> Result<u32> {
    if self.indirection > 0 { return Ok(4) }
    if self.array_size > 0 {
      return Ok(self.array_size * self.element_type().size_of()?)
    }
    match self.basic {
      Basic::Void => Err(CompileError::internal("sizeOf(void) is meaningless")),
      Basic::U8 => Ok(1),
      Basic::U16 => Ok(2),
      Basic::U32 => Ok(4),
      // Class total size is computed by the symbol table from member
      // layout; callers with a class entry in scope should prefer
      // `ClassEntry::total_size` to this fallback of 0, which only applies
      // to forward-declared or not-yet-laid-out classes.
      Basic::Class => Ok(0),
    }
  }

  /// `sizeOfDereferenced(Type)` (§4.1): the type with one fewer level of
  /// indirection, i.e. what a `load`/`store` through this pointer reads or
  /// writes.
  pub fn size_of_dereferenced(&self) -> Result<u32> {
    self.dereferenced()?.size_of()
  }

  /// The type obtained by removing one level of indirection (or, for an
  /// array, decaying then removing the level decay just added — i.e.
  /// dereferencing an array is dereferencing its element pointer).
  pub fn dereferenced(&self) -> Result<Type> {
    if self.indirection == 0 && self.array_size == 0 {
      return Err(CompileError::internal(
        "SelectWidthForDereference on a non-indirect operand"))
    }
    let decayed = self.decay();
    Ok(Type { indirection: decayed.indirection - 1, ..decayed })
  }

  /// Two types are equal iff `(basic, indirection, arraySize, className)`
  /// match (§4.1 "Type comparison").
  #[must_use] pub fn structurally_eq(&self, other: &Type) -> bool {
    self.basic == other.basic
      && self.indirection == other.indirection
      && self.array_size == other.array_size
      && self.class_name == other.class_name
  }

  /// "Compare allowing implicit widening" (§4.1): identical pointer-ness
  /// and array-ness, identical basic category, destination size >= source
  /// size.
  ///
  /// A pointer or array's pointee/element identity must match exactly (a
  /// `u8*` never widens from a `u16*`). A bare scalar only needs to agree on
  /// class-ness — and, for a class, on which class — since the whole point
  /// of `u8`/`u16`/`u32` is that a narrower integer constant or variable
  /// widens into a wider one.
  pub fn widens_from(&self, src: &Type) -> Result<bool> {
    if self.is_pointer() != src.is_pointer() { return Ok(false) }
    if self.is_array() != src.is_array() { return Ok(false) }
    if self.is_pointer() || self.is_array() {
      if self.basic != src.basic || self.class_name != src.class_name { return Ok(false) }
    } else {
      let self_is_class = self.basic == Basic::Class;
      if self_is_class != (src.basic == Basic::Class) { return Ok(false) }
      if self_is_class && self.class_name != src.class_name { return Ok(false) }
    }
    Ok(self.size_of()? >= src.size_of()?)
  }

  /// The load/store width mnemonic suffix for this operand's own type
  /// (§4.1 "Width selection"), not following any pointer.
  pub fn select_width(&self) -> Result<Width> {
    if self.is_pointer() { return Ok(Width::Word) }
    match self.size_of()? {
      1 => Ok(Width::Byte),
      2 => Ok(Width::Half),
      4 => Ok(Width::Word),
      n => Err(CompileError::internal(format!("no width for size {n}"))),
    }
  }

  /// The load/store width when following through this pointer type, i.e.
  /// `SelectWidthForDereference` (§4.6).
  pub fn select_width_for_dereference(&self) -> Result<Width> {
    self.dereferenced()?.select_width()
  }
}

/// `== Compare(A,B)=ok ∧ sizeOf(A) ≤ sizeOf(C) ⇒ Compare(A,C)=ok` (§8
/// testable property 6) is exercised directly in the unit tests below
/// rather than restated here.

/// A load/store width, matching the assembly mnemonic suffix used in
/// codegen (`b`/`h`/`w`, unsigned loads are `bu`/`hu`/`wu`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width { Byte, Half, Word }

impl Width {
  #[must_use] pub fn bytes(self) -> u32 {
    match self { Width::Byte => 1, Width::Half => 2, Width::Word => 4 }
  }

  /// Store mnemonic suffix: `sb`/`sh`/`sw`.
  #[must_use] pub fn store_suffix(self) -> &'static str {
    match self { Width::Byte => "b", Width::Half => "h", Width::Word => "w" }
  }

  /// Unsigned load mnemonic suffix: `lbu`/`lhu`/`lwu`.
  #[must_use] pub fn unsigned_load_suffix(self) -> &'static str {
    match self { Width::Byte => "bu", Width::Half => "hu", Width::Word => "wu" }
  }
}

/// `⌈log2(elementSize)⌉` encoded as a shift amount (GLOSSARY "Scale shift").
/// Element sizes in this language are always powers of two (1, 2, or 4, or
/// 4 for any pointer/class-as-pointer), so this is an exact log2, not a
/// ceiling over non-power-of-two sizes.
pub fn scale_shift(element_size: u32) -> Result<u8> {
  match element_size {
    1 => Ok(0),
    2 => Ok(1),
    4 => Ok(2),
    n => Err(CompileError::internal(format!("non-power-of-two element size {n}"))),
  }
}

/// Helper used at call-site and assignment type checks: does `src` widen
/// into `dst` without narrowing? Raises a `Code` error with the given span
/// otherwise (§7 "narrowing conversion at call sites").
pub fn check_widens(dst: &Type, src: &Type, span: &Span, context: &str) -> Result<()> {
  if dst.widens_from(src)? { return Ok(()) }
  Err(CompileError::code(span.clone(), format!(
    "narrowing or incompatible conversion in {context}: cannot convert {src:?} to {dst:?}")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn size_of_primitives() {
    assert_eq!(Type::primitive(Basic::U8).size_of().unwrap(), 1);
    assert_eq!(Type::primitive(Basic::U16).size_of().unwrap(), 2);
    assert_eq!(Type::primitive(Basic::U32).size_of().unwrap(), 4);
  }

  #[test]
  fn pointer_is_always_four_bytes() {
    let mut t = Type::primitive(Basic::U8);
    t.indirection = 1;
    assert_eq!(t.size_of().unwrap(), 4);
  }

  #[test]
  fn array_size_is_count_times_element() {
    let mut t = Type::primitive(Basic::U16);
    t.array_size = 4;
    assert_eq!(t.size_of().unwrap(), 8);
  }

  #[test]
  fn decay_clears_array_and_adds_indirection() {
    let mut t = Type::primitive(Basic::U8);
    t.array_size = 4;
    let decayed = t.decay();
    assert_eq!(decayed.array_size, 0);
    assert_eq!(decayed.indirection, 1);
  }

  #[test]
  fn decay_is_idempotent_on_non_arrays() {
    let t = Type::primitive(Basic::U32);
    assert_eq!(t.decay(), t);
  }

  #[test]
  fn dereference_of_non_indirect_is_internal_error() {
    let t = Type::primitive(Basic::U8);
    assert!(t.dereferenced().is_err());
  }

  #[test]
  fn widening_respects_size_monotonicity() {
    let u8t = Type::primitive(Basic::U8);
    let u16t = Type::primitive(Basic::U16);
    let u32t = Type::primitive(Basic::U32);
    assert!(u16t.widens_from(&u8t).unwrap());
    assert!(u32t.widens_from(&u16t).unwrap());
    assert!(u32t.widens_from(&u8t).unwrap());
    assert!(!u8t.widens_from(&u16t).unwrap());
  }

  #[test]
  fn pointer_widening_requires_exact_pointee_match() {
    let mut u8_ptr = Type::primitive(Basic::U8);
    u8_ptr.indirection = 1;
    let mut u16_ptr = Type::primitive(Basic::U16);
    u16_ptr.indirection = 1;
    assert!(!u8_ptr.widens_from(&u16_ptr).unwrap());
  }

  #[test]
  fn class_scalars_only_widen_from_the_same_class() {
    use std::rc::Rc;
    let p: Rc<str> = "P".into();
    let q: Rc<str> = "Q".into();
    assert!(Type::class(p.clone()).widens_from(&Type::class(p)).unwrap());
    assert!(!Type::class(p.clone()).widens_from(&Type::class(q)).unwrap());
    assert!(!Type::class(p).widens_from(&Type::primitive(Basic::U32)).unwrap());
  }

  #[test]
  fn widening_requires_matching_pointerness() {
    let u8t = Type::primitive(Basic::U8);
    let mut ptr = u8t.clone();
    ptr.indirection = 1;
    assert!(!ptr.widens_from(&u8t).unwrap());
  }

  #[test]
  fn select_width_picks_pointer_as_word() {
    let mut t = Type::primitive(Basic::U8);
    t.indirection = 1;
    assert_eq!(t.select_width().unwrap(), Width::Word);
  }

  #[test]
  fn scale_shift_matches_element_size() {
    assert_eq!(scale_shift(1).unwrap(), 0);
    assert_eq!(scale_shift(2).unwrap(), 1);
    assert_eq!(scale_shift(4).unwrap(), 2);
    assert!(scale_shift(3).is_err());
  }
}
