//! The AST input contract (§6).
//!
//! The lexer, parser, and preprocessor are external collaborators (§1); this
//! module only defines the tree shape the linearizer consumes. The source
//! contract describes nodes as `{tokenKind, valueStr, line, col, file,
//! firstChild, nextSibling}` — a child/sibling linked tree, which is how a
//! C parser naturally builds an AST one token at a time. The idiomatic Rust
//! rendering of the same ordered-children relationship is a `Vec<Ast>`, so
//! that's what [`Ast`] carries; nothing about the tree's meaning changes.

use std::rc::Rc;

/// Source location of an AST node, also used to tag diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Span {
  /// Source file path as reported by the preprocessor's line directives.
  pub file: Rc<str>,
  /// 1-based line number.
  pub line: u32,
  /// 1-based column number.
  pub col: u32,
}

impl std::fmt::Display for Span {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}:{}", self.file, self.line, self.col)
  }
}

/// The non-terminal subset of the token set named in §6, plus the
/// production shapes the linearizer pattern-matches on. Terminal operator
/// tokens that only ever appear as the `op` field of [`NodeKind::Binary`]/
/// [`NodeKind::Unary`]/[`NodeKind::Assign`] are folded into [`BinOp`],
/// [`UnOp`], and [`AssignOp`] rather than kept as separate `NodeKind`
/// variants, which is how a typed Rust AST normally differs from a bare
/// token-tagged parse tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
  /// Top-level translation unit; children are declarations in source order.
  Program,
  /// `u8`/`u16`/`u32`/`void`/`class <name>`, with `indirection` stars and an
  /// optional `[N]` array suffix already folded in (see [`TypeName`]).
  TypeName(TypeName),
  /// A variable or argument declaration: `{type} name [= initializer]`.
  VariableDecl { name: Rc<str> },
  /// A function prototype or definition. Children: return type name,
  /// zero or more argument declarations, optional body scope.
  FunctionDef { name: Rc<str>, is_asm: bool },
  /// `class Name { members... }`.
  ClassDecl { name: Rc<str> },
  /// A `{ ... }` block. Children are statements in source order.
  Scope,
  /// `if (cond) then [else else_]`. Children: cond, then, optional else.
  If,
  /// `while (cond) body`. Children: cond, body.
  While,
  /// `return [expr];`. Child: optional expression.
  Return,
  /// One line of a verbatim `asm { ... }` block; `text` is emitted as-is.
  AsmLine { text: Rc<str> },
  /// Binary operator expression. Children: lhs, rhs.
  Binary(BinOp),
  /// Unary operator expression. Child: operand.
  Unary(UnOp),
  /// Assignment `lhs {op} rhs`. Children: lhs, rhs.
  Assign(AssignOp),
  /// `a[i]`. Children: base, index.
  Index,
  /// `a.b` or `a->b`. Children: base. `member` is the field name.
  Member { member: Rc<str>, arrow: bool },
  /// `f(args...)`. Children: argument expressions in source order.
  Call { name: Rc<str> },
  /// A bare identifier reference.
  Identifier(Rc<str>),
  /// An integer literal, already parsed.
  IntConstant(u32),
  /// A character literal, already parsed to its byte value.
  CharLiteral(u8),
  /// A string literal's raw (unescaped) contents.
  StringLiteral(Rc<str>),
}

/// A folded-in pointer/array type annotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeName {
  /// `u8`/`u16`/`u32`/`void`, or `class` with `class_name` set.
  pub basic: BasicTypeName,
  /// Number of `*` stars.
  pub indirection: u8,
  /// `0` unless this is an array declarator (`[N]`).
  pub array_size: u32,
  /// Set when `basic == Class`.
  pub class_name: Option<Rc<str>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BasicTypeName { Void, U8, U16, U32, Class }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp { Add, Sub, Mul, Div, Lt, Gt, Le, Ge, Eq, Ne, And, Or }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp { Neg, Not, BitNot, Deref, AddrOf }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp { Assign, PlusEq, MinusEq }

/// One node of the AST, owning its children in source order.
#[derive(Clone, Debug)]
pub struct Ast {
  pub kind: NodeKind,
  pub span: Span,
  pub children: Vec<Ast>,
}

impl Ast {
  /// Build a leaf or interior node. Most linearizer code reaches for this
  /// rather than constructing the struct literal directly so that adding
  /// fields to `Ast` doesn't ripple through every call site.
  #[must_use] pub fn new(kind: NodeKind, span: Span, children: Vec<Ast>) -> Self {
    Ast { kind, span, children }
  }

  /// Convenience accessor mirroring the source contract's `firstChild`.
  #[must_use] pub fn first_child(&self) -> Option<&Ast> { self.children.first() }

  /// Convenience accessor for the nth child, panicking with a clear message
  /// rather than an index-out-of-bounds if the AST is malformed — malformed
  /// ASTs from a conforming parser are an internal error, not a code error.
  #[must_use] pub fn child(&self, i: usize) -> &Ast {
    self.children.get(i).unwrap_or_else(|| panic!(
      "malformed AST: expected child {i} of {:?} at {}", self.kind, self.span))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn span() -> Span { Span { file: "t.cls".into(), line: 1, col: 1 } }

  #[test]
  fn first_child_is_none_on_leaf() {
    let leaf = Ast::new(NodeKind::IntConstant(1), span(), vec![]);
    assert!(leaf.first_child().is_none());
  }

  #[test]
  fn children_preserve_source_order() {
    let a = Ast::new(NodeKind::Identifier("a".into()), span(), vec![]);
    let b = Ast::new(NodeKind::Identifier("b".into()), span(), vec![]);
    let parent = Ast::new(NodeKind::Call { name: "f".into() }, span(), vec![a, b]);
    assert_eq!(parent.child(0).kind, NodeKind::Identifier("a".into()));
    assert_eq!(parent.child(1).kind, NodeKind::Identifier("b".into()));
  }
}
