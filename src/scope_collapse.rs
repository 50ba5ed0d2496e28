//! §4.2 "Scope collapse": the post-linearization pass that renames every
//! `standard`/`objptr` TAC operand to its scope-mangled name, then flattens
//! each sub-scope's members into its parent so later passes (register
//! allocation, codegen) can work over a function's main scope — or the
//! global scope — directly, without walking the original nesting.
//!
//! Variable names are interned context-free, so two sibling sub-scopes that
//! each declare the same raw name (an `if`/`else` pair both doing `u8 i =
//! ...;`) carry the identical `Symbol`. A rename pass that matched purely by
//! name across a whole function would misattribute one branch's uses to the
//! other's mangled name. [`crate::linearizer::LinearizedUnit`] carries each
//! sub-scope's `tac_index` range for exactly this reason: the rename for a
//! given scope is restricted to TAC lines emitted while that scope was the
//! innermost one in effect, and scopes are processed depth-first (children
//! before parents) so a name already claimed by a nested scope is never
//! re-matched by an ancestor's pass.

use std::collections::HashMap;

use crate::error::{CompileError, Result};
use crate::linearizer::LinearizedUnit;
use crate::symbol::Symbol;
use crate::types::symtab::{mangle, FunctionId, ScopeId, ScopeMemberKind, SymbolTable};
use crate::types::tac::{BasicBlock, OperandName, Permutation};

/// Run the full §4.2 collapse over a freshly linearized unit, consuming it.
pub fn collapse(unit: LinearizedUnit) -> Result<SymbolTable> {
  let LinearizedUnit { mut symtab, scope_tac_ranges } = unit;

  let global = symtab.global_scope;
  collapse_scope(&mut symtab, &scope_tac_ranges, global)?;

  let main_scopes: Vec<ScopeId> = symtab.functions.iter().map(|f| f.main_scope).collect();
  for main in main_scopes {
    collapse_scope(&mut symtab, &scope_tac_ranges, main)?;
  }
  Ok(symtab)
}

/// `true` for the two kinds of scope that collapse never dissolves further:
/// the global scope, and a function's main scope.
fn is_root_scope(symtab: &SymbolTable, scope_id: ScopeId) -> bool {
  if scope_id == symtab.global_scope { return true }
  match symtab.scope(scope_id).parent_function {
    Some(f) => symtab.function(f).main_scope == scope_id,
    None => false,
  }
}

/// Depth-first: recurse into sub-scopes first (pass 1), mangle this scope's
/// own entries against the TAC they appear in (pass 2), then — if this
/// scope is itself a genuine sub-scope, not a root — dissolve it into its
/// parent (pass 3).
fn collapse_scope(symtab: &mut SymbolTable, ranges: &HashMap<ScopeId, (u32, u32)>, scope_id: ScopeId) -> Result<()> {
  let children: Vec<ScopeId> = symtab.scope(scope_id).entries.iter()
    .filter_map(|e| if let ScopeMemberKind::SubScope(c) = &e.kind { Some(*c) } else { None })
    .collect();

  for child in children {
    collapse_scope(symtab, ranges, child)?;
  }

  mangle_scope_entries(symtab, ranges, scope_id);

  if !is_root_scope(symtab, scope_id) {
    let parent = symtab.scope(scope_id).parent
      .ok_or_else(|| CompileError::internal("non-root scope has no parent to collapse into"))?;
    hoist_into_parent(symtab, scope_id, parent);
  }
  Ok(())
}

/// Pass 2: for every variable/argument declared directly in `scope_id`
/// (before any child's contents have been hoisted in), rewrite its TAC
/// occurrences to `mangle(scope,name)` and update its own stored name.
fn mangle_scope_entries(symtab: &mut SymbolTable, ranges: &HashMap<ScopeId, (u32, u32)>, scope_id: ScopeId) {
  let scope_name = symtab.scope(scope_id).name;
  let range = ranges.get(&scope_id).copied();
  let owner_fn = symtab.scope(scope_id).parent_function;
  let is_global = scope_id == symtab.global_scope;

  let old_names: Vec<Symbol> = symtab.scope(scope_id).entries.iter()
    .filter(|e| matches!(e.kind, ScopeMemberKind::Variable(_) | ScopeMemberKind::Argument(_)))
    .map(|e| e.name)
    .collect();

  for old_name in old_names {
    let new_name = mangle(scope_name, old_name);
    if is_global {
      // A global is visible from every function, not just the userstart/asm
      // blocks it's declared alongside, so its rename has to reach every
      // function's TAC too — unrestricted by TAC-index range, since a
      // global's lifetime isn't scoped to any one function's call.
      rewrite_operand_name_everywhere(symtab, old_name, new_name);
    } else {
      rewrite_operand_name(symtab, owner_fn, range, old_name, new_name);
    }

    let mut arg_idx = None;
    if let Some(entry) = symtab.scope_mut(scope_id).entries.iter_mut().find(|e| e.name == old_name) {
      entry.name = new_name;
      match &mut entry.kind {
        ScopeMemberKind::Variable(v) => v.name = new_name,
        ScopeMemberKind::Argument(idx) => arg_idx = Some(*idx),
        _ => unreachable!("filtered to Variable/Argument above"),
      }
    }
    if let (Some(idx), Some(f)) = (arg_idx, owner_fn) {
      symtab.function_mut(f).arguments[idx].name = new_name;
    }
  }
}

/// Rewrite every `standard`/`objptr` operand named `old` to `new`, across
/// the owning function's blocks (or the global blocks), restricted to
/// `range` when one is given.
fn rewrite_operand_name(
  symtab: &mut SymbolTable, owner_fn: Option<FunctionId>, range: Option<(u32, u32)>,
  old: Symbol, new: Symbol,
) {
  let blocks: &mut [BasicBlock] = match owner_fn {
    Some(f) => &mut symtab.function_mut(f).blocks,
    None => &mut symtab.global_blocks,
  };
  for block in blocks {
    rewrite_operand_name_in_block(block, range, old, new);
  }
}

/// Rewrite `old` to `new` across every function's blocks plus the global
/// blocks, with no TAC-index restriction — for renaming a global-scope
/// entry, which may be read or written from anywhere in the program.
fn rewrite_operand_name_everywhere(symtab: &mut SymbolTable, old: Symbol, new: Symbol) {
  for block in &mut symtab.global_blocks {
    rewrite_operand_name_in_block(block, None, old, new);
  }
  for function in &mut symtab.functions {
    for block in &mut function.blocks {
      rewrite_operand_name_in_block(block, None, old, new);
    }
  }
}

fn rewrite_operand_name_in_block(block: &mut BasicBlock, range: Option<(u32, u32)>, old: Symbol, new: Symbol) {
  for line in &mut block.tac {
    if let Some((lo, hi)) = range {
      if line.index < lo || line.index >= hi { continue }
    }
    for slot in &mut line.operands {
      let Some(operand) = slot else { continue };
      if matches!(operand.permutation, Permutation::Standard | Permutation::ObjPtr)
        && operand.name == OperandName::Name(old)
      {
        operand.name = OperandName::Name(new);
      }
    }
  }
}

/// Pass 3: move every remaining member of `scope_id` into `parent`, then
/// drop the now-hollow `SubScope(scope_id)` placeholder from `parent`.
fn hoist_into_parent(symtab: &mut SymbolTable, scope_id: ScopeId, parent: ScopeId) {
  let entries = std::mem::take(&mut symtab.scope_mut(scope_id).entries);
  symtab.scope_mut(parent).entries.extend(entries);
  symtab.scope_mut(parent).entries.retain(|e| {
    !matches!(&e.kind, ScopeMemberKind::SubScope(c) if *c == scope_id)
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::linearizer::Linearizer;
  use crate::symbol::intern;
  use crate::types::ast::{Ast, AssignOp, BasicTypeName, NodeKind, Span, TypeName};
  use crate::types::ty::Basic;

  fn span() -> Span { Span { file: "t.cls".into(), line: 1, col: 1 } }

  fn u8_type() -> Ast {
    Ast::new(NodeKind::TypeName(TypeName {
      basic: BasicTypeName::U8, indirection: 0, array_size: 0, class_name: None,
    }), span(), vec![])
  }

  fn program(children: Vec<Ast>) -> Ast { Ast::new(NodeKind::Program, span(), children) }

  #[test]
  fn global_variable_ends_up_mangled_and_still_reachable() {
    let decl = Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("x".into()), span(), vec![]),
      Ast::new(NodeKind::IntConstant(1), span(), vec![]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![decl, assign])).unwrap();
    let st = collapse(unit).unwrap();
    let mangled = intern("global_x");
    assert!(st.lookup(st.global_scope, mangled).is_some());
    let line = &st.global_blocks[0].tac[0];
    assert_eq!(line.d().unwrap().name, OperandName::Name(mangled));
  }

  #[test]
  fn function_main_scope_holds_only_arguments_and_blocks_plus_hoisted_locals() {
    let f = Ast::new(NodeKind::FunctionDef { name: "f".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::VariableDecl { name: "tmp".into() }, span(), vec![u8_type()]),
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Identifier("a".into()), span(), vec![]),
        ]),
      ]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![f])).unwrap();
    let st = collapse(unit).unwrap();
    let func = &st.functions[0];
    // The `00_a` argument and `01_tmp` local both end up reachable from main_scope.
    assert!(st.lookup(func.main_scope, intern("main_a")).is_some()
      || st.lookup(func.main_scope, intern("f_a")).is_some());
  }

  #[test]
  fn sibling_branches_declaring_the_same_name_stay_distinct() {
    // if (1) { u8 i = 1; } else { u8 i = 2; }
    let cond = Ast::new(NodeKind::IntConstant(1), span(), vec![]);
    let branch = |v: u32| Ast::new(NodeKind::Scope, span(), vec![
      Ast::new(NodeKind::VariableDecl { name: "i".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
        Ast::new(NodeKind::Identifier("i".into()), span(), vec![]),
        Ast::new(NodeKind::IntConstant(v), span(), vec![]),
      ]),
    ]);
    let if_node = Ast::new(NodeKind::If, span(), vec![cond, branch(1), branch(2)]);
    let f = Ast::new(NodeKind::FunctionDef { name: "g".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::Scope, span(), vec![if_node, Ast::new(NodeKind::Return, span(), vec![])]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![f])).unwrap();
    let st = collapse(unit).unwrap();
    let func = &st.functions[0];
    let names: Vec<Symbol> = func.blocks.iter()
      .flat_map(|b| b.tac.iter())
      .filter(|l| l.op == crate::types::tac::TacOp::Assign)
      .filter_map(|l| l.d().and_then(|d| d.name.as_symbol()))
      .collect();
    // Two distinct assignment targets: the then-branch's `i` and the
    // else-branch's `i` must NOT have collapsed onto the same mangled name.
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
  }

  #[test]
  fn nested_block_shadowing_an_outer_local_stays_distinct() {
    // u8 i; i = 1; { u8 i; i = 2; } return i;
    let outer_decl = Ast::new(NodeKind::VariableDecl { name: "i".into() }, span(), vec![u8_type()]);
    let outer_assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("i".into()), span(), vec![]),
      Ast::new(NodeKind::IntConstant(1), span(), vec![]),
    ]);
    let inner_scope = Ast::new(NodeKind::Scope, span(), vec![
      Ast::new(NodeKind::VariableDecl { name: "i".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
        Ast::new(NodeKind::Identifier("i".into()), span(), vec![]),
        Ast::new(NodeKind::IntConstant(2), span(), vec![]),
      ]),
    ]);
    let ret = Ast::new(NodeKind::Return, span(), vec![
      Ast::new(NodeKind::Identifier("i".into()), span(), vec![]),
    ]);
    let f = Ast::new(NodeKind::FunctionDef { name: "h".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::Scope, span(), vec![outer_decl, outer_assign, inner_scope, ret]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![f])).unwrap();
    let st = collapse(unit).unwrap();
    let func = &st.functions[0];

    let assign_targets: Vec<Symbol> = func.blocks.iter()
      .flat_map(|b| b.tac.iter())
      .filter(|l| l.op == crate::types::tac::TacOp::Assign)
      .filter_map(|l| l.d().and_then(|d| d.name.as_symbol()))
      .collect();
    assert_eq!(assign_targets.len(), 2);
    assert_ne!(assign_targets[0], assign_targets[1], "outer and inner `i` must not collapse onto the same mangled name");

    let returned = func.blocks.iter()
      .flat_map(|b| b.tac.iter())
      .find(|l| l.op == crate::types::tac::TacOp::Return)
      .and_then(|l| l.a().and_then(|a| a.name.as_symbol()));
    // `return i;` must still read the outer `i`, not the inner shadow's value.
    assert_eq!(returned, Some(assign_targets[0]));
  }
}
