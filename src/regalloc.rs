//! §3 "Lifetime" and §4.5 "Register allocator".
//!
//! Lifetime discovery walks a function's TAC in program order (blocks in
//! creation order, each block's lines in index order — together exactly the
//! monotonic per-function index space of §3) and extends one [`Lifetime`]
//! per operand name encountered. Assignment is the naive "level 0" allocator
//! §4.5 asks for: greedy first-fit over a fixed-size register pool, treating
//! each pool slot as an interval track and spilling to a downward-growing
//! stack region when no track's most recent occupant has already retired.

use hashbrown::HashMap;
use itertools::Itertools;
use smallvec::SmallVec;

use crate::error::{CompileError, Result};
use crate::symbol::Symbol;
use crate::types::symtab::{FunctionId, ScopeId, ScopeMemberKind, SymbolTable};
use crate::types::tac::{BasicBlock, Permutation, TacLine, TacOp};
use crate::types::ty::Type;

/// `x0`, reads as zero.
pub const ZERO: u8 = 0;
/// `x1`, return address.
pub const RA: u8 = 1;
/// `x2`, stack pointer.
pub const SP: u8 = 2;
/// `x8`, frame pointer.
pub const FP: u8 = 8;
/// Scratch registers reserved for codegen's own spill traffic (§4.5).
pub const SCRATCH: [u8; 3] = [5, 6, 7];
/// `x10` / `a0`, the return-value register.
pub const RETURN_REGISTER: u8 = 10;
/// First register in the general-purpose allocation pool.
pub const START_ALLOCATING_FROM: u8 = 11;
/// Total machine registers modeled by this target.
pub const MACHINE_REGISTER_COUNT: u8 = 32;

/// §3 GLOSSARY "Writeback location".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritebackLocation {
  Register,
  Stack,
  Global,
  /// Not yet decided by the allocator.
  Unknown,
}

/// §3 "Lifetime".
#[derive(Clone, Debug)]
pub struct Lifetime {
  pub name: Symbol,
  pub ty: Type,
  pub start: u32,
  pub end: u32,
  pub nreads: u32,
  pub nwrites: u32,
  pub wb_location: WritebackLocation,
  /// Positive for an argument's fixed `fp`-relative offset (never
  /// reassigned); negative once a spilled local/must-spill local is given a
  /// slot in the downward-growing local region.
  pub stack_location: i32,
  pub register_location: u8,
  pub is_argument: bool,
  pub must_spill: bool,
}

impl Lifetime {
  fn new(name: Symbol, ty: Type, index: u32, is_global: bool, must_spill: bool, is_argument: bool) -> Self {
    let wb_location = if is_global {
      WritebackLocation::Global
    } else if must_spill {
      // An address-taken local or argument must never become register-resident
      // (§4.5 "addresses-taken variables and globals must never be register-resident").
      WritebackLocation::Stack
    } else {
      // Arguments start out addressable at their declared positive offset;
      // the assignment pass may still promote a non-must-spill argument
      // into a register (§4.5 "arguments retain their positive-offset
      // stackLocation" only binds while `wbLocation == Stack`).
      WritebackLocation::Unknown
    };
    Lifetime {
      name, ty, start: index, end: index, nreads: 0, nwrites: 0,
      wb_location, stack_location: 0, register_location: 0, is_argument, must_spill,
    }
  }

  fn touch(&mut self, index: u32) {
    self.start = self.start.min(index);
    self.end = self.end.max(index);
  }

  /// Priority score for the greedy assignment pass: longer-lived and/or
  /// hotter lifetimes are assigned registers first (§4.5 "Assignment").
  fn priority(&self) -> u64 {
    u64::from(self.end - self.start) + u64::from(self.nreads + self.nwrites)
  }
}

/// §3 "CodegenMetadata", the per-function owner of regalloc's output.
pub struct CodegenMetadata {
  /// `None` for the global user-init pseudo-function (§10.6 item 4): the
  /// userstart block is allocated the same way a function body is, but it
  /// has no `FunctionId` of its own.
  pub function: Option<FunctionId>,
  pub lifetimes: HashMap<Symbol, Lifetime>,
  /// Index `i` holds every lifetime live at TAC index `i` (§4.5 "Liveness
  /// array"); built straight from `start`/`end`, independent of the final
  /// writeback decision.
  pub lifetime_overlaps: Vec<SmallVec<[Symbol; 8]>>,
  pub reserved_registers: [u8; 3],
  pub touched_registers: [bool; 32],
  pub local_stack_size: u32,
}

impl CodegenMetadata {
  #[must_use] pub fn lifetime(&self, name: Symbol) -> Option<&Lifetime> { self.lifetimes.get(&name) }
}

/// Look up whatever the symbol table knows about `name` as seen from
/// `scope`: `(is_global, must_spill, is_argument, existing_positive_stack_offset)`.
/// `function` is `None` for the global pseudo-function, where an `Argument`
/// match can never occur.
fn symbol_info(symtab: &SymbolTable, function: Option<FunctionId>, scope: ScopeId, name: Symbol) -> (bool, bool, bool, i32) {
  match symtab.lookup(scope, name) {
    Some(member) => match &member.kind {
      ScopeMemberKind::Variable(v) => (v.is_global, v.must_spill, false, 0),
      ScopeMemberKind::Argument(idx) => {
        let f = function.expect("argument entry found outside a function");
        let arg = &symtab.function(f).arguments[*idx];
        (false, arg.must_spill, true, arg.stack_offset)
      }
      // Temps and object-pointer scaffolding never reach the symbol table.
      _ => (false, false, false, 0),
    },
    // A compiler-generated temporary/object-pointer name.
    None => (false, false, false, 0),
  }
}

/// §4.5 "Lifetime discovery": walk every TAC line in program order, record
/// a read for each operand `op.read_operands()` names and a write for each
/// `op.write_operands()` names, extending that operand's [`Lifetime`].
pub fn discover_lifetimes(symtab: &SymbolTable, function: FunctionId) -> Result<HashMap<Symbol, Lifetime>> {
  let scope = symtab.function(function).main_scope;
  discover_lifetimes_over(symtab, Some(function), scope, &symtab.function(function).blocks)
}

fn discover_lifetimes_over(
  symtab: &SymbolTable, function: Option<FunctionId>, scope: ScopeId,
  blocks: &[BasicBlock],
) -> Result<HashMap<Symbol, Lifetime>> {
  let mut lifetimes: HashMap<Symbol, Lifetime> = HashMap::new();
  for block in blocks {
    for line in &block.tac {
      for &slot in line.op.read_operands() {
        touch_operand(symtab, function, scope, &mut lifetimes, line, slot, false)?;
      }
      for &slot in line.op.write_operands() {
        // `call`'s destination is only written when a return value was
        // requested (§4.3 "call"); skip the conditional slot otherwise.
        if line.op == TacOp::Call && line.operands[0].is_none() { continue }
        touch_operand(symtab, function, scope, &mut lifetimes, line, slot, true)?;
      }
    }
  }
  Ok(lifetimes)
}

fn touch_operand(
  symtab: &SymbolTable, function: Option<FunctionId>, scope: ScopeId,
  lifetimes: &mut HashMap<Symbol, Lifetime>, line: &TacLine, slot: usize, is_write: bool,
) -> Result<()> {
  let Some(operand) = &line.operands[slot] else { return Ok(()) };
  if operand.permutation == Permutation::Literal { return Ok(()) }
  let Some(name) = operand.name.as_symbol() else { return Ok(()) };
  let index = line.index;
  let lt = lifetimes.entry(name).or_insert_with(|| {
    let (is_global, must_spill, is_argument, stack_offset) = symbol_info(symtab, function, scope, name);
    let mut lt = Lifetime::new(name, operand.ty.clone(), index, is_global, must_spill, is_argument);
    if is_argument {
      lt.stack_location = stack_offset;
    }
    lt
  });
  lt.touch(index);
  if is_write { lt.nwrites += 1 } else { lt.nreads += 1 }
  Ok(())
}

/// §4.5 "Liveness array": a lifetime is live at index `i` iff
/// `start <= i <= end`.
fn build_liveness(lifetimes: &HashMap<Symbol, Lifetime>) -> Vec<SmallVec<[Symbol; 8]>> {
  let largest = lifetimes.values().map(|l| l.end).max().unwrap_or(0);
  let mut overlaps = vec![SmallVec::new(); largest as usize + 1];
  for lt in lifetimes.values() {
    for slot in &mut overlaps[lt.start as usize..=lt.end as usize] {
      slot.push(lt.name);
    }
  }
  overlaps
}

/// §4.5 "Assignment (level 0)": run discovery, then assign every lifetime a
/// writeback location. Returns the populated [`CodegenMetadata`]; the bytes
/// of local stack space it reports in `local_stack_size` is the §4.5
/// "Result" value (excluding saved registers and argument space).
pub fn allocate_registers(symtab: &SymbolTable, function: FunctionId) -> Result<CodegenMetadata> {
  let scope = symtab.function(function).main_scope;
  allocate_registers_over(symtab, Some(function), scope, &symtab.function(function).blocks)
}

/// The same assignment pass, run over the global user-init block (§10.6
/// item 4): globals are always `WritebackLocation::Global` already, so this
/// only ever has to place compiler temporaries introduced by top-level
/// statements (e.g. `x = x + 2` needs a temp for the intermediate sum).
pub fn allocate_registers_global(symtab: &SymbolTable) -> Result<CodegenMetadata> {
  let scope = symtab.global_scope;
  // Label 1 (the asm block) carries only `asm` lines, which read/write no
  // operands, so only the userstart block (label 0) needs allocation.
  let userstart = std::slice::from_ref(&symtab.global_blocks[0]);
  allocate_registers_over(symtab, None, scope, userstart)
}

fn allocate_registers_over(
  symtab: &SymbolTable, function: Option<FunctionId>, scope: ScopeId,
  blocks: &[BasicBlock],
) -> Result<CodegenMetadata> {
  let mut lifetimes = discover_lifetimes_over(symtab, function, scope, blocks)?;
  let lifetime_overlaps = build_liveness(&lifetimes);

  // Lifetimes already forced to stack/global keep that location (§4.5);
  // everything else competes for the general-purpose pool.
  let assignable: Vec<Symbol> = lifetimes.iter()
    .filter(|(_, lt)| lt.wb_location == WritebackLocation::Unknown)
    .map(|(name, _)| *name)
    .sorted_by(|a, b| {
      let (la, lb) = (&lifetimes[a], &lifetimes[b]);
      lb.priority().cmp(&la.priority())
        .then(la.start.cmp(&lb.start))
        .then(a.cmp(b))
    })
    .collect();

  let pool_size = usize::from(MACHINE_REGISTER_COUNT - START_ALLOCATING_FROM);
  let mut track_end: Vec<Option<u32>> = vec![None; pool_size];
  let mut touched_registers = [false; 32];
  let mut next_stack_offset: i32 = 0;

  for name in assignable {
    let (start, end, size) = {
      let lt = &lifetimes[&name];
      (lt.start, lt.end, lt.ty.size_of()?)
    };
    let track = track_end.iter().position(|last| match last { None => true, Some(e) => *e < start });
    if let Some(track) = track {
      track_end[track] = Some(end);
      let reg = START_ALLOCATING_FROM + u8::try_from(track).expect("pool_size < 256");
      touched_registers[usize::from(reg)] = true;
      let lt = lifetimes.get_mut(&name).expect("just looked up above");
      lt.wb_location = WritebackLocation::Register;
      lt.register_location = reg;
    } else {
      let lt = lifetimes.get_mut(&name).expect("just looked up above");
      lt.wb_location = WritebackLocation::Stack;
      if !lt.is_argument {
        next_stack_offset -= i32::try_from(size).map_err(|_| CompileError::internal("local too large for stack"))?;
        lt.stack_location = next_stack_offset;
      }
    }
  }

  // Lifetimes forced to `Stack` up front (must-spill locals that never
  // entered the `assignable` competition) still need a slot unless they're
  // an argument, which already owns its positive offset.
  for lt in lifetimes.values_mut() {
    if lt.wb_location == WritebackLocation::Stack && !lt.is_argument && lt.stack_location == 0 {
      next_stack_offset -= i32::try_from(lt.ty.size_of()?)
        .map_err(|_| CompileError::internal("local too large for stack"))?;
      lt.stack_location = next_stack_offset;
    }
  }

  Ok(CodegenMetadata {
    function,
    lifetimes,
    lifetime_overlaps,
    reserved_registers: SCRATCH,
    touched_registers,
    local_stack_size: u32::try_from(-next_stack_offset).expect("stack growth is never positive"),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::linearizer::Linearizer;
  use crate::scope_collapse::collapse;
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

  fn compile_and_collapse(p: Ast) -> SymbolTable {
    let unit = Linearizer::new().compile(&p).unwrap();
    collapse(unit).unwrap()
  }

  #[test]
  fn two_non_overlapping_locals_share_no_register_conflict() {
    // u8 a; a = 1; u8 b; b = 2; return a + b; -- in one function, sequential.
    let f = Ast::new(NodeKind::FunctionDef { name: "f".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
        Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
          Ast::new(NodeKind::Identifier("a".into()), span(), vec![]),
          Ast::new(NodeKind::IntConstant(1), span(), vec![]),
        ]),
        Ast::new(NodeKind::VariableDecl { name: "b".into() }, span(), vec![u8_type()]),
        Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
          Ast::new(NodeKind::Identifier("b".into()), span(), vec![]),
          Ast::new(NodeKind::IntConstant(2), span(), vec![]),
        ]),
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Binary(crate::types::ast::BinOp::Add), span(), vec![
            Ast::new(NodeKind::Identifier("a".into()), span(), vec![]),
            Ast::new(NodeKind::Identifier("b".into()), span(), vec![]),
          ]),
        ]),
      ]),
    ]);
    let st = compile_and_collapse(program(vec![f]));
    let fid = crate::types::symtab::FunctionId(0);
    let meta = allocate_registers(&st, fid).unwrap();
    let a = meta.lifetime(intern("00_a")).expect("a present");
    let b = meta.lifetime(intern("00_b")).expect("b present");
    assert_eq!(a.wb_location, WritebackLocation::Register);
    assert_eq!(b.wb_location, WritebackLocation::Register);
  }

  #[test]
  fn address_of_forces_stack_writeback() {
    // fun f(u8 a -> u8) { u8 x; x = 1; &x; return a; }
    let f = Ast::new(NodeKind::FunctionDef { name: "g".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]),
        Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
          Ast::new(NodeKind::Identifier("x".into()), span(), vec![]),
          Ast::new(NodeKind::IntConstant(1), span(), vec![]),
        ]),
        Ast::new(NodeKind::Unary(crate::types::ast::UnOp::AddrOf), span(), vec![
          Ast::new(NodeKind::Identifier("x".into()), span(), vec![]),
        ]),
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Identifier("a".into()), span(), vec![]),
        ]),
      ]),
    ]);
    let st = compile_and_collapse(program(vec![f]));
    let fid = crate::types::symtab::FunctionId(0);
    let meta = allocate_registers(&st, fid).unwrap();
    let x = meta.lifetime(intern("00_x")).expect("x present");
    assert_eq!(x.wb_location, WritebackLocation::Stack);
    assert!(x.stack_location < 0);
  }

  #[test]
  fn global_variable_referenced_from_a_function_never_migrates_off_global() {
    let decl = Ast::new(NodeKind::VariableDecl { name: "g".into() }, span(), vec![u8_type()]);
    let f = Ast::new(NodeKind::FunctionDef { name: "uses_global".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
          Ast::new(NodeKind::Identifier("g".into()), span(), vec![]),
          Ast::new(NodeKind::IntConstant(1), span(), vec![]),
        ]),
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Identifier("g".into()), span(), vec![]),
        ]),
      ]),
    ]);
    let st = compile_and_collapse(program(vec![decl, f]));
    let fid = crate::types::symtab::FunctionId(0);
    let meta = allocate_registers(&st, fid).unwrap();
    let g = meta.lifetime(intern("global_g")).expect("g present");
    assert_eq!(g.wb_location, WritebackLocation::Global);
  }

  #[test]
  fn priority_favors_longer_lived_lifetimes_for_register_pool_order() {
    let short = Lifetime::new(intern("short_lt"), Type::primitive(Basic::U8), 0, false, false, false);
    let mut long = Lifetime::new(intern("long_lt"), Type::primitive(Basic::U8), 0, false, false, false);
    long.touch(10);
    assert!(long.priority() > short.priority());
  }
}
