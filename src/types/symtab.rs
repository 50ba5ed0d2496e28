//! §3 "Scope"/"ScopeMember"/"Variable Entry"/"Function Entry"/"Class Entry"
//! and §4.2 scope/symbol operations.
//!
//! Scope and function entries form a cyclic graph (parent pointers back
//! into children that own them). Rather than `Rc<RefCell<_>>` cycles, this
//! follows the "forward edges own, back edges are ids" rule from §9: scopes,
//! functions, and classes live in flat arenas on [`SymbolTable`] and refer
//! to each other by small `Id` newtypes.

use hashbrown::HashMap;
use crate::error::{CompileError, Result};
use crate::symbol::{intern, Symbol};
use crate::types::ast::Span;
use crate::types::tac::BasicBlock;
use crate::types::ty::Type;

macro_rules! newtype_id {
  ($name:ident) => {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct $name(pub u32);
    impl $name {
      #[must_use] pub fn index(self) -> usize { self.0 as usize }
    }
  };
}

newtype_id!(ScopeId);
newtype_id!(FunctionId);
newtype_id!(ClassId);

/// §3 "Variable Entry".
#[derive(Clone, Debug)]
pub struct VariableEntry {
  pub name: Symbol,
  pub ty: Type,
  /// Positive for arguments (offset from `fp`, accounting for saved
  /// `ra`/`fp`), negative once assigned a local stack slot by regalloc,
  /// `0` until assigned.
  pub stack_offset: i32,
  pub declared_at: u32,
  /// `-1` until assigned (§3 models this as an `opt`; we use a sentinel to
  /// keep the struct `Copy`-friendly alongside the rest of the TAC index
  /// space, which never goes negative in practice).
  pub assigned_at: i32,
  pub is_assigned: bool,
  pub is_global: bool,
  /// Forced to stack/global writeback; see [`crate::types::tac::TacOp::AddrOf`].
  pub must_spill: bool,
}

impl VariableEntry {
  #[must_use] pub fn new(name: Symbol, ty: Type, declared_at: u32, is_global: bool) -> Self {
    VariableEntry {
      name, ty, stack_offset: 0, declared_at, assigned_at: -1,
      is_assigned: false, is_global, must_spill: false,
    }
  }
}

/// Which arena a hoisted/owned basic block lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOwner {
  Function(FunctionId),
  /// The global user-init (label 0) / asm (label 1) blocks.
  Global,
}

/// A reference to a basic block stored in its owner's block vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
  pub owner: BlockOwner,
  pub index: usize,
}

/// §3 "ScopeMember". Ordered (not keyed) so that insertion order drives
/// emission order and scope-collapse hoisting (§4.2).
#[derive(Clone, Debug)]
pub struct ScopeMember {
  pub name: Symbol,
  pub kind: ScopeMemberKind,
}

#[derive(Clone, Debug)]
pub enum ScopeMemberKind {
  Variable(VariableEntry),
  /// Index into the owning function's `arguments` vector.
  Argument(usize),
  Function(FunctionId),
  SubScope(ScopeId),
  BasicBlock(BlockRef),
  Class(ClassId),
}

/// §3 "Scope".
#[derive(Clone, Debug)]
pub struct Scope {
  pub parent: Option<ScopeId>,
  pub parent_function: Option<FunctionId>,
  pub entries: Vec<ScopeMember>,
  /// Ranges over `0..=256`; the valid two-hex-digit names are `00..ff`
  /// (256 of them), so `256` itself means "all names used, reject".
  pub sub_scope_count: u16,
  pub name: Symbol,
}

/// §3 "Function Entry".
#[derive(Clone, Debug)]
pub struct FunctionEntry {
  pub name: Symbol,
  pub return_type: Type,
  pub arguments: Vec<VariableEntry>,
  pub arg_stack_size: u32,
  pub main_scope: ScopeId,
  pub blocks: Vec<BasicBlock>,
  pub is_defined: bool,
  pub is_asm_fun: bool,
}

/// A class member's layout entry (§3 "Class Entry").
#[derive(Clone, Debug)]
pub struct MemberOffset {
  pub offset: u32,
  pub variable: VariableEntry,
}

/// §3 "Class Entry".
#[derive(Clone, Debug)]
pub struct ClassEntry {
  pub name: Symbol,
  pub members: ScopeId,
  /// Declaration-order member layout, naturally aligned to `min(4, size)`.
  pub member_offsets: HashMap<Symbol, MemberOffset>,
  pub member_order: Vec<Symbol>,
  pub total_size: u32,
}

impl ClassEntry {
  /// Assign the next member its cumulative, aligned offset (§3, §8
  /// testable property 4, §10.5).
  pub fn assign_member_offset(&mut self, var: VariableEntry) -> Result<()> {
    let size = var.ty.size_of()?;
    let align = size.min(4).max(1);
    let offset = align_to(self.total_size, align);
    let name = var.name;
    self.member_order.push(name);
    self.member_offsets.insert(name, MemberOffset { offset, variable: var });
    self.total_size = offset + size;
    Ok(())
  }
}

fn align_to(pos: u32, align: u32) -> u32 {
  if align == 0 { return pos }
  (pos + align - 1) / align * align
}

/// The symbol table proper: arenas plus a handle to the global scope.
#[derive(Debug)]
pub struct SymbolTable {
  pub scopes: Vec<Scope>,
  pub functions: Vec<FunctionEntry>,
  pub classes: Vec<ClassEntry>,
  pub global_scope: ScopeId,
  /// Owner of the reserved label-0/label-1 global blocks (§3).
  pub global_blocks: Vec<BasicBlock>,
}

impl SymbolTable {
  #[must_use] pub fn new() -> Self {
    let global = Scope {
      parent: None,
      parent_function: None,
      entries: Vec::new(),
      sub_scope_count: 0,
      name: intern("global"),
    };
    SymbolTable {
      scopes: vec![global],
      functions: Vec::new(),
      classes: Vec::new(),
      global_scope: ScopeId(0),
      global_blocks: Vec::new(),
    }
  }

  pub fn scope(&self, id: ScopeId) -> &Scope { &self.scopes[id.index()] }
  pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope { &mut self.scopes[id.index()] }
  pub fn function(&self, id: FunctionId) -> &FunctionEntry { &self.functions[id.index()] }
  pub fn function_mut(&mut self, id: FunctionId) -> &mut FunctionEntry { &mut self.functions[id.index()] }
  pub fn class(&self, id: ClassId) -> &ClassEntry { &self.classes[id.index()] }
  pub fn class_mut(&mut self, id: ClassId) -> &mut ClassEntry { &mut self.classes[id.index()] }

  /// §4.2 `insert`: fails if `name` already exists in this scope.
  pub fn insert(&mut self, scope: ScopeId, name: Symbol, kind: ScopeMemberKind, span: &Span) -> Result<()> {
    if self.scope(scope).entries.iter().any(|e| e.name == name) {
      return Err(CompileError::code(span.clone(), format!(
        "redefinition of `{name}` in scope `{}`", self.scope(scope).name)));
    }
    self.scope_mut(scope).entries.push(ScopeMember { name, kind });
    Ok(())
  }

  /// §4.2 `lookup`: walks the parent chain, returns the first match.
  #[must_use] pub fn lookup(&self, scope: ScopeId, name: Symbol) -> Option<&ScopeMember> {
    let mut cur = Some(scope);
    while let Some(id) = cur {
      let s = self.scope(id);
      if let Some(m) = s.entries.iter().find(|e| e.name == name) { return Some(m) }
      cur = s.parent;
    }
    None
  }

  /// Resolve a variable by walking the lookup chain and requiring the
  /// match to be a variable or argument.
  pub fn lookup_var(&self, scope: ScopeId, name: Symbol, span: &Span) -> Result<VariableEntry> {
    match self.lookup(scope, name) {
      Some(ScopeMember { kind: ScopeMemberKind::Variable(v), .. }) => Ok(v.clone()),
      Some(ScopeMember { kind: ScopeMemberKind::Argument(idx), .. }) => {
        let func = self.owning_function(scope)
          .ok_or_else(|| CompileError::internal("argument entry found outside a function"))?;
        Ok(self.function(func).arguments[*idx].clone())
      }
      Some(_) => Err(CompileError::code(span.clone(), format!("`{name}` is not a variable"))),
      None => Err(CompileError::code(span.clone(), format!("undeclared identifier `{name}`"))),
    }
  }

  pub fn lookup_fun(&self, scope: ScopeId, name: Symbol, span: &Span) -> Result<FunctionId> {
    match self.lookup(scope, name) {
      Some(ScopeMember { kind: ScopeMemberKind::Function(f), .. }) => Ok(*f),
      Some(_) => Err(CompileError::code(span.clone(), format!("`{name}` is not a function"))),
      None => Err(CompileError::code(span.clone(), format!("undeclared function `{name}`"))),
    }
  }

  pub fn lookup_class(&self, scope: ScopeId, name: Symbol, span: &Span) -> Result<ClassId> {
    match self.lookup(scope, name) {
      Some(ScopeMember { kind: ScopeMemberKind::Class(c), .. }) => Ok(*c),
      Some(_) => Err(CompileError::code(span.clone(), format!("`{name}` is not a class"))),
      None => Err(CompileError::code(span.clone(), format!("undeclared class `{name}`"))),
    }
  }

  /// Find the function that owns `scope`, walking up through sub-scopes.
  #[must_use] pub fn owning_function(&self, scope: ScopeId) -> Option<FunctionId> {
    let mut cur = Some(scope);
    while let Some(id) = cur {
      let s = self.scope(id);
      if let Some(f) = s.parent_function { return Some(f) }
      cur = s.parent;
    }
    None
  }

  /// §4.2 `createSubScope`: assigns a two-hex-digit name `00..ff` from the
  /// parent's counter; fails past `ff` (§8 "Sub-scope count exceeding 255
  /// is rejected").
  pub fn create_sub_scope(&mut self, parent: ScopeId, span: &Span) -> Result<ScopeId> {
    let count = self.scope(parent).sub_scope_count;
    if count > 0xff {
      return Err(CompileError::code(span.clone(), "too many sub-scopes (limit 256)"));
    }
    let name = intern(&format!("{count:02x}"));
    self.scope_mut(parent).sub_scope_count += 1;
    let parent_function = self.scope(parent).parent_function;
    let new_id = ScopeId(u32::try_from(self.scopes.len()).expect("scope arena overflow"));
    self.scopes.push(Scope {
      parent: Some(parent), parent_function, entries: Vec::new(), sub_scope_count: 0, name,
    });
    self.insert(parent, name, ScopeMemberKind::SubScope(new_id), span)?;
    Ok(new_id)
  }

  /// §4.2 `createVariable`. Arguments get `stackOffset = argStackSize + 8`
  /// (saved `ra`/`fp`) and bump `argStackSize`; they are immediately
  /// `isAssigned=true, assignedAt=0`.
  pub fn create_variable(
    &mut self, scope: ScopeId, name: Symbol, ty: Type, is_global: bool,
    declared_at: u32, is_argument: bool, span: &Span,
  ) -> Result<()> {
    let mut var = VariableEntry::new(name, ty, declared_at, is_global);
    if is_argument {
      let func_id = self.scope(scope).parent_function
        .ok_or_else(|| CompileError::internal("argument declared outside a function"))?;
      let func = self.function_mut(func_id);
      var.stack_offset = i32::try_from(func.arg_stack_size).expect("arg stack overflow") + 8;
      var.is_assigned = true;
      var.assigned_at = 0;
      func.arg_stack_size += var.ty.size_of()?;
      let idx = func.arguments.len();
      func.arguments.push(var);
      self.insert(scope, name, ScopeMemberKind::Argument(idx), span)
    } else {
      self.insert(scope, name, ScopeMemberKind::Variable(var), span)
    }
  }

  /// §4.2 `createFunction`: if a prototype already exists the caller
  /// reconciles (see `linearizer::declare_or_define_function`); this
  /// inserts a brand new entry.
  pub fn create_function(
    &mut self, scope: ScopeId, name: Symbol, return_type: Type, span: &Span,
  ) -> Result<FunctionId> {
    let main_scope = ScopeId(u32::try_from(self.scopes.len()).expect("scope arena overflow"));
    self.scopes.push(Scope {
      parent: Some(scope), parent_function: None, entries: Vec::new(), sub_scope_count: 0, name,
    });
    let id = FunctionId(u32::try_from(self.functions.len()).expect("function arena overflow"));
    self.scope_mut(main_scope).parent_function = Some(id);
    self.functions.push(FunctionEntry {
      name, return_type, arguments: Vec::new(), arg_stack_size: 0,
      main_scope, blocks: Vec::new(), is_defined: false, is_asm_fun: false,
    });
    self.insert(scope, name, ScopeMemberKind::Function(id), span)?;
    Ok(id)
  }

  /// §4.2 `createClass`: a class owns its own member scope, nested exactly
  /// like a sub-scope (§10.5).
  pub fn create_class(&mut self, scope: ScopeId, name: Symbol, span: &Span) -> Result<ClassId> {
    let members = ScopeId(u32::try_from(self.scopes.len()).expect("scope arena overflow"));
    self.scopes.push(Scope {
      parent: Some(scope), parent_function: None, entries: Vec::new(), sub_scope_count: 0, name,
    });
    let id = ClassId(u32::try_from(self.classes.len()).expect("class arena overflow"));
    self.classes.push(ClassEntry {
      name, members, member_offsets: HashMap::new(), member_order: Vec::new(), total_size: 0,
    });
    self.insert(scope, name, ScopeMemberKind::Class(id), span)?;
    Ok(id)
  }

  /// §4.2 `addBasicBlock`: inserts under the synthetic name `"Block{N}"`
  /// and, if we are inside a function, appends to that function's ordered
  /// block list; otherwise appends to the global block arena.
  pub fn add_basic_block(&mut self, scope: ScopeId, block: BasicBlock, span: &Span) -> Result<BlockRef> {
    let label = block.label_num;
    let owner_fn = self.scope(scope).parent_function;
    let block_ref = if let Some(f) = owner_fn {
      let func = self.function_mut(f);
      let index = func.blocks.len();
      func.blocks.push(block);
      BlockRef { owner: BlockOwner::Function(f), index }
    } else {
      let index = self.global_blocks.len();
      self.global_blocks.push(block);
      BlockRef { owner: BlockOwner::Global, index }
    };
    let name = intern(&format!("Block{label}"));
    self.insert(scope, name, ScopeMemberKind::BasicBlock(block_ref), span)?;
    Ok(block_ref)
  }

  pub fn block(&self, r: BlockRef) -> &BasicBlock {
    match r.owner {
      BlockOwner::Function(f) => &self.function(f).blocks[r.index],
      BlockOwner::Global => &self.global_blocks[r.index],
    }
  }

  pub fn block_mut(&mut self, r: BlockRef) -> &mut BasicBlock {
    match r.owner {
      BlockOwner::Function(f) => &mut self.function_mut(f).blocks[r.index],
      BlockOwner::Global => &mut self.global_blocks[r.index],
    }
  }
}

impl Default for SymbolTable {
  fn default() -> Self { Self::new() }
}

/// §4.2 "Name mangling": `mangle(scope,name) = "{scopeName}_{name}"`, interned.
#[must_use] pub fn mangle(scope_name: Symbol, name: Symbol) -> Symbol {
  intern(&format!("{scope_name}_{name}"))
}
