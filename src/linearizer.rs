//! §4.4: the AST walker that lowers a typed AST into TAC over basic blocks.
//!
//! Per the `FunctionBuilder` recommendation in §9 "Control-flow pattern",
//! the monotonic `TACIndex`/`tempNum`/label counters threaded through the
//! walk are owned by [`FnCtx`] rather than passed around as loose mutable
//! integers.

use std::collections::HashMap;
use std::rc::Rc;
use if_chain::if_chain;
use crate::error::{CompileError, Result};
use crate::symbol::{intern, Symbol};
use crate::types::ast::{Ast, AssignOp, BasicTypeName, BinOp, NodeKind, Span, TypeName, UnOp};
use crate::types::symtab::{
  BlockRef, ClassId, FunctionId, ScopeId, ScopeMemberKind, SymbolTable, VariableEntry,
};
use crate::types::tac::{BasicBlock, OperandName, Permutation, TacLine, TacOp, TacOperand};
use crate::types::ty::{Basic, Type};

/// Per-function (or per-global-unit) linearization state: the monotonic
/// counters from §4.4 plus the basic block currently being appended to.
struct FnCtx {
  scope: ScopeId,
  function: Option<FunctionId>,
  tac_index: u32,
  temp_num: u32,
  next_label: u32,
  cur_block: BasicBlock,
}

impl FnCtx {
  fn new(scope: ScopeId, function: Option<FunctionId>) -> Self {
    FnCtx { scope, function, tac_index: 0, temp_num: 0, next_label: 1, cur_block: BasicBlock::new(0) }
  }

  fn next_index(&mut self) -> u32 {
    let i = self.tac_index;
    self.tac_index += 1;
    i
  }

  fn new_temp(&mut self, ty: Type) -> TacOperand {
    let name = intern(&format!(".t{}", self.temp_num));
    self.temp_num += 1;
    TacOperand::temp(name, ty)
  }

  /// An object-pointer temporary (§3 `Permutation::ObjPtr`): the address
  /// scaffolding produced while resolving a `.`/`->` chain, as opposed to
  /// an ordinary arithmetic temp.
  fn new_objptr(&mut self, ty: Type) -> TacOperand {
    let name = intern(&format!(".t{}", self.temp_num));
    self.temp_num += 1;
    TacOperand::objptr(name, ty)
  }

  fn new_label(&mut self) -> u32 {
    let l = self.next_label;
    self.next_label += 1;
    l
  }

  fn emit(&mut self, op: TacOp, span: &Span) -> LineBuilder<'_> {
    let index = self.next_index();
    LineBuilder { ctx: self, line: TacLine::new(op, index, Some(span.clone())) }
  }
}

/// A fluent helper so call sites read `ctx.emit(op, span).d(x).a(y).push()`
/// instead of repeating `.with_operand(N, ..)` chains.
struct LineBuilder<'a> { ctx: &'a mut FnCtx, line: TacLine }

impl LineBuilder<'_> {
  fn d(mut self, o: TacOperand) -> Self { self.line.operands[0] = Some(o); self }
  fn a(mut self, o: TacOperand) -> Self { self.line.operands[1] = Some(o); self }
  fn b(mut self, o: TacOperand) -> Self { self.line.operands[2] = Some(o); self }
  fn c(mut self, o: TacOperand) -> Self { self.line.operands[3] = Some(o); self }
  fn push(self) { self.ctx.cur_block.push(self.line) }
}

/// The shape of a resolved member-access base: whether it denotes an
/// inline (value) class instance or a class pointer. Drives `.`/`->`
/// validation and the `lea_off`-vs-`load_off` choice of §4.4.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BaseShape { Value, Pointer }

/// The result of linearization: the populated symbol table plus, for each
/// sub-scope created during the walk, the `[start, end)` range of the
/// owning function's monotonic `tac_index` values emitted while that
/// sub-scope was the innermost scope in effect.
///
/// Scope-collapse needs this because variable names are interned
/// context-free: two sibling sub-scopes that each declare `i` (e.g. an
/// `if`/`else` pair that both do `u8 i = ...;`) share one `Symbol`, so a
/// rename pass that matched purely by name across the whole function would
/// misattribute one branch's uses to the other's mangled name. Restricting
/// each scope's rename to its own index range keeps the two `i`s apart.
pub struct LinearizedUnit {
  pub symtab: SymbolTable,
  pub scope_tac_ranges: HashMap<ScopeId, (u32, u32)>,
}

/// Lowers one translation unit's AST into a populated [`SymbolTable`].
pub struct Linearizer {
  pub symtab: SymbolTable,
  global_ctx: FnCtx,
  asm_block_started: bool,
  scope_tac_ranges: HashMap<ScopeId, (u32, u32)>,
}

impl Linearizer {
  #[must_use] pub fn new() -> Self {
    let symtab = SymbolTable::new();
    let global_scope = symtab.global_scope;
    Linearizer {
      symtab,
      global_ctx: FnCtx::new(global_scope, None),
      asm_block_started: false,
      scope_tac_ranges: HashMap::new(),
    }
  }

  /// Lower a whole program (§4.4 top level) and finish (§4.2 post-condition:
  /// every block's TAC indices are contiguous).
  pub fn compile(mut self, program: &Ast) -> Result<LinearizedUnit> {
    for decl in &program.children {
      self.walk_top_level(decl)?;
    }
    self.seal_global_blocks()?;
    for f in &self.symtab.functions {
      // Every block in a function shares one running index counter (see
      // `FnCtx::next_index`), so the whole function's blocks, concatenated
      // in order, must be gap-free -- not just each block on its own.
      crate::types::tac::check_monotonic_indices_across(&f.blocks)?;
    }
    // The user-init and global-asm blocks are independent sections (§3),
    // each with its own index numbering, so they're checked individually.
    for b in &self.symtab.global_blocks { b.check_monotonic_indices()?; }
    Ok(LinearizedUnit { symtab: self.symtab, scope_tac_ranges: self.scope_tac_ranges })
  }

  fn seal_global_blocks(&mut self) -> Result<()> {
    let scope = self.global_ctx.scope;
    let span = Span { file: "<global>".into(), line: 0, col: 0 };
    if let Ok(main_fid) = self.symtab.lookup_fun(scope, intern("main"), &span) {
      if self.symtab.function(main_fid).is_defined {
        // Restores the "execute main" behavior the original's dead
        // `CALL_MAIN_BLOCK` only ever intended, instead of leaving it unused.
        let index = self.global_ctx.cur_block.tac.len() as u32;
        self.global_ctx.cur_block.push(TacLine::new(TacOp::Call, index, Some(span.clone()))
          .with_operand(1, literal_str_operand("main")));
      }
    }
    log::debug!("sealing global user-init block with {} TAC lines", self.global_ctx.cur_block.tac.len());
    let block = std::mem::replace(&mut self.global_ctx.cur_block, BasicBlock::new(0));
    self.symtab.add_basic_block(scope, block, &span)?;
    if !self.asm_block_started {
      self.symtab.add_basic_block(scope, BasicBlock::new(1), &span)?;
    }
    Ok(())
  }

  fn walk_top_level(&mut self, node: &Ast) -> Result<()> {
    match &node.kind {
      NodeKind::VariableDecl { name } => self.walk_global_variable_decl(node, name.clone()),
      NodeKind::FunctionDef { name, is_asm } => self.walk_function(node, name.clone(), *is_asm),
      NodeKind::ClassDecl { name } => self.walk_class_decl(node, name.clone()),
      NodeKind::AsmLine { text } => self.walk_global_asm_line(node, text.clone()),
      _ => {
        // A bare statement at global scope (S2: `x = 1; x = x + 2;`).
        let global_scope = self.symtab.global_scope;
        let mut ctx = std::mem::replace(&mut self.global_ctx, FnCtx::new(global_scope, None));
        // Preserve counters across the swap.
        ctx = FnCtx { scope: global_scope, function: None, ..ctx };
        self.walk_statement(&mut ctx, global_scope, node)?;
        self.global_ctx = ctx;
        Ok(())
      }
    }
  }

  fn walk_global_asm_line(&mut self, node: &Ast, text: Rc<str>) -> Result<()> {
    let scope = self.symtab.global_scope;
    if !self.asm_block_started {
      self.asm_block_started = true;
      let mut block = BasicBlock::new(1);
      block.push(TacLine::new(TacOp::Asm, 0, Some(node.span.clone()))
        .with_operand(0, literal_str_operand(&text)));
      self.symtab.add_basic_block(scope, block, &node.span)?;
    } else {
      let block_ref = self.global_asm_block_ref()?;
      let index = self.symtab.block(block_ref).tac.len() as u32;
      self.symtab.block_mut(block_ref).push(
        TacLine::new(TacOp::Asm, index, Some(node.span.clone()))
          .with_operand(0, literal_str_operand(&text)));
    }
    Ok(())
  }

  fn global_asm_block_ref(&self) -> Result<BlockRef> {
    let scope = self.symtab.global_scope;
    match self.symtab.lookup(scope, intern("Block1")) {
      Some(m) => match &m.kind {
        ScopeMemberKind::BasicBlock(r) => Ok(*r),
        _ => Err(CompileError::internal("Block1 is not a basic block")),
      },
      None => Err(CompileError::internal("global asm block not yet created")),
    }
  }

  fn walk_global_variable_decl(&mut self, node: &Ast, name: Rc<str>) -> Result<()> {
    let ty = type_from_ast(node.child(0))?;
    let sym = intern(&name);
    self.symtab.create_variable(self.symtab.global_scope, sym, ty, true, 0, false, &node.span)?;
    Ok(())
  }

  fn walk_class_decl(&mut self, node: &Ast, name: Rc<str>) -> Result<()> {
    let sym = intern(&name);
    let class_id = self.symtab.create_class(self.symtab.global_scope, sym, &node.span)?;
    let members_scope = self.symtab.class(class_id).members;
    for member in &node.children {
      if let NodeKind::VariableDecl { name: mname } = &member.kind {
        let mty = type_from_ast(member.child(0))?;
        if mty.is_value_class() && mty.class_name.as_deref() == Some(name.as_ref()) {
          return Err(CompileError::code(member.span.clone(),
            "class cannot contain itself by value"));
        }
        let msym = intern(mname);
        let var = VariableEntry::new(msym, mty, 0, false);
        self.symtab.insert(members_scope, msym, ScopeMemberKind::Variable(var.clone()), &member.span)?;
        self.symtab.class_mut(class_id).assign_member_offset(var)?;
      }
    }
    Ok(())
  }

  fn walk_function(&mut self, node: &Ast, name: Rc<str>, is_asm: bool) -> Result<()> {
    let sym = intern(&name);
    let ret_ty = type_from_ast(node.child(0))?;
    let has_body = node.children.last().is_some_and(|c| c.kind == NodeKind::Scope);
    let arg_nodes: Vec<&Ast> = node.children[1..node.children.len() - usize::from(has_body)]
      .iter().collect();

    let existing = self.symtab.lookup(self.symtab.global_scope, sym)
      .and_then(|m| if let ScopeMemberKind::Function(f) = &m.kind { Some(*f) } else { None });
    let fid = if let Some(fid) = existing {
      let func = self.symtab.function(fid);
      if func.is_defined && has_body {
        return Err(CompileError::code(node.span.clone(),
          format!("redefinition of function `{name}`")));
      }
      if !func.return_type.structurally_eq(&ret_ty) || func.arguments.len() != arg_nodes.len() {
        return Err(CompileError::code(node.span.clone(),
          format!("conflicting prototype for `{name}`: declared {:?}, now {:?}",
            func.return_type, ret_ty)));
      }
      fid
    } else {
      self.symtab.create_function(self.symtab.global_scope, sym, ret_ty, &node.span)?
    };

    if !has_body {
      return Ok(());
    }

    log::debug!("linearizing function `{name}`");
    let main_scope = self.symtab.function(fid).main_scope;
    for arg in &arg_nodes {
      if let NodeKind::VariableDecl { name: aname } = &arg.kind {
        let aty = type_from_ast(arg.child(0))?;
        self.symtab.create_variable(main_scope, intern(aname), aty, false, 0, true, &arg.span)?;
      }
    }

    self.symtab.function_mut(fid).is_defined = true;
    self.symtab.function_mut(fid).is_asm_fun = is_asm;

    let mut ctx = FnCtx::new(main_scope, Some(fid));
    let body = node.children.last().expect("has_body checked above");
    if is_asm {
      for line in &body.children {
        if let NodeKind::AsmLine { text } = &line.kind {
          ctx.emit(TacOp::Asm, &line.span).d(literal_str_operand(text)).push();
        }
      }
    } else {
      self.walk_scope_body(&mut ctx, main_scope, body)?;
    }
    let block = std::mem::replace(&mut ctx.cur_block, BasicBlock::new(0));
    self.symtab.add_basic_block(main_scope, block, &node.span)?;
    Ok(())
  }

  /// Walk the statements of a `{ ... }` scope, in a fresh sub-scope.
  fn walk_scope_body(&mut self, ctx: &mut FnCtx, parent_scope: ScopeId, scope_ast: &Ast) -> Result<()> {
    let sub = self.symtab.create_sub_scope(parent_scope, &scope_ast.span)?;
    let start = ctx.tac_index;
    for stmt in &scope_ast.children {
      self.walk_statement(ctx, sub, stmt)?;
    }
    self.scope_tac_ranges.insert(sub, (start, ctx.tac_index));
    Ok(())
  }

  fn walk_statement(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<()> {
    match &node.kind {
      NodeKind::VariableDecl { name } => {
        let ty = type_from_ast(node.child(0))?;
        self.symtab.create_variable(scope, intern(name), ty, false,
          ctx.tac_index, false, &node.span)?;
        Ok(())
      }
      NodeKind::Scope => self.walk_scope_body(ctx, scope, node),
      NodeKind::If => self.walk_if(ctx, scope, node),
      NodeKind::While => self.walk_while(ctx, scope, node),
      NodeKind::Return => self.walk_return(ctx, scope, node),
      NodeKind::AsmLine { text } => {
        ctx.emit(TacOp::Asm, &node.span).d(literal_str_operand(text)).push();
        Ok(())
      }
      NodeKind::Assign(op) => self.walk_assignment(ctx, scope, node, *op),
      _ => {
        // A bare expression statement (e.g. a call for side effects).
        self.walk_expr(ctx, scope, node, false)?;
        Ok(())
      }
    }
  }

  // ---- control flow (§4.4) ----

  fn walk_if(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<()> {
    let cond = node.child(0);
    let then_branch = node.child(1);
    let else_branch = node.children.get(2);
    let join_label = ctx.new_label();
    let else_label = if else_branch.is_some() { ctx.new_label() } else { join_label };

    self.walk_condition_check(ctx, scope, cond, else_label)?;
    let true_label = ctx.new_label();
    let sealed = std::mem::replace(&mut ctx.cur_block, BasicBlock::new(true_label));
    self.seal_function_block(ctx, sealed, &node.span)?;

    self.walk_scope_or_stmt(ctx, scope, then_branch)?;
    ctx.emit(TacOp::Jmp, &node.span).d(TacOperand::label(join_label)).push();
    let then_block = std::mem::replace(&mut ctx.cur_block,
      BasicBlock::new(if else_branch.is_some() { else_label } else { join_label }));
    self.seal_function_block(ctx, then_block, &node.span)?;

    if let Some(else_branch) = else_branch {
      self.walk_scope_or_stmt(ctx, scope, else_branch)?;
      ctx.emit(TacOp::Jmp, &node.span).d(TacOperand::label(join_label)).push();
      let else_block = std::mem::replace(&mut ctx.cur_block, BasicBlock::new(join_label));
      self.seal_function_block(ctx, else_block, &node.span)?;
    }
    Ok(())
  }

  fn walk_while(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<()> {
    let cond = node.child(0);
    let body = node.child(1);
    let header_label = ctx.new_label();
    let exit_label = ctx.new_label();

    ctx.emit(TacOp::Jmp, &node.span).d(TacOperand::label(header_label)).push();
    let prev = std::mem::replace(&mut ctx.cur_block, BasicBlock::new(header_label));
    self.seal_function_block(ctx, prev, &node.span)?;

    ctx.emit(TacOp::Do, &node.span).push();
    self.walk_condition_check(ctx, scope, cond, exit_label)?;
    self.walk_scope_or_stmt(ctx, scope, body)?;
    ctx.emit(TacOp::Jmp, &node.span).d(TacOperand::label(header_label)).push();

    let header_block = std::mem::replace(&mut ctx.cur_block, BasicBlock::new(exit_label));
    self.seal_function_block(ctx, header_block, &node.span)?;
    ctx.emit(TacOp::EndDo, &node.span).push();
    Ok(())
  }

  fn walk_scope_or_stmt(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<()> {
    if node.kind == NodeKind::Scope { self.walk_scope_body(ctx, scope, node) }
    else { self.walk_statement(ctx, scope, node) }
  }

  fn seal_function_block(&mut self, ctx: &mut FnCtx, block: BasicBlock, span: &Span) -> Result<()> {
    self.symtab.add_basic_block(ctx.scope, block, span)?;
    Ok(())
  }

  fn walk_return(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<()> {
    if let Some(expr) = node.first_child() {
      let v = self.walk_expr(ctx, scope, expr, true)?;
      ctx.emit(TacOp::Return, &node.span).a(v).push();
    } else {
      ctx.emit(TacOp::Return, &node.span).push();
    }
    Ok(())
  }

  /// §4.4 "Condition lowering": emit a branch that jumps to `false_label`
  /// when `cond` is false, using the authoritative inverse table.
  fn walk_condition_check(&mut self, ctx: &mut FnCtx, scope: ScopeId, cond: &Ast, false_label: u32) -> Result<()> {
    match &cond.kind {
      NodeKind::Binary(op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge)) => {
        let a = self.walk_expr(ctx, scope, cond.child(0), true)?;
        let b = self.walk_expr(ctx, scope, cond.child(1), true)?;
        let inverse = match op {
          BinOp::Eq => TacOp::Bne,
          BinOp::Ne => TacOp::Beq,
          BinOp::Lt => TacOp::Bgeu,
          BinOp::Gt => TacOp::Bleu,
          BinOp::Le => TacOp::Bgtu,
          BinOp::Ge => TacOp::Bltu,
          _ => unreachable!(),
        };
        ctx.emit(inverse, &cond.span).d(TacOperand::label(false_label)).a(a).b(b).push();
        Ok(())
      }
      NodeKind::Unary(UnOp::Not) => {
        let v = self.walk_expr(ctx, scope, cond.child(0), true)?;
        ctx.emit(TacOp::Bnez, &cond.span).d(TacOperand::label(false_label)).a(v).push();
        Ok(())
      }
      NodeKind::Binary(BinOp::And) => {
        self.walk_condition_check(ctx, scope, cond.child(0), false_label)?;
        self.walk_condition_check(ctx, scope, cond.child(1), false_label)
      }
      NodeKind::Binary(BinOp::Or) => {
        let continue_label = ctx.new_label();
        self.walk_condition_true_shortcircuit(ctx, scope, cond.child(0), continue_label)?;
        self.walk_condition_check(ctx, scope, cond.child(1), false_label)?;
        let fallthrough = std::mem::replace(&mut ctx.cur_block, BasicBlock::new(continue_label));
        self.seal_function_block(ctx, fallthrough, &cond.span)?;
        Ok(())
      }
      _ => {
        let v = self.walk_expr(ctx, scope, cond, true)?;
        ctx.emit(TacOp::Beqz, &cond.span).d(TacOperand::label(false_label)).a(v).push();
        Ok(())
      }
    }
  }

  /// Branch-on-true helper used only to short-circuit the left operand of
  /// `||`: jump to `true_label` without evaluating the right operand.
  fn walk_condition_true_shortcircuit(&mut self, ctx: &mut FnCtx, scope: ScopeId, cond: &Ast, true_label: u32) -> Result<()> {
    match &cond.kind {
      NodeKind::Binary(op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge)) => {
        let a = self.walk_expr(ctx, scope, cond.child(0), true)?;
        let b = self.walk_expr(ctx, scope, cond.child(1), true)?;
        let direct = match op {
          BinOp::Eq => TacOp::Beq,
          BinOp::Ne => TacOp::Bne,
          BinOp::Lt => TacOp::Bltu,
          BinOp::Gt => TacOp::Bgtu,
          BinOp::Le => TacOp::Bleu,
          BinOp::Ge => TacOp::Bgeu,
          _ => unreachable!(),
        };
        ctx.emit(direct, &cond.span).d(TacOperand::label(true_label)).a(a).b(b).push();
        Ok(())
      }
      _ => {
        let v = self.walk_expr(ctx, scope, cond, true)?;
        ctx.emit(TacOp::Bnez, &cond.span).d(TacOperand::label(true_label)).a(v).push();
        Ok(())
      }
    }
  }

  // ---- expressions (§4.4) ----

  fn walk_expr(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast, rvalue: bool) -> Result<TacOperand> {
    match &node.kind {
      NodeKind::IntConstant(v) => Ok(TacOperand::literal(i64::from(*v), Type::primitive(Basic::U32))),
      NodeKind::CharLiteral(c) => Ok(TacOperand::literal(i64::from(*c), Type::primitive(Basic::U8))),
      NodeKind::StringLiteral(s) => self.intern_string_literal(s, &node.span),
      NodeKind::Identifier(name) => {
        let var = self.symtab.lookup_var(scope, intern(name), &node.span)?;
        let operand = TacOperand::standard(var.name, var.ty.clone());
        Ok(if rvalue { operand.decayed() } else { operand })
      }
      NodeKind::Binary(BinOp::And | BinOp::Or) =>
        Err(CompileError::internal("logical operators must be lowered via walk_condition_check")),
      NodeKind::Binary(op) => self.walk_binary(ctx, scope, node, *op),
      NodeKind::Unary(op) => self.walk_unary(ctx, scope, node, *op),
      NodeKind::Index => self.walk_index(ctx, scope, node),
      NodeKind::Member { .. } => self.walk_member_read(ctx, scope, node),
      // `rvalue` is false only at the bare-statement fallback in
      // `walk_statement`; everywhere else an expression position wants the
      // call's value, matching `walk_call`'s own `want_value` contract.
      NodeKind::Call { name } => self.walk_call(ctx, scope, node, name, rvalue),
      _ => Err(CompileError::internal(format!("unexpected node in expression position: {:?}", node.kind))),
    }
  }

  fn intern_string_literal(&mut self, s: &str, span: &Span) -> Result<TacOperand> {
    let mangled = mangle_string_literal(s);
    let ty = {
      let mut t = Type::primitive(Basic::U8);
      t.array_size = u32::try_from(s.len() + 1).expect("string too long");
      let mut bytes: Vec<u8> = s.bytes().collect();
      bytes.push(0);
      t.initializer_bytes = Some(bytes.into());
      t
    };
    if self.symtab.lookup(self.symtab.global_scope, mangled).is_none() {
      self.symtab.create_variable(self.symtab.global_scope, mangled, ty.clone(), true, 0, false, span)?;
    }
    Ok(TacOperand::standard(mangled, ty).decayed())
  }

  fn walk_binary(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast, op: BinOp) -> Result<TacOperand> {
    let mut a = self.walk_expr(ctx, scope, node.child(0), true)?;
    let mut b = self.walk_expr(ctx, scope, node.child(1), true)?;
    if matches!(op, BinOp::Add | BinOp::Sub) {
      if a.ty.is_pointer() && b.ty.is_pointer() {
        return Err(CompileError::code(node.span.clone(), "arithmetic between two pointers is not allowed"));
      }
      if a.ty.is_pointer() && !b.ty.is_pointer() {
        b = self.scale_for_pointer_arith(ctx, &a.ty, b, &node.span)?;
      } else if b.ty.is_pointer() && !a.ty.is_pointer() {
        a = self.scale_for_pointer_arith(ctx, &b.ty, a, &node.span)?;
      }
    }
    let result_ty = wider(&a.ty, &b.ty);
    let tac_op = match op {
      BinOp::Add => TacOp::Add,
      BinOp::Sub => TacOp::Subtract,
      BinOp::Mul => TacOp::Mul,
      BinOp::Div => TacOp::Div,
      BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge =>
        return Err(CompileError::code(node.span.clone(),
          "comparison operators may only appear directly in an if/while condition")),
      BinOp::And | BinOp::Or => unreachable!(),
    };
    let dest = ctx.new_temp(result_ty);
    ctx.emit(tac_op, &node.span).d(dest.clone()).a(a).b(b).push();
    Ok(dest)
  }

  /// "the non-pointer operand is first multiplied by `sizeOfDereferenced`"
  /// (§4.4), realizing pointer arithmetic via a scale-multiplication `mul`.
  fn scale_for_pointer_arith(&mut self, ctx: &mut FnCtx, ptr_ty: &Type, operand: TacOperand, span: &Span) -> Result<TacOperand> {
    let elem_size = ptr_ty.size_of_dereferenced()?;
    let dest = ctx.new_temp(operand.ty.clone());
    ctx.emit(TacOp::Mul, span).d(dest.clone()).a(operand)
      .b(TacOperand::literal(i64::from(elem_size), Type::primitive(Basic::U32))).push();
    Ok(dest)
  }

  fn walk_unary(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast, op: UnOp) -> Result<TacOperand> {
    match op {
      UnOp::Deref => self.walk_dereference(ctx, scope, node.child(0)),
      UnOp::AddrOf => self.walk_address_of(ctx, scope, node.child(0)),
      UnOp::Neg => {
        let v = self.walk_expr(ctx, scope, node.child(0), true)?;
        let zero = TacOperand::literal(0, v.ty.clone());
        let dest = ctx.new_temp(v.ty.clone());
        ctx.emit(TacOp::Subtract, &node.span).d(dest.clone()).a(zero).b(v).push();
        Ok(dest)
      }
      UnOp::Not | UnOp::BitNot => {
        // Neither has a TAC opcode that produces a 0/1 value directly (the
        // opcode table only has branch forms, `beqz`/`bnez`); `!`/`~` are
        // only meaningful as an if/while condition.
        Err(CompileError::code(node.span.clone(),
          "`!`/`~` may only appear directly in an if/while condition, not as a value"))
      }
    }
  }

  /// `*e` (§4.4 "Dereference").
  fn walk_dereference(&mut self, ctx: &mut FnCtx, scope: ScopeId, inner: &Ast) -> Result<TacOperand> {
    // Fuse `*(p + i)` / `*(p - i)` directly into `load_off`/`load_arr`
    // rather than materializing the pointer-arithmetic temp first.
    if let NodeKind::Binary(op @ (BinOp::Add | BinOp::Sub)) = &inner.kind {
      let (lhs, rhs) = (inner.child(0), inner.child(1));
      let lhs_v = self.walk_expr(ctx, scope, lhs, true)?;
      let rhs_v = self.walk_expr(ctx, scope, rhs, true)?;
      let (ptr, idx) = if lhs_v.ty.is_pointer() { (lhs_v, rhs_v) } else { (rhs_v, lhs_v) };
      if !ptr.ty.is_pointer() {
        return Err(CompileError::code(inner.span.clone(), "dereference of non-pointer arithmetic result"));
      }
      let elem_ty = ptr.ty.dereferenced()?;
      let dest = ctx.new_temp(elem_ty.clone());
      if let Some(i) = idx.name.as_literal() {
        let signed = if *op == BinOp::Sub { -i } else { i };
        let byte_off = signed * i64::from(elem_ty.size_of()?);
        ctx.emit(TacOp::LoadOff, &inner.span).d(dest.clone()).a(ptr)
          .b(TacOperand::literal(byte_off, Type::primitive(Basic::U32))).push();
      } else {
        let shift = crate::types::ty::scale_shift(elem_ty.size_of()?)?;
        let idx = if *op == BinOp::Sub {
          let negated = ctx.new_temp(idx.ty.clone());
          ctx.emit(TacOp::Subtract, &inner.span).d(negated.clone())
            .a(TacOperand::literal(0, idx.ty.clone())).b(idx).push();
          negated
        } else { idx };
        ctx.emit(TacOp::LoadArr, &inner.span).d(dest.clone()).a(ptr).b(idx)
          .c(TacOperand::literal(i64::from(shift), Type::primitive(Basic::U8))).push();
      }
      return Ok(dest);
    }
    let mut v = self.walk_expr(ctx, scope, inner, true)?;
    v = v.decayed();
    if v.ty.indirection == 0 {
      return Err(CompileError::code(inner.span.clone(), "cannot dereference a non-pointer value"));
    }
    let result_ty = v.ty.dereferenced()?;
    let dest = ctx.new_temp(result_ty);
    ctx.emit(TacOp::Load, &inner.span).d(dest.clone()).a(v).push();
    Ok(dest)
  }

  /// `&e` (§4.4 "Address-of").
  fn walk_address_of(&mut self, ctx: &mut FnCtx, scope: ScopeId, inner: &Ast) -> Result<TacOperand> {
    match &inner.kind {
      NodeKind::Identifier(name) => {
        let sym = intern(name);
        let mut var = self.symtab.lookup_var(scope, sym, &inner.span)?;
        if var.ty.is_array() {
          return Err(CompileError::code(inner.span.clone(), "cannot take the address of a local array"));
        }
        var.must_spill = true;
        self.mark_must_spill(scope, sym, &var)?;
        let mut ptr_ty = var.ty.clone();
        ptr_ty.indirection += 1;
        let dest = ctx.new_objptr(ptr_ty);
        ctx.emit(TacOp::AddrOf, &inner.span).d(dest.clone())
          .a(TacOperand::standard(sym, var.ty)).push();
        Ok(dest)
      }
      NodeKind::Member { .. } => {
        let (base_addr, offset, member_ty) = self.resolve_member_leaf(ctx, scope, inner)?;
        let mut ptr_ty = member_ty;
        ptr_ty.indirection += 1;
        let dest = ctx.new_objptr(ptr_ty);
        ctx.emit(TacOp::LeaOff, &inner.span).d(dest.clone()).a(base_addr)
          .b(TacOperand::literal(i64::from(offset), Type::primitive(Basic::U32))).push();
        Ok(dest)
      }
      _ => Err(CompileError::code(inner.span.clone(), "cannot take the address of this expression")),
    }
  }

  /// Find `name` by walking the scope chain from `scope` and overwrite its
  /// stored entry with `updated` — used to persist `must_spill = true` once
  /// a variable's address is taken (§4.5 "mustSpill").
  fn mark_must_spill(&mut self, scope: ScopeId, name: Symbol, updated: &VariableEntry) -> Result<()> {
    let mut cur = Some(scope);
    while let Some(id) = cur {
      let found = self.symtab.scope(id).entries.iter().find(|e| e.name == name).map(|e| e.kind.clone());
      match found {
        Some(ScopeMemberKind::Variable(_)) => {
          if let Some(entry) = self.symtab.scope_mut(id).entries.iter_mut().find(|e| e.name == name) {
            entry.kind = ScopeMemberKind::Variable(updated.clone());
          }
          return Ok(());
        }
        Some(ScopeMemberKind::Argument(idx)) => {
          let f = self.symtab.owning_function(id)
            .ok_or_else(|| CompileError::internal("argument entry found outside a function"))?;
          self.symtab.function_mut(f).arguments[idx] = updated.clone();
          return Ok(());
        }
        Some(_) => return Err(CompileError::internal(format!("`{name}` is not a variable"))),
        None => cur = self.symtab.scope(id).parent,
      }
    }
    Err(CompileError::internal(format!("could not find `{name}` to mark must_spill")))
  }

  /// `a[i]` (§4.4 "Array reference").
  fn walk_index(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<TacOperand> {
    let base_ast = node.child(0);
    let base = self.walk_expr(ctx, scope, base_ast, false)?;
    if !base.ty.is_array() && !base.ty.is_pointer() {
      return Err(CompileError::code(node.span.clone(),
        "array index base is not declared as an array or pointer"));
    }
    let elem_ty = if base.ty.is_array() { base.ty.element_type() } else { base.ty.dereferenced()? };
    let base_decayed = base.decayed();
    let index_ast = node.child(1);
    let dest = ctx.new_temp(elem_ty.clone());
    if let NodeKind::IntConstant(i) = &index_ast.kind {
      let byte_off = i64::from(*i) * i64::from(elem_ty.size_of()?);
      ctx.emit(TacOp::LoadOff, &node.span).d(dest.clone()).a(base_decayed)
        .b(TacOperand::literal(byte_off, Type::primitive(Basic::U32))).push();
    } else {
      let index = self.walk_expr(ctx, scope, index_ast, true)?;
      let shift = crate::types::ty::scale_shift(elem_ty.size_of()?)?;
      ctx.emit(TacOp::LoadArr, &node.span).d(dest.clone()).a(base_decayed).b(index)
        .c(TacOperand::literal(i64::from(shift), Type::primitive(Basic::U8))).push();
    }
    Ok(dest)
  }

  /// `a.b` / `a->b` as an rvalue read (§4.4 "Member access").
  fn walk_member_read(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<TacOperand> {
    let (base_addr, offset, member_ty) = self.resolve_member_leaf(ctx, scope, node)?;
    if member_ty.is_value_class() {
      return Err(CompileError::code(node.span.clone(),
        "reading a class member by value is not supported; access its fields instead"));
    }
    let dest = ctx.new_temp(member_ty);
    ctx.emit(TacOp::LoadOff, &node.span).d(dest.clone()).a(base_addr)
      .b(TacOperand::literal(i64::from(offset), Type::primitive(Basic::U32))).push();
    Ok(dest)
  }

  /// Resolve a `Member` node to `(address of the owning struct, member
  /// offset, member type)`, without emitting the final load/store. Shared
  /// by rvalue reads, assignment targets, and `&a.b`.
  fn resolve_member_leaf(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<(TacOperand, u32, Type)> {
    if_chain! {
      if let NodeKind::Member { member, arrow } = &node.kind;
      then {
        let base_ast = node.child(0);
        let (base_addr, base_class, shape) = self.resolve_struct_address(ctx, scope, base_ast)?;
        let required = if *arrow { BaseShape::Pointer } else { BaseShape::Value };
        if shape != required {
          let op = if *arrow { "->" } else { "." };
          return Err(CompileError::code(node.span.clone(),
            format!("`{op}` used with a base of the wrong indirection level")));
        }
        let class = self.symtab.class(base_class);
        let m = class.member_offsets.get(&intern(member)).cloned()
          .ok_or_else(|| CompileError::code(node.span.clone(),
            format!("class `{}` has no member `{member}`", class.name)))?;
        Ok((base_addr, m.offset, m.variable.ty))
      } else {
        Err(CompileError::internal("resolve_member_leaf called on non-Member node"))
      }
    }
  }

  /// Resolve the address of the struct instance that should be offset into
  /// to find a member — the recursive core of §4.4 "Member access".
  fn resolve_struct_address(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast) -> Result<(TacOperand, ClassId, BaseShape)> {
    match &node.kind {
      NodeKind::Identifier(name) => {
        let var = self.symtab.lookup_var(scope, intern(name), &node.span)?;
        if var.ty.is_value_class() {
          let class_id = self.symtab.lookup_class(scope, intern(var.ty.class_name.as_deref().unwrap()), &node.span)?;
          let mut var_with_spill = var.clone();
          var_with_spill.must_spill = true;
          self.mark_must_spill(scope, var.name, &var_with_spill)?;
          let mut ptr_ty = var.ty.clone();
          ptr_ty.indirection = 1;
          let dest = ctx.new_objptr(ptr_ty);
          ctx.emit(TacOp::AddrOf, &node.span).d(dest.clone())
            .a(TacOperand::standard(var.name, var.ty)).push();
          Ok((dest, class_id, BaseShape::Value))
        } else if var.ty.indirection == 1 && var.ty.array_size == 0 && var.ty.basic == Basic::Class {
          let class_id = self.symtab.lookup_class(scope, intern(var.ty.class_name.as_deref().unwrap()), &node.span)?;
          Ok((TacOperand::standard(var.name, var.ty), class_id, BaseShape::Pointer))
        } else {
          Err(CompileError::code(node.span.clone(), format!("`{name}` is not a class or class pointer")))
        }
      }
      NodeKind::Member { .. } => {
        let (base_addr, offset, member_ty) = self.resolve_member_leaf(ctx, scope, node)?;
        let class_name = member_ty.class_name.clone()
          .ok_or_else(|| CompileError::code(node.span.clone(), "member is not a class-typed field"))?;
        let class_id = self.symtab.lookup_class(scope, intern(&class_name), &node.span)?;
        if member_ty.is_value_class() {
          let mut ptr_ty = member_ty;
          ptr_ty.indirection = 1;
          let addr = ctx.new_objptr(ptr_ty);
          ctx.emit(TacOp::LeaOff, &node.span).d(addr.clone()).a(base_addr)
            .b(TacOperand::literal(i64::from(offset), Type::primitive(Basic::U32))).push();
          Ok((addr, class_id, BaseShape::Value))
        } else if member_ty.indirection == 1 && member_ty.array_size == 0 {
          let addr = ctx.new_objptr(member_ty);
          ctx.emit(TacOp::LoadOff, &node.span).d(addr.clone()).a(base_addr)
            .b(TacOperand::literal(i64::from(offset), Type::primitive(Basic::U32))).push();
          Ok((addr, class_id, BaseShape::Pointer))
        } else {
          Err(CompileError::code(node.span.clone(), "member is neither a class value nor a class pointer"))
        }
      }
      _ => Err(CompileError::code(node.span.clone(), "expected a class-typed expression")),
    }
  }

  /// Function call (§4.4 "Function call"). `want_value` controls whether
  /// the caller requested a return value.
  fn walk_call(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast, name: &str, want_value: bool) -> Result<TacOperand> {
    let fid = self.symtab.lookup_fun(scope, intern(name), &node.span)?;
    let func = self.symtab.function(fid);
    let ret_ty = func.return_type.clone();
    let arg_tys: Vec<Type> = func.arguments.iter().map(|a| a.ty.clone()).collect();
    if node.children.len() != arg_tys.len() {
      return Err(CompileError::code(node.span.clone(),
        format!("`{name}` expects {} arguments, got {}", arg_tys.len(), node.children.len())));
    }
    let mut values = Vec::with_capacity(node.children.len());
    for arg_ast in &node.children {
      values.push(self.walk_expr(ctx, scope, arg_ast, true)?);
    }
    for (v, expected) in values.iter().zip(arg_tys.iter()) {
      check_widens_value(expected, v, &node.span, &format!("call to `{name}`"))?;
    }
    // "push arguments right-to-left ... so argument 0 ends up on top".
    for v in values.into_iter().rev() {
      ctx.emit(TacOp::Push, &node.span).a(v).push();
    }
    if want_value && ret_ty.basic == Basic::Void && ret_ty.indirection == 0 {
      return Err(CompileError::code(node.span.clone(),
        format!("cannot use the return value of void function `{name}`")));
    }
    let name_operand = literal_str_operand(name);
    if want_value && !(ret_ty.basic == Basic::Void && ret_ty.indirection == 0) {
      let dest = ctx.new_temp(ret_ty);
      ctx.emit(TacOp::Call, &node.span).d(dest.clone()).a(name_operand).push();
      Ok(dest)
    } else {
      ctx.emit(TacOp::Call, &node.span).a(name_operand).push();
      Ok(TacOperand::literal(0, Type::primitive(Basic::Void)))
    }
  }

  // ---- assignment (§4.4 "Assignment": five distinct lowering paths) ----

  fn walk_assignment(&mut self, ctx: &mut FnCtx, scope: ScopeId, node: &Ast, op: AssignOp) -> Result<()> {
    let lhs = node.child(0);
    let rhs_ast = node.child(1);

    match &lhs.kind {
      NodeKind::Identifier(name) => {
        let var = self.symtab.lookup_var(scope, intern(name), &lhs.span)?;
        if var.ty.is_array() {
          return Err(CompileError::code(lhs.span.clone(), "cannot assign to an array variable"));
        }
        if var.ty.is_value_class() {
          return Err(CompileError::code(lhs.span.clone(),
            "cannot assign to a class member by value; assign its fields instead"));
        }
        let target = TacOperand::standard(var.name, var.ty.clone());
        let value = self.compose_assign_value(ctx, scope, op, rhs_ast, target.clone(), &var.ty, &lhs.span)?;
        ctx.emit(TacOp::Assign, &node.span).d(target).a(value).push();
        Ok(())
      }
      NodeKind::Unary(UnOp::Deref) => {
        let inner = lhs.child(0);
        let mut ptr = self.walk_expr(ctx, scope, inner, true)?;
        ptr = ptr.decayed();
        if ptr.ty.indirection == 0 {
          return Err(CompileError::code(lhs.span.clone(), "cannot assign through a non-pointer"));
        }
        let elem_ty = ptr.ty.dereferenced()?;
        let current = if op == AssignOp::Assign {
          None
        } else {
          let cur = ctx.new_temp(elem_ty.clone());
          ctx.emit(TacOp::Load, &lhs.span).d(cur.clone()).a(ptr.clone()).push();
          Some(cur)
        };
        let value = self.compose_assign_value_from(ctx, scope, op, rhs_ast, current, &elem_ty, &lhs.span)?;
        ctx.emit(TacOp::Store, &node.span).d(ptr).a(value).push();
        Ok(())
      }
      NodeKind::Index => {
        let base_ast = lhs.child(0);
        let base = self.walk_expr(ctx, scope, base_ast, false)?;
        if !base.ty.is_array() && !base.ty.is_pointer() {
          return Err(CompileError::code(lhs.span.clone(),
            "array index base is not declared as an array or pointer"));
        }
        let elem_ty = if base.ty.is_array() { base.ty.element_type() } else { base.ty.dereferenced()? };
        let base_decayed = base.decayed();
        let index_ast = lhs.child(1);
        let literal_index = if let NodeKind::IntConstant(i) = &index_ast.kind { Some(*i) } else { None };
        let index_value = if literal_index.is_none() { Some(self.walk_expr(ctx, scope, index_ast, true)?) } else { None };
        let current = if op == AssignOp::Assign {
          None
        } else {
          let cur = ctx.new_temp(elem_ty.clone());
          if let Some(i) = literal_index {
            let byte_off = i64::from(i) * i64::from(elem_ty.size_of()?);
            ctx.emit(TacOp::LoadOff, &lhs.span).d(cur.clone()).a(base_decayed.clone())
              .b(TacOperand::literal(byte_off, Type::primitive(Basic::U32))).push();
          } else {
            let shift = crate::types::ty::scale_shift(elem_ty.size_of()?)?;
            ctx.emit(TacOp::LoadArr, &lhs.span).d(cur.clone()).a(base_decayed.clone())
              .b(index_value.clone().expect("computed above")).c(TacOperand::literal(i64::from(shift), Type::primitive(Basic::U8))).push();
          }
          Some(cur)
        };
        let value = self.compose_assign_value_from(ctx, scope, op, rhs_ast, current, &elem_ty, &lhs.span)?;
        if let Some(i) = literal_index {
          let byte_off = i64::from(i) * i64::from(elem_ty.size_of()?);
          ctx.emit(TacOp::StoreOff, &node.span).d(base_decayed)
            .a(TacOperand::literal(byte_off, Type::primitive(Basic::U32))).b(value).push();
        } else {
          let shift = crate::types::ty::scale_shift(elem_ty.size_of()?)?;
          ctx.emit(TacOp::StoreArr, &node.span).d(base_decayed).a(index_value.expect("computed above"))
            .b(TacOperand::literal(i64::from(shift), Type::primitive(Basic::U8))).c(value).push();
        }
        Ok(())
      }
      NodeKind::Member { .. } => {
        let (base_addr, offset, member_ty) = self.resolve_member_leaf(ctx, scope, lhs)?;
        if member_ty.is_value_class() {
          return Err(CompileError::code(lhs.span.clone(), "cannot assign to a class member by value"));
        }
        let current = if op == AssignOp::Assign {
          None
        } else {
          let cur = ctx.new_temp(member_ty.clone());
          ctx.emit(TacOp::LoadOff, &lhs.span).d(cur.clone()).a(base_addr.clone())
            .b(TacOperand::literal(i64::from(offset), Type::primitive(Basic::U32))).push();
          Some(cur)
        };
        let value = self.compose_assign_value_from(ctx, scope, op, rhs_ast, current, &member_ty, &lhs.span)?;
        ctx.emit(TacOp::StoreOff, &node.span).d(base_addr)
          .a(TacOperand::literal(i64::from(offset), Type::primitive(Basic::U32))).b(value).push();
        Ok(())
      }
      _ => Err(CompileError::code(lhs.span.clone(), "invalid assignment target")),
    }
  }

  /// For `=`, the widened rhs value directly. For `+=`/`-=`, fold the
  /// already-read `current` value of the target with the rhs (desugared at
  /// this level, since the TAC opcode table has no compound-assign ops).
  fn compose_assign_value_from(&mut self, ctx: &mut FnCtx, scope: ScopeId, op: AssignOp, rhs_ast: &Ast, current: Option<TacOperand>, target_ty: &Type, span: &Span) -> Result<TacOperand> {
    let rhs = self.walk_expr(ctx, scope, rhs_ast, true)?;
    check_widens_value(target_ty, &rhs, span, "assignment")?;
    match (op, current) {
      (AssignOp::Assign, _) => Ok(rhs),
      (AssignOp::PlusEq, Some(cur)) => {
        let dest = ctx.new_temp(target_ty.clone());
        ctx.emit(TacOp::Add, span).d(dest.clone()).a(cur).b(rhs).push();
        Ok(dest)
      }
      (AssignOp::MinusEq, Some(cur)) => {
        let dest = ctx.new_temp(target_ty.clone());
        ctx.emit(TacOp::Subtract, span).d(dest.clone()).a(cur).b(rhs).push();
        Ok(dest)
      }
      (AssignOp::PlusEq | AssignOp::MinusEq, None) =>
        Err(CompileError::internal("compound assignment requires a pre-read current value")),
    }
  }

  /// Identifier targets don't need a separate load: the variable's own
  /// operand can be read directly as `a` in the fold.
  fn compose_assign_value(&mut self, ctx: &mut FnCtx, scope: ScopeId, op: AssignOp, rhs_ast: &Ast, current: TacOperand, target_ty: &Type, span: &Span) -> Result<TacOperand> {
    let current = if op == AssignOp::Assign { None } else { Some(current) };
    self.compose_assign_value_from(ctx, scope, op, rhs_ast, current, target_ty, span)
  }
}

impl Default for Linearizer {
  fn default() -> Self { Self::new() }
}

/// §7 scopes "narrowing conversion" errors to call sites (and, by the same
/// reasoning, assignment), not to every place two types meet. An integer
/// constant's TAC type is always `u32` bookkeeping from [`walk_expr`]'s
/// `IntConstant` arm, not a claim about the value's actual width, so a
/// literal operand is exempt from the destination-size check: `u8 x; x = 1;`
/// is not narrowing just because `1` nominally carries a 4-byte type.
/// Pointer, array and class mismatches still need to line up exactly.
fn check_widens_value(target_ty: &Type, value: &TacOperand, span: &Span, context: &str) -> Result<()> {
  if value.permutation == Permutation::Literal
    && target_ty.basic != Basic::Class && !target_ty.is_pointer() && !target_ty.is_array()
  {
    return Ok(());
  }
  crate::types::ty::check_widens(target_ty, &value.ty, span, context)
}

fn literal_str_operand(s: &str) -> TacOperand {
  TacOperand {
    name: OperandName::Name(intern(s)),
    ty: Type::primitive(Basic::Void),
    permutation: Permutation::Literal,
    cast_as: None,
  }
}

/// §4.4 "String literals": map non-identifier-safe characters to a
/// deterministic identifier, then intern.
fn mangle_string_literal(s: &str) -> Symbol {
  let mut out = String::with_capacity(s.len() + 8);
  out.push_str("str_");
  for c in s.chars() {
    if c.is_ascii_alphanumeric() || c == '_' {
      out.push(c);
    } else if c == ' ' {
      out.push('_');
    } else {
      out.push('x');
    }
  }
  intern(&out)
}

fn type_from_ast(node: &Ast) -> Result<Type> {
  if let NodeKind::TypeName(TypeName { basic, indirection, array_size, class_name }) = &node.kind {
    let basic_kind = match basic {
      BasicTypeName::Void => Basic::Void,
      BasicTypeName::U8 => Basic::U8,
      BasicTypeName::U16 => Basic::U16,
      BasicTypeName::U32 => Basic::U32,
      BasicTypeName::Class => Basic::Class,
    };
    Ok(Type {
      basic: basic_kind,
      indirection: *indirection,
      array_size: *array_size,
      class_name: class_name.clone(),
      initializer_bytes: None,
    })
  } else {
    Err(CompileError::internal(format!("expected a TypeName node, found {:?}", node.kind)))
  }
}

/// "the wider-type operand determines the result type" (§4.4).
fn wider(a: &Type, b: &Type) -> Type {
  if a.size_of().unwrap_or(0) >= b.size_of().unwrap_or(0) { a.clone() } else { b.clone() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::ast::{BasicTypeName as BT, TypeName};

  fn span() -> Span { Span { file: "t.cls".into(), line: 1, col: 1 } }

  fn u8_type() -> Ast {
    Ast::new(NodeKind::TypeName(TypeName {
      basic: BT::U8, indirection: 0, array_size: 0, class_name: None,
    }), span(), vec![])
  }

  fn program(children: Vec<Ast>) -> Ast { Ast::new(NodeKind::Program, span(), children) }

  #[test]
  fn global_variable_declaration_is_registered() {
    let decl = Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]);
    let st = Linearizer::new().compile(&program(vec![decl])).unwrap().symtab;
    assert!(st.lookup(st.global_scope, intern("x")).is_some());
  }

  #[test]
  fn global_statements_populate_the_userstart_block() {
    let decl = Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("x".into()), span(), vec![]),
      Ast::new(NodeKind::IntConstant(1), span(), vec![]),
    ]);
    let st = Linearizer::new().compile(&program(vec![decl, assign])).unwrap().symtab;
    assert_eq!(st.global_blocks[0].tac.len(), 1);
    assert_eq!(st.global_blocks[0].tac[0].op, TacOp::Assign);
  }

  #[test]
  fn function_with_simple_add_lowers_cleanly() {
    let f = Ast::new(NodeKind::FunctionDef { name: "add".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::VariableDecl { name: "b".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Binary(BinOp::Add), span(), vec![
            Ast::new(NodeKind::Identifier("a".into()), span(), vec![]),
            Ast::new(NodeKind::Identifier("b".into()), span(), vec![]),
          ]),
        ]),
      ]),
    ]);
    let st = Linearizer::new().compile(&program(vec![f])).unwrap().symtab;
    assert_eq!(st.functions.len(), 1);
    let func = &st.functions[0];
    assert!(func.is_defined);
    assert_eq!(func.arguments.len(), 2);
    assert_eq!(func.arguments[0].stack_offset, 8);
    assert_eq!(func.arguments[1].stack_offset, 9);
    let last_block = func.blocks.last().unwrap();
    assert!(last_block.tac.iter().any(|l| l.op == TacOp::Add));
    assert!(last_block.tac.iter().any(|l| l.op == TacOp::Return));
  }

  #[test]
  fn arithmetic_between_two_pointers_is_rejected() {
    let mut ptr_u8 = u8_type();
    if let NodeKind::TypeName(t) = &mut ptr_u8.kind { t.indirection = 1 }
    let f = Ast::new(NodeKind::FunctionDef { name: "bad".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::VariableDecl { name: "p".into() }, span(), vec![ptr_u8.clone()]),
      Ast::new(NodeKind::VariableDecl { name: "q".into() }, span(), vec![ptr_u8]),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Binary(BinOp::Add), span(), vec![
            Ast::new(NodeKind::Identifier("p".into()), span(), vec![]),
            Ast::new(NodeKind::Identifier("q".into()), span(), vec![]),
          ]),
        ]),
      ]),
    ]);
    let err = Linearizer::new().compile(&program(vec![f]));
    assert!(err.is_err());
  }

  #[test]
  fn call_argument_literal_narrower_than_declared_param_is_accepted() {
    // fun take(u8 a) { return; } take(5); -- a literal never counts as narrowing.
    let f = Ast::new(NodeKind::FunctionDef { name: "take".into(), is_asm: false }, span(), vec![
      Ast::new(NodeKind::TypeName(TypeName {
        basic: BT::Void, indirection: 0, array_size: 0, class_name: None,
      }), span(), vec![]),
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Scope, span(), vec![Ast::new(NodeKind::Return, span(), vec![])]),
    ]);
    let call_stmt = Ast::new(NodeKind::Call { name: "take".into() }, span(), vec![
      Ast::new(NodeKind::IntConstant(5), span(), vec![]),
    ]);
    let main = Ast::new(NodeKind::FunctionDef { name: "main".into(), is_asm: false }, span(), vec![
      Ast::new(NodeKind::TypeName(TypeName {
        basic: BT::Void, indirection: 0, array_size: 0, class_name: None,
      }), span(), vec![]),
      Ast::new(NodeKind::Scope, span(), vec![call_stmt, Ast::new(NodeKind::Return, span(), vec![])]),
    ]);
    let result = Linearizer::new().compile(&program(vec![f, main]));
    assert!(result.is_ok(), "literal call argument should not trip the narrowing check: {result:?}");
  }

  #[test]
  fn call_argument_narrower_than_declared_still_rejects_a_non_literal_source() {
    // fun take(u8 a) { return; } u32 wide; take(wide); -- a real variable's
    // width still has to fit, literal-exemption doesn't relax this.
    let f = Ast::new(NodeKind::FunctionDef { name: "take".into(), is_asm: false }, span(), vec![
      Ast::new(NodeKind::TypeName(TypeName {
        basic: BT::Void, indirection: 0, array_size: 0, class_name: None,
      }), span(), vec![]),
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Scope, span(), vec![Ast::new(NodeKind::Return, span(), vec![])]),
    ]);
    let wide_type = Ast::new(NodeKind::TypeName(TypeName {
      basic: BT::U32, indirection: 0, array_size: 0, class_name: None,
    }), span(), vec![]);
    let wide_decl = Ast::new(NodeKind::VariableDecl { name: "wide".into() }, span(), vec![wide_type]);
    let call_stmt = Ast::new(NodeKind::Call { name: "take".into() }, span(), vec![
      Ast::new(NodeKind::Identifier("wide".into()), span(), vec![]),
    ]);
    let main = Ast::new(NodeKind::FunctionDef { name: "main".into(), is_asm: false }, span(), vec![
      Ast::new(NodeKind::TypeName(TypeName {
        basic: BT::Void, indirection: 0, array_size: 0, class_name: None,
      }), span(), vec![]),
      Ast::new(NodeKind::Scope, span(), vec![call_stmt, Ast::new(NodeKind::Return, span(), vec![])]),
    ]);
    let result = Linearizer::new().compile(&program(vec![wide_decl, f, main]));
    assert!(result.is_err(), "a u32 variable should still narrow when passed as a u8 argument");
  }

  #[test]
  fn assignment_to_whole_array_is_rejected() {
    let mut arr_u8 = u8_type();
    if let NodeKind::TypeName(t) = &mut arr_u8.kind { t.array_size = 4 }
    let decl = Ast::new(NodeKind::VariableDecl { name: "arr".into() }, span(), vec![arr_u8]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("arr".into()), span(), vec![]),
      Ast::new(NodeKind::IntConstant(0), span(), vec![]),
    ]);
    let err = Linearizer::new().compile(&program(vec![decl, assign]));
    assert!(err.is_err());
  }

  #[test]
  fn assignment_to_a_whole_class_value_is_rejected() {
    let class_decl = Ast::new(NodeKind::ClassDecl { name: "P".into() }, span(), vec![
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
    ]);
    let class_ty = Ast::new(NodeKind::TypeName(TypeName {
      basic: BT::Class, indirection: 0, array_size: 0, class_name: Some("P".into()),
    }), span(), vec![]);
    let p_decl = Ast::new(NodeKind::VariableDecl { name: "p".into() }, span(), vec![class_ty.clone()]);
    let q_decl = Ast::new(NodeKind::VariableDecl { name: "q".into() }, span(), vec![class_ty]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("p".into()), span(), vec![]),
      Ast::new(NodeKind::Identifier("q".into()), span(), vec![]),
    ]);
    let err = Linearizer::new().compile(&program(vec![class_decl, p_decl, q_decl, assign]));
    assert!(err.is_err());
  }
}
