//! §4.6 "Code generator": lowers one function's (or the global user-init
//! pseudo-function's) basic blocks to RISC-V-style assembly text, using the
//! writeback decisions [`crate::regalloc::allocate_registers`] already made.
//!
//! Every helper here mirrors a named step from the algorithm: placing an
//! operand into a register for a read, picking a register to hold a write
//! before it's stored back, and writing a value back to wherever its
//! lifetime actually lives. The per-opcode switch in [`emit_basic_block`]
//! is the direct counterpart of the TAC contracts in
//! [`crate::types::tac::TacOp`].

use crate::error::{CompileError, Result};
use crate::regalloc::{CodegenMetadata, Lifetime, WritebackLocation, RETURN_REGISTER, SCRATCH};
use crate::symbol::Symbol;
use crate::types::symtab::SymbolTable;
use crate::types::tac::{BasicBlock, Permutation, TacLine, TacOp, TacOperand};

/// `registerNames`: machine register index to RISC-V mnemonic.
const REGISTER_NAMES: [&str; 32] = [
  "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1",
  "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "s2", "s3",
  "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

fn reg_name(r: u8) -> &'static str {
  REGISTER_NAMES[usize::from(r)]
}

/// The name used in place of a real function name when emitting labels and
/// branch targets for the global user-init block, which has no `FunctionId`
/// of its own (§10.6 item 4).
const USERSTART_LABEL_PREFIX: &str = "userstart";

fn find_lifetime(meta: &CodegenMetadata, name: Symbol) -> Result<&Lifetime> {
  meta.lifetime(name)
    .ok_or_else(|| CompileError::internal(format!("no lifetime discovered for `{name}` at emission time")))
}

/// Emit the code to get `operand`'s current value into some register,
/// returning which one. A literal is loaded into `scratch`; a
/// register-resident lifetime returns its own register directly; a
/// global or stack-resident lifetime is loaded (or, for an array, has its
/// address computed) into `scratch`.
fn place_or_find_operand_in_register(
  out: &mut String, meta: &CodegenMetadata, operand: &TacOperand, scratch: u8,
) -> Result<u8> {
  if operand.permutation == Permutation::Literal {
    let value = operand.name.as_literal()
      .ok_or_else(|| CompileError::internal("literal operand carries no integer value"))?;
    out.push_str(&format!("\tli {}, {value}\n", reg_name(scratch)));
    return Ok(scratch);
  }
  let name = operand.name.as_symbol()
    .ok_or_else(|| CompileError::internal("non-literal operand carries no name"))?;
  let lt = find_lifetime(meta, name)?;
  match lt.wb_location {
    WritebackLocation::Register => Ok(lt.register_location),
    WritebackLocation::Global => {
      out.push_str(&format!("\tli {}, {name}\n", reg_name(scratch)));
      if !operand.effective_type().is_array() {
        let width = lt.ty.select_width()?;
        out.push_str(&format!(
          "\tl{} {}, 0({})\n", width.unsigned_load_suffix(), reg_name(scratch), reg_name(scratch)));
      }
      Ok(scratch)
    }
    WritebackLocation::Stack => {
      if operand.effective_type().is_array() {
        emit_addi_fp(out, scratch, lt.stack_location);
      } else {
        let width = lt.ty.select_width()?;
        out.push_str(&format!(
          "\tl{} {}, {}(fp)\n", width.unsigned_load_suffix(), reg_name(scratch), lt.stack_location));
      }
      Ok(scratch)
    }
    WritebackLocation::Unknown =>
      Err(CompileError::internal(format!("`{name}` has no writeback location at emission time"))),
  }
}

/// `addi {reg}, fp, {offset}`, taking care not to print a spurious `-` on a
/// non-negative offset (a positive `stackLocation` is a fixed-offset
/// argument, not a spill slot).
fn emit_addi_fp(out: &mut String, reg: u8, stack_location: i32) {
  if stack_location < 0 {
    out.push_str(&format!("\taddi {}, fp, -{}\n", reg_name(reg), -stack_location));
  } else {
    out.push_str(&format!("\taddi {}, fp, {}\n", reg_name(reg), stack_location));
  }
}

/// Pick which register a write to `operand` should land in before
/// [`write_variable`] stores it back: the lifetime's own register if it's
/// register-resident, else the caller-supplied scratch.
fn pick_write_register(meta: &CodegenMetadata, operand: &TacOperand, scratch: u8) -> Result<u8> {
  let name = operand.name.as_symbol()
    .ok_or_else(|| CompileError::internal("write target carries no name"))?;
  let lt = find_lifetime(meta, name)?;
  match lt.wb_location {
    WritebackLocation::Register => Ok(lt.register_location),
    WritebackLocation::Stack | WritebackLocation::Global => Ok(scratch),
    WritebackLocation::Unknown =>
      Err(CompileError::internal(format!("`{name}` has no writeback location at emission time"))),
  }
}

/// Store `source_reg` into wherever `written_to`'s lifetime actually lives.
/// A register-resident target only needs a `mv` when the value isn't
/// already sitting in its home register; a global target's address load
/// always uses `SCRATCH[0]` regardless of what scratch the caller reserved
/// for the value itself (the two never collide: the value is already in
/// `source_reg` by the time the address is computed).
fn write_variable(out: &mut String, meta: &CodegenMetadata, written_to: &TacOperand, source_reg: u8) -> Result<()> {
  let name = written_to.name.as_symbol()
    .ok_or_else(|| CompileError::internal("write target carries no name"))?;
  let lt = find_lifetime(meta, name)?;
  match lt.wb_location {
    WritebackLocation::Register => {
      if source_reg != lt.register_location {
        out.push_str(&format!("\tmv {}, {}\n", reg_name(lt.register_location), reg_name(source_reg)));
      }
      Ok(())
    }
    WritebackLocation::Global => {
      let width = written_to.effective_type().select_width()?;
      out.push_str(&format!("\tli {}, {name}\n", reg_name(SCRATCH[0])));
      out.push_str(&format!(
        "\ts{} ({}), {}\n", width.store_suffix(), reg_name(SCRATCH[0]), reg_name(source_reg)));
      Ok(())
    }
    WritebackLocation::Stack => {
      let width = lt.ty.select_width()?;
      out.push_str(&format!("\ts{} {}(fp), {}\n", width.store_suffix(), lt.stack_location, reg_name(source_reg)));
      Ok(())
    }
    WritebackLocation::Unknown =>
      Err(CompileError::internal(format!("`{name}` has no writeback location at emission time"))),
  }
}

/// `d := &a` (§4.3 `AddrOf`). A register-resident lifetime has no address
/// to take — regalloc's must-spill rule (§4.5) exists precisely so this
/// never happens for a local that's actually addressed. A global's address
/// is its symbol name, not an `fp`-relative offset.
fn place_addr_of_lifetime_in_reg(out: &mut String, meta: &CodegenMetadata, operand: &TacOperand, reg: u8) -> Result<u8> {
  let name = operand.name.as_symbol()
    .ok_or_else(|| CompileError::internal("addr-of operand carries no name"))?;
  let lt = find_lifetime(meta, name)?;
  match lt.wb_location {
    WritebackLocation::Register =>
      Err(CompileError::internal(format!("address taken of register-resident lifetime `{name}`"))),
    WritebackLocation::Global => {
      out.push_str(&format!("\tli {}, {name}\n", reg_name(reg)));
      Ok(reg)
    }
    WritebackLocation::Stack => {
      emit_addi_fp(out, reg, lt.stack_location);
      Ok(reg)
    }
    WritebackLocation::Unknown =>
      Err(CompileError::internal(format!("`{name}` has no writeback location at emission time"))),
  }
}

/// Generate one function's prologue, body, and epilogue, appending to `out`.
/// Mirrors `generateCodeForFunction_0`: push `ra`/`fp`, establish the new
/// frame, then either short-circuit straight to the epilogue for an `asm`
/// function (no register allocation at all — every line is emitted
/// verbatim) or run the full allocate/reserve/push/load/emit/pop pipeline.
pub fn emit_function(out: &mut String, symtab: &SymbolTable, function_id: crate::types::symtab::FunctionId) -> Result<()> {
  let function = symtab.function(function_id);
  let name = function.name.as_str();
  out.push_str(&format!("{name}:\n"));
  emit_prologue(out);

  if function.is_asm_fun {
    for block in &function.blocks {
      for line in &block.tac {
        if line.op != TacOp::Asm { continue }
        let text = line.d().and_then(|d| d.name.as_symbol())
          .ok_or_else(|| CompileError::internal("asm-function line carries no verbatim text"))?;
        out.push_str(&format!("\t{text}\n"));
      }
    }
    emit_epilogue_jump_free(out, function.arg_stack_size);
    return Ok(());
  }

  let meta = crate::regalloc::allocate_registers(symtab, function_id)?;
  emit_body(out, symtab, &meta, Some(name.as_str()), function_id, &function.blocks, function.arg_stack_size)
}

/// The global user-init block (§10.6 item 4) is driven through the same
/// pipeline as a real function body, just without a prologue/epilogue or a
/// `FunctionId` — the userstart block falls straight off the end of the
/// program rather than returning.
pub fn emit_global_userstart(out: &mut String, symtab: &SymbolTable) -> Result<()> {
  let userstart = &symtab.global_blocks[crate::types::tac::GLOBAL_USERSTART_LABEL as usize];
  if userstart.tac.is_empty() {
    return Ok(());
  }
  let meta = crate::regalloc::allocate_registers_global(symtab)?;
  emit_basic_block(out, &meta, None, userstart)
}

/// The global asm block (label 1) bypasses the regular per-line emitter
/// entirely: every TAC line in it is an `asm` line carrying verbatim text
/// at slot `d`, printed as-is with no surrounding label.
pub fn emit_global_asm(out: &mut String, symtab: &SymbolTable) -> Result<()> {
  let asm_block = &symtab.global_blocks[crate::types::tac::GLOBAL_ASM_LABEL as usize];
  for line in &asm_block.tac {
    if line.op != TacOp::Asm {
      return Err(CompileError::internal("global asm block contains a non-asm TAC line"));
    }
    let text = line.d().and_then(|d| d.name.as_symbol())
      .ok_or_else(|| CompileError::internal("asm line carries no verbatim text"))?;
    out.push_str(&format!("{text}\n"));
  }
  Ok(())
}

fn emit_prologue(out: &mut String) {
  out.push_str("\taddi sp, sp, -8\n");
  out.push_str("\tsw ra, 4(sp)\n");
  out.push_str("\tsw fp, 0(sp)\n");
  out.push_str("\tmv fp, sp\n");
}

/// The asm-function short-circuit never runs a register allocator, so it
/// has no touched-register set to restore; only the fixed `ra`/`fp` pair
/// and the caller's argument space are released.
fn emit_epilogue_jump_free(out: &mut String, arg_stack_size: u32) {
  out.push_str("\tlw fp, 0(sp)\n");
  out.push_str("\tlw ra, 4(sp)\n");
  out.push_str("\taddi sp, sp, 8\n");
  if arg_stack_size > 0 {
    out.push_str(&format!("\taddi sp, sp, {arg_stack_size}\n"));
  }
  out.push_str("\tjalr zero, 0(ra)\n");
}

/// The bulk of `generateCodeForFunction_0`: stack reservation, touched
/// register save, argument-register loading, per-block emission, then the
/// mirrored epilogue.
fn emit_body(
  out: &mut String, symtab: &SymbolTable, meta: &CodegenMetadata, function_name: Option<&str>,
  function_id: crate::types::symtab::FunctionId, blocks: &[BasicBlock], arg_stack_size: u32,
) -> Result<()> {
  if meta.local_stack_size > 0 {
    out.push_str(&format!("\taddi sp, sp, -{}\n", meta.local_stack_size));
  }

  // Descending order on the way in, ascending on the way out (a LIFO push
  // sequence paired with its mirror pop sequence).
  for reg in (0u8..32).rev() {
    if meta.touched_registers[usize::from(reg)] {
      emit_push_for_width(out, reg, crate::types::ty::Width::Word);
    }
  }

  for arg in &symtab.function(function_id).arguments {
    let Some(lt) = meta.lifetime(arg.name) else { continue };
    if lt.wb_location == WritebackLocation::Register && (lt.nreads > 0 || lt.nwrites > 0) {
      let width = lt.ty.select_width()?;
      out.push_str(&format!(
        "\tl{} {}, {}(fp)\n", width.unsigned_load_suffix(), reg_name(lt.register_location), arg.stack_offset));
    }
  }

  for block in blocks {
    emit_basic_block(out, meta, function_name, block)?;
  }

  if let Some(fname) = function_name {
    out.push_str(&format!("{fname}_done:\n"));
  }
  for reg in 0u8..32 {
    if meta.touched_registers[usize::from(reg)] {
      emit_pop_for_width(out, reg, crate::types::ty::Width::Word);
    }
  }
  if meta.local_stack_size > 0 {
    out.push_str(&format!("\taddi sp, sp, {}\n", meta.local_stack_size));
  }
  out.push_str("\tlw fp, 0(sp)\n");
  out.push_str("\tlw ra, 4(sp)\n");
  out.push_str("\taddi sp, sp, 8\n");
  if arg_stack_size > 0 {
    out.push_str(&format!("\taddi sp, sp, {arg_stack_size}\n"));
  }
  out.push_str("\tjalr zero, 0(ra)\n");
  Ok(())
}

fn emit_push_for_width(out: &mut String, reg: u8, width: crate::types::ty::Width) {
  out.push_str(&format!("\taddi sp, sp, -{}\n", width.bytes()));
  out.push_str(&format!("\ts{} {}, 0(sp)\n", width.store_suffix(), reg_name(reg)));
}

fn emit_pop_for_width(out: &mut String, reg: u8, width: crate::types::ty::Width) {
  out.push_str(&format!("\tl{} {}, 0(sp)\n", width.unsigned_load_suffix(), reg_name(reg)));
  out.push_str(&format!("\taddi sp, sp, {}\n", width.bytes()));
}

/// `generateCodeForBasicBlock_0`: an optional label, then one opcode switch
/// per TAC line.
fn emit_basic_block(
  out: &mut String, meta: &CodegenMetadata, function_name: Option<&str>, block: &BasicBlock,
) -> Result<()> {
  let prefix = function_name.unwrap_or(USERSTART_LABEL_PREFIX);
  out.push_str(&format!("{prefix}_{}:\n", block.label_num));
  for line in &block.tac {
    emit_tac_line(out, meta, function_name, line)?;
  }
  Ok(())
}

fn branch_target(line: &TacLine) -> Result<i64> {
  line.d().and_then(|d| d.name.as_literal())
    .ok_or_else(|| CompileError::internal("branch line carries no target label"))
}

fn emit_tac_line(
  out: &mut String, meta: &CodegenMetadata, function_name: Option<&str>, line: &TacLine,
) -> Result<()> {
  log::trace!("emitting {:?} at index {}", line.op, line.index);
  let prefix = function_name.unwrap_or(USERSTART_LABEL_PREFIX);

  match line.op {
    TacOp::Asm => {
      let text = line.d().and_then(|d| d.name.as_symbol())
        .ok_or_else(|| CompileError::internal("asm line carries no verbatim text"))?;
      out.push_str(&format!("\t{text}\n"));
    }

    TacOp::Assign => {
      let a = line.a().ok_or_else(|| CompileError::internal("assign missing source"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("assign missing destination"))?;
      let scratch = pick_write_register(meta, d, SCRATCH[0])?;
      let src = place_or_find_operand_in_register(out, meta, a, scratch)?;
      write_variable(out, meta, d, src)?;
    }

    TacOp::Add | TacOp::Subtract | TacOp::Mul | TacOp::Div => {
      let a = line.a().ok_or_else(|| CompileError::internal("binary op missing first operand"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("binary op missing second operand"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("binary op missing destination"))?;
      let ra = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let rb = place_or_find_operand_in_register(out, meta, b, SCRATCH[1])?;
      let dest_reg = pick_write_register(meta, d, SCRATCH[0])?;
      let mnemonic = match line.op {
        TacOp::Add => "add",
        TacOp::Subtract => "sub",
        TacOp::Mul => "mul",
        TacOp::Div => "div",
        _ => unreachable!(),
      };
      out.push_str(&format!("\t{mnemonic} {}, {}, {}\n", reg_name(dest_reg), reg_name(ra), reg_name(rb)));
      write_variable(out, meta, d, dest_reg)?;
    }

    TacOp::Load => {
      let a = line.a().ok_or_else(|| CompileError::internal("load missing source pointer"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("load missing destination"))?;
      let base = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let dest_reg = pick_write_register(meta, d, SCRATCH[1])?;
      let width = d.effective_type().select_width()?;
      out.push_str(&format!("\tl{} {}, 0({})\n", width.unsigned_load_suffix(), reg_name(dest_reg), reg_name(base)));
      write_variable(out, meta, d, dest_reg)?;
    }

    TacOp::LoadOff => {
      // `a` is the base pointer, `b` the literal byte offset.
      let a = line.a().ok_or_else(|| CompileError::internal("load-off missing base pointer"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("load-off missing offset"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("load-off missing destination"))?;
      let base = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let offset = b.name.as_literal()
        .ok_or_else(|| CompileError::internal("load-off offset is not a literal"))?;
      let dest_reg = pick_write_register(meta, d, SCRATCH[1])?;
      let width = d.effective_type().select_width()?;
      out.push_str(&format!("\tl{} {}, {}({})\n", width.unsigned_load_suffix(), reg_name(dest_reg), offset, reg_name(base)));
      write_variable(out, meta, d, dest_reg)?;
    }

    TacOp::LoadArr => {
      // `a` base, `b` index, `c` scale shift.
      let a = line.a().ok_or_else(|| CompileError::internal("load-arr missing base pointer"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("load-arr missing index"))?;
      let c = line.c().ok_or_else(|| CompileError::internal("load-arr missing scale shift"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("load-arr missing destination"))?;
      let base = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let index_reg = place_or_find_operand_in_register(out, meta, b, SCRATCH[1])?;
      let shift = c.name.as_literal()
        .ok_or_else(|| CompileError::internal("load-arr scale shift is not a literal"))?;
      out.push_str(&format!("\tslli {}, {}, {shift}\n", reg_name(SCRATCH[2]), reg_name(index_reg)));
      out.push_str(&format!("\tadd {}, {}, {}\n", reg_name(SCRATCH[2]), reg_name(base), reg_name(SCRATCH[2])));
      let dest_reg = pick_write_register(meta, d, SCRATCH[1])?;
      let width = d.effective_type().select_width()?;
      out.push_str(&format!("\tl{} {}, 0({})\n", width.unsigned_load_suffix(), reg_name(dest_reg), reg_name(SCRATCH[2])));
      write_variable(out, meta, d, dest_reg)?;
    }

    TacOp::Store => {
      let d = line.d().ok_or_else(|| CompileError::internal("store missing destination pointer"))?;
      let a = line.a().ok_or_else(|| CompileError::internal("store missing value"))?;
      let base = place_or_find_operand_in_register(out, meta, d, SCRATCH[0])?;
      let value = place_or_find_operand_in_register(out, meta, a, SCRATCH[1])?;
      let width = a.effective_type().select_width()?;
      out.push_str(&format!("\ts{} 0({}), {}\n", width.store_suffix(), reg_name(base), reg_name(value)));
    }

    TacOp::StoreOff => {
      // `d` the base pointer, `a` the literal offset, `b` the value.
      let base_operand = line.d().ok_or_else(|| CompileError::internal("store-off missing base pointer"))?;
      let a = line.a().ok_or_else(|| CompileError::internal("store-off missing offset"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("store-off missing value"))?;
      let base = place_or_find_operand_in_register(out, meta, base_operand, SCRATCH[0])?;
      let offset = a.name.as_literal()
        .ok_or_else(|| CompileError::internal("store-off offset is not a literal"))?;
      let value = place_or_find_operand_in_register(out, meta, b, SCRATCH[1])?;
      let width = b.effective_type().select_width()?;
      out.push_str(&format!("\ts{} {}({}), {}\n", width.store_suffix(), offset, reg_name(base), reg_name(value)));
    }

    TacOp::StoreArr => {
      let base_operand = line.d().ok_or_else(|| CompileError::internal("store-arr missing base pointer"))?;
      let a = line.a().ok_or_else(|| CompileError::internal("store-arr missing index"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("store-arr missing scale shift"))?;
      let c = line.c().ok_or_else(|| CompileError::internal("store-arr missing value"))?;
      let base = place_or_find_operand_in_register(out, meta, base_operand, SCRATCH[0])?;
      let index_reg = place_or_find_operand_in_register(out, meta, a, SCRATCH[1])?;
      let shift = b.name.as_literal()
        .ok_or_else(|| CompileError::internal("store-arr scale shift is not a literal"))?;
      out.push_str(&format!("\tslli {}, {}, {shift}\n", reg_name(SCRATCH[2]), reg_name(index_reg)));
      out.push_str(&format!("\tadd {}, {}, {}\n", reg_name(SCRATCH[2]), reg_name(base), reg_name(SCRATCH[2])));
      let value = place_or_find_operand_in_register(out, meta, c, SCRATCH[1])?;
      let width = c.effective_type().select_width()?;
      out.push_str(&format!("\ts{} 0({}), {}\n", width.store_suffix(), reg_name(SCRATCH[2]), reg_name(value)));
    }

    TacOp::AddrOf => {
      let a = line.a().ok_or_else(|| CompileError::internal("addr-of missing operand"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("addr-of missing destination"))?;
      let dest_reg = pick_write_register(meta, d, SCRATCH[0])?;
      let reg = place_addr_of_lifetime_in_reg(out, meta, a, dest_reg)?;
      write_variable(out, meta, d, reg)?;
    }

    TacOp::LeaOff => {
      // `d := a + b`: base from `a`, literal byte offset from `b`.
      let a = line.a().ok_or_else(|| CompileError::internal("lea-off missing base"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("lea-off missing offset"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("lea-off missing destination"))?;
      let base = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let offset = b.name.as_literal()
        .ok_or_else(|| CompileError::internal("lea-off offset is not a literal"))?;
      let dest_reg = pick_write_register(meta, d, SCRATCH[1])?;
      out.push_str(&format!("\taddi {}, {}, {offset}\n", reg_name(dest_reg), reg_name(base)));
      write_variable(out, meta, d, dest_reg)?;
    }

    TacOp::LeaArr => {
      // `d := a + (c << b)`: base from `a`, index from `c`, scale shift from `b`.
      let a = line.a().ok_or_else(|| CompileError::internal("lea-arr missing base"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("lea-arr missing scale shift"))?;
      let c = line.c().ok_or_else(|| CompileError::internal("lea-arr missing index"))?;
      let d = line.d().ok_or_else(|| CompileError::internal("lea-arr missing destination"))?;
      let base = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let index_reg = place_or_find_operand_in_register(out, meta, c, SCRATCH[1])?;
      let shift = b.name.as_literal()
        .ok_or_else(|| CompileError::internal("lea-arr scale shift is not a literal"))?;
      let dest_reg = pick_write_register(meta, d, SCRATCH[2])?;
      out.push_str(&format!("\tslli {}, {}, {shift}\n", reg_name(dest_reg), reg_name(index_reg)));
      out.push_str(&format!("\tadd {}, {}, {}\n", reg_name(dest_reg), reg_name(base), reg_name(dest_reg)));
      write_variable(out, meta, d, dest_reg)?;
    }

    TacOp::Beq | TacOp::Bne | TacOp::Bgeu | TacOp::Bltu | TacOp::Bgtu | TacOp::Bleu => {
      let a = line.a().ok_or_else(|| CompileError::internal("branch missing first operand"))?;
      let b = line.b().ok_or_else(|| CompileError::internal("branch missing second operand"))?;
      let ra = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let rb = place_or_find_operand_in_register(out, meta, b, SCRATCH[1])?;
      let mnemonic = match line.op {
        TacOp::Beq => "beq",
        TacOp::Bne => "bne",
        TacOp::Bgeu => "bgeu",
        TacOp::Bltu => "bltu",
        TacOp::Bgtu => "bgtu",
        TacOp::Bleu => "bleu",
        _ => unreachable!(),
      };
      let target = branch_target(line)?;
      out.push_str(&format!("\t{mnemonic} {}, {}, {prefix}_{target}\n", reg_name(ra), reg_name(rb)));
    }

    TacOp::Beqz | TacOp::Bnez => {
      let a = line.a().ok_or_else(|| CompileError::internal("branch missing operand"))?;
      let ra = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let mnemonic = if line.op == TacOp::Beqz { "beqz" } else { "bnez" };
      let target = branch_target(line)?;
      out.push_str(&format!("\t{mnemonic} {}, {prefix}_{target}\n", reg_name(ra)));
    }

    TacOp::Jmp => {
      let target = branch_target(line)?;
      out.push_str(&format!("\tj {prefix}_{target}\n"));
    }

    TacOp::Push => {
      let a = line.a().ok_or_else(|| CompileError::internal("push missing operand"))?;
      let reg = place_or_find_operand_in_register(out, meta, a, SCRATCH[0])?;
      let width = a.effective_type().select_width()?;
      emit_push_for_width(out, reg, width);
    }

    TacOp::Pop => {
      let d = line.d().ok_or_else(|| CompileError::internal("pop missing destination"))?;
      let dest_reg = pick_write_register(meta, d, SCRATCH[0])?;
      let width = d.effective_type().select_width()?;
      emit_pop_for_width(out, dest_reg, width);
      write_variable(out, meta, d, dest_reg)?;
    }

    TacOp::Call => {
      let name_operand = line.a().ok_or_else(|| CompileError::internal("call missing target name"))?;
      let target = name_operand.name.as_symbol()
        .ok_or_else(|| CompileError::internal("call target is not a symbol"))?;
      out.push_str(&format!("\tjal ra, {target}\n"));
      if let Some(d) = line.d() {
        write_variable(out, meta, d, RETURN_REGISTER)?;
      }
    }

    TacOp::Label => {
      let num = line.d().and_then(|d| d.name.as_literal())
        .ok_or_else(|| CompileError::internal("label line carries no label number"))?;
      out.push_str(&format!("{prefix}_{num}:\n"));
    }

    TacOp::Return => {
      if let Some(a) = line.a() {
        let src = place_or_find_operand_in_register(out, meta, a, RETURN_REGISTER)?;
        if src != RETURN_REGISTER {
          out.push_str(&format!("\tmv {}, {}\n", reg_name(RETURN_REGISTER), reg_name(src)));
        }
      }
      let fname = function_name
        .ok_or_else(|| CompileError::internal("return TAC line outside a function"))?;
      out.push_str(&format!("\tj {fname}_done\n"));
    }

    TacOp::Do | TacOp::EndDo => {}
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::linearizer::Linearizer;
  use crate::scope_collapse::collapse;
  use crate::types::ast::{Ast, AssignOp, BasicTypeName, NodeKind, Span, TypeName};
  use crate::types::symtab::FunctionId;

  fn span() -> Span { Span { file: "t.cls".into(), line: 1, col: 1 } }

  fn u8_type() -> Ast {
    Ast::new(NodeKind::TypeName(TypeName {
      basic: BasicTypeName::U8, indirection: 0, array_size: 0, class_name: None,
    }), span(), vec![])
  }

  fn program(children: Vec<Ast>) -> Ast { Ast::new(NodeKind::Program, span(), children) }

  #[test]
  fn global_assignment_loads_the_symbol_address_then_stores_through_it() {
    // u8 x; x = 1; -- S2-style scenario (§8).
    let decl = Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("x".into()), span(), vec![]),
      Ast::new(NodeKind::IntConstant(1), span(), vec![]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![decl, assign])).unwrap();
    let st = collapse(unit).unwrap();
    let mut out = String::new();
    emit_global_userstart(&mut out, &st).unwrap();
    assert!(out.contains("li"));
    assert!(out.contains("global_x"));
    assert!(out.contains("sb"));
  }

  #[test]
  fn asm_function_short_circuits_without_allocating_registers() {
    let f = Ast::new(NodeKind::FunctionDef { name: "raw".into(), is_asm: true }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::AsmLine { text: "nop".into() }, span(), vec![]),
      ]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![f])).unwrap();
    let st = collapse(unit).unwrap();
    let mut out = String::new();
    emit_function(&mut out, &st, FunctionId(0)).unwrap();
    assert!(out.starts_with("raw:\n"));
    assert!(out.contains("\tnop\n"));
    assert!(out.contains("\tjalr zero, 0(ra)\n"));
  }

  #[test]
  fn function_returning_an_argument_moves_it_into_the_return_register() {
    // fun identity(u8 a -> u8) { return a; }
    let f = Ast::new(NodeKind::FunctionDef { name: "identity".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Identifier("a".into()), span(), vec![]),
        ]),
      ]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![f])).unwrap();
    let st = collapse(unit).unwrap();
    let mut out = String::new();
    emit_function(&mut out, &st, FunctionId(0)).unwrap();
    assert!(out.contains("identity_done:"));
    assert!(out.contains("\tjalr zero, 0(ra)\n"));
  }

  #[test]
  fn reg_name_table_matches_the_riscv_calling_convention() {
    assert_eq!(reg_name(0), "zero");
    assert_eq!(reg_name(RETURN_REGISTER), "a0");
    assert_eq!(reg_name(SCRATCH[0]), "t0");
    assert_eq!(reg_name(8), "fp");
  }
}
