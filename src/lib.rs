//! Middle and back end for the Classical language: lowers a parsed AST to
//! RISC-V-style assembly text framed with `~export` markers.
//!
//! The pipeline mirrors §1's module list: [`types::ty`]/[`types::symtab`]
//! (type system and scope tree) feed [`linearizer`] (AST walk to TAC),
//! [`scope_collapse`] (scope mangling/flattening), [`regalloc`] (lifetime
//! discovery and register assignment), [`emit`] (per-block assembly text),
//! and finally [`export`] (the `~export` bracket framer). [`Compiler::compile`]
//! runs all five in order; [`Pipeline`] adds the `-O` level check a driver
//! binary is expected to perform before calling in.

pub mod emit;
pub mod error;
pub mod export;
pub mod linearizer;
pub mod regalloc;
pub mod scope_collapse;
pub mod symbol;
pub mod types;

use error::{CompileError, Result};
use types::ast::Ast;

/// The only configuration surface the core crate owns (§10.3): a single
/// optimization-level knob collapsing `-O`/`-l`/`-r`/`-c`. Only level `0` is
/// implemented anywhere in this pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompileOptions {
  pub opt_level: u8,
}

impl Default for CompileOptions {
  fn default() -> Self { CompileOptions { opt_level: 0 } }
}

/// The whole-program compiler entry point: linearize, collapse scopes,
/// allocate registers and emit code per function and per global section,
/// then frame everything in `~export` markers.
pub struct Compiler;

impl Compiler {
  /// Run the full pipeline over an already-parsed program, returning the
  /// complete emission file as a single string (§6 "Emission file format").
  pub fn compile(program: &Ast) -> Result<String> {
    log::info!("compiling program with {} top-level declaration(s)", program.children.len());

    let unit = linearizer::Linearizer::new().compile(program)?;
    let symtab = scope_collapse::collapse(unit)?;

    let mut out = String::new();
    export::export_program(&mut out, &symtab)?;

    log::info!(
      "emitted {} byte(s) of assembly across {} function(s), {} class(es)",
      out.len(), symtab.functions.len(), symtab.classes.len(),
    );
    Ok(out)
  }
}

/// A configured compilation run. Exists separately from [`Compiler`] so the
/// `-O`/`-l`/`-r`/`-c` level check (§10.3) happens at a single well-defined
/// entry point, leaving [`Compiler::compile`] itself free of configuration
/// state beyond the AST it's given.
pub struct Pipeline {
  pub options: CompileOptions,
}

impl Pipeline {
  #[must_use] pub fn new(options: CompileOptions) -> Self { Pipeline { options } }

  /// Validate the configured optimization level, then run [`Compiler::compile`].
  pub fn run(&self, program: &Ast) -> Result<String> {
    if self.options.opt_level != 0 {
      return Err(CompileError::Invocation(format!(
        "unsupported optimization level {}; only level 0 is implemented", self.options.opt_level)));
    }
    Compiler::compile(program)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use types::ast::{AssignOp, BasicTypeName, NodeKind, Span, TypeName};

  fn span() -> Span { Span { file: "t.cls".into(), line: 1, col: 1 } }

  fn u8_type() -> Ast {
    Ast::new(NodeKind::TypeName(TypeName {
      basic: BasicTypeName::U8, indirection: 0, array_size: 0, class_name: None,
    }), span(), vec![])
  }

  fn program(children: Vec<Ast>) -> Ast { Ast::new(NodeKind::Program, span(), children) }

  #[test]
  fn pipeline_rejects_nonzero_optimization_level() {
    let p = Pipeline::new(CompileOptions { opt_level: 1 });
    let prog = program(vec![]);
    let err = p.run(&prog).unwrap_err();
    assert!(matches!(err, CompileError::Invocation(_)));
  }

  #[test]
  fn pipeline_at_level_zero_runs_the_full_compiler() {
    // u8 x; x = 1; -- S2 (§8), driven through the public Pipeline API.
    let decl = Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("x".into()), span(), vec![]),
      Ast::new(NodeKind::IntConstant(1), span(), vec![]),
    ]);
    let prog = program(vec![decl, assign]);
    let p = Pipeline::new(CompileOptions::default());
    let out = p.run(&prog).unwrap();
    assert!(out.contains("~export variable global_x"));
    assert!(out.contains("~export section userstart"));
    assert!(out.contains("~export section asm"));
    assert!(out.contains("noinitialize"));
  }

  #[test]
  fn compiler_compile_matches_pipeline_at_default_options() {
    let prog = program(vec![]);
    let direct = Compiler::compile(&prog).unwrap();
    let via_pipeline = Pipeline::new(CompileOptions::default()).run(&prog).unwrap();
    assert_eq!(direct, via_pipeline);
  }
}
