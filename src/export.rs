//! §4.7 "Export framer": wraps the assembly text [`crate::emit`] produces in
//! the `~export … ~end export …` textual bracket pairs the downstream
//! assembler/linker expects, for functions, the global `userstart`/`asm`
//! sections, and global variables.

use crate::emit;
use crate::error::Result;
use crate::types::symtab::{FunctionId, ScopeMemberKind, SymbolTable, VariableEntry};
use crate::types::ty::{Basic, Type};

/// Render a [`Type`] the way source declarations spell it: basic/class name,
/// then one `*` per indirection, then `[n]` if it's a storage array.
fn type_name(ty: &Type) -> String {
  let mut s = match ty.basic {
    Basic::Void => "void".to_string(),
    Basic::U8 => "u8".to_string(),
    Basic::U16 => "u16".to_string(),
    Basic::U32 => "u32".to_string(),
    Basic::Class => format!("class {}", ty.class_name.as_deref().unwrap_or("?")),
  };
  for _ in 0..ty.indirection {
    s.push('*');
  }
  if ty.array_size > 0 {
    s.push_str(&format!("[{}]", ty.array_size));
  }
  s
}

/// One function's `~export funcdef|funcdec` block: signature, then the
/// function body if it's actually defined (a forward declaration only ever
/// carries the signature).
pub fn export_function(out: &mut String, symtab: &SymbolTable, function_id: FunctionId) -> Result<()> {
  let function = symtab.function(function_id);
  let kind = if function.is_defined { "funcdef" } else { "funcdec" };
  let name = function.name;

  out.push_str(&format!("~export {kind} {name}\n"));
  out.push_str(&format!("returns {}\n", type_name(&function.return_type)));
  out.push_str(&format!("{} arguments\n", function.arguments.len()));
  for arg in &function.arguments {
    out.push_str(&format!("{} {}\n", type_name(&arg.ty), arg.name));
  }
  if function.is_defined {
    emit::emit_function(out, symtab, function_id)?;
  }
  out.push_str(&format!("~end export {kind} {name}\n"));
  Ok(())
}

/// The global label-0 block: whatever top-level assignments the source
/// program runs before `main` (plus the synthetic `call main`, §10.6 item 4).
pub fn export_userstart_section(out: &mut String, symtab: &SymbolTable) -> Result<()> {
  out.push_str("~export section userstart\n");
  emit::emit_global_userstart(out, symtab)?;
  out.push_str("~end export section userstart\n");
  Ok(())
}

/// The global label-1 block: top-level `asm { ... }` lines, verbatim.
pub fn export_asm_section(out: &mut String, symtab: &SymbolTable) -> Result<()> {
  out.push_str("~export section asm\n");
  emit::emit_global_asm(out, symtab)?;
  out.push_str("~end export section asm\n");
  Ok(())
}

/// One global variable's `~export variable` block: type, then either its
/// compile-time initializer as `.byte` directives (one per element for an
/// array — a string literal's backing storage is the common case) or
/// `noinitialize` when it's assigned by code in the `userstart` section
/// instead (§8 scenario S2).
pub fn export_variable(out: &mut String, var: &VariableEntry) -> Result<()> {
  let name = var.name;
  out.push_str(&format!("~export variable {name}\n"));
  out.push_str(&format!("{}\n", type_name(&var.ty)));
  match &var.ty.initializer_bytes {
    Some(bytes) => {
      out.push_str("initialize\n");
      for byte in bytes.iter() {
        out.push_str(&format!(".byte {byte:#04x}\n"));
      }
    }
    None => out.push_str("noinitialize\n"),
  }
  out.push_str(&format!("~end export variable {name}\n"));
  Ok(())
}

/// Whole-program export: every function in declaration order, the
/// `userstart` and `asm` global sections, then every global variable in
/// declaration order. Mirrors the "global scope iteration" order §4.7
/// describes.
pub fn export_program(out: &mut String, symtab: &SymbolTable) -> Result<()> {
  for function_id in (0..symtab.functions.len()).map(|i| FunctionId(u32::try_from(i).expect("function arena overflow"))) {
    export_function(out, symtab, function_id)?;
  }

  export_userstart_section(out, symtab)?;
  export_asm_section(out, symtab)?;

  let globals: Vec<VariableEntry> = symtab.scope(symtab.global_scope).entries.iter()
    .filter_map(|e| if let ScopeMemberKind::Variable(v) = &e.kind { Some(v.clone()) } else { None })
    .collect();
  for var in &globals {
    export_variable(out, var)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::linearizer::Linearizer;
  use crate::scope_collapse::collapse;
  use crate::types::ast::{Ast, AssignOp, BasicTypeName, NodeKind, Span, TypeName};

  fn span() -> Span { Span { file: "t.cls".into(), line: 1, col: 1 } }

  fn u8_type() -> Ast {
    Ast::new(NodeKind::TypeName(TypeName {
      basic: BasicTypeName::U8, indirection: 0, array_size: 0, class_name: None,
    }), span(), vec![])
  }

  fn program(children: Vec<Ast>) -> Ast { Ast::new(NodeKind::Program, span(), children) }

  #[test]
  fn function_definition_is_wrapped_in_matching_funcdef_markers() {
    // fun add(u8 a, u8 b -> u8) { return a + b; } -- S1 (§8).
    let f = Ast::new(NodeKind::FunctionDef { name: "add".into(), is_asm: false }, span(), vec![
      u8_type(),
      Ast::new(NodeKind::VariableDecl { name: "a".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::VariableDecl { name: "b".into() }, span(), vec![u8_type()]),
      Ast::new(NodeKind::Scope, span(), vec![
        Ast::new(NodeKind::Return, span(), vec![
          Ast::new(NodeKind::Binary(crate::types::ast::BinOp::Add), span(), vec![
            Ast::new(NodeKind::Identifier("a".into()), span(), vec![]),
            Ast::new(NodeKind::Identifier("b".into()), span(), vec![]),
          ]),
        ]),
      ]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![f])).unwrap();
    let st = collapse(unit).unwrap();
    let mut out = String::new();
    export_function(&mut out, &st, FunctionId(0)).unwrap();
    assert!(out.starts_with("~export funcdef add\n"));
    assert!(out.contains("returns u8\n"));
    assert!(out.contains("2 arguments\n"));
    assert!(out.contains("u8 add_a\n") || out.contains("u8 a\n"));
    assert!(out.trim_end().ends_with("~end export funcdef add"));
  }

  #[test]
  fn undefined_prototype_emits_funcdec_with_no_body() {
    let f = Ast::new(NodeKind::FunctionDef { name: "proto".into(), is_asm: false }, span(), vec![u8_type()]);
    let unit = Linearizer::new().compile(&program(vec![f])).unwrap();
    let st = collapse(unit).unwrap();
    let mut out = String::new();
    export_function(&mut out, &st, FunctionId(0)).unwrap();
    assert!(out.contains("~export funcdec proto\n"));
    assert!(out.contains("~end export funcdec proto\n"));
    assert!(!out.contains("proto:\n"));
  }

  #[test]
  fn global_variable_without_initializer_is_noinitialize() {
    // u8 x; x = 1; -- S2 (§8).
    let decl = Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("x".into()), span(), vec![]),
      Ast::new(NodeKind::IntConstant(1), span(), vec![]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![decl, assign])).unwrap();
    let st = collapse(unit).unwrap();
    let var = match &st.scope(st.global_scope).entries[0].kind {
      ScopeMemberKind::Variable(v) => v.clone(),
      _ => panic!("expected a variable entry"),
    };
    let mut out = String::new();
    export_variable(&mut out, &var).unwrap();
    assert!(out.contains("~export variable global_x\n"));
    assert!(out.contains("u8\n"));
    assert!(out.contains("noinitialize\n"));
  }

  #[test]
  fn string_literal_global_carries_byte_initializer() {
    let decl = Ast::new(NodeKind::VariableDecl { name: "unused".into() }, span(), vec![
      Ast::new(NodeKind::TypeName(TypeName {
        basic: BasicTypeName::U8, indirection: 1, array_size: 0, class_name: None,
      }), span(), vec![]),
    ]);
    let assign = Ast::new(NodeKind::Assign(AssignOp::Assign), span(), vec![
      Ast::new(NodeKind::Identifier("unused".into()), span(), vec![]),
      Ast::new(NodeKind::StringLiteral("hi".into()), span(), vec![]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![decl, assign])).unwrap();
    let st = collapse(unit).unwrap();
    let string_var = st.scope(st.global_scope).entries.iter().find_map(|e| match &e.kind {
      ScopeMemberKind::Variable(v) if v.ty.initializer_bytes.is_some() => Some(v.clone()),
      _ => None,
    }).expect("string literal should have created a global with an initializer");
    let mut out = String::new();
    export_variable(&mut out, &string_var).unwrap();
    assert!(out.contains("initialize\n"));
    assert!(out.contains(".byte 0x68\n")); // 'h'
    assert!(out.contains(".byte 0x00\n")); // trailing nul
  }

  #[test]
  fn whole_program_export_orders_functions_then_sections_then_variables() {
    let decl = Ast::new(NodeKind::VariableDecl { name: "x".into() }, span(), vec![u8_type()]);
    let f = Ast::new(NodeKind::FunctionDef { name: "main".into(), is_asm: false }, span(), vec![
      Ast::new(NodeKind::TypeName(TypeName {
        basic: BasicTypeName::Void, indirection: 0, array_size: 0, class_name: None,
      }), span(), vec![]),
      Ast::new(NodeKind::Scope, span(), vec![Ast::new(NodeKind::Return, span(), vec![])]),
    ]);
    let unit = Linearizer::new().compile(&program(vec![decl, f])).unwrap();
    let st = collapse(unit).unwrap();
    let mut out = String::new();
    export_program(&mut out, &st).unwrap();
    let fn_pos = out.find("~export funcdef main").unwrap();
    let userstart_pos = out.find("~export section userstart").unwrap();
    let asm_pos = out.find("~export section asm").unwrap();
    let var_pos = out.find("~export variable global_x").unwrap();
    assert!(fn_pos < userstart_pos);
    assert!(userstart_pos < asm_pos);
    assert!(asm_pos < var_pos);
  }
}
