//! Disassembler

use super::insn::Insn;
use super::iseq::{Iseq, MethodBody, Program};
use std::fmt::Write;

/// Render one sequence, one instruction per line, with branch targets
/// resolved to offsets
pub fn disassemble(iseq: &Iseq) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "== disasm: <{:?}:{}> params={} locals={}",
        iseq.kind, iseq.name, iseq.params, iseq.locals
    );
    for (offset, insn) in iseq.code.iter().enumerate() {
        let _ = write!(out, "{:04} {}", offset, insn);
        if let Some(rel) = insn.branch_offset() {
            let target = offset as i64 + 1 + rel as i64;
            let _ = write!(out, " -> {:04}", target);
            if insn.is_backward_branch() {
                out.push_str(" (loop)");
            }
        }
        let line = iseq.line_at(offset);
        if line > 0 {
            let _ = write!(out, "  ({})", line);
        }
        out.push('\n');
    }
    out
}

/// Render a whole program: classes first, then every sequence
pub fn disassemble_program(program: &Program) -> String {
    let mut out = String::new();
    for class in &program.classes {
        let _ = write!(out, "class {}", class.name);
        if let Some(superclass) = &class.superclass {
            let _ = write!(out, " < {}", superclass);
        }
        out.push('\n');
        for (method, prefix) in class
            .methods
            .iter()
            .map(|m| (m, "#"))
            .chain(class.singleton_methods.iter().map(|m| (m, ".")))
        {
            let body = match &method.body {
                MethodBody::Iseq(name) => format!("iseq {}", name),
                MethodBody::AttrReader(ivar) => format!("attr_reader @{}", ivar),
                MethodBody::AttrWriter(ivar) => format!("attr_writer @{}", ivar),
            };
            let _ = writeln!(out, "  {}{} => {}", prefix, method.name, body);
        }
    }
    for iseq in &program.iseqs {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&disassemble(iseq));
    }
    out
}

/// Count of loop headers (backward `branchif`) in a sequence
pub fn loop_headers(iseq: &Iseq) -> usize {
    iseq.code.iter().filter(|i| Insn::is_backward_branch(i)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::IseqBuilder;
    use crate::bytecode::iseq::IseqKind;

    #[test]
    fn test_disassemble_marks_loops() {
        let mut b = IseqBuilder::new("spin", IseqKind::Top);
        b.label("top").putobject_int(1).branchif("top").putnil().leave();
        let iseq = b.build().unwrap();
        let text = disassemble(&iseq);
        assert!(text.starts_with("== disasm: <Top:spin>"));
        assert!(text.contains("-> 0000 (loop)"));
        assert_eq!(loop_headers(&iseq), 1);
    }
}
