//! Bytecode of the host interpreter
//!
//! The JIT consumes YARV-style instruction sequences. This module defines
//! the instruction set ([`Insn`]), program counters ([`Pc`]), call sites,
//! instruction sequences, and the three ways to produce programs: the
//! [`IseqBuilder`] API, the text [`asm`] format, and serialized JSON or
//! binary images.

pub mod asm;
mod builder;
mod disasm;
mod insn;
mod iseq;

pub use asm::assemble;
pub use builder::IseqBuilder;
pub use disasm::{disassemble, disassemble_program, loop_headers};
pub use insn::{CallFlags, CallInfo, CheckMatchKind, Insn, Literal, Pc};
pub use iseq::{ClassDef, Iseq, IseqKind, MethodBody, MethodDef, Program};
