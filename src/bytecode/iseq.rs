//! Instruction sequences and program files

use super::insn::Insn;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What kind of frame an instruction sequence runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IseqKind {
    /// Program entry
    Top,
    /// Method body
    Method,
    /// Block body (reaches the defining frame's locals through levels)
    Block,
}

/// A named instruction sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iseq {
    pub name: String,
    pub kind: IseqKind,
    /// Number of parameters (stored in the first locals)
    #[serde(default)]
    pub params: u32,
    /// Number of locals, parameters included
    #[serde(default)]
    pub locals: u32,
    pub code: Vec<Insn>,
    /// Source line of every instruction (optional)
    #[serde(default)]
    pub lines: Vec<u32>,
}

impl Iseq {
    pub fn new(name: impl Into<String>, kind: IseqKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: 0,
            locals: 0,
            code: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Source line of the instruction at `offset`, 0 if unknown
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    /// Check that every branch stays inside the sequence and that the
    /// parameter count fits the locals
    pub fn validate(&self) -> Result<()> {
        if self.params > self.locals {
            return Err(Error::bytecode(format!(
                "{}: {} params but only {} locals",
                self.name, self.params, self.locals
            )));
        }
        if !self.lines.is_empty() && self.lines.len() != self.code.len() {
            return Err(Error::bytecode(format!(
                "{}: line table has {} entries for {} instructions",
                self.name,
                self.lines.len(),
                self.code.len()
            )));
        }
        let len = self.code.len() as i64;
        for (i, insn) in self.code.iter().enumerate() {
            if let Some(offset) = insn.branch_offset() {
                let target = i as i64 + 1 + offset as i64;
                if target < 0 || target >= len {
                    return Err(Error::bytecode(format!(
                        "{}: {} at {} jumps outside the sequence",
                        self.name,
                        insn.name(),
                        i
                    )));
                }
            }
            if let Insn::GetLocal { idx, level: 0 } | Insn::SetLocal { idx, level: 0 } = insn {
                if *idx >= self.locals {
                    return Err(Error::bytecode(format!(
                        "{}: local {} out of range at {}",
                        self.name, idx, i
                    )));
                }
            }
        }
        Ok(())
    }
}

/// How a method is implemented
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodBody {
    /// Bytecode method: name of an iseq of kind `method`
    Iseq(String),
    /// `attr_reader`: instance variable name without `@`
    AttrReader(String),
    /// `attr_writer`: instance variable name without `@`
    AttrWriter(String),
}

/// A method declared by a program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub body: MethodBody,
}

/// A class declared by a program
///
/// Declaring a class that already exists (including builtins such as
/// `Integer`) reopens it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    #[serde(default)]
    pub superclass: Option<String>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub singleton_methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            methods: Vec::new(),
            singleton_methods: Vec::new(),
        }
    }
}

/// A complete program: instruction sequences, classes and the entry point
///
/// Sequences of kind `method` that no class claims become private methods of
/// `Object`, like top-level `def` in Ruby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub iseqs: Vec<Iseq>,
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    pub entry: String,
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            iseqs: Vec::new(),
            classes: Vec::new(),
            entry: entry.into(),
        }
    }

    pub fn with_iseq(mut self, iseq: Iseq) -> Self {
        self.iseqs.push(iseq);
        self
    }

    pub fn with_class(mut self, class: ClassDef) -> Self {
        self.classes.push(class);
        self
    }

    pub fn iseq(&self, name: &str) -> Option<&Iseq> {
        self.iseqs.iter().find(|iseq| iseq.name == name)
    }

    /// Validate every sequence and every cross reference
    pub fn validate(&self) -> Result<()> {
        let mut seen = rustc_hash::FxHashSet::default();
        for iseq in &self.iseqs {
            if !seen.insert(iseq.name.as_str()) {
                return Err(Error::bytecode(format!("duplicate iseq {}", iseq.name)));
            }
            iseq.validate()?;
        }
        if self.iseq(&self.entry).is_none() {
            return Err(Error::bytecode(format!("entry iseq {} not found", self.entry)));
        }
        for iseq in &self.iseqs {
            for insn in &iseq.code {
                if let Some(block) = insn.call_info().and_then(|ci| ci.block.as_ref()) {
                    match self.iseq(block) {
                        Some(b) if b.kind == IseqKind::Block => {}
                        _ => {
                            return Err(Error::bytecode(format!(
                                "{}: block {} is not a block iseq",
                                iseq.name, block
                            )))
                        }
                    }
                }
            }
        }
        for class in &self.classes {
            for method in class.methods.iter().chain(&class.singleton_methods) {
                if let MethodBody::Iseq(name) = &method.body {
                    if self.iseq(name).is_none() {
                        return Err(Error::bytecode(format!(
                            "{}#{}: iseq {} not found",
                            class.name, method.name, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // ==================== Serialization ====================

    pub fn from_json_str(json: &str) -> Result<Self> {
        let program: Program = serde_json::from_str(json)?;
        program.validate()?;
        Ok(program)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode a binary program image
    pub fn from_image(bytes: &[u8]) -> Result<Self> {
        let program: Program = bincode::deserialize(bytes)?;
        program.validate()?;
        Ok(program)
    }

    /// Encode as a binary program image
    pub fn to_image(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Load a program, picking the format from the file extension
    /// (`.json`, `.qtb` binary image, anything else is assembly text)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&std::fs::read_to_string(path)?),
            Some("qtb") => Self::from_image(&std::fs::read(path)?),
            _ => super::asm::assemble(&std::fs::read_to_string(path)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::insn::{CallInfo, Literal};

    fn tiny() -> Program {
        let mut main = Iseq::new("main", IseqKind::Top);
        main.code = vec![
            Insn::PutObject {
                value: Literal::Int(1),
            },
            Insn::Leave,
        ];
        Program::new("main").with_iseq(main)
    }

    #[test]
    fn test_validate_ok() {
        assert!(tiny().validate().is_ok());
    }

    #[test]
    fn test_validate_branch_out_of_range() {
        let mut program = tiny();
        program.iseqs[0].code.insert(0, Insn::Jump { offset: 10 });
        assert!(matches!(program.validate(), Err(Error::Bytecode(_))));
    }

    #[test]
    fn test_validate_missing_block() {
        let mut program = tiny();
        program.iseqs[0].code.insert(
            0,
            Insn::Send {
                ci: CallInfo::new("each", 0).with_block("nope"),
            },
        );
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_missing_entry() {
        let mut program = tiny();
        program.entry = "start".into();
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_json_and_image_agree() {
        let program = tiny();
        let json = program.to_json_string().unwrap();
        let image = program.to_image().unwrap();
        assert_eq!(Program::from_json_str(&json).unwrap(), Program::from_image(&image).unwrap());
    }
}
