//! Text assembler for programs
//!
//! One instruction per line, `label:` lines define branch targets and `#`
//! starts a comment. Sequences are declared with `top`, `def` and `block`;
//! classes with `class Name < Super` and closed with `end`:
//!
//! ```text
//! class Point
//!   attr_reader x y
//!   def initialize params=2
//!     getlocal 0
//!     setinstancevariable @x
//!     getlocal 1
//!     setinstancevariable @y
//!     putnil
//!     leave
//!   end
//! end
//!
//! top main locals=1
//!   getconstant Point
//!   putobject 1
//!   putobject 2
//!   send new 2
//!   leave
//! end
//! ```
//!
//! Top-level `def` sequences become methods of `Object`. Methods declared
//! inside a class are named `Class#name` (`Class.name` for `def self.name`).

use super::builder::IseqBuilder;
use super::insn::{CallFlags, CallInfo, CheckMatchKind, Insn, Literal};
use super::iseq::{ClassDef, IseqKind, MethodBody, MethodDef, Program};
use crate::error::{Error, Result};

/// Assemble program text
pub fn assemble(source: &str) -> Result<Program> {
    let mut asm = Assembler::default();
    for (index, raw) in source.lines().enumerate() {
        asm.line(index + 1, raw)?;
    }
    asm.finish()
}

// ==================== Tokens ====================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Regexp(String),
    Array(Vec<Literal>),
}

fn is_ident_start(c: char) -> bool {
    c == '_' || unicode_xid::UnicodeXID::is_xid_start(c)
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || unicode_xid::UnicodeXID::is_xid_continue(c)
}

/// Identifier, optionally ending in `?`, `!` or `=`
fn is_identifier(word: &str) -> bool {
    let body = word.strip_suffix(['?', '!', '=']).unwrap_or(word);
    let mut chars = body.chars();
    match chars.next() {
        Some(c) if is_ident_start(c) => chars.all(is_ident_continue),
        _ => false,
    }
}

const OPERATOR_METHODS: &[&str] = &[
    "+", "-", "*", "/", "%", "**", "==", "!=", "<", "<=", ">", ">=", "<=>", "<<", ">>", "&",
    "|", "^", "~", "!", "[]", "[]=", "=~", "===", "-@", "+@",
];

fn is_method_name(word: &str) -> bool {
    is_identifier(word) || OPERATOR_METHODS.contains(&word)
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Self {
            chars: text.chars().peekable(),
            line,
        }
    }

    fn skip_space(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            self.chars.next();
        }
    }

    fn quoted(&mut self, close: char) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(Error::asm(format!("unterminated {}", close), self.line)),
                Some(c) if c == close => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) if c == close || c == '\\' => out.push(c),
                    // regexp escapes are kept verbatim
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return Err(Error::asm("dangling escape", self.line)),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn word(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || c == ',' || c == ']' || c == '#' {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }

    fn array(&mut self) -> Result<Vec<Literal>> {
        let mut items = Vec::new();
        loop {
            self.skip_space();
            match self.chars.peek() {
                None => return Err(Error::asm("unterminated array", self.line)),
                Some(']') => {
                    self.chars.next();
                    return Ok(items);
                }
                _ => {
                    let token = self
                        .token()?
                        .ok_or_else(|| Error::asm("unterminated array", self.line))?;
                    items.push(literal(&token, self.line)?);
                }
            }
        }
    }

    fn token(&mut self) -> Result<Option<Token>> {
        self.skip_space();
        let token = match self.chars.peek() {
            None | Some('#') => return Ok(None),
            Some('"') => {
                self.chars.next();
                Token::Str(self.quoted('"')?)
            }
            Some('/') => {
                self.chars.next();
                if matches!(self.chars.peek(), None | Some(' ')) {
                    Token::Word("/".into())
                } else {
                    Token::Regexp(self.quoted('/')?)
                }
            }
            Some('[') => {
                self.chars.next();
                if self.chars.peek() == Some(&']') {
                    // `[]` and `[]=` are method names
                    self.chars.next();
                    let mut name = String::from("[]");
                    name.push_str(&self.word());
                    Token::Word(name)
                } else {
                    Token::Array(self.array()?)
                }
            }
            Some(_) => Token::Word(self.word()),
        };
        Ok(Some(token))
    }

    fn tokens(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        while let Some(token) = self.token()? {
            out.push(token);
        }
        Ok(out)
    }
}

fn parse_int(word: &str, line: usize) -> Result<i64> {
    lexical_core::parse::<i64>(word.as_bytes())
        .map_err(|_| Error::asm(format!("expected integer, found {}", word), line))
}

fn parse_u32(word: &str, line: usize) -> Result<u32> {
    lexical_core::parse::<u32>(word.as_bytes())
        .map_err(|_| Error::asm(format!("expected count, found {}", word), line))
}

fn literal(token: &Token, line: usize) -> Result<Literal> {
    Ok(match token {
        Token::Str(s) => Literal::Str(s.clone()),
        Token::Regexp(s) => Literal::Regexp(s.clone()),
        Token::Array(items) => Literal::Array(items.clone()),
        Token::Word(w) => match w.as_str() {
            "nil" => Literal::Nil,
            "true" => Literal::True,
            "false" => Literal::False,
            _ if w.starts_with(':') && is_method_name(&w[1..]) => Literal::Sym(w[1..].to_string()),
            _ if w.contains(['.', 'e', 'E']) || w == "inf" || w == "-inf" => {
                Literal::Float(lexical_core::parse::<f64>(w.as_bytes()).map_err(|_| {
                    Error::asm(format!("bad float literal {}", w), line)
                })?)
            }
            _ => Literal::Int(parse_int(w, line)?),
        },
    })
}

// ==================== Assembler ====================

struct OpenIseq {
    builder: IseqBuilder,
    /// Owning class and whether the method is a singleton method
    owner: Option<(usize, bool)>,
    method_name: String,
}

#[derive(Default)]
struct Assembler {
    iseqs: Vec<super::iseq::Iseq>,
    classes: Vec<ClassDef>,
    open_class: Option<usize>,
    open_iseq: Option<OpenIseq>,
    entry: Option<String>,
}

impl Assembler {
    fn line(&mut self, line: usize, raw: &str) -> Result<()> {
        let tokens = Scanner::new(raw, line).tokens()?;
        let Some(Token::Word(head)) = tokens.first() else {
            if tokens.is_empty() {
                return Ok(());
            }
            return Err(Error::asm("expected a mnemonic or directive", line));
        };
        let head = head.clone();
        let rest = &tokens[1..];

        if head == "end" {
            return self.end(line);
        }
        if self.open_iseq.is_some() {
            if let Some(label) = head.strip_suffix(':') {
                if !is_identifier(label) {
                    return Err(Error::asm(format!("bad label {}", label), line));
                }
                self.current(line)?.builder.label(label);
                return Ok(());
            }
            let insn = instruction(&head, rest, line)?;
            let open = self.current(line)?;
            open.builder.line(line as u32);
            return match insn {
                Parsed::Insn(insn) => {
                    open.builder.emit(insn);
                    Ok(())
                }
                Parsed::Branch(Branch::Jump, label) => {
                    open.builder.jump(&label);
                    Ok(())
                }
                Parsed::Branch(Branch::If, label) => {
                    open.builder.branchif(&label);
                    Ok(())
                }
                Parsed::Branch(Branch::Unless, label) => {
                    open.builder.branchunless(&label);
                    Ok(())
                }
                Parsed::InlineCache(label, slot) => {
                    open.builder.getinlinecache(&label, slot);
                    Ok(())
                }
            };
        }

        match head.as_str() {
            "entry" => {
                let name = word_at(rest, 0, line)?;
                self.entry = Some(name.to_string());
                Ok(())
            }
            "class" => self.open_class(rest, line),
            "attr_reader" | "attr_writer" | "attr_accessor" => self.attrs(&head, rest, line),
            "top" | "def" | "block" => self.open_iseq(&head, rest, line),
            other => Err(Error::asm(format!("unexpected {} outside a sequence", other), line)),
        }
    }

    fn current(&mut self, line: usize) -> Result<&mut OpenIseq> {
        self.open_iseq
            .as_mut()
            .ok_or_else(|| Error::asm("no open sequence", line))
    }

    fn open_class(&mut self, rest: &[Token], line: usize) -> Result<()> {
        if self.open_class.is_some() {
            return Err(Error::asm("nested classes are not supported", line));
        }
        let name = word_at(rest, 0, line)?;
        if !is_identifier(name) {
            return Err(Error::asm(format!("bad class name {}", name), line));
        }
        let mut class = ClassDef::new(name);
        if let Some(Token::Word(lt)) = rest.get(1) {
            if lt != "<" {
                return Err(Error::asm("expected `<` before the superclass", line));
            }
            class.superclass = Some(word_at(rest, 2, line)?.to_string());
        }
        self.classes.push(class);
        self.open_class = Some(self.classes.len() - 1);
        Ok(())
    }

    fn attrs(&mut self, kind: &str, rest: &[Token], line: usize) -> Result<()> {
        let index = self
            .open_class
            .ok_or_else(|| Error::asm(format!("{} outside a class", kind), line))?;
        for token in rest {
            let Token::Word(name) = token else {
                return Err(Error::asm("expected attribute name", line));
            };
            let name = name.trim_start_matches(':');
            if !is_identifier(name) {
                return Err(Error::asm(format!("bad attribute {}", name), line));
            }
            let class = &mut self.classes[index];
            if kind != "attr_writer" {
                class.methods.push(MethodDef {
                    name: name.to_string(),
                    body: MethodBody::AttrReader(name.to_string()),
                });
            }
            if kind != "attr_reader" {
                class.methods.push(MethodDef {
                    name: format!("{}=", name),
                    body: MethodBody::AttrWriter(name.to_string()),
                });
            }
        }
        Ok(())
    }

    fn open_iseq(&mut self, kind: &str, rest: &[Token], line: usize) -> Result<()> {
        let raw_name = word_at(rest, 0, line)?;
        let (singleton, method_name) = match raw_name.strip_prefix("self.") {
            Some(name) => (true, name),
            None => (false, raw_name),
        };
        if !is_method_name(method_name) {
            return Err(Error::asm(format!("bad sequence name {}", raw_name), line));
        }
        let iseq_kind = match kind {
            "top" => IseqKind::Top,
            "block" => IseqKind::Block,
            _ => IseqKind::Method,
        };
        if iseq_kind != IseqKind::Method && (singleton || self.open_class.is_some()) {
            return Err(Error::asm(format!("{} sequences must be top level", kind), line));
        }
        let owner = self.open_class.map(|c| (c, singleton));
        let iseq_name = match owner {
            Some((c, true)) => format!("{}.{}", self.classes[c].name, method_name),
            Some((c, false)) => format!("{}#{}", self.classes[c].name, method_name),
            None if singleton => {
                return Err(Error::asm("`def self.` outside a class", line));
            }
            None => method_name.to_string(),
        };

        let mut builder = IseqBuilder::new(iseq_name, iseq_kind);
        for token in &rest[1..] {
            let Token::Word(option) = token else {
                return Err(Error::asm("expected key=value option", line));
            };
            match option.split_once('=') {
                Some(("params", n)) => builder = builder.params(parse_u32(n, line)?),
                Some(("locals", n)) => builder = builder.locals(parse_u32(n, line)?),
                _ => return Err(Error::asm(format!("unknown option {}", option), line)),
            }
        }
        self.open_iseq = Some(OpenIseq {
            builder,
            owner,
            method_name: method_name.to_string(),
        });
        Ok(())
    }

    fn end(&mut self, line: usize) -> Result<()> {
        if let Some(open) = self.open_iseq.take() {
            let iseq = open.builder.build().map_err(|e| Error::asm(e.to_string(), line))?;
            if let Some((class, singleton)) = open.owner {
                let def = MethodDef {
                    name: open.method_name,
                    body: MethodBody::Iseq(iseq.name.clone()),
                };
                let class = &mut self.classes[class];
                if singleton {
                    class.singleton_methods.push(def);
                } else {
                    class.methods.push(def);
                }
            }
            self.iseqs.push(iseq);
            return Ok(());
        }
        if self.open_class.take().is_some() {
            return Ok(());
        }
        Err(Error::asm("`end` without an open class or sequence", line))
    }

    fn finish(mut self) -> Result<Program> {
        if self.open_iseq.is_some() || self.open_class.is_some() {
            return Err(Error::asm("missing `end` at end of input", 0));
        }
        let entry = match self.entry.take() {
            Some(entry) => entry,
            None => self
                .iseqs
                .iter()
                .find(|i| i.kind == IseqKind::Top)
                .map(|i| i.name.clone())
                .unwrap_or_else(|| "main".to_string()),
        };
        let program = Program {
            iseqs: self.iseqs,
            classes: self.classes,
            entry,
        };
        program.validate()?;
        Ok(program)
    }
}

fn word_at(tokens: &[Token], index: usize, line: usize) -> Result<&str> {
    match tokens.get(index) {
        Some(Token::Word(w)) => Ok(w),
        _ => Err(Error::asm("missing operand", line)),
    }
}

fn string_at(tokens: &[Token], index: usize, line: usize) -> Result<String> {
    match tokens.get(index) {
        Some(Token::Str(s)) | Some(Token::Regexp(s)) => Ok(s.clone()),
        _ => Err(Error::asm("expected string operand", line)),
    }
}

fn u32_at(tokens: &[Token], index: usize, line: usize) -> Result<u32> {
    parse_u32(word_at(tokens, index, line)?, line)
}

fn u32_or(tokens: &[Token], index: usize, default: u32, line: usize) -> Result<u32> {
    match tokens.get(index) {
        None => Ok(default),
        Some(_) => u32_at(tokens, index, line),
    }
}

fn name_at(tokens: &[Token], index: usize, sigil: char, line: usize) -> Result<String> {
    let word = word_at(tokens, index, line)?;
    let name = word.strip_prefix(sigil).unwrap_or(word);
    if !is_identifier(name) {
        return Err(Error::asm(format!("bad name {}", word), line));
    }
    Ok(name.to_string())
}

fn cvar_at(tokens: &[Token], line: usize) -> Result<String> {
    let word = word_at(tokens, 0, line)?;
    let name = word.trim_start_matches('@');
    if !is_identifier(name) {
        return Err(Error::asm(format!("bad class variable {}", word), line));
    }
    Ok(name.to_string())
}

enum Branch {
    Jump,
    If,
    Unless,
}

enum Parsed {
    Insn(Insn),
    Branch(Branch, String),
    InlineCache(String, u32),
}

fn call_info(tokens: &[Token], line: usize) -> Result<CallInfo> {
    let mid = word_at(tokens, 0, line)?;
    if !is_method_name(mid) {
        return Err(Error::asm(format!("bad method name {}", mid), line));
    }
    let argc = u32_or(tokens, 1, 0, line)?;
    let mut ci = CallInfo::new(mid, argc);
    for token in tokens.iter().skip(2) {
        let Token::Word(word) = token else {
            return Err(Error::asm("unexpected call operand", line));
        };
        match word.as_str() {
            "splat" => ci.flags |= CallFlags::ARGS_SPLAT,
            "blockarg" => ci.flags |= CallFlags::ARGS_BLOCKARG,
            "fcall" => ci.flags |= CallFlags::FCALL,
            "vcall" => ci.flags |= CallFlags::VCALL,
            block if block.starts_with('&') && is_identifier(&block[1..]) => {
                ci.block = Some(block[1..].to_string());
            }
            other => return Err(Error::asm(format!("unknown call flag {}", other), line)),
        }
    }
    Ok(ci)
}

fn instruction(mnemonic: &str, ops: &[Token], line: usize) -> Result<Parsed> {
    let insn = match mnemonic {
        "nop" => Insn::Nop,
        "getlocal" => Insn::GetLocal {
            idx: u32_at(ops, 0, line)?,
            level: u32_or(ops, 1, 0, line)?,
        },
        "setlocal" => Insn::SetLocal {
            idx: u32_at(ops, 0, line)?,
            level: u32_or(ops, 1, 0, line)?,
        },
        "getinstancevariable" => Insn::GetInstanceVariable {
            name: name_at(ops, 0, '@', line)?,
        },
        "setinstancevariable" => Insn::SetInstanceVariable {
            name: name_at(ops, 0, '@', line)?,
        },
        "getclassvariable" => Insn::GetClassVariable {
            name: cvar_at(ops, line)?,
        },
        "setclassvariable" => Insn::SetClassVariable {
            name: cvar_at(ops, line)?,
        },
        "getconstant" => Insn::GetConstant {
            name: name_at(ops, 0, ':', line)?,
        },
        "setconstant" => Insn::SetConstant {
            name: name_at(ops, 0, ':', line)?,
        },
        "getglobal" => Insn::GetGlobal {
            name: name_at(ops, 0, '$', line)?,
        },
        "setglobal" => Insn::SetGlobal {
            name: name_at(ops, 0, '$', line)?,
        },
        "putnil" => Insn::PutNil,
        "putself" => Insn::PutSelf,
        "putobject" => Insn::PutObject {
            value: literal(
                ops.first().ok_or_else(|| Error::asm("missing operand", line))?,
                line,
            )?,
        },
        "putstring" => Insn::PutString {
            value: string_at(ops, 0, line)?,
        },
        "concatstrings" => Insn::ConcatStrings {
            count: u32_at(ops, 0, line)?,
        },
        "tostring" => Insn::ToString,
        "toregexp" => Insn::ToRegexp {
            count: u32_at(ops, 0, line)?,
        },
        "newarray" => Insn::NewArray {
            count: u32_at(ops, 0, line)?,
        },
        "duparray" => match ops.first() {
            Some(Token::Array(items)) => Insn::DupArray {
                value: items.clone(),
            },
            _ => return Err(Error::asm("duparray expects [..]", line)),
        },
        "newhash" => Insn::NewHash {
            count: u32_at(ops, 0, line)?,
        },
        "newrange" => Insn::NewRange {
            exclusive: u32_or(ops, 0, 0, line)? != 0,
        },
        "pop" => Insn::Pop,
        "dup" => Insn::Dup,
        "dupn" => Insn::DupN {
            n: u32_at(ops, 0, line)?,
        },
        "swap" => Insn::Swap,
        "reput" => Insn::Reput,
        "topn" => Insn::TopN {
            n: u32_at(ops, 0, line)?,
        },
        "setn" => Insn::SetN {
            n: u32_at(ops, 0, line)?,
        },
        "adjuststack" => Insn::AdjustStack {
            n: u32_at(ops, 0, line)?,
        },
        "checkmatch" => {
            let kind = match word_at(ops, 0, line)? {
                "when" => CheckMatchKind::When,
                "case" => CheckMatchKind::Case,
                "rescue" => CheckMatchKind::Rescue,
                other => return Err(Error::asm(format!("bad checkmatch kind {}", other), line)),
            };
            let array = matches!(ops.get(1), Some(Token::Word(w)) if w == "array");
            Insn::CheckMatch { kind, array }
        }
        "trace" => Insn::Trace {
            event: u32_or(ops, 0, 0, line)?,
        },
        "send" => Insn::Send {
            ci: call_info(ops, line)?,
        },
        "opt_send_simple" => Insn::OptSendSimple {
            ci: call_info(ops, line)?,
        },
        "opt_str_freeze" => Insn::OptStrFreeze {
            value: string_at(ops, 0, line)?,
        },
        "invokeblock" => Insn::InvokeBlock {
            ci: CallInfo::new("yield", u32_or(ops, 0, 0, line)?),
        },
        "leave" => Insn::Leave,
        "throw" => Insn::Throw,
        "jump" | "branchif" | "branchunless" => {
            let label = name_at(ops, 0, ' ', line)?;
            let kind = match mnemonic {
                "jump" => Branch::Jump,
                "branchif" => Branch::If,
                _ => Branch::Unless,
            };
            return Ok(Parsed::Branch(kind, label));
        }
        "getinlinecache" => {
            let label = name_at(ops, 0, ' ', line)?;
            return Ok(Parsed::InlineCache(label, u32_or(ops, 1, 0, line)?));
        }
        "setinlinecache" => Insn::SetInlineCache {
            slot: u32_or(ops, 0, 0, line)?,
        },
        "opt_plus" => Insn::OptPlus,
        "opt_minus" => Insn::OptMinus,
        "opt_mult" => Insn::OptMult,
        "opt_div" => Insn::OptDiv,
        "opt_mod" => Insn::OptMod,
        "opt_eq" => Insn::OptEq,
        "opt_neq" => Insn::OptNeq,
        "opt_lt" => Insn::OptLt,
        "opt_le" => Insn::OptLe,
        "opt_gt" => Insn::OptGt,
        "opt_ge" => Insn::OptGe,
        "opt_ltlt" => Insn::OptLtLt,
        "opt_aref" => Insn::OptAref,
        "opt_aset" => Insn::OptAset,
        "opt_aref_with" => Insn::OptArefWith {
            key: string_at(ops, 0, line)?,
        },
        "opt_aset_with" => Insn::OptAsetWith {
            key: string_at(ops, 0, line)?,
        },
        "opt_length" => Insn::OptLength,
        "opt_size" => Insn::OptSize,
        "opt_empty_p" => Insn::OptEmptyP,
        "opt_succ" => Insn::OptSucc,
        "opt_not" => Insn::OptNot,
        "opt_regexpmatch1" => Insn::OptRegexpMatch1 {
            pattern: string_at(ops, 0, line)?,
        },
        "opt_regexpmatch2" => Insn::OptRegexpMatch2,
        other => return Err(Error::asm(format!("unknown mnemonic {}", other), line)),
    };
    Ok(Parsed::Insn(insn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const COUNTER: &str = r#"
# counts to ten
top main locals=1
  putobject 0
  setlocal 0 0
loop:
  getlocal 0 0
  putobject 1
  opt_plus
  setlocal 0 0
  getlocal 0 0
  putobject 10
  opt_lt
  branchif loop
  getlocal 0
  leave
end
"#;

    #[test]
    fn test_assemble_loop() {
        let program = assemble(COUNTER).unwrap();
        assert_eq!(program.entry, "main");
        let main = program.iseq("main").unwrap();
        assert_eq!(main.locals, 1);
        assert_eq!(main.code[9], Insn::BranchIf { offset: -8 });
        assert_eq!(main.lines[0], 4);
    }

    #[test]
    fn test_assemble_class() {
        let source = r#"
class Point < Object
  attr_accessor x
  def initialize params=1
    getlocal 0
    setinstancevariable @x
    putnil
    leave
  end
  def self.origin
    putself
    putobject 0
    send new 1
    leave
  end
end
top main
  putnil
  leave
end
"#;
        let program = assemble(source).unwrap();
        let class = &program.classes[0];
        assert_eq!(class.name, "Point");
        assert_eq!(class.superclass.as_deref(), Some("Object"));
        let names: Vec<_> = class.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["x", "x=", "initialize"]);
        assert_eq!(class.singleton_methods[0].body, MethodBody::Iseq("Point.origin".into()));
        assert!(program.iseq("Point#initialize").is_some());
    }

    #[test]
    fn test_literals_and_calls() {
        let source = r#"
block blk params=1
  getlocal 0
  leave
end
top main
  putobject 1.5
  putobject :sym
  putobject "s\n"
  putobject /a+/
  duparray [1, 2.0, "x"]
  send each 0 &blk
  send [] 1
  send <= 1 fcall
  opt_regexpmatch1 /b/
  leave
end
"#;
        let program = assemble(source).unwrap();
        let code = &program.iseq("main").unwrap().code;
        assert_eq!(code[0], Insn::PutObject { value: Literal::Float(1.5) });
        assert_eq!(code[1], Insn::PutObject { value: Literal::Sym("sym".into()) });
        assert_eq!(code[2], Insn::PutObject { value: Literal::Str("s\n".into()) });
        assert_eq!(code[3], Insn::PutObject { value: Literal::Regexp("a+".into()) });
        assert_eq!(
            code[4],
            Insn::DupArray {
                value: vec![Literal::Int(1), Literal::Float(2.0), Literal::Str("x".into())]
            }
        );
        assert_eq!(code[5].call_info().unwrap().block.as_deref(), Some("blk"));
        assert_eq!(code[6].call_info().unwrap().mid, "[]");
        assert!(code[7].call_info().unwrap().flags.contains(CallFlags::FCALL));
    }

    #[test]
    fn test_errors_carry_line() {
        let err = assemble("top main\n  bogus\nend\n").unwrap_err();
        assert!(matches!(err, Error::Asm { line: 2, .. }));
        let err = assemble("top main\n  jump nowhere\nend\n").unwrap_err();
        assert!(err.to_string().contains("unknown label"));
        assert!(assemble("top main\n  leave\n").is_err());
    }
}
