//! Text assembler for the demo interpreter
//!
//! ```text
//! ; comments run to the end of the line
//! func main locals 2
//!     const r0, 3
//!     const r1, 1
//! loop:
//!     cp 0
//!     printkv "i", r0
//!     sub r0, r0, r1
//!     jnz r0, loop
//!     ret
//! end
//! ```
//!
//! Instructions: `const`, `mov`, the binary operators (`add sub mul and or xor
//! eq ne lt le gt ge`), `div`, `copyb dst, src, len`, `jmp`, `jnz`, `jz`,
//! `switch r, V => label, ..., _ => label`, `call name(r, ...) -> r`, `ret`,
//! `print "text"`, `printi r`, `printkv "label", r` and `cp N`.
//! The entry function is `main`, or the first function if there is none.

use std::collections::HashMap;
use std::fmt;

use crate::ctrlvars::{FuncId, Pc, Reg, Word};
use crate::trace::{BinOpKind, Operand};

use super::program::{Function, HostFn, Instr, Program};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    /// 1-based source line
    pub line: usize,
    pub msg: String,
}

impl AsmError {
    fn new(line: usize, msg: impl Into<String>) -> Self {
        AsmError {
            line,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.msg)
    }
}

impl std::error::Error for AsmError {}

type AsmResult<T> = Result<T, AsmError>;

struct Line<'a> {
    no: usize,
    text: &'a str,
}

struct FuncSource<'a> {
    name: &'a str,
    nlocals: u32,
    nparams: u32,
    header: usize,
    body: Vec<Line<'a>>,
}

/// Assemble `src` into a program.
pub fn assemble(src: &str) -> AsmResult<Program> {
    let sources = split_functions(src)?;

    let mut func_ids = HashMap::new();
    for (i, f) in sources.iter().enumerate() {
        if func_ids.insert(f.name, FuncId(i as u32)).is_some() {
            return Err(AsmError::new(
                f.header,
                format!("function {} defined twice", f.name),
            ));
        }
    }

    let mut strings = Strings::default();
    let functions = sources
        .iter()
        .map(|f| assemble_function(f, &func_ids, &mut strings))
        .collect::<AsmResult<Vec<_>>>()?;

    let entry = func_ids
        .get("main")
        .copied()
        .or_else(|| (!functions.is_empty()).then_some(FuncId(0)))
        .ok_or_else(|| AsmError::new(1, "program has no functions"))?;

    Ok(Program {
        functions,
        strings: strings.table,
        entry,
    })
}

#[derive(Default)]
struct Strings {
    table: Vec<String>,
    index: HashMap<String, usize>,
}

impl Strings {
    fn intern(&mut self, s: String) -> Word {
        if let Some(&i) = self.index.get(&s) {
            return i as Word;
        }
        let i = self.table.len();
        self.index.insert(s.clone(), i);
        self.table.push(s);
        i as Word
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_str => escaped = true,
            '"' => in_str = !in_str,
            ';' if !in_str => return &line[..i],
            _ => {}
        }
    }
    line
}

fn split_functions(src: &str) -> AsmResult<Vec<FuncSource<'_>>> {
    let mut funcs = Vec::new();
    let mut current: Option<FuncSource<'_>> = None;

    for (i, raw) in src.lines().enumerate() {
        let no = i + 1;
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }
        let mut words = text.split_whitespace();
        match (words.next(), current.is_some()) {
            (Some("func"), false) => current = Some(parse_header(no, text)?),
            (Some("func"), true) => {
                return Err(AsmError::new(no, "nested func; missing end"));
            }
            (Some("end"), true) => {
                if let Some(f) = current.take() {
                    funcs.push(f);
                }
            }
            (_, false) => return Err(AsmError::new(no, "instruction outside of a function")),
            (_, true) => {
                if let Some(f) = current.as_mut() {
                    f.body.push(Line { no, text });
                }
            }
        }
    }
    if let Some(f) = current {
        return Err(AsmError::new(f.header, format!("function {} has no end", f.name)));
    }
    Ok(funcs)
}

fn parse_header(no: usize, text: &str) -> AsmResult<FuncSource<'_>> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let name = words
        .get(1)
        .copied()
        .filter(|n| is_ident(n))
        .ok_or_else(|| AsmError::new(no, "expected: func NAME locals N [params M]"))?;
    let mut nlocals = None;
    let mut nparams = 0;
    for pair in words[2..].chunks(2) {
        let (key, value) = match pair {
            [k, v] => (*k, parse_int::<u32>(no, v)?),
            _ => return Err(AsmError::new(no, "expected a number after the attribute")),
        };
        match key {
            "locals" => nlocals = Some(value),
            "params" => nparams = value,
            other => return Err(AsmError::new(no, format!("unknown attribute {}", other))),
        }
    }
    let nlocals = nlocals.ok_or_else(|| AsmError::new(no, "missing locals count"))?;
    if nparams > nlocals {
        return Err(AsmError::new(no, "more params than locals"));
    }
    Ok(FuncSource {
        name,
        nlocals,
        nparams,
        header: no,
        body: Vec::new(),
    })
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_int<T: std::str::FromStr>(no: usize, s: &str) -> AsmResult<T> {
    s.trim()
        .parse()
        .map_err(|_| AsmError::new(no, format!("expected a number, found {:?}", s.trim())))
}

fn assemble_function(
    src: &FuncSource<'_>,
    func_ids: &HashMap<&str, FuncId>,
    strings: &mut Strings,
) -> AsmResult<Function> {
    // First pass: label addresses.
    let mut labels = HashMap::new();
    let mut pc: Pc = 0;
    for line in &src.body {
        if let Some(label) = line.text.strip_suffix(':') {
            if !is_ident(label) {
                return Err(AsmError::new(line.no, format!("bad label {:?}", label)));
            }
            if labels.insert(label, pc).is_some() {
                return Err(AsmError::new(line.no, format!("label {} defined twice", label)));
            }
        } else {
            pc += 1;
        }
    }

    let mut ctx = FnCtx {
        nlocals: src.nlocals,
        labels: &labels,
        func_ids,
        strings,
    };
    let code = src
        .body
        .iter()
        .filter(|line| !line.text.ends_with(':'))
        .map(|line| ctx.instr(line))
        .collect::<AsmResult<Vec<_>>>()?;

    Ok(Function {
        name: src.name.to_string(),
        nlocals: src.nlocals,
        nparams: src.nparams,
        code,
    })
}

struct FnCtx<'a, 'b> {
    nlocals: u32,
    labels: &'a HashMap<&'b str, Pc>,
    func_ids: &'a HashMap<&'b str, FuncId>,
    strings: &'a mut Strings,
}

impl FnCtx<'_, '_> {
    fn instr(&mut self, line: &Line<'_>) -> AsmResult<Instr> {
        let no = line.no;
        let (op, rest) = match line.text.split_once(char::is_whitespace) {
            Some((op, rest)) => (op, rest.trim()),
            None => (line.text, ""),
        };
        let args = || -> Vec<&str> {
            if rest.is_empty() {
                Vec::new()
            } else {
                rest.split(',').map(str::trim).collect()
            }
        };
        let expect = |n: usize| -> AsmResult<Vec<&str>> {
            let a = args();
            if a.len() == n {
                Ok(a)
            } else {
                Err(AsmError::new(no, format!("{} takes {} operands", op, n)))
            }
        };

        if let Some(kind) = BinOpKind::from_mnemonic(op) {
            let a = expect(3)?;
            return Ok(Instr::BinOp {
                kind,
                dst: self.reg(no, a[0])?,
                lhs: self.reg(no, a[1])?,
                rhs: self.reg(no, a[2])?,
            });
        }

        Ok(match op {
            "const" => {
                let a = expect(2)?;
                Instr::Const {
                    dst: self.reg(no, a[0])?,
                    value: parse_int(no, a[1])?,
                }
            }
            "mov" => {
                let a = expect(2)?;
                Instr::Move {
                    dst: self.reg(no, a[0])?,
                    src: self.reg(no, a[1])?,
                }
            }
            "div" => {
                let a = expect(3)?;
                Instr::Div {
                    dst: self.reg(no, a[0])?,
                    lhs: self.reg(no, a[1])?,
                    rhs: self.reg(no, a[2])?,
                }
            }
            "copyb" => {
                let a = expect(3)?;
                let len: u8 = parse_int(no, a[2])?;
                if len > 8 {
                    return Err(AsmError::new(no, "copyb copies at most 8 bytes"));
                }
                Instr::CopyBytes {
                    dst: self.reg(no, a[0])?,
                    src: self.reg(no, a[1])?,
                    len,
                }
            }
            "jmp" => {
                let a = expect(1)?;
                Instr::Jump {
                    target: self.label(no, a[0])?,
                }
            }
            "jnz" | "jz" => {
                let a = expect(2)?;
                Instr::Branch {
                    cond: self.reg(no, a[0])?,
                    target: self.label(no, a[1])?,
                    when_nonzero: op == "jnz",
                }
            }
            "switch" => self.switch(no, &args())?,
            "call" => self.call(no, rest)?,
            "ret" => match args().as_slice() {
                [] => Instr::Return { value: None },
                [r] => Instr::Return {
                    value: Some(self.reg(no, r)?),
                },
                _ => return Err(AsmError::new(no, "ret takes at most one operand")),
            },
            "print" => {
                let (s, tail) = parse_string(no, rest)?;
                if !tail.trim().is_empty() {
                    return Err(AsmError::new(no, "unexpected text after string"));
                }
                Instr::Host {
                    func: HostFn::PrintStr,
                    args: vec![Operand::Imm(self.strings.intern(s))],
                    dst: None,
                }
            }
            "printi" => {
                let a = expect(1)?;
                Instr::Host {
                    func: HostFn::PrintInt,
                    args: vec![Operand::Reg(self.reg(no, a[0])?)],
                    dst: None,
                }
            }
            "printkv" => {
                let (s, tail) = parse_string(no, rest)?;
                let reg = tail
                    .trim()
                    .strip_prefix(',')
                    .ok_or_else(|| AsmError::new(no, "expected: printkv \"label\", rN"))?;
                Instr::Host {
                    func: HostFn::PrintLabeled,
                    args: vec![
                        Operand::Imm(self.strings.intern(s)),
                        Operand::Reg(self.reg(no, reg)?),
                    ],
                    dst: None,
                }
            }
            "cp" => {
                let a = expect(1)?;
                Instr::ControlPoint {
                    loc: parse_int(no, a[0])?,
                }
            }
            other => return Err(AsmError::new(no, format!("unknown instruction {}", other))),
        })
    }

    fn reg(&self, no: usize, s: &str) -> AsmResult<Reg> {
        let s = s.trim();
        let n: Reg = s
            .strip_prefix('r')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| AsmError::new(no, format!("expected a register, found {:?}", s)))?;
        if n >= self.nlocals {
            return Err(AsmError::new(
                no,
                format!("register r{} out of range ({} locals)", n, self.nlocals),
            ));
        }
        Ok(n)
    }

    fn label(&self, no: usize, s: &str) -> AsmResult<Pc> {
        self.labels
            .get(s.trim())
            .copied()
            .ok_or_else(|| AsmError::new(no, format!("unknown label {}", s.trim())))
    }

    fn switch(&self, no: usize, args: &[&str]) -> AsmResult<Instr> {
        let (discr, arms) = args
            .split_first()
            .ok_or_else(|| AsmError::new(no, "switch needs a register"))?;
        let discr = self.reg(no, discr)?;
        let mut values = Vec::new();
        let mut targets = Vec::new();
        let mut default = None;
        for arm in arms {
            let (value, label) = arm
                .split_once("=>")
                .ok_or_else(|| AsmError::new(no, format!("bad switch arm {:?}", arm)))?;
            let target = self.label(no, label)?;
            match value.trim() {
                "_" => default = Some(target),
                v => {
                    let v: Word = parse_int(no, v)?;
                    if values.contains(&v) {
                        return Err(AsmError::new(no, format!("duplicate switch case {}", v)));
                    }
                    values.push(v);
                    targets.push(target);
                }
            }
        }
        let default = default.ok_or_else(|| AsmError::new(no, "switch needs a `_ =>` arm"))?;
        Ok(Instr::Switch {
            discr,
            values,
            targets,
            default,
        })
    }

    fn call(&self, no: usize, rest: &str) -> AsmResult<Instr> {
        let bad = || AsmError::new(no, "expected: call NAME(rA, ...) [-> rD]");
        let (callee, tail) = rest.split_once('(').ok_or_else(bad)?;
        let (args, tail) = tail.split_once(')').ok_or_else(bad)?;
        let func = *self
            .func_ids
            .get(callee.trim())
            .ok_or_else(|| AsmError::new(no, format!("unknown function {}", callee.trim())))?;
        let args = if args.trim().is_empty() {
            Vec::new()
        } else {
            args.split(',')
                .map(|a| self.reg(no, a))
                .collect::<AsmResult<Vec<_>>>()?
        };
        let ret = match tail.trim() {
            "" => None,
            t => Some(self.reg(no, t.strip_prefix("->").ok_or_else(bad)?)?),
        };
        Ok(Instr::Call { func, args, ret })
    }
}

/// Parse a leading double-quoted string; returns it and the remaining text.
fn parse_string(no: usize, s: &str) -> AsmResult<(String, &str)> {
    let body = s
        .trim_start()
        .strip_prefix('"')
        .ok_or_else(|| AsmError::new(no, "expected a string"))?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &body[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, c @ ('"' | '\\'))) => out.push(c),
                _ => return Err(AsmError::new(no, "bad escape in string")),
            },
            c => out.push(c),
        }
    }
    Err(AsmError::new(no, "unterminated string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_loop() {
        let p = assemble(
            r#"
            ; count down
            func main locals 2
                const r0, 3   ; counter
                const r1, 1
            loop:
                cp 0
                printkv "i", r0
                sub r0, r0, r1
                jnz r0, loop
                ret
            end
            "#,
        )
        .unwrap();
        assert_eq!(p.entry, FuncId(0));
        assert_eq!(p.strings, vec!["i".to_string()]);
        let code = &p.functions[0].code;
        assert_eq!(code.len(), 7);
        assert_eq!(code[2], Instr::ControlPoint { loc: 0 });
        assert_eq!(
            code[5],
            Instr::Branch {
                cond: 0,
                target: 2,
                when_nonzero: true
            }
        );
        assert_eq!(code[6], Instr::Return { value: None });
    }

    #[test]
    fn test_assemble_switch_and_call() {
        let p = assemble(
            r#"
            func main locals 2
                switch r0, 100 => a, 200 => b, _ => c
            a:
                call helper(r0, r1) -> r1
            b:
                print "semi; colon \"quoted\""
            c:
                ret r1
            end
            func helper locals 3 params 2
                ret r2
            end
            "#,
        )
        .unwrap();
        let code = &p.functions[0].code;
        assert_eq!(
            code[0],
            Instr::Switch {
                discr: 0,
                values: vec![100, 200],
                targets: vec![1, 2],
                default: 3
            }
        );
        assert_eq!(
            code[1],
            Instr::Call {
                func: FuncId(1),
                args: vec![0, 1],
                ret: Some(1)
            }
        );
        assert_eq!(p.strings, vec!["semi; colon \"quoted\"".to_string()]);
        p.validate().unwrap();
    }

    #[test]
    fn test_assemble_errors() {
        let err = assemble("func main locals 1\n  mov r0, r1\nend\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.msg.contains("r1"));

        let err = assemble("func main locals 1\n  jmp nowhere\nend\n").unwrap_err();
        assert!(err.msg.contains("nowhere"));

        let err = assemble("func main locals 1\n  frob r0\nend\n").unwrap_err();
        assert!(err.msg.contains("frob"));

        let err = assemble("func main locals 1\n  ret\n").unwrap_err();
        assert!(err.msg.contains("no end"));

        let err = assemble("  ret\n").unwrap_err();
        assert_eq!(err.line, 1);

        let err = assemble("func main locals 1\n  switch r0, 1 => x\nx:\n  ret\nend\n").unwrap_err();
        assert!(err.msg.contains("_ =>"));
    }

    #[test]
    fn test_entry_defaults_to_first_function() {
        let p = assemble("func start locals 0\n  ret\nend\n").unwrap();
        assert_eq!(p.entry, FuncId(0));
        assert!(assemble("; nothing\n").is_err());
    }
}
