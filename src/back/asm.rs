//! The textual assembly layer.
//!
//! The code generator builds typed instructions and renders them through
//! [std::fmt::Display]; the linker and the virtual machine parse them back
//! from text.  Keeping the listing textual is the point of the whole
//! exercise: every stage's output can be read, diffed, and stepped
//! through.
//!
//! # Machine model
//!
//! Four named registers: `ax` (accumulator), `bx` (scratch), `sp` (stack
//! pointer), `bp` (frame pointer).  The usual x86-flavored aliases are
//! accepted on input (`al`, `eax`, `esp`, ...) and normalized on parse.
//!
//! # Call stack frame
//!
//! The stack grows toward lower addresses; `sp` points at the top.
//! A call arranges memory like this:
//!
//! ```txt
//!   High memory addresses
//!
//!   +--------------------+
//!   | caller's frame     |
//!   +--------------------+
//!   | arg n-1            |
//!   |   ...              |
//!   | arg 0              |  <- bp + 2
//!   +--------------------+
//!   | return address     |  <- bp + 1
//!   +--------------------+
//!   | saved bp           |  <- bp (after the prologue)
//!   +--------------------+
//!   | locals             |  <- negative offsets from bp
//!   +--------------------+  <- sp
//!
//!   Low memory addresses
//! ```
//!
//! The caller pushes arguments right-to-left, so parameter `i` reads at
//! `bp + 2 + i`.  The callee prologue is `push bp; mov bp, sp`; the
//! epilogue releases outstanding locals, restores `bp`, and returns.

use derive_more::Display;

use crate::common::{id, Diagnostic, ErrorKind, Id};

/// Registers for the teaching machine.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Register {
    #[display("ax")]
    Ax,
    #[display("bx")]
    Bx,
    #[display("sp")]
    Sp,
    #[display("bp")]
    Bp,
}

impl std::str::FromStr for Register {
    type Err = ();

    /// Accepts the common aliases: `al`/`ah`/`eax` for `ax`, and the
    /// matching spellings for the other registers.
    fn from_str(s: &str) -> Result<Self, ()> {
        use Register::*;
        match s {
            "ax" | "al" | "ah" | "eax" => Ok(Ax),
            "bx" | "bl" | "bh" | "ebx" => Ok(Bx),
            "sp" | "esp" => Ok(Sp),
            "bp" | "ebp" => Ok(Bp),
            _ => Err(()),
        }
    }
}

/// Conditions for branching and set-on-condition.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Cond {
    #[display("e")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("l")]
    Lt,
    #[display("le")]
    Le,
    #[display("g")]
    Gt,
    #[display("ge")]
    Ge,
}

/// An instruction operand: register, immediate, `[n]` stack slot, or a
/// symbolic label (only meaningful before linking, and on `call` after
/// it).
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum Operand {
    #[display("{_0}")]
    Reg(Register),
    #[display("{_0}")]
    Imm(i64),
    #[display("[{_0}]")]
    Slot(i64),
    #[display("{_0}")]
    Sym(Id),
}

impl Operand {
    pub fn parse(text: &str) -> Operand {
        let text = text.trim();
        if let Ok(reg) = text.parse::<Register>() {
            return Operand::Reg(reg);
        }
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if let Ok(n) = inner.trim().parse::<i64>() {
                return Operand::Slot(n);
            }
        }
        if let Ok(n) = text.parse::<i64>() {
            return Operand::Imm(n);
        }
        Operand::Sym(id(text))
    }
}

/// One machine instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Instruction {
    Mov { dst: Register, src: Operand },
    Add { dst: Register, src: Operand },
    Sub { dst: Register, src: Operand },
    Mul { dst: Register, src: Operand },
    Div { dst: Register, src: Operand },
    Power { dst: Register, src: Operand },
    And { dst: Register, src: Operand },
    /// Computes `lhs - rhs` for the flags only.
    Cmp { lhs: Operand, rhs: Operand },
    Jmp(Operand),
    Jcc { cond: Cond, target: Operand },
    Set { cond: Cond, dst: Register },
    Push(Operand),
    Pop(Register),
    /// Store `ax` to `[bp + offset]`.
    Si(i64),
    /// Load `[bp + offset]` into `ax`.
    Li(i64),
    /// Load from the absolute address held in the register into `ax`.
    Lir(Register),
    /// Store `ax` to the absolute address held in the register.
    Sir(Register),
    /// Compute `bp + offset` into `ax`.
    Lea(i64),
    Call(Operand),
    Ret,
    /// Syscall: consumes `ax` as a size, returns a pointer in `ax`.
    Alloc,
    /// Syscall: consumes `ax` as a pointer.
    Free,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Instruction::*;

        match self {
            Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            Add { dst, src } => write!(f, "add {dst}, {src}"),
            Sub { dst, src } => write!(f, "sub {dst}, {src}"),
            Mul { dst, src } => write!(f, "mul {dst}, {src}"),
            Div { dst, src } => write!(f, "div {dst}, {src}"),
            Power { dst, src } => write!(f, "power {dst}, {src}"),
            And { dst, src } => write!(f, "and {dst}, {src}"),
            Cmp { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            Jmp(target) => write!(f, "jmp {target}"),
            Jcc { cond, target } => write!(f, "j{cond} {target}"),
            Set { cond, dst } => write!(f, "set{cond} {dst}"),
            Push(src) => write!(f, "push {src}"),
            Pop(dst) => write!(f, "pop {dst}"),
            Si(offset) => write!(f, "si {offset}"),
            Li(offset) => write!(f, "li {offset}"),
            Lir(reg) => write!(f, "lir {reg}"),
            Sir(reg) => write!(f, "sir {reg}"),
            Lea(offset) => write!(f, "lea {offset}"),
            Call(target) => write!(f, "call {target}"),
            Ret => write!(f, "ret"),
            Alloc => write!(f, "alloc"),
            Free => write!(f, "free"),
        }
    }
}

impl Instruction {
    /// Parse one instruction from text (no label, no `; comment`, no
    /// `[address]` prefix).
    pub fn parse(text: &str) -> Result<Instruction, Diagnostic> {
        use Instruction::*;

        let text = text.trim();
        let (opcode, rest) = match text.split_once(char::is_whitespace) {
            Some((opcode, rest)) => (opcode, rest.trim()),
            None => (text, ""),
        };
        let operands: Vec<Operand> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(Operand::parse).collect()
        };

        let bad = |msg: &str| Err(Diagnostic::new(ErrorKind::Runtime, format!("{msg}: '{text}'")));

        let dst_src = |make: fn(Register, Operand) -> Instruction| match operands.as_slice() {
            [Operand::Reg(dst), src] => Ok(make(*dst, src.clone())),
            _ => bad("invalid operands"),
        };

        match opcode {
            "mov" => dst_src(|dst, src| Mov { dst, src }),
            "add" => dst_src(|dst, src| Add { dst, src }),
            "sub" => dst_src(|dst, src| Sub { dst, src }),
            "mul" => dst_src(|dst, src| Mul { dst, src }),
            "div" => dst_src(|dst, src| Div { dst, src }),
            "power" => dst_src(|dst, src| Power { dst, src }),
            "and" => dst_src(|dst, src| And { dst, src }),
            "cmp" => match operands.as_slice() {
                [lhs, rhs] => Ok(Cmp {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                }),
                _ => bad("invalid operands"),
            },
            "jmp" => match operands.as_slice() {
                [target] => Ok(Jmp(target.clone())),
                _ => bad("invalid operands"),
            },
            "je" | "jne" | "jl" | "jle" | "jg" | "jge" => {
                let cond = parse_cond(&opcode[1..]).expect("matched above");
                match operands.as_slice() {
                    [target] => Ok(Jcc {
                        cond,
                        target: target.clone(),
                    }),
                    _ => bad("invalid operands"),
                }
            }
            "sete" | "setne" | "setl" | "setle" | "setg" | "setge" => {
                let cond = parse_cond(&opcode[3..]).expect("matched above");
                match operands.as_slice() {
                    [Operand::Reg(dst)] => Ok(Set { cond, dst: *dst }),
                    _ => bad("invalid operands"),
                }
            }
            "push" => match operands.as_slice() {
                [src] => Ok(Push(src.clone())),
                _ => bad("invalid operands"),
            },
            "pop" => match operands.as_slice() {
                [Operand::Reg(dst)] => Ok(Pop(*dst)),
                _ => bad("invalid operands"),
            },
            "si" | "li" | "lea" => match operands.as_slice() {
                [Operand::Imm(offset)] => Ok(match opcode {
                    "si" => Si(*offset),
                    "li" => Li(*offset),
                    _ => Lea(*offset),
                }),
                _ => bad("invalid operands"),
            },
            "lir" => match operands.as_slice() {
                [Operand::Reg(reg)] => Ok(Lir(*reg)),
                _ => bad("invalid operands"),
            },
            "sir" => match operands.as_slice() {
                [Operand::Reg(reg)] => Ok(Sir(*reg)),
                _ => bad("invalid operands"),
            },
            "call" => match operands.as_slice() {
                [target] => Ok(Call(target.clone())),
                _ => bad("invalid operands"),
            },
            "ret" => Ok(Ret),
            "alloc" => Ok(Alloc),
            "free" => Ok(Free),
            _ => bad("unknown instruction"),
        }
    }
}

fn parse_cond(s: &str) -> Option<Cond> {
    match s {
        "e" => Some(Cond::Eq),
        "ne" => Some(Cond::Ne),
        "l" => Some(Cond::Lt),
        "le" => Some(Cond::Le),
        "g" => Some(Cond::Gt),
        "ge" => Some(Cond::Ge),
        _ => None,
    }
}

/// One line of assembly output: a label or an instruction.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum Line {
    #[display("{_0}:")]
    Label(Id),
    #[display("    {_0}")]
    Ins(Instruction),
}

/// Render a sequence of lines as assembly text.
pub fn render(lines: &[Line]) -> String {
    let mut text = String::new();
    for line in lines {
        text.push_str(&line.to_string());
        text.push('\n');
    }
    text
}
