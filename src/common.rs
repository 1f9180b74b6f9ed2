//! Common definitions that are shared between different parts of the
//! compiler and the virtual machine.

use derive_more::Display;

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers.
pub type Id = internment::Intern<String>;

/// Intern a string slice as an [Id].
pub fn id(name: &str) -> Id {
    Id::from(name.to_string())
}

/// A position in the source text.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Display)]
#[display("{line}:{column}")]
pub struct Pos {
    /// 1-based line number.
    pub line: usize,
    /// 1-based column number.
    pub column: usize,
    /// 0-based byte offset into the source.
    pub offset: usize,
}

/// The flat error taxonomy. Every kind carries a position (when one is
/// known) and a message in the surrounding [Diagnostic].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum ErrorKind {
    #[display("LexError")]
    Lex,
    #[display("ParseError")]
    Parse,
    #[display("NameError")]
    Name,
    #[display("TypeError")]
    Type,
    #[display("TDZError")]
    Tdz,
    #[display("RedeclarationError")]
    Redeclaration,
    #[display("LinkError")]
    Link,
    #[display("RuntimeError")]
    Runtime,
    #[display("HeapError")]
    Heap,
    #[display("BudgetError")]
    Budget,
    #[display("ScopeStackMismatch")]
    ScopeStackMismatch,
}

/// One reported problem.
///
/// The parser, CFG builder, and code generator accumulate these and keep
/// going where recovery is safe; the linker and the VM stop at the first
/// fatal one.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub pos: Option<Pos>,
    pub message: String,
}

impl Diagnostic {
    /// A diagnostic with no source position (link- and run-time problems).
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            pos: None,
            message: message.into(),
        }
    }

    /// A diagnostic anchored at a source position.
    pub fn at(kind: ErrorKind, pos: Pos, message: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            pos: Some(pos),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pos {
            Some(pos) => write!(f, "{} at {}: {}", self.kind, pos, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Diagnostic {}

/// Mutable state shared by the pipeline passes: the struct table, the
/// function table, and the checkpoint-id counter.
///
/// The reference implementation kept these process-wide; here one context
/// value is created per compilation and threaded through parsing,
/// annotation, and code generation.
#[derive(Debug, Default)]
pub struct CompilerContext {
    /// Struct definitions by name. Redefinition is a warning; the last
    /// definition wins.
    pub structs: Map<Id, crate::front::ast::StructDef>,
    /// Known functions (including the `alloc`/`free` builtins) by name.
    pub functions: Map<Id, crate::front::ast::FunctionSig>,
    next_scope_id: usize,
}

impl CompilerContext {
    pub fn new() -> Self {
        let mut ctx = CompilerContext::default();
        crate::front::ast::register_builtins(&mut ctx);
        ctx
    }

    /// Draw the next checkpoint id (`scope_0`, `scope_1`, ...). Unique per
    /// program.
    pub fn next_scope_id(&mut self) -> Id {
        let n = self.next_scope_id;
        self.next_scope_id += 1;
        id(&format!("scope_{n}"))
    }
}
