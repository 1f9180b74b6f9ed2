//! The abstract syntax tree.
//!
//! Everything here is a plain tagged variant; each node exclusively owns
//! its children and the tree carries no back-edges.  The two synthetic
//! checkpoint markers ([Stmt::StartCheckPoint] / [Stmt::EndCheckPoint]) do
//! not come out of the parser; the annotation pass inserts them around
//! every block so that later passes can allocate and release stack slots
//! without re-scanning the block.

use derive_more::Display;

use crate::common::{id, CompilerContext, Id, Map, Pos};

#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Function>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: Id,
    pub params: Vec<Param>,
    pub ret: TypeSpec,
    /// The statements of the body block.
    pub body: Vec<Stmt>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: Id,
    pub ty: TypeSpec,
}

/// A function's callable signature, as recorded in the function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSig {
    pub name: Id,
    pub params: Vec<Param>,
    pub ret: TypeSpec,
    /// Builtins compile to VM syscall instructions instead of `call`.
    pub builtin: bool,
    /// False for a forward declaration (`int f(int n);`); flips once the
    /// defining declaration is seen.
    pub has_body: bool,
}

/// Pre-register the two runtime builtins: `alloc(int) -> int` and
/// `free(int) -> void`.
pub fn register_builtins(ctx: &mut CompilerContext) {
    for name in ["alloc", "free"] {
        let name = id(name);
        ctx.functions.insert(
            name,
            FunctionSig {
                name,
                params: vec![Param {
                    name: id("n"),
                    ty: TypeSpec::INT,
                }],
                ret: TypeSpec::INT,
                builtin: true,
                has_body: true,
            },
        );
    }
}

/// The base of a declared type, before pointer levels are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BaseType {
    #[display("int")]
    Int,
    #[display("struct {_0}")]
    Struct(Id),
}

/// A declared type: a base plus zero or more pointer levels.  A pointer
/// has size 1 regardless of the pointed-to type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSpec {
    pub base: BaseType,
    pub pointer_level: u8,
}

impl TypeSpec {
    pub const INT: TypeSpec = TypeSpec {
        base: BaseType::Int,
        pointer_level: 0,
    };

    pub fn is_pointer(&self) -> bool {
        self.pointer_level > 0
    }

    /// How many stack slots a value of this type occupies.  `None` when the
    /// named struct is unknown.
    pub fn slot_size(&self, structs: &Map<Id, StructDef>) -> Option<usize> {
        if self.pointer_level > 0 {
            return Some(1);
        }
        match self.base {
            BaseType::Int => Some(1),
            BaseType::Struct(name) => structs.get(&name).map(|s| s.size),
        }
    }
}

impl std::fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)?;
        for _ in 0..self.pointer_level {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// A struct definition with byte-slot field offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    pub name: Id,
    pub fields: Vec<FieldDef>,
    /// Total size in slots: pointers count as 1, nested non-pointer
    /// structs count as their own size.
    pub size: usize,
    pub pos: Pos,
}

impl StructDef {
    pub fn field(&self, name: Id) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: Id,
    pub ty: TypeSpec,
    /// Slot offset from the start of the struct.
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UnOp {
    #[display("-")]
    Neg,
    #[display("!")]
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BinOp {
    #[display("||")]
    Or,
    #[display("&&")]
    And,
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("%")]
    Mod,
    #[display("**")]
    Power,
}

impl BinOp {
    /// Comparison operators set flags and are branch material; everything
    /// else produces a value in the accumulator.
    pub fn is_comparison(&self) -> bool {
        use BinOp::*;
        matches!(self, Eq | Ne | Lt | Le | Gt | Ge)
    }
}

/// A resolved member access (`p.x` or `p->x`).  Field offset and struct
/// size are resolved against the struct table at parse time so that later
/// passes never need the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAccess {
    pub object: Id,
    pub field: Id,
    pub field_offset: usize,
    pub struct_name: Id,
    pub via_pointer: bool,
    pub struct_size: usize,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(i64),
    Ident(Id),
    Unary {
        op: UnOp,
        inner: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Paren(Box<Expr>),
    AddressOf(Id),
    Deref(Box<Expr>),
    Member(MemberAccess),
    Call {
        callee: Id,
        args: Vec<Expr>,
        pos: Pos,
    },
}

/// Payload shared by `int` and `let` declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    pub name: Id,
    pub ty: TypeSpec,
    /// Slots this variable occupies (1 for scalars and pointers, the
    /// struct size for struct values).
    pub size: usize,
    pub init: Option<Expr>,
    pub pos: Pos,
}

/// A checkpoint marker payload.  `names`/`sizes` cover only the direct
/// declarations of the delimited block; nested blocks carry their own
/// markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPoint {
    pub id: Id,
    pub depth: usize,
    pub names: Vec<Id>,
    pub sizes: Vec<usize>,
}

impl CheckPoint {
    /// Total slots this checkpoint reserves.
    pub fn total_slots(&self) -> usize {
        self.sizes.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    VarDecl(Decl),
    LetDecl(Decl),
    Assign {
        /// Restricted to identifiers, dereference chains, and member
        /// accesses; the parser rejects anything else.
        target: Expr,
        value: Expr,
        pos: Pos,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Box<Stmt>>,
        body: Box<Stmt>,
    },
    Return {
        value: Option<Expr>,
        pos: Pos,
    },
    Break(Pos),
    Continue(Pos),
    Block(Vec<Stmt>),
    Empty,
    StartCheckPoint(CheckPoint),
    EndCheckPoint(CheckPoint),
}
