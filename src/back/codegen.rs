//! The code generator.
//!
//! Walks each function's control-flow graph in the builder's block order
//! and emits textual assembly.  There is no register allocator: `ax` is
//! the accumulator, `bx` the scratch, and every variable lives in a stack
//! slot addressed relative to `bp` (see the frame model in
//! [crate::back::asm]).
//!
//! Before anything is emitted, a breadth-first pass computes the scope
//! stack each block enters with, by simulating checkpoint markers and
//! declarations along the edges from the entry block.  When predecessors
//! disagree at a join, the shorter stack wins; live code at the join can
//! only touch names visible on every path into it.  Each block is then
//! emitted starting from its pinned snapshot, which is what keeps the
//! cumulative `add sp, N` on return paths correct across joins.
//!
//! Jumps that leave scopes behind (`break`/`continue` out of nested
//! blocks) release the difference between the jumping block's allocation
//! level and the target's expected level right before the jump, so the
//! stack pointer stays in step on every path.

use std::collections::VecDeque;

use crate::common::{CompilerContext, Diagnostic, ErrorKind, Id, Pos};
use crate::front::ast::*;
use crate::middle::cfg::Cfg;

use super::asm::{Cond, Instruction, Line, Operand, Register};
use super::scope::ScopeManager;

use Instruction as I;
use Operand::{Imm, Reg, Sym};
use Register::{Ax, Bp, Bx, Sp};

/// Generate assembly for one function.  Non-fatal problems (unresolved
/// names and the like) are accumulated; a checkpoint pairing violation
/// aborts the function.
pub fn generate(
    function: &Function,
    cfg: &Cfg,
    ctx: &CompilerContext,
) -> (Vec<Line>, Vec<Diagnostic>) {
    let params: Vec<Id> = function.params.iter().map(|p| p.name).collect();
    let states = compute_entry_states(cfg, &params);

    let mut generator = Generator {
        cfg,
        ctx,
        lines: Vec::new(),
        scope: ScopeManager::new(params),
        errors: Vec::new(),
    };

    // Function label and prologue; `call` targets land here.
    generator.lines.push(Line::Label(function.name));
    generator.emit(I::Push(Reg(Bp)));
    generator.emit(I::Mov {
        dst: Bp,
        src: Reg(Sp),
    });

    // Emission follows the builder's block order; blocks the state pass
    // never reached are dead components and are not emitted.
    let order: Vec<usize> = (0..cfg.blocks.len())
        .filter(|b| states[*b].is_some())
        .collect();
    for (position, block) in order.iter().enumerate() {
        let next = order.get(position + 1).copied();
        if let Err(fatal) = generator.emit_block(*block, next, &states) {
            generator.errors.push(fatal);
            break;
        }
    }

    (generator.lines, generator.errors)
}

/// Compute, for every reachable block, the scope stack it enters with.
/// Seeded with the empty stack at the entry block; checkpoint markers and
/// declarations are simulated to derive each block's exit state, which
/// propagates to its successors.  A successor that already has a state
/// keeps it unless a predecessor offers a strictly shorter stack.
fn compute_entry_states(cfg: &Cfg, params: &[Id]) -> Vec<Option<ScopeManager>> {
    let mut states: Vec<Option<ScopeManager>> = vec![None; cfg.blocks.len()];
    states[cfg.entry] = Some(ScopeManager::new(params.to_vec()));

    let mut queue = VecDeque::from([cfg.entry]);
    while let Some(block) = queue.pop_front() {
        let mut sim = states[block].clone().expect("queued blocks have states");
        simulate_block(&cfg.blocks[block].stmts, &mut sim);
        for succ in &cfg.blocks[block].succs {
            let replace = match &states[*succ] {
                None => true,
                Some(existing) => sim.depth() < existing.depth(),
            };
            if replace {
                states[*succ] = Some(sim.clone());
                queue.push_back(*succ);
            }
        }
    }
    states
}

fn simulate_block(stmts: &[Stmt], sim: &mut ScopeManager) {
    for stmt in stmts {
        match stmt {
            Stmt::StartCheckPoint(cp) => sim.enter_scope(cp.id, &cp.names, &cp.sizes),
            Stmt::EndCheckPoint(cp) => {
                // pairing violations surface during emission
                let _ = sim.exit_scope(cp.id);
            }
            Stmt::VarDecl(decl) | Stmt::LetDecl(decl) => {
                if sim.lookup_declared(decl.name).is_none() {
                    sim.declare_function_variable(decl.name);
                }
                sim.mark_initialized(decl.name);
            }
            _ => {}
        }
    }
}

struct Generator<'a> {
    cfg: &'a Cfg,
    ctx: &'a CompilerContext,
    lines: Vec<Line>,
    scope: ScopeManager,
    errors: Vec<Diagnostic>,
}

impl Generator<'_> {
    fn emit(&mut self, instruction: Instruction) {
        self.lines.push(Line::Ins(instruction));
    }

    fn report(&mut self, kind: ErrorKind, pos: Pos, message: String) {
        self.errors.push(Diagnostic::at(kind, pos, message));
    }

    fn block_label(&self, block: usize) -> Operand {
        Sym(self.cfg.blocks[block].id)
    }

    fn emit_block(
        &mut self,
        index: usize,
        next: Option<usize>,
        states: &[Option<ScopeManager>],
    ) -> Result<(), Diagnostic> {
        let block = &self.cfg.blocks[index];
        let snapshot = states[index].clone().expect("only blocks with states are emitted");
        self.scope.restore_snapshot(snapshot);
        self.lines.push(Line::Label(block.id));

        let mut branched = false;
        let count = block.stmts.len();
        for (i, stmt) in block.stmts.iter().enumerate() {
            if i + 1 == count && block.succs.len() == 2 {
                if let Stmt::Expr(cond) = stmt {
                    self.emit_cond_branch(cond, block.succs[0], block.succs[1]);
                    branched = true;
                    continue;
                }
            }
            self.emit_stmt(stmt)?;
        }

        if !branched {
            let returned = matches!(block.stmts.last(), Some(Stmt::Return { .. }));
            if returned {
                // the return already left the function on this path
            } else if let [succ] = block.succs[..] {
                // Release slots this path still holds beyond what the
                // target expects (break/continue out of nested scopes).
                if let Some(target_state) = &states[succ] {
                    let drift = self.scope.total_allocated() - target_state.total_allocated();
                    if drift > 0 {
                        self.emit(I::Add {
                            dst: Sp,
                            src: Imm(drift),
                        });
                    }
                }
                if next != Some(succ) {
                    let target = self.block_label(succ);
                    self.emit(I::Jmp(target));
                }
            } else if block.succs.len() > 1 {
                return Err(Diagnostic::new(
                    ErrorKind::ScopeStackMismatch,
                    format!("block {} branches without a trailing condition", block.id),
                ));
            }
        }

        if block.is_exit {
            // Safety-net epilogue: a fall-through off the end of the
            // function returns 0.
            self.emit(I::Mov {
                dst: Ax,
                src: Imm(0),
            });
            self.emit(I::Pop(Bp));
            self.emit(I::Ret);
        }
        Ok(())
    }

    // ---- statements -----------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), Diagnostic> {
        match stmt {
            Stmt::StartCheckPoint(cp) => {
                let slots = cp.total_slots() as i64;
                if slots > 0 {
                    self.emit(I::Sub {
                        dst: Sp,
                        src: Imm(slots),
                    });
                }
                self.scope.enter_scope(cp.id, &cp.names, &cp.sizes);
            }
            Stmt::EndCheckPoint(cp) => {
                let released = self.scope.exit_scope(cp.id)?;
                if released > 0 {
                    self.emit(I::Add {
                        dst: Sp,
                        src: Imm(released),
                    });
                }
            }
            Stmt::VarDecl(decl) | Stmt::LetDecl(decl) => self.emit_decl(decl),
            Stmt::Assign { target, value, pos } => self.emit_assign(target, value, *pos),
            Stmt::Expr(expr) => self.emit_expr(expr),
            Stmt::Return { value, pos: _ } => {
                match value {
                    Some(expr) => self.emit_expr(expr),
                    None => self.emit(I::Mov {
                        dst: Ax,
                        src: Imm(0),
                    }),
                }
                // One cumulative release of every slot still allocated by
                // the checkpoints active on this path.
                let outstanding = self.scope.total_allocated();
                if outstanding > 0 {
                    self.emit(I::Add {
                        dst: Sp,
                        src: Imm(outstanding),
                    });
                }
                self.emit(I::Pop(Bp));
                self.emit(I::Ret);
            }
            Stmt::Empty => {}
            // Control flow was decomposed by the CFG builder; anything
            // else here is a builder bug.
            other => {
                return Err(Diagnostic::new(
                    ErrorKind::ScopeStackMismatch,
                    format!("unexpected statement in a basic block: {other:?}"),
                ))
            }
        }
        Ok(())
    }

    fn emit_decl(&mut self, decl: &Decl) {
        let location = match self.scope.lookup_declared(decl.name) {
            Some(location) => location,
            None => {
                // Not covered by any checkpoint (for-loop init): reserve a
                // root-scope slot on the spot.
                let (offset, fresh) = self.scope.declare_function_variable(decl.name);
                if fresh {
                    self.emit(I::Sub {
                        dst: Sp,
                        src: Imm(1),
                    });
                }
                super::scope::VarLocation { offset, size: 1 }
            }
        };

        if location.size == 1 {
            match &decl.init {
                Some(expr) => self.emit_expr(expr),
                None => self.emit(I::Mov {
                    dst: Ax,
                    src: Imm(0),
                }),
            }
            self.emit(I::Si(location.offset));
        } else {
            // struct value: zero every slot
            self.emit(I::Mov {
                dst: Ax,
                src: Imm(0),
            });
            for slot in 0..location.size {
                self.emit(I::Si(location.offset + slot as i64));
            }
        }
        self.scope.mark_initialized(decl.name);
    }

    fn emit_assign(&mut self, target: &Expr, value: &Expr, pos: Pos) {
        match target {
            Expr::Ident(name) => {
                self.emit_expr(value);
                match self.scope.lookup(*name) {
                    Some(location) => self.emit(I::Si(location.offset)),
                    None => self.report(
                        ErrorKind::Name,
                        pos,
                        format!("assignment to unknown variable '{name}'"),
                    ),
                }
            }
            Expr::Deref(inner) => {
                // address first, then the value, then store through bx
                self.emit_expr(inner);
                self.emit(I::Push(Reg(Ax)));
                self.emit_expr(value);
                self.emit(I::Pop(Bx));
                self.emit(I::Sir(Bx));
            }
            Expr::Member(access) => {
                self.emit_member_address(access);
                self.emit(I::Push(Reg(Ax)));
                self.emit_expr(value);
                self.emit(I::Pop(Bx));
                self.emit(I::Sir(Bx));
            }
            other => self.report(
                ErrorKind::Parse,
                pos,
                format!("invalid assignment target: {other:?}"),
            ),
        }
    }

    fn emit_cond_branch(&mut self, cond: &Expr, true_succ: usize, false_succ: usize) {
        let cond = peel_parens(cond);
        match cond {
            Expr::Binary { op, lhs, rhs } if op.is_comparison() => {
                self.emit_expr(lhs);
                self.emit(I::Push(Reg(Ax)));
                self.emit_expr(rhs);
                self.emit(I::Pop(Bx));
                self.emit(I::Cmp {
                    lhs: Reg(Bx),
                    rhs: Reg(Ax),
                });
                let target = self.block_label(true_succ);
                self.emit(I::Jcc {
                    cond: comparison_cond(*op),
                    target,
                });
            }
            other => {
                self.emit_expr(other);
                self.emit(I::Cmp {
                    lhs: Reg(Ax),
                    rhs: Imm(0),
                });
                let target = self.block_label(true_succ);
                self.emit(I::Jcc {
                    cond: Cond::Ne,
                    target,
                });
            }
        }
        let target = self.block_label(false_succ);
        self.emit(I::Jmp(target));
    }

    // ---- expressions ----------------------------------------------------

    /// Emit an expression; the result lands in `ax`.
    fn emit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Number(n) => self.emit(I::Mov {
                dst: Ax,
                src: Imm(*n),
            }),
            Expr::Paren(inner) => self.emit_expr(inner),
            Expr::Ident(name) => match self.scope.lookup(*name) {
                Some(location) if location.size == 1 => self.emit(I::Li(location.offset)),
                Some(_) => {
                    self.errors.push(Diagnostic::new(
                        ErrorKind::Type,
                        format!("struct value '{name}' cannot be used as a plain expression"),
                    ));
                    self.emit(I::Mov {
                        dst: Ax,
                        src: Imm(0),
                    });
                }
                None => {
                    self.errors.push(Diagnostic::new(
                        ErrorKind::Name,
                        format!("unknown variable '{name}'"),
                    ));
                    self.emit(I::Mov {
                        dst: Ax,
                        src: Imm(0),
                    });
                }
            },
            Expr::Unary { op, inner } => {
                self.emit_expr(inner);
                match op {
                    UnOp::Neg => {
                        self.emit(I::Mov {
                            dst: Bx,
                            src: Reg(Ax),
                        });
                        self.emit(I::Mov {
                            dst: Ax,
                            src: Imm(0),
                        });
                        self.emit(I::Sub {
                            dst: Ax,
                            src: Reg(Bx),
                        });
                    }
                    UnOp::Not => {
                        self.emit(I::Cmp {
                            lhs: Reg(Ax),
                            rhs: Imm(0),
                        });
                        self.emit(I::Set {
                            cond: Cond::Eq,
                            dst: Ax,
                        });
                        self.emit(I::And {
                            dst: Ax,
                            src: Imm(1),
                        });
                    }
                }
            }
            Expr::AddressOf(name) => match self.scope.lookup(*name) {
                Some(location) => self.emit(I::Lea(location.offset)),
                None => {
                    self.errors.push(Diagnostic::new(
                        ErrorKind::Name,
                        format!("cannot take the address of unknown variable '{name}'"),
                    ));
                    self.emit(I::Mov {
                        dst: Ax,
                        src: Imm(0),
                    });
                }
            },
            Expr::Deref(inner) => {
                self.emit_expr(inner);
                self.emit(I::Lir(Ax));
            }
            Expr::Member(access) => {
                self.emit_member_address(access);
                self.emit(I::Lir(Ax));
            }
            Expr::Call { callee, args, pos } => self.emit_call(*callee, args, *pos),
            Expr::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs),
        }
    }

    /// Leave the address of `obj.field` / `obj->field` in `ax`.
    fn emit_member_address(&mut self, access: &MemberAccess) {
        match self.scope.lookup(access.object) {
            Some(location) => {
                if access.via_pointer {
                    self.emit(I::Li(location.offset));
                } else {
                    self.emit(I::Lea(location.offset));
                }
            }
            None => {
                self.report(
                    ErrorKind::Name,
                    access.pos,
                    format!("unknown variable '{}'", access.object),
                );
                self.emit(I::Mov {
                    dst: Ax,
                    src: Imm(0),
                });
            }
        }
        if access.field_offset > 0 {
            self.emit(I::Add {
                dst: Ax,
                src: Imm(access.field_offset as i64),
            });
        }
    }

    fn emit_call(&mut self, callee: Id, args: &[Expr], pos: Pos) {
        let builtin = self
            .ctx
            .functions
            .get(&callee)
            .is_some_and(|sig| sig.builtin);
        if builtin {
            if args.len() != 1 {
                self.report(
                    ErrorKind::Type,
                    pos,
                    format!("'{callee}' takes exactly one argument"),
                );
            }
            match args.first() {
                Some(arg) => self.emit_expr(arg),
                None => self.emit(I::Mov {
                    dst: Ax,
                    src: Imm(0),
                }),
            }
            match callee.as_str() {
                "alloc" => self.emit(I::Alloc),
                _ => self.emit(I::Free),
            }
            return;
        }

        // Arguments go on the stack right-to-left so parameter i reads at
        // bp + 2 + i; the caller cleans up after the call returns.
        for arg in args.iter().rev() {
            self.emit_expr(arg);
            self.emit(I::Push(Reg(Ax)));
        }
        self.emit(I::Call(Sym(callee)));
        if !args.is_empty() {
            self.emit(I::Add {
                dst: Sp,
                src: Imm(args.len() as i64),
            });
        }
    }

    fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
        // push the left, compute the right, pop the left into bx
        self.emit_expr(lhs);
        if matches!(op, BinOp::And | BinOp::Or) {
            self.normalize_truth();
        }
        self.emit(I::Push(Reg(Ax)));
        self.emit_expr(rhs);
        if matches!(op, BinOp::And | BinOp::Or) {
            self.normalize_truth();
        }
        self.emit(I::Pop(Bx));

        match op {
            BinOp::Add => self.emit(I::Add {
                dst: Ax,
                src: Reg(Bx),
            }),
            BinOp::Mul => self.emit(I::Mul {
                dst: Ax,
                src: Reg(Bx),
            }),
            BinOp::Sub => {
                self.emit(I::Sub {
                    dst: Bx,
                    src: Reg(Ax),
                });
                self.emit(I::Mov {
                    dst: Ax,
                    src: Reg(Bx),
                });
            }
            BinOp::Div => {
                self.emit(I::Div {
                    dst: Bx,
                    src: Reg(Ax),
                });
                self.emit(I::Mov {
                    dst: Ax,
                    src: Reg(Bx),
                });
            }
            BinOp::Power => {
                self.emit(I::Power {
                    dst: Bx,
                    src: Reg(Ax),
                });
                self.emit(I::Mov {
                    dst: Ax,
                    src: Reg(Bx),
                });
            }
            BinOp::Mod => {
                // a - (a / b) * b, with bx = a and ax = b on entry
                self.emit(I::Push(Reg(Bx)));
                self.emit(I::Push(Reg(Ax)));
                self.emit(I::Div {
                    dst: Bx,
                    src: Reg(Ax),
                });
                self.emit(I::Pop(Ax));
                self.emit(I::Mul {
                    dst: Bx,
                    src: Reg(Ax),
                });
                self.emit(I::Pop(Ax));
                self.emit(I::Sub {
                    dst: Ax,
                    src: Reg(Bx),
                });
            }
            BinOp::And => self.emit(I::And {
                dst: Ax,
                src: Reg(Bx),
            }),
            BinOp::Or => {
                self.emit(I::Add {
                    dst: Ax,
                    src: Reg(Bx),
                });
                self.normalize_truth();
            }
            comparison => {
                // value context: materialize the flags as 0/1
                self.emit(I::Cmp {
                    lhs: Reg(Bx),
                    rhs: Reg(Ax),
                });
                self.emit(I::Set {
                    cond: comparison_cond(comparison),
                    dst: Ax,
                });
                self.emit(I::And {
                    dst: Ax,
                    src: Imm(1),
                });
            }
        }
    }

    /// Collapse `ax` to 0/1.
    fn normalize_truth(&mut self) {
        self.emit(I::Cmp {
            lhs: Reg(Ax),
            rhs: Imm(0),
        });
        self.emit(I::Set {
            cond: Cond::Ne,
            dst: Ax,
        });
        self.emit(I::And {
            dst: Ax,
            src: Imm(1),
        });
    }
}

fn comparison_cond(op: BinOp) -> Cond {
    match op {
        BinOp::Eq => Cond::Eq,
        BinOp::Ne => Cond::Ne,
        BinOp::Lt => Cond::Lt,
        BinOp::Le => Cond::Le,
        BinOp::Gt => Cond::Gt,
        BinOp::Ge => Cond::Ge,
        _ => unreachable!("not a comparison operator"),
    }
}

fn peel_parens(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(inner) => peel_parens(inner),
        other => other,
    }
}
