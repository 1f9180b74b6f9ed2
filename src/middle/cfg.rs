//! The control-flow graph builder.
//!
//! Each function's annotated statement list is linearized into basic
//! blocks: simple statements (declarations, assignments, expression
//! statements, checkpoint markers) accumulate into the current block,
//! while control flow closes the current block and wires up branch
//! blocks.  Successor order is meaningful everywhere: position 0 is the
//! *true* branch, the last position is the *false*/fall-through branch.
//!
//! Blocks live in an arena (`Vec<BasicBlock>`) and cross-reference each
//! other by index, so the graph needs no cyclic owning references.
//!
//! After construction two optimizations run to fixpoint: empty-block
//! removal (an internal block with no statements is unlinked and its
//! predecessors are rewired to its successor) and linear merge (a block
//! with a single successor whose successor has it as single predecessor
//! absorbs that successor).  Duplicate edges never get inserted in the
//! first place.

use crate::common::{id, Diagnostic, ErrorKind, Id, Pos, Set};
use crate::front::ast::{Expr, Function, Stmt};

#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Unique id of the form `{function}_block_{n}`.
    pub id: Id,
    pub stmts: Vec<Stmt>,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
    pub is_entry: bool,
    pub is_exit: bool,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub function: Id,
    pub entry: usize,
    pub exit: usize,
    pub blocks: Vec<BasicBlock>,
    /// The edge list, deduplicated, derived from the successor lists.
    pub edges: Vec<(usize, usize)>,
}

impl Cfg {
    /// Indices of blocks reachable from the entry block.
    pub fn reachable(&self) -> Set<usize> {
        let mut seen = Set::new();
        let mut work = vec![self.entry];
        while let Some(index) = work.pop() {
            if seen.insert(index) {
                work.extend(self.blocks[index].succs.iter().copied());
            }
        }
        seen
    }
}

impl std::fmt::Display for Cfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "cfg {} ({} blocks)", self.function, self.blocks.len())?;
        for block in &self.blocks {
            let mark = if block.is_entry {
                " (entry)"
            } else if block.is_exit {
                " (exit)"
            } else {
                ""
            };
            let succs: Vec<String> = block
                .succs
                .iter()
                .map(|s| self.blocks[*s].id.to_string())
                .collect();
            writeln!(
                f,
                "  {}{}: {} stmt(s) -> [{}]",
                block.id,
                mark,
                block.stmts.len(),
                succs.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Build the control-flow graph of one annotated function.  Problems
/// (`break` outside a loop and the like) are accumulated, not fatal.
pub fn build_cfg(function: &Function) -> (Cfg, Vec<Diagnostic>) {
    let mut builder = Builder {
        function: function.name,
        blocks: Vec::new(),
        exit: 0,
        loops: Vec::new(),
        errors: Vec::new(),
    };

    let entry = builder.new_block();
    builder.blocks[entry].is_entry = true;
    let exit = builder.new_block();
    builder.blocks[exit].is_exit = true;
    builder.exit = exit;

    let (last, terminated) = builder.visit(&function.body, entry);
    if !terminated {
        builder.link(last, exit);
    }

    builder.optimize();
    let cfg = builder.finish(entry);
    (cfg, builder.errors)
}

struct LoopFrame {
    /// Where `continue` goes: the header (while) or the update block (for).
    continue_to: usize,
    /// Where `break` goes: the block after the loop.
    break_to: usize,
}

struct Builder {
    function: Id,
    blocks: Vec<BasicBlock>,
    exit: usize,
    loops: Vec<LoopFrame>,
    errors: Vec<Diagnostic>,
}

impl Builder {
    fn new_block(&mut self) -> usize {
        let index = self.blocks.len();
        self.blocks.push(BasicBlock {
            id: id(&format!("{}_block_{}", self.function, index)),
            stmts: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            is_entry: false,
            is_exit: false,
        });
        index
    }

    /// Add the edge `from -> to` unless it already exists.
    fn link(&mut self, from: usize, to: usize) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
        }
        if !self.blocks[to].preds.contains(&from) {
            self.blocks[to].preds.push(from);
        }
    }

    /// Linearize a statement list starting in block `cur`.  Returns the
    /// block that control falls out of and whether the list ended in a
    /// terminator (return/break/continue on every path through the tail).
    fn visit(&mut self, stmts: &[Stmt], mut cur: usize) -> (usize, bool) {
        let mut terminated = false;
        for stmt in stmts {
            if terminated {
                // Statements after a terminator collect into their own
                // unreachable block, kept as a dead-code component.
                cur = self.new_block();
                terminated = false;
            }
            match stmt {
                Stmt::Block(inner) => {
                    (cur, terminated) = self.visit(inner, cur);
                }
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    (cur, terminated) = self.visit_if(cond, then_branch, else_branch.as_deref(), cur);
                }
                Stmt::While { cond, body } => {
                    cur = self.visit_while(cond, body, cur);
                }
                Stmt::For {
                    init,
                    cond,
                    update,
                    body,
                } => {
                    cur = self.visit_for(init.as_deref(), cond.as_ref(), update.as_deref(), body, cur);
                }
                Stmt::Return { .. } => {
                    self.blocks[cur].stmts.push(stmt.clone());
                    self.link(cur, self.exit);
                    terminated = true;
                }
                Stmt::Break(pos) => {
                    match self.loops.last() {
                        Some(frame) => {
                            let target = frame.break_to;
                            self.link(cur, target);
                            terminated = true;
                        }
                        None => self.report_outside_loop("break", *pos),
                    }
                }
                Stmt::Continue(pos) => {
                    match self.loops.last() {
                        Some(frame) => {
                            let target = frame.continue_to;
                            self.link(cur, target);
                            terminated = true;
                        }
                        None => self.report_outside_loop("continue", *pos),
                    }
                }
                Stmt::Empty => {}
                simple => self.blocks[cur].stmts.push(simple.clone()),
            }
        }
        (cur, terminated)
    }

    fn report_outside_loop(&mut self, what: &str, pos: Pos) {
        self.errors.push(Diagnostic::at(
            ErrorKind::Parse,
            pos,
            format!("'{what}' outside of a loop"),
        ));
    }

    fn visit_if(
        &mut self,
        cond: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
        cur: usize,
    ) -> (usize, bool) {
        // The condition rides as the trailing expression-statement of the
        // block it closes.
        self.blocks[cur].stmts.push(Stmt::Expr(cond.clone()));

        let then_entry = self.new_block();
        self.link(cur, then_entry);
        let (then_exit, then_term) = self.visit(std::slice::from_ref(then_branch), then_entry);

        match else_branch {
            None => {
                let merge = self.new_block();
                self.link(cur, merge);
                if !then_term {
                    self.link(then_exit, merge);
                }
                (merge, false)
            }
            Some(else_branch) => {
                let else_entry = self.new_block();
                self.link(cur, else_entry);
                let (else_exit, else_term) =
                    self.visit(std::slice::from_ref(else_branch), else_entry);
                match (then_term, else_term) {
                    // Both branches leave; a merge block is created but no
                    // live block links into it, so anything after the `if`
                    // stays visible as its own dead component.
                    (true, true) => (self.new_block(), false),
                    (true, false) => (else_exit, false),
                    (false, true) => (then_exit, false),
                    (false, false) => {
                        let merge = self.new_block();
                        self.link(then_exit, merge);
                        self.link(else_exit, merge);
                        (merge, false)
                    }
                }
            }
        }
    }

    fn visit_while(&mut self, cond: &Expr, body: &Stmt, cur: usize) -> usize {
        let header = self.new_block();
        self.link(cur, header);
        self.blocks[header].stmts.push(Stmt::Expr(cond.clone()));

        let body_entry = self.new_block();
        let after = self.new_block();
        self.link(header, body_entry);
        self.link(header, after);

        self.loops.push(LoopFrame {
            continue_to: header,
            break_to: after,
        });
        let (body_exit, terminated) = self.visit(std::slice::from_ref(body), body_entry);
        self.loops.pop();

        if !terminated {
            self.link(body_exit, header);
        }
        after
    }

    fn visit_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        update: Option<&Stmt>,
        body: &Stmt,
        mut cur: usize,
    ) -> usize {
        if let Some(init) = init {
            (cur, _) = self.visit(std::slice::from_ref(init), cur);
        }

        let header = self.new_block();
        self.link(cur, header);
        let cond = cond.cloned().unwrap_or(Expr::Number(1));
        self.blocks[header].stmts.push(Stmt::Expr(cond));

        let body_entry = self.new_block();
        let after = self.new_block();
        let update_block = self.new_block();
        self.link(header, body_entry);
        self.link(header, after);

        self.loops.push(LoopFrame {
            continue_to: update_block,
            break_to: after,
        });
        let (body_exit, terminated) = self.visit(std::slice::from_ref(body), body_entry);
        self.loops.pop();

        if !terminated {
            self.link(body_exit, update_block);
        }
        if let Some(update) = update {
            let _ = self.visit(std::slice::from_ref(update), update_block);
        }
        self.link(update_block, header);
        after
    }

    // ---- optimization ---------------------------------------------------

    fn optimize(&mut self) {
        loop {
            let changed = self.remove_empty_blocks() | self.merge_linear_blocks();
            if !changed {
                break;
            }
        }
    }

    /// Unlink internal blocks with no statements, rewiring predecessors to
    /// the single successor while preserving successor ordering.
    fn remove_empty_blocks(&mut self) -> bool {
        let mut changed = false;
        for index in 0..self.blocks.len() {
            let (preds_empty, succs) = {
                let block = &self.blocks[index];
                if block.is_entry || block.is_exit || !block.stmts.is_empty() {
                    continue;
                }
                (block.preds.is_empty(), block.succs.clone())
            };
            match (preds_empty, succs.as_slice()) {
                // fully disconnected: dropped later, in `finish`
                (true, []) => continue,
                // dead head: unlink from its successors
                (true, succs) => {
                    for succ in succs {
                        self.blocks[*succ].preds.retain(|p| *p != index);
                    }
                    self.blocks[index].succs.clear();
                    changed = true;
                }
                (false, [succ]) => {
                    let succ = *succ;
                    if succ == index {
                        continue;
                    }
                    let preds = self.blocks[index].preds.clone();
                    for pred in &preds {
                        let succs = &mut self.blocks[*pred].succs;
                        for slot in succs.iter_mut() {
                            if *slot == index {
                                *slot = succ;
                            }
                        }
                        dedup_in_order(succs);
                    }
                    let target_preds = &mut self.blocks[succ].preds;
                    target_preds.retain(|p| *p != index);
                    for pred in preds {
                        if !self.blocks[succ].preds.contains(&pred) {
                            self.blocks[succ].preds.push(pred);
                        }
                    }
                    self.blocks[index].preds.clear();
                    self.blocks[index].succs.clear();
                    changed = true;
                }
                _ => {}
            }
        }
        changed
    }

    /// If A has exactly one successor B and B has exactly one predecessor
    /// A, splice B onto A.
    fn merge_linear_blocks(&mut self) -> bool {
        let mut changed = false;
        for a in 0..self.blocks.len() {
            loop {
                let block = &self.blocks[a];
                if block.succs.len() != 1 {
                    break;
                }
                let b = block.succs[0];
                if b == a || self.blocks[b].is_entry || self.blocks[b].preds.len() != 1 {
                    break;
                }
                // splice B onto A
                let spliced = std::mem::take(&mut self.blocks[b].stmts);
                let succs = std::mem::take(&mut self.blocks[b].succs);
                self.blocks[b].preds.clear();
                if self.blocks[b].is_exit {
                    self.blocks[b].is_exit = false;
                    self.blocks[a].is_exit = true;
                    self.exit = a;
                }
                self.blocks[a].stmts.extend(spliced);
                self.blocks[a].succs = succs.clone();
                for succ in succs {
                    let preds = &mut self.blocks[succ].preds;
                    for slot in preds.iter_mut() {
                        if *slot == b {
                            *slot = a;
                        }
                    }
                    dedup_in_order(preds);
                }
                changed = true;
            }
        }
        changed
    }

    /// Drop fully unlinked empty husks, keep dead components with
    /// statements, move the exit block to the end of the list, and rebuild
    /// the edge list.
    fn finish(&mut self, entry: usize) -> Cfg {
        let keep: Vec<usize> = (0..self.blocks.len())
            .filter(|i| {
                let block = &self.blocks[*i];
                block.is_entry
                    || block.is_exit
                    || !block.stmts.is_empty()
                    || !block.preds.is_empty()
                    || !block.succs.is_empty()
            })
            .filter(|i| *i != self.exit)
            .chain(std::iter::once(self.exit))
            .collect();

        let mut remap = vec![usize::MAX; self.blocks.len()];
        for (new, old) in keep.iter().enumerate() {
            remap[*old] = new;
        }

        let mut blocks = Vec::with_capacity(keep.len());
        for old in &keep {
            let mut block = std::mem::replace(
                &mut self.blocks[*old],
                BasicBlock {
                    id: id(""),
                    stmts: Vec::new(),
                    preds: Vec::new(),
                    succs: Vec::new(),
                    is_entry: false,
                    is_exit: false,
                },
            );
            block.preds = block
                .preds
                .iter()
                .filter(|p| remap[**p] != usize::MAX)
                .map(|p| remap[*p])
                .collect();
            block.succs = block.succs.iter().map(|s| remap[*s]).collect();
            blocks.push(block);
        }

        let mut edges = Vec::new();
        for (from, block) in blocks.iter().enumerate() {
            for to in &block.succs {
                if !edges.contains(&(from, *to)) {
                    edges.push((from, *to));
                }
            }
        }

        Cfg {
            function: self.function,
            entry: remap[entry],
            exit: remap[self.exit],
            blocks,
            edges,
        }
    }
}

/// Remove duplicates while keeping the first occurrence of each element in
/// place (successor order is meaningful).
fn dedup_in_order(items: &mut Vec<usize>) {
    let mut seen = Set::new();
    items.retain(|item| seen.insert(*item));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CompilerContext;
    use crate::front::{annotate_program, parse};

    fn cfg_of(src: &str) -> Cfg {
        let mut ctx = CompilerContext::new();
        let result = parse(src, &mut ctx);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        let program = annotate_program(result.program, &mut ctx);
        let (cfg, errors) = build_cfg(&program.functions[0]);
        assert!(errors.is_empty(), "{:?}", errors);
        cfg
    }

    fn assert_core_invariants(cfg: &Cfg) {
        let reachable = cfg.reachable();
        for (index, block) in cfg.blocks.iter().enumerate() {
            if !reachable.contains(&index) {
                continue;
            }
            if !block.is_exit {
                assert!(
                    !block.succs.is_empty(),
                    "live non-exit block {} has no successor",
                    block.id
                );
            }
            if !block.is_entry && !block.is_exit {
                assert!(
                    !block.stmts.is_empty(),
                    "internal block {} is empty",
                    block.id
                );
            }
            if block
                .stmts
                .iter()
                .any(|s| matches!(s, Stmt::Return { .. }))
            {
                assert!(
                    block.succs.iter().all(|s| *s == cfg.exit),
                    "a returning block may only lead to exit"
                );
            }
        }
    }

    #[test]
    fn empty_body_connects_entry_to_exit() {
        let cfg = cfg_of("int main() { }");
        assert!(cfg.blocks[cfg.entry]
            .succs
            .contains(&cfg.exit) || cfg.entry == cfg.exit);
        assert_core_invariants(&cfg);
    }

    #[test]
    fn straight_line_code_collapses() {
        let cfg = cfg_of("int main() { int x = 1; int y = 2; return x + y; }");
        assert_core_invariants(&cfg);
        // one block of code plus the exit
        let reachable = cfg.reachable();
        assert!(reachable.len() <= 3);
    }

    #[test]
    fn if_else_has_true_branch_first() {
        let cfg = cfg_of(
            "int main() { int x = 1; if (x > 0) { x = 2; } else { x = 3; } return x; }",
        );
        assert_core_invariants(&cfg);
        let cond = cfg
            .blocks
            .iter()
            .position(|b| b.succs.len() == 2)
            .expect("there must be a condition block");
        assert_eq!(cfg.blocks[cond].succs.len(), 2);
    }

    #[test]
    fn both_branches_returning_connect_to_exit() {
        let cfg = cfg_of("int main() { if (1) { return 1; } else { return 2; } }");
        assert_core_invariants(&cfg);
        let exit_preds = &cfg.blocks[cfg.exit].preds;
        assert!(exit_preds.len() >= 2);
    }

    #[test]
    fn while_loop_has_back_edge() {
        let cfg = cfg_of("int main() { int i = 0; while (i < 3) { i = i + 1; } return i; }");
        assert_core_invariants(&cfg);
        let header = cfg
            .blocks
            .iter()
            .position(|b| b.succs.len() == 2)
            .expect("loop header");
        // some reachable block loops back to the header
        assert!(
            cfg.blocks.iter().any(|b| b.succs.contains(&header) && !b.is_entry),
            "missing loop back edge"
        );
    }

    #[test]
    fn infinite_while_keeps_a_cycle() {
        let cfg = cfg_of("int main() { while (1) { } return 0; }");
        let header = cfg
            .blocks
            .iter()
            .position(|b| b.succs.len() == 2)
            .expect("loop header");
        // the body (which still carries its checkpoint markers) must loop
        // back to the header
        let body = cfg.blocks[header].succs[0];
        assert!(
            cfg.blocks[body].succs.contains(&header),
            "missing loop back edge"
        );
    }

    #[test]
    fn for_loop_routes_continue_through_update() {
        let cfg = cfg_of(
            "int main() { int s = 0; for (int i = 0; i < 10; i = i + 1) { if (i == 2) { continue; } s = s + i; } return s; }",
        );
        assert_core_invariants(&cfg);
    }

    #[test]
    fn break_leaves_the_loop() {
        let cfg = cfg_of(
            "int main() { int i = 0; while (1) { i = i + 1; if (i > 4) { break; } } return i; }",
        );
        assert_core_invariants(&cfg);
    }

    #[test]
    fn break_outside_loop_is_reported() {
        let mut ctx = CompilerContext::new();
        let result = parse("int main() { break; return 0; }", &mut ctx);
        assert!(result.errors.is_empty());
        let program = annotate_program(result.program, &mut ctx);
        let (_, errors) = build_cfg(&program.functions[0]);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn dead_code_after_double_return_is_its_own_component() {
        let cfg = cfg_of(
            "int main() { if (1) { return 1; } else { return 2; } int x = 3; return x; }",
        );
        let reachable = cfg.reachable();
        assert!(
            reachable.len() < cfg.blocks.len(),
            "the trailing statements must stay as an unreachable component"
        );
        assert_core_invariants(&cfg);
    }

    #[test]
    fn edges_are_deduplicated() {
        let cfg = cfg_of("int main() { int x = 0; if (x) { x = 1; } return x; }");
        let mut seen = Set::new();
        for edge in &cfg.edges {
            assert!(seen.insert(*edge), "duplicate edge {edge:?}");
        }
    }
}
