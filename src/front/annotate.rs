//! The scope-annotation pass.
//!
//! A single top-down walk rewrites every block `{ s1, ..., sn }` into
//! `{ StartCheckPoint, s1', ..., sn', EndCheckPoint }` where the paired
//! markers carry a program-unique id, the nesting depth, and the names and
//! slot sizes of the block's direct declarations.  A later traversal can
//! then reserve stack space at the start marker and release it at the end
//! marker without re-scanning the block.
//!
//! The pass runs exactly once per program: running it again would nest
//! markers inside markers.

use crate::common::CompilerContext;

use super::ast::*;

pub fn annotate_program(program: Program, ctx: &mut CompilerContext) -> Program {
    Program {
        functions: program
            .functions
            .into_iter()
            .map(|f| annotate_function(f, ctx))
            .collect(),
    }
}

fn annotate_function(function: Function, ctx: &mut CompilerContext) -> Function {
    // The function body is the outermost block, at depth 1.
    let body = annotate_block(function.body, 1, ctx);
    Function { body, ..function }
}

fn annotate_block(stmts: Vec<Stmt>, depth: usize, ctx: &mut CompilerContext) -> Vec<Stmt> {
    // Only direct declarations contribute; nested blocks carry their own
    // markers.
    let mut names = Vec::new();
    let mut sizes = Vec::new();
    for stmt in &stmts {
        if let Stmt::VarDecl(decl) | Stmt::LetDecl(decl) = stmt {
            names.push(decl.name);
            sizes.push(decl.size);
        }
    }
    let checkpoint = CheckPoint {
        id: ctx.next_scope_id(),
        depth,
        names,
        sizes,
    };

    let mut annotated = Vec::with_capacity(stmts.len() + 2);
    annotated.push(Stmt::StartCheckPoint(checkpoint.clone()));
    for stmt in stmts {
        annotated.push(annotate_stmt(stmt, depth, ctx));
    }
    annotated.push(Stmt::EndCheckPoint(checkpoint));
    annotated
}

fn annotate_stmt(stmt: Stmt, depth: usize, ctx: &mut CompilerContext) -> Stmt {
    match stmt {
        Stmt::Block(stmts) => Stmt::Block(annotate_block(stmts, depth + 1, ctx)),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => Stmt::If {
            cond,
            then_branch: Box::new(annotate_stmt(*then_branch, depth, ctx)),
            else_branch: else_branch.map(|s| Box::new(annotate_stmt(*s, depth, ctx))),
        },
        Stmt::While { cond, body } => Stmt::While {
            cond,
            body: Box::new(annotate_stmt(*body, depth, ctx)),
        },
        Stmt::For {
            init,
            cond,
            update,
            body,
        } => Stmt::For {
            init,
            cond,
            update,
            body: Box::new(annotate_stmt(*body, depth, ctx)),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Set;
    use crate::front::parse::parse;

    fn annotated(src: &str) -> Program {
        let mut ctx = CompilerContext::new();
        let result = parse(src, &mut ctx);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        annotate_program(result.program, &mut ctx)
    }

    fn checkpoints(stmts: &[Stmt], out: &mut Vec<(bool, CheckPoint)>) {
        for stmt in stmts {
            match stmt {
                Stmt::StartCheckPoint(cp) => out.push((true, cp.clone())),
                Stmt::EndCheckPoint(cp) => out.push((false, cp.clone())),
                Stmt::Block(inner) => checkpoints(inner, out),
                Stmt::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    checkpoints(std::slice::from_ref(&**then_branch), out);
                    if let Some(e) = else_branch {
                        checkpoints(std::slice::from_ref(&**e), out);
                    }
                }
                Stmt::While { body, .. } | Stmt::For { body, .. } => {
                    checkpoints(std::slice::from_ref(&**body), out)
                }
                _ => {}
            }
        }
    }

    #[test]
    fn body_is_wrapped_at_depth_one() {
        let program = annotated("int main() { int x = 1; return x; }");
        let body = &program.functions[0].body;
        let Stmt::StartCheckPoint(start) = &body[0] else {
            panic!("body must start with a checkpoint");
        };
        let Stmt::EndCheckPoint(end) = body.last().unwrap() else {
            panic!("body must end with a checkpoint");
        };
        assert_eq!(start, end);
        assert_eq!(start.depth, 1);
        assert_eq!(start.names.len(), 1);
        assert_eq!(start.sizes, vec![1]);
    }

    #[test]
    fn nested_blocks_do_not_contribute_to_the_outer_marker() {
        let program = annotated("int main() { int x = 1; { int y = 2; int z = 3; } return x; }");
        let mut cps = Vec::new();
        checkpoints(&program.functions[0].body, &mut cps);
        // outer start, inner start, inner end, outer end
        assert_eq!(cps.len(), 4);
        assert_eq!(cps[0].1.sizes, vec![1]);
        assert_eq!(cps[1].1.sizes, vec![1, 1]);
        assert_eq!(cps[1].1.depth, 2);
    }

    #[test]
    fn checkpoint_ids_are_unique_and_paired() {
        let program =
            annotated("int main() { { int a = 1; } { int b = 2; } if (1) { int c = 3; } return 0; }");
        let mut cps = Vec::new();
        checkpoints(&program.functions[0].body, &mut cps);
        let starts: Vec<_> = cps.iter().filter(|(s, _)| *s).collect();
        let ids: Set<_> = starts.iter().map(|(_, cp)| cp.id).collect();
        assert_eq!(ids.len(), starts.len(), "checkpoint ids must be unique");
        // balanced pairing
        let mut stack = Vec::new();
        for (is_start, cp) in &cps {
            if *is_start {
                stack.push(cp.id);
            } else {
                assert_eq!(stack.pop(), Some(cp.id));
            }
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn struct_values_contribute_their_size() {
        let program = annotated(
            "struct Point { int x; int y; };\n\
             int main() { struct Point p; int q = 0; return q; }",
        );
        let Stmt::StartCheckPoint(start) = &program.functions[0].body[0] else {
            panic!("expected a checkpoint");
        };
        assert_eq!(start.sizes, vec![2, 1]);
    }

    #[test]
    fn for_init_is_not_collected_by_any_block() {
        let program = annotated("int main() { for (int i = 0; i < 3; i = i + 1) { int b = i; } return 0; }");
        let mut cps = Vec::new();
        checkpoints(&program.functions[0].body, &mut cps);
        for (_, cp) in &cps {
            assert!(
                !cp.names.iter().any(|n| n.as_str() == "i"),
                "the for-loop variable gets its slot from the function root scope"
            );
        }
    }
}
