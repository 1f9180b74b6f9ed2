//! The linker.
//!
//! Two passes over textual assembly.  The first strips blanks and
//! comment-only lines, records every `name:` label against the address of
//! the next instruction, and numbers the instructions from zero.  The
//! second re-emits each instruction prefixed with `[address]`, with label
//! operands substituted by their numeric addresses and a trailing
//! `; orig:` comment kept for reading the listing.
//!
//! An unresolved label on a `call` is left symbolic: it is a candidate
//! for dynamic linking and only becomes an error if execution reaches it
//! with nothing loaded.  An unresolved label on any other branch is
//! rendered as `?` and reported as a hard [ErrorKind::Link] problem.
//!
//! For dynamic linking each compilation unit is linked into its own
//! segment: segment `k` occupies the absolute address range
//! `[1000*k, 1000*(k+1))`.

use crate::common::{id, Diagnostic, ErrorKind, Id, Map};

use super::asm::{Instruction, Operand};

/// Width of one dynamic-link segment in instruction addresses.
pub const SEGMENT_SIZE: i64 = 1000;

/// One linked compilation unit.
#[derive(Debug, Clone, Default)]
pub struct LinkedProgram {
    /// The `[address] opcode operands` listing, one entry per
    /// instruction.
    pub lines: Vec<String>,
    /// Resolved instructions by absolute address.
    pub code: Map<i64, Instruction>,
    /// Label to absolute address, kept for diagnostics and for finding
    /// the entry point.
    pub labels: Map<Id, i64>,
    /// Hard link errors (unresolved non-call branches).
    pub errors: Vec<Diagnostic>,
}

impl LinkedProgram {
    pub fn listing(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

/// Link one unit of assembly text with absolute addresses starting at
/// `base` (0 for static linking, `1000 * segment` for dynamic linking).
pub fn link(text: &str, base: i64) -> LinkedProgram {
    let mut program = LinkedProgram::default();

    // Pass 1: label collection.
    let mut instructions: Vec<&str> = Vec::new();
    for raw in text.lines() {
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            program
                .labels
                .insert(id(label.trim()), base + instructions.len() as i64);
        } else {
            instructions.push(line);
        }
    }

    // Pass 2: symbol resolution.
    for (index, line) in instructions.iter().enumerate() {
        let address = base + index as i64;
        let instruction = match Instruction::parse(line) {
            Ok(instruction) => instruction,
            Err(mut diag) => {
                diag.kind = ErrorKind::Link;
                program.errors.push(diag);
                program.lines.push(format!("[{address}] {line} ; ?"));
                continue;
            }
        };
        let (resolved, rendered) = resolve(instruction, address, &program.labels, &mut program.errors);
        program.lines.push(rendered);
        program.code.insert(address, resolved);
    }
    program
}

fn strip_comment(line: &str) -> &str {
    match line.split_once(';') {
        Some((code, _)) => code.trim(),
        None => line.trim(),
    }
}

fn resolve(
    instruction: Instruction,
    address: i64,
    labels: &Map<Id, i64>,
    errors: &mut Vec<Diagnostic>,
) -> (Instruction, String) {
    use Instruction::*;

    match instruction {
        Jmp(Operand::Sym(label)) => match labels.get(&label) {
            Some(target) => {
                let resolved = Jmp(Operand::Imm(*target));
                let line = format!("[{address}] {resolved} ; orig: jmp {label}");
                (resolved, line)
            }
            None => {
                errors.push(Diagnostic::new(
                    ErrorKind::Link,
                    format!("unresolved jump target '{label}'"),
                ));
                (Jmp(Operand::Sym(label)), format!("[{address}] jmp ?"))
            }
        },
        Jcc {
            cond,
            target: Operand::Sym(label),
        } => match labels.get(&label) {
            Some(target) => {
                let resolved = Jcc {
                    cond,
                    target: Operand::Imm(*target),
                };
                let line = format!("[{address}] {resolved} ; orig: j{cond} {label}");
                (resolved, line)
            }
            None => {
                errors.push(Diagnostic::new(
                    ErrorKind::Link,
                    format!("unresolved branch target '{label}'"),
                ));
                (
                    Jcc {
                        cond,
                        target: Operand::Sym(label),
                    },
                    format!("[{address}] j{cond} ?"),
                )
            }
        },
        Call(Operand::Sym(label)) => match labels.get(&label) {
            Some(target) => {
                let resolved = Call(Operand::Imm(*target));
                let line = format!("[{address}] {resolved} ; orig: call {label}");
                (resolved, line)
            }
            // Left symbolic: a dynamic-link candidate, not an error yet.
            None => {
                let unresolved = Call(Operand::Sym(label));
                let line = format!("[{address}] {unresolved}");
                (unresolved, line)
            }
        },
        other => {
            let line = format!("[{address}] {other}");
            (other, line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_to_instruction_addresses() {
        let program = link(
            "main:\n    mov ax, 1\n    jmp done\nmid:\n    mov ax, 2\ndone:\n    ret\n",
            0,
        );
        assert!(program.errors.is_empty());
        assert_eq!(program.labels.get(&id("main")), Some(&0));
        assert_eq!(program.labels.get(&id("mid")), Some(&2));
        assert_eq!(program.labels.get(&id("done")), Some(&3));
        assert_eq!(
            program.code.get(&1),
            Some(&Instruction::Jmp(Operand::Imm(3)))
        );
        assert!(program.lines[1].contains("; orig: jmp done"));
    }

    #[test]
    fn comment_only_and_blank_lines_take_no_addresses() {
        let program = link("; header\n\nmain:\n    ret ; trailing\n", 0);
        assert_eq!(program.code.len(), 1);
        assert_eq!(program.labels.get(&id("main")), Some(&0));
    }

    #[test]
    fn unresolved_call_stays_symbolic() {
        let program = link("main:\n    call helper\n    ret\n", 0);
        assert!(program.errors.is_empty(), "calls stay soft: {:?}", program.errors);
        assert_eq!(
            program.code.get(&0),
            Some(&Instruction::Call(Operand::Sym(id("helper"))))
        );
    }

    #[test]
    fn unresolved_branch_is_a_hard_error() {
        let program = link("main:\n    jmp nowhere\n", 0);
        assert_eq!(program.errors.len(), 1);
        assert_eq!(program.errors[0].kind, ErrorKind::Link);
        assert!(program.lines[0].ends_with("jmp ?"));
    }

    #[test]
    fn segments_offset_every_address() {
        let program = link("lib:\n    mov ax, 5\n    jmp lib\n", 2 * SEGMENT_SIZE);
        assert_eq!(program.labels.get(&id("lib")), Some(&2000));
        assert_eq!(
            program.code.get(&2001),
            Some(&Instruction::Jmp(Operand::Imm(2000)))
        );
    }
}
