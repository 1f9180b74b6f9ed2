//! Back-end tests: the shape of generated assembly and linked listings.

use crate::back::asm::{Instruction, Operand};
use crate::driver;

fn compiled(src: &str) -> driver::CompileResult {
    let result = driver::compile(src);
    assert!(result.success, "compile failed: {:?}", result.errors);
    result
}

fn asm_of(src: &str) -> String {
    compiled(src).assembly()
}

#[test]
fn constant_return_moves_into_the_accumulator() {
    let asm = asm_of("int main() { return 7; }");
    assert!(asm.starts_with("main:"), "function label first:\n{asm}");
    assert!(asm.contains("mov ax, 7"), "{asm}");
    assert!(asm.contains("ret"), "{asm}");
}

#[test]
fn prologue_and_epilogue_manage_the_frame() {
    let asm = asm_of("int main() { return 1; }");
    assert!(asm.contains("push bp"), "{asm}");
    assert!(asm.contains("mov bp, sp"), "{asm}");
    assert!(asm.contains("pop bp"), "{asm}");
}

#[test]
fn checkpoints_reserve_and_release_slots() {
    let asm = asm_of("int main() { int x = 1; { int y = 2; } return x; }");
    // one slot for the body, one for the inner block
    assert_eq!(asm.matches("sub sp, 1").count(), 2, "{asm}");
    // the inner block releases its slot on the way out
    assert!(asm.contains("add sp, 1"), "{asm}");
}

#[test]
fn locals_store_below_the_frame_pointer() {
    let asm = asm_of("int main() { int x = 9; return x; }");
    assert!(asm.contains("si -1"), "{asm}");
    assert!(asm.contains("li -1"), "{asm}");
}

#[test]
fn comparison_conditions_compare_then_branch() {
    let asm = asm_of("int main() { int s = 70; if (s >= 60) { return 1; } return 0; }");
    assert!(asm.contains("cmp bx, ax"), "{asm}");
    assert!(asm.contains("jge"), "{asm}");
    assert!(asm.contains("jmp"), "{asm}");
}

#[test]
fn calls_push_arguments_and_clean_up() {
    let asm = asm_of(
        "int sum(int n) { return n; }\n\
         int main() { return sum(5); }",
    );
    assert!(asm.contains("push ax"), "{asm}");
    assert!(asm.contains("call sum"), "{asm}");
    assert!(asm.contains("add sp, 1"), "{asm}");
}

#[test]
fn parameters_read_past_the_saved_frame() {
    let asm = asm_of("int first(int a, int b) { return a; }\nint main() { return first(1, 2); }");
    // parameter 0 at bp+2
    assert!(asm.contains("li 2"), "{asm}");
}

#[test]
fn for_loop_variable_gets_a_root_slot_and_is_released_on_return() {
    let src = "int sum(int n) { int s = 0; for (int i = 1; i <= n; i = i + 1) s = s + i; return s; }\n\
               int main() { return sum(5); }";
    let result = compiled(src);
    let sum = &result.assembly_per_function[0];
    assert_eq!(sum.name.as_str(), "sum");
    // one checkpoint slot for s, one dynamic slot for i
    assert_eq!(sum.text.matches("sub sp, 1").count(), 2, "{}", sum.text);
    // the return releases both at once
    assert!(sum.text.contains("add sp, 2"), "{}", sum.text);
}

#[test]
fn builtins_compile_to_syscalls_not_calls() {
    let asm = asm_of("int main() { int p = alloc(3); free(p); return 0; }");
    assert!(asm.contains("alloc"), "{asm}");
    assert!(asm.contains("free"), "{asm}");
    assert!(!asm.contains("call alloc"), "{asm}");
    assert!(!asm.contains("call free"), "{asm}");
}

#[test]
fn every_function_ends_with_a_safety_net_return() {
    let result = compiled(
        "int f() { return 1; }\n\
         int g(int x) { if (x) { return 2; } return 3; }\n\
         int main() { return f() + g(0); }",
    );
    for function in &result.assembly_per_function {
        assert!(
            function.text.trim_end().ends_with("ret"),
            "{} must end with ret:\n{}",
            function.name,
            function.text
        );
    }
}

#[test]
fn empty_body_returns_zero() {
    let asm = asm_of("int main() { }");
    assert!(asm.contains("mov ax, 0"), "{asm}");
    assert!(asm.trim_end().ends_with("ret"), "{asm}");
}

#[test]
fn static_link_leaves_only_numeric_branch_operands() {
    let result = compiled(
        "int sum(int n) { int s = 0; for (int i = 1; i <= n; i = i + 1) s = s + i; return s; }\n\
         int main() { return sum(5); }",
    );
    let linked = driver::link_program(&result);
    assert!(linked.errors.is_empty(), "{:?}", linked.errors);
    for (addr, instruction) in &linked.code {
        match instruction {
            Instruction::Jmp(target)
            | Instruction::Jcc { target, .. }
            | Instruction::Call(target) => {
                assert!(
                    matches!(target, Operand::Imm(_)),
                    "operand at [{addr}] is not numeric: {instruction}"
                );
            }
            _ => {}
        }
    }
}

#[test]
fn linked_listing_prefixes_every_instruction_with_its_address() {
    let result = compiled("int main() { return 7; }");
    let linked = driver::link_program(&result);
    for (index, line) in linked.lines.iter().enumerate() {
        assert!(
            line.starts_with(&format!("[{index}]")),
            "bad address prefix: {line}"
        );
    }
}

#[test]
fn member_stores_go_through_computed_addresses() {
    let asm = asm_of(
        "struct Point { int x; int y; };\n\
         int main() { struct Point p; p.y = 3; return p.y; }",
    );
    assert!(asm.contains("lea -2"), "{asm}");
    assert!(asm.contains("add ax, 1"), "{asm}");
    assert!(asm.contains("sir bx"), "{asm}");
}

#[test]
fn modulo_lowers_to_div_mul_sub() {
    let asm = asm_of("int main() { return 17 % 5; }");
    assert!(asm.contains("div bx, ax"), "{asm}");
    assert!(asm.contains("mul bx, ax"), "{asm}");
    assert!(asm.contains("sub ax, bx"), "{asm}");
}
