//! The virtual machine.
//!
//! Executes a linked listing: fetch the instruction at `pc`, dispatch,
//! advance by one unless the instruction moved `pc`, count the cycle.
//! The data stack is a sparse address-to-value map with `sp` growing
//! downward from 1023; the heap segment lives in a second sparse map that
//! the allocator reaches through the memory-bus seam.  Absolute loads and
//! stores (`lir`/`sir`) route by address: everything at or above the heap
//! start goes to heap memory, everything below goes to the stack.
//!
//! `call` pushes the return address and jumps; `ret` pops it, and with an
//! empty call stack halts the machine (that is how `main` finishes).
//! Under dynamic linking the current segment is just `pc / 1000`; a
//! popped return address carries its segment with it, so cross-segment
//! returns need no special handling.  A `call` whose target is still
//! symbolic raises a "function not loaded" condition the dynamic runner
//! can recover from by loading the missing segment and retrying the same
//! instruction.
//!
//! A configurable cycle budget (5000 by default) bounds every run;
//! exceeding it halts with a [ErrorKind::Budget] error and is reported as
//! a suspected infinite loop.

use derive_more::Display;

use crate::back::asm::{Cond, Instruction, Operand, Register};
use crate::back::link::LinkedProgram;
use crate::common::{Diagnostic, ErrorKind, Id, Map};

use super::heap::{HeapAllocator, MemoryBus};

/// Initial stack pointer; the stack grows toward lower addresses.
pub const STACK_TOP: i64 = 1024;
pub const DEFAULT_CYCLE_LIMIT: u64 = 5000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
#[display("ax={ax} bx={bx} sp={sp} bp={bp}")]
pub struct Registers {
    pub ax: i64,
    pub bx: i64,
    pub sp: i64,
    pub bp: i64,
}

impl Registers {
    fn get(&self, reg: Register) -> i64 {
        match reg {
            Register::Ax => self.ax,
            Register::Bx => self.bx,
            Register::Sp => self.sp,
            Register::Bp => self.bp,
        }
    }

    fn set(&mut self, reg: Register, value: i64) {
        match reg {
            Register::Ax => self.ax = value,
            Register::Bx => self.bx = value,
            Register::Sp => self.sp = value,
            Register::Bp => self.bp = value,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub greater: bool,
    pub equal: bool,
    pub less: bool,
}

impl Flags {
    fn set_from(&mut self, value: i64) {
        self.greater = value > 0;
        self.equal = value == 0;
        self.less = value < 0;
    }

    fn holds(&self, cond: Cond) -> bool {
        match cond {
            Cond::Eq => self.equal,
            Cond::Ne => !self.equal,
            Cond::Lt => self.less,
            Cond::Le => self.less || self.equal,
            Cond::Gt => self.greater,
            Cond::Ge => self.greater || self.equal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum HaltReason {
    #[display("RET")]
    Ret,
    #[display("CycleLimit")]
    CycleLimit,
    #[display("Error")]
    Error,
}

/// What a finished run looks like from the outside.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub success: bool,
    pub reason: HaltReason,
    pub output: String,
    pub registers: Registers,
    pub cycles: u64,
    pub error: Option<Diagnostic>,
}

/// Why a single step could not complete.
#[derive(Debug)]
pub enum StepError {
    /// A `call` reached a symbol no loaded segment defines; the dynamic
    /// runner recovers from this, everyone else treats it as fatal.
    NotLoaded(Id),
    Fatal(Diagnostic),
}

pub struct Machine {
    pub registers: Registers,
    stack: Map<i64, i64>,
    memory: Map<i64, i64>,
    flags: Flags,
    pc: i64,
    halted: bool,
    cycles: u64,
    pub cycle_limit: u64,
    code: Map<i64, Instruction>,
    labels: Map<Id, i64>,
    call_depth: usize,
    heap: HeapAllocator,
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Machine::with_heap(HeapAllocator::default())
    }

    pub fn with_heap(heap: HeapAllocator) -> Self {
        let mut memory = Map::new();
        heap.init(&mut memory);
        Machine {
            registers: Registers {
                ax: 0,
                bx: 0,
                sp: STACK_TOP,
                bp: STACK_TOP,
            },
            stack: Map::new(),
            memory,
            flags: Flags::default(),
            pc: 0,
            halted: false,
            cycles: 0,
            cycle_limit: DEFAULT_CYCLE_LIMIT,
            code: Map::new(),
            labels: Map::new(),
            call_depth: 0,
            heap,
        }
    }

    /// Mount a linked unit: its code joins the address space and its
    /// labels join the symbol table.  Called once for static linking and
    /// once per segment for dynamic linking.
    pub fn load(&mut self, program: &LinkedProgram) {
        self.code.extend(program.code.clone());
        self.labels.extend(program.labels.clone());
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run to halt starting at `entry`, treating unresolved calls as
    /// fatal.
    pub fn run(&mut self, entry: Id) -> RunResult {
        self.run_with_loader(entry, |_| None)
    }

    /// Run to halt starting at `entry`.  When a `call` hits a symbol that
    /// is not loaded, `loader` may supply the missing linked segment; the
    /// machine mounts it and retries the same instruction.
    pub fn run_with_loader(
        &mut self,
        entry: Id,
        mut loader: impl FnMut(Id) -> Option<LinkedProgram>,
    ) -> RunResult {
        match self.labels.get(&entry) {
            Some(address) => self.pc = *address,
            None => {
                return self.finish(
                    HaltReason::Error,
                    Some(Diagnostic::new(
                        ErrorKind::Runtime,
                        format!("unknown label '{entry}'"),
                    )),
                )
            }
        }

        loop {
            if self.halted {
                return self.finish(HaltReason::Ret, None);
            }
            if self.cycles >= self.cycle_limit {
                return self.finish(
                    HaltReason::CycleLimit,
                    Some(Diagnostic::new(
                        ErrorKind::Budget,
                        format!(
                            "cycle limit of {} exceeded: suspected infinite loop",
                            self.cycle_limit
                        ),
                    )),
                );
            }
            match self.step() {
                Ok(()) => {}
                Err(StepError::NotLoaded(symbol)) => match loader(symbol) {
                    // pc was not advanced: the call re-executes against
                    // the freshly mounted segment
                    Some(segment) => self.load(&segment),
                    None => {
                        return self.finish(
                            HaltReason::Error,
                            Some(Diagnostic::new(
                                ErrorKind::Runtime,
                                format!("function '{symbol}' is not loaded"),
                            )),
                        )
                    }
                },
                Err(StepError::Fatal(diag)) => return self.finish(HaltReason::Error, Some(diag)),
            }
        }
    }

    fn finish(&self, reason: HaltReason, error: Option<Diagnostic>) -> RunResult {
        let output = match (&reason, &error) {
            (HaltReason::Ret, _) => format!("ax = {}", self.registers.ax),
            (_, Some(diag)) => diag.to_string(),
            (reason, None) => reason.to_string(),
        };
        RunResult {
            success: reason == HaltReason::Ret,
            reason,
            output,
            registers: self.registers,
            cycles: self.cycles,
            error,
        }
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> Result<(), StepError> {
        let instruction = match self.code.get(&self.pc) {
            Some(instruction) => instruction.clone(),
            None => {
                return Err(fatal(format!(
                    "invalid jump target: no instruction at address {}",
                    self.pc
                )))
            }
        };

        let jumped = self.execute(&instruction)?;
        if !jumped && !self.halted {
            self.pc += 1;
        }
        self.cycles += 1;
        Ok(())
    }

    /// Returns whether the instruction set `pc` itself.
    fn execute(&mut self, instruction: &Instruction) -> Result<bool, StepError> {
        use Instruction::*;

        match instruction {
            Mov { dst, src } => {
                let value = self.value(src)?;
                self.registers.set(*dst, value);
            }
            Add { dst, src } => self.arith(*dst, src, i64::wrapping_add)?,
            Sub { dst, src } => self.arith(*dst, src, i64::wrapping_sub)?,
            Mul { dst, src } => self.arith(*dst, src, i64::wrapping_mul)?,
            Div { dst, src } => {
                let rhs = self.value(src)?;
                if rhs == 0 {
                    return Err(fatal("division by zero".to_owned()));
                }
                let lhs = self.registers.get(*dst);
                let result = floor_div(lhs, rhs);
                self.registers.set(*dst, result);
                self.flags.set_from(result);
            }
            Power { dst, src } => {
                let exp = self.value(src)?;
                let base = self.registers.get(*dst);
                let result = integer_power(base, exp);
                self.registers.set(*dst, result);
                self.flags.set_from(result);
            }
            And { dst, src } => self.arith(*dst, src, |a, b| a & b)?,
            Cmp { lhs, rhs } => {
                let lhs = self.value(lhs)?;
                let rhs = self.value(rhs)?;
                self.flags.set_from(lhs.wrapping_sub(rhs));
            }
            Jmp(target) => {
                self.pc = self.jump_target(target)?;
                return Ok(true);
            }
            Jcc { cond, target } => {
                let target = self.jump_target(target)?;
                if self.flags.holds(*cond) {
                    self.pc = target;
                    return Ok(true);
                }
            }
            Set { cond, dst } => {
                let value = i64::from(self.flags.holds(*cond));
                self.registers.set(*dst, value);
            }
            Push(src) => {
                let value = self.value(src)?;
                self.registers.sp -= 1;
                self.stack.insert(self.registers.sp, value);
            }
            Pop(dst) => {
                let value = self.stack_read(self.registers.sp);
                self.registers.sp += 1;
                self.registers.set(*dst, value);
            }
            Si(offset) => {
                let addr = self.registers.bp + offset;
                self.stack.insert(addr, self.registers.ax);
            }
            Li(offset) => {
                self.registers.ax = self.stack_read(self.registers.bp + offset);
            }
            Lir(reg) => {
                let addr = self.registers.get(*reg);
                self.registers.ax = self.load_absolute(addr);
            }
            Sir(reg) => {
                let addr = self.registers.get(*reg);
                self.store_absolute(addr, self.registers.ax);
            }
            Lea(offset) => {
                self.registers.ax = self.registers.bp + offset;
            }
            Call(target) => {
                let target = match target {
                    Operand::Imm(address) => *address,
                    Operand::Sym(symbol) => match self.labels.get(symbol) {
                        Some(address) => *address,
                        None => return Err(StepError::NotLoaded(*symbol)),
                    },
                    other => return Err(fatal(format!("invalid call target '{other}'"))),
                };
                self.registers.sp -= 1;
                self.stack.insert(self.registers.sp, self.pc + 1);
                self.call_depth += 1;
                self.pc = target;
                return Ok(true);
            }
            Ret => {
                if self.call_depth == 0 {
                    // returning with an empty call stack halts the machine
                    self.halted = true;
                } else {
                    let address = self.stack_read(self.registers.sp);
                    self.registers.sp += 1;
                    self.call_depth -= 1;
                    self.pc = address;
                }
                return Ok(true);
            }
            Alloc => {
                let want = self.registers.ax;
                self.registers.ax = self.heap.alloc(&mut self.memory, want);
            }
            Free => {
                let ptr = self.registers.ax;
                self.heap
                    .free(&mut self.memory, ptr)
                    .map_err(StepError::Fatal)?;
            }
        }
        Ok(false)
    }

    fn arith(
        &mut self,
        dst: Register,
        src: &Operand,
        op: fn(i64, i64) -> i64,
    ) -> Result<(), StepError> {
        let rhs = self.value(src)?;
        let result = op(self.registers.get(dst), rhs);
        self.registers.set(dst, result);
        self.flags.set_from(result);
        Ok(())
    }

    fn value(&self, operand: &Operand) -> Result<i64, StepError> {
        match operand {
            Operand::Reg(reg) => Ok(self.registers.get(*reg)),
            Operand::Imm(value) => Ok(*value),
            Operand::Slot(addr) => Ok(self.stack_read(*addr)),
            Operand::Sym(symbol) => Err(fatal(format!("unresolved operand '{symbol}'"))),
        }
    }

    fn jump_target(&self, operand: &Operand) -> Result<i64, StepError> {
        match operand {
            Operand::Imm(address) => Ok(*address),
            Operand::Sym(symbol) => Err(fatal(format!("unknown label '{symbol}' at runtime"))),
            other => Err(fatal(format!("invalid jump target '{other}'"))),
        }
    }

    fn stack_read(&self, addr: i64) -> i64 {
        self.stack.get(&addr).copied().unwrap_or(0)
    }

    /// Absolute loads route by address: the heap segment or the stack.
    fn load_absolute(&self, addr: i64) -> i64 {
        if addr >= self.heap.start() {
            self.memory.read(addr)
        } else {
            self.stack_read(addr)
        }
    }

    fn store_absolute(&mut self, addr: i64, value: i64) {
        if addr >= self.heap.start() {
            self.memory.write(addr, value);
        } else {
            self.stack.insert(addr, value);
        }
    }
}

fn fatal(message: String) -> StepError {
    StepError::Fatal(Diagnostic::new(ErrorKind::Runtime, message))
}

/// Integer division with floor semantics (the quotient moves toward
/// negative infinity when the signs differ).
fn floor_div(lhs: i64, rhs: i64) -> i64 {
    let quotient = lhs.wrapping_div(rhs);
    let remainder = lhs.wrapping_rem(rhs);
    if remainder != 0 && (remainder < 0) != (rhs < 0) {
        quotient - 1
    } else {
        quotient
    }
}

/// `base ** exp`; negative exponents floor to zero (except the trivial
/// bases where the result stays exact).
fn integer_power(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return match base {
            1 => 1,
            -1 => {
                if exp % 2 == 0 {
                    1
                } else {
                    -1
                }
            }
            _ => 0,
        };
    }
    base.wrapping_pow(exp.min(u32::MAX as i64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::link::link;
    use crate::common::id;

    fn run(asm: &str) -> RunResult {
        let program = link(asm, 0);
        assert!(program.errors.is_empty(), "{:?}", program.errors);
        let mut machine = Machine::new();
        machine.load(&program);
        machine.run(id("main"))
    }

    #[test]
    fn mov_add_ret() {
        let result = run("main:\n    mov ax, 40\n    add ax, 2\n    ret\n");
        assert!(result.success);
        assert_eq!(result.registers.ax, 42);
        assert_eq!(result.reason, HaltReason::Ret);
    }

    #[test]
    fn conditional_branch_follows_flags() {
        let result = run(
            "main:\n    mov ax, 3\n    cmp ax, 5\n    jl small\n    mov ax, 0\n    ret\nsmall:\n    mov ax, 1\n    ret\n",
        );
        assert_eq!(result.registers.ax, 1);
    }

    #[test]
    fn set_on_condition_writes_zero_or_one() {
        let result = run("main:\n    mov ax, 7\n    cmp ax, 7\n    sete ax\n    ret\n");
        assert_eq!(result.registers.ax, 1);
    }

    #[test]
    fn call_and_ret_restore_the_stack_pointer() {
        let asm = "\
main:
    push bp
    mov bp, sp
    mov ax, 5
    push ax
    call double
    add sp, 1
    pop bp
    ret
double:
    push bp
    mov bp, sp
    li 2
    add ax, ax
    pop bp
    ret
";
        let program = link(asm, 0);
        assert!(program.errors.is_empty());
        let mut machine = Machine::new();
        machine.load(&program);
        let result = machine.run(id("main"));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.registers.ax, 10);
        assert_eq!(result.registers.sp, STACK_TOP);
    }

    #[test]
    fn frame_relative_store_and_load() {
        let result = run(
            "main:\n    push bp\n    mov bp, sp\n    sub sp, 1\n    mov ax, 9\n    si -1\n    mov ax, 0\n    li -1\n    add sp, 1\n    pop bp\n    ret\n",
        );
        assert_eq!(result.registers.ax, 9);
    }

    #[test]
    fn lea_lir_sir_round_trip_through_the_stack() {
        let result = run(
            "main:\n    push bp\n    mov bp, sp\n    sub sp, 1\n    mov ax, 3\n    si -1\n    lea -1\n    mov bx, ax\n    mov ax, 77\n    sir bx\n    lir bx\n    add sp, 1\n    pop bp\n    ret\n",
        );
        assert_eq!(result.registers.ax, 77);
    }

    #[test]
    fn alloc_and_free_syscalls() {
        let result = run(
            "main:\n    mov ax, 3\n    alloc\n    mov bx, ax\n    mov ax, 42\n    sir bx\n    lir bx\n    push ax\n    mov ax, bx\n    free\n    pop ax\n    ret\n",
        );
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.registers.ax, 42);
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let result = run("main:\n    mov ax, 1\n    mov bx, 0\n    div ax, bx\n    ret\n");
        assert!(!result.success);
        assert_eq!(result.reason, HaltReason::Error);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Runtime);
    }

    #[test]
    fn infinite_loop_hits_the_cycle_budget_exactly() {
        let program = link("main:\n    jmp main\n", 0);
        let mut machine = Machine::new();
        machine.cycle_limit = 100;
        machine.load(&program);
        let result = machine.run(id("main"));
        assert_eq!(result.reason, HaltReason::CycleLimit);
        assert_eq!(result.cycles, 100);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Budget);
    }

    #[test]
    fn double_free_halts_with_a_heap_error() {
        let result = run(
            "main:\n    mov ax, 2\n    alloc\n    mov bx, ax\n    free\n    mov ax, bx\n    free\n    ret\n",
        );
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Heap);
    }

    #[test]
    fn unresolved_call_reports_not_loaded() {
        let program = link("main:\n    call ghost\n    ret\n", 0);
        let mut machine = Machine::new();
        machine.load(&program);
        let result = machine.run(id("main"));
        assert!(!result.success);
        assert!(result.output.contains("not loaded"));
    }

    #[test]
    fn loader_mounts_the_missing_segment_and_resumes() {
        let main = link("main:\n    mov ax, 1\n    call lib_fn\n    ret\n", 0);
        let mut machine = Machine::new();
        machine.load(&main);
        let result = machine.run_with_loader(id("main"), |symbol| {
            assert_eq!(symbol.as_str(), "lib_fn");
            Some(link("lib_fn:\n    add ax, 41\n    ret\n", 1000))
        });
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.registers.ax, 42);
    }
}
