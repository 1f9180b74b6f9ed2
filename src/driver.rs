//! Pipeline orchestration.
//!
//! The binaries and the tests all drive the same chain:
//! `source -> tokens -> ast -> annotated ast -> cfgs -> assembly ->
//! linked listing -> vm run`.  This module owns the result records and
//! the dynamic-link catalog; the stages themselves live in `front`,
//! `middle`, `back`, and `vm`.

use crate::back::asm;
use crate::back::codegen;
use crate::back::link::{link, LinkedProgram, SEGMENT_SIZE};
use crate::common::{id, CompilerContext, Diagnostic, Id, Map};
use crate::front::ast::FunctionSig;
use crate::front::{annotate_program, parse};
use crate::middle::cfg::{build_cfg, Cfg};
use crate::vm::machine::{Machine, RunResult};

/// Assembly text of one function, kept separate so each function's code
/// can be inspected on its own.
#[derive(Debug, Clone)]
pub struct FunctionAssembly {
    pub name: Id,
    pub text: String,
}

/// Everything compilation produces, errors included.
#[derive(Debug)]
pub struct CompileResult {
    pub success: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub cfgs: Vec<Cfg>,
    pub assembly_per_function: Vec<FunctionAssembly>,
}

impl CompileResult {
    /// The whole program's assembly, functions concatenated in source
    /// order.
    pub fn assembly(&self) -> String {
        let mut text = String::new();
        for function in &self.assembly_per_function {
            text.push_str(&function.text);
            text.push('\n');
        }
        text
    }
}

/// Compile a source string through parse, annotate, CFG construction, and
/// code generation.
pub fn compile(source: &str) -> CompileResult {
    let mut ctx = CompilerContext::new();
    compile_with_context(source, &mut ctx)
}

/// Like [compile], with a caller-provided context (the dynamic runner
/// pre-registers library signatures this way).
pub fn compile_with_context(source: &str, ctx: &mut CompilerContext) -> CompileResult {
    let parsed = parse(source, ctx);
    let mut errors = parsed.errors;
    let warnings = parsed.warnings;

    let program = annotate_program(parsed.program, ctx);

    let mut cfgs = Vec::new();
    let mut assembly_per_function = Vec::new();
    for function in &program.functions {
        let (cfg, cfg_errors) = build_cfg(function);
        errors.extend(cfg_errors);
        let (lines, gen_errors) = codegen::generate(function, &cfg, ctx);
        errors.extend(gen_errors);
        assembly_per_function.push(FunctionAssembly {
            name: function.name,
            text: asm::render(&lines),
        });
        cfgs.push(cfg);
    }

    CompileResult {
        success: errors.is_empty(),
        errors,
        warnings,
        cfgs,
        assembly_per_function,
    }
}

/// Statically link a compiled program into one listing at base address 0.
pub fn link_program(compiled: &CompileResult) -> LinkedProgram {
    link(&compiled.assembly(), 0)
}

/// Compile, link, and execute; errors from any stage short-circuit.
pub fn run_source(source: &str, cycle_limit: Option<u64>) -> Result<RunResult, Vec<Diagnostic>> {
    let compiled = compile(source);
    if !compiled.success {
        return Err(compiled.errors);
    }
    let linked = link_program(&compiled);
    if !linked.errors.is_empty() {
        return Err(linked.errors);
    }
    let mut machine = Machine::new();
    if let Some(limit) = cycle_limit {
        machine.cycle_limit = limit;
    }
    machine.load(&linked);
    Ok(machine.run(id("main")))
}

/// One loaded library's linking record: which segment it landed in, its
/// listing, and its label addresses.
#[derive(Debug, Clone)]
pub struct LibraryEntry {
    pub segment: i64,
    pub lines: Vec<String>,
    pub labels: Map<Id, i64>,
}

struct LibraryUnit {
    name: String,
    assembly: String,
    functions: Vec<Id>,
    loaded: bool,
}

/// The dynamic-link catalog.
///
/// Library files are eagerly compiled at scan time, which both validates
/// them and reveals each one's exported functions; the actual segment
/// assignment happens lazily, the first time the VM calls into a file.
/// Segment 0 belongs to the main translation unit, libraries take
/// 1, 2, ... in load order.
pub struct DynamicLinker {
    units: Vec<LibraryUnit>,
    exports: Map<Id, usize>,
    signatures: Vec<FunctionSig>,
    next_segment: i64,
    /// function name -> linking record, filled as segments load
    pub lib_map: Map<Id, LibraryEntry>,
}

impl DynamicLinker {
    /// Scan a set of `(name, source)` library files.  Returns the catalog
    /// or every compile error found.
    pub fn scan(libraries: &[(String, String)]) -> Result<Self, Vec<Diagnostic>> {
        // First pass: parse everything once just to collect signatures,
        // so libraries may call into each other (and into main) without
        // declaration order mattering.
        let mut per_unit: Vec<Vec<FunctionSig>> = Vec::new();
        for (_, source) in libraries {
            let mut probe = CompilerContext::new();
            let _ = parse(source, &mut probe);
            per_unit.push(
                probe
                    .functions
                    .into_values()
                    .filter(|sig| !sig.builtin)
                    .collect(),
            );
        }

        // Second pass: the real compile.  A unit sees every signature but
        // its own (its own declarations land naturally while parsing).
        let mut units = Vec::new();
        let mut exports = Map::new();
        let mut errors = Vec::new();
        for (index, (name, source)) in libraries.iter().enumerate() {
            let mut ctx = CompilerContext::new();
            for (other, sigs) in per_unit.iter().enumerate() {
                if other == index {
                    continue;
                }
                for sig in sigs {
                    ctx.functions.insert(sig.name, sig.clone());
                }
            }
            let compiled = compile_with_context(source, &mut ctx);
            if !compiled.success {
                errors.extend(compiled.errors);
                continue;
            }
            let functions: Vec<Id> = compiled
                .assembly_per_function
                .iter()
                .map(|f| f.name)
                .collect();
            for function in &functions {
                exports.insert(*function, units.len());
            }
            units.push(LibraryUnit {
                name: name.clone(),
                assembly: compiled.assembly(),
                functions,
                loaded: false,
            });
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(DynamicLinker {
            units,
            exports,
            signatures: per_unit.into_iter().flatten().collect(),
            next_segment: 1,
            lib_map: Map::new(),
        })
    }

    /// Signatures of every exported library function, for pre-registering
    /// into the main unit's compile context.
    pub fn signatures(&self) -> &[FunctionSig] {
        &self.signatures
    }

    /// Resolve a symbol the VM could not call: link the library that
    /// exports it into the next free segment.  Returns `None` for unknown
    /// symbols and for symbols whose unit is already loaded (both are
    /// fatal to the caller).
    pub fn resolve(&mut self, symbol: Id) -> Option<LinkedProgram> {
        let index = *self.exports.get(&symbol)?;
        let unit = &mut self.units[index];
        if unit.loaded {
            return None;
        }
        let segment = self.next_segment;
        self.next_segment += 1;
        let program = link(&unit.assembly, segment * SEGMENT_SIZE);
        unit.loaded = true;
        for function in &unit.functions {
            self.lib_map.insert(
                *function,
                LibraryEntry {
                    segment,
                    lines: program.lines.clone(),
                    labels: program.labels.clone(),
                },
            );
        }
        Some(program)
    }

    /// Names of the scanned library files, load state included.
    pub fn units(&self) -> impl Iterator<Item = (&str, bool)> {
        self.units.iter().map(|u| (u.name.as_str(), u.loaded))
    }
}

/// Compile the main unit against a library directory's exports, then run
/// with on-demand segment loading.
pub fn run_dynamic(
    source: &str,
    libraries: &[(String, String)],
    cycle_limit: Option<u64>,
) -> Result<(RunResult, DynamicLinker), Vec<Diagnostic>> {
    let mut linker = DynamicLinker::scan(libraries)?;

    let mut ctx = CompilerContext::new();
    for sig in linker.signatures() {
        ctx.functions.insert(sig.name, sig.clone());
    }
    let compiled = compile_with_context(source, &mut ctx);
    if !compiled.success {
        return Err(compiled.errors);
    }
    let linked = link_program(&compiled);
    if !linked.errors.is_empty() {
        return Err(linked.errors);
    }

    let mut machine = Machine::new();
    if let Some(limit) = cycle_limit {
        machine.cycle_limit = limit;
    }
    machine.load(&linked);
    let result = machine.run_with_loader(id("main"), |symbol| linker.resolve(symbol));
    Ok((result, linker))
}
