//! the main compiler binary. takes a source file and an output format,
//! and prints the chosen intermediate representation: the token stream,
//! the ast, the control-flow graphs, the assembly, or the linked listing.
//!
//! run with `--help` for more info.

use littlec::common::CompilerContext;
use littlec::driver;
use littlec::front::lex;
use littlec::front::parse;

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// the output format
    #[arg(value_enum, short, long, default_value_t = Output::Asm)]
    out: Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the list of tokens
    Tokens,
    /// the ast data structure
    Ast,
    /// the control-flow graphs, one per function
    Cfg,
    /// the generated assembly
    Asm,
    /// the statically linked listing
    Linked,
}

fn report(errors: &[littlec::common::Diagnostic], warnings: &[littlec::common::Diagnostic]) -> bool {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    for error in errors {
        eprintln!("{error}");
    }
    !errors.is_empty()
}

fn main() {
    use Output::*;
    let args = Args::parse();

    let input = std::fs::read_to_string(&args.file).expect("file should be readable");

    let failed = match args.out {
        Tokens => {
            let (tokens, errors) = lex::tokenize(&input);
            for token in tokens {
                println!("{token}");
            }
            report(&errors, &[])
        }
        Ast => {
            let mut ctx = CompilerContext::new();
            let result = parse(&input, &mut ctx);
            println!("{:#?}", result.program);
            report(&result.errors, &result.warnings)
        }
        Cfg => {
            let compiled = driver::compile(&input);
            for cfg in &compiled.cfgs {
                println!("{cfg}");
            }
            report(&compiled.errors, &compiled.warnings)
        }
        Asm => {
            let compiled = driver::compile(&input);
            print!("{}", compiled.assembly());
            report(&compiled.errors, &compiled.warnings)
        }
        Linked => {
            let compiled = driver::compile(&input);
            let linked = driver::link_program(&compiled);
            print!("{}", linked.listing());
            report(&compiled.errors, &compiled.warnings) | report(&linked.errors, &[])
        }
    };

    if failed {
        std::process::exit(1);
    }
}
