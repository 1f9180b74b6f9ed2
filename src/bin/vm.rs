//! run a source file end to end: parse, compile, link, execute on the
//! virtual machine, and print the result.
//!
//! exits with status 1 on any error, including runtime errors and a blown
//! cycle budget.

use littlec::driver;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the source file to run
    file: String,
    /// abort after this many executed instructions
    #[arg(long)]
    cycle_limit: Option<u64>,
}

fn main() {
    let args = Args::parse();

    let input = std::fs::read_to_string(&args.file).expect("file should be readable");

    match driver::run_source(&input, args.cycle_limit) {
        Ok(result) => {
            println!("{}", result.output);
            println!("halted: {}", result.reason);
            println!("registers: {}", result.registers);
            println!("cycles: {}", result.cycles);
            if !result.success {
                std::process::exit(1);
            }
        }
        Err(errors) => {
            for error in errors {
                eprintln!("{error}");
            }
            std::process::exit(1);
        }
    }
}
