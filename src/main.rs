use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};

use arx::codegen::CodeGenerator;
use arx::error::Error;
use arx::linker::Linker;
use arx::module::Module;
use arx::parser::Parser;
use arx::typechecker;
use arx::verbosity::{self, Verbosity};
use arx::vm::{StdoutOutput, VM};

#[derive(ClapParser)]
#[command(name = "arx", about = "Compile and run the arx teaching language")]
struct Cli {
    /// Repeat for more detail: -v info, -vv debug, -vvv trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a .arx source file into a linked .mod module.
    Compile {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a compiled .mod module.
    Run { input: PathBuf },
    /// Print a compiled module's header, TOC, and section summary.
    Dump { input: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    verbosity::install_tracing();
    let verbosity = Verbosity(cli.verbose);

    match cli.command {
        Command::Compile { input, output } => match compile(&input, output.as_deref(), verbosity) {
            Ok(()) => ExitCode::from(0),
            Err(Error::Lex(e)) => fail(1, &e),
            Err(Error::Parse(e)) => fail(1, &e),
            Err(Error::Type(e)) => fail(1, &e),
            Err(Error::Codegen(e)) => fail(2, &e),
            Err(Error::Link(e)) => fail(3, &e),
            Err(e) => fail(1, &e),
        },
        Command::Run { input } => match run(&input, verbosity) {
            Ok(()) => ExitCode::from(0),
            Err(Error::Module(e)) => fail(1, &e),
            Err(Error::Trap(e)) => fail(4, &e),
            Err(e) => fail(1, &e),
        },
        Command::Dump { input } => match dump(&input) {
            Ok(()) => ExitCode::from(0),
            Err(e) => fail(1, &e),
        },
    }
}

fn fail(code: u8, e: &dyn std::fmt::Display) -> ExitCode {
    eprintln!("arx: {e}");
    ExitCode::from(code)
}

fn compile(input: &std::path::Path, output: Option<&std::path::Path>, verbosity: Verbosity) -> Result<(), Error> {
    let source = fs::read_to_string(input).map_err(|e| Error::Io(e.to_string()))?;
    let program = Parser::parse(&source, verbosity)?;
    let table = typechecker::check_program(&program)?;
    let out = CodeGenerator::new(verbosity).generate(&program, &table)?;
    let linked = Linker::new(verbosity).link(out)?;
    let module = Module::from_linked(linked, program.module_name.clone());
    let bytes = module.to_bytes()?;

    let output_path = output.map(PathBuf::from).unwrap_or_else(|| input.with_extension("mod"));
    let tmp_path = output_path.with_extension("mod.tmp");
    fs::write(&tmp_path, &bytes).map_err(|e| Error::Io(e.to_string()))?;
    fs::rename(&tmp_path, &output_path).map_err(|e| Error::Io(e.to_string()))?;
    Ok(())
}

fn run(input: &std::path::Path, verbosity: Verbosity) -> Result<(), Error> {
    let bytes = fs::read(input).map_err(|e| Error::Io(e.to_string()))?;
    let module = Module::from_bytes(&bytes)?;
    let mut out = StdoutOutput;
    VM::run(&module, &mut out, verbosity)?;
    Ok(())
}

fn dump(input: &std::path::Path) -> Result<(), Error> {
    let bytes = fs::read(input).map_err(|e| Error::Io(e.to_string()))?;
    let module = Module::from_bytes(&bytes)?;
    println!("app: {}", module.app_name);
    println!("entry_point: {}", module.entry_point);
    println!("code: {} instructions", module.code.len());
    println!("strings: {} entries", module.strings.len());
    println!("debug: {} line records", module.debug.len());
    println!("classes:");
    for class in &module.classes {
        println!(
            "  {} (id {}, {} bytes, {} fields, {} methods)",
            class.entry.name,
            class.entry.class_id,
            class.entry.instance_size,
            class.fields.len(),
            class.methods.len()
        );
        for m in &class.methods {
            println!("    {}(#{}) @ {}", m.name, m.param_count, m.offset);
        }
    }
    Ok(())
}
