//! Command-line front end: assemble textual listings and check JIT parameters.

use bumpalo::Bump;
use clap::{Parser, Subcommand};
use std::fs;
use std::process;
use tracejit::codewriter::{parse_assembler, Assembler};
use tracejit::core::{CompilationSession, JitConfig};

#[derive(Parser)]
#[command(name = "tracejit", about = "Trace JIT codewriter tools")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a textual SSA listing and print the resulting jitcode
    Assemble {
        /// Listing file
        file: String,

        /// Also print the decoded instructions
        #[arg(long)]
        decode: bool,

        /// Print assembly statistics
        #[arg(long)]
        stats: bool,
    },

    /// Parse a JIT parameter string such as `threshold=200,inlining=1`
    Params {
        text: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Command::Assemble { file, decode, stats } => assemble(&file, decode, stats),
        Command::Params { text } => params(&text),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn assemble(file: &str, decode: bool, stats: bool) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(file)?;
    let ssarepr = parse_assembler(file, &text)?;

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut assembler = Assembler::new(&session);
    let jitcode = assembler.assemble(&ssarepr)?;
    print!("{}", jitcode);

    if decode {
        for insn in jitcode.decode(assembler.insns())? {
            println!("  {:4}: {} {:?}", insn.offset, insn.opname, insn.args);
        }
    }
    if stats {
        println!("{}", session.stats());
    }
    Ok(())
}

fn params(text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = JitConfig::default();
    config.set_user_param(text)?;
    println!("{}", config);
    println!("increment per call: {}", config.increment_threshold());
    Ok(())
}
