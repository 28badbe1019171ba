//! lutin-cli/src/main.rs
//!
//! Point d'entrée du binaire `lutin`.
//! Sans argument : REPL (une VM persistante, les globales survivent d'une
//! ligne à l'autre). Avec un chemin : exécute le script.
//!
//! Codes de sortie : 0 succès, 64 usage, 65 erreur de compilation,
//! 70 erreur d'exécution, 74 erreur d'E/S.

use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::Result;
use clap::Parser;
use rustyline::error::ReadlineError;

use lutin_vm::{InterpretError, Vm, VmOptions};

const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "lutin", version, about = "Interpréteur du langage Lutin")]
struct Cli {
    /// Script à exécuter ; sans argument, lance le REPL.
    script: Option<PathBuf>,

    /// Désassemble le script compilé avant de l'exécuter.
    #[arg(long)]
    disasm: bool,

    /// Trace chaque instruction exécutée (implique le niveau de log trace).
    #[arg(long)]
    trace: bool,

    /// Collecte les ordures à chaque allocation (débogage du GC).
    #[arg(long = "stress-gc")]
    stress_gc: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                print!("{e}");
                exit(0);
            }
            eprint!("{e}");
            exit(EX_USAGE);
        }
    };

    init_logging(cli.trace);

    let options = VmOptions::default()
        .with_trace(cli.trace)
        .with_stress_gc(cli.stress_gc)
        .with_disasm(cli.disasm);
    let mut vm = Vm::with_options(options);

    match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => {
            if let Err(e) = repl(&mut vm) {
                eprintln!("repl: {e}");
                exit(EX_IOERR);
            }
        }
    }
}

fn init_logging(trace: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if trace {
        builder.filter_level(log::LevelFilter::Trace);
    }
    builder.init();
}

fn run_file(vm: &mut Vm, path: &Path) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not open file \"{}\": {e}.", path.display());
            exit(EX_IOERR);
        }
    };
    match vm.interpret(&source) {
        Ok(()) => {}
        // Les diagnostics sont déjà sortis par la VM ; ne reste que le code.
        Err(InterpretError::Compile(_)) => exit(EX_DATAERR),
        Err(InterpretError::Runtime(_)) => exit(EX_SOFTWARE),
    }
}

fn repl(vm: &mut Vm) -> Result<()> {
    let mut rl = rustyline::DefaultEditor::new()?;
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                // Les erreurs sont rapportées par la VM ; le REPL continue.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
