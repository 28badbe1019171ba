//! lutin-vm — Machine virtuelle à pile du langage Lutin.
//!
//! Expose :
//! - le type [`Vm`] et sa configuration par [`VmOptions`],
//! - le trait [`Host`] pour injecter les sorties (stdout/stderr par défaut,
//!   un tampon de capture dans les tests),
//! - les erreurs [`VmError`] / [`InterpretError`] — trois issues possibles
//!   d'un `interpret()` : succès, erreur de compilation, erreur d'exécution.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod natives;
pub mod vm;

use thiserror::Error;

pub use lutin_compiler::{CompileError, CompileErrors};
pub use vm::{Vm, FRAMES_MAX, STACK_MAX};

/// Erreur levée pendant l'exécution du bytecode.
#[derive(Debug, Error)]
pub enum VmError {
    /// Erreur d'exécution du programme utilisateur (message déjà rapporté
    /// au [`Host`], avec la pile d'appels).
    #[error("{0}")]
    Runtime(String),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("no active call frame")]
    NoCallFrame,
    /// Flux de code malformé — un bug du compilateur, pas du programme.
    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),
}

/// Issue d'un `interpret()` qui n'a pas réussi.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("{0}")]
    Compile(#[from] CompileErrors),
    #[error("{0}")]
    Runtime(#[from] VmError),
}

/// Environnement hôte : où vont les sorties du programme et les
/// diagnostics. Une ligne par appel, sans saut de ligne final.
pub trait Host {
    /// Sortie du programme (`print`).
    fn print(&mut self, line: &str);
    /// Diagnostics : erreurs d'exécution, traces de pile, erreurs de
    /// compilation.
    fn error(&mut self, line: &str);
}

/// Hôte par défaut : stdout / stderr.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, line: &str) {
        println!("{line}");
    }

    fn error(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

/// Options de construction de la VM.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Trace chaque instruction exécutée (via `log::trace!`).
    pub trace: bool,
    /// Collecte à chaque allocation (débusque les racines manquantes).
    pub stress_gc: bool,
    /// Désassemble la fonction `<script>` avant de l'exécuter.
    pub disasm: bool,
}

impl VmOptions {
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    pub fn with_stress_gc(mut self, on: bool) -> Self {
        self.stress_gc = on;
        self
    }

    pub fn with_disasm(mut self, on: bool) -> Self {
        self.disasm = on;
        self
    }
}
