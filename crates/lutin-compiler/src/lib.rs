//! lutin-compiler — Du texte source au bytecode, en une passe.
//!
//! ## Modules
//! - `scanner`  : flux de jetons zéro-copie sur le tampon source.
//! - `compiler` : parseur de Pratt + résolution de portées/upvalues +
//!   émission du bytecode pendant la descente (pas d'AST intermédiaire).
//!
//! Le point d'entrée est [`compile`] : il rend la fonction `<script>` prête
//! à être enveloppée dans une fermeture par la VM, ou la liste complète des
//! erreurs de compilation accumulées.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod compiler;
pub mod scanner;

pub use compiler::{compile, CompileError, CompileErrors};
pub use scanner::{Scanner, Token, TokenKind};
