//! lutin-core — Cœur du langage Lutin
//!
//! Contient tout ce qu'il faut pour représenter et manipuler l'état d'un
//! programme Lutin, sans dépendre du compilateur ni de la boucle
//! d'interprétation.
//!
//! ## Modules
//! - `value`    : valeurs dynamiques (`nil`, bool, nombre, objet).
//! - `heap`     : arène d'objets, internement des chaînes, GC mark-and-sweep.
//! - `table`    : table de hachage à adressage ouvert (clés = chaînes internées).
//! - `bytecode` : opcodes `Op`, format `Chunk`, désassembleur lisible.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod bytecode;
pub mod heap;
pub mod table;
pub mod value;

// ---------- Reexports de confort ----------
pub use bytecode::{chunk::Chunk, op::Op};
pub use heap::{Heap, Obj, ObjRef, StrId};
pub use table::Table;
pub use value::Value;

/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
