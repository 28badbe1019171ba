//! natives.rs — Fonctions natives embarquées.
//!
//! `clock()` pour mesurer, plus trois natives de service : `has_field`,
//! `delete_field` et `err` (cette dernière exerce le canal d'erreur natif).
//! Une native signale l'échec en renvoyant un message ; la VM le convertit
//! en erreur d'exécution ordinaire.

use std::sync::OnceLock;
use std::time::Instant;

use lutin_core::heap::StrId;
use lutin_core::{Heap, Value};

use crate::vm::Vm;

static START: OnceLock<Instant> = OnceLock::new();

pub(crate) fn install(vm: &mut Vm) {
    // Référence temporelle posée à la création de la première VM.
    let _ = START.get_or_init(Instant::now);
    vm.define_native("clock", 0, clock);
    vm.define_native("has_field", 2, has_field);
    vm.define_native("delete_field", 2, delete_field);
    vm.define_native("err", 0, err);
}

/// Secondes écoulées depuis le démarrage du processus.
fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(START.get_or_init(Instant::now).elapsed().as_secs_f64()))
}

fn field_args(heap: &Heap, args: &[Value], native: &str) -> Result<(lutin_core::ObjRef, StrId), String> {
    let instance = heap
        .value_as_instance(args[0])
        .ok_or_else(|| format!("{native} expects an instance."))?;
    let name = heap
        .value_as_str(args[1])
        .ok_or_else(|| format!("{native} expects a string field name."))?;
    Ok((instance, heap.str_id(name)))
}

fn has_field(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let (instance, name) = field_args(heap, args, "has_field")?;
    Ok(Value::Bool(heap.instance(instance).fields.get(name).is_some()))
}

fn delete_field(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let (instance, name) = field_args(heap, args, "delete_field")?;
    heap.instance_mut(instance).fields.delete(name);
    Ok(Value::Nil)
}

/// Échoue toujours — couvre le chemin d'erreur des natives.
fn err(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    Err("Error!".to_string())
}
