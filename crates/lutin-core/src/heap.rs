//! heap.rs — Tas d'objets et ramasse-miettes.
//!
//! Le tas est une arène : chaque objet vit dans un slot et les références
//! inter-objets sont des poignées (`ObjRef`, indice 32 bits). Les slots
//! libérés sont recyclés via une liste libre.
//!
//! Le GC est un mark-and-sweep tricolore stop-the-world :
//!   1. marquage des racines (fournies par l'appelant + globales + "init"),
//!   2. traçage via une pile grise explicite (jamais de récursion),
//!   3. retrait des entrées non marquées de l'ensemble d'internement
//!      (références faibles),
//!   4. sweep des slots non marqués.
//!
//! Le tas ne déclenche jamais une collecte lui-même : la VM et le compilateur
//! consultent `should_collect()` avant chaque allocation et passent leurs
//! racines à `collect()`. Les bits de marquage vivent dans un vecteur
//! parallèle aux slots, ce qui laisse la phase de traçage lire les objets
//! pendant qu'elle marque.

use crate::bytecode::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Seuil de la première collecte.
const FIRST_GC: usize = 1024 * 1024;
/// Facteur de croissance du seuil après collecte.
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Poignée vers un objet du tas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Référence vers une chaîne internée, hash FNV-1a mis en cache.
/// L'égalité est l'identité de la poignée (l'internement la rend
/// structurelle).
#[derive(Debug, Clone, Copy)]
pub struct StrId {
    pub obj: ObjRef,
    pub hash: u32,
}

impl PartialEq for StrId {
    fn eq(&self, other: &Self) -> bool {
        self.obj == other.obj
    }
}
impl Eq for StrId {}

/// Fonction native : reçoit le tas et les arguments, renvoie une valeur ou
/// un message d'erreur que la VM convertit en erreur d'exécution.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, String>;

/// Chaîne immuable internée.
pub struct StrObj {
    pub chars: String,
    pub hash: u32,
}

/// Fonction compilée, immuable une fois construite.
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<StrId>,
}

impl FunctionObj {
    pub fn new(name: Option<StrId>) -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name }
    }
}

pub struct NativeObj {
    pub arity: u8,
    pub function: NativeFn,
}

/// La forme appelable du code utilisateur : fonction + captures.
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// État d'une capture : ouverte (slot de pile) puis fermée (valeur propre).
/// La transition Open → Closed a lieu exactement une fois.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct ClassObj {
    pub name: StrId,
    pub methods: Table,
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Les huit variantes d'objets — somme fermée, dispatch par `match`.
pub enum Obj {
    Str(StrObj),
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueState),
    Class(ClassObj),
    Instance(InstanceObj),
    Bound(BoundMethodObj),
}

/// Hash FNV-1a 32 bits.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in chars.as_bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Le tas. Possède tous les objets, l'ensemble d'internement (faible pour le
/// GC) et la table des globales — cette dernière vit ici pour que les
/// collectes déclenchées depuis le compilateur la voient comme racine.
pub struct Heap {
    slots: Vec<Option<Obj>>,
    marks: Vec<bool>,
    free: Vec<u32>,
    strings: Table,
    pub globals: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    pub init_string: StrId,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            globals: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            stress: false,
            init_string: StrId { obj: ObjRef(0), hash: 0 },
        };
        heap.init_string = heap.copy_string("init");
        heap
    }

    /// Collecter à chaque allocation (mode stress, pour les tests).
    pub fn set_stress(&mut self, on: bool) {
        self.stress = on;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // ---------- Allocation ----------

    /// Alloue un slot. Ne collecte jamais : l'appelant vérifie
    /// `should_collect()` *avant*, ses racines en main.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj_size(&obj);
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(obj);
                i as usize
            }
            None => {
                self.slots.push(Some(obj));
                self.marks.push(false);
                self.slots.len() - 1
            }
        };
        self.marks[index] = false;
        log::trace!("heap: alloc slot {index} ({} octets)", self.bytes_allocated);
        ObjRef(index as u32)
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    // ---------- Accès typés ----------
    // Une poignée de la mauvaise sorte est un bug de l'interpréteur, au même
    // titre qu'un transtypage invalide : on panique.

    pub fn obj(&self, r: ObjRef) -> &Obj {
        match self.slots[r.index()].as_ref() {
            Some(obj) => obj,
            None => panic!("poignée pendante: slot {} libéré", r.index()),
        }
    }

    pub fn obj_mut(&mut self, r: ObjRef) -> &mut Obj {
        match self.slots[r.index()].as_mut() {
            Some(obj) => obj,
            None => panic!("poignée pendante: slot {} libéré", r.index()),
        }
    }

    pub fn string(&self, r: ObjRef) -> &StrObj {
        match self.obj(r) {
            Obj::Str(s) => s,
            _ => panic!("la poignée n'est pas une chaîne"),
        }
    }

    pub fn str_chars(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    pub fn str_id(&self, r: ObjRef) -> StrId {
        StrId { obj: r, hash: self.string(r).hash }
    }

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match self.obj(r) {
            Obj::Function(f) => f,
            _ => panic!("la poignée n'est pas une fonction"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &NativeObj {
        match self.obj(r) {
            Obj::Native(n) => n,
            _ => panic!("la poignée n'est pas une native"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ClosureObj {
        match self.obj(r) {
            Obj::Closure(c) => c,
            _ => panic!("la poignée n'est pas une fermeture"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ClosureObj {
        match self.obj_mut(r) {
            Obj::Closure(c) => c,
            _ => panic!("la poignée n'est pas une fermeture"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &UpvalueState {
        match self.obj(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("la poignée n'est pas une upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueState {
        match self.obj_mut(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("la poignée n'est pas une upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match self.obj(r) {
            Obj::Class(c) => c,
            _ => panic!("la poignée n'est pas une classe"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match self.obj_mut(r) {
            Obj::Class(c) => c,
            _ => panic!("la poignée n'est pas une classe"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match self.obj(r) {
            Obj::Instance(i) => i,
            _ => panic!("la poignée n'est pas une instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match self.obj_mut(r) {
            Obj::Instance(i) => i,
            _ => panic!("la poignée n'est pas une instance"),
        }
    }

    pub fn bound(&self, r: ObjRef) -> &BoundMethodObj {
        match self.obj(r) {
            Obj::Bound(b) => b,
            _ => panic!("la poignée n'est pas une méthode liée"),
        }
    }

    /// La référence chaîne sous une valeur, si c'en est une.
    pub fn value_as_str(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.obj(r), Obj::Str(_)) => Some(r),
            _ => None,
        }
    }

    /// La référence instance sous une valeur, si c'en est une.
    pub fn value_as_instance(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.obj(r), Obj::Instance(_)) => Some(r),
            _ => None,
        }
    }

    // ---------- Internement ----------

    /// Recherche une chaîne internée par contenu (longueur + hash + octets).
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<StrId> {
        self.strings.find_string_key(hash, |k| self.string(k.obj).chars == chars)
    }

    /// Interne en copiant ; n'alloue que sur défaut.
    pub fn copy_string(&mut self, chars: &str) -> StrId {
        let hash = hash_string(chars);
        if let Some(id) = self.find_string(chars, hash) {
            return id;
        }
        self.alloc_string(chars.to_string(), hash)
    }

    /// Interne en prenant possession du tampon ; il est relâché sur hit.
    pub fn take_string(&mut self, chars: String) -> StrId {
        let hash = hash_string(&chars);
        if let Some(id) = self.find_string(&chars, hash) {
            return id;
        }
        self.alloc_string(chars, hash)
    }

    fn alloc_string(&mut self, chars: String, hash: u32) -> StrId {
        let obj = self.alloc(Obj::Str(StrObj { chars, hash }));
        let id = StrId { obj, hash };
        self.strings.set(id, Value::Nil);
        id
    }

    // ---------- Collecte ----------

    /// Mark-and-sweep complet. `extra_roots` : pile de la VM, fermetures des
    /// frames, upvalues ouvertes — ou constantes des fonctions en cours de
    /// compilation. Les globales, l'ensemble d'internement (faible) et
    /// `"init"` sont gérés ici.
    pub fn collect(&mut self, extra_roots: &[Value]) {
        let before = self.bytes_allocated;
        log::debug!("gc: begin ({before} octets)");

        {
            let Heap { slots, marks, strings: _, globals, gray, init_string, .. } = self;
            for &v in extra_roots {
                mark_value(marks, gray, v);
            }
            for (k, v) in globals.iter() {
                mark_object(marks, gray, k.obj);
                mark_value(marks, gray, v);
            }
            mark_object(marks, gray, init_string.obj);

            while let Some(r) = gray.pop() {
                blacken(slots, marks, gray, r);
            }
        }

        // Références faibles : un interné non marqué va être balayé.
        self.strings.remove_unmarked(&self.marks);

        for i in 0..self.slots.len() {
            if self.slots[i].is_none() {
                continue;
            }
            if self.marks[i] {
                self.marks[i] = false;
            } else if let Some(obj) = self.slots[i].take() {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(obj_size(&obj));
                self.free.push(i as u32);
                log::trace!("gc: libère slot {i}");
            }
        }

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        log::debug!(
            "gc: end ({} octets, {} libérés, prochain seuil {})",
            self.bytes_allocated,
            before - self.bytes_allocated,
            self.next_gc
        );
    }

    /// Vrai si le slot référencé est encore vivant (tests du GC).
    pub fn is_live(&self, r: ObjRef) -> bool {
        self.slots.get(r.index()).is_some_and(|s| s.is_some())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Taille comptabilisée d'un objet. Seules les charges immuables entrent
/// dans le compte (le contenu d'une chaîne, le code d'une fonction) pour
/// que l'ajout à l'allocation et le retrait au sweep restent symétriques.
fn obj_size(obj: &Obj) -> usize {
    let base = std::mem::size_of::<Obj>();
    base + match obj {
        Obj::Str(s) => s.chars.len(),
        Obj::Function(f) => f.chunk.byte_size(),
        _ => 0,
    }
}

fn mark_value(marks: &mut [bool], gray: &mut Vec<ObjRef>, v: Value) {
    if let Value::Obj(r) = v {
        mark_object(marks, gray, r);
    }
}

fn mark_object(marks: &mut [bool], gray: &mut Vec<ObjRef>, r: ObjRef) {
    let i = r.index();
    if !marks[i] {
        marks[i] = true;
        gray.push(r);
    }
}

/// Noircit un objet gris : marque ses références sortantes.
fn blacken(slots: &[Option<Obj>], marks: &mut [bool], gray: &mut Vec<ObjRef>, r: ObjRef) {
    let Some(obj) = slots[r.index()].as_ref() else {
        return;
    };
    match obj {
        Obj::Str(_) | Obj::Native(_) => {}
        Obj::Upvalue(u) => {
            if let UpvalueState::Closed(v) = *u {
                mark_value(marks, gray, v);
            }
        }
        Obj::Function(f) => {
            if let Some(name) = f.name {
                mark_object(marks, gray, name.obj);
            }
            for &c in &f.chunk.constants {
                mark_value(marks, gray, c);
            }
        }
        Obj::Closure(c) => {
            mark_object(marks, gray, c.function);
            for &u in &c.upvalues {
                mark_object(marks, gray, u);
            }
        }
        Obj::Class(c) => {
            mark_object(marks, gray, c.name.obj);
            for (k, v) in c.methods.iter() {
                mark_object(marks, gray, k.obj);
                mark_value(marks, gray, v);
            }
        }
        Obj::Instance(i) => {
            mark_object(marks, gray, i.class);
            for (k, v) in i.fields.iter() {
                mark_object(marks, gray, k.obj);
                mark_value(marks, gray, v);
            }
        }
        Obj::Bound(b) => {
            mark_value(marks, gray, b.receiver);
            mark_object(marks, gray, b.method);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_gives_identity() {
        let mut heap = Heap::new();
        let a = heap.copy_string("hello");
        let b = heap.copy_string("hello");
        assert_eq!(a.obj, b.obj);
        let c = heap.take_string(String::from("hello"));
        assert_eq!(a.obj, c.obj);
        assert_eq!(heap.find_string("hello", hash_string("hello")), Some(a));
    }

    #[test]
    fn collect_sweeps_unreachable_and_prunes_interned() {
        let mut heap = Heap::new();
        let kept = heap.copy_string("kept");
        let dead = heap.copy_string("dead");
        let roots = [Value::Obj(kept.obj)];
        heap.collect(&roots);
        assert!(heap.is_live(kept.obj));
        assert!(!heap.is_live(dead.obj));
        // L'entrée faible a été retirée : ré-interner ré-alloue.
        assert_eq!(heap.find_string("dead", hash_string("dead")), None);
        let again = heap.copy_string("dead");
        assert!(heap.is_live(again.obj));
    }

    #[test]
    fn stress_mode_requests_collection() {
        let mut heap = Heap::new();
        assert!(!heap.should_collect());
        heap.set_stress(true);
        assert!(heap.should_collect());
    }

    #[test]
    fn slots_are_recycled() {
        let mut heap = Heap::new();
        let dead = heap.copy_string("ephemeral");
        let index = dead.obj;
        heap.collect(&[]);
        assert!(!heap.is_live(index));
        let reborn = heap.copy_string("reborn");
        assert_eq!(reborn.obj, index);
    }
}
