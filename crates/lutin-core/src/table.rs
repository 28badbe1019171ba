//! table.rs — Table de hachage à adressage ouvert.
//!
//! Clés : chaînes internées (`StrId`), comparées par identité — le hash FNV
//! est mis en cache dans la clé, la table ne touche donc jamais au tas.
//! Sondage linéaire depuis `hash % capacité`. Les suppressions laissent une
//! pierre tombale (`key = None, value = true`) pour ne pas casser les
//! chaînes de sondage ; le re-hachage ne recopie pas les tombales.

use crate::heap::StrId;
use crate::value::Value;

/// Facteur de charge maximal : 3/4.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<StrId>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, value: Value::Nil };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::Bool(true)
    }
}

/// Table `StrId → Value`.
#[derive(Default)]
pub struct Table {
    /// Entrées occupées + tombales.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self { count: 0, entries: Vec::new() }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Indice de l'entrée pour `key` : soit l'entrée occupée par `key`, soit
    /// la première tombale rencontrée (réutilisable), soit la première case
    /// vide. La table n'est jamais pleine (facteur de charge < 1).
    fn find_entry(entries: &[Entry], key: StrId) -> usize {
        let capacity = entries.len();
        let mut index = key.hash as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&self.entries, key);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }

    pub fn get(&self, key: StrId) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insère ou remplace. Renvoie `true` si la clé était absente.
    pub fn set(&mut self, key: StrId, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.capacity() * MAX_LOAD_NUM {
            let capacity = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // Une tombale réutilisée est déjà comptée dans `count`.
        if is_new && entry.value == Value::Nil {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), value };
        is_new
    }

    /// Supprime la clé en laissant une tombale. Renvoie `true` si présente.
    pub fn delete(&mut self, key: StrId) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry { key: None, value: Value::Bool(true) };
        true
    }

    /// Itère sur les entrées vivantes.
    pub fn iter(&self) -> impl Iterator<Item = (StrId, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Recherche d'internement : sonde avec `hash` et départage via `eq`
    /// (comparaison de contenu fournie par l'appelant).
    pub fn find_string_key(&self, hash: u32, mut eq: impl FnMut(StrId) -> bool) -> Option<StrId> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(k) => {
                    if k.hash == hash && eq(k) {
                        return Some(k);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Retire les entrées dont la clé n'est pas marquée (références faibles
    /// de l'ensemble d'internement, phase pré-sweep du GC).
    pub fn remove_unmarked(&mut self, marks: &[bool]) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !marks[key.obj.index()] {
                    *entry = Entry { key: None, value: Value::Bool(true) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn key(heap: &mut Heap, s: &str) -> StrId {
        heap.copy_string(s)
    }

    #[test]
    fn set_get_replace() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let a = key(&mut heap, "a");
        assert!(table.set(a, Value::Number(1.0)));
        assert!(!table.set(a, Value::Number(2.0)));
        assert_eq!(table.get(a), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_leaves_reusable_tombstone() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let a = key(&mut heap, "a");
        let b = key(&mut heap, "b");
        table.set(a, Value::Nil);
        table.set(b, Value::Bool(true));
        assert!(table.delete(a));
        assert!(!table.delete(a));
        assert_eq!(table.get(a), None);
        // b reste accessible malgré la tombale sur son chemin éventuel.
        assert_eq!(table.get(b), Some(Value::Bool(true)));
        // Réinsertion : la tombale est réutilisée sans regonfler `count`.
        assert!(table.set(a, Value::Number(3.0)));
        assert_eq!(table.get(a), Some(Value::Number(3.0)));
    }

    #[test]
    fn growth_preserves_entries() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let keys: Vec<StrId> = (0..64).map(|i| key(&mut heap, &format!("k{i}"))).collect();
        for (i, &k) in keys.iter().enumerate() {
            table.set(k, Value::Number(i as f64));
        }
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(table.get(k), Some(Value::Number(i as f64)));
        }
    }
}
