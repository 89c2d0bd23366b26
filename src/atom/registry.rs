//! Table atoms, created once per name at registration time.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use parking_lot::RwLock;

use super::Atom;
use crate::error::StoreError;

/// A named atom standing for a database table.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Table {
    atom: Atom,
}

impl Table {
    pub fn name(&self) -> &str {
        // Tables are only built from named atoms.
        self.atom.name().unwrap_or_default()
    }

    pub fn atom(&self) -> &Atom {
        &self.atom
    }
}

impl Deref for Table {
    type Target = Atom;

    fn deref(&self) -> &Atom {
        &self.atom
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({})", self.name())
    }
}

/// Registry of named atoms.
///
/// A name maps to exactly one atom for the registry's lifetime, so every reader,
/// writer and remote peer referring to a table by name talks to the same
/// subscriber set.
#[derive(Default)]
pub struct AtomRegistry {
    atoms: RwLock<HashMap<String, Atom>>,
}

impl AtomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table. Registering an existing name returns the existing table.
    pub fn register(&self, name: &str) -> Table {
        Table {
            atom: self.atom(name),
        }
    }

    /// Look up a registered table.
    pub fn table(&self, name: &str) -> Result<Table, StoreError> {
        self.atoms
            .read()
            .get(name)
            .cloned()
            .map(|atom| Table { atom })
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    /// The atom for `name`, created on first use.
    ///
    /// Used for names learned from remote peers, which may refer to tables this
    /// process never registered.
    pub fn atom(&self, name: &str) -> Atom {
        if let Some(atom) = self.atoms.read().get(name) {
            return atom.clone();
        }
        self.atoms
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Atom::named(name))
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.atoms.read().keys().cloned().collect();
        names.sort();
        names
    }
}
