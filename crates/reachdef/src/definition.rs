use crate::{atom::Atom, code_location::CodeLocation, data::DataSet, keyed_region::KeyedRegion};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{fmt, rc::Rc};

/// A write of `data` to `atom` at `codeloc`. Immutable once constructed;
/// shared between states through `Rc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Definition {
    pub atom: Atom,
    pub codeloc: CodeLocation,
    pub data: DataSet,
}

impl Definition {
    pub fn new(atom: Atom, codeloc: CodeLocation, data: DataSet) -> Self {
        if let Atom::Register(reg) = &atom {
            debug_assert_eq!(data.bits(), reg.bits());
        }
        if let Atom::Memory(mem) = &atom {
            debug_assert_eq!(data.bits(), mem.bits());
        }

        Self {
            atom,
            codeloc,
            data,
        }
    }

    /// Offset of the defined storage in its keyed region.
    ///
    /// # Panics
    /// Panics for temporary and parameter atoms, which live outside the
    /// keyed regions.
    pub fn offset(&self) -> u64 {
        match &self.atom {
            Atom::Register(reg) => reg.offset,
            Atom::Memory(mem) => mem.addr,
            other => panic!("definition of {other} has no region offset"),
        }
    }

    /// Size of the defined storage, in bytes.
    ///
    /// # Panics
    /// Panics for temporary and parameter atoms.
    pub fn size(&self) -> u64 {
        match &self.atom {
            Atom::Register(reg) => reg.size,
            Atom::Memory(mem) => mem.size,
            other => panic!("definition of {other} has no size"),
        }
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Definition {{Atom: {}, Codeloc: {}, Data: {}}}",
            self.atom, self.codeloc, self.data
        )
    }
}

/// Bookkeeping of which code locations consumed which definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uses {
    uses_by_definition: FxHashMap<Rc<Definition>, FxHashSet<CodeLocation>>,
    /// Definitions with a recent consumer, indexed by their storage offset.
    /// Queried on kill to find definitions that die without ever being read.
    current_uses: KeyedRegion,
}

impl Uses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `codeloc` consumed `definition`.
    pub fn add_use(&mut self, definition: &Rc<Definition>, codeloc: CodeLocation) {
        self.uses_by_definition
            .entry(definition.clone())
            .or_default()
            .insert(codeloc);
        self.current_uses
            .set_object(definition.offset(), definition.clone(), definition.size());
    }

    /// All locations that consumed `definition`.
    pub fn get_uses(&self, definition: &Definition) -> FxHashSet<CodeLocation> {
        self.uses_by_definition
            .get(definition)
            .cloned()
            .unwrap_or_default()
    }

    /// Recently consumed definitions overlapping `definition`'s extent.
    // TODO: one range scan instead of a per-byte probe
    pub fn get_current_uses(&self, definition: &Definition) -> FxHashSet<Rc<Definition>> {
        let offset = definition.offset();

        let mut all = FxHashSet::default();
        for pos in 0..definition.size() {
            all.extend(self.current_uses.get_objects_by_offset(offset + pos));
        }
        all
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn merge(&mut self, other: &Uses) {
        for (definition, locs) in &other.uses_by_definition {
            self.uses_by_definition
                .entry(definition.clone())
                .or_default()
                .extend(locs.iter().copied());
        }
        self.current_uses.merge(&other.current_uses);
    }
}
