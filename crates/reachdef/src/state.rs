use crate::{
    atom::{Atom, MemoryLocation, Parameter, Register},
    code_location::CodeLocation,
    data::{DataSet, SpOffset, Value},
    definition::{Definition, Uses},
    keyed_region::KeyedRegion,
    loader::Loader,
};
use arch::{Arch, CallingConvention, CcArg};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{fmt, rc::Rc, sync::Arc};
use tracing::{error, warn};

/// A temporary's definition. Unlike register and memory definitions, the
/// evaluated data is stored inline so that snapshots can report per-tmp
/// values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TmpDef {
    pub atom: Atom,
    pub codeloc: CodeLocation,
    pub data: DataSet,
}

/// The abstract state at one program point: which definitions of registers,
/// memory cells and temporaries may reach it, and who consumed them.
#[derive(Debug, Clone)]
pub struct ReachingDefinitions {
    arch: Arc<Arch>,
    track_tmps: bool,

    pub register_definitions: KeyedRegion,
    pub memory_definitions: KeyedRegion,
    pub tmp_definitions: FxHashMap<u32, TmpDef>,

    pub register_uses: Uses,
    pub memory_uses: Uses,
    pub tmp_uses: FxHashMap<u32, FxHashSet<(CodeLocation, TmpDef)>>,

    /// Definitions that were overwritten before anything consumed them.
    dead_virgin_definitions: FxHashSet<Rc<Definition>>,
}

impl ReachingDefinitions {
    pub fn new(arch: Arc<Arch>, track_tmps: bool) -> Self {
        Self {
            arch,
            track_tmps,
            register_definitions: KeyedRegion::new(),
            memory_definitions: KeyedRegion::new(),
            tmp_definitions: FxHashMap::default(),
            register_uses: Uses::new(),
            memory_uses: Uses::new(),
            tmp_uses: FxHashMap::default(),
            dead_virgin_definitions: FxHashSet::default(),
        }
    }

    #[inline]
    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    #[inline]
    pub fn track_tmps(&self) -> bool {
        self.track_tmps
    }

    pub fn dead_virgin_definitions(&self) -> &FxHashSet<Rc<Definition>> {
        &self.dead_virgin_definitions
    }

    /// Seeds the state of a function entry: the stack pointer, the
    /// calling-convention arguments, and architecture specific registers.
    pub(crate) fn init_function(
        &mut self,
        loader: &dyn Loader,
        cc: Option<&CallingConvention>,
        func_addr: u64,
    ) {
        let arch = self.arch.clone();

        let sp = Register::new(arch.sp_offset(), arch.bytes());
        self.install_initial_register(sp, DataSet::singleton(Value::Int(arch.initial_sp()), arch.bits()));

        if let Some(cc) = cc {
            for arg in &cc.args {
                match arg {
                    CcArg::Reg { name, .. } => {
                        let Some(info) = arch.register(name) else {
                            warn!(register = %name, "calling convention names an unknown register");
                            continue;
                        };
                        let reg = Register::new(info.offset, arch.bytes());
                        let data = DataSet::singleton(
                            Value::Parameter(Parameter::Reg(reg)),
                            arch.bits(),
                        );
                        self.install_initial_register(reg, data);
                    }
                    CcArg::Stack { offset, size } => {
                        let ml = MemoryLocation::new(
                            arch.initial_sp().wrapping_add_signed(*offset),
                            arch.bytes(),
                        );
                        let sp_offset = SpOffset::new((size * 8) as u32, *offset);
                        let data = DataSet::singleton(
                            Value::Parameter(Parameter::Stack(sp_offset)),
                            arch.bits(),
                        );
                        let def = Rc::new(Definition::new(
                            Atom::Memory(ml),
                            CodeLocation::External,
                            data,
                        ));
                        self.memory_definitions.set_object(ml.addr, def, ml.size);
                    }
                }
            }
        }

        let arch_name = arch.name().to_ascii_lowercase();
        if arch_name.contains("ppc64") {
            if let Some(rtoc_value) = loader.ppc64_initial_rtoc() {
                if let Some(info) = arch.register("rtoc") {
                    let rtoc = Register::new(info.offset, info.size);
                    self.install_initial_register(
                        rtoc,
                        DataSet::singleton(Value::Int(rtoc_value), arch.bits()),
                    );
                }
            }
        } else if arch_name.contains("mips64") {
            if let Some(info) = arch.register("t9") {
                let t9 = Register::new(info.offset, info.size);
                self.install_initial_register(
                    t9,
                    DataSet::singleton(Value::Int(func_addr), arch.bits()),
                );
            }
        }
    }

    fn install_initial_register(&mut self, reg: Register, data: DataSet) {
        let def = Rc::new(Definition::new(
            Atom::Register(reg),
            CodeLocation::External,
            data,
        ));
        self.register_definitions
            .set_object(reg.offset, def, reg.size);
    }

    /// Kills the definitions the write to `atom` fully covers and installs a
    /// new one.
    pub fn kill_and_add_definition(&mut self, atom: Atom, codeloc: CodeLocation, data: DataSet) {
        match atom {
            Atom::Register(reg) => {
                let displaced = self.register_definitions.get_objects_by_offset(reg.offset);
                if !displaced.is_empty() {
                    let consumed = displaced
                        .iter()
                        .any(|d| !self.register_uses.get_current_uses(d).is_empty());
                    if !consumed {
                        self.dead_virgin_definitions
                            .extend(displaced.iter().cloned());
                    }
                }

                let def = Rc::new(Definition::new(atom, codeloc, data));
                self.register_definitions.set_object(reg.offset, def, reg.size);
            }
            Atom::Memory(mem) => {
                // no dead-virgin tracking: aliasing makes it unsound
                let def = Rc::new(Definition::new(atom, codeloc, data));
                self.memory_definitions.set_object(mem.addr, def, mem.size);
            }
            Atom::Tmp(idx) => {
                self.tmp_definitions.insert(
                    idx,
                    TmpDef {
                        atom,
                        codeloc,
                        data,
                    },
                );
            }
            Atom::Parameter(_) => {
                error!(%atom, "cannot define a parameter atom, ignoring");
            }
        }
    }

    /// Removes every definition the write to `atom` fully covers, without
    /// installing a replacement.
    pub fn kill_definitions(&mut self, atom: Atom) {
        match atom {
            Atom::Register(reg) => {
                let displaced = self.register_definitions.get_objects_by_offset(reg.offset);
                if !displaced.is_empty() {
                    let consumed = displaced
                        .iter()
                        .any(|d| !self.register_uses.get_current_uses(d).is_empty());
                    if !consumed {
                        self.dead_virgin_definitions
                            .extend(displaced.iter().cloned());
                    }
                }

                self.register_definitions.kill_covered(reg.offset, reg.size);
            }
            Atom::Memory(mem) => {
                self.memory_definitions.kill_covered(mem.addr, mem.size);
            }
            Atom::Tmp(idx) => {
                self.tmp_definitions.remove(&idx);
            }
            Atom::Parameter(_) => {
                error!(%atom, "cannot kill a parameter atom, ignoring");
            }
        }
    }

    /// Records that `codeloc` consumed every definition currently covering
    /// `atom`.
    pub fn add_use(&mut self, atom: Atom, codeloc: CodeLocation) {
        match atom {
            Atom::Register(reg) => {
                for def in self.register_definitions.get_objects_by_offset(reg.offset) {
                    self.register_uses.add_use(&def, codeloc);
                }
            }
            Atom::Memory(mem) => {
                for def in self.memory_definitions.get_objects_by_offset(mem.addr) {
                    self.memory_uses.add_use(&def, codeloc);
                }
            }
            Atom::Tmp(idx) => match self.tmp_definitions.get(&idx) {
                Some(def) => {
                    let def = def.clone();
                    self.tmp_uses
                        .entry(idx)
                        .or_default()
                        .insert((codeloc, def));
                }
                None => warn!(tmp = idx, "use of an undefined temporary"),
            },
            Atom::Parameter(_) => {
                error!(%atom, "cannot record a use of a parameter atom, ignoring");
            }
        }
    }

    /// An observationally independent copy.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Unions other states into a copy of this one. Temporaries are not
    /// merged; their scope is a single block.
    pub fn merge<'a>(&self, others: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut state = self.copy();

        for other in others {
            state.register_definitions.merge(&other.register_definitions);
            state.memory_definitions.merge(&other.memory_definitions);

            state.register_uses.merge(&other.register_uses);
            state.memory_uses.merge(&other.memory_uses);

            state
                .dead_virgin_definitions
                .extend(other.dead_virgin_definitions.iter().cloned());
        }

        state
    }

    /// Slims a retained snapshot: per-block temporary scratch is dropped,
    /// register and memory facts survive.
    pub fn downsize(&mut self) {
        self.tmp_definitions.clear();
        self.tmp_uses.clear();
    }
}

impl PartialEq for ReachingDefinitions {
    fn eq(&self, other: &Self) -> bool {
        // the arch handle is shared configuration, not state
        self.track_tmps == other.track_tmps
            && self.register_definitions == other.register_definitions
            && self.memory_definitions == other.memory_definitions
            && self.tmp_definitions == other.tmp_definitions
            && self.register_uses == other.register_uses
            && self.memory_uses == other.memory_uses
            && self.tmp_uses == other.tmp_uses
            && self.dead_virgin_definitions == other.dead_virgin_definitions
    }
}

impl Eq for ReachingDefinitions {}

impl fmt::Display for ReachingDefinitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ReachingDefinitions, {} regdefs, {} memdefs",
            self.register_definitions.len(),
            self.memory_definitions.len(),
        )?;
        if self.track_tmps {
            write!(f, ", {} tmpdefs", self.tmp_definitions.len())?;
        }
        write!(f, ">")
    }
}
