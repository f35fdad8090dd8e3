//! Descriptions of the guest architectures that lifted code runs on.
//!
//! Analyses address registers the same way the IR does: by byte offset into
//! one flat register file. An [`Arch`] carries that register table together
//! with the handful of distinguished offsets (stack pointer, base pointer,
//! instruction pointer) everything downstream keys on.

mod cc;

pub use cc::{CallingConvention, CcArg};

use rustc_hash::FxHashMap;

/// Byte order of guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endness {
    Little,
    Big,
}

/// A named register slot: offset into the register file and size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterInfo {
    pub offset: u64,
    pub size: u64,
}

/// A guest architecture descriptor.
#[derive(Debug, Clone)]
pub struct Arch {
    name: String,
    bits: u32,
    sp_offset: u64,
    bp_offset: u64,
    ip_offset: u64,
    memory_endness: Endness,
    initial_sp: u64,
    registers: FxHashMap<String, RegisterInfo>,
    register_names: FxHashMap<u64, String>,
}

impl Arch {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        bits: u32,
        sp_offset: u64,
        bp_offset: u64,
        ip_offset: u64,
        memory_endness: Endness,
        initial_sp: u64,
        registers: &[(&str, u64, u64)],
    ) -> Self {
        assert!(bits == 32 || bits == 64);

        let mut table = FxHashMap::default();
        let mut names = FxHashMap::default();
        for &(name, offset, size) in registers {
            table.insert(name.to_owned(), RegisterInfo { offset, size });
            names.insert(offset, name.to_owned());
        }

        Self {
            name: name.into(),
            bits,
            sp_offset,
            bp_offset,
            ip_offset,
            memory_endness,
            initial_sp,
            registers: table,
            register_names: names,
        }
    }

    /// An AMD64 descriptor with the usual register file layout.
    pub fn amd64() -> Self {
        Self::new(
            "AMD64",
            64,
            48,
            56,
            184,
            Endness::Little,
            0x7fff_ffff_fff0_0000,
            &[
                ("rax", 16, 8),
                ("rcx", 24, 8),
                ("rdx", 32, 8),
                ("rbx", 40, 8),
                ("rsp", 48, 8),
                ("rbp", 56, 8),
                ("rsi", 64, 8),
                ("rdi", 72, 8),
                ("r8", 80, 8),
                ("r9", 88, 8),
                ("r10", 96, 8),
                ("r11", 104, 8),
                ("r12", 112, 8),
                ("r13", 120, 8),
                ("r14", 128, 8),
                ("r15", 136, 8),
                ("cc_op", 144, 8),
                ("cc_dep1", 152, 8),
                ("cc_dep2", 160, 8),
                ("cc_ndep", 168, 8),
                ("rip", 184, 8),
            ],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of a machine word, in bits.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Width of a machine word, in bytes.
    #[inline]
    pub fn bytes(&self) -> u64 {
        u64::from(self.bits / 8)
    }

    #[inline]
    pub fn sp_offset(&self) -> u64 {
        self.sp_offset
    }

    #[inline]
    pub fn bp_offset(&self) -> u64 {
        self.bp_offset
    }

    #[inline]
    pub fn ip_offset(&self) -> u64 {
        self.ip_offset
    }

    #[inline]
    pub fn memory_endness(&self) -> Endness {
        self.memory_endness
    }

    /// Stack pointer value at the entry of a freshly initialized function.
    #[inline]
    pub fn initial_sp(&self) -> u64 {
        self.initial_sp
    }

    /// Looks up a register by name.
    pub fn register(&self, name: &str) -> Option<RegisterInfo> {
        self.registers.get(name).copied()
    }

    /// Reverse lookup: name of the register starting at `offset`.
    pub fn register_name(&self, offset: u64) -> Option<&str> {
        self.register_names.get(&offset).map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::Arch;

    #[test]
    fn amd64_table_is_consistent() {
        let arch = Arch::amd64();
        assert_eq!(arch.bytes(), 8);
        assert_eq!(arch.register("rsp").unwrap().offset, arch.sp_offset());
        assert_eq!(arch.register("rbp").unwrap().offset, arch.bp_offset());
        assert_eq!(arch.register("rip").unwrap().offset, arch.ip_offset());

        for name in ["rax", "rcx", "cc_op", "r15"] {
            let info = arch.register(name).unwrap();
            assert_eq!(arch.register_name(info.offset), Some(name));
        }
    }
}
