use std::fmt;

/// A position inside the analysed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeLocation {
    /// A statement inside a lifted block.
    Position {
        block_addr: u64,
        stmt_idx: usize,
        ins_addr: Option<u64>,
    },
    /// The sentinel for definitions that exist before the analysed region:
    /// the initial state, or values supplied by external callers.
    External,
}

impl CodeLocation {
    pub fn new(block_addr: u64, stmt_idx: usize, ins_addr: Option<u64>) -> Self {
        Self::Position {
            block_addr,
            stmt_idx,
            ins_addr,
        }
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeLocation::Position {
                block_addr,
                stmt_idx,
                ins_addr: Some(ins),
            } => write!(f, "<{block_addr:#x}[{stmt_idx}] @ {ins:#x}>"),
            CodeLocation::Position {
                block_addr,
                stmt_idx,
                ins_addr: None,
            } => write!(f, "<{block_addr:#x}[{stmt_idx}]>"),
            CodeLocation::External => write!(f, "[External]"),
        }
    }
}
