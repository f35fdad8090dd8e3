//! The VEX-like dialect: flat statements over typed temporaries.
//!
//! Instruction boundaries are marked by [`Stmt::IMark`]; everything between
//! two marks belongs to one machine instruction. Temporaries are typed
//! through the block's [`TyEnv`] and live for a single block.

use arch::Endness;
use strum::VariantArray;

/// An IR value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, VariantArray)]
pub enum Ty {
    I1,
    I8,
    I16,
    I32,
    I64,
}

impl Ty {
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Ty::I1 => 1,
            Ty::I8 => 8,
            Ty::I16 => 16,
            Ty::I32 => 32,
            Ty::I64 => 64,
        }
    }

    #[inline]
    pub fn bytes(self) -> u64 {
        u64::from(self.bits() / 8)
    }
}

/// Types of the temporaries of one block, indexed by tmp number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TyEnv {
    types: Vec<Ty>,
}

impl TyEnv {
    pub fn new(types: Vec<Ty>) -> Self {
        Self { types }
    }

    /// Type of the given temporary.
    ///
    /// # Panics
    /// Panics if the temporary is not part of this block.
    #[inline]
    pub fn type_of(&self, tmp: u32) -> Ty {
        self.types[tmp as usize]
    }
}

/// A typed constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Const {
    pub value: u64,
    pub ty: Ty,
}

impl Const {
    pub fn new(value: u64, ty: Ty) -> Self {
        Self { value, ty }
    }
}

/// Unary operators, reduced to the classes the analyses care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// A width conversion, signed or not.
    Conversion { to: Ty },
    Not1,
}

/// Binary operators, keyed by their name prefix (width comes from the
/// operands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, VariantArray)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    CmpEQ,
    CmpNE,
    CmpLT,
    CmpORD,
}

impl BinOpKind {
    /// Whether the result is a single condition bit.
    #[inline]
    pub fn is_comparison(self) -> bool {
        matches!(self, BinOpKind::CmpEQ | BinOpKind::CmpNE | BinOpKind::CmpLT)
    }
}

/// The conversion applied by a guarded load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadGCvt {
    Ident8,
    Ident16,
    Ident32,
    Ident64,
    U8To32,
    S8To32,
    U16To32,
    S16To32,
}

impl LoadGCvt {
    /// Whether the loaded value is passed through unconverted.
    #[inline]
    pub fn is_ident(self) -> bool {
        matches!(
            self,
            LoadGCvt::Ident8 | LoadGCvt::Ident16 | LoadGCvt::Ident32 | LoadGCvt::Ident64
        )
    }

    /// Type of the value written to the destination temporary.
    #[inline]
    pub fn result_ty(self) -> Ty {
        match self {
            LoadGCvt::Ident8 => Ty::I8,
            LoadGCvt::Ident16 => Ty::I16,
            LoadGCvt::Ident32 => Ty::I32,
            LoadGCvt::Ident64 => Ty::I64,
            LoadGCvt::U8To32 | LoadGCvt::S8To32 | LoadGCvt::U16To32 | LoadGCvt::S16To32 => Ty::I32,
        }
    }
}

/// An expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Read of a temporary.
    RdTmp { tmp: u32 },
    /// Read of the register file at a byte offset.
    Get { offset: u64, ty: Ty },
    /// Memory load.
    Load { end: Endness, ty: Ty, addr: Box<Expr> },
    Const(Const),
    Unop { op: UnOp, arg: Box<Expr> },
    Binop { op: BinOpKind, args: Box<[Expr; 2]> },
    /// Call to a helper of the lifter. Opaque to analyses.
    CCall { ret_ty: Ty, callee: String, args: Vec<Expr> },
    /// If-then-else over a 1-bit condition.
    ITE {
        cond: Box<Expr>,
        iftrue: Box<Expr>,
        iffalse: Box<Expr>,
    },
}

impl Expr {
    /// Width of the value this expression produces, in bits.
    pub fn result_size(&self, tyenv: &TyEnv) -> u32 {
        match self {
            Expr::RdTmp { tmp } => tyenv.type_of(*tmp).bits(),
            Expr::Get { ty, .. } | Expr::Load { ty, .. } => ty.bits(),
            Expr::Const(c) => c.ty.bits(),
            Expr::Unop { op, .. } => match op {
                UnOp::Conversion { to } => to.bits(),
                UnOp::Not1 => 1,
            },
            Expr::Binop { op, args } => {
                if op.is_comparison() {
                    1
                } else {
                    args[0].result_size(tyenv)
                }
            }
            Expr::CCall { ret_ty, .. } => ret_ty.bits(),
            Expr::ITE { iftrue, .. } => iftrue.result_size(tyenv),
        }
    }
}

/// How a block hands control to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Boring,
    Call,
    Ret,
}

/// A statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// Marks the start of the machine instruction at `addr + delta`.
    IMark { addr: u64, len: u32, delta: u64 },
    AbiHint,
    /// Write to the register file at a byte offset.
    Put { offset: u64, data: Expr },
    /// Write to a temporary.
    WrTmp { tmp: u32, data: Expr },
    /// Memory store.
    Store { end: Endness, addr: Expr, data: Expr },
    /// Guarded store: performed only when `guard` holds.
    StoreG {
        end: Endness,
        addr: Expr,
        data: Expr,
        guard: Expr,
    },
    /// Guarded load: `dst` receives the converted load when `guard` holds,
    /// `alt` otherwise.
    LoadG {
        end: Endness,
        cvt: LoadGCvt,
        dst: u32,
        addr: Expr,
        alt: Expr,
        guard: Expr,
    },
    /// Conditional side exit.
    Exit {
        guard: Expr,
        dst: Const,
        jumpkind: JumpKind,
    },
}

/// A lifted block of VEX statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub statements: Vec<Stmt>,
    pub tyenv: TyEnv,
    pub jumpkind: JumpKind,
}

impl Block {
    pub fn new(statements: Vec<Stmt>, tyenv: TyEnv, jumpkind: JumpKind) -> Self {
        Self {
            statements,
            tyenv,
            jumpkind,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{BinOpKind, Const, Expr, Ty, TyEnv};
    use strum::VariantArray;

    #[test]
    fn result_sizes_cover_all_binops() {
        let tyenv = TyEnv::default();
        let lhs = Expr::Const(Const::new(1, Ty::I64));
        let rhs = Expr::Const(Const::new(2, Ty::I64));

        for op in BinOpKind::VARIANTS {
            let expr = Expr::Binop {
                op: *op,
                args: Box::new([lhs.clone(), rhs.clone()]),
            };

            let bits = expr.result_size(&tyenv);
            if op.is_comparison() {
                assert_eq!(bits, 1, "{op:?} must produce a condition bit");
            } else {
                assert_eq!(bits, 64, "{op:?} must keep the operand width");
            }
        }
    }

    #[test]
    fn tmp_sizes_come_from_the_tyenv() {
        let tyenv = TyEnv::new(vec![Ty::I8, Ty::I32]);
        assert_eq!(Expr::RdTmp { tmp: 0 }.result_size(&tyenv), 8);
        assert_eq!(Expr::RdTmp { tmp: 1 }.result_size(&tyenv), 32);
    }
}
