use crate::atom::{Parameter, Register};
use ir::ail;
use rustc_hash::{FxHashSet, FxHasher};
use std::{
    fmt,
    hash::{Hash, Hasher},
};
use tracing::warn;

/// A symbolic offset from the stack pointer at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpOffset {
    pub bits: u32,
    pub offset: i64,
    /// Whether this is the frame base rather than the stack top.
    pub is_base: bool,
}

impl SpOffset {
    pub fn new(bits: u32, offset: i64) -> Self {
        Self {
            bits,
            offset,
            is_base: false,
        }
    }

    pub fn base(bits: u32, offset: i64) -> Self {
        Self {
            bits,
            offset,
            is_base: true,
        }
    }
}

/// A symbolic offset from an arbitrary register at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterOffset {
    pub bits: u32,
    pub reg: u64,
    pub offset: i64,
}

impl RegisterOffset {
    pub fn new(bits: u32, reg: u64, offset: i64) -> Self {
        Self { bits, reg, offset }
    }
}

/// A member of a [`DataSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// The lattice top: the value could be anything. Absorbs every operator.
    Undefined,
    /// A concrete integer, masked to the set's width.
    Int(u64),
    /// The result of a resolved comparison.
    Bool(bool),
    Sp(SpOffset),
    RegOffset(RegisterOffset),
    /// A caller-supplied value.
    Parameter(Parameter),
    /// A symbolic residue: an expression the engine could not reduce.
    Expr(Box<ail::Expr>),
}

impl Value {
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }
}

fn add_values(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x.wrapping_add(*y))),
        (Value::Sp(sp), Value::Int(i)) | (Value::Int(i), Value::Sp(sp)) => {
            Some(Value::Sp(SpOffset {
                offset: sp.offset.wrapping_add(*i as i64),
                ..*sp
            }))
        }
        _ => None,
    }
}

fn sub_values(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x.wrapping_sub(*y))),
        (Value::Sp(sp), Value::Int(i)) => Some(Value::Sp(SpOffset {
            offset: sp.offset.wrapping_sub(*i as i64),
            ..*sp
        })),
        _ => None,
    }
}

fn int_values(op: impl Fn(u64, u64) -> u64) -> impl Fn(&Value, &Value) -> Option<Value> {
    move |a, b| match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(op(*x, *y))),
        _ => None,
    }
}

fn shift_amount(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

/// A set-valued lattice element of a fixed bit width.
///
/// Never empty: an unknown value is represented by a set containing
/// [`Value::Undefined`], not by an empty set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSet {
    data: FxHashSet<Value>,
    bits: u32,
}

impl DataSet {
    /// # Panics
    /// Panics if `data` is empty.
    pub fn new(data: FxHashSet<Value>, bits: u32) -> Self {
        assert!(!data.is_empty(), "a DataSet must not be empty");
        Self { data, bits }
    }

    pub fn singleton(value: Value, bits: u32) -> Self {
        Self::new(FxHashSet::from_iter([value]), bits)
    }

    /// The top element: `{Undefined}` at the given width.
    pub fn undefined(bits: u32) -> Self {
        Self::singleton(Value::Undefined, bits)
    }

    /// Both comparison outcomes; the sound result of an unresolvable test.
    pub fn unknown_bool(bits: u32) -> Self {
        Self::new(
            FxHashSet::from_iter([Value::Bool(true), Value::Bool(false)]),
            bits,
        )
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// The modular mask of a width. Saturates at 64 bits.
    #[inline]
    pub fn mask(bits: u32) -> u64 {
        if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.data.iter()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.data.contains(value)
    }

    pub fn contains_undefined(&self) -> bool {
        self.data.contains(&Value::Undefined)
    }

    /// An arbitrary member.
    pub fn first(&self) -> &Value {
        self.data.iter().next().expect("DataSet is never empty")
    }

    /// The sole member, if there is exactly one.
    pub fn singleton_value(&self) -> Option<&Value> {
        if self.data.len() == 1 {
            self.data.iter().next()
        } else {
            None
        }
    }

    /// The sole member as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self.singleton_value() {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// The sole member as a concrete integer, if it is one.
    pub fn as_int(&self) -> Option<u64> {
        match self.singleton_value() {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn insert(&mut self, value: Value) {
        self.data.insert(value);
    }

    /// Unions another set into this one.
    pub fn update(&mut self, other: &DataSet) {
        if self.bits != other.bits {
            warn!(
                ours = self.bits,
                theirs = other.bits,
                "updating a DataSet with a differently sized one"
            );
        }
        self.data.extend(other.data.iter().cloned());
    }

    /// Applies `op` over the Cartesian product of the two sets.
    ///
    /// `Undefined` on either side is absorbing; integer results are masked to
    /// this set's width; pairs the operator cannot combine widen to
    /// `Undefined`.
    fn bin_op(&self, other: &DataSet, op: impl Fn(&Value, &Value) -> Option<Value>) -> DataSet {
        if self.bits != other.bits {
            warn!(
                lhs = self.bits,
                rhs = other.bits,
                "binary operation on differently sized DataSets"
            );
        }

        let mask = Self::mask(self.bits);
        let mut res = FxHashSet::default();
        for rhs in &other.data {
            for lhs in &self.data {
                if lhs.is_undefined() || rhs.is_undefined() {
                    res.insert(Value::Undefined);
                    continue;
                }

                match op(lhs, rhs) {
                    Some(Value::Int(v)) => {
                        res.insert(Value::Int(v & mask));
                    }
                    Some(v) => {
                        res.insert(v);
                    }
                    None => {
                        warn!(?lhs, ?rhs, "operands cannot be combined, widening to Undefined");
                        res.insert(Value::Undefined);
                    }
                }
            }
        }

        DataSet::new(res, self.bits)
    }

    fn un_op(&self, op: impl Fn(&Value) -> Option<Value>) -> DataSet {
        let mask = Self::mask(self.bits);
        let mut res = FxHashSet::default();
        for v in &self.data {
            if v.is_undefined() {
                res.insert(Value::Undefined);
                continue;
            }

            match op(v) {
                Some(Value::Int(v)) => {
                    res.insert(Value::Int(v & mask));
                }
                Some(v) => {
                    res.insert(v);
                }
                None => {
                    warn!(operand = ?v, "operand cannot be combined, widening to Undefined");
                    res.insert(Value::Undefined);
                }
            }
        }

        DataSet::new(res, self.bits)
    }

    /// Arithmetic shift right: the sign is taken from the MSB at the declared
    /// width `bits`, not from the host integer.
    pub fn sar(&self, other: &DataSet, bits: u32) -> DataSet {
        let mask = Self::mask(bits);
        let mut res = FxHashSet::default();
        for rhs in &other.data {
            for lhs in &self.data {
                match (lhs, rhs) {
                    (Value::Int(e0), Value::Int(e1)) if *e1 <= u64::from(bits) => {
                        let shifted = e0.checked_shr(shift_amount(*e1)).unwrap_or(0);
                        let head = if (e0 >> (bits - 1)) & 1 == 0 {
                            0
                        } else {
                            let ones = Self::mask(shift_amount(*e1));
                            ones.checked_shl(bits - shift_amount(*e1)).unwrap_or(0)
                        };
                        res.insert(Value::Int((head | shifted) & mask));
                    }
                    _ => {
                        warn!(?lhs, ?rhs, "cannot shift arithmetically, widening to Undefined");
                        res.insert(Value::Undefined);
                    }
                }
            }
        }

        DataSet::new(res, bits)
    }

    fn cmp_with(&self, other: &DataSet, bits: u32, op: impl Fn(u64, u64) -> bool) -> DataSet {
        if let (Some(a), Some(b)) = (self.as_int(), other.as_int()) {
            return DataSet::singleton(Value::Bool(op(a, b)), bits);
        }

        warn!("comparison of multiple values or of non-integers");
        DataSet::unknown_bool(bits)
    }

    pub fn cmp_eq(&self, other: &DataSet, bits: u32) -> DataSet {
        self.cmp_with(other, bits, |a, b| a == b)
    }

    pub fn cmp_ne(&self, other: &DataSet, bits: u32) -> DataSet {
        self.cmp_with(other, bits, |a, b| a != b)
    }

    pub fn cmp_lt(&self, other: &DataSet, bits: u32) -> DataSet {
        self.cmp_with(other, bits, |a, b| a < b)
    }

    /// The PPC ordered comparison: `{0x08, 0x04, 0x02}` for less, greater,
    /// equal.
    pub fn cmp_ord(&self, other: &DataSet, bits: u32) -> DataSet {
        if let (Some(a), Some(b)) = (self.as_int(), other.as_int()) {
            let code = match a.cmp(&b) {
                std::cmp::Ordering::Less => 0x08,
                std::cmp::Ordering::Greater => 0x04,
                std::cmp::Ordering::Equal => 0x02,
            };
            return DataSet::singleton(Value::Int(code), bits);
        }

        warn!("ordered comparison of multiple values or of non-integers");
        DataSet::unknown_bool(bits)
    }

    /// `Not1`: true iff the sole integer member is not 1.
    pub fn not1(&self, bits: u32) -> DataSet {
        if let Some(v) = self.as_int() {
            return DataSet::singleton(Value::Bool(v != 1), bits);
        }

        warn!("Not1 of multiple values or of non-integers");
        DataSet::unknown_bool(bits)
    }

    /// Converts the members to a new width: integers are masked, parameter
    /// markers have their recorded width rewritten, everything else passes
    /// through unchanged.
    pub fn convert(&self, to_bits: u32) -> DataSet {
        let mask = Self::mask(to_bits);
        let mut res = FxHashSet::default();
        for v in &self.data {
            let converted = match v {
                Value::Int(x) => Value::Int(x & mask),
                Value::Parameter(Parameter::Reg(reg)) => Value::Parameter(Parameter::Reg(
                    Register::new(reg.offset, u64::from(to_bits / 8)),
                )),
                Value::Parameter(Parameter::Stack(sp)) => {
                    Value::Parameter(Parameter::Stack(SpOffset {
                        bits: to_bits,
                        ..*sp
                    }))
                }
                Value::Undefined => Value::Undefined,
                other => {
                    warn!(value = ?other, "unsupported value in conversion, passing through");
                    other.clone()
                }
            };
            res.insert(converted);
        }

        DataSet::new(res, to_bits)
    }
}

impl std::ops::Add for &DataSet {
    type Output = DataSet;

    fn add(self, rhs: &DataSet) -> DataSet {
        self.bin_op(rhs, add_values)
    }
}

impl std::ops::Sub for &DataSet {
    type Output = DataSet;

    fn sub(self, rhs: &DataSet) -> DataSet {
        self.bin_op(rhs, sub_values)
    }
}

impl std::ops::BitAnd for &DataSet {
    type Output = DataSet;

    fn bitand(self, rhs: &DataSet) -> DataSet {
        self.bin_op(rhs, int_values(|a, b| a & b))
    }
}

impl std::ops::BitOr for &DataSet {
    type Output = DataSet;

    fn bitor(self, rhs: &DataSet) -> DataSet {
        self.bin_op(rhs, int_values(|a, b| a | b))
    }
}

impl std::ops::BitXor for &DataSet {
    type Output = DataSet;

    fn bitxor(self, rhs: &DataSet) -> DataSet {
        self.bin_op(rhs, int_values(|a, b| a ^ b))
    }
}

impl std::ops::Shl for &DataSet {
    type Output = DataSet;

    fn shl(self, rhs: &DataSet) -> DataSet {
        self.bin_op(
            rhs,
            int_values(|a, b| a.checked_shl(shift_amount(b)).unwrap_or(0)),
        )
    }
}

/// Logical shift right; [`DataSet::sar`] is the arithmetic one.
impl std::ops::Shr for &DataSet {
    type Output = DataSet;

    fn shr(self, rhs: &DataSet) -> DataSet {
        self.bin_op(
            rhs,
            int_values(|a, b| a.checked_shr(shift_amount(b)).unwrap_or(0)),
        )
    }
}

impl std::ops::Neg for &DataSet {
    type Output = DataSet;

    fn neg(self) -> DataSet {
        self.un_op(|v| match v {
            Value::Int(x) => Some(Value::Int(x.wrapping_neg())),
            _ => None,
        })
    }
}

impl Hash for DataSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // order independent: fold the member hashes with xor
        let mut acc = 0u64;
        for v in &self.data {
            let mut h = FxHasher::default();
            v.hash(&mut h);
            acc ^= h.finish();
        }

        self.bits.hash(state);
        acc.hash(state);
    }
}

impl fmt::Display for DataSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataSet<{}>: {{", self.bits)?;
        for (i, v) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v:?}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::{DataSet, SpOffset, Value};
    use rustc_hash::FxHashSet;

    fn ints(values: &[u64], bits: u32) -> DataSet {
        DataSet::new(
            FxHashSet::from_iter(values.iter().map(|v| Value::Int(*v))),
            bits,
        )
    }

    #[test]
    fn addition_is_modular() {
        for (a, b, w) in [
            (0xffu64, 1u64, 8u32),
            (0xfffe, 5, 16),
            (u64::MAX, 1, 64),
            (7, 9, 4),
        ] {
            let sum = &ints(&[a], w) + &ints(&[b], w);
            let expected = if w >= 64 {
                a.wrapping_add(b)
            } else {
                (a + b) & ((1 << w) - 1)
            };
            assert_eq!(sum.as_int(), Some(expected), "{a} + {b} at width {w}");
        }
    }

    #[test]
    fn cartesian_product_collects_all_sums() {
        let sums = &ints(&[1, 2], 64) + &ints(&[10, 20], 64);
        for expected in [11, 21, 12, 22] {
            assert!(sums.contains(&Value::Int(expected)));
        }
        assert_eq!(sums.len(), 4);
    }

    #[test]
    fn undefined_absorbs_every_operator() {
        let x = ints(&[3, 5], 64);
        let undef = DataSet::undefined(64);

        for res in [
            &x + &undef,
            &x - &undef,
            &x & &undef,
            &x | &undef,
            &x ^ &undef,
            &x << &undef,
            &x >> &undef,
            -&undef,
        ] {
            assert!(res.contains_undefined());
            assert!(res.len() >= 1);
        }
    }

    #[test]
    fn incompatible_operands_widen_to_undefined() {
        let sp = DataSet::singleton(Value::Sp(SpOffset::new(64, 0)), 64);
        let anded = &sp & &ints(&[1], 64);
        assert!(anded.contains_undefined());
    }

    #[test]
    fn stack_offsets_shift_under_addition() {
        let sp = DataSet::singleton(Value::Sp(SpOffset::new(64, 0)), 64);

        let pushed = &sp - &ints(&[8], 64);
        assert_eq!(
            pushed.singleton_value(),
            Some(&Value::Sp(SpOffset::new(64, -8)))
        );

        // -8 encoded as a masked 64-bit immediate
        let adjusted = &sp + &ints(&[(-8i64) as u64], 64);
        assert_eq!(
            adjusted.singleton_value(),
            Some(&Value::Sp(SpOffset::new(64, -8)))
        );
    }

    #[test]
    fn sar_matches_twos_complement() {
        for (value, shift, w) in [
            (-8i64 as u64, 1u64, 64u32),
            (-8i64 as u64, 3, 64),
            (8, 2, 64),
            (0x80, 4, 8),
            (0x7f, 4, 8),
        ] {
            let res = ints(&[value], w).sar(&ints(&[shift], w), w);
            let expected = if w >= 64 {
                ((value as i64) >> shift) as u64
            } else {
                let sign_extended = ((value << (64 - w)) as i64) >> (64 - w);
                ((sign_extended >> shift) as u64) & ((1 << w) - 1)
            };
            assert_eq!(res.as_int(), Some(expected), "{value:#x} >>s {shift} at {w}");
        }
    }

    #[test]
    fn unresolvable_comparisons_return_both_outcomes() {
        let multi = ints(&[1, 2], 64);
        let one = ints(&[1], 64);

        assert_eq!(one.cmp_eq(&one, 1).as_bool(), Some(true));
        assert_eq!(one.cmp_lt(&one, 1).as_bool(), Some(false));

        let both = multi.cmp_eq(&one, 1);
        assert!(both.contains(&Value::Bool(true)));
        assert!(both.contains(&Value::Bool(false)));
    }

    #[test]
    fn cmp_ord_produces_the_ppc_tri_code() {
        let one = ints(&[1], 32);
        let two = ints(&[2], 32);

        assert_eq!(one.cmp_ord(&two, 32).as_int(), Some(0x08));
        assert_eq!(two.cmp_ord(&one, 32).as_int(), Some(0x04));
        assert_eq!(one.cmp_ord(&one, 32).as_int(), Some(0x02));
    }

    #[test]
    fn conversion_rewrites_parameter_widths() {
        use crate::atom::{Parameter, Register};

        let mut data = FxHashSet::default();
        data.insert(Value::Int(0x1_ffff));
        data.insert(Value::Parameter(Parameter::Reg(Register::new(16, 8))));
        data.insert(Value::Parameter(Parameter::Stack(SpOffset::new(64, 8))));
        let set = DataSet::new(data, 64);

        let converted = set.convert(16);
        assert_eq!(converted.bits(), 16);
        assert!(converted.contains(&Value::Int(0xffff)));
        assert!(converted.contains(&Value::Parameter(Parameter::Reg(Register::new(16, 2)))));
        assert!(converted.contains(&Value::Parameter(Parameter::Stack(SpOffset::new(16, 8)))));
    }

    #[test]
    fn unions_preserve_non_emptiness() {
        let mut a = ints(&[1], 64);
        let b = ints(&[2, 3], 64);
        a.update(&b);
        assert_eq!(a.len(), 3);
        assert!(a.len() >= 1);
    }
}
