use crate::{
    analysis::{Observations, ObserveAt},
    atom::{Atom, Register},
    code_location::CodeLocation,
    data::{DataSet, RegisterOffset, SpOffset, Value},
    state::ReachingDefinitions,
};
use arch::{Arch, CallingConvention};
use ir::ail::{BinOp, Expr, Stmt};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, warn};

/// Runs the transfer functions of one AIL block over a state.
pub(crate) struct AilEngine<'a> {
    arch: &'a Arch,
    observations: &'a mut Observations,

    block: &'a ir::ail::Block,
    state: ReachingDefinitions,
    tmps: FxHashMap<u32, DataSet>,
    stmt_idx: usize,
    ins_addr: Option<u64>,
}

impl<'a> AilEngine<'a> {
    pub fn new(
        arch: &'a Arch,
        observations: &'a mut Observations,
        block: &'a ir::ail::Block,
        state: ReachingDefinitions,
    ) -> Self {
        Self {
            arch,
            observations,
            block,
            state,
            tmps: FxHashMap::default(),
            stmt_idx: 0,
            ins_addr: None,
        }
    }

    pub fn process(mut self) -> ReachingDefinitions {
        let block = self.block;
        for (idx, stmt) in block.statements.iter().enumerate() {
            self.stmt_idx = idx;
            self.ins_addr = Some(stmt.ins_addr());

            self.handle_stmt(stmt);
        }

        self.state
    }

    fn codeloc(&self) -> CodeLocation {
        CodeLocation::new(self.block.addr, self.stmt_idx, self.ins_addr)
    }

    fn observe(&mut self, at: ObserveAt) {
        if let Some(ins_addr) = self.ins_addr {
            self.observations.record(ins_addr, at, &self.state);
        }
    }

    //
    // statement handlers
    //

    fn handle_stmt(&mut self, stmt: &Stmt) {
        self.observe(ObserveAt::Before);

        match stmt {
            Stmt::Assignment { dst, src, .. } => self.handle_assignment(dst, src),
            Stmt::Store { addr, data, .. } => self.handle_store(addr, data),
            Stmt::Jump { target, .. } => {
                let _target = self.eval(target);
            }
            Stmt::ConditionalJump {
                condition,
                true_target,
                false_target,
                ..
            } => self.handle_conditional_jump(condition, true_target, false_target),
            Stmt::Call {
                target,
                args,
                calling_convention,
                ..
            } => self.handle_call(target, args.as_deref(), calling_convention.as_ref()),
        }

        self.observe(ObserveAt::After);
    }

    fn handle_assignment(&mut self, dst: &Expr, src_expr: &Expr) {
        let src = self.eval(src_expr);
        let loc = self.codeloc();

        match dst {
            Expr::Tmp { tmp_idx, .. } => {
                self.state
                    .kill_and_add_definition(Atom::Tmp(*tmp_idx), loc, src.clone());
                self.tmps.insert(*tmp_idx, src);
            }
            Expr::Register { reg_offset, bits } => {
                let reg = Register::new(*reg_offset, u64::from(bits / 8));
                self.state
                    .kill_and_add_definition(Atom::Register(reg), loc, src);
            }
            other => {
                error!(dst = ?other, "unsupported assignment destination");
            }
        }
    }

    fn handle_store(&mut self, addr: &Expr, data: &Expr) {
        // evaluated for the use recording side effects only; stores at this
        // stage never install a memory definition
        let _data = self.eval(data);
        let _addr = self.eval(addr);
        // TODO: install a MemoryLocation definition once stores reaching
        // this stage carry concrete addresses
    }

    fn handle_conditional_jump(&mut self, condition: &Expr, true_target: &Expr, false_target: &Expr) {
        let _cond = self.eval(condition);
        let _true_target = self.eval(true_target);
        let _false_target = self.eval(false_target);

        self.kill_ip();
        self.kill_cc_registers();
    }

    fn handle_call(
        &mut self,
        target: &Expr,
        args: Option<&[Expr]>,
        cc: Option<&CallingConvention>,
    ) {
        let _target = self.eval(target);

        self.kill_ip();

        if let Some(args) = args {
            for arg in args {
                let _ = self.eval(arg);
            }
        }

        // the callee is free to clobber the caller-saved registers
        if let Some(cc) = cc {
            for reg_name in &cc.caller_saved {
                match self.arch.register(reg_name) {
                    Some(info) => {
                        let reg = Register::new(info.offset, info.size);
                        self.state.kill_definitions(Atom::Register(reg));
                    }
                    None => warn!(register = %reg_name, "unknown caller saved register"),
                }
            }
        }

        self.kill_cc_registers();
    }

    fn kill_ip(&mut self) {
        let ip = Register::new(self.arch.ip_offset(), self.arch.bytes());
        self.state.kill_definitions(Atom::Register(ip));
    }

    // TODO: make this architecture agnostic
    fn kill_cc_registers(&mut self) {
        for name in ["cc_op", "cc_dep1", "cc_dep2", "cc_ndep"] {
            match self.arch.register(name) {
                Some(info) => {
                    let reg = Register::new(info.offset, info.size);
                    self.state.kill_definitions(Atom::Register(reg));
                }
                None => debug!(register = name, "architecture has no such register, skipping"),
            }
        }
    }

    //
    // expression handlers
    //

    fn eval(&mut self, expr: &Expr) -> DataSet {
        match expr {
            Expr::Tmp { tmp_idx, bits } => {
                if self.state.track_tmps() {
                    let loc = self.codeloc();
                    self.state.add_use(Atom::Tmp(*tmp_idx), loc);
                }

                self.tmps.get(tmp_idx).cloned().unwrap_or_else(|| {
                    DataSet::singleton(Value::Expr(Box::new(expr.clone())), *bits)
                })
            }
            Expr::Register { reg_offset, bits } => self.handle_register(expr, *reg_offset, *bits),
            Expr::Const { value, bits } => DataSet::singleton(Value::Int(*value), *bits),
            Expr::Load { addr, size } => self.handle_load(expr, addr, *size),
            Expr::Convert {
                to_bits, operand, ..
            } => self.eval(operand).convert(*to_bits),
            Expr::BinOp { op, operands } => self.handle_binop(expr, *op, operands),
        }
    }

    fn handle_register(&mut self, expr: &Expr, reg_offset: u64, bits: u32) -> DataSet {
        let size = u64::from(bits / 8);
        let loc = self.codeloc();
        self.state
            .add_use(Atom::Register(Register::new(reg_offset, size)), loc);

        // the stack frame is symbolic at this stage
        if reg_offset == self.arch.sp_offset() {
            return DataSet::singleton(Value::Sp(SpOffset::new(bits, 0)), bits);
        }
        if reg_offset == self.arch.bp_offset() {
            return DataSet::singleton(Value::Sp(SpOffset::base(bits, 0)), bits);
        }

        if self.arch.register_name(reg_offset).is_none() {
            return DataSet::singleton(
                Value::RegOffset(RegisterOffset::new(bits, reg_offset, 0)),
                bits,
            );
        }

        let mut defs = self.state.register_definitions.get_objects_by_offset(reg_offset);
        if defs.is_empty() {
            // the value flowed in from outside the analysed region; define
            // it right away as an external dependency
            let data = DataSet::singleton(Value::Expr(Box::new(expr.clone())), bits);
            self.state.kill_and_add_definition(
                Atom::Register(Register::new(reg_offset, size)),
                CodeLocation::External,
                data,
            );
            defs = self.state.register_definitions.get_objects_by_offset(reg_offset);
        }

        let mut values = FxHashSet::default();
        for def in &defs {
            values.extend(def.data.iter().cloned());
        }
        DataSet::new(values, bits)
    }

    fn handle_load(&mut self, expr: &Expr, addr: &Expr, size: u64) -> DataSet {
        let _addr = self.eval(addr);

        // TODO: read through the memory definitions like the VEX engine does
        DataSet::singleton(Value::Expr(Box::new(expr.clone())), (size * 8) as u32)
    }

    fn handle_binop(&mut self, expr: &Expr, op: BinOp, operands: &[Expr; 2]) -> DataSet {
        let bits = expr.bits();
        let lhs = self.eval(&operands[0]);
        let rhs = self.eval(&operands[1]);

        match op {
            BinOp::Add => &lhs + &rhs,
            BinOp::Sub => &lhs - &rhs,
            BinOp::Xor => match (lhs.as_int(), rhs.as_int()) {
                (Some(a), Some(b)) => {
                    DataSet::singleton(Value::Int((a ^ b) & DataSet::mask(bits)), bits)
                }
                _ => DataSet::singleton(Value::Expr(Box::new(expr.clone())), bits),
            },
            BinOp::CmpEQ => match (lhs.as_int(), rhs.as_int()) {
                (Some(a), Some(b)) => DataSet::singleton(Value::Bool(a == b), bits),
                _ => DataSet::singleton(Value::Expr(Box::new(expr.clone())), bits),
            },
            BinOp::CmpLE => match (lhs.as_int(), rhs.as_int()) {
                (Some(a), Some(b)) => DataSet::singleton(Value::Bool(a <= b), bits),
                _ => DataSet::singleton(Value::Expr(Box::new(expr.clone())), bits),
            },
            other => {
                error!(op = ?other, "unsupported binary operation");
                DataSet::undefined(bits)
            }
        }
    }
}
