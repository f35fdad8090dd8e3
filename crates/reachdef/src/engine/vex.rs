use crate::{
    analysis::{Observations, ObserveAt},
    atom::{Atom, MemoryLocation, Register},
    code_location::CodeLocation,
    data::{DataSet, Value},
    handler::FunctionHandler,
    loader::Loader,
    state::ReachingDefinitions,
};
use arch::{Arch, Endness};
use ir::vex::{BinOpKind, Expr, JumpKind, LoadGCvt, Stmt, Ty, UnOp};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

/// Runs the transfer functions of one VEX block over a state.
pub(crate) struct VexEngine<'a, 'b, 'h> {
    arch: &'a Arch,
    loader: &'a dyn Loader,
    handler: Option<&'b mut (dyn FunctionHandler + 'h)>,
    observations: &'b mut Observations,
    current_depth: u32,
    maximum_depth: u32,

    block_addr: u64,
    block: &'a ir::vex::Block,
    state: ReachingDefinitions,
    tmps: FxHashMap<u32, DataSet>,
    stmt_idx: usize,
    ins_addr: Option<u64>,
}

impl<'a, 'b, 'h> VexEngine<'a, 'b, 'h> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        arch: &'a Arch,
        loader: &'a dyn Loader,
        handler: Option<&'b mut (dyn FunctionHandler + 'h)>,
        observations: &'b mut Observations,
        current_depth: u32,
        maximum_depth: u32,
        block_addr: u64,
        block: &'a ir::vex::Block,
        state: ReachingDefinitions,
    ) -> Self {
        Self {
            arch,
            loader,
            handler,
            observations,
            current_depth,
            maximum_depth,
            block_addr,
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
            if let Stmt::IMark { addr, delta, .. } = stmt {
                self.ins_addr = Some(addr.wrapping_add(*delta));
            }

            self.handle_stmt(stmt);
        }

        if block.jumpkind == JumpKind::Call {
            self.handle_function();
        }

        self.state
    }

    fn codeloc(&self) -> CodeLocation {
        CodeLocation::new(self.block_addr, self.stmt_idx, self.ins_addr)
    }

    fn result_bits(&self, expr: &Expr) -> u32 {
        expr.result_size(&self.block.tyenv)
    }

    fn observe(&mut self, stmt: &Stmt, at: ObserveAt) {
        let Some(ins_addr) = self.ins_addr else {
            return;
        };

        match at {
            // a snapshot "before the instruction" is only meaningful at its
            // IMark
            ObserveAt::Before => {
                if matches!(stmt, Stmt::IMark { .. }) {
                    self.observations.record(ins_addr, at, &self.state);
                }
            }
            // "after" means after the instruction's last statement
            ObserveAt::After => {
                let next = self.block.statements.get(self.stmt_idx + 1);
                if next.is_none() || matches!(next, Some(Stmt::IMark { .. })) {
                    self.observations.record(ins_addr, at, &self.state);
                }
            }
        }
    }

    //
    // statement handlers
    //

    fn handle_stmt(&mut self, stmt: &Stmt) {
        self.observe(stmt, ObserveAt::Before);

        match stmt {
            Stmt::IMark { .. } | Stmt::AbiHint | Stmt::Exit { .. } => {}
            Stmt::Put { offset, data } => self.handle_put(*offset, data),
            Stmt::WrTmp { tmp, data } => self.handle_wrtmp(*tmp, data),
            Stmt::Store { addr, data, .. } => self.handle_store(addr, data),
            Stmt::StoreG {
                addr, data, guard, ..
            } => self.handle_storeg(addr, data, guard),
            Stmt::LoadG {
                end,
                cvt,
                dst,
                addr,
                alt,
                guard,
            } => self.handle_loadg(*end, *cvt, *dst, addr, alt, guard),
        }

        self.observe(stmt, ObserveAt::After);
    }

    fn handle_put(&mut self, offset: u64, data_expr: &Expr) {
        let size = u64::from(self.result_bits(data_expr) / 8);
        let reg = Register::new(offset, size);
        let data = self.eval(data_expr);

        if data.contains_undefined() {
            info!(
                register = self.arch.register_name(offset).unwrap_or("?"),
                offset,
                ins_addr = ?self.ins_addr,
                "writing undefined data into a register"
            );
        }

        let loc = self.codeloc();
        self.state
            .kill_and_add_definition(Atom::Register(reg), loc, data);
    }

    fn handle_wrtmp(&mut self, tmp: u32, data_expr: &Expr) {
        let data = self.eval(data_expr);
        self.write_tmp(tmp, data);
    }

    fn write_tmp(&mut self, tmp: u32, data: DataSet) {
        let loc = self.codeloc();
        self.state
            .kill_and_add_definition(Atom::Tmp(tmp), loc, data.clone());
        self.tmps.insert(tmp, data);
    }

    fn handle_store(&mut self, addr_expr: &Expr, data_expr: &Expr) {
        let addr = self.eval(addr_expr);
        let size = u64::from(self.result_bits(data_expr) / 8);
        let data = self.eval(data_expr);
        let loc = self.codeloc();

        for a in addr.iter() {
            match a {
                Value::Int(a) => {
                    if data.contains_undefined() {
                        info!(ins_addr = ?self.ins_addr, "writing undefined data to {a:#x}");
                    }

                    // a write through one of several addresses must not kill
                    // the definitions at the other addresses
                    let memloc = MemoryLocation::new(*a, size);
                    self.state
                        .kill_and_add_definition(Atom::Memory(memloc), loc, data.clone());
                }
                Value::Undefined => {
                    info!(ins_addr = ?self.ins_addr, "memory address undefined");
                }
                other => {
                    debug!(addr = ?other, "skipping a store through a symbolic address");
                }
            }
        }
    }

    fn handle_storeg(&mut self, addr: &Expr, data: &Expr, guard: &Expr) {
        let guard = self.eval(guard);
        match guard.as_bool() {
            Some(true) => self.handle_store(addr, data),
            Some(false) => {}
            None => info!(ins_addr = ?self.ins_addr, "could not resolve the guard of a StoreG"),
        }
    }

    fn handle_loadg(
        &mut self,
        end: Endness,
        cvt: LoadGCvt,
        dst: u32,
        addr: &Expr,
        alt: &Expr,
        guard: &Expr,
    ) {
        let load = Expr::Load {
            end,
            ty: cvt.result_ty(),
            addr: Box::new(addr.clone()),
        };

        let guard = self.eval(guard);
        match guard.as_bool() {
            Some(true) => {
                if !cvt.is_ident() {
                    warn!(?cvt, "unsupported conversion in a LoadG");
                }
                self.handle_wrtmp(dst, &load);
            }
            Some(false) => self.handle_wrtmp(dst, alt),
            None => {
                if !cvt.is_ident() {
                    warn!(?cvt, "unsupported conversion in a LoadG");
                }
                let mut data = self.eval(&load);
                let alt = self.eval(alt);
                data.update(&alt);
                self.write_tmp(dst, data);
            }
        }
    }

    //
    // expression handlers
    //

    fn eval(&mut self, expr: &Expr) -> DataSet {
        match expr {
            Expr::RdTmp { tmp } => self
                .tmps
                .get(tmp)
                .cloned()
                .unwrap_or_else(|| DataSet::undefined(self.result_bits(expr))),
            Expr::Get { offset, ty } => self.handle_get(*offset, *ty),
            Expr::Load { ty, addr, .. } => self.handle_load(addr, *ty),
            Expr::Const(c) => DataSet::singleton(Value::Int(c.value), c.ty.bits()),
            Expr::Unop { op, arg } => match op {
                UnOp::Conversion { to } => self.eval(arg).convert(to.bits()),
                UnOp::Not1 => self.eval(arg).not1(1),
            },
            Expr::Binop { op, args } => self.handle_binop(expr, *op, args),
            Expr::CCall { ret_ty, .. } => DataSet::undefined(ret_ty.bits()),
            Expr::ITE {
                cond,
                iftrue,
                iffalse,
            } => self.handle_ite(cond, iftrue, iffalse),
        }
    }

    fn handle_get(&mut self, offset: u64, ty: Ty) -> DataSet {
        let bits = ty.bits();
        let size = u64::from(bits / 8);

        let defs = self.state.register_definitions.get_objects_by_offset(offset);
        let mut values = FxHashSet::default();
        for def in &defs {
            values.extend(def.data.iter().cloned());
        }
        if values.is_empty() {
            values.insert(Value::Undefined);
        }

        let data = DataSet::new(values, bits);
        if data.contains_undefined() {
            info!(
                register = self.arch.register_name(offset).unwrap_or("?"),
                offset,
                ins_addr = ?self.ins_addr,
                "undefined data in a register"
            );
        }

        let loc = self.codeloc();
        self.state
            .add_use(Atom::Register(Register::new(offset, size)), loc);

        data
    }

    fn handle_load(&mut self, addr_expr: &Expr, ty: Ty) -> DataSet {
        let addr = self.eval(addr_expr);
        let bits = ty.bits();
        let size = u64::from(bits / 8);
        let loc = self.codeloc();

        let mut values = FxHashSet::default();
        for a in addr.iter() {
            match a {
                Value::Int(a) => {
                    let defs = self.state.memory_definitions.get_objects_by_offset(*a);
                    if defs.is_empty() {
                        // fall back to the read-only backing memory
                        if let Some(mem) = self.loader.read_bytes(*a, size) {
                            if (size == 4 || size == 8) && mem.len() as u64 == size {
                                values.insert(Value::Int(decode_word(
                                    &mem,
                                    self.arch.memory_endness(),
                                )));
                            }
                        }
                    } else {
                        for def in &defs {
                            values.extend(def.data.iter().cloned());
                        }
                        if values.contains(&Value::Undefined) {
                            info!(ins_addr = ?self.ins_addr, "undefined data in memory at {a:#x}");
                        }
                    }

                    self.state
                        .add_use(Atom::Memory(MemoryLocation::new(*a, size)), loc);
                }
                Value::Undefined => {
                    info!(ins_addr = ?self.ins_addr, "memory address undefined");
                }
                other => {
                    debug!(addr = ?other, "skipping a load through a symbolic address");
                }
            }
        }

        if values.is_empty() {
            values.insert(Value::Undefined);
        }
        DataSet::new(values, bits)
    }

    fn handle_binop(&mut self, expr: &Expr, op: BinOpKind, args: &[Expr; 2]) -> DataSet {
        let bits = self.result_bits(expr);
        let lhs = self.eval(&args[0]);
        let rhs = self.eval(&args[1]);

        match op {
            BinOpKind::Add => &lhs + &rhs,
            BinOpKind::Sub => &lhs - &rhs,
            BinOpKind::And => &lhs & &rhs,
            BinOpKind::Or => &lhs | &rhs,
            BinOpKind::Xor => &lhs ^ &rhs,
            BinOpKind::Shl => &lhs << &rhs,
            BinOpKind::Shr => &lhs >> &rhs,
            BinOpKind::Sar => lhs.sar(&rhs, bits),
            BinOpKind::CmpEQ => lhs.cmp_eq(&rhs, bits),
            BinOpKind::CmpNE => lhs.cmp_ne(&rhs, bits),
            BinOpKind::CmpLT => lhs.cmp_lt(&rhs, bits),
            BinOpKind::CmpORD => lhs.cmp_ord(&rhs, bits),
            other => {
                error!(op = ?other, "unsupported binary operation");
                DataSet::undefined(bits)
            }
        }
    }

    fn handle_ite(&mut self, cond: &Expr, iftrue: &Expr, iffalse: &Expr) -> DataSet {
        let cond = self.eval(cond);
        match cond.as_bool() {
            Some(true) => self.eval(iftrue),
            Some(false) => self.eval(iffalse),
            None => {
                info!(ins_addr = ?self.ins_addr, "could not resolve the condition of an ITE");
                let mut data = self.eval(iftrue);
                let other = self.eval(iffalse);
                data.update(&other);
                data
            }
        }
    }

    //
    // higher level call handling
    //

    fn handle_function(&mut self) {
        if self.current_depth > self.maximum_depth {
            warn!("the analysis reached its maximum call depth");
            return;
        }

        let defs_ip = self
            .state
            .register_definitions
            .get_objects_by_offset(self.arch.ip_offset());
        let mut it = defs_ip.iter();
        let (Some(def), None) = (it.next(), it.next()) else {
            error!(count = defs_ip.len(), "invalid definitions for the instruction pointer");
            return;
        };

        let ip_addr = match def.data.singleton_value() {
            Some(Value::Int(addr)) => *addr,
            Some(other) => {
                error!(value = ?other, "invalid value type for the instruction pointer");
                return;
            }
            None => {
                error!("invalid number of values for the instruction pointer");
                return;
            }
        };

        let mut is_internal = false;
        let mut ext_func_name = None;
        if self.loader.contains_addr(ip_addr) {
            ext_func_name = self.loader.find_plt_stub_name(ip_addr);
            if ext_func_name.is_none() {
                is_internal = true;
            }
        } else if let Some(symbol) = self.loader.find_symbol(ip_addr) {
            ext_func_name = Some(symbol);
        }

        let loc = self.codeloc();
        if let Some(name) = ext_func_name {
            let handled = match &mut self.handler {
                Some(handler) => handler.handle_external(&mut self.state, &name, loc),
                None => false,
            };
            if !handled {
                warn!(func = %name, "no handler for the external function, leaving the state unchanged");
            }
        } else if is_internal {
            match &mut self.handler {
                Some(handler) => {
                    let updated = handler.handle_local_function(
                        &self.state,
                        ip_addr,
                        self.current_depth + 1,
                        self.maximum_depth,
                    );
                    if let Some(new_state) = updated {
                        self.state = new_state;
                    }
                }
                None => {
                    warn!("no handler for local functions, leaving the state unchanged");
                }
            }
        } else {
            warn!("could not find a name for the external function at {ip_addr:#x}");
        }
    }
}

fn decode_word(bytes: &[u8], endness: Endness) -> u64 {
    match (bytes.len(), endness) {
        (4, Endness::Little) => u64::from(u32::from_le_bytes(bytes.try_into().unwrap())),
        (4, Endness::Big) => u64::from(u32::from_be_bytes(bytes.try_into().unwrap())),
        (8, Endness::Little) => u64::from_le_bytes(bytes.try_into().unwrap()),
        (8, Endness::Big) => u64::from_be_bytes(bytes.try_into().unwrap()),
        _ => unreachable!("only full 4 and 8 byte reads are decoded"),
    }
}
