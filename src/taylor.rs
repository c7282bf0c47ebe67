//! Taylor jet code generation.
//!
//! [`JitState::add_taylor_jet`] turns a decomposed ODE system into a single
//! exported function
//!
//! ```text
//! jet_<name>(tape: *mut FP, pars: *const FP, time: *const FP)
//! ```
//!
//! with the tape laid out as `(O+1) x N x B` scalars, row-major over
//! (order, u-index, lane). On entry the first `m x B` values hold the state;
//! on return rows `0..=O` of the first `m` columns hold the normalized
//! Taylor coefficients (`c_k = x^(k)/k!`).
//!
//! The kernel structure follows the recurrences: the order-0 row is filled
//! left to right (state values are already in place, numbers splat,
//! parameters gather, functions run their init capability); for each order
//! `n >= 1` the state columns get row `n` from row `n-1` of their alias
//! target divided by `n`, then every inner column runs its recurrence,
//! reading its arguments' row `n` (already written, arguments precede) and
//! rows `< n` of itself and its partner.
//!
//! Two emission flavors share the same arithmetic, operation for operation:
//!
//! - *unrolled*: every node of every order is a straight-line block, with
//!   literals as immediates; IR size scales as `O*N`.
//! - *compact*: one helper function per node shape, per-node operands in
//!   read-only tables, and per-order loops over the contiguous shape runs
//!   the decomposer sorted; IR size scales as `O * #shapes`.
//!
//! Multi-term sums reduce by iterative halving in both flavors (the compact
//! helpers replay [`crate::sum::pairwise_reduce`]'s order with runtime
//! bounds), so the two flavors produce bitwise-identical tapes.

use std::collections::{HashMap, HashSet};

use cranelift::prelude::*;
use cranelift_jit::JITModule;
use cranelift_module::{DataId, FuncId, Linkage, Module};

use crate::decompose::{shape_of, taylor_decompose, uarg, ArgClass, Shape, TaylorDecomposition, UArg};
use crate::errors::Error;
use crate::expr::{BinaryOp, ExprNode, Expression};
use crate::func::{ConvSource, Recurrence};
use crate::jit::{CodegenCtx, JetDims, JetRecord, JitState, Lanes};
use crate::types::{JetFloat, Precision};

impl JitState {
    /// Adds a jet function for `sys` at order `order` and batch width
    /// `batch`, specialized for the precision `F`. Returns the dimensions
    /// the caller needs to size the tape.
    ///
    /// The function becomes callable after [`JitState::compile`], under the
    /// name given here.
    pub fn add_taylor_jet<F: JetFloat>(
        &mut self,
        name: &str,
        sys: &[(Expression, Expression)],
        order: u32,
        batch: u32,
        compact: bool,
    ) -> Result<JetDims, Error> {
        if order == 0 {
            return Err(Error::InvalidArg(
                "Cannot create a Taylor jet of order zero".to_string(),
            ));
        }
        if batch == 0 {
            return Err(Error::InvalidArg(
                "Cannot create a Taylor jet with zero batch size".to_string(),
            ));
        }
        if self.jets.contains_key(name) {
            return Err(Error::InvalidArg(format!(
                "A jet function named '{name}' was already added to this module"
            )));
        }

        let prec = F::PRECISION;
        let dc = taylor_decompose(sys)?;
        let dc = if compact { dc.sorted_for_compact() } else { dc };

        let dims = JetDims {
            n_state: dc.n_state() as u32,
            n_u: dc.len() as u32,
            order,
            batch,
            n_pars: dc.n_pars(),
        };

        // Resolve every inner function's recurrence up front, so capability
        // gaps surface before any IR is emitted.
        let mut recs = HashMap::new();
        for k in dc.inner_range() {
            if let ExprNode::Func(f) = dc.u_defs()[k].node() {
                if shape_of(&dc.u_defs()[k]) != Shape::Constant {
                    recs.insert(k, f.taylor_recurrence(order, batch, prec, compact)?);
                }
            }
        }

        let emitter = JetEmitter {
            dc: &dc,
            dims,
            recs,
        };

        let symbol = format!("jet_{name}");
        let func_id = if compact {
            emitter.emit_compact(self, &symbol, prec)?
        } else {
            emitter.emit_unrolled(self, &symbol, prec)?
        };

        self.jets.insert(
            name.to_string(),
            JetRecord {
                func_id,
                prec,
                dims,
            },
        );

        Ok(dims)
    }
}

struct JetEmitter<'a> {
    dc: &'a TaylorDecomposition,
    dims: JetDims,
    recs: HashMap<usize, Recurrence>,
}

// Declares and defines one function in the module: signature, entry block
// with parameters, the caller-supplied body, a void return.
fn build_function(
    state: &mut JitState,
    symbol: &str,
    linkage: Linkage,
    param_types: &[Type],
    body: impl FnOnce(
        &mut FunctionBuilder,
        &mut JITModule,
        &HashSet<String>,
        &[Value],
    ) -> Result<(), Error>,
) -> Result<FuncId, Error> {
    let mut sig = state.module.make_signature();
    for t in param_types {
        sig.params.push(AbiParam::new(*t));
    }
    let func_id = state.module.declare_function(symbol, linkage, &sig)?;
    state.ctx.func.signature = sig;
    let body_result;
    {
        let JitState {
            ref mut module,
            ref mut ctx,
            ref mut builder_ctx,
            ref known_symbols,
            ..
        } = *state;
        let mut builder = FunctionBuilder::new(&mut ctx.func, builder_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let params = builder.block_params(entry).to_vec();
        body_result = body(&mut builder, module, known_symbols, &params);
        if body_result.is_ok() {
            builder.ins().return_(&[]);
            builder.finalize();
        }
    }
    if let Err(e) = body_result {
        // The builder was abandoned mid-function; reset both contexts so
        // the state stays usable.
        state.builder_ctx = FunctionBuilderContext::new();
        state.module.clear_context(&mut state.ctx);
        return Err(e);
    }
    let defined = state.module.define_function(func_id, &mut state.ctx);
    state.module.clear_context(&mut state.ctx);
    defined?;
    Ok(func_id)
}

// Per-node operand tables backing compact mode, indexed by u-index.
struct Tables {
    arg0_idx: DataId,
    arg0_num: DataId,
    arg1_idx: DataId,
    arg1_num: DataId,
    extra_idx: DataId,
    sv_kind: DataId,
    sv_idx: DataId,
    sv_num: DataId,
}

impl JetEmitter<'_> {
    fn binary_parts(&self, k: usize) -> Option<(BinaryOp, UArg, UArg)> {
        match self.dc.u_defs()[k].node() {
            ExprNode::Binary(op, l, r) => Some((*op, uarg(l), uarg(r))),
            _ => None,
        }
    }

    fn func_arg(&self, k: usize) -> UArg {
        match self.dc.u_defs()[k].node() {
            ExprNode::Func(f) => f.args().first().map(uarg).unwrap_or(UArg::Num(0.0)),
            _ => unreachable!("not a function node"),
        }
    }

    // ----- shared leaf helpers -------------------------------------------

    // Order-0 value of an operand.
    fn value0(&self, cg: &mut CodegenCtx, arg: UArg) -> Lanes {
        match arg {
            UArg::U(j) => cg.tape_load(0, j),
            UArg::Num(v) => cg.splat(v),
            UArg::Par(p) => cg.par_load(p),
        }
    }

    // Order-n coefficient of an operand: literals and parameters are
    // constant in time, so their higher coefficients vanish.
    fn coeff(&self, cg: &mut CodegenCtx, arg: UArg, order: u32) -> Lanes {
        match arg {
            UArg::U(j) => cg.tape_load(order, j),
            UArg::Num(v) => {
                if order == 0 {
                    cg.splat(v)
                } else {
                    cg.splat(0.0)
                }
            }
            UArg::Par(p) => {
                if order == 0 {
                    cg.par_load(p)
                } else {
                    cg.splat(0.0)
                }
            }
        }
    }

    fn sigma_apply(&self, cg: &mut CodegenCtx, sigma: f64, v: Lanes) -> Lanes {
        if sigma == 1.0 {
            v
        } else if sigma == -1.0 {
            cg.fneg(&v)
        } else {
            let s = cg.splat(sigma);
            cg.fmul(&s, &v)
        }
    }

    // ----- order-0 kernel (shared by both flavors) -----------------------

    fn emit_order0(&self, cg: &mut CodegenCtx) -> Result<(), Error> {
        for k in self.dc.inner_range() {
            let v = match self.dc.u_defs()[k].node() {
                ExprNode::Binary(op, l, r) => {
                    let a = self.value0(cg, uarg(l));
                    let b = self.value0(cg, uarg(r));
                    match op {
                        BinaryOp::Add => cg.fadd(&a, &b),
                        BinaryOp::Sub => cg.fsub(&a, &b),
                        BinaryOp::Mul => cg.fmul(&a, &b),
                        BinaryOp::Div => cg.fdiv(&a, &b),
                    }
                }
                ExprNode::Func(f) => {
                    let args: Vec<Lanes> =
                        f.args().iter().map(|a| self.value0(cg, uarg(a))).collect();
                    f.taylor_init(cg, &args)?
                }
                _ => unreachable!("inner nodes are binary operations or functions"),
            };
            cg.tape_store(0, k as u32, &v);
        }
        Ok(())
    }

    // ----- unrolled flavor -----------------------------------------------

    fn emit_unrolled(
        &self,
        state: &mut JitState,
        symbol: &str,
        prec: Precision,
    ) -> Result<FuncId, Error> {
        let ptr = state.module.target_config().pointer_type();
        build_function(
            state,
            symbol,
            Linkage::Export,
            &[ptr, ptr, ptr],
            |builder, module, known, params| {
                let mut cg = CodegenCtx::new(
                    builder,
                    module,
                    known,
                    prec,
                    self.dims.batch,
                    self.dims.n_u,
                    params[0],
                    params[1],
                    params[2],
                );

                self.emit_order0(&mut cg)?;
                for n in 1..=self.dims.order {
                    self.emit_sv_row_unrolled(&mut cg, n);
                    for k in self.dc.inner_range() {
                        let v = self.emit_node_unrolled(&mut cg, k, n)?;
                        cg.tape_store(n, k as u32, &v);
                    }
                }
                Ok(())
            },
        )
    }

    // State columns: row n is row n-1 of the alias target over n; constant
    // and parameter derivatives contribute at order one only.
    fn emit_sv_row_unrolled(&self, cg: &mut CodegenCtx, n: u32) {
        for i in 0..self.dc.n_state() {
            let v = match uarg(self.dc.alias(i)) {
                UArg::U(j) => {
                    let prev = cg.tape_load(n - 1, j);
                    let nf = cg.splat(f64::from(n));
                    cg.fdiv(&prev, &nf)
                }
                UArg::Num(c) => {
                    if n == 1 {
                        cg.splat(c)
                    } else {
                        cg.splat(0.0)
                    }
                }
                UArg::Par(p) => {
                    if n == 1 {
                        cg.par_load(p)
                    } else {
                        cg.splat(0.0)
                    }
                }
            };
            cg.tape_store(n, i as u32, &v);
        }
    }

    fn emit_node_unrolled(
        &self,
        cg: &mut CodegenCtx,
        k: usize,
        n: u32,
    ) -> Result<Lanes, Error> {
        if shape_of(&self.dc.u_defs()[k]) == Shape::Constant {
            return Ok(cg.splat(0.0));
        }
        if let Some((op, l, r)) = self.binary_parts(k) {
            return Ok(self.emit_binary_unrolled(cg, k as u32, op, l, r, n));
        }
        let rec = self.recs[&k];
        let a = self.func_arg(k);
        let partner = self.dc.partner_of(k as u32);
        Ok(self.emit_func_unrolled(cg, k as u32, rec, a, partner, n))
    }

    fn emit_binary_unrolled(
        &self,
        cg: &mut CodegenCtx,
        k: u32,
        op: BinaryOp,
        l: UArg,
        r: UArg,
        n: u32,
    ) -> Lanes {
        let lu = matches!(l, UArg::U(_));
        let ru = matches!(r, UArg::U(_));
        match op {
            BinaryOp::Add => {
                if lu && ru {
                    let a = self.coeff(cg, l, n);
                    let b = self.coeff(cg, r, n);
                    cg.fadd(&a, &b)
                } else if lu {
                    self.coeff(cg, l, n)
                } else {
                    self.coeff(cg, r, n)
                }
            }
            BinaryOp::Sub => {
                if lu && ru {
                    let a = self.coeff(cg, l, n);
                    let b = self.coeff(cg, r, n);
                    cg.fsub(&a, &b)
                } else if lu {
                    self.coeff(cg, l, n)
                } else {
                    let b = self.coeff(cg, r, n);
                    cg.fneg(&b)
                }
            }
            BinaryOp::Mul => {
                if lu && ru {
                    // Cauchy product: c_n = sum_j a_j * b_{n-j}.
                    let mut terms = Vec::with_capacity(n as usize + 1);
                    for j in 0..=n {
                        let a = self.coeff(cg, l, j);
                        let b = self.coeff(cg, r, n - j);
                        terms.push(cg.fmul(&a, &b));
                    }
                    cg.pairwise(terms).unwrap()
                } else if lu {
                    let a = self.coeff(cg, l, n);
                    let c = self.value0(cg, r);
                    cg.fmul(&a, &c)
                } else {
                    let c = self.value0(cg, l);
                    let b = self.coeff(cg, r, n);
                    cg.fmul(&c, &b)
                }
            }
            BinaryOp::Div => {
                if !ru {
                    let a = self.coeff(cg, l, n);
                    let c = self.value0(cg, r);
                    return cg.fdiv(&a, &c);
                }
                // c_n = (a_n - sum_{j=1..n} b_j * c_{n-j}) / b_0, with the
                // numerator coefficients vanishing for literal numerators.
                let mut terms = Vec::with_capacity(n as usize);
                for j in 1..=n {
                    let b = self.coeff(cg, r, j);
                    let c = cg.tape_load(n - j, k);
                    terms.push(cg.fmul(&b, &c));
                }
                let s = cg.pairwise(terms).unwrap();
                let num = if lu {
                    let a = self.coeff(cg, l, n);
                    cg.fsub(&a, &s)
                } else {
                    cg.fneg(&s)
                };
                let b0 = self.coeff(cg, r, 0);
                cg.fdiv(&num, &b0)
            }
        }
    }

    fn emit_func_unrolled(
        &self,
        cg: &mut CodegenCtx,
        k: u32,
        rec: Recurrence,
        arg: UArg,
        partner: Option<u32>,
        n: u32,
    ) -> Lanes {
        if rec == Recurrence::Time {
            return if n == 1 { cg.splat(1.0) } else { cg.splat(0.0) };
        }
        let a = match arg {
            UArg::U(j) => j,
            // Constant arguments were filtered into the constant shape.
            _ => unreachable!("function recurrences need a u argument"),
        };
        match rec {
            Recurrence::Forward {
                source,
                sigma,
                add_arg,
            } => {
                let p = partner;
                let mut terms = Vec::with_capacity(n as usize);
                for j in 1..=n {
                    let jf = cg.splat(f64::from(j));
                    let aj = cg.tape_load(j, a);
                    let w = cg.fmul(&jf, &aj);
                    let pv = match source {
                        ConvSource::SelfCoeffs => cg.tape_load(n - j, k),
                        ConvSource::Partner => cg.tape_load(n - j, p.unwrap()),
                        ConvSource::SelfMinusPartner => {
                            let s = cg.tape_load(n - j, k);
                            let q = cg.tape_load(n - j, p.unwrap());
                            cg.fsub(&s, &q)
                        }
                    };
                    terms.push(cg.fmul(&w, &pv));
                }
                let s = cg.pairwise(terms).unwrap();
                let nf = cg.splat(f64::from(n));
                let conv = cg.fdiv(&s, &nf);
                let conv = self.sigma_apply(cg, sigma, conv);
                if add_arg {
                    let an = cg.tape_load(n, a);
                    cg.fadd(&an, &conv)
                } else {
                    conv
                }
            }
            Recurrence::Solve { sigma } => {
                let p = partner.unwrap();
                let an = cg.tape_load(n, a);
                let nf = cg.splat(f64::from(n));
                let mut num = cg.fmul(&nf, &an);
                num = self.sigma_apply(cg, sigma, num);
                if n >= 2 {
                    let mut terms = Vec::with_capacity(n as usize - 1);
                    for j in 1..n {
                        let wf = cg.splat(f64::from(n - j));
                        let pj = cg.tape_load(j, p);
                        let w = cg.fmul(&wf, &pj);
                        let b = cg.tape_load(n - j, k);
                        terms.push(cg.fmul(&w, &b));
                    }
                    let s = cg.pairwise(terms).unwrap();
                    num = cg.fsub(&num, &s);
                }
                let p0 = cg.tape_load(0, p);
                let den = cg.fmul(&nf, &p0);
                cg.fdiv(&num, &den)
            }
            Recurrence::Log => {
                let mut num = cg.tape_load(n, a);
                if n >= 2 {
                    let mut terms = Vec::with_capacity(n as usize - 1);
                    for j in 1..n {
                        let jf = cg.splat(f64::from(j));
                        let bj = cg.tape_load(j, k);
                        let w = cg.fmul(&jf, &bj);
                        let anj = cg.tape_load(n - j, a);
                        terms.push(cg.fmul(&w, &anj));
                    }
                    let s = cg.pairwise(terms).unwrap();
                    let nf = cg.splat(f64::from(n));
                    let s = cg.fdiv(&s, &nf);
                    num = cg.fsub(&num, &s);
                }
                let a0 = cg.tape_load(0, a);
                cg.fdiv(&num, &a0)
            }
            Recurrence::Sqrt => {
                let mut num = cg.tape_load(n, a);
                if n >= 2 {
                    let mut terms = Vec::with_capacity(n as usize - 1);
                    for j in 1..n {
                        let bj = cg.tape_load(j, k);
                        let bnj = cg.tape_load(n - j, k);
                        terms.push(cg.fmul(&bj, &bnj));
                    }
                    let s = cg.pairwise(terms).unwrap();
                    num = cg.fsub(&num, &s);
                }
                let two = cg.splat(2.0);
                let b0 = cg.tape_load(0, k);
                let den = cg.fmul(&two, &b0);
                cg.fdiv(&num, &den)
            }
            Recurrence::Pow { alpha } => {
                let al = cg.splat(alpha);
                let mut terms = Vec::with_capacity(n as usize);
                for j in 1..=n {
                    let jf = cg.splat(f64::from(j));
                    let nmj = cg.splat(f64::from(n - j));
                    let aj_w = cg.fmul(&al, &jf);
                    let w = cg.fsub(&aj_w, &nmj);
                    let aj = cg.tape_load(j, a);
                    let wa = cg.fmul(&w, &aj);
                    let bnj = cg.tape_load(n - j, k);
                    terms.push(cg.fmul(&wa, &bnj));
                }
                let s = cg.pairwise(terms).unwrap();
                let nf = cg.splat(f64::from(n));
                let a0 = cg.tape_load(0, a);
                let den = cg.fmul(&nf, &a0);
                cg.fdiv(&s, &den)
            }
            Recurrence::Square => {
                let two = cg.splat(2.0);
                if n % 2 == 1 {
                    let half = (n - 1) / 2;
                    let mut terms = Vec::with_capacity(half as usize + 1);
                    for j in 0..=half {
                        let aj = cg.tape_load(j, a);
                        let anj = cg.tape_load(n - j, a);
                        terms.push(cg.fmul(&aj, &anj));
                    }
                    let s = cg.pairwise(terms).unwrap();
                    cg.fmul(&two, &s)
                } else {
                    let half = n / 2;
                    let mut terms = Vec::with_capacity(half as usize);
                    for j in 0..half {
                        let aj = cg.tape_load(j, a);
                        let anj = cg.tape_load(n - j, a);
                        terms.push(cg.fmul(&aj, &anj));
                    }
                    let s = cg.pairwise(terms).unwrap();
                    let d = cg.fmul(&two, &s);
                    let h = cg.tape_load(half, a);
                    let hh = cg.fmul(&h, &h);
                    cg.fadd(&d, &hh)
                }
            }
            Recurrence::Time => unreachable!("handled above"),
        }
    }

    // ----- compact flavor ------------------------------------------------

    fn emit_compact(
        &self,
        state: &mut JitState,
        symbol: &str,
        prec: Precision,
    ) -> Result<FuncId, Error> {
        let runs = self.compute_runs();

        // One helper per distinct shape.
        let mut helpers: HashMap<Shape, FuncId> = HashMap::new();
        for (shape, range) in &runs {
            if *shape == Shape::Constant || helpers.contains_key(shape) {
                continue;
            }
            let rec = match self.dc.u_defs()[range.start].node() {
                ExprNode::Func(_) => Some(self.recs[&range.start]),
                _ => None,
            };
            let tag = shape_tag(shape);
            let helper_symbol = format!("{symbol}.diff.{tag}");
            let id = self.emit_helper(state, &helper_symbol, prec, shape, rec)?;
            helpers.insert(shape.clone(), id);
        }

        let tables = self.define_tables(state, symbol, prec)?;

        let ptr = state.module.target_config().pointer_type();
        build_function(
            state,
            symbol,
            Linkage::Export,
            &[ptr, ptr, ptr],
            |builder, module, known, params| {
                let mut helper_refs = HashMap::new();
                for (shape, id) in &helpers {
                    let func_ref = module.declare_func_in_func(*id, builder.func);
                    helper_refs.insert(shape.clone(), func_ref);
                }

                let mut cg = CodegenCtx::new(
                    builder,
                    module,
                    known,
                    prec,
                    self.dims.batch,
                    self.dims.n_u,
                    params[0],
                    params[1],
                    params[2],
                );

                self.emit_order0(&mut cg)?;

                for n in 1..=self.dims.order {
                    self.emit_sv_row_compact(&mut cg, &tables, n);
                    for (shape, range) in &runs {
                        let start = cg.iconst(range.start as i64);
                        let end = cg.iconst(range.end as i64);
                        let order = cg.iconst(i64::from(n));
                        if *shape == Shape::Constant {
                            cg.emit_loop(start, end, |cg, k| {
                                let zero = cg.splat(0.0);
                                cg.tape_store_dyn(order, k, &zero);
                            });
                            continue;
                        }
                        let func_ref = helper_refs[shape];
                        cg.emit_loop(start, end, |cg, k| {
                            let a0 = cg.table_load_u32(tables.arg0_idx, k);
                            let a1 = cg.table_load_u32(tables.arg1_idx, k);
                            let extra = cg.table_load_u32(tables.extra_idx, k);
                            let n0 = cg.table_load_fp_scalar(tables.arg0_num, k);
                            let n1 = cg.table_load_fp_scalar(tables.arg1_num, k);
                            let args = [
                                cg.tape_ptr(),
                                cg.pars_ptr(),
                                cg.time_ptr(),
                                order,
                                k,
                                a0,
                                a1,
                                extra,
                                n0,
                                n1,
                            ];
                            cg.builder.ins().call(func_ref, &args);
                        });
                    }
                }
                Ok(())
            },
        )
    }

    fn compute_runs(&self) -> Vec<(Shape, std::ops::Range<usize>)> {
        let mut runs: Vec<(Shape, std::ops::Range<usize>)> = Vec::new();
        for k in self.dc.inner_range() {
            let shape = shape_of(&self.dc.u_defs()[k]);
            match runs.last_mut() {
                Some((s, range)) if *s == shape && range.end == k => range.end = k + 1,
                _ => runs.push((shape, k..k + 1)),
            }
        }
        runs
    }

    fn define_tables(
        &self,
        state: &mut JitState,
        symbol: &str,
        prec: Precision,
    ) -> Result<Tables, Error> {
        let n = self.dc.len();
        let m = self.dc.n_state();
        let mut arg0_idx = vec![0u32; n];
        let mut arg0_num = vec![0f64; n];
        let mut arg1_idx = vec![0u32; n];
        let mut arg1_num = vec![0f64; n];
        let mut extra_idx = vec![0u32; n];

        let fill = |arg: UArg, idx: &mut u32, num: &mut f64| match arg {
            UArg::U(j) => *idx = j,
            UArg::Par(p) => *idx = p,
            UArg::Num(v) => *num = v,
        };

        for k in self.dc.inner_range() {
            match self.dc.u_defs()[k].node() {
                ExprNode::Binary(_, l, r) => {
                    fill(uarg(l), &mut arg0_idx[k], &mut arg0_num[k]);
                    fill(uarg(r), &mut arg1_idx[k], &mut arg1_num[k]);
                }
                ExprNode::Func(f) => {
                    if let Some(a) = f.args().first() {
                        fill(uarg(a), &mut arg0_idx[k], &mut arg0_num[k]);
                    }
                    if let Some(a) = f.args().get(1) {
                        fill(uarg(a), &mut arg1_idx[k], &mut arg1_num[k]);
                    }
                    if let Some(p) = self.dc.partner_of(k as u32) {
                        extra_idx[k] = p;
                    }
                }
                _ => unreachable!("inner nodes are binary operations or functions"),
            }
        }

        let mut sv_kind = vec![0u32; m];
        let mut sv_idx = vec![0u32; m];
        let mut sv_num = vec![0f64; m];
        for i in 0..m {
            match uarg(self.dc.alias(i)) {
                UArg::U(j) => {
                    sv_kind[i] = 0;
                    sv_idx[i] = j;
                }
                UArg::Num(v) => {
                    sv_kind[i] = 1;
                    sv_num[i] = v;
                }
                UArg::Par(p) => {
                    sv_kind[i] = 2;
                    sv_idx[i] = p;
                }
            }
        }

        Ok(Tables {
            arg0_idx: state.define_u32_table(&format!("{symbol}.arg0i"), &arg0_idx)?,
            arg0_num: state.define_fp_table(&format!("{symbol}.arg0n"), &arg0_num, prec)?,
            arg1_idx: state.define_u32_table(&format!("{symbol}.arg1i"), &arg1_idx)?,
            arg1_num: state.define_fp_table(&format!("{symbol}.arg1n"), &arg1_num, prec)?,
            extra_idx: state.define_u32_table(&format!("{symbol}.extrai"), &extra_idx)?,
            sv_kind: state.define_u32_table(&format!("{symbol}.svk"), &sv_kind)?,
            sv_idx: state.define_u32_table(&format!("{symbol}.svi"), &sv_idx)?,
            sv_num: state.define_fp_table(&format!("{symbol}.svn"), &sv_num, prec)?,
        })
    }

    fn emit_sv_row_compact(&self, cg: &mut CodegenCtx, tables: &Tables, n: u32) {
        let m = cg.iconst(self.dc.n_state() as i64);
        let zero_i = cg.iconst(0);
        let order = cg.iconst(i64::from(n));
        cg.emit_loop(zero_i, m, |cg, i| {
            let kind = cg.table_load_u32(tables.sv_kind, i);
            let is_var = cg.builder.ins().icmp_imm(IntCC::Equal, kind, 0);
            let v = cg.emit_if_else_lanes(
                is_var,
                |cg| {
                    let j = cg.table_load_u32(tables.sv_idx, i);
                    let prev_row = cg.builder.ins().iadd_imm(order, -1);
                    let prev = cg.tape_load_dyn(prev_row, j);
                    let nf = cg.splat(f64::from(n));
                    cg.fdiv(&prev, &nf)
                },
                |cg| {
                    if n == 1 {
                        let is_num = cg.builder.ins().icmp_imm(IntCC::Equal, kind, 1);
                        cg.emit_if_else_lanes(
                            is_num,
                            |cg| cg.table_load_fp(tables.sv_num, i),
                            |cg| {
                                let p = cg.table_load_u32(tables.sv_idx, i);
                                cg.par_load_dyn(p)
                            },
                        )
                    } else {
                        cg.splat(0.0)
                    }
                },
            );
            cg.tape_store_dyn(order, i, &v);
        });
    }

    /// Emits the per-shape helper: `(tape, pars, time, order, u_idx, a0,
    /// a1, extra, num0, num1)`, writing row `order` of column `u_idx`.
    fn emit_helper(
        &self,
        state: &mut JitState,
        symbol: &str,
        prec: Precision,
        shape: &Shape,
        rec: Option<Recurrence>,
    ) -> Result<FuncId, Error> {
        let ptr = state.module.target_config().pointer_type();
        let fp = prec.fp_type();
        let param_types = [
            ptr,
            ptr,
            ptr,
            types::I64,
            types::I64,
            types::I64,
            types::I64,
            types::I64,
            fp,
            fp,
        ];
        build_function(
            state,
            symbol,
            Linkage::Local,
            &param_types,
            |builder, module, known, params| {
                let mut cg = CodegenCtx::new(
                    builder,
                    module,
                    known,
                    prec,
                    self.dims.batch,
                    self.dims.n_u,
                    params[0],
                    params[1],
                    params[2],
                );
                let h = HelperArgs {
                    order: params[3],
                    u_idx: params[4],
                    a0: params[5],
                    a1: params[6],
                    extra: params[7],
                    num0: params[8],
                    num1: params[9],
                };

                match shape {
                    Shape::Binary(op, cl, cr) => {
                        self.emit_binary_helper_body(&mut cg, &h, *op, *cl, *cr)
                    }
                    Shape::Func(_) => self.emit_func_helper_body(&mut cg, &h, rec.unwrap()),
                    Shape::Constant => unreachable!("constant shapes are inlined"),
                }
                Ok(())
            },
        )
    }

    fn emit_binary_helper_body(
        &self,
        cg: &mut CodegenCtx,
        h: &HelperArgs,
        op: BinaryOp,
        cl: ArgClass,
        cr: ArgClass,
    ) {
        let n = h.order;
        let batch = cg.batch() as usize;
        // Order-n coefficient of the constant-class operand is zero; its
        // order-0 value is what the multiplicative shapes need.
        let const_value0 = |cg: &mut CodegenCtx, class: ArgClass, idx: Value, num: Value| match class
        {
            ArgClass::Num => Lanes(vec![num; batch]),
            ArgClass::Par => cg.par_load_dyn(idx),
            ArgClass::U => unreachable!("constant operand expected"),
        };

        let v = match op {
            BinaryOp::Add => match (cl, cr) {
                (ArgClass::U, ArgClass::U) => {
                    let a = cg.tape_load_dyn(n, h.a0);
                    let b = cg.tape_load_dyn(n, h.a1);
                    cg.fadd(&a, &b)
                }
                (ArgClass::U, _) => cg.tape_load_dyn(n, h.a0),
                _ => cg.tape_load_dyn(n, h.a1),
            },
            BinaryOp::Sub => match (cl, cr) {
                (ArgClass::U, ArgClass::U) => {
                    let a = cg.tape_load_dyn(n, h.a0);
                    let b = cg.tape_load_dyn(n, h.a1);
                    cg.fsub(&a, &b)
                }
                (ArgClass::U, _) => cg.tape_load_dyn(n, h.a0),
                _ => {
                    let b = cg.tape_load_dyn(n, h.a1);
                    cg.fneg(&b)
                }
            },
            BinaryOp::Mul => match (cl, cr) {
                (ArgClass::U, ArgClass::U) => {
                    // Per-lane Cauchy convolution over a scratch array,
                    // reduced by iterative halving.
                    let len_plus = cg.builder.ins().iadd_imm(n, 1);
                    let scratch = cg.scratch_array(self.dims.order + 1);
                    let mut lanes = Vec::with_capacity(batch);
                    for b in 0..batch {
                        let zero = cg.iconst(0);
                        cg.emit_loop(zero, len_plus, |cg, j| {
                            let nmj = cg.builder.ins().isub(n, j);
                            let aj = cg.tape_load_dyn_lane(j, h.a0, b);
                            let bnj = cg.tape_load_dyn_lane(nmj, h.a1, b);
                            let t = cg.builder.ins().fmul(aj, bnj);
                            cg.scratch_store(scratch, j, t);
                        });
                        lanes.push(cg.emit_pairwise_dyn(scratch, len_plus));
                    }
                    Lanes(lanes)
                }
                (ArgClass::U, _) => {
                    let a = cg.tape_load_dyn(n, h.a0);
                    let c = const_value0(cg, cr, h.a1, h.num1);
                    cg.fmul(&a, &c)
                }
                _ => {
                    let c = const_value0(cg, cl, h.a0, h.num0);
                    let b = cg.tape_load_dyn(n, h.a1);
                    cg.fmul(&c, &b)
                }
            },
            BinaryOp::Div => {
                if cr != ArgClass::U {
                    let a = cg.tape_load_dyn(n, h.a0);
                    let c = const_value0(cg, cr, h.a1, h.num1);
                    cg.fdiv(&a, &c)
                } else {
                    let scratch = cg.scratch_array(self.dims.order + 1);
                    let mut lanes = Vec::with_capacity(batch);
                    for b in 0..batch {
                        let one = cg.iconst(1);
                        let len_plus = cg.builder.ins().iadd_imm(n, 1);
                        cg.emit_loop(one, len_plus, |cg, j| {
                            let nmj = cg.builder.ins().isub(n, j);
                            let bj = cg.tape_load_dyn_lane(j, h.a1, b);
                            let cnj = cg.tape_load_dyn_lane(nmj, h.u_idx, b);
                            let t = cg.builder.ins().fmul(bj, cnj);
                            let jm1 = cg.builder.ins().iadd_imm(j, -1);
                            cg.scratch_store(scratch, jm1, t);
                        });
                        let s = cg.emit_pairwise_dyn(scratch, n);
                        let num = if cl == ArgClass::U {
                            let an = cg.tape_load_dyn_lane(n, h.a0, b);
                            cg.builder.ins().fsub(an, s)
                        } else {
                            cg.builder.ins().fneg(s)
                        };
                        let zero = cg.iconst(0);
                        let b0 = cg.tape_load_dyn_lane(zero, h.a1, b);
                        lanes.push(cg.builder.ins().fdiv(num, b0));
                    }
                    Lanes(lanes)
                }
            }
        };
        cg.tape_store_dyn(n, h.u_idx, &v);
    }

    fn emit_func_helper_body(&self, cg: &mut CodegenCtx, h: &HelperArgs, rec: Recurrence) {
        let n = h.order;
        let batch = cg.batch() as usize;
        let nf = cg.fcvt(n);
        let one_i = cg.iconst(1);
        let zero_i = cg.iconst(0);

        let v = match rec {
            Recurrence::Forward {
                source,
                sigma,
                add_arg,
            } => {
                let scratch = cg.scratch_array(self.dims.order + 1);
                let len_plus = cg.builder.ins().iadd_imm(n, 1);
                let mut lanes = Vec::with_capacity(batch);
                for b in 0..batch {
                    cg.emit_loop(one_i, len_plus, |cg, j| {
                        let jf = cg.fcvt(j);
                        let aj = cg.tape_load_dyn_lane(j, h.a0, b);
                        let w = cg.builder.ins().fmul(jf, aj);
                        let nmj = cg.builder.ins().isub(n, j);
                        let pv = match source {
                            ConvSource::SelfCoeffs => cg.tape_load_dyn_lane(nmj, h.u_idx, b),
                            ConvSource::Partner => cg.tape_load_dyn_lane(nmj, h.extra, b),
                            ConvSource::SelfMinusPartner => {
                                let s = cg.tape_load_dyn_lane(nmj, h.u_idx, b);
                                let q = cg.tape_load_dyn_lane(nmj, h.extra, b);
                                cg.builder.ins().fsub(s, q)
                            }
                        };
                        let t = cg.builder.ins().fmul(w, pv);
                        let jm1 = cg.builder.ins().iadd_imm(j, -1);
                        cg.scratch_store(scratch, jm1, t);
                    });
                    let s = cg.emit_pairwise_dyn(scratch, n);
                    let mut conv = cg.builder.ins().fdiv(s, nf);
                    conv = self.sigma_apply_scalar(cg, sigma, conv);
                    if add_arg {
                        let an = cg.tape_load_dyn_lane(n, h.a0, b);
                        conv = cg.builder.ins().fadd(an, conv);
                    }
                    lanes.push(conv);
                }
                Lanes(lanes)
            }
            Recurrence::Solve { sigma } => {
                let scratch = cg.scratch_array(self.dims.order + 1);
                let has_sum = cg.builder.ins().icmp_imm(IntCC::SignedGreaterThan, n, 1);
                let mut lanes = Vec::with_capacity(batch);
                for b in 0..batch {
                    let an = cg.tape_load_dyn_lane(n, h.a0, b);
                    let num0 = cg.builder.ins().fmul(nf, an);
                    let num0 = self.sigma_apply_scalar(cg, sigma, num0);
                    let num = cg.emit_if_else_scalar(
                        has_sum,
                        |cg| {
                            cg.emit_loop(one_i, n, |cg, j| {
                                let nmj = cg.builder.ins().isub(n, j);
                                let wf = cg.fcvt(nmj);
                                let pj = cg.tape_load_dyn_lane(j, h.extra, b);
                                let w = cg.builder.ins().fmul(wf, pj);
                                let bnj = cg.tape_load_dyn_lane(nmj, h.u_idx, b);
                                let t = cg.builder.ins().fmul(w, bnj);
                                let jm1 = cg.builder.ins().iadd_imm(j, -1);
                                cg.scratch_store(scratch, jm1, t);
                            });
                            let nm1 = cg.builder.ins().iadd_imm(n, -1);
                            let s = cg.emit_pairwise_dyn(scratch, nm1);
                            cg.builder.ins().fsub(num0, s)
                        },
                        |_| num0,
                    );
                    let p0 = cg.tape_load_dyn_lane(zero_i, h.extra, b);
                    let den = cg.builder.ins().fmul(nf, p0);
                    lanes.push(cg.builder.ins().fdiv(num, den));
                }
                Lanes(lanes)
            }
            Recurrence::Log => {
                let scratch = cg.scratch_array(self.dims.order + 1);
                let has_sum = cg.builder.ins().icmp_imm(IntCC::SignedGreaterThan, n, 1);
                let mut lanes = Vec::with_capacity(batch);
                for b in 0..batch {
                    let an = cg.tape_load_dyn_lane(n, h.a0, b);
                    let num = cg.emit_if_else_scalar(
                        has_sum,
                        |cg| {
                            cg.emit_loop(one_i, n, |cg, j| {
                                let jf = cg.fcvt(j);
                                let bj = cg.tape_load_dyn_lane(j, h.u_idx, b);
                                let w = cg.builder.ins().fmul(jf, bj);
                                let nmj = cg.builder.ins().isub(n, j);
                                let anj = cg.tape_load_dyn_lane(nmj, h.a0, b);
                                let t = cg.builder.ins().fmul(w, anj);
                                let jm1 = cg.builder.ins().iadd_imm(j, -1);
                                cg.scratch_store(scratch, jm1, t);
                            });
                            let nm1 = cg.builder.ins().iadd_imm(n, -1);
                            let s = cg.emit_pairwise_dyn(scratch, nm1);
                            let s = cg.builder.ins().fdiv(s, nf);
                            cg.builder.ins().fsub(an, s)
                        },
                        |_| an,
                    );
                    let a0 = cg.tape_load_dyn_lane(zero_i, h.a0, b);
                    lanes.push(cg.builder.ins().fdiv(num, a0));
                }
                Lanes(lanes)
            }
            Recurrence::Sqrt => {
                let scratch = cg.scratch_array(self.dims.order + 1);
                let has_sum = cg.builder.ins().icmp_imm(IntCC::SignedGreaterThan, n, 1);
                let two = cg.fconst(2.0);
                let mut lanes = Vec::with_capacity(batch);
                for b in 0..batch {
                    let an = cg.tape_load_dyn_lane(n, h.a0, b);
                    let num = cg.emit_if_else_scalar(
                        has_sum,
                        |cg| {
                            cg.emit_loop(one_i, n, |cg, j| {
                                let bj = cg.tape_load_dyn_lane(j, h.u_idx, b);
                                let nmj = cg.builder.ins().isub(n, j);
                                let bnj = cg.tape_load_dyn_lane(nmj, h.u_idx, b);
                                let t = cg.builder.ins().fmul(bj, bnj);
                                let jm1 = cg.builder.ins().iadd_imm(j, -1);
                                cg.scratch_store(scratch, jm1, t);
                            });
                            let nm1 = cg.builder.ins().iadd_imm(n, -1);
                            let s = cg.emit_pairwise_dyn(scratch, nm1);
                            cg.builder.ins().fsub(an, s)
                        },
                        |_| an,
                    );
                    let b0 = cg.tape_load_dyn_lane(zero_i, h.u_idx, b);
                    let den = cg.builder.ins().fmul(two, b0);
                    lanes.push(cg.builder.ins().fdiv(num, den));
                }
                Lanes(lanes)
            }
            Recurrence::Pow { .. } => {
                // The exponent comes from the per-node table, not the
                // representative recurrence.
                let alpha = h.num1;
                let scratch = cg.scratch_array(self.dims.order + 1);
                let len_plus = cg.builder.ins().iadd_imm(n, 1);
                let mut lanes = Vec::with_capacity(batch);
                for b in 0..batch {
                    cg.emit_loop(one_i, len_plus, |cg, j| {
                        let jf = cg.fcvt(j);
                        let nmj = cg.builder.ins().isub(n, j);
                        let nmjf = cg.fcvt(nmj);
                        let aw = cg.builder.ins().fmul(alpha, jf);
                        let w = cg.builder.ins().fsub(aw, nmjf);
                        let aj = cg.tape_load_dyn_lane(j, h.a0, b);
                        let wa = cg.builder.ins().fmul(w, aj);
                        let bnj = cg.tape_load_dyn_lane(nmj, h.u_idx, b);
                        let t = cg.builder.ins().fmul(wa, bnj);
                        let jm1 = cg.builder.ins().iadd_imm(j, -1);
                        cg.scratch_store(scratch, jm1, t);
                    });
                    let s = cg.emit_pairwise_dyn(scratch, n);
                    let a0 = cg.tape_load_dyn_lane(zero_i, h.a0, b);
                    let den = cg.builder.ins().fmul(nf, a0);
                    lanes.push(cg.builder.ins().fdiv(s, den));
                }
                Lanes(lanes)
            }
            Recurrence::Square => {
                let scratch = cg.scratch_array(self.dims.order + 1);
                let two = cg.fconst(2.0);
                let half = cg.builder.ins().ushr_imm(n, 1);
                let odd_bit = cg.builder.ins().band_imm(n, 1);
                let is_odd = cg.builder.ins().icmp_imm(IntCC::NotEqual, odd_bit, 0);
                let mut lanes = Vec::with_capacity(batch);
                for b in 0..batch {
                    let v = cg.emit_if_else_scalar(
                        is_odd,
                        |cg| {
                            // j = 0..=half, doubled.
                            let hp1 = cg.builder.ins().iadd_imm(half, 1);
                            cg.emit_loop(zero_i, hp1, |cg, j| {
                                let aj = cg.tape_load_dyn_lane(j, h.a0, b);
                                let nmj = cg.builder.ins().isub(n, j);
                                let anj = cg.tape_load_dyn_lane(nmj, h.a0, b);
                                let t = cg.builder.ins().fmul(aj, anj);
                                cg.scratch_store(scratch, j, t);
                            });
                            let hp1 = cg.builder.ins().iadd_imm(half, 1);
                            let s = cg.emit_pairwise_dyn(scratch, hp1);
                            cg.builder.ins().fmul(two, s)
                        },
                        |cg| {
                            // j = 0..half doubled, plus the middle square.
                            cg.emit_loop(zero_i, half, |cg, j| {
                                let aj = cg.tape_load_dyn_lane(j, h.a0, b);
                                let nmj = cg.builder.ins().isub(n, j);
                                let anj = cg.tape_load_dyn_lane(nmj, h.a0, b);
                                let t = cg.builder.ins().fmul(aj, anj);
                                cg.scratch_store(scratch, j, t);
                            });
                            let s = cg.emit_pairwise_dyn(scratch, half);
                            let d = cg.builder.ins().fmul(two, s);
                            let hl = cg.tape_load_dyn_lane(half, h.a0, b);
                            let hh = cg.builder.ins().fmul(hl, hl);
                            cg.builder.ins().fadd(d, hh)
                        },
                    );
                    lanes.push(v);
                }
                Lanes(lanes)
            }
            Recurrence::Time => {
                let is_one = cg.builder.ins().icmp_imm(IntCC::Equal, n, 1);
                let one_f = cg.fconst(1.0);
                let zero_f = cg.fconst(0.0);
                let v = cg.builder.ins().select(is_one, one_f, zero_f);
                Lanes(vec![v; batch])
            }
        };
        cg.tape_store_dyn(n, h.u_idx, &v);
    }

    fn sigma_apply_scalar(&self, cg: &mut CodegenCtx, sigma: f64, v: Value) -> Value {
        if sigma == 1.0 {
            v
        } else if sigma == -1.0 {
            cg.builder.ins().fneg(v)
        } else {
            let s = cg.fconst(sigma);
            cg.builder.ins().fmul(s, v)
        }
    }
}

struct HelperArgs {
    order: Value,
    u_idx: Value,
    a0: Value,
    a1: Value,
    extra: Value,
    num0: Value,
    num1: Value,
}

fn shape_tag(shape: &Shape) -> String {
    fn class_tag(c: ArgClass) -> &'static str {
        match c {
            ArgClass::U => "u",
            ArgClass::Num => "n",
            ArgClass::Par => "p",
        }
    }
    match shape {
        Shape::Binary(op, l, r) => {
            let op = match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::Div => "div",
            };
            format!("{op}_{}{}", class_tag(*l), class_tag(*r))
        }
        Shape::Func(name) => name.clone(),
        Shape::Constant => "const".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{num, par, var};
    use crate::math::{
        acosh, asin, atanh, cos, cosh, erf, exp, log, pow, sigmoid, sin, sinh, sqrt, square, tan,
        tanh, time,
    };
    use std::collections::HashMap;

    struct Jet {
        state: JitState,
        dims: JetDims,
    }

    fn compile_jet(
        sys: &[(Expression, Expression)],
        order: u32,
        batch: u32,
        compact: bool,
    ) -> Jet {
        let mut state = JitState::new().unwrap();
        let dims = state
            .add_taylor_jet::<f64>("jet", sys, order, batch, compact)
            .unwrap();
        state.compile().unwrap();
        Jet { state, dims }
    }

    impl Jet {
        // Runs the jet from lane-interleaved initial state; zero time and
        // parameters unless given.
        fn run(&self, init: &[f64], pars: &[f64], time: &[f64]) -> Vec<f64> {
            let jet = self.state.fetch_jet::<f64>("jet").unwrap();
            let mut tape = vec![0.0; self.dims.tape_len()];
            tape[..init.len()].copy_from_slice(init);
            jet.call(&mut tape, pars, time).unwrap();
            tape
        }

        // State coefficient of order `n`, variable `i`, lane `b`.
        fn c(&self, tape: &[f64], n: u32, i: u32, b: u32) -> f64 {
            tape[((n * self.dims.n_u + i) * self.dims.batch + b) as usize]
        }
    }

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
    }

    #[test]
    fn folded_constant_rhs_order_one() {
        // x' = 2*3 (folds to 6), y' = x + y.
        let x = var("x");
        let y = var("y");
        let sys = vec![
            (x.clone(), num(2.0) * num(3.0)),
            (y.clone(), x.clone() + y.clone()),
        ];
        let jet = compile_jet(&sys, 1, 1, false);
        let tape = jet.run(&[2.0, 3.0], &[], &[0.0]);
        assert_eq!(jet.c(&tape, 0, 0, 0), 2.0);
        assert_eq!(jet.c(&tape, 0, 1, 0), 3.0);
        assert_eq!(jet.c(&tape, 1, 0, 0), 6.0);
        assert_eq!(jet.c(&tape, 1, 1, 0), 5.0);
    }

    #[test]
    fn folded_constant_rhs_order_two() {
        let x = var("x");
        let y = var("y");
        let sys = vec![
            (x.clone(), num(2.0) * num(3.0)),
            (y.clone(), x.clone() + y.clone()),
        ];
        let jet = compile_jet(&sys, 2, 1, false);
        let tape = jet.run(&[2.0, 3.0], &[], &[0.0]);
        assert_eq!(jet.c(&tape, 1, 0, 0), 6.0);
        assert_eq!(jet.c(&tape, 1, 1, 0), 5.0);
        assert_eq!(jet.c(&tape, 2, 0, 0), 0.0);
        assert_eq!(jet.c(&tape, 2, 1, 0), 0.5 * (6.0 + 5.0));
    }

    #[test]
    fn harmonic_oscillator_order_three_batch_three() {
        // x' = 2y, y' = -4x: c_{x,n} = 2 c_{y,n-1} / n, c_{y,n} = -4 c_{x,n-1} / n.
        let x = var("x");
        let y = var("y");
        let sys = vec![
            (x.clone(), num(2.0) * y.clone()),
            (y.clone(), num(-4.0) * x.clone()),
        ];
        let jet = compile_jet(&sys, 3, 3, false);
        let init = [2.0, -1.0, 0.0, 3.0, 4.0, -5.0];
        let tape = jet.run(&init, &[], &[0.0; 3]);

        for b in 0..3u32 {
            let mut cx = vec![init[b as usize]];
            let mut cy = vec![init[3 + b as usize]];
            for n in 1..=3usize {
                cx.push(2.0 * cy[n - 1] / n as f64);
                cy.push(-4.0 * cx[n - 1] / n as f64);
            }
            for n in 0..=3u32 {
                assert!(
                    close(jet.c(&tape, n, 0, b), cx[n as usize], 1e-15),
                    "x lane {b} order {n}"
                );
                assert!(
                    close(jet.c(&tape, n, 1, b), cy[n as usize], 1e-15),
                    "y lane {b} order {n}"
                );
            }
        }
    }

    #[test]
    fn variable_product_order_two_batch_two() {
        // x' = x*y, y' = y*x.
        let x = var("x");
        let y = var("y");
        let sys = vec![
            (x.clone(), x.clone() * y.clone()),
            (y.clone(), y.clone() * x.clone()),
        ];
        let jet = compile_jet(&sys, 2, 2, false);
        let init = [2.0, 1.0, 3.0, -4.0];
        let tape = jet.run(&init, &[], &[0.0; 2]);

        for b in 0..2u32 {
            let (x0, y0) = (init[b as usize], init[2 + b as usize]);
            let c1x = x0 * y0;
            let c1y = y0 * x0;
            assert!(close(jet.c(&tape, 1, 0, b), c1x, 1e-15));
            assert!(close(jet.c(&tape, 1, 1, b), c1y, 1e-15));
            // (xy)_1 = x0*c1y + c1x*y0, then the state update divides by 2.
            let c2 = 0.5 * (x0 * c1y + c1x * y0);
            assert!(close(jet.c(&tape, 2, 0, b), c2, 1e-15));
            assert!(close(jet.c(&tape, 2, 1, b), c2, 1e-15));
        }
    }

    #[test]
    fn time_node_coefficients() {
        // x' = t: c_1 = t0, c_2 = 1/2, higher orders vanish.
        let x = var("x");
        let sys = vec![(x.clone(), time())];
        let jet = compile_jet(&sys, 3, 1, false);
        let tape = jet.run(&[7.0], &[], &[0.5]);
        assert_eq!(jet.c(&tape, 1, 0, 0), 0.5);
        assert_eq!(jet.c(&tape, 2, 0, 0), 0.5);
        assert_eq!(jet.c(&tape, 3, 0, 0), 0.0);
    }

    // A system touching every registered function and binary shape.
    fn rich_system() -> (Vec<(Expression, Expression)>, Vec<f64>) {
        let x = var("x");
        let y = var("y");
        let z = var("z");
        let rhs_x = sin(x.clone()) * cos(y.clone()) + erf(x.clone()) - sigmoid(y.clone())
            + par(0) * y.clone()
            + num(0.1) / (num(2.0) + x.clone());
        let rhs_y = exp(x.clone()) / (num(2.0) + square(x.clone()))
            + log(num(1.0) + square(y.clone())) * sqrt(num(4.0) + x.clone())
            + pow(num(2.0) + square(x.clone()), num(-1.5))
            + tan(x.clone())
            + sinh(z.clone()) * cosh(z.clone());
        let rhs_z = asin(z.clone()) + atanh(z.clone()) + tanh(y.clone())
            + acosh(num(2.0) + square(z.clone()))
            + num(3.0) * z.clone()
            - z.clone() / (num(1.0) + square(y.clone()));
        let sys = vec![(x, rhs_x), (y, rhs_y), (z, rhs_z)];
        let pars = vec![0.75];
        (sys, pars)
    }

    // Independent oracle: symbolic time derivatives, evaluated and scaled
    // by factorials.
    fn symbolic_coefficients(
        sys: &[(Expression, Expression)],
        state0: &[f64],
        pars: &[f64],
        order: u32,
    ) -> Vec<Vec<f64>> {
        let names: Vec<String> = sys
            .iter()
            .map(|(lhs, _)| lhs.to_string())
            .collect();
        let mut vars = HashMap::new();
        for (name, v) in names.iter().zip(state0) {
            vars.insert(name.clone(), *v);
        }

        let mut rows = vec![state0.to_vec()];
        let mut derivs: Vec<Expression> = sys.iter().map(|(_, rhs)| rhs.clone()).collect();
        let mut factorial = 1.0;
        for n in 1..=order {
            factorial *= f64::from(n);
            rows.push(
                derivs
                    .iter()
                    .map(|d| d.eval(&vars, pars, 0.0).unwrap() / factorial)
                    .collect(),
            );
            if n < order {
                derivs = derivs
                    .iter()
                    .map(|d| {
                        let mut next = num(0.0);
                        for (name, (_, rhs)) in names.iter().zip(sys) {
                            next = next + d.diff(name).unwrap() * rhs.clone();
                        }
                        next
                    })
                    .collect();
            }
        }
        rows
    }

    #[test]
    fn jet_matches_the_symbolic_oracle() {
        let (sys, pars) = rich_system();
        let init = [0.5, 0.25, 0.3];
        let order = 4;
        let jet = compile_jet(&sys, order, 1, false);
        let tape = jet.run(&init, &pars, &[0.0]);
        let expected = symbolic_coefficients(&sys, &init, &pars, order);
        for n in 0..=order {
            for i in 0..3u32 {
                let got = jet.c(&tape, n, i, 0);
                let want = expected[n as usize][i as usize];
                assert!(
                    close(got, want, 1e-12),
                    "order {n} state {i}: {got} vs {want}"
                );
            }
        }
    }

    #[test]
    fn lanes_are_independent_under_permutation() {
        let (sys, _) = rich_system();
        let order = 5;
        let batch = 4u32;
        let jet = compile_jet(&sys, order, batch, false);

        let lanes: [[f64; 3]; 4] = [
            [0.5, 0.25, 0.3],
            [0.7, -0.3, -0.2],
            [0.1, 0.9, 0.05],
            [0.33, 0.41, -0.37],
        ];
        let perm = [2usize, 0, 3, 1];

        let pack = |order_of: &dyn Fn(usize) -> usize| -> Vec<f64> {
            let mut init = Vec::new();
            for i in 0..3 {
                for b in 0..4 {
                    init.push(lanes[order_of(b)][i]);
                }
            }
            init
        };

        let pars_base: Vec<f64> = vec![0.75, 0.5, 0.25, 1.5];
        let pars_perm: Vec<f64> = perm.iter().map(|&p| pars_base[p]).collect();

        let t = jet.run(&pack(&|b| b), &pars_base, &[0.0; 4]);
        let t_perm = jet.run(&pack(&|b| perm[b]), &pars_perm, &[0.0; 4]);

        for n in 0..=order {
            for i in 0..3u32 {
                for b in 0..4u32 {
                    let a = jet.c(&t, n, i, perm[b as usize] as u32);
                    let p = jet.c(&t_perm, n, i, b);
                    assert_eq!(a.to_bits(), p.to_bits(), "order {n} state {i} lane {b}");
                }
            }
        }
    }

    #[test]
    fn unrolled_and_compact_agree_bitwise() {
        let (sys, pars) = rich_system();
        let order = 6;
        let batch = 2u32;
        let unrolled = compile_jet(&sys, order, batch, false);
        let compact = compile_jet(&sys, order, batch, true);

        let init = [0.5, 0.7, 0.25, -0.3, 0.3, -0.2];
        let pars2 = [pars[0], 1.25];
        let times = [0.0, 0.0];
        let t_u = unrolled.run(&init, &pars2, &times);
        let t_c = compact.run(&init, &pars2, &times);

        for n in 0..=order {
            for i in 0..3u32 {
                for b in 0..batch {
                    let a = unrolled.c(&t_u, n, i, b);
                    let c = compact.c(&t_c, n, i, b);
                    assert_eq!(
                        a.to_bits(),
                        c.to_bits(),
                        "order {n} state {i} lane {b}: {a} vs {c}"
                    );
                }
            }
        }
    }

    #[test]
    fn parameters_and_divisions_in_compact_mode() {
        // Exercises the par-operand binary shapes and the division
        // recurrence through both flavors.
        let x = var("x");
        let y = var("y");
        let sys = vec![
            (x.clone(), par(0) / y.clone() + num(3.0) / y.clone()),
            (y.clone(), x.clone() / (num(1.0) + square(x.clone())) - par(1) * x.clone()),
        ];
        let init = [1.5, 2.0];
        let pars = [0.5, 0.25];
        let order = 5;
        let unrolled = compile_jet(&sys, order, 1, false);
        let compact = compile_jet(&sys, order, 1, true);
        let t_u = unrolled.run(&init, &pars, &[0.0]);
        let t_c = compact.run(&init, &pars, &[0.0]);
        for n in 0..=order {
            for i in 0..2u32 {
                assert_eq!(
                    unrolled.c(&t_u, n, i, 0).to_bits(),
                    compact.c(&t_c, n, i, 0).to_bits(),
                    "order {n} state {i}"
                );
            }
        }
        // And against the oracle.
        let expected = symbolic_coefficients(&sys, &init, &pars, order);
        for n in 0..=order {
            for i in 0..2u32 {
                assert!(close(
                    unrolled.c(&t_u, n, i, 0),
                    expected[n as usize][i as usize],
                    1e-12
                ));
            }
        }
    }

    #[test]
    fn zero_order_and_zero_batch_are_rejected() {
        let x = var("x");
        let sys = vec![(x.clone(), x.clone())];
        let mut s = JitState::new().unwrap();
        assert!(matches!(
            s.add_taylor_jet::<f64>("jet", &sys, 0, 1, false),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            s.add_taylor_jet::<f64>("jet", &sys, 1, 0, false),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn duplicate_jet_names_are_rejected() {
        let x = var("x");
        let sys = vec![(x.clone(), x.clone())];
        let mut s = JitState::new().unwrap();
        s.add_taylor_jet::<f64>("jet", &sys, 2, 1, false).unwrap();
        assert!(matches!(
            s.add_taylor_jet::<f64>("jet", &sys, 2, 1, false),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn precision_mixing_is_rejected() {
        let x = var("x");
        let sys = vec![(x.clone(), x.clone())];
        let mut s = JitState::new().unwrap();
        s.add_taylor_jet::<f64>("jet", &sys, 2, 1, false).unwrap();
        s.compile().unwrap();
        assert!(s.fetch_jet::<f64>("jet").is_ok());
        assert!(matches!(
            s.fetch_jet::<f32>("jet"),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn single_precision_jet() {
        // x' = -x at f32: c_1 = -x0, c_2 = x0/2.
        let x = var("x");
        let sys = vec![(x.clone(), num(-1.0) * x.clone())];
        let mut s = JitState::new().unwrap();
        let dims = s.add_taylor_jet::<f32>("jet", &sys, 2, 1, false).unwrap();
        s.compile().unwrap();
        let jet = s.fetch_jet::<f32>("jet").unwrap();
        let mut tape = vec![0.0f32; dims.tape_len()];
        tape[0] = 0.5;
        jet.call(&mut tape, &[], &[0.0]).unwrap();
        let n_u = dims.n_u as usize;
        assert_eq!(tape[n_u], -0.5);
        assert_eq!(tape[2 * n_u], 0.25);
    }

    #[test]
    fn fetch_before_compile_is_rejected() {
        let x = var("x");
        let sys = vec![(x.clone(), x.clone())];
        let mut s = JitState::new().unwrap();
        s.add_taylor_jet::<f64>("jet", &sys, 2, 1, false).unwrap();
        assert!(matches!(
            s.fetch_jet::<f64>("jet"),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn tape_size_is_validated() {
        let x = var("x");
        let sys = vec![(x.clone(), x.clone())];
        let mut s = JitState::new().unwrap();
        s.add_taylor_jet::<f64>("jet", &sys, 2, 1, false).unwrap();
        s.compile().unwrap();
        let jet = s.fetch_jet::<f64>("jet").unwrap();
        let mut tape = vec![0.0; 3];
        assert!(matches!(
            jet.call(&mut tape, &[], &[0.0]),
            Err(Error::InvalidArg(_))
        ));
    }
}
