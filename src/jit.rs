//! JIT host glue: a thin façade over Cranelift.
//!
//! [`JitState`] owns the module, contexts and symbol table; one state
//! produces one module. [`CodegenCtx`] is the per-function emission handle
//! the Taylor code generator works through: lane bundles, tape addressing,
//! splats, pairwise reduction, external math calls, counted loops and
//! branches. Keeping this façade small is what makes the unrolled-vs-compact
//! duality a local policy of the code generator.
//!
//! Math externals are registered as `extern "C"` wrappers so the compiled
//! code calls into libm through a stable ABI.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use isa::TargetIsa;

use crate::errors::Error;
use crate::sum::pairwise_reduce;
use crate::types::{JetFloat, Precision, RawJetFn};

macro_rules! libm_shims {
    ($(($name:ident, $namef:ident, $method:ident)),* $(,)?) => {
        $(
            extern "C" fn $name(x: f64) -> f64 {
                x.$method()
            }
            extern "C" fn $namef(x: f32) -> f32 {
                x.$method()
            }
        )*
    };
}

libm_shims!(
    (shim_sin, shim_sinf, sin),
    (shim_cos, shim_cosf, cos),
    (shim_tan, shim_tanf, tan),
    (shim_asin, shim_asinf, asin),
    (shim_acos, shim_acosf, acos),
    (shim_atan, shim_atanf, atan),
    (shim_sinh, shim_sinhf, sinh),
    (shim_cosh, shim_coshf, cosh),
    (shim_tanh, shim_tanhf, tanh),
    (shim_asinh, shim_asinhf, asinh),
    (shim_acosh, shim_acoshf, acosh),
    (shim_atanh, shim_atanhf, atanh),
    (shim_exp, shim_expf, exp),
    (shim_log, shim_logf, ln),
    (shim_sqrt, shim_sqrtf, sqrt),
);

extern "C" fn shim_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn shim_powf(x: f32, y: f32) -> f32 {
    x.powf(y)
}

extern "C" fn shim_erf(x: f64) -> f64 {
    libm::erf(x)
}

extern "C" fn shim_erff(x: f32) -> f32 {
    libm::erff(x)
}

/// Dimensions of a compiled jet function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JetDims {
    /// Number of state variables (`m`).
    pub n_state: u32,
    /// Total decomposition size (`N`), including the trailing aliases.
    pub n_u: u32,
    /// Taylor order (`O`).
    pub order: u32,
    /// SIMD batch width (`B`).
    pub batch: u32,
    /// Number of runtime parameters.
    pub n_pars: u32,
}

impl JetDims {
    /// Number of scalars the caller-provided tape must hold.
    pub fn tape_len(&self) -> usize {
        (self.order as usize + 1) * self.n_u as usize * self.batch as usize
    }
}

pub(crate) struct JetRecord {
    pub(crate) func_id: FuncId,
    pub(crate) prec: Precision,
    pub(crate) dims: JetDims,
}

/// One JIT compilation unit: module, contexts and the jet registry.
///
/// Different states may be compiled in parallel by independent callers;
/// a single state is not thread-safe.
pub struct JitState {
    pub(crate) module: JITModule,
    pub(crate) ctx: Context,
    pub(crate) builder_ctx: FunctionBuilderContext,
    pub(crate) jets: HashMap<String, JetRecord>,
    // Symbols resolvable by the module; consulted by the emission-time
    // probes for scalar and vector math externals.
    pub(crate) known_symbols: HashSet<String>,
    compiled: bool,
}

/// Detects the host architecture and configures the compilation flags,
/// mirroring the settings the JIT was tuned with.
fn create_isa() -> Result<Arc<dyn TargetIsa>, Error> {
    let mut flag_builder = settings::builder();

    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );

    if is_x86 {
        flag_builder.set("use_colocated_libcalls", "true").unwrap();
        flag_builder.set("is_pic", "true").unwrap();
    } else {
        flag_builder.set("use_colocated_libcalls", "false").unwrap();
        flag_builder.set("is_pic", "false").unwrap();
    }
    flag_builder.set("opt_level", "speed").unwrap();

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| Error::BackendFailure(format!("host machine is not supported: {msg}")))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(Error::from)
}

impl JitState {
    /// Creates a fresh module bound to the host target machine, with the
    /// scalar libm externals registered at both precisions.
    pub fn new() -> Result<Self, Error> {
        let isa = create_isa()?;
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

        let mut known_symbols = HashSet::new();
        let mut register = |name: &str, ptr: *const u8| {
            builder.symbol(name, ptr);
            known_symbols.insert(name.to_string());
        };

        register("sin", shim_sin as *const u8);
        register("cos", shim_cos as *const u8);
        register("tan", shim_tan as *const u8);
        register("asin", shim_asin as *const u8);
        register("acos", shim_acos as *const u8);
        register("atan", shim_atan as *const u8);
        register("sinh", shim_sinh as *const u8);
        register("cosh", shim_cosh as *const u8);
        register("tanh", shim_tanh as *const u8);
        register("asinh", shim_asinh as *const u8);
        register("acosh", shim_acosh as *const u8);
        register("atanh", shim_atanh as *const u8);
        register("exp", shim_exp as *const u8);
        register("log", shim_log as *const u8);
        register("sqrt", shim_sqrt as *const u8);
        register("pow", shim_pow as *const u8);
        register("erf", shim_erf as *const u8);

        register("sinf", shim_sinf as *const u8);
        register("cosf", shim_cosf as *const u8);
        register("tanf", shim_tanf as *const u8);
        register("asinf", shim_asinf as *const u8);
        register("acosf", shim_acosf as *const u8);
        register("atanf", shim_atanf as *const u8);
        register("sinhf", shim_sinhf as *const u8);
        register("coshf", shim_coshf as *const u8);
        register("tanhf", shim_tanhf as *const u8);
        register("asinhf", shim_asinhf as *const u8);
        register("acoshf", shim_acoshf as *const u8);
        register("atanhf", shim_atanhf as *const u8);
        register("expf", shim_expf as *const u8);
        register("logf", shim_logf as *const u8);
        register("sqrtf", shim_sqrtf as *const u8);
        register("powf", shim_powf as *const u8);
        register("erff", shim_erff as *const u8);

        let module = JITModule::new(builder);
        let ctx = module.make_context();

        Ok(JitState {
            module,
            ctx,
            builder_ctx: FunctionBuilderContext::new(),
            jets: HashMap::new(),
            known_symbols,
            compiled: false,
        })
    }

    /// Defines a read-only table of `u32` values in the module.
    pub(crate) fn define_u32_table(&mut self, name: &str, vals: &[u32]) -> Result<DataId, Error> {
        let mut bytes = Vec::with_capacity(vals.len() * 4);
        for v in vals {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.define_table(name, bytes, 4)
    }

    /// Defines a read-only table of floating-point values at `prec`.
    pub(crate) fn define_fp_table(
        &mut self,
        name: &str,
        vals: &[f64],
        prec: Precision,
    ) -> Result<DataId, Error> {
        let mut bytes = Vec::with_capacity(vals.len() * prec.size() as usize);
        for v in vals {
            match prec {
                Precision::Double => bytes.extend_from_slice(&v.to_le_bytes()),
                Precision::Single => bytes.extend_from_slice(&(*v as f32).to_le_bytes()),
            }
        }
        self.define_table(name, bytes, prec.size() as u64)
    }

    fn define_table(&mut self, name: &str, bytes: Vec<u8>, align: u64) -> Result<DataId, Error> {
        let mut desc = DataDescription::new();
        desc.define(bytes.into_boxed_slice());
        desc.set_align(align);
        let id = self
            .module
            .declare_data(name, Linkage::Local, false, false)?;
        self.module.define_data(id, &desc)?;
        Ok(id)
    }

    /// Optimizes and finalizes every definition added so far. After this the
    /// jet function pointers can be fetched by name.
    pub fn compile(&mut self) -> Result<(), Error> {
        self.module.finalize_definitions()?;
        self.compiled = true;
        Ok(())
    }

    pub(crate) fn fetch_raw<F: JetFloat>(&self, name: &str) -> Result<(RawJetFn<F>, JetDims), Error> {
        if !self.compiled {
            return Err(Error::InvalidArg(format!(
                "Cannot fetch the jet function '{name}' before the module has been compiled"
            )));
        }
        let record = self.jets.get(name).ok_or_else(|| {
            Error::InvalidArg(format!(
                "The jet function '{name}' was not added to this module"
            ))
        })?;
        if record.prec != F::PRECISION {
            return Err(Error::InvalidArg(format!(
                "The jet function '{name}' was compiled at {} precision, not {}",
                record.prec,
                F::PRECISION
            )));
        }
        let ptr = self.module.get_finalized_function(record.func_id);
        // SAFETY: the function was declared and defined with the jet
        // signature (three pointer-sized parameters, no return) at the
        // precision checked above, and the pointer stays valid for as long
        // as the owning module does.
        let raw = unsafe { std::mem::transmute::<*const u8, RawJetFn<F>>(ptr) };
        Ok((raw, record.dims))
    }

    /// Fetches a compiled jet function by name.
    ///
    /// Fails if the module has not been compiled, the name is unknown, or
    /// `F` does not match the precision the jet was compiled for.
    pub fn fetch_jet<F: JetFloat>(&self, name: &str) -> Result<JetFn<'_, F>, Error> {
        let (raw, dims) = self.fetch_raw::<F>(name)?;
        Ok(JetFn {
            raw,
            dims,
            _state: PhantomData,
        })
    }
}

/// A compiled jet function, borrowed from its [`JitState`].
#[derive(Clone, Copy)]
pub struct JetFn<'s, F: JetFloat> {
    raw: RawJetFn<F>,
    dims: JetDims,
    _state: PhantomData<&'s JitState>,
}

impl<F: JetFloat> JetFn<'_, F> {
    pub fn dims(&self) -> JetDims {
        self.dims
    }

    /// Runs the jet: on entry the first `n_state * batch` tape values hold
    /// the state, on return rows `0..=order` of the state columns hold the
    /// Taylor coefficients.
    pub fn call(&self, tape: &mut [F], pars: &[F], time: &[F]) -> Result<(), Error> {
        let d = &self.dims;
        if tape.len() != d.tape_len() {
            return Err(Error::InvalidArg(format!(
                "Invalid tape size in a jet invocation: {} scalars were expected, but {} were provided",
                d.tape_len(),
                tape.len()
            )));
        }
        if pars.len() != (d.n_pars * d.batch) as usize {
            return Err(Error::InvalidArg(format!(
                "Invalid parameter array size in a jet invocation: {} scalars were expected, but {} were provided",
                d.n_pars * d.batch,
                pars.len()
            )));
        }
        if time.len() != d.batch as usize {
            return Err(Error::InvalidArg(format!(
                "Invalid time array size in a jet invocation: {} scalars were expected, but {} were provided",
                d.batch,
                time.len()
            )));
        }
        // SAFETY: buffer sizes were validated against the dimensions the
        // function was compiled with; the jet only writes within the tape.
        unsafe { (self.raw)(tape.as_mut_ptr(), pars.as_ptr(), time.as_ptr()) };
        Ok(())
    }
}

/// A bundle of `B` scalar IR values, one per batch lane.
///
/// The backend's fixed-width SIMD types stop at 128 bits while `B` is
/// arbitrary, so lanes are kept as independent scalars and operations map
/// elementwise; re-vectorization is left to the backend.
#[derive(Clone)]
pub struct Lanes(pub(crate) Vec<Value>);

impl Lanes {
    pub(crate) fn width(&self) -> usize {
        self.0.len()
    }
}

/// Emission context for one function under construction.
pub struct CodegenCtx<'a, 'b> {
    pub(crate) builder: &'a mut FunctionBuilder<'b>,
    pub(crate) module: &'a mut JITModule,
    known_symbols: &'a HashSet<String>,
    prec: Precision,
    batch: u32,
    n_u: u32,
    tape: Value,
    pars: Value,
    time: Value,
}

impl<'a, 'b> CodegenCtx<'a, 'b> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        builder: &'a mut FunctionBuilder<'b>,
        module: &'a mut JITModule,
        known_symbols: &'a HashSet<String>,
        prec: Precision,
        batch: u32,
        n_u: u32,
        tape: Value,
        pars: Value,
        time: Value,
    ) -> Self {
        CodegenCtx {
            builder,
            module,
            known_symbols,
            prec,
            batch,
            n_u,
            tape,
            pars,
            time,
        }
    }

    pub fn prec(&self) -> Precision {
        self.prec
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    pub(crate) fn tape_ptr(&self) -> Value {
        self.tape
    }

    pub(crate) fn pars_ptr(&self) -> Value {
        self.pars
    }

    pub(crate) fn time_ptr(&self) -> Value {
        self.time
    }

    fn fp_type(&self) -> Type {
        self.prec.fp_type()
    }

    fn fp_size(&self) -> i64 {
        i64::from(self.prec.size())
    }

    /// A floating-point constant at the context's precision. Literals are
    /// materialized exactly at the target width.
    pub(crate) fn fconst(&mut self, v: f64) -> Value {
        match self.prec {
            Precision::Double => self.builder.ins().f64const(v),
            Precision::Single => self.builder.ins().f32const(v as f32),
        }
    }

    pub(crate) fn iconst(&mut self, v: i64) -> Value {
        self.builder.ins().iconst(types::I64, v)
    }

    /// Splats a constant across the batch.
    pub(crate) fn splat(&mut self, v: f64) -> Lanes {
        let c = self.fconst(v);
        Lanes(vec![c; self.batch as usize])
    }

    pub(crate) fn fadd(&mut self, a: &Lanes, b: &Lanes) -> Lanes {
        debug_assert_eq!(a.width(), b.width());
        let mut lanes = Vec::with_capacity(a.width());
        for (&x, &y) in a.0.iter().zip(&b.0) {
            lanes.push(self.builder.ins().fadd(x, y));
        }
        Lanes(lanes)
    }

    pub(crate) fn fsub(&mut self, a: &Lanes, b: &Lanes) -> Lanes {
        debug_assert_eq!(a.width(), b.width());
        let mut lanes = Vec::with_capacity(a.width());
        for (&x, &y) in a.0.iter().zip(&b.0) {
            lanes.push(self.builder.ins().fsub(x, y));
        }
        Lanes(lanes)
    }

    pub(crate) fn fmul(&mut self, a: &Lanes, b: &Lanes) -> Lanes {
        debug_assert_eq!(a.width(), b.width());
        let mut lanes = Vec::with_capacity(a.width());
        for (&x, &y) in a.0.iter().zip(&b.0) {
            lanes.push(self.builder.ins().fmul(x, y));
        }
        Lanes(lanes)
    }

    pub(crate) fn fdiv(&mut self, a: &Lanes, b: &Lanes) -> Lanes {
        debug_assert_eq!(a.width(), b.width());
        let mut lanes = Vec::with_capacity(a.width());
        for (&x, &y) in a.0.iter().zip(&b.0) {
            lanes.push(self.builder.ins().fdiv(x, y));
        }
        Lanes(lanes)
    }

    pub(crate) fn fneg(&mut self, a: &Lanes) -> Lanes {
        let mut lanes = Vec::with_capacity(a.width());
        for &x in &a.0 {
            lanes.push(self.builder.ins().fneg(x));
        }
        Lanes(lanes)
    }

    pub(crate) fn fsqrt(&mut self, a: &Lanes) -> Lanes {
        let mut lanes = Vec::with_capacity(a.width());
        for &x in &a.0 {
            lanes.push(self.builder.ins().sqrt(x));
        }
        Lanes(lanes)
    }

    /// Balanced pairwise reduction of lane bundles; `None` for empty input.
    pub(crate) fn pairwise(&mut self, terms: Vec<Lanes>) -> Option<Lanes> {
        pairwise_reduce(terms, |a, b| self.fadd(&a, &b))
    }

    fn lane_addr(&mut self, base: Value, index: i64) -> (Value, Offset32) {
        (base, Offset32::new((index * self.fp_size()) as i32))
    }

    /// Loads the `B` lanes of tape cell (`order`, `u_idx`).
    pub(crate) fn tape_load(&mut self, order: u32, u_idx: u32) -> Lanes {
        let start =
            (i64::from(order) * i64::from(self.n_u) + i64::from(u_idx)) * i64::from(self.batch);
        let mem = MemFlags::new().with_aligned().with_notrap();
        let fp = self.fp_type();
        let mut lanes = Vec::with_capacity(self.batch as usize);
        for b in 0..i64::from(self.batch) {
            let (base, off) = self.lane_addr(self.tape, start + b);
            lanes.push(self.builder.ins().load(fp, mem, base, off));
        }
        Lanes(lanes)
    }

    /// Stores `val` to tape cell (`order`, `u_idx`).
    pub(crate) fn tape_store(&mut self, order: u32, u_idx: u32, val: &Lanes) {
        let start =
            (i64::from(order) * i64::from(self.n_u) + i64::from(u_idx)) * i64::from(self.batch);
        let mem = MemFlags::new().with_aligned().with_notrap();
        for (b, &v) in val.0.iter().enumerate() {
            let (base, off) = self.lane_addr(self.tape, start + b as i64);
            self.builder.ins().store(mem, v, base, off);
        }
    }

    /// Byte address of tape cell (`order`, `u_idx`) with runtime indices.
    fn tape_addr_dyn(&mut self, order: Value, u_idx: Value) -> Value {
        let n_u = self.iconst(i64::from(self.n_u));
        let row = self.builder.ins().imul(order, n_u);
        let cell = self.builder.ins().iadd(row, u_idx);
        let batch = self.iconst(i64::from(self.batch));
        let scaled = self.builder.ins().imul(cell, batch);
        let fp_size = self.fp_size();
        let bytes = self.builder.ins().imul_imm(scaled, fp_size);
        self.builder.ins().iadd(self.tape, bytes)
    }

    /// Loads one lane of a tape cell addressed by runtime indices.
    pub(crate) fn tape_load_dyn_lane(&mut self, order: Value, u_idx: Value, lane: usize) -> Value {
        let addr = self.tape_addr_dyn(order, u_idx);
        let mem = MemFlags::new().with_aligned().with_notrap();
        let fp = self.fp_type();
        let off = Offset32::new((lane as i64 * self.fp_size()) as i32);
        self.builder.ins().load(fp, mem, addr, off)
    }

    /// Loads the `B` lanes of a tape cell addressed by runtime indices.
    pub(crate) fn tape_load_dyn(&mut self, order: Value, u_idx: Value) -> Lanes {
        let addr = self.tape_addr_dyn(order, u_idx);
        let mem = MemFlags::new().with_aligned().with_notrap();
        let fp = self.fp_type();
        let mut lanes = Vec::with_capacity(self.batch as usize);
        for b in 0..i64::from(self.batch) {
            let off = Offset32::new((b * self.fp_size()) as i32);
            lanes.push(self.builder.ins().load(fp, mem, addr, off));
        }
        Lanes(lanes)
    }

    /// Stores `val` to a tape cell addressed by runtime indices.
    pub(crate) fn tape_store_dyn(&mut self, order: Value, u_idx: Value, val: &Lanes) {
        let addr = self.tape_addr_dyn(order, u_idx);
        let mem = MemFlags::new().with_aligned().with_notrap();
        for (b, &v) in val.0.iter().enumerate() {
            let off = Offset32::new((b as i64 * self.fp_size()) as i32);
            self.builder.ins().store(mem, v, addr, off);
        }
    }

    /// Gathers the `B` lanes of parameter `idx`.
    pub(crate) fn par_load(&mut self, idx: u32) -> Lanes {
        let start = i64::from(idx) * i64::from(self.batch);
        let mem = MemFlags::new().with_aligned().with_readonly().with_notrap();
        let fp = self.fp_type();
        let mut lanes = Vec::with_capacity(self.batch as usize);
        for b in 0..i64::from(self.batch) {
            let (base, off) = self.lane_addr(self.pars, start + b);
            lanes.push(self.builder.ins().load(fp, mem, base, off));
        }
        Lanes(lanes)
    }

    /// Gathers the `B` lanes of a parameter addressed by a runtime index.
    pub(crate) fn par_load_dyn(&mut self, idx: Value) -> Lanes {
        let batch = self.iconst(i64::from(self.batch));
        let scaled = self.builder.ins().imul(idx, batch);
        let fp_size = self.fp_size();
        let bytes = self.builder.ins().imul_imm(scaled, fp_size);
        let addr = self.builder.ins().iadd(self.pars, bytes);
        let mem = MemFlags::new().with_aligned().with_readonly().with_notrap();
        let fp = self.fp_type();
        let mut lanes = Vec::with_capacity(self.batch as usize);
        for b in 0..i64::from(self.batch) {
            let off = Offset32::new((b * self.fp_size()) as i32);
            lanes.push(self.builder.ins().load(fp, mem, addr, off));
        }
        Lanes(lanes)
    }

    /// Loads the `B` lanes of the current time.
    pub(crate) fn time_load(&mut self) -> Lanes {
        let mem = MemFlags::new().with_aligned().with_readonly().with_notrap();
        let fp = self.fp_type();
        let mut lanes = Vec::with_capacity(self.batch as usize);
        for b in 0..i64::from(self.batch) {
            let (base, off) = self.lane_addr(self.time, b);
            lanes.push(self.builder.ins().load(fp, mem, base, off));
        }
        Lanes(lanes)
    }

    /// Loads entry `index` of a `u32` table as an `i64` value.
    pub(crate) fn table_load_u32(&mut self, table: DataId, index: Value) -> Value {
        let gv = self.module.declare_data_in_func(table, self.builder.func);
        let ptr = self.builder.ins().global_value(types::I64, gv);
        let bytes = self.builder.ins().imul_imm(index, 4);
        let addr = self.builder.ins().iadd(ptr, bytes);
        let mem = MemFlags::new().with_aligned().with_readonly().with_notrap();
        let v = self.builder.ins().load(types::I32, mem, addr, 0);
        self.builder.ins().uextend(types::I64, v)
    }

    /// Loads entry `index` of a floating-point table as a scalar.
    pub(crate) fn table_load_fp_scalar(&mut self, table: DataId, index: Value) -> Value {
        let gv = self.module.declare_data_in_func(table, self.builder.func);
        let ptr = self.builder.ins().global_value(types::I64, gv);
        let fp_size = self.fp_size();
        let bytes = self.builder.ins().imul_imm(index, fp_size);
        let addr = self.builder.ins().iadd(ptr, bytes);
        let mem = MemFlags::new().with_aligned().with_readonly().with_notrap();
        let fp = self.fp_type();
        self.builder.ins().load(fp, mem, addr, 0)
    }

    /// Loads entry `index` of a floating-point table, splat across lanes.
    pub(crate) fn table_load_fp(&mut self, table: DataId, index: Value) -> Lanes {
        let v = self.table_load_fp_scalar(table, index);
        Lanes(vec![v; self.batch as usize])
    }

    /// Converts an unsigned integer value to the context's float type.
    pub(crate) fn fcvt(&mut self, v: Value) -> Value {
        let fp = self.fp_type();
        self.builder.ins().fcvt_from_uint(fp, v)
    }

    /// Calls the named math external on each lane.
    ///
    /// A batch-wide vector symbol (`<name>v<B>`) is probed first; absent
    /// that, the lanes are unpacked, the scalar external of the target
    /// precision (or, failing that, of the other precision with casts) is
    /// called pointwise, and the results re-packed.
    pub(crate) fn call_extern(&mut self, name: &str, args: &[Lanes]) -> Result<Lanes, Error> {
        let vector_symbol = format!("{}v{}", self.prec.libm_symbol(name), self.batch);
        if self.known_symbols.contains(&vector_symbol) {
            return self.call_symbol_rowwise(&vector_symbol, args);
        }

        let native = self.prec.libm_symbol(name);
        if self.known_symbols.contains(&native) {
            return self.call_symbol_pointwise(&native, self.prec, args);
        }

        // Nearest-precision fallback with casts.
        let other = match self.prec {
            Precision::Double => Precision::Single,
            Precision::Single => Precision::Double,
        };
        let fallback = other.libm_symbol(name);
        if self.known_symbols.contains(&fallback) {
            return self.call_symbol_pointwise(&fallback, other, args);
        }

        Err(Error::BackendFailure(format!(
            "no math external is available for '{name}' at {} precision",
            self.prec
        )))
    }

    fn declare_extern(
        &mut self,
        symbol: &str,
        arity: usize,
        fp: Type,
    ) -> Result<cranelift_codegen::ir::FuncRef, Error> {
        let mut sig = self.module.make_signature();
        for _ in 0..arity {
            sig.params.push(AbiParam::new(fp));
        }
        sig.returns.push(AbiParam::new(fp));
        let func_id = self
            .module
            .declare_function(symbol, Linkage::Import, &sig)?;
        Ok(self.module.declare_func_in_func(func_id, self.builder.func))
    }

    fn call_symbol_pointwise(
        &mut self,
        symbol: &str,
        sym_prec: Precision,
        args: &[Lanes],
    ) -> Result<Lanes, Error> {
        let fp = self.fp_type();
        let sym_fp = sym_prec.fp_type();
        let func_ref = self.declare_extern(symbol, args.len(), sym_fp)?;
        let mut lanes = Vec::with_capacity(self.batch as usize);
        for b in 0..self.batch as usize {
            let mut call_args = Vec::with_capacity(args.len());
            for a in args {
                let mut v = a.0[b];
                if sym_fp != fp {
                    v = if sym_prec == Precision::Double {
                        self.builder.ins().fpromote(sym_fp, v)
                    } else {
                        self.builder.ins().fdemote(sym_fp, v)
                    };
                }
                call_args.push(v);
            }
            let call = self.builder.ins().call(func_ref, &call_args);
            let mut r = self.builder.inst_results(call)[0];
            if sym_fp != fp {
                r = if sym_prec == Precision::Double {
                    self.builder.ins().fdemote(fp, r)
                } else {
                    self.builder.ins().fpromote(fp, r)
                };
            }
            lanes.push(r);
        }
        Ok(Lanes(lanes))
    }

    // Vector symbols share the scalar calling shape lane by lane; a SIMD
    // math library registering packed entry points would hook in here.
    fn call_symbol_rowwise(&mut self, symbol: &str, args: &[Lanes]) -> Result<Lanes, Error> {
        self.call_symbol_pointwise(symbol, self.prec, args)
    }

    /// Emits `for i in start..end { body(i) }` over `i64` values.
    pub(crate) fn emit_loop(
        &mut self,
        start: Value,
        end: Value,
        mut body: impl FnMut(&mut Self, Value),
    ) {
        let header = self.builder.create_block();
        let body_block = self.builder.create_block();
        let exit = self.builder.create_block();
        self.builder.append_block_param(header, types::I64);

        self.builder.ins().jump(header, &[start]);

        self.builder.switch_to_block(header);
        let i = self.builder.block_params(header)[0];
        let cond = self
            .builder
            .ins()
            .icmp(IntCC::SignedLessThan, i, end);
        self.builder.ins().brif(cond, body_block, &[], exit, &[]);

        self.builder.switch_to_block(body_block);
        self.builder.seal_block(body_block);
        body(self, i);
        let next = self.builder.ins().iadd_imm(i, 1);
        self.builder.ins().jump(header, &[next]);
        self.builder.seal_block(header);

        self.builder.switch_to_block(exit);
        self.builder.seal_block(exit);
    }

    /// Emits a loop carrying one `i64` value: while `cond(v)` holds, the
    /// body computes the next value. Returns the value at exit.
    pub(crate) fn emit_while(
        &mut self,
        init: Value,
        mut cond: impl FnMut(&mut Self, Value) -> Value,
        mut body: impl FnMut(&mut Self, Value) -> Value,
    ) -> Value {
        let header = self.builder.create_block();
        let body_block = self.builder.create_block();
        let exit = self.builder.create_block();
        self.builder.append_block_param(header, types::I64);

        self.builder.ins().jump(header, &[init]);

        self.builder.switch_to_block(header);
        let v = self.builder.block_params(header)[0];
        let c = cond(self, v);
        self.builder.ins().brif(c, body_block, &[], exit, &[]);

        self.builder.switch_to_block(body_block);
        self.builder.seal_block(body_block);
        let next = body(self, v);
        self.builder.ins().jump(header, &[next]);
        self.builder.seal_block(header);

        self.builder.switch_to_block(exit);
        self.builder.seal_block(exit);
        v
    }

    /// Emits `if cond { then() }`.
    pub(crate) fn emit_if(&mut self, cond: Value, mut then: impl FnMut(&mut Self)) {
        let then_block = self.builder.create_block();
        let cont = self.builder.create_block();
        self.builder.ins().brif(cond, then_block, &[], cont, &[]);
        self.builder.switch_to_block(then_block);
        self.builder.seal_block(then_block);
        then(self);
        self.builder.ins().jump(cont, &[]);
        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
    }

    /// Emits an if/else merging one scalar float value.
    pub(crate) fn emit_if_else_scalar(
        &mut self,
        cond: Value,
        mut then: impl FnMut(&mut Self) -> Value,
        mut otherwise: impl FnMut(&mut Self) -> Value,
    ) -> Value {
        let fp = self.fp_type();
        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        let cont = self.builder.create_block();
        self.builder.append_block_param(cont, fp);

        self.builder
            .ins()
            .brif(cond, then_block, &[], else_block, &[]);

        self.builder.switch_to_block(then_block);
        self.builder.seal_block(then_block);
        let tv = then(self);
        self.builder.ins().jump(cont, &[tv]);

        self.builder.switch_to_block(else_block);
        self.builder.seal_block(else_block);
        let ev = otherwise(self);
        self.builder.ins().jump(cont, &[ev]);

        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
        self.builder.block_params(cont)[0]
    }

    /// Emits an if/else merging one lane bundle.
    pub(crate) fn emit_if_else_lanes(
        &mut self,
        cond: Value,
        mut then: impl FnMut(&mut Self) -> Lanes,
        mut otherwise: impl FnMut(&mut Self) -> Lanes,
    ) -> Lanes {
        let fp = self.fp_type();
        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        let cont = self.builder.create_block();
        for _ in 0..self.batch {
            self.builder.append_block_param(cont, fp);
        }

        self.builder
            .ins()
            .brif(cond, then_block, &[], else_block, &[]);

        self.builder.switch_to_block(then_block);
        self.builder.seal_block(then_block);
        let tv = then(self);
        self.builder.ins().jump(cont, &tv.0);

        self.builder.switch_to_block(else_block);
        self.builder.seal_block(else_block);
        let ev = otherwise(self);
        self.builder.ins().jump(cont, &ev.0);

        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
        Lanes(self.builder.block_params(cont).to_vec())
    }

    /// Creates a scratch stack array of `len` scalars; returns its address.
    pub(crate) fn scratch_array(&mut self, len: u32) -> Value {
        let size = len * self.prec.size();
        let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            self.prec.size().trailing_zeros() as u8,
        ));
        self.builder.ins().stack_addr(types::I64, slot, 0)
    }

    pub(crate) fn scratch_store(&mut self, base: Value, index: Value, v: Value) {
        let fp_size = self.fp_size();
        let bytes = self.builder.ins().imul_imm(index, fp_size);
        let addr = self.builder.ins().iadd(base, bytes);
        let mem = MemFlags::new().with_aligned().with_notrap();
        self.builder.ins().store(mem, v, addr, 0);
    }

    pub(crate) fn scratch_load(&mut self, base: Value, index: Value) -> Value {
        let fp_size = self.fp_size();
        let bytes = self.builder.ins().imul_imm(index, fp_size);
        let addr = self.builder.ins().iadd(base, bytes);
        let mem = MemFlags::new().with_aligned().with_notrap();
        let fp = self.fp_type();
        self.builder.ins().load(fp, mem, addr, 0)
    }

    /// Reduces `len >= 1` scalars stored at `base` by iterative halving,
    /// replicating [`pairwise_reduce`]'s combination order with runtime
    /// bounds. Clobbers the scratch array.
    pub(crate) fn emit_pairwise_dyn(&mut self, base: Value, len: Value) -> Value {
        let one = self.iconst(1);
        self.emit_while(
            len,
            |cg, l| cg.builder.ins().icmp(IntCC::SignedGreaterThan, l, one),
            |cg, l| {
                let half = cg.builder.ins().ushr_imm(l, 1);
                let zero = cg.iconst(0);
                cg.emit_loop(zero, half, |cg, i| {
                    let two_i = cg.builder.ins().imul_imm(i, 2);
                    let a = cg.scratch_load(base, two_i);
                    let two_i1 = cg.builder.ins().iadd_imm(two_i, 1);
                    let b = cg.scratch_load(base, two_i1);
                    let s = cg.builder.ins().fadd(a, b);
                    cg.scratch_store(base, i, s);
                });
                let odd = cg.builder.ins().band_imm(l, 1);
                let is_odd = cg.builder.ins().icmp_imm(IntCC::NotEqual, odd, 0);
                cg.emit_if(is_odd, |cg| {
                    let last = cg.builder.ins().iadd_imm(l, -1);
                    let v = cg.scratch_load(base, last);
                    cg.scratch_store(base, half, v);
                });
                cg.builder.ins().iadd(half, odd)
            },
        );
        let zero = self.iconst(0);
        self.scratch_load(base, zero)
    }
}
