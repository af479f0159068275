//! Compilation pipeline: bytecode → CFG → stack SSA → IR → optimized IR → backend
//!
//! The pipeline chains together all compilation stages:
//! 1. Decode bytecode into instructions and exception regions
//! 2. Check integer-mode admission (integer mode only)
//! 3. Build the control-flow graph and propagate stack depths
//! 4. Plan merges and, for suspendable functions, the frame layout
//! 5. Lower to IR
//! 6. Run optimization passes and verify
//! 7. Hand the artifact to a backend

use kiln_bytecode::CodeObject;
use tracing::instrument;

use crate::analysis::cfg::build_cfg;
use crate::analysis::{
    compute_order, decode_function, propagate_depths, CfgOptions, DecodeError, Liveness,
};
use crate::backend::{CodegenBackend, CodegenError, CompiledCode};
use crate::error::{ModeUnsupportedOpcode, StructuralVerificationError, UnsupportedOpcode};
use crate::ir::{verify_function, Function, Mode};
use crate::lower::{lower_function, LowerError, LowerOptions};
use crate::optimize::Optimizer;
use crate::ssa::plan_merges;
use crate::suspend::{self, DispatchTable, FrameLayout};
use crate::validate::validate_integer_mode;

/// Errors from the compilation pipeline
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Unsupported: {0}")]
    Unsupported(#[from] UnsupportedOpcode),
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralVerificationError),
    #[error("Mode rejected: {0}")]
    ModeUnsupported(#[from] ModeUnsupportedOpcode),
    #[error("Function '{name}' has {units} code units, limit is {limit}")]
    TooLarge { name: String, units: usize, limit: usize },
    #[error("Codegen error: {0}")]
    Codegen(#[from] CodegenError),
}

impl CompileError {
    /// Whether the caller should run the function on the interpreter instead
    pub fn is_fallback(&self) -> bool {
        matches!(self, CompileError::Unsupported(_) | CompileError::TooLarge { .. })
    }

    /// Whether recompiling in object mode may succeed
    pub fn is_mode_downgrade(&self) -> bool {
        matches!(self, CompileError::ModeUnsupported(_))
    }
}

impl From<LowerError> for CompileError {
    fn from(err: LowerError) -> Self {
        match err {
            LowerError::Structural(e) => CompileError::Structural(e),
            LowerError::Unsupported(e) => CompileError::Unsupported(e),
        }
    }
}

/// Per-compile settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub mode: Mode,
    pub optimize: bool,
    pub verify_ir: bool,
    pub release_gil: bool,
    /// Refuse functions longer than this many code units
    pub max_code_units: Option<usize>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            mode: Mode::Object,
            optimize: true,
            verify_ir: true,
            release_gil: false,
            max_code_units: None,
        }
    }
}

impl CompileOptions {
    pub fn with_mode(mode: Mode) -> Self {
        CompileOptions { mode, ..Self::default() }
    }
}

/// Shape of the compiled function, measured before optimization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileStats {
    /// Reachable bytecode blocks
    pub blocks: usize,
    /// Merge placeholders created
    pub placeholders: usize,
    /// Merge placeholders completed
    pub completed_placeholders: usize,
    /// Loop back-edges
    pub back_edges: usize,
    /// Landing pads built by the unwind integrator
    pub landing_pads: usize,
}

/// A compiled function and everything needed to run it
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub function: Function,
    pub mode: Mode,
    pub stats: CompileStats,
    /// Resume targets, for suspendable functions
    pub dispatch: Option<DispatchTable>,
    /// Frame layout, for suspendable functions
    pub frame: Option<FrameLayout>,
}

impl CompiledArtifact {
    pub fn is_state_machine(&self) -> bool {
        self.dispatch.is_some()
    }
}

/// Compile `code` to verified IR
#[instrument(skip_all, fields(name = %code.name))]
pub fn compile(
    code: &CodeObject,
    options: &CompileOptions,
    optimizer: &Optimizer,
) -> Result<CompiledArtifact, CompileError> {
    if let Some(limit) = options.max_code_units {
        let units = code.code_units();
        if units > limit {
            return Err(CompileError::TooLarge { name: code.name.clone(), units, limit });
        }
    }

    // Step 1: Decode
    let decoded = decode_function(code)?;
    tracing::debug!(
        instructions = decoded.instructions.len(),
        regions = decoded.regions.len(),
        "decoded"
    );

    // Step 2: Mode admission
    if options.mode == Mode::Integer {
        validate_integer_mode(code, &decoded)?;
    }

    // Step 3: CFG and depths
    let machine = suspend::needs_state_machine(code, &decoded);
    let mut cfg = build_cfg(decoded, CfgOptions { split_suspensions: machine })?;
    let depths = propagate_depths(&mut cfg)?;
    let traversal = compute_order(&mut cfg);
    tracing::debug!(blocks = cfg.blocks.len(), max_depth = depths.max_depth, "cfg built");

    // Step 4: Merge and suspension plans
    let plan = plan_merges(&cfg, &traversal);
    let suspension = machine.then(|| {
        let liveness = Liveness::compute(&cfg, code.varnames.len());
        suspend::plan(code, &cfg, &liveness)
    });

    // Step 5: Lower
    let lower_options = LowerOptions { mode: options.mode, release_gil: options.release_gil };
    let lowered =
        lower_function(code, &cfg, &traversal, &plan, suspension.as_ref(), lower_options)?;
    let stats = CompileStats {
        blocks: traversal.rpo.len(),
        placeholders: lowered.placeholders,
        completed_placeholders: lowered.completed_placeholders,
        back_edges: traversal.back_edges.len(),
        landing_pads: lowered.landing_pads,
    };
    tracing::debug!(
        blocks = stats.blocks,
        placeholders = stats.placeholders,
        landing_pads = stats.landing_pads,
        "lowered"
    );

    // Step 6: Optimize and verify
    let mut function = lowered.function;
    if options.optimize {
        optimizer.optimize(&mut function);
    }
    if options.verify_ir {
        verify_function(&function)?;
    }
    tracing::debug!(ops = function.op_count(), phis = function.phi_count(), "compiled");

    Ok(CompiledArtifact {
        function,
        mode: options.mode,
        stats,
        dispatch: lowered.dispatch,
        frame: suspension.map(|s| s.layout),
    })
}

/// Complete compilation pipeline
///
/// Chains: decode → CFG → lower → optimize → backend.compile_function()
pub struct JitPipeline<B: CodegenBackend> {
    backend: B,
    optimizer: Optimizer,
}

impl<B: CodegenBackend> JitPipeline<B> {
    /// Create a new pipeline with the default optimizer
    pub fn new(backend: B) -> Self {
        JitPipeline { backend, optimizer: Optimizer::new() }
    }

    /// Create a pipeline with a custom optimizer
    pub fn with_optimizer(backend: B, optimizer: Optimizer) -> Self {
        JitPipeline { backend, optimizer }
    }

    /// Compile to IR without involving the backend
    pub fn lower(
        &self,
        code: &CodeObject,
        options: &CompileOptions,
    ) -> Result<CompiledArtifact, CompileError> {
        compile(code, options, &self.optimizer)
    }

    /// Compile a single function through the full pipeline
    pub fn compile_function(
        &self,
        code: &CodeObject,
        options: &CompileOptions,
    ) -> Result<(CompiledArtifact, CompiledCode), CompileError> {
        let artifact = self.lower(code, options)?;
        let compiled = self.backend.compile_function(&artifact)?;
        Ok((artifact, compiled))
    }

    /// Get a reference to the backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get a reference to the optimizer
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use kiln_bytecode::{Assembler, Constant, Opcode};

    fn add_const() -> CodeObject {
        let mut code = CodeObject::new("add_const");
        code.constants = vec![Constant::Int(3), Constant::Int(5)];
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0)
            .emit(Opcode::LoadConst, 1)
            .emit(Opcode::BinaryOp, 0)
            .op(Opcode::ReturnValue);
        asm.finish_into(code).unwrap()
    }

    #[test]
    fn test_pipeline_simple_return() {
        let mut code = CodeObject::new("answer");
        code.constants = vec![Constant::Int(42)];
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnConst, 0);
        let code = asm.finish_into(code).unwrap();

        let pipeline = JitPipeline::new(StubBackend);
        let (artifact, compiled) = pipeline
            .compile_function(&code, &CompileOptions::default())
            .unwrap();
        assert_eq!(artifact.function.name, "answer");
        assert_eq!(artifact.mode, Mode::Object);
        assert!(!compiled.code.is_empty());
    }

    #[test]
    fn test_pipeline_folds_integer_constants() {
        let pipeline = JitPipeline::new(StubBackend);
        let artifact = pipeline
            .lower(&add_const(), &CompileOptions::with_mode(Mode::Integer))
            .unwrap();
        let display = artifact.function.to_string();
        assert!(display.contains("const.int 8"), "{}", display);
        assert!(!display.contains("iadd"), "{}", display);
        // Stats describe the function before folding removed its pad.
        assert_eq!(artifact.stats.landing_pads, 1);
    }

    #[test]
    fn test_pipeline_without_optimizer_keeps_checked_add() {
        let pipeline = JitPipeline::with_optimizer(StubBackend, Optimizer::empty());
        let artifact = pipeline
            .lower(&add_const(), &CompileOptions::with_mode(Mode::Integer))
            .unwrap();
        assert!(artifact.function.to_string().contains("iadd"));
    }

    #[test]
    fn test_pipeline_integer_rejection_is_downgrade() {
        let mut code = CodeObject::new("div");
        code.constants = vec![Constant::Int(1), Constant::Int(2)];
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0)
            .emit(Opcode::LoadConst, 1)
            .emit(Opcode::BinaryOp, 11)
            .op(Opcode::ReturnValue);
        let code = asm.finish_into(code).unwrap();
        let err = compile(&code, &CompileOptions::with_mode(Mode::Integer), &Optimizer::new())
            .unwrap_err();
        assert!(err.is_mode_downgrade());
        assert!(!err.is_fallback());
        assert!(compile(&code, &CompileOptions::default(), &Optimizer::new()).is_ok());
    }

    #[test]
    fn test_pipeline_size_guard_is_fallback() {
        let options = CompileOptions { max_code_units: Some(2), ..CompileOptions::default() };
        let err = compile(&add_const(), &options, &Optimizer::new()).unwrap_err();
        assert!(matches!(err, CompileError::TooLarge { units: 4, limit: 2, .. }));
        assert!(err.is_fallback());
    }

    #[test]
    fn test_pipeline_decode_error_is_fatal() {
        let mut code = CodeObject::new("truncated");
        code.code = vec![Opcode::LoadConst as u8];
        let err = compile(&code, &CompileOptions::default(), &Optimizer::new()).unwrap_err();
        assert!(matches!(err, CompileError::Decode(_)));
        assert!(!err.is_fallback() && !err.is_mode_downgrade());
    }
}
