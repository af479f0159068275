//! Top-level JIT engine: mode selection, downgrade and batch compilation

use crossbeam::channel;
use kiln_bytecode::CodeObject;
use tracing::{info, warn};

use crate::backend::{CodegenBackend, CodegenError, CompiledCode, InterpBackend};
use crate::config::JitConfig;
use crate::ir::Mode;
use crate::pipeline::{CompileError, CompiledArtifact, JitPipeline};

/// A function compiled by the engine
#[derive(Debug)]
pub struct CompiledFunction {
    pub artifact: CompiledArtifact,
    pub code: CompiledCode,
    /// Integer mode was refused and the function was recompiled in object mode
    pub downgraded: bool,
}

impl CompiledFunction {
    pub fn mode(&self) -> Mode {
        self.artifact.mode
    }
}

/// Top-level JIT engine
pub struct JitEngine<B: CodegenBackend = InterpBackend> {
    pipeline: JitPipeline<B>,
    config: JitConfig,
}

impl JitEngine<InterpBackend> {
    /// Create an engine on the portable backend with default configuration
    pub fn new() -> Self {
        Self::with_config(JitConfig::default())
    }

    /// Create an engine on the portable backend with custom configuration
    pub fn with_config(config: JitConfig) -> Self {
        Self::with_backend(InterpBackend::default(), config)
    }
}

impl Default for JitEngine<InterpBackend> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "native")]
impl JitEngine<crate::backend::cranelift::CraneliftBackend> {
    /// Create an engine emitting native code for the host
    pub fn native(config: JitConfig) -> Result<Self, CodegenError> {
        let backend = crate::backend::cranelift::CraneliftBackend::host()?;
        Ok(Self::with_backend(backend, config))
    }
}

impl<B: CodegenBackend> JitEngine<B> {
    pub fn with_backend(backend: B, config: JitConfig) -> Self {
        JitEngine { pipeline: JitPipeline::new(backend), config }
    }

    /// Compile in the configured default mode
    pub fn compile(&self, code: &CodeObject) -> Result<CompiledFunction, CompileError> {
        self.compile_with_mode(code, self.config.default_mode)
    }

    /// Compile in `mode`, downgrading to object mode when allowed
    pub fn compile_with_mode(
        &self,
        code: &CodeObject,
        mode: Mode,
    ) -> Result<CompiledFunction, CompileError> {
        match self.pipeline.compile_function(code, &self.config.compile_options(mode)) {
            Ok((artifact, compiled)) => Ok(CompiledFunction {
                artifact,
                code: compiled,
                downgraded: false,
            }),
            Err(err) if err.is_mode_downgrade() && self.config.allow_mode_downgrade => {
                info!(name = %code.name, reason = %err, "recompiling in object mode");
                let options = self.config.compile_options(Mode::Object);
                let (artifact, compiled) = self.pipeline.compile_function(code, &options)?;
                Ok(CompiledFunction { artifact, code: compiled, downgraded: true })
            }
            Err(err) => {
                if err.is_fallback() {
                    info!(name = %code.name, reason = %err, "leaving function to the interpreter");
                }
                Err(err)
            }
        }
    }

    /// Compile independent functions on the worker pool
    ///
    /// Results are returned in input order.
    pub fn compile_batch(
        &self,
        codes: &[CodeObject],
    ) -> Vec<Result<CompiledFunction, CompileError>> {
        if codes.is_empty() {
            return Vec::new();
        }
        let workers = self.config.effective_workers().min(codes.len());

        let (job_tx, job_rx) = channel::unbounded::<usize>();
        for index in 0..codes.len() {
            // The receiver is alive until the scope below ends
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        let (result_tx, result_rx) = channel::unbounded();
        let scoped = crossbeam::thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                s.spawn(move |_| {
                    for index in job_rx.iter() {
                        let result = self.compile(&codes[index]);
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);
        if scoped.is_err() {
            warn!("a batch worker panicked");
        }

        let mut slots: Vec<Option<Result<CompiledFunction, CompileError>>> =
            codes.iter().map(|_| None).collect();
        for (index, result) in result_rx.try_iter() {
            slots[index] = Some(result);
        }

        slots
            .into_iter()
            .zip(codes)
            .map(|(slot, code)| {
                let result = slot.unwrap_or_else(|| {
                    Err(CompileError::Codegen(CodegenError::BackendError(format!(
                        "worker stopped before compiling '{}'",
                        code.name
                    ))))
                });
                if let Err(err) = &result {
                    if !err.is_fallback() {
                        warn!(name = %code.name, error = %err, "batch compile failed");
                    }
                }
                result
            })
            .collect()
    }

    /// Get a reference to the compilation pipeline
    pub fn pipeline(&self) -> &JitPipeline<B> {
        &self.pipeline
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_bytecode::{Assembler, Constant, Opcode};

    fn add_args(name: &str) -> CodeObject {
        let mut code = CodeObject::new(name);
        code.arg_count = 2;
        code.varnames = vec!["a".into(), "b".into()];
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadFast, 0)
            .emit(Opcode::LoadFast, 1)
            .emit(Opcode::BinaryOp, 0)
            .op(Opcode::ReturnValue);
        asm.finish_into(code).unwrap()
    }

    fn returns_string() -> CodeObject {
        let mut code = CodeObject::new("greeting");
        code.constants = vec![Constant::Str("hi".into())];
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnConst, 0);
        asm.finish_into(code).unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let engine = JitEngine::new();
        assert_eq!(engine.pipeline().backend().name(), "interp");
        assert_eq!(engine.config().default_mode, Mode::Object);
    }

    #[test]
    fn test_engine_with_config() {
        let config = JitConfig {
            default_mode: Mode::Integer,
            worker_threads: Some(2),
            ..Default::default()
        };
        let engine = JitEngine::with_config(config);
        let compiled = engine.compile(&add_args("add")).unwrap();
        assert_eq!(compiled.mode(), Mode::Integer);
        assert!(!compiled.downgraded);
    }

    #[test]
    fn test_engine_downgrades_integer_mode() {
        let engine = JitEngine::with_config(JitConfig {
            default_mode: Mode::Integer,
            ..Default::default()
        });
        let compiled = engine.compile(&returns_string()).unwrap();
        assert_eq!(compiled.mode(), Mode::Object);
        assert!(compiled.downgraded);
    }

    #[test]
    fn test_engine_downgrade_disabled() {
        let config = JitConfig {
            default_mode: Mode::Integer,
            allow_mode_downgrade: false,
            ..Default::default()
        };
        let err = JitEngine::with_config(config).compile(&returns_string()).unwrap_err();
        assert!(err.is_mode_downgrade());
    }

    #[test]
    fn test_engine_size_guard_is_fallback() {
        let config = JitConfig { max_code_units: Some(2), ..Default::default() };
        let err = JitEngine::with_config(config).compile(&add_args("long")).unwrap_err();
        assert!(err.is_fallback());
    }

    #[test]
    fn test_engine_batch_preserves_order() {
        let engine = JitEngine::with_config(JitConfig {
            worker_threads: Some(3),
            ..Default::default()
        });
        let codes: Vec<CodeObject> = (0..8).map(|i| add_args(&format!("f{i}"))).collect();
        let results = engine.compile_batch(&codes);
        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.as_ref().unwrap().artifact.function.name, format!("f{i}"));
        }
    }

    #[test]
    fn test_engine_batch_reports_failures_in_place() {
        let config = JitConfig {
            default_mode: Mode::Integer,
            allow_mode_downgrade: false,
            ..Default::default()
        };
        let engine = JitEngine::with_config(config);
        let codes = vec![add_args("ok"), returns_string(), add_args("also_ok")];
        let results = engine.compile_batch(&codes);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_mode_downgrade());
        assert!(results[2].is_ok());
        assert!(engine.compile_batch(&[]).is_empty());
    }
}
