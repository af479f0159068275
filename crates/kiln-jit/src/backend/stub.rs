//! Stub backend for testing the pipeline without real codegen
//!
//! Produces placeholder machine code (INT3 / BRK) to verify
//! the pipeline runs end-to-end without panics.

use super::traits::*;
use crate::pipeline::CompiledArtifact;

/// A stub backend that produces placeholder code (INT3 on x86, BRK on ARM)
pub struct StubBackend;

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile_function(&self, artifact: &CompiledArtifact) -> Result<CompiledCode, CodegenError> {
        // Emit a single-byte trap instruction as placeholder
        let trap_byte = match self.target_info().arch {
            TargetArch::X86_64 => 0xCC,
            TargetArch::AArch64 | TargetArch::Portable => 0x00,
        };

        Ok(CompiledCode {
            code: vec![trap_byte],
            entry_offset: 0,
            relocations: host_relocations(artifact),
        })
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::Optimizer;
    use crate::pipeline::{compile, CompileOptions};
    use crate::host::HostFn;
    use kiln_bytecode::{Assembler, CodeObject, Opcode};

    #[test]
    fn test_stub_compile_lists_host_calls() {
        let mut code = CodeObject::new("getattr");
        code.arg_count = 1;
        code.varnames = vec!["obj".into()];
        code.names = vec!["field".into()];
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadFast, 0).emit(Opcode::LoadAttr, 0).op(Opcode::ReturnValue);
        let code = asm.finish_into(code).unwrap();
        let artifact = compile(&code, &CompileOptions::default(), &Optimizer::new()).unwrap();

        let stub = StubBackend;
        assert_eq!(stub.name(), "stub");
        let compiled = stub.compile_function(&artifact).unwrap();
        assert_eq!(compiled.code.len(), 1);
        assert!(compiled.relocations.iter().any(|r| r.target == HostFn::GetAttr { name: 0 }));
    }
}
