//! `kiln dump`: print the decoded instructions, the CFG or the IR

use std::fmt::Write;
use std::path::Path;

use kiln_jit::analysis::cfg::build_cfg;
use kiln_jit::analysis::{
    compute_order, decode_function, propagate_depths, CfgOptions, ControlFlowGraph,
};
use kiln_jit::suspend::needs_state_machine;
use kiln_jit::{JitConfig, JitEngine};

/// What `kiln dump` prints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DumpStage {
    /// Decoded instructions with their stack depth
    Instructions,
    /// Basic blocks and their edges
    Cfg,
    /// The verified IR after optimization
    #[default]
    Ir,
}

pub struct DumpArgs<'a> {
    pub file: &'a Path,
    pub stage: DumpStage,
}

pub fn execute(args: DumpArgs<'_>, config: &JitConfig) -> anyhow::Result<String> {
    let code = crate::load_code(args.file)?;
    match args.stage {
        DumpStage::Instructions => {
            let cfg = analyze(&code)?;
            let mut out = String::new();
            for (instr, depth) in cfg.instructions.iter().zip(&cfg.depth_before) {
                match depth {
                    Some(depth) => writeln!(out, "[{:>2}] {}", depth, instr)?,
                    None => writeln!(out, "[ -] {}", instr)?,
                }
            }
            Ok(out)
        }
        DumpStage::Cfg => Ok(render_cfg(&analyze(&code)?)?),
        DumpStage::Ir => {
            let engine = JitEngine::with_config(config.clone());
            let compiled = engine.compile(&code)?;
            let mut out = compiled.artifact.function.to_string();
            if let Some(dispatch) = &compiled.artifact.dispatch {
                writeln!(out, "dispatch {}:", dispatch.entry)?;
                for (state, block) in &dispatch.states {
                    writeln!(out, "  state {} -> {}", state, block)?;
                }
            }
            Ok(out)
        }
    }
}

fn analyze(code: &kiln_bytecode::CodeObject) -> anyhow::Result<ControlFlowGraph> {
    let decoded = decode_function(code)?;
    let split_suspensions = needs_state_machine(code, &decoded);
    let mut cfg = build_cfg(decoded, CfgOptions { split_suspensions })?;
    propagate_depths(&mut cfg)?;
    compute_order(&mut cfg);
    Ok(cfg)
}

fn render_cfg(cfg: &ControlFlowGraph) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    for block in &cfg.blocks {
        write!(out, "{} @{}..{}", block.id, block.start, block.end)?;
        match (block.entry_depth, block.exit_depth) {
            (Some(entry), Some(exit)) => write!(out, " depth {} -> {}", entry, exit)?,
            _ => out.push_str(" unreachable"),
        }
        if block.is_loop_header {
            out.push_str(" loop");
        }
        if block.is_exception_handler {
            out.push_str(" handler");
        }
        out.push('\n');
        for instr in cfg.instrs(block.id) {
            writeln!(out, "    {}", instr)?;
        }
        for edge in &block.succs {
            let back = if edge.back_edge { " (back)" } else { "" };
            writeln!(out, "  {} -> {}{}", edge.kind, edge.target, back)?;
        }
        for edge in &block.exception_edges {
            writeln!(out, "  unwind -> {}", edge.handler)?;
        }
    }
    Ok(out)
}
