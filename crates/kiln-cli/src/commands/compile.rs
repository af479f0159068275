//! `kiln compile`: compile one function and report what came out

use std::fmt::Write;
use std::path::Path;

use kiln_jit::{CompiledFunction, JitConfig, JitEngine};

pub struct CompileArgs<'a> {
    pub file: &'a Path,
    pub json: bool,
}

pub fn execute(args: CompileArgs<'_>, config: &JitConfig) -> anyhow::Result<String> {
    let code = crate::load_code(args.file)?;
    let engine = JitEngine::with_config(config.clone());
    let compiled = engine.compile(&code)?;
    if args.json {
        return Ok(serde_json::to_string_pretty(&summary_json(&code.name, &compiled))?);
    }
    Ok(summary(&code.name, &compiled))
}

fn summary(name: &str, compiled: &CompiledFunction) -> String {
    let stats = &compiled.artifact.stats;
    let mut out = String::new();
    let _ = write!(out, "compiled {} in {} mode", name, compiled.mode());
    if compiled.downgraded {
        out.push_str(" (downgraded)");
    }
    out.push('\n');
    let _ = writeln!(out, "  blocks:       {}", stats.blocks);
    let _ = writeln!(
        out,
        "  placeholders: {} ({} completed)",
        stats.placeholders, stats.completed_placeholders
    );
    let _ = writeln!(out, "  back edges:   {}", stats.back_edges);
    let _ = writeln!(out, "  landing pads: {}", stats.landing_pads);
    if let Some(dispatch) = &compiled.artifact.dispatch {
        let _ = writeln!(out, "  states:       {}", dispatch.len());
    }
    let _ = writeln!(out, "  code bytes:   {}", compiled.code.code.len());
    out
}

fn summary_json(name: &str, compiled: &CompiledFunction) -> serde_json::Value {
    let stats = &compiled.artifact.stats;
    serde_json::json!({
        "name": name,
        "mode": compiled.mode().to_string(),
        "downgraded": compiled.downgraded,
        "blocks": stats.blocks,
        "placeholders": stats.placeholders,
        "completed_placeholders": stats.completed_placeholders,
        "back_edges": stats.back_edges,
        "landing_pads": stats.landing_pads,
        "states": compiled.artifact.dispatch.as_ref().map(|d| d.len()),
        "code_bytes": compiled.code.code.len(),
    })
}
