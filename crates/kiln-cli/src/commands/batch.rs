//! `kiln batch`: compile every code object in a directory on the worker pool

use std::fmt::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use kiln_jit::{JitConfig, JitEngine};

pub struct BatchArgs<'a> {
    /// A directory of `.json` code objects, or individual files
    pub paths: &'a [PathBuf],
}

/// Counts reported at the end of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub compiled: usize,
    pub downgraded: usize,
    pub fallbacks: usize,
    pub errors: usize,
}

pub fn execute(args: BatchArgs<'_>, config: &JitConfig) -> anyhow::Result<String> {
    let files = collect_files(args.paths)?;
    if files.is_empty() {
        bail!("no code objects found");
    }
    let codes = files
        .iter()
        .map(|file| crate::load_code(file))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let engine = JitEngine::with_config(config.clone());
    tracing::info!(
        functions = codes.len(),
        workers = config.effective_workers().min(codes.len()),
        "batch compile"
    );
    let results = engine.compile_batch(&codes);

    let mut out = String::new();
    let mut summary = BatchSummary::default();
    for ((file, code), result) in files.iter().zip(&codes).zip(&results) {
        match result {
            Ok(compiled) => {
                summary.compiled += 1;
                let note = if compiled.downgraded {
                    summary.downgraded += 1;
                    " (downgraded)"
                } else {
                    ""
                };
                writeln!(out, "ok       {} [{}]{}", code.name, compiled.mode(), note)?;
            }
            Err(e) if e.is_fallback() => {
                summary.fallbacks += 1;
                writeln!(out, "fallback {}: {}", code.name, e)?;
            }
            Err(e) => {
                summary.errors += 1;
                writeln!(out, "error    {} ({}): {}", code.name, file.display(), e)?;
            }
        }
    }
    writeln!(
        out,
        "{} compiled ({} downgraded), {} left to the interpreter, {} failed",
        summary.compiled, summary.downgraded, summary.fallbacks, summary.errors
    )?;
    if summary.errors > 0 {
        bail!("{}{} functions failed to compile", out, summary.errors);
    }
    Ok(out)
}

/// Expand directories into their `.json` files, sorted by path
fn collect_files(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let entries = std::fs::read_dir(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut found = Vec::new();
            for entry in entries {
                let entry = entry.with_context(|| format!("failed to read {}", path.display()))?;
                let file = entry.path();
                if is_code_file(&file) {
                    found.push(file);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn is_code_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}
