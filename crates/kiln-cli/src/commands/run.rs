//! `kiln run`: compile a function and execute it on the portable backend

use std::fmt::Write;
use std::path::Path;

use anyhow::{bail, Context};
use kiln_bytecode::CodeObject;
use kiln_jit::backend::interp::{ObjRef, Outcome, RefHeap, Resume, Value};
use kiln_jit::backend::InterpBackend;
use kiln_jit::{CompiledArtifact, JitConfig, JitEngine, Mode};

/// Generators are abandoned after this many yields unless told otherwise
pub const DEFAULT_YIELD_LIMIT: usize = 10_000;

pub struct RunArgs<'a> {
    pub file: &'a Path,
    /// Integer arguments, boxed as objects unless the function runs in integer mode
    pub args: &'a [i64],
    pub step_limit: Option<usize>,
    pub yield_limit: usize,
}

pub fn execute(args: RunArgs<'_>, config: &JitConfig) -> anyhow::Result<String> {
    let code = crate::load_code(args.file)?;
    if args.args.len() != code.arg_count as usize {
        bail!("{} takes {} arguments, {} given", code.name, code.arg_count, args.args.len());
    }
    let engine = JitEngine::with_config(config.clone());
    let compiled = engine.compile(&code)?;
    let backend = match args.step_limit {
        Some(limit) => InterpBackend::new(limit),
        None => InterpBackend::default(),
    };
    tracing::debug!(name = %code.name, mode = %compiled.mode(), "running");

    let mut heap = RefHeap::new();
    let out = if compiled.artifact.is_state_machine() {
        drive(&backend, &code, &compiled.artifact, &mut heap, args.args, args.yield_limit)?
    } else {
        call(&backend, &code, &compiled.artifact, &mut heap, args.args)?
    };
    if let Err(violation) = heap.audit() {
        tracing::warn!(%violation, "reference counts inconsistent after run");
    }
    Ok(out)
}

fn call(
    backend: &InterpBackend,
    code: &CodeObject,
    artifact: &CompiledArtifact,
    heap: &mut RefHeap,
    ints: &[i64],
) -> anyhow::Result<String> {
    let args: Vec<Value> = match artifact.mode {
        Mode::Integer => ints.iter().map(|&n| Value::Int(n)).collect(),
        Mode::Object => ints.iter().map(|&n| Value::Obj(heap.int(n))).collect(),
    };
    let outcome = backend.run(code, artifact, heap, &args).context("execution failed")?;
    for arg in &args {
        if let Value::Obj(obj) = arg {
            heap.decref(*obj);
        }
    }
    match outcome {
        Outcome::Returned(value) => Ok(format!("{}\n", render(heap, value))),
        Outcome::Raised => Err(raised(heap)),
        Outcome::Suspended(_) => bail!("{} suspended outside a state machine", code.name),
    }
}

/// Resume a generator until it returns, sending `None` after every yield
fn drive(
    backend: &InterpBackend,
    code: &CodeObject,
    artifact: &CompiledArtifact,
    heap: &mut RefHeap,
    ints: &[i64],
    yield_limit: usize,
) -> anyhow::Result<String> {
    let mut args: Vec<ObjRef> = ints.iter().map(|&n| heap.int(n)).collect();
    // Free variables are not supplied on the command line.
    for _ in &code.freevars {
        args.push(heap.none());
    }
    let started = backend.start(artifact, heap, &args);
    for obj in args {
        heap.decref(obj);
    }
    let mut frame = started.context("failed to create the generator frame")?;

    let mut out = String::new();
    let mut resume = Resume::Start;
    let mut yields = 0;
    loop {
        let outcome = match backend.resume(code, artifact, heap, &mut frame, resume) {
            Ok(outcome) => outcome,
            Err(e) => {
                frame.release(heap);
                return Err(e).context("execution failed");
            }
        };
        match outcome {
            Outcome::Suspended(value) => {
                writeln!(out, "yield {}", render(heap, value))?;
                release(heap, value);
                yields += 1;
                if yields >= yield_limit {
                    frame.release(heap);
                    writeln!(out, "stopped after {} yields", yields)?;
                    return Ok(out);
                }
                resume = Resume::Send(heap.none());
            }
            Outcome::Returned(value) => {
                writeln!(out, "return {}", render(heap, value))?;
                release(heap, value);
                return Ok(out);
            }
            Outcome::Raised => {
                frame.release(heap);
                return Err(raised(heap));
            }
        }
    }
}

fn render(heap: &RefHeap, value: Value) -> String {
    match value {
        Value::Obj(obj) => heap.repr(obj),
        Value::Int(n) => n.to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
    }
}

fn release(heap: &mut RefHeap, value: Value) {
    if let Value::Obj(obj) = value {
        heap.decref(obj);
    }
}

fn raised(heap: &mut RefHeap) -> anyhow::Error {
    match heap.take_exception() {
        Some(exc) => {
            let message = heap.repr(exc);
            heap.decref(exc);
            anyhow::anyhow!("uncaught exception: {}", message)
        }
        None => anyhow::anyhow!("function raised without an active exception"),
    }
}
