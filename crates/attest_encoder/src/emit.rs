//! Payload assembly: shared encoder state, the SMT-LIB template, and the
//! per-mode action that closes the script.
//!
//! Sections are generated into marker slots of a fixed template so the
//! declaration order stays valid regardless of which features a given
//! assembly exercises: tags and datatypes first, then the fact tables and
//! derived declarations, then function definitions in dependency order, and
//! the action last.

use attest_common::config::{EncodeOptions, VerifyMode};
use attest_common::data::assembly::{InvokeDecl, InvokeId, InvokeKey, Program};
use attest_common::data::mir::Op;
use attest_common::data::smt::{render_define_funs_rec, SmtExp, SmtFunctionDef, SmtSort};
use attest_common::util::intern::NameInterner;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::body::translate_invoke;
use crate::boxing::BoxEmitter;
use crate::error::EncodeError;
use crate::faults::FaultRegistry;
use crate::havoc::{self, HavocGen};
use crate::lists::ListEncoder;
use crate::safety::SafetyAnalysis;

/// Payload sections in their required declaration order.
const SECTIONS: [&str; 14] = [
    ";;TYPE_TAG_DECLS;;",
    ";;SORT_DECLS;;",
    ";;SUBTYPE_FACTS;;",
    ";;INDEX_FACTS;;",
    ";;PROPERTY_FACTS;;",
    ";;BOX_DECLS;;",
    ";;RESULT_DECLS;;",
    ";;MASK_DECLS;;",
    ";;LIST_DECLS;;",
    ";;HAVOC_DECLS;;",
    ";;FUNCTION_DEFS;;",
    ";;CONSTANT_DECLS;;",
    ";;OP_AXIOMS;;",
    ";;ACTION;;",
];

static PAYLOAD_TEMPLATE: Lazy<String> = Lazy::new(|| {
    let mut out = String::from("(set-logic ALL)\n");
    for marker in SECTIONS {
        out.push_str(marker);
        out.push('\n');
    }
    out
});

/// Shared state threaded through every translation stage.
pub(crate) struct EncodeCtx<'a> {
    pub prog: &'a Program,
    pub opts: EncodeOptions,
    pub safety: SafetyAnalysis,
    pub boxing: BoxEmitter<'a>,
    pub lists: ListEncoder,
    pub faults: FaultRegistry,
    pub names: NameInterner,
    pub havoc: HavocGen,
    /// Synthesized helper functions (projection, update, dispatch, callback
    /// wrappers), memoized by a structural key.
    pub thunk_memo: BTreeMap<String, String>,
    /// Free constants minted during translation: unconstrained witnesses and
    /// havoc path roots.
    pub extra_decls: Vec<String>,
    fresh_consts: usize,
}

impl<'a> EncodeCtx<'a> {
    pub fn new(
        prog: &'a Program,
        opts: EncodeOptions,
        roots: &[InvokeKey],
    ) -> Result<EncodeCtx<'a>, EncodeError> {
        let safety = SafetyAnalysis::analyze(prog, roots, &opts)?;
        let mut boxing = BoxEmitter::new(prog, &opts);
        let lists = ListEncoder::new(&mut boxing, &opts)?;
        Ok(EncodeCtx {
            prog,
            opts,
            safety,
            boxing,
            lists,
            faults: FaultRegistry::new(),
            names: NameInterner::new(),
            havoc: HavocGen::new(),
            thunk_memo: BTreeMap::new(),
            extra_decls: Vec::new(),
            fresh_consts: 0,
        })
    }

    /// A fresh unconstrained constant of `sort`, declared at global scope.
    pub fn fresh_const(&mut self, sort: &SmtSort) -> SmtExp {
        let name = format!("$w{}", self.fresh_consts);
        self.fresh_consts += 1;
        self.extra_decls
            .push(format!("(declare-const {} {})", name, sort.name));
        SmtExp::Var(name)
    }
}

#[derive(Debug)]
pub struct EncodeOutput {
    pub payload: String,
    pub api_module: serde_json::Value,
    pub faults: FaultRegistry,
}

/// Encodes one entrypoint of a loaded assembly into a complete solver script.
pub fn encode_assembly(
    prog: &Program,
    entrypoint: &InvokeKey,
    opts: &EncodeOptions,
) -> Result<EncodeOutput, EncodeError> {
    let entry = prog
        .invoke(entrypoint)
        .ok_or_else(|| EncodeError::UnknownEntrypoint(entrypoint.0.clone()))?;
    if entry.primitive.is_some() {
        return Err(EncodeError::MalformedOp {
            sinfo: entrypoint.0.clone(),
            detail: "entrypoint is a primitive".to_owned(),
        });
    }

    // Constants are evaluated up front and entity invariants constrain
    // havoc'd values, so both count as roots alongside the entrypoint.
    let mut roots = vec![entrypoint.clone()];
    for constant in prog.constants.values() {
        roots.push(constant.value_invoke.clone());
    }
    for decl in prog.entities.values() {
        if let Some(invariant) = &decl.invariant {
            roots.push(invariant.clone());
        }
    }

    let mut ctx = EncodeCtx::new(prog, opts.clone(), &roots)?;

    let mut const_by_invoke: BTreeMap<InvokeId, Vec<String>> = BTreeMap::new();
    for (key, constant) in &prog.constants {
        let id = prog
            .invoke_ids
            .get(&constant.value_invoke)
            .ok_or_else(|| EncodeError::MissingKey {
                referrer: format!("constant '{}'", key),
                missing: constant.value_invoke.0.clone(),
            })?;
        const_by_invoke.entry(*id).or_default().push(key.clone());
    }

    let plan: Vec<(bool, Vec<InvokeId>)> = ctx
        .safety
        .groups
        .iter()
        .map(|group| {
            (
                group.recursive,
                group
                    .nodes
                    .iter()
                    .copied()
                    .filter(|id| ctx.safety.reachable.contains(id))
                    .collect(),
            )
        })
        .collect();

    let mut function_defs = String::new();
    let mut constant_asserts = String::new();
    for (recursive, nodes) in plan {
        if nodes.is_empty() {
            continue;
        }
        if recursive {
            reject_cyclic_constant_reads(prog, &nodes, &const_by_invoke)?;
        }
        let mut helpers = Vec::new();
        let mut mains = Vec::new();
        for &id in &nodes {
            let translated = translate_invoke(&mut ctx, id)?;
            helpers.extend(translated.helpers);
            mains.extend(translated.main);
        }
        if recursive {
            // Helpers of a cyclic group may call back into the group, so the
            // whole cluster becomes one joint recursive definition.
            helpers.extend(mains);
            function_defs.push_str(&render_define_funs_rec(&helpers));
            function_defs.push('\n');
        } else {
            for def in helpers.iter().chain(&mains) {
                function_defs.push_str(&def.render());
                function_defs.push('\n');
            }
        }
        for &id in &nodes {
            if let Some(keys) = const_by_invoke.get(&id) {
                for key in keys.clone() {
                    emit_constant(&mut ctx, &key, &mut function_defs, &mut constant_asserts)?;
                }
            }
        }
    }

    let action = build_action(&mut ctx, entrypoint, entry)?;

    let mut sort_defs = ctx.boxing.datatype_defs();
    sort_defs.push(ctx.lists.datatype_def());

    let mut havoc_decls = ctx.havoc.render_havoc_decls();
    for decl in &ctx.extra_decls {
        havoc_decls.push_str(decl);
        havoc_decls.push('\n');
    }

    let payload = fill_template(&[
        (";;TYPE_TAG_DECLS;;", ctx.boxing.render_tag_decls()),
        (";;SORT_DECLS;;", crate::boxing::render_datatypes(&sort_defs)),
        (";;SUBTYPE_FACTS;;", ctx.boxing.render_subtype_facts()),
        (";;INDEX_FACTS;;", ctx.boxing.render_index_facts()),
        (";;PROPERTY_FACTS;;", ctx.boxing.render_property_facts()),
        (";;BOX_DECLS;;", ctx.boxing.render_box_decls()),
        (";;RESULT_DECLS;;", ctx.boxing.render_result_decls()),
        (";;MASK_DECLS;;", ctx.boxing.render_mask_decls()),
        (";;LIST_DECLS;;", ctx.lists.render_list_decls()),
        (";;HAVOC_DECLS;;", havoc_decls),
        (";;FUNCTION_DEFS;;", function_defs),
        (";;CONSTANT_DECLS;;", constant_asserts),
        (";;OP_AXIOMS;;", ctx.lists.render_op_axioms()),
        (";;ACTION;;", action),
    ]);

    let api_module = crate::api::api_module(prog, entry, &ctx.faults)?;
    let EncodeCtx { faults, .. } = ctx;
    Ok(EncodeOutput {
        payload,
        api_module,
        faults,
    })
}

/// A constant read from inside its own value invocation's recursive group
/// would render before the constant's nullary definition exists, so the
/// whole configuration is rejected up front.
fn reject_cyclic_constant_reads(
    prog: &Program,
    nodes: &[InvokeId],
    const_by_invoke: &BTreeMap<InvokeId, Vec<String>>,
) -> Result<(), EncodeError> {
    let mut defined: BTreeSet<&str> = BTreeSet::new();
    for id in nodes {
        if let Some(keys) = const_by_invoke.get(id) {
            defined.extend(keys.iter().map(String::as_str));
        }
    }
    if defined.is_empty() {
        return Ok(());
    }
    for &id in nodes {
        let Some(body) = &prog.invokes[id].body else {
            continue;
        };
        for block in &body.blocks {
            for op in &block.ops {
                if let Op::AccessConstant {
                    sinfo, const_key, ..
                } = op
                {
                    if defined.contains(const_key.as_str()) {
                        return Err(EncodeError::MalformedOp {
                            sinfo: sinfo.to_string(),
                            detail: format!(
                                "constant '{}' is read inside its value invocation's \
                                 recursive group",
                                const_key
                            ),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn fill_template(sections: &[(&str, String)]) -> String {
    let mut out = PAYLOAD_TEMPLATE.clone();
    for (marker, content) in sections {
        debug_assert!(out.contains(marker), "unknown section {}", marker);
        let mut replacement = content.trim_end().to_owned();
        if !replacement.is_empty() {
            replacement.push('\n');
        }
        out = out.replacen(&format!("{}\n", marker), &replacement, 1);
    }
    out
}

/// One constant pinned to its value invocation: a nullary definition, plus an
/// assertion that evaluation does not fault when the invocation is unsafe.
fn emit_constant(
    ctx: &mut EncodeCtx,
    key: &str,
    function_defs: &mut String,
    constant_asserts: &mut String,
) -> Result<(), EncodeError> {
    let prog = ctx.prog;
    let constant = &prog.constants[key];
    let decl = prog
        .invoke(&constant.value_invoke)
        .ok_or_else(|| EncodeError::MissingKey {
            referrer: format!("constant '{}'", key),
            missing: constant.value_invoke.0.clone(),
        })?;
    if !decl.params.is_empty() {
        return Err(EncodeError::MalformedOp {
            sinfo: format!("constant '{}'", key),
            detail: "value invocation takes parameters".to_owned(),
        });
    }

    let fname = ctx.names.mint("$i_", &constant.value_invoke.0);
    let cname = ctx.names.mint("$c_", key);
    let fact = ctx
        .safety
        .fact(prog, &constant.value_invoke)
        .expect("constant value invocations are roots");
    let value_sort = ctx.boxing.sort_of(&decl.result_type)?;
    let const_sort = ctx.boxing.sort_of(&constant.const_type)?;
    let coercion = ctx.boxing.coerce(&decl.result_type, &constant.const_type)?;

    let call = SmtExp::CallSimple {
        fname,
        args: Vec::new(),
    };
    let raw = if fact.safe {
        call
    } else {
        let repr = ctx.boxing.result_repr(&value_sort);
        let _ = writeln!(
            constant_asserts,
            "(assert (not {}))",
            repr.is_err(call.clone()).render(0)
        );
        repr.unwrap_ok(call)
    };
    let body = match coercion {
        Some(f) => SmtExp::call(f, vec![raw]),
        None => raw,
    };

    let def = SmtFunctionDef {
        name: cname,
        params: Vec::new(),
        result: const_sort,
        body,
    };
    function_defs.push_str(&def.render());
    function_defs.push('\n');
    Ok(())
}

/// The closing commands: havoc'd entry arguments, the mode-specific
/// assertions, and `check-sat`.
fn build_action(
    ctx: &mut EncodeCtx,
    entry_key: &InvokeKey,
    entry: &InvokeDecl,
) -> Result<String, EncodeError> {
    let prog = ctx.prog;
    let entry_fname = ctx.names.mint("$i_", &entry_key.0);
    let entry_fact = ctx
        .safety
        .fact(prog, entry_key)
        .expect("entrypoint is a root");
    let value_sort = ctx.boxing.sort_of(&entry.result_type)?;

    let mut args = Vec::new();
    for param in &entry.params {
        let root = ctx.fresh_const(&SmtSort::named(havoc::HAVOC_PATH_SORT));
        args.push(havoc::havoc_call(ctx, &param.param_type, root)?);
    }
    if entry.mask_size() > 0 {
        let repr = ctx.boxing.mask_repr(entry.mask_size());
        args.push(SmtExp::MaskConstruct {
            ctor: repr.ctor.clone(),
            bits: vec![SmtExp::bool_const(true); entry.mask_size()],
        });
    }
    let call = SmtExp::CallSimple {
        fname: entry_fname,
        args,
    };

    let mut out = ctx.havoc.render_constraints();
    match ctx.opts.mode {
        VerifyMode::Unreachable | VerifyMode::Witness => {
            let mode_name = match ctx.opts.mode {
                VerifyMode::Unreachable => "unreachable",
                _ => "witness",
            };
            let target = ctx
                .opts
                .target
                .clone()
                .ok_or(EncodeError::MissingTarget { mode: mode_name })?;
            let fault = ctx.faults.lookup_target(&target).ok_or_else(|| {
                EncodeError::MissingKey {
                    referrer: "verification target".to_owned(),
                    missing: format!("{}:{}:{}", target.file, target.line, target.pos),
                }
            })?;
            let code = ctx.faults.error_code(fault);

            if entry_fact.safe {
                // No fault escapes the entrypoint, so the target cannot fire.
                out.push_str("(assert false)\n");
            } else {
                let repr = ctx.boxing.result_repr(&value_sort);
                let res = SmtExp::Var("$entry@res".to_owned());
                let _ = writeln!(
                    out,
                    "(define-fun $entry@res () {} {})",
                    repr.sort.name,
                    call.render(1)
                );
                let _ = writeln!(out, "(assert {})", repr.is_err(res.clone()).render(0));
                let _ = writeln!(
                    out,
                    "(assert (= {} {}))",
                    repr.err_code(res).render(0),
                    code
                );
            }
            out.push_str("(check-sat)\n");
            if ctx.opts.mode == VerifyMode::Witness {
                out.push_str("(get-model)\n");
            }
        }
        VerifyMode::Evaluate => {
            let _ = writeln!(
                out,
                "(declare-const _@smtres@ {})",
                value_sort.name
            );
            if entry_fact.safe {
                let _ = writeln!(
                    out,
                    "(assert (= _@smtres@ {}))",
                    call.render(1)
                );
            } else {
                let repr = ctx.boxing.result_repr(&value_sort);
                let res = SmtExp::Var("$entry@res".to_owned());
                let _ = writeln!(
                    out,
                    "(define-fun $entry@res () {} {})",
                    repr.sort.name,
                    call.render(1)
                );
                let _ = writeln!(
                    out,
                    "(assert (not {}))",
                    repr.is_err(res.clone()).render(0)
                );
                let _ = writeln!(
                    out,
                    "(assert (= _@smtres@ {}))",
                    repr.unwrap_ok(res).render(0)
                );
            }
            out.push_str("(check-sat)\n");
            out.push_str("(get-value (_@smtres@))\n");
        }
    }
    Ok(out)
}
