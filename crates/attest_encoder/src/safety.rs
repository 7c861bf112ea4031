//! Call-graph construction and the safety fixed point.
//!
//! Every invocation gets a `SafetyFact`: whether it can be proven fault-free,
//! whether its own body contains the designated target fault, and whether the
//! target fault is reachable through its call tree. The body translator
//! consults these facts to decide which call sites must thread a failure sum.

use attest_common::config::{EncodeOptions, TargetLocation};
use attest_common::data::assembly::{
    well_known, EntityDecl, InvokeDecl, InvokeId, InvokeKey, Program, TypeKey,
};
use attest_common::data::mir::{BinOpKind, Op, SourceInfo, UnOpKind};
use id_collections::IdVec;
use id_graph_sccs::{find_components, SccKind, Sccs};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::EncodeError;

/// Resolves a virtual call: the concrete entities flowing into the receiver
/// type, each paired with its vtable target. Every concrete entity under the
/// receiver must implement the abstract name, and the fan-out set must be
/// non-empty; both violations are construction faults.
pub fn resolve_virtual(
    prog: &Program,
    vname: &str,
    rcvr: &TypeKey,
) -> Result<Vec<(TypeKey, InvokeKey)>, EncodeError> {
    let rcvr_type = prog
        .lookup_type(rcvr)
        .ok_or_else(|| EncodeError::MissingKey {
            referrer: vname.to_owned(),
            missing: rcvr.0.clone(),
        })?
        .clone();

    let mut targets = Vec::new();
    for entity in prog.concrete_entities_under(&rcvr_type) {
        match prog.dispatch.get(&(entity.key.clone(), vname.to_owned())) {
            Some(target) => targets.push((entity.key.clone(), target.clone())),
            None => {
                return Err(EncodeError::MissingVirtualTarget {
                    entity: entity.key.0.clone(),
                    vname: vname.to_owned(),
                })
            }
        }
    }
    if targets.is_empty() {
        return Err(EncodeError::EmptyDispatch {
            vname: vname.to_owned(),
            receiver: rcvr.0.clone(),
        });
    }
    Ok(targets)
}

/// Whether a primitive-implementation tag denotes an operation with a modeled
/// fault. Unknown tags are conservatively treated as faulting.
pub fn primitive_can_fault(tag: &str, opts: &EncodeOptions) -> bool {
    match tag {
        // Out-of-bounds access.
        "list_get" | "list_front" | "list_back" => true,
        // Axiomatized only under the large-ops option; otherwise these encode
        // as an unconditional modeled fault.
        "list_map" | "list_filter" | "list_find" => !opts.large_ops,
        // Element addition can overflow even under large ops.
        "list_sum" => true,
        // Declared but unencoded; always fault.
        "list_zip" | "list_sort" | "list_join" | "list_reverse" => true,
        "list_size" | "list_empty" | "list_append" | "list_slice" | "list_fill"
        | "list_range" | "havoc" => false,
        _ => true,
    }
}

/// The invocation a map/filter/find primitive applies per element, declared as
/// a `callback=<invoke-key>` attribute on the primitive.
pub fn callback_key(decl: &InvokeDecl) -> Option<InvokeKey> {
    decl.attributes
        .iter()
        .find_map(|attr| attr.strip_prefix("callback="))
        .map(|key| InvokeKey(key.to_owned()))
}

fn construct_can_fault(entity: &EntityDecl, check_invariant: bool) -> bool {
    (check_invariant && entity.invariant.is_some())
        || entity.validator.is_some()
        || entity.numeric_range.is_some()
}

/// Whether this operation, by itself, has a modeled fault in the enclosing
/// frame. Call sites count when the fault is registered at the call site:
/// precondition violations, and faults of body-less primitive callees.
fn op_can_fault(prog: &Program, op: &Op, opts: &EncodeOptions) -> Result<bool, EncodeError> {
    let faults = match op {
        Op::BinOp { op, op_type, .. } => match op_type.0.as_str() {
            // Bounded bitvectors: overflow on all five, zero divisor on two.
            well_known::INT | well_known::NAT => true,
            well_known::BIG_INT => matches!(op, BinOpKind::Div | BinOpKind::Mod),
            _ => false,
        },
        Op::UnOp {
            op: UnOpKind::Negate,
            trgt_type,
            ..
        } => trgt_type.0 == well_known::INT,
        Op::Assert { .. } | Op::Abort { .. } => true,
        Op::ConstructEntity {
            entity,
            check_invariant,
            ..
        } => {
            let decl = prog
                .entities
                .get(entity)
                .ok_or_else(|| missing_at(op.sinfo(), &entity.0))?;
            construct_can_fault(decl, *check_invariant)
        }
        Op::Invoke { invoke, .. } => {
            let callee = prog
                .invoke(invoke)
                .ok_or_else(|| missing_at(op.sinfo(), &invoke.0))?;
            callee.precond.is_some()
                || callee
                    .primitive
                    .as_deref()
                    .map(|tag| primitive_can_fault(tag, opts))
                    .unwrap_or(false)
        }
        Op::InvokeVirtual {
            vname,
            rcvr_flow_type,
            ..
        } => {
            let mut precond = false;
            for (_, target) in resolve_virtual(prog, vname, rcvr_flow_type)? {
                let callee = prog
                    .invoke(&target)
                    .ok_or_else(|| missing_at(op.sinfo(), &target.0))?;
                precond = precond || callee.precond.is_some();
            }
            precond
        }
        _ => false,
    };
    Ok(faults)
}

fn missing_at(sinfo: &SourceInfo, key: &str) -> EncodeError {
    EncodeError::MissingKey {
        referrer: sinfo.to_string(),
        missing: key.to_owned(),
    }
}

fn matches_target(sinfo: &SourceInfo, target: Option<&TargetLocation>) -> bool {
    match target {
        Some(t) => sinfo.file == t.file && sinfo.line == t.line && sinfo.pos == t.pos,
        None => false,
    }
}

/// One invocation's contribution to the fixed point, computed once up front.
#[derive(Clone, Debug)]
struct CallSummary {
    own_faults: bool,
    contains_target: bool,
    callees: BTreeSet<InvokeId>,
}

fn summarize_invoke(
    prog: &Program,
    decl: &InvokeDecl,
    opts: &EncodeOptions,
    target: Option<&TargetLocation>,
) -> Result<CallSummary, EncodeError> {
    if let Some(tag) = &decl.primitive {
        return Ok(CallSummary {
            own_faults: primitive_can_fault(tag, opts),
            contains_target: false,
            callees: BTreeSet::new(),
        });
    }

    // XOR of body and primitive is validated at load time.
    let body = decl.body.as_ref().unwrap_or_else(|| {
        unreachable!("invocation '{}' has neither body nor primitive", decl.key.0)
    });

    fn add_callee<'a>(
        prog: &'a Program,
        callees: &mut BTreeSet<InvokeId>,
        sinfo: &SourceInfo,
        key: &InvokeKey,
    ) -> Result<&'a InvokeDecl, EncodeError> {
        match prog.invoke_ids.get(key) {
            Some(&id) => {
                callees.insert(id);
                Ok(&prog.invokes[id])
            }
            None => Err(missing_at(sinfo, &key.0)),
        }
    }

    let mut own_faults = false;
    let mut contains_target = false;
    let mut callees = BTreeSet::new();

    for block in &body.blocks {
        for op in &block.ops {
            let faults = op_can_fault(prog, op, opts)?;
            own_faults = own_faults || faults;
            contains_target = contains_target || (faults && matches_target(op.sinfo(), target));

            match op {
                Op::Invoke { sinfo, invoke, .. } => {
                    let callee = add_callee(prog, &mut callees, sinfo, invoke)?;
                    // The precondition predicate runs at the call site.
                    if let Some(pre) = callee.precond.clone() {
                        add_callee(prog, &mut callees, sinfo, &pre)?;
                    }
                    // Large-op primitives apply their callback through an
                    // attribute rather than a direct op.
                    if let Some(cb) = callback_key(callee) {
                        add_callee(prog, &mut callees, sinfo, &cb)?;
                    }
                }
                Op::InvokeVirtual {
                    sinfo,
                    vname,
                    rcvr_flow_type,
                    ..
                } => {
                    for (_, target_key) in resolve_virtual(prog, vname, rcvr_flow_type)? {
                        let callee = add_callee(prog, &mut callees, sinfo, &target_key)?;
                        if let Some(pre) = callee.precond.clone() {
                            add_callee(prog, &mut callees, sinfo, &pre)?;
                        }
                    }
                }
                Op::ConstructEntity {
                    sinfo,
                    entity,
                    check_invariant,
                    ..
                } => {
                    let entity_decl = prog
                        .entities
                        .get(entity)
                        .ok_or_else(|| missing_at(sinfo, &entity.0))?;
                    if *check_invariant {
                        if let Some(invariant) = entity_decl.invariant.clone() {
                            add_callee(prog, &mut callees, sinfo, &invariant)?;
                        }
                    }
                }
                Op::AccessConstant { sinfo, const_key, .. } => {
                    let constant = prog
                        .constants
                        .get(const_key)
                        .ok_or_else(|| missing_at(sinfo, const_key))?;
                    add_callee(prog, &mut callees, sinfo, &constant.value_invoke)?;
                }
                _ => {}
            }
        }
    }

    Ok(CallSummary {
        own_faults,
        contains_target,
        callees,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SafetyFact {
    /// Proven free of modeled faults; calls to safe invocations return a bare
    /// value rather than a failure sum.
    pub safe: bool,
    /// An op in this invocation's own body registers the target fault.
    pub contains_target: bool,
    /// The target fault can fire somewhere in this invocation's call tree.
    pub reaches_target: bool,
}

/// One strongly-connected component of the call graph, in dependency-first
/// position within `SafetyAnalysis::groups`.
#[derive(Clone, Debug)]
pub struct SccGroup {
    /// Cyclic groups become a single `define-funs-rec` downstream.
    pub recursive: bool,
    pub nodes: Vec<InvokeId>,
}

#[derive(Debug)]
pub struct SafetyAnalysis {
    pub callees: IdVec<InvokeId, BTreeSet<InvokeId>>,
    /// Dependency-first: every group's callees lie in earlier groups or in
    /// the group itself.
    pub groups: Vec<SccGroup>,
    pub facts: IdVec<InvokeId, SafetyFact>,
    pub reachable: BTreeSet<InvokeId>,
    /// `groups` flattened and filtered to the reachable set.
    pub emit_order: Vec<InvokeId>,
}

impl SafetyAnalysis {
    pub fn analyze(
        prog: &Program,
        roots: &[InvokeKey],
        opts: &EncodeOptions,
    ) -> Result<SafetyAnalysis, EncodeError> {
        let target = opts.target.as_ref();

        let mut summaries: IdVec<InvokeId, CallSummary> = IdVec::new();
        for (id, decl) in &prog.invokes {
            let pushed = summaries.push(summarize_invoke(prog, decl, opts, target)?);
            debug_assert_eq!(pushed, id);
        }

        let sccs: Sccs<usize, _> =
            find_components(prog.invokes.count(), |id| summaries[id].callees.clone());

        // Optimistic start: everything safe, nothing reaching. Each pass can
        // only flip `safe` off and `reaches_target` on, so every SCC settles
        // within |nodes| + 1 passes.
        let mut facts: IdVec<InvokeId, SafetyFact> = IdVec::new();
        for (id, _) in &summaries {
            let pushed = facts.push(SafetyFact {
                safe: true,
                contains_target: summaries[id].contains_target,
                reaches_target: false,
            });
            debug_assert_eq!(pushed, id);
        }

        let mut groups = Vec::new();
        for (_, scc) in &sccs {
            let nodes: Vec<InvokeId> = scc.nodes.to_vec();
            let mut passes = 0;
            loop {
                passes += 1;
                let mut changed = false;
                for &id in &nodes {
                    let next = step_fact(prog, &summaries, &facts, id);
                    if facts[id] != next {
                        facts[id] = next;
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
                debug_assert!(passes <= nodes.len() + 1);
            }
            groups.push(SccGroup {
                recursive: scc.kind == SccKind::Cyclic,
                nodes,
            });
        }

        let mut reachable = BTreeSet::new();
        let mut stack = Vec::new();
        for root in roots {
            let &id = prog
                .invoke_ids
                .get(root)
                .ok_or_else(|| EncodeError::UnknownEntrypoint(root.0.clone()))?;
            stack.push(id);
        }
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                stack.extend(summaries[id].callees.iter().copied());
            }
        }

        let emit_order = groups
            .iter()
            .flat_map(|group| group.nodes.iter().copied())
            .filter(|id| reachable.contains(id))
            .collect();

        let callees = IdVec::from_vec(
            summaries
                .into_iter()
                .map(|(_, summary)| summary.callees)
                .collect(),
        );

        Ok(SafetyAnalysis {
            callees,
            groups,
            facts,
            reachable,
            emit_order,
        })
    }

    pub fn fact(&self, prog: &Program, key: &InvokeKey) -> Option<SafetyFact> {
        prog.invoke_ids.get(key).map(|&id| self.facts[id])
    }
}

fn step_fact(
    prog: &Program,
    summaries: &IdVec<InvokeId, CallSummary>,
    facts: &IdVec<InvokeId, SafetyFact>,
    id: InvokeId,
) -> SafetyFact {
    let summary = &summaries[id];
    if prog.invokes[id].is_trusted_safe() {
        // Assumed fault-free; the target cannot fire inside it.
        return SafetyFact {
            safe: true,
            contains_target: summary.contains_target,
            reaches_target: false,
        };
    }

    let callees_safe = summary.callees.iter().all(|&callee| facts[callee].safe);
    let reaches = summary.contains_target
        || summary
            .callees
            .iter()
            .any(|&callee| facts[callee].reaches_target);

    SafetyFact {
        safe: !summary.own_faults && callees_safe,
        contains_target: summary.contains_target,
        reaches_target: reaches,
    }
}

/// Maps every reachable invocation to the index of its SCC group, for callers
/// that need to know whether two invocations must be defined jointly.
pub fn group_index(analysis: &SafetyAnalysis) -> BTreeMap<InvokeId, usize> {
    let mut index = BTreeMap::new();
    for (pos, group) in analysis.groups.iter().enumerate() {
        for &id in &group.nodes {
            index.insert(id, pos);
        }
    }
    index
}

#[cfg(test)]
mod test {
    use super::*;
    use attest_common::data::assembly::{Assembly, ConceptDecl, EntityDecl, FlowType, TypeOption};
    use attest_common::data::mir::{Arg, BasicBlock, Body, Literal};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;
    use std::collections::BTreeMap;

    fn sinfo(line: u64) -> SourceInfo {
        SourceInfo {
            file: "app.src".to_owned(),
            line,
            pos: 0,
        }
    }

    fn ret_const(line: u64) -> Vec<Op> {
        vec![
            Op::LoadConst {
                sinfo: sinfo(line),
                trgt: "t0".to_owned(),
                trgt_type: TypeKey("Int".to_owned()),
                value: Literal::Int(0),
            },
            Op::ReturnAssign {
                sinfo: sinfo(line),
                src: Arg::Var("t0".to_owned()),
            },
        ]
    }

    fn body_of(ops: Vec<Op>) -> Body {
        Body {
            blocks: vec![BasicBlock {
                label: "entry".to_owned(),
                ops,
            }],
        }
    }

    fn invoke(key: &str, body: Body) -> InvokeDecl {
        InvokeDecl {
            key: InvokeKey(key.to_owned()),
            shortname: key.to_owned(),
            params: Vec::new(),
            result_type: TypeKey("Int".to_owned()),
            recursive: false,
            attributes: Vec::new(),
            precond: None,
            postcond: None,
            body: Some(body),
            primitive: None,
        }
    }

    fn call_op(line: u64, callee: &str) -> Op {
        Op::Invoke {
            sinfo: sinfo(line),
            trgt: "t0".to_owned(),
            trgt_type: TypeKey("Int".to_owned()),
            invoke: InvokeKey(callee.to_owned()),
            args: Vec::new(),
            optmask: None,
        }
    }

    fn add_op(line: u64) -> Op {
        Op::BinOp {
            sinfo: sinfo(line),
            trgt: "t0".to_owned(),
            trgt_type: TypeKey("Int".to_owned()),
            op: BinOpKind::Add,
            op_type: TypeKey("Int".to_owned()),
            lhs: Arg::Var("x".to_owned()),
            rhs: Arg::Lit(Literal::Int(1)),
        }
    }

    fn analyze(assembly: Assembly, root: &str, opts: &EncodeOptions) -> SafetyAnalysis {
        let prog = Program::build(assembly).unwrap();
        SafetyAnalysis::analyze(&prog, &[InvokeKey(root.to_owned())], opts).unwrap()
    }

    #[test]
    fn arithmetic_body_is_unsafe_and_taints_callers() {
        let assembly = Assembly {
            invokes: vec![
                invoke("inc", body_of(vec![add_op(3), ret_const(4).remove(1)])),
                invoke(
                    "outer",
                    body_of(vec![call_op(8, "inc"), ret_const(9).remove(1)]),
                ),
                invoke("pure", body_of(ret_const(12))),
            ],
            ..Assembly::default()
        };
        let prog = Program::build(assembly).unwrap();
        let analysis = SafetyAnalysis::analyze(
            &prog,
            &[InvokeKey("outer".to_owned())],
            &EncodeOptions::default(),
        )
        .unwrap();

        assert!(!analysis.fact(&prog, &InvokeKey("inc".to_owned())).unwrap().safe);
        assert!(!analysis.fact(&prog, &InvokeKey("outer".to_owned())).unwrap().safe);
        assert!(analysis.fact(&prog, &InvokeKey("pure".to_owned())).unwrap().safe);
    }

    #[test]
    fn trusted_safe_attribute_stops_taint() {
        let mut inc = invoke("inc", body_of(vec![add_op(3), ret_const(4).remove(1)]));
        inc.attributes.push("assume_safe".to_owned());
        let assembly = Assembly {
            invokes: vec![
                inc,
                invoke(
                    "outer",
                    body_of(vec![call_op(8, "inc"), ret_const(9).remove(1)]),
                ),
            ],
            ..Assembly::default()
        };
        let prog = Program::build(assembly).unwrap();
        let analysis = SafetyAnalysis::analyze(
            &prog,
            &[InvokeKey("outer".to_owned())],
            &EncodeOptions::default(),
        )
        .unwrap();

        assert!(analysis.fact(&prog, &InvokeKey("inc".to_owned())).unwrap().safe);
        assert!(analysis.fact(&prog, &InvokeKey("outer".to_owned())).unwrap().safe);
    }

    #[test]
    fn target_containment_and_reachability_are_distinct() {
        let assembly = Assembly {
            invokes: vec![
                invoke("inc", body_of(vec![add_op(3), ret_const(4).remove(1)])),
                invoke(
                    "outer",
                    body_of(vec![call_op(8, "inc"), ret_const(9).remove(1)]),
                ),
            ],
            ..Assembly::default()
        };
        let opts = EncodeOptions {
            target: Some(TargetLocation {
                file: "app.src".to_owned(),
                line: 3,
                pos: 0,
            }),
            ..EncodeOptions::default()
        };
        let prog = Program::build(assembly).unwrap();
        let analysis =
            SafetyAnalysis::analyze(&prog, &[InvokeKey("outer".to_owned())], &opts).unwrap();

        let inc = analysis.fact(&prog, &InvokeKey("inc".to_owned())).unwrap();
        let outer = analysis.fact(&prog, &InvokeKey("outer".to_owned())).unwrap();
        assert!(inc.contains_target && inc.reaches_target);
        assert!(!outer.contains_target && outer.reaches_target);
    }

    #[test]
    fn recursive_pair_settles_as_one_cyclic_group() {
        let assembly = Assembly {
            invokes: vec![
                invoke(
                    "even",
                    body_of(vec![call_op(3, "odd"), ret_const(4).remove(1)]),
                ),
                invoke(
                    "odd",
                    body_of(vec![call_op(7, "even"), add_op(8), ret_const(9).remove(1)]),
                ),
            ],
            ..Assembly::default()
        };
        let analysis = analyze(assembly, "even", &EncodeOptions::default());

        let cyclic: Vec<&SccGroup> =
            analysis.groups.iter().filter(|g| g.recursive).collect();
        assert_eq!(cyclic.len(), 1);
        assert_eq!(cyclic[0].nodes.len(), 2);
        // The arithmetic in `odd` taints the whole cycle.
        for &id in &cyclic[0].nodes {
            assert!(!analysis.facts[id].safe);
        }
    }

    #[test]
    fn virtual_edges_follow_the_dispatch_index() {
        let mut dog_vtable = BTreeMap::new();
        dog_vtable.insert("speak".to_owned(), InvokeKey("dog_speak".to_owned()));
        let mut cat_vtable = BTreeMap::new();
        cat_vtable.insert("speak".to_owned(), InvokeKey("cat_speak".to_owned()));

        let entity = |key: &str, vtable: BTreeMap<String, InvokeKey>| EntityDecl {
            key: TypeKey(key.to_owned()),
            shortname: key.to_owned(),
            fields: Vec::new(),
            provides: vec![TypeKey("Animal".to_owned())],
            vtable,
            invariant: None,
            validator: None,
            collection_of: None,
            numeric_range: None,
            is_abstract: false,
        };

        let virtual_call = Op::InvokeVirtual {
            sinfo: sinfo(3),
            trgt: "t0".to_owned(),
            trgt_type: TypeKey("Int".to_owned()),
            vname: "speak".to_owned(),
            rcvr_flow_type: TypeKey("Animal".to_owned()),
            args: Vec::new(),
        };

        let assembly = Assembly {
            concepts: vec![ConceptDecl {
                key: TypeKey("Animal".to_owned()),
                shortname: "Animal".to_owned(),
                provides: vec![TypeKey("Any".to_owned())],
            }],
            entities: vec![
                entity("Dog", dog_vtable),
                entity("Cat", cat_vtable),
            ],
            invokes: vec![
                invoke("dog_speak", body_of(ret_const(10))),
                invoke("cat_speak", body_of(vec![add_op(20), ret_const(21).remove(1)])),
                invoke(
                    "caller",
                    body_of(vec![virtual_call, ret_const(4).remove(1)]),
                ),
            ],
            ..Assembly::default()
        };
        let prog = Program::build(assembly).unwrap();
        let analysis = SafetyAnalysis::analyze(
            &prog,
            &[InvokeKey("caller".to_owned())],
            &EncodeOptions::default(),
        )
        .unwrap();

        let caller = prog.invoke_ids[&InvokeKey("caller".to_owned())];
        let dog = prog.invoke_ids[&InvokeKey("dog_speak".to_owned())];
        let cat = prog.invoke_ids[&InvokeKey("cat_speak".to_owned())];
        assert!(analysis.callees[caller].contains(&dog));
        assert!(analysis.callees[caller].contains(&cat));
        // Taint flows through the virtual edge.
        assert!(!analysis.facts[caller].safe);
    }

    #[test]
    fn missing_virtual_target_is_a_construction_fault() {
        let entity = EntityDecl {
            key: TypeKey("Dog".to_owned()),
            shortname: "Dog".to_owned(),
            fields: Vec::new(),
            provides: vec![TypeKey("Animal".to_owned())],
            vtable: BTreeMap::new(),
            invariant: None,
            validator: None,
            collection_of: None,
            numeric_range: None,
            is_abstract: false,
        };
        let virtual_call = Op::InvokeVirtual {
            sinfo: sinfo(3),
            trgt: "t0".to_owned(),
            trgt_type: TypeKey("Int".to_owned()),
            vname: "speak".to_owned(),
            rcvr_flow_type: TypeKey("Animal".to_owned()),
            args: Vec::new(),
        };
        let assembly = Assembly {
            concepts: vec![ConceptDecl {
                key: TypeKey("Animal".to_owned()),
                shortname: "Animal".to_owned(),
                provides: vec![TypeKey("Any".to_owned())],
            }],
            entities: vec![entity],
            invokes: vec![invoke(
                "caller",
                body_of(vec![virtual_call, ret_const(4).remove(1)]),
            )],
            ..Assembly::default()
        };
        let prog = Program::build(assembly).unwrap();
        let result = SafetyAnalysis::analyze(
            &prog,
            &[InvokeKey("caller".to_owned())],
            &EncodeOptions::default(),
        );
        assert!(matches!(
            result,
            Err(EncodeError::MissingVirtualTarget { .. })
        ));
    }

    #[test]
    fn emit_order_puts_callees_before_callers() {
        let assembly = Assembly {
            invokes: vec![
                invoke(
                    "a",
                    body_of(vec![call_op(1, "b"), ret_const(2).remove(1)]),
                ),
                invoke(
                    "b",
                    body_of(vec![call_op(4, "c"), ret_const(5).remove(1)]),
                ),
                invoke("c", body_of(ret_const(7))),
                invoke("unreached", body_of(ret_const(9))),
            ],
            ..Assembly::default()
        };
        let prog = Program::build(assembly).unwrap();
        let analysis = SafetyAnalysis::analyze(
            &prog,
            &[InvokeKey("a".to_owned())],
            &EncodeOptions::default(),
        )
        .unwrap();

        let order: Vec<&str> = analysis
            .emit_order
            .iter()
            .map(|&id| prog.invokes[id].key.0.as_str())
            .collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        let unreached = prog.invoke_ids[&InvokeKey("unreached".to_owned())];
        assert!(!analysis.reachable.contains(&unreached));
    }

    // Random call DAGs with a sprinkling of back edges: the fixed point must
    // terminate, and an invocation is safe only if its entire call tree is
    // free of arithmetic bodies.
    #[test]
    fn generative_graphs_settle_consistently() {
        let mut rng = Pcg64Mcg::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let n = rng.random_range(2..12usize);
            let mut decls = Vec::new();
            let mut tainted = vec![false; n];
            let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
            for i in 0..n {
                let mut ops = Vec::new();
                if rng.random_range(0..4) == 0 {
                    tainted[i] = true;
                    ops.push(add_op(i as u64 * 10));
                }
                for j in 0..n {
                    if i != j && rng.random_range(0..4) == 0 {
                        edges[i].push(j);
                        ops.push(call_op(i as u64 * 10 + 1, &format!("f{}", j)));
                    }
                }
                ops.extend(ret_const(i as u64 * 10 + 2));
                decls.push(invoke(&format!("f{}", i), body_of(ops)));
            }

            let roots: Vec<InvokeKey> = (0..n).map(|i| InvokeKey(format!("f{}", i))).collect();
            let prog = Program::build(Assembly {
                invokes: decls,
                ..Assembly::default()
            })
            .unwrap();
            let analysis =
                SafetyAnalysis::analyze(&prog, &roots, &EncodeOptions::default()).unwrap();

            // Reference: transitive closure of taint over the edge list.
            let mut unsafe_ref = tainted.clone();
            loop {
                let mut changed = false;
                for i in 0..n {
                    if !unsafe_ref[i] && edges[i].iter().any(|&j| unsafe_ref[j]) {
                        unsafe_ref[i] = true;
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }
            for i in 0..n {
                let fact = analysis
                    .fact(&prog, &InvokeKey(format!("f{}", i)))
                    .unwrap();
                assert_eq!(fact.safe, !unsafe_ref[i], "node f{}", i);
            }
        }
    }
}
