//! Translates one invocation body into a solver function definition.
//!
//! Blocks become continuation expressions: each block is folded right-to-left
//! into the expression for its successor, with merge points bound at jump
//! sites. Control flow must be acyclic; recursion lives at the invocation
//! level, where cyclic call-graph groups become joint recursive definitions.
//!
//! An invocation proven safe returns its bare value sort; everything else
//! returns a failure sum, and call sites thread error codes upward unchanged
//! so a counterexample names the original fault site.

use attest_common::data::assembly::{
    well_known, InvokeDecl, InvokeId, InvokeKey, Program, TypeKey, TypeOption,
};
use attest_common::data::mir::{
    Arg, BinOpKind, Body, CmpKind, Guard, GuardLoc, Literal, LogicKind, Op, SourceInfo, UnOpKind,
};
use attest_common::data::smt::{SmtExp, SmtFunctionDef, SmtSort};
use std::collections::{BTreeMap, BTreeSet};

use crate::boxing::{BoxKind, Repr, ResultRepr};
use crate::emit::EncodeCtx;
use crate::error::EncodeError;
use crate::havoc;
use crate::safety::{callback_key, resolve_virtual};

/// A translated invocation: helper definitions (dispatch thunks, callback
/// wrappers) that must precede the main definition in the payload, and the
/// definition itself. Primitives have no definition; they are inlined at
/// call sites.
pub(crate) struct TranslatedInvoke {
    pub helpers: Vec<SmtFunctionDef>,
    pub main: Option<SmtFunctionDef>,
}

pub(crate) fn translate_invoke(
    ctx: &mut EncodeCtx,
    id: InvokeId,
) -> Result<TranslatedInvoke, EncodeError> {
    let prog = ctx.prog;
    let decl = &prog.invokes[id];
    if decl.primitive.is_some() {
        return Ok(TranslatedInvoke {
            helpers: Vec::new(),
            main: None,
        });
    }
    let body = decl.body.as_ref().unwrap_or_else(|| {
        unreachable!("invocation '{}' has neither body nor primitive", decl.key.0)
    });

    let fact = ctx.safety.facts[id];
    let fname = ctx.names.mint("$i_", &decl.key.0);
    let result_type = decl.result_type.clone();
    let value_sort = ctx.boxing.sort_of(&result_type)?;
    let result_sort = if fact.safe {
        value_sort.clone()
    } else {
        ctx.boxing.result_repr(&value_sort).sort.clone()
    };

    let mut params = Vec::new();
    for param in &decl.params {
        params.push((
            format!("$p_{}", param.name),
            ctx.boxing.sort_of(&param.param_type)?,
        ));
    }
    let mask_size = decl.mask_size();
    if mask_size > 0 {
        params.push(("$mask".to_owned(), ctx.boxing.mask_repr(mask_size).sort.clone()));
    }

    let entry = body
        .entry_block()
        .ok_or_else(|| EncodeError::MalformedOp {
            sinfo: decl.key.0.clone(),
            detail: "empty body".to_owned(),
        })?
        .label
        .clone();

    let mut builder = BodyBuilder {
        ctx,
        prog,
        decl,
        body,
        safe: fact.safe,
        checks: !fact.safe,
        result_type,
        value_sort,
        reg_types: BTreeMap::new(),
        mask_indices: BTreeMap::new(),
        block_memo: BTreeMap::new(),
        visiting: BTreeSet::new(),
        current_label: entry.clone(),
        helpers: Vec::new(),
        tmp_counter: 0,
    };
    builder.prescan();
    let body_exp = builder.block_exp(&entry)?;
    let helpers = builder.helpers;

    Ok(TranslatedInvoke {
        helpers,
        main: Some(SmtFunctionDef {
            name: fname,
            params,
            result: result_sort,
            body: body_exp,
        }),
    })
}

fn malformed(sinfo: &SourceInfo, detail: impl Into<String>) -> EncodeError {
    EncodeError::MalformedOp {
        sinfo: sinfo.to_string(),
        detail: detail.into(),
    }
}

fn var(name: impl Into<String>) -> SmtExp {
    SmtExp::Var(name.into())
}

struct BodyBuilder<'a, 'c> {
    ctx: &'c mut EncodeCtx<'a>,
    prog: &'a Program,
    decl: &'a InvokeDecl,
    body: &'a Body,
    safe: bool,
    /// Fault checks are emitted only when the enclosing invocation returns a
    /// failure sum; trusted-safe bodies encode their faulting ops unchecked.
    checks: bool,
    result_type: TypeKey,
    value_sort: SmtSort,
    reg_types: BTreeMap<String, Option<TypeKey>>,
    /// Mask name -> indices bound by guard locations in this body.
    mask_indices: BTreeMap<String, BTreeSet<usize>>,
    block_memo: BTreeMap<String, SmtExp>,
    visiting: BTreeSet<String>,
    current_label: String,
    helpers: Vec<SmtFunctionDef>,
    tmp_counter: usize,
}

impl<'a, 'c> BodyBuilder<'a, 'c> {
    fn prescan(&mut self) {
        for block in &self.body.blocks {
            for op in &block.ops {
                if let Some((trgt, ty)) = op.target() {
                    self.reg_types.insert(trgt.to_owned(), ty.cloned());
                }
                if let Op::FieldLoad {
                    guard: Some(guard), ..
                } = op
                {
                    match &guard.loc {
                        GuardLoc::Reg { name } => {
                            self.reg_types.insert(name.clone(), None);
                        }
                        GuardLoc::MaskBit { mask, index } => {
                            self.mask_indices
                                .entry(mask.clone())
                                .or_default()
                                .insert(*index);
                        }
                    }
                }
            }
        }
    }

    fn reg(&self, name: &str) -> String {
        format!("$r_{}", name)
    }

    fn fresh(&mut self, prefix: &str) -> String {
        let n = self.tmp_counter;
        self.tmp_counter += 1;
        format!("${}{}", prefix, n)
    }

    fn width(&self) -> u32 {
        self.ctx.opts.int_width
    }

    fn bv(&self, n: u128) -> SmtExp {
        SmtExp::Const(format!("(_ bv{} {})", n, self.width()))
    }

    fn int_min(&self) -> SmtExp {
        self.bv(1u128 << (self.width() - 1))
    }

    fn all_ones(&self) -> SmtExp {
        SmtExp::Const(format!("(bvneg (_ bv1 {}))", self.width()))
    }

    fn arg_exp(&mut self, arg: &Arg) -> SmtExp {
        match arg {
            Arg::Var(name) => var(self.reg(name)),
            Arg::Lit(lit) => self.lit_exp(lit),
        }
    }

    fn arg_type(&self, arg: &Arg, sinfo: &SourceInfo) -> Result<TypeKey, EncodeError> {
        match arg {
            Arg::Var(name) => match self.reg_types.get(name) {
                Some(Some(ty)) => Ok(ty.clone()),
                Some(None) => Ok(TypeKey(well_known::BOOL.to_owned())),
                None => Err(malformed(sinfo, format!("undefined register '{}'", name))),
            },
            Arg::Lit(lit) => Ok(lit_type(lit)),
        }
    }

    fn lit_exp(&mut self, lit: &Literal) -> SmtExp {
        match lit {
            Literal::None => SmtExp::Const("$unit".to_owned()),
            Literal::Bool(b) => SmtExp::bool_const(*b),
            Literal::Int(n) => {
                if *n < 0 {
                    SmtExp::Const(format!(
                        "(bvneg (_ bv{} {}))",
                        n.unsigned_abs(),
                        self.width()
                    ))
                } else {
                    self.bv(*n as u128)
                }
            }
            Literal::Nat(n) => self.bv(*n as u128),
            Literal::BigInt(digits) => match digits.strip_prefix('-') {
                Some(rest) => SmtExp::Const(format!("(- {})", rest)),
                None => SmtExp::Const(digits.clone()),
            },
            Literal::Float(text) => {
                let mut body = text.trim_start_matches('-').to_owned();
                if !body.contains('.') {
                    body.push_str(".0");
                }
                if text.starts_with('-') {
                    SmtExp::Const(format!("(- {})", body))
                } else {
                    SmtExp::Const(body)
                }
            }
            Literal::Str(text) => {
                SmtExp::Const(format!("\"{}\"", text.replace('"', "\"\"")))
            }
        }
    }

    fn coerced(
        &mut self,
        exp: SmtExp,
        from: &TypeKey,
        into: &TypeKey,
    ) -> Result<SmtExp, EncodeError> {
        match self.ctx.boxing.coerce(from, into)? {
            None => Ok(exp),
            Some(fname) => Ok(SmtExp::call(fname, vec![exp])),
        }
    }

    fn coerced_arg(
        &mut self,
        arg: &Arg,
        into: &TypeKey,
        sinfo: &SourceInfo,
    ) -> Result<SmtExp, EncodeError> {
        let from = self.arg_type(arg, sinfo)?;
        let exp = self.arg_exp(arg);
        self.coerced(exp, &from, into)
    }

    fn my_repr(&mut self) -> ResultRepr {
        self.ctx.boxing.result_repr(&self.value_sort)
    }

    fn register_fault(&mut self, sinfo: &SourceInfo, tag: &'static str, msg: String) -> SmtExp {
        let id = self.ctx.faults.register(sinfo, tag, msg);
        let code = self.ctx.faults.error_code(id);
        let repr = self.my_repr();
        repr.err(SmtExp::Const(code))
    }

    /// Wraps `inner` in the fault branches, first condition outermost.
    fn with_checks(
        &mut self,
        sinfo: &SourceInfo,
        checks: Vec<(SmtExp, &'static str, String)>,
        inner: SmtExp,
    ) -> SmtExp {
        if !self.checks {
            return inner;
        }
        let mut out = inner;
        for (cond, tag, msg) in checks.into_iter().rev() {
            let err = self.register_fault(sinfo, tag, msg);
            out = SmtExp::ite(cond, err, out);
        }
        out
    }

    fn ok_wrap(&mut self, value: SmtExp) -> SmtExp {
        if self.safe {
            value
        } else {
            let repr = self.my_repr();
            repr.ok(value)
        }
    }

    fn witness(&mut self, sort: &SmtSort) -> SmtExp {
        self.ctx.fresh_const(sort)
    }

    /// Whether a value of `tkey` is the absent (`None`) shape.
    fn none_test(&mut self, exp: SmtExp, tkey: &TypeKey) -> Result<SmtExp, EncodeError> {
        let prog = self.prog;
        let ty = prog
            .lookup_type(tkey)
            .ok_or_else(|| EncodeError::MissingKey {
                referrer: "none test".to_owned(),
                missing: tkey.0.clone(),
            })?
            .clone();
        if ty.is_none() {
            return Ok(SmtExp::bool_const(true));
        }
        if !ty.includes_none() {
            return Ok(SmtExp::bool_const(false));
        }
        let kind = if prog.is_key_type(&ty) {
            BoxKind::Key
        } else {
            BoxKind::Term
        };
        let none_key = TypeKey(well_known::NONE.to_owned());
        // Registering the constructor keeps the tag dispatch aware of boxed
        // absent values.
        self.ctx.boxing.box_ctor(&none_key, kind)?;
        let tag = self.ctx.boxing.tag_const(&none_key);
        Ok(SmtExp::eq(
            self.ctx.boxing.type_tag_of(exp, kind),
            SmtExp::Const(tag),
        ))
    }

    fn box_kind_of(&self, tkey: &TypeKey) -> Result<BoxKind, EncodeError> {
        let ty = self
            .prog
            .lookup_type(tkey)
            .ok_or_else(|| EncodeError::MissingKey {
                referrer: "box kind".to_owned(),
                missing: tkey.0.clone(),
            })?;
        Ok(if self.prog.is_key_type(ty) {
            BoxKind::Key
        } else {
            BoxKind::Term
        })
    }

    /// Wraps a value of `from_key` as a list element (`$BTerm`).
    fn box_elem(&mut self, exp: SmtExp, from_key: &TypeKey) -> Result<SmtExp, EncodeError> {
        match self.ctx.boxing.repr_of(from_key)? {
            Repr::Boxed(BoxKind::Term) => Ok(exp),
            Repr::Boxed(BoxKind::Key) => Ok(self.ctx.boxing.widen(exp)),
            _ => self.ctx.boxing.boxed(exp, from_key, BoxKind::Term),
        }
    }

    /// Recovers a `trgt`-typed value from a list element of type `elem_key`.
    fn unbox_elem(
        &mut self,
        exp: SmtExp,
        elem_key: &TypeKey,
        trgt: &TypeKey,
    ) -> Result<SmtExp, EncodeError> {
        match self.ctx.boxing.repr_of(elem_key)? {
            Repr::Boxed(BoxKind::Term) => self.coerced(exp, elem_key, trgt),
            Repr::Boxed(BoxKind::Key) => Err(EncodeError::Unrepresentable {
                from: elem_key.0.clone(),
                into: trgt.0.clone(),
            }),
            _ => {
                let unboxed = self.ctx.boxing.unboxed(exp, elem_key, BoxKind::Term)?;
                self.coerced(unboxed, elem_key, trgt)
            }
        }
    }

    fn elem_key_of(&self, tkey: &TypeKey, sinfo: &SourceInfo) -> Result<TypeKey, EncodeError> {
        let ty = self
            .prog
            .lookup_type(tkey)
            .ok_or_else(|| malformed(sinfo, format!("unknown type '{}'", tkey.0)))?;
        if let [TypeOption::Entity { key }] = ty.options.as_slice() {
            if let Some(decl) = self.prog.entities.get(key) {
                if let Some(elem) = &decl.collection_of {
                    return Ok(elem.clone());
                }
            }
        }
        Err(malformed(sinfo, format!("'{}' is not a collection", tkey.0)))
    }

    /// Converts a bounded index/length value into the solver's `Int` domain.
    fn to_int(&mut self, exp: SmtExp, tkey: &TypeKey) -> Result<SmtExp, EncodeError> {
        match tkey.0.as_str() {
            well_known::NAT => Ok(SmtExp::call("bv2nat", vec![exp])),
            well_known::INT => {
                let wrap = SmtExp::Const(format!("{}", 1u128 << self.width()));
                let raw = SmtExp::call("bv2nat", vec![exp.clone()]);
                Ok(SmtExp::ite(
                    SmtExp::call("bvslt", vec![exp, self.bv(0)]),
                    SmtExp::call("-", vec![raw.clone(), wrap]),
                    raw,
                ))
            }
            well_known::BIG_INT => Ok(exp),
            other => Err(EncodeError::Unrepresentable {
                from: other.to_owned(),
                into: "Int".to_owned(),
            }),
        }
    }

    fn int2bv(&self, exp: SmtExp) -> SmtExp {
        SmtExp::call(format!("(_ int2bv {})", self.width()), vec![exp])
    }

    // ---- control flow ----

    fn block_exp(&mut self, label: &str) -> Result<SmtExp, EncodeError> {
        if let Some(exp) = self.block_memo.get(label) {
            return Ok(exp.clone());
        }
        if !self.visiting.insert(label.to_owned()) {
            return Err(EncodeError::MalformedOp {
                sinfo: format!("block '{}'", label),
                detail: "control flow must be acyclic".to_owned(),
            });
        }
        let body = self.body;
        let block = body.block(label).ok_or_else(|| EncodeError::MalformedOp {
            sinfo: format!("block '{}'", label),
            detail: "jump to undefined block".to_owned(),
        })?;

        let saved_label = std::mem::replace(&mut self.current_label, label.to_owned());
        let mut cont: Option<SmtExp> = None;
        for op in block.ops.iter().rev() {
            let next = if is_terminator(op) {
                self.encode_terminator(op)?
            } else {
                let inner = cont
                    .take()
                    .ok_or_else(|| malformed(op.sinfo(), "block has no terminator"))?;
                self.encode_op(op, inner)?
            };
            cont = Some(next);
        }
        self.current_label = saved_label;

        let exp = cont.ok_or_else(|| EncodeError::MalformedOp {
            sinfo: format!("block '{}'", label),
            detail: "empty block".to_owned(),
        })?;
        self.visiting.remove(label);
        self.block_memo.insert(label.to_owned(), exp.clone());
        Ok(exp)
    }

    /// The target block's expression, with its merge points bound to the
    /// values flowing from the current block.
    fn jump_to(&mut self, target: &str) -> Result<SmtExp, EncodeError> {
        let from = self.current_label.clone();
        let target_exp = self.block_exp(target)?;
        let body = self.body;
        let block = body.block(target).unwrap();

        let mut bindings = Vec::new();
        for op in &block.ops {
            if let Op::Phi {
                sinfo,
                trgt,
                trgt_type,
                sources,
            } = op
            {
                let src = sources.get(&from).ok_or_else(|| {
                    malformed(sinfo, format!("merge point has no source for '{}'", from))
                })?;
                let value = self.coerced_arg(src, trgt_type, sinfo)?;
                bindings.push((self.reg(trgt), value));
            }
        }
        if bindings.is_empty() {
            Ok(target_exp)
        } else {
            Ok(SmtExp::LetMulti {
                bindings,
                body: Box::new(target_exp),
            })
        }
    }

    fn encode_terminator(&mut self, op: &Op) -> Result<SmtExp, EncodeError> {
        match op {
            Op::ReturnAssign { sinfo, src } => {
                let result_type = self.result_type.clone();
                let value = self.coerced_arg(src, &result_type, sinfo)?;
                Ok(self.ok_wrap(value))
            }
            Op::Abort { sinfo, msg } => {
                if self.checks {
                    Ok(self.register_fault(sinfo, "abort", msg.clone()))
                } else {
                    // A trusted-safe body's abort is assumed unreachable; any
                    // value of the result sort satisfies the definition.
                    let sort = self.value_sort.clone();
                    let w = self.witness(&sort);
                    Ok(self.ok_wrap(w))
                }
            }
            Op::Jump { target, .. } => self.jump_to(target),
            Op::JumpCond {
                cond,
                true_block,
                false_block,
                ..
            } => {
                let cond_exp = self.arg_exp(cond);
                let tval = self.jump_to(true_block)?;
                let fval = self.jump_to(false_block)?;
                Ok(SmtExp::ite(cond_exp, tval, fval))
            }
            Op::JumpNone {
                arg,
                arg_flow_type,
                none_block,
                some_block,
                ..
            } => {
                let exp = self.arg_exp(arg);
                let test = self.none_test(exp, arg_flow_type)?;
                match &test {
                    SmtExp::Const(text) if text == "true" => self.jump_to(none_block),
                    SmtExp::Const(text) if text == "false" => self.jump_to(some_block),
                    _ => {
                        let nval = self.jump_to(none_block)?;
                        let sval = self.jump_to(some_block)?;
                        Ok(SmtExp::ite(test, nval, sval))
                    }
                }
            }
            _ => unreachable!("not a terminator"),
        }
    }

    // ---- straight-line operations ----

    fn encode_op(&mut self, op: &Op, cont: SmtExp) -> Result<SmtExp, EncodeError> {
        match op {
            Op::Nop { .. } | Op::Phi { .. } => Ok(cont),

            Op::LoadConst {
                trgt,
                trgt_type,
                value,
                ..
            } => {
                let from = lit_type(value);
                let exp = self.lit_exp(value);
                let exp = self.coerced(exp, &from, trgt_type)?;
                Ok(SmtExp::let_in(self.reg(trgt), exp, cont))
            }

            Op::AccessArgument {
                sinfo,
                trgt,
                trgt_type,
                name,
            } => {
                let param = self
                    .decl
                    .params
                    .iter()
                    .find(|p| &p.name == name)
                    .ok_or_else(|| malformed(sinfo, format!("unknown parameter '{}'", name)))?;
                let param_type = param.param_type.clone();
                let exp = var(format!("$p_{}", name));
                let exp = self.coerced(exp, &param_type, trgt_type)?;
                Ok(SmtExp::let_in(self.reg(trgt), exp, cont))
            }

            Op::AccessMaskBit { sinfo, trgt, index } => {
                let size = self.decl.mask_size();
                if *index >= size {
                    return Err(malformed(sinfo, "mask bit index out of range"));
                }
                let repr = self.ctx.boxing.mask_repr(size);
                let bit = repr.bit(var("$mask"), *index);
                Ok(SmtExp::let_in(self.reg(trgt), bit, cont))
            }

            Op::AccessConstant {
                sinfo,
                trgt,
                trgt_type,
                const_key,
            } => {
                let constant = self
                    .prog
                    .constants
                    .get(const_key)
                    .ok_or_else(|| malformed(sinfo, format!("unknown constant '{}'", const_key)))?;
                let const_type = constant.const_type.clone();
                let cname = self.ctx.names.mint("$c_", const_key);
                let exp = self.coerced(SmtExp::call(cname, vec![]), &const_type, trgt_type)?;
                Ok(SmtExp::let_in(self.reg(trgt), exp, cont))
            }

            Op::RegisterAssign {
                sinfo,
                trgt,
                trgt_type,
                src,
            } => {
                let exp = self.coerced_arg(src, trgt_type, sinfo)?;
                Ok(SmtExp::let_in(self.reg(trgt), exp, cont))
            }

            Op::ConstructTuple {
                sinfo,
                trgt,
                trgt_type,
                args,
            } => self.encode_construct_shape(sinfo, trgt, trgt_type, args, cont),

            Op::ConstructRecord {
                sinfo,
                trgt,
                trgt_type,
                args,
            } => {
                let entries = self.record_entries(trgt_type, sinfo)?;
                let mut ordered = Vec::new();
                for (name, _) in &entries {
                    let arg = args
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, a)| a.clone())
                        .ok_or_else(|| {
                            malformed(sinfo, format!("record entry '{}' missing", name))
                        })?;
                    ordered.push(arg);
                }
                self.encode_construct_shape(sinfo, trgt, trgt_type, &ordered, cont)
            }

            Op::ConstructEntity {
                sinfo,
                trgt,
                trgt_type,
                entity,
                args,
                check_invariant,
            } => self.encode_construct_entity(
                sinfo,
                trgt,
                trgt_type,
                entity,
                args,
                *check_invariant,
                cont,
            ),

            Op::ConstructList {
                sinfo,
                trgt,
                trgt_type,
                args,
            } => {
                let elem = self.elem_key_of(trgt_type, sinfo)?;
                let mut elems = Vec::new();
                for arg in args {
                    let value = self.coerced_arg(arg, &elem, sinfo)?;
                    elems.push(self.box_elem(value, &elem)?);
                }
                let value = self.ctx.lists.literal(elems);
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            Op::TupleProject {
                sinfo,
                trgt,
                trgt_type,
                arg,
                arg_flow_type,
                index,
            } => {
                let exp = self.arg_exp(arg);
                let value =
                    self.project_component(sinfo, exp, arg_flow_type, &Component::Index(*index))?;
                let value = self.coerce_projection(value, arg_flow_type, *index, trgt_type, sinfo)?;
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            Op::RecordProject {
                sinfo,
                trgt,
                trgt_type,
                arg,
                arg_flow_type,
                pname,
            } => {
                let exp = self.arg_exp(arg);
                let entries = self.record_entries(arg_flow_type, sinfo).ok();
                let value = self.project_component(
                    sinfo,
                    exp,
                    arg_flow_type,
                    &Component::Name(pname.clone()),
                )?;
                let value = match entries
                    .and_then(|es| es.iter().find(|(n, _)| n == pname).map(|(_, t)| t.clone()))
                {
                    Some(component_type) => self.coerced(value, &component_type, trgt_type)?,
                    None => value,
                };
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            Op::FieldLoad {
                sinfo,
                trgt,
                trgt_type,
                arg,
                arg_flow_type,
                field,
                guard,
            } => self.encode_field_load(
                sinfo,
                trgt,
                trgt_type,
                arg,
                arg_flow_type,
                field,
                guard.as_ref(),
                cont,
            ),

            Op::FieldUpdate {
                sinfo,
                trgt,
                trgt_type,
                arg,
                arg_flow_type,
                field,
                value,
            } => self.encode_field_update(
                sinfo,
                trgt,
                trgt_type,
                arg,
                arg_flow_type,
                field,
                value,
                cont,
            ),

            Op::Invoke {
                sinfo,
                trgt,
                trgt_type,
                invoke,
                args,
                optmask,
            } => self.encode_direct_call(
                sinfo,
                trgt,
                trgt_type,
                invoke,
                args,
                optmask.as_deref(),
                cont,
            ),

            Op::InvokeVirtual {
                sinfo,
                trgt,
                trgt_type,
                vname,
                rcvr_flow_type,
                args,
            } => self.encode_virtual_call(sinfo, trgt, trgt_type, vname, rcvr_flow_type, args, cont),

            Op::BinOp {
                sinfo,
                trgt,
                trgt_type,
                op,
                op_type,
                lhs,
                rhs,
            } => {
                let a = self.fresh("a");
                let b = self.fresh("b");
                let lhs_exp = self.coerced_arg(lhs, op_type, sinfo)?;
                let rhs_exp = self.coerced_arg(rhs, op_type, sinfo)?;
                let (value, checks) = self.binop_value(sinfo, *op, op_type, &a, &b)?;
                let value = self.coerced(value, op_type, trgt_type)?;
                let inner = SmtExp::let_in(self.reg(trgt), value, cont);
                let inner = self.with_checks(sinfo, checks, inner);
                Ok(SmtExp::LetMulti {
                    bindings: vec![(a, lhs_exp), (b, rhs_exp)],
                    body: Box::new(inner),
                })
            }

            Op::BinCmp {
                sinfo,
                trgt,
                op,
                op_type,
                lhs,
                rhs,
            } => {
                let lhs_exp = self.coerced_arg(lhs, op_type, sinfo)?;
                let rhs_exp = self.coerced_arg(rhs, op_type, sinfo)?;
                let value = cmp_value(sinfo, *op, op_type, lhs_exp, rhs_exp)?;
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            Op::LogicOp {
                trgt, op, lhs, rhs, ..
            } => {
                let lhs_exp = self.arg_exp(lhs);
                let rhs_exp = self.arg_exp(rhs);
                let value = match op {
                    LogicKind::And => SmtExp::and(vec![lhs_exp, rhs_exp]),
                    LogicKind::Or => SmtExp::or(vec![lhs_exp, rhs_exp]),
                };
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            Op::UnOp {
                sinfo,
                trgt,
                trgt_type,
                op,
                arg,
            } => {
                let a = self.fresh("a");
                let arg_exp = self.coerced_arg(arg, trgt_type, sinfo)?;
                let (value, checks) = match (op, trgt_type.0.as_str()) {
                    (UnOpKind::Not, _) => (SmtExp::not(var(&a)), Vec::new()),
                    (UnOpKind::Negate, well_known::INT) => (
                        SmtExp::call("bvneg", vec![var(&a)]),
                        vec![(
                            SmtExp::eq(var(&a), self.int_min()),
                            "overflow",
                            "negation overflows".to_owned(),
                        )],
                    ),
                    (UnOpKind::Negate, well_known::BIG_INT | well_known::FLOAT) => {
                        (SmtExp::call("-", vec![var(&a)]), Vec::new())
                    }
                    (UnOpKind::Negate, other) => {
                        return Err(malformed(sinfo, format!("cannot negate '{}'", other)))
                    }
                };
                let inner = SmtExp::let_in(self.reg(trgt), value, cont);
                let inner = self.with_checks(sinfo, checks, inner);
                Ok(SmtExp::let_in(a, arg_exp, inner))
            }

            Op::IsTypeOf {
                trgt,
                arg,
                arg_flow_type,
                test_type,
                ..
            } => {
                let value = match self.ctx.boxing.repr_of(arg_flow_type)? {
                    Repr::Boxed(kind) => {
                        let tag = self.ctx.boxing.tag_const(test_type);
                        let exp = self.arg_exp(arg);
                        SmtExp::call(
                            "$SubtypeOf",
                            vec![self.ctx.boxing.type_tag_of(exp, kind), SmtExp::Const(tag)],
                        )
                    }
                    // Concrete representation: the dynamic type is the static
                    // type, so the oracle answers at encode time.
                    _ => SmtExp::bool_const(self.prog.subtype_of_keys(arg_flow_type, test_type)),
                };
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            Op::Assert { sinfo, cond, msg } => {
                let cond_exp = self.arg_exp(cond);
                let inner = self.with_checks(
                    sinfo,
                    vec![(SmtExp::not(cond_exp), "assert_failed", msg.clone())],
                    cont,
                );
                Ok(inner)
            }

            _ => unreachable!("terminators are handled by the block walk"),
        }
    }

    fn record_entries(
        &self,
        tkey: &TypeKey,
        sinfo: &SourceInfo,
    ) -> Result<Vec<(String, TypeKey)>, EncodeError> {
        let ty = self
            .prog
            .lookup_type(tkey)
            .ok_or_else(|| malformed(sinfo, format!("unknown type '{}'", tkey.0)))?;
        if let [TypeOption::Record { entries }] = ty.options.as_slice() {
            Ok(entries.clone())
        } else {
            Err(malformed(sinfo, format!("'{}' is not a record", tkey.0)))
        }
    }

    fn shape_components(
        &self,
        tkey: &TypeKey,
        sinfo: &SourceInfo,
    ) -> Result<Vec<(String, TypeKey)>, EncodeError> {
        let ty = self
            .prog
            .lookup_type(tkey)
            .ok_or_else(|| malformed(sinfo, format!("unknown type '{}'", tkey.0)))?;
        match ty.options.as_slice() {
            [TypeOption::Tuple { entries }] | [TypeOption::Ephemeral { entries }] => Ok(entries
                .iter()
                .enumerate()
                .map(|(i, t)| (i.to_string(), t.clone()))
                .collect()),
            [TypeOption::Record { entries }] => Ok(entries.clone()),
            [TypeOption::Entity { key }] => {
                let decl = self
                    .prog
                    .entities
                    .get(key)
                    .ok_or_else(|| malformed(sinfo, format!("unknown entity '{}'", key.0)))?;
                let mut components = Vec::new();
                for field_key in &decl.fields {
                    let field = self.prog.fields.get(field_key).ok_or_else(|| {
                        malformed(sinfo, format!("unknown field '{}'", field_key.0))
                    })?;
                    components.push((field.name.clone(), field.field_type.clone()));
                }
                Ok(components)
            }
            _ => Err(malformed(
                sinfo,
                format!("'{}' has no structural components", tkey.0),
            )),
        }
    }

    fn encode_construct_shape(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        args: &[Arg],
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        let components = self.shape_components(trgt_type, sinfo)?;
        if components.len() != args.len() {
            return Err(malformed(sinfo, "component count mismatch"));
        }
        let Repr::Shape { ctor, .. } = self.ctx.boxing.repr_of(trgt_type)? else {
            return Err(malformed(
                sinfo,
                format!("'{}' has no constructible shape", trgt_type.0),
            ));
        };
        let mut fields = Vec::new();
        for (arg, (_, ckey)) in args.iter().zip(&components) {
            fields.push(self.coerced_arg(arg, ckey, sinfo)?);
        }
        Ok(SmtExp::let_in(
            self.reg(trgt),
            SmtExp::call(ctor, fields),
            cont,
        ))
    }

    fn encode_construct_entity(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        entity: &TypeKey,
        args: &[Arg],
        check_invariant: bool,
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        let prog = self.prog;
        let decl = prog
            .entities
            .get(entity)
            .ok_or_else(|| malformed(sinfo, format!("unknown entity '{}'", entity.0)))?;

        let raw = self.fresh("e");
        let value = match self.ctx.boxing.repr_of(entity)? {
            Repr::Shape { ctor, .. } => {
                if args.len() != decl.fields.len() {
                    return Err(malformed(sinfo, "field count mismatch"));
                }
                let mut fields = Vec::new();
                for (arg, field_key) in args.iter().zip(&decl.fields) {
                    let field = prog.fields.get(field_key).ok_or_else(|| {
                        malformed(sinfo, format!("unknown field '{}'", field_key.0))
                    })?;
                    let field_type = field.field_type.clone();
                    fields.push(self.coerced_arg(arg, &field_type, sinfo)?);
                }
                SmtExp::call(ctor, fields)
            }
            Repr::Direct(_) => {
                // Refinement and collection wrappers carry one payload.
                let [arg] = args else {
                    return Err(malformed(sinfo, "wrapper entity takes one value"));
                };
                self.coerced_arg(arg, entity, sinfo)?
            }
            Repr::Boxed(_) => {
                return Err(malformed(
                    sinfo,
                    format!("cannot construct abstract '{}'", entity.0),
                ))
            }
        };

        let mut checks: Vec<(SmtExp, &'static str, String)> = Vec::new();
        if let Some((lo, hi)) = decl.numeric_range {
            let lo_exp = self.lit_exp(&Literal::Int(lo));
            let hi_exp = self.lit_exp(&Literal::Int(hi));
            checks.push((
                SmtExp::or(vec![
                    SmtExp::call("bvslt", vec![var(&raw), lo_exp]),
                    SmtExp::call("bvsgt", vec![var(&raw), hi_exp]),
                ]),
                "range_violation",
                format!("value outside [{}, {}]", lo, hi),
            ));
        }
        if let Some(pattern) = decl.validator.clone() {
            let re = crate::regex::regex_to_smt(&pattern)?;
            checks.push((
                SmtExp::not(SmtExp::call(
                    "str.in_re",
                    vec![var(&raw), SmtExp::Const(re)],
                )),
                "validator_violation",
                format!("value does not match '{}'", pattern),
            ));
        }

        let bound = self.coerced(var(&raw), entity, trgt_type)?;
        let mut inner = SmtExp::let_in(self.reg(trgt), bound, cont);
        inner = self.with_checks(sinfo, checks, inner);

        if check_invariant && self.checks {
            if let Some(inv_key) = decl.invariant.clone() {
                let repr = self.my_repr();
                inner = self.predicate_guard(
                    sinfo,
                    &inv_key,
                    &[var(&raw)],
                    &repr,
                    "invariant_violation",
                    format!("invariant of '{}' does not hold", decl.shortname),
                    inner,
                )?;
            }
        }
        Ok(SmtExp::let_in(raw, value, inner))
    }

    /// Checks a boolean predicate invocation at a call/construction site,
    /// forwarding the predicate's own faults when it is itself unsafe.
    fn predicate_guard(
        &mut self,
        sinfo: &SourceInfo,
        pred_key: &InvokeKey,
        args: &[SmtExp],
        repr: &ResultRepr,
        tag: &'static str,
        msg: String,
        inner: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        let prog = self.prog;
        prog.invoke(pred_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown predicate '{}'", pred_key.0)))?;
        let pred_fname = self.ctx.names.mint("$i_", &pred_key.0);
        let fault = self.ctx.faults.register(sinfo, tag, msg);
        let err = repr.err(SmtExp::Const(self.ctx.faults.error_code(fault)));

        let pred_safe = self
            .ctx
            .safety
            .fact(prog, pred_key)
            .map_or(true, |fact| fact.safe);
        if pred_safe {
            let holds = SmtExp::call(pred_fname, args.to_vec());
            Ok(SmtExp::ite(SmtExp::not(holds), err, inner))
        } else {
            let tmp = self.fresh("q");
            let bool_sort = SmtSort::new("Bool", "Bool");
            let prepr = self.ctx.boxing.result_repr(&bool_sort);
            let call = SmtExp::CallGeneral {
                fname: pred_fname,
                args: args.to_vec(),
            };
            Ok(SmtExp::let_in(
                tmp.clone(),
                call,
                SmtExp::ite(
                    prepr.is_err(var(&tmp)),
                    repr.err(prepr.err_code(var(&tmp))),
                    SmtExp::ite(SmtExp::not(prepr.unwrap_ok(var(&tmp))), err, inner),
                ),
            ))
        }
    }

    // ---- projections and updates ----

    fn project_component(
        &mut self,
        sinfo: &SourceInfo,
        exp: SmtExp,
        src_key: &TypeKey,
        component: &Component,
    ) -> Result<SmtExp, EncodeError> {
        match self.ctx.boxing.repr_of(src_key)? {
            Repr::Shape { selectors, .. } => {
                let components = self.shape_components(src_key, sinfo)?;
                let index = component
                    .position(&components)
                    .ok_or_else(|| malformed(sinfo, "projection out of range"))?;
                Ok(SmtExp::call(selectors[index].clone(), vec![exp]))
            }
            Repr::Boxed(kind) => {
                let fname = self.projection_thunk(sinfo, src_key, component, kind)?;
                Ok(SmtExp::call(fname, vec![exp]))
            }
            Repr::Direct(_) => Err(malformed(
                sinfo,
                format!("'{}' has no components", src_key.0),
            )),
        }
    }

    fn coerce_projection(
        &mut self,
        value: SmtExp,
        src_key: &TypeKey,
        index: usize,
        trgt_type: &TypeKey,
        sinfo: &SourceInfo,
    ) -> Result<SmtExp, EncodeError> {
        if let Ok(components) = self.shape_components(src_key, sinfo) {
            if let Some((_, ckey)) = components.get(index) {
                let ckey = ckey.clone();
                return self.coerced(value, &ckey, trgt_type);
            }
        }
        // Union sources: the thunk already returns the common component sort.
        Ok(value)
    }

    /// Selects a structural component out of a boxed union: one branch per
    /// concrete shape carrying the component, an unconstrained witness for
    /// everything else.
    fn projection_thunk(
        &mut self,
        sinfo: &SourceInfo,
        src_key: &TypeKey,
        component: &Component,
        kind: BoxKind,
    ) -> Result<String, EncodeError> {
        let memo_key = format!("proj|{}|{}", src_key.0, component.label());
        if let Some(fname) = self.ctx.thunk_memo.get(&memo_key) {
            return Ok(fname.clone());
        }
        let prog = self.prog;
        let src_type = prog
            .lookup_type(src_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown type '{}'", src_key.0)))?
            .clone();

        let mut branches = Vec::new();
        let mut result_sort = None;
        for option in prog.concrete_options_under(&src_type) {
            let opt_key = option.type_id();
            let Ok(components) = self.shape_components(&opt_key, sinfo) else {
                continue;
            };
            let Some(index) = component.position(&components) else {
                continue;
            };
            let Repr::Shape { selectors, .. } = self.ctx.boxing.repr_of(&opt_key)? else {
                continue;
            };
            let component_sort = self.ctx.boxing.sort_of(&components[index].1)?;
            match &result_sort {
                None => result_sort = Some(component_sort),
                Some(existing) if *existing == component_sort => {}
                // Heterogeneous component sorts would need per-source
                // projection types; the front end monomorphizes them away.
                Some(_) => return Err(malformed(sinfo, "projection sorts diverge across union")),
            }
            let (ctor, _) = self.ctx.boxing.box_ctor(&opt_key, kind)?;
            let unboxed = self.ctx.boxing.unboxed(var("x"), &opt_key, kind)?;
            branches.push((
                SmtExp::call(format!("(_ is {})", ctor), vec![var("x")]),
                SmtExp::call(selectors[index].clone(), vec![unboxed]),
            ));
        }
        let result_sort = result_sort
            .ok_or_else(|| malformed(sinfo, "no union member carries the component"))?;

        let default = self.witness(&result_sort);
        let fname = self.ctx.names.mint("$get_", &memo_key);
        self.helpers.push(SmtFunctionDef {
            name: fname.clone(),
            params: vec![("x".to_owned(), kind.sort())],
            result: result_sort,
            body: SmtExp::Cond {
                branches,
                default: Box::new(default),
            },
        });
        self.ctx.thunk_memo.insert(memo_key, fname.clone());
        Ok(fname)
    }

    fn encode_field_load(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        arg: &Arg,
        arg_flow_type: &TypeKey,
        field_key: &attest_common::data::assembly::FieldKey,
        guard: Option<&Guard>,
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        let prog = self.prog;
        let field = prog
            .fields
            .get(field_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown field '{}'", field_key.0)))?;
        let field_type = field.field_type.clone();
        let field_name = field.name.clone();
        let exp = self.arg_exp(arg);
        let raw = self.project_component(
            sinfo,
            exp,
            arg_flow_type,
            &Component::Field(field_key.clone(), field_name),
        )?;

        let Some(guard) = guard else {
            let value = self.coerced(raw, &field_type, trgt_type)?;
            return Ok(SmtExp::let_in(self.reg(trgt), value, cont));
        };

        let rawv = self.fresh("g");
        let absent = self.none_test(var(&rawv), &field_type)?;
        let present_value = self.coerced(var(&rawv), &field_type, trgt_type)?;
        let value = match &absent {
            SmtExp::Const(text) if text == "false" => present_value,
            _ => {
                let fallback = match &guard.default_value {
                    Some(default) => self.coerced_arg(default, trgt_type, sinfo)?,
                    None => {
                        let sort = self.ctx.boxing.sort_of(trgt_type)?;
                        self.witness(&sort)
                    }
                };
                SmtExp::ite(absent.clone(), fallback, present_value)
            }
        };

        let bit = SmtExp::not(absent);
        let guard_var = match &guard.loc {
            GuardLoc::Reg { name } => self.reg(name),
            GuardLoc::MaskBit { mask, index } => mask_bit_var(mask, *index),
        };
        Ok(SmtExp::let_in(
            rawv,
            raw,
            SmtExp::let_in(
                guard_var,
                bit,
                SmtExp::let_in(self.reg(trgt), value, cont),
            ),
        ))
    }

    fn encode_field_update(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        arg: &Arg,
        arg_flow_type: &TypeKey,
        field_key: &attest_common::data::assembly::FieldKey,
        value: &Arg,
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        let prog = self.prog;
        let field = prog
            .fields
            .get(field_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown field '{}'", field_key.0)))?;
        let field_type = field.field_type.clone();
        let src_exp = self.arg_exp(arg);
        let new_value = self.coerced_arg(value, &field_type, sinfo)?;

        let updated = match self.ctx.boxing.repr_of(arg_flow_type)? {
            Repr::Shape { ctor, selectors, .. } => {
                let index = self
                    .entity_field_index(arg_flow_type, field_key)
                    .ok_or_else(|| malformed(sinfo, "field not on this entity"))?;
                let src = self.fresh("u");
                let fields: Vec<SmtExp> = selectors
                    .iter()
                    .enumerate()
                    .map(|(i, sel)| {
                        if i == index {
                            new_value.clone()
                        } else {
                            SmtExp::call(sel.clone(), vec![var(&src)])
                        }
                    })
                    .collect();
                SmtExp::let_in(src, src_exp, SmtExp::call(ctor, fields))
            }
            Repr::Boxed(kind) => {
                let fname = self.update_thunk(sinfo, arg_flow_type, field_key, kind)?;
                SmtExp::call(fname, vec![src_exp, new_value])
            }
            Repr::Direct(_) => {
                return Err(malformed(
                    sinfo,
                    format!("'{}' has no fields", arg_flow_type.0),
                ))
            }
        };
        let bound = self.coerced(updated, arg_flow_type, trgt_type)?;
        Ok(SmtExp::let_in(self.reg(trgt), bound, cont))
    }

    fn entity_field_index(
        &self,
        tkey: &TypeKey,
        field_key: &attest_common::data::assembly::FieldKey,
    ) -> Option<usize> {
        let ty = self.prog.lookup_type(tkey)?;
        if let [TypeOption::Entity { key }] = ty.options.as_slice() {
            let decl = self.prog.entities.get(key)?;
            return decl.fields.iter().position(|f| f == field_key);
        }
        None
    }

    fn update_thunk(
        &mut self,
        sinfo: &SourceInfo,
        src_key: &TypeKey,
        field_key: &attest_common::data::assembly::FieldKey,
        kind: BoxKind,
    ) -> Result<String, EncodeError> {
        let memo_key = format!("upd|{}|{}", src_key.0, field_key.0);
        if let Some(fname) = self.ctx.thunk_memo.get(&memo_key) {
            return Ok(fname.clone());
        }
        let prog = self.prog;
        let field_type = prog
            .fields
            .get(field_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown field '{}'", field_key.0)))?
            .field_type
            .clone();
        let field_sort = self.ctx.boxing.sort_of(&field_type)?;
        let src_type = prog.lookup_type(src_key).unwrap().clone();

        let mut branches = Vec::new();
        for option in prog.concrete_options_under(&src_type) {
            let opt_key = option.type_id();
            let Some(index) = self.entity_field_index(&opt_key, field_key) else {
                continue;
            };
            let Repr::Shape { ctor, selectors, .. } = self.ctx.boxing.repr_of(&opt_key)? else {
                continue;
            };
            let unboxed = self.ctx.boxing.unboxed(var("x"), &opt_key, kind)?;
            let fields: Vec<SmtExp> = selectors
                .iter()
                .enumerate()
                .map(|(i, sel)| {
                    if i == index {
                        var("v")
                    } else {
                        SmtExp::call(sel.clone(), vec![unboxed.clone()])
                    }
                })
                .collect();
            let rebuilt = self
                .ctx
                .boxing
                .boxed(SmtExp::call(ctor, fields), &opt_key, kind)?;
            let (box_ctor, _) = self.ctx.boxing.box_ctor(&opt_key, kind)?;
            branches.push((
                SmtExp::call(format!("(_ is {})", box_ctor), vec![var("x")]),
                rebuilt,
            ));
        }
        if branches.is_empty() {
            return Err(malformed(sinfo, "no union member carries the field"));
        }

        let fname = self.ctx.names.mint("$upd_", &memo_key);
        self.helpers.push(SmtFunctionDef {
            name: fname.clone(),
            params: vec![
                ("x".to_owned(), kind.sort()),
                ("v".to_owned(), field_sort),
            ],
            result: kind.sort(),
            // Shapes without the field pass through unchanged.
            body: SmtExp::Cond {
                branches,
                default: Box::new(var("x")),
            },
        });
        self.ctx.thunk_memo.insert(memo_key, fname.clone());
        Ok(fname)
    }

    // ---- calls ----

    fn encode_direct_call(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        callee_key: &InvokeKey,
        args: &[Arg],
        optmask: Option<&str>,
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        let prog = self.prog;
        let callee = prog
            .invoke(callee_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown invocation '{}'", callee_key.0)))?;
        if let Some(tag) = callee.primitive.clone() {
            return self.encode_primitive(sinfo, trgt, trgt_type, callee, &tag, args, cont);
        }

        if args.len() != callee.params.len() {
            return Err(malformed(sinfo, "argument count mismatch"));
        }
        let mut call_args = Vec::new();
        for (arg, param) in args.iter().zip(&callee.params) {
            let param_type = param.param_type.clone();
            call_args.push(self.coerced_arg(arg, &param_type, sinfo)?);
        }

        let mask_size = callee.mask_size();
        let mask = if mask_size > 0 {
            let repr = self.ctx.boxing.mask_repr(mask_size);
            let bits = (0..mask_size)
                .map(|i| match optmask {
                    Some(mask_name) => {
                        if self
                            .mask_indices
                            .get(mask_name)
                            .map_or(false, |set| set.contains(&i))
                        {
                            var(mask_bit_var(mask_name, i))
                        } else {
                            SmtExp::bool_const(false)
                        }
                    }
                    // No mask register: the caller provided every optional.
                    None => SmtExp::bool_const(true),
                })
                .collect();
            Some(SmtExp::MaskConstruct {
                ctor: repr.ctor.clone(),
                bits,
            })
        } else {
            None
        };

        let callee_fname = self.ctx.names.mint("$i_", &callee_key.0);
        let callee_fact = self
            .ctx
            .safety
            .fact(prog, callee_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown invocation '{}'", callee_key.0)))?;
        let callee_result = callee.result_type.clone();
        let callee_value_sort = self.ctx.boxing.sort_of(&callee_result)?;

        let mut inner = if callee_fact.safe {
            let mut full_args = call_args.clone();
            if let Some(mask_exp) = mask.clone() {
                full_args.push(mask_exp);
            }
            let value = SmtExp::CallSimple {
                fname: callee_fname,
                args: full_args,
            };
            let value = self.coerced(value, &callee_result, trgt_type)?;
            SmtExp::let_in(self.reg(trgt), value, cont)
        } else {
            let crepr = self.ctx.boxing.result_repr(&callee_value_sort);
            let call = match mask.clone() {
                Some(mask_exp) => SmtExp::CallMasked {
                    fname: callee_fname,
                    args: call_args.clone(),
                    mask: Box::new(mask_exp),
                },
                None => SmtExp::CallGeneral {
                    fname: callee_fname,
                    args: call_args.clone(),
                },
            };
            if self.checks {
                let tmp = self.fresh("t");
                let repr = self.my_repr();
                let unwrapped =
                    self.coerced(crepr.unwrap_ok(var(&tmp)), &callee_result, trgt_type)?;
                SmtExp::let_in(
                    tmp.clone(),
                    call,
                    SmtExp::ite(
                        crepr.is_err(var(&tmp)),
                        repr.err(crepr.err_code(var(&tmp))),
                        SmtExp::let_in(self.reg(trgt), unwrapped, cont),
                    ),
                )
            } else {
                // Trusted-safe caller: unwrap unchecked.
                let unwrapped = self.coerced(crepr.unwrap_ok(call), &callee_result, trgt_type)?;
                SmtExp::let_in(self.reg(trgt), unwrapped, cont)
            }
        };

        if self.checks {
            if let Some(pre) = callee.precond.clone() {
                let repr = self.my_repr();
                inner = self.predicate_guard(
                    sinfo,
                    &pre,
                    &call_args,
                    &repr,
                    "precond_violation",
                    format!("precondition of '{}' does not hold", callee.shortname),
                    inner,
                )?;
            }
        }
        Ok(inner)
    }

    fn encode_virtual_call(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        vname: &str,
        rcvr_flow_type: &TypeKey,
        args: &[Arg],
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        let prog = self.prog;
        let Some((receiver, rest)) = args.split_first() else {
            return Err(malformed(sinfo, "virtual call without receiver"));
        };

        // A concretely typed receiver needs no dispatch.
        if !matches!(self.ctx.boxing.repr_of(rcvr_flow_type)?, Repr::Boxed(_)) {
            let targets = resolve_virtual(prog, vname, rcvr_flow_type)?;
            let ty = prog.lookup_type(rcvr_flow_type).unwrap().clone();
            let concrete = ty.options[0].type_id();
            let target = targets
                .iter()
                .find(|(entity, _)| *entity == concrete)
                .map(|(_, key)| key.clone())
                .unwrap_or_else(|| targets[0].1.clone());
            return self.encode_direct_call(sinfo, trgt, trgt_type, &target, args, None, cont);
        }

        let mut arg_keys = Vec::new();
        for arg in rest {
            arg_keys.push(self.arg_type(arg, sinfo)?);
        }
        let (fname, sum) =
            self.virtual_thunk(sinfo, vname, rcvr_flow_type, &arg_keys, trgt_type)?;

        let mut call_args = vec![self.arg_exp(receiver)];
        for arg in rest {
            call_args.push(self.arg_exp(arg));
        }

        if !sum {
            let value = SmtExp::CallSimple {
                fname,
                args: call_args,
            };
            return Ok(SmtExp::let_in(self.reg(trgt), value, cont));
        }

        let trgt_sort = self.ctx.boxing.sort_of(trgt_type)?;
        let trepr = self.ctx.boxing.result_repr(&trgt_sort);
        let call = SmtExp::CallGeneral {
            fname,
            args: call_args,
        };
        if self.checks {
            let tmp = self.fresh("t");
            let repr = self.my_repr();
            Ok(SmtExp::let_in(
                tmp.clone(),
                call,
                SmtExp::ite(
                    trepr.is_err(var(&tmp)),
                    repr.err(trepr.err_code(var(&tmp))),
                    SmtExp::let_in(self.reg(trgt), trepr.unwrap_ok(var(&tmp)), cont),
                ),
            ))
        } else {
            Ok(SmtExp::let_in(self.reg(trgt), trepr.unwrap_ok(call), cont))
        }
    }

    /// Synthesizes (memoized) the dispatch function for one virtual call
    /// shape: a branch per concrete receiver, testing the box constructor and
    /// calling the entity's vtable target.
    fn virtual_thunk(
        &mut self,
        sinfo: &SourceInfo,
        vname: &str,
        rcvr_key: &TypeKey,
        arg_keys: &[TypeKey],
        trgt_type: &TypeKey,
    ) -> Result<(String, bool), EncodeError> {
        let prog = self.prog;
        let targets = resolve_virtual(prog, vname, rcvr_key)?;

        let mut sum = false;
        let mut any_precond = false;
        for (_, target_key) in &targets {
            let target = prog.invoke(target_key).unwrap();
            let fact = self
                .ctx
                .safety
                .fact(prog, target_key)
                .ok_or_else(|| malformed(sinfo, format!("unknown target '{}'", target_key.0)))?;
            if !fact.safe || target.precond.is_some() {
                sum = true;
            }
            any_precond = any_precond || target.precond.is_some();
        }

        let arg_part: Vec<&str> = arg_keys.iter().map(|k| k.0.as_str()).collect();
        let mut memo_key = format!(
            "virt|{}|{}|{}|{}",
            vname,
            rcvr_key.0,
            arg_part.join(","),
            trgt_type.0
        );
        if any_precond {
            // Precondition faults belong to the call site.
            memo_key.push('|');
            memo_key.push_str(&sinfo.to_string());
        }
        if let Some(fname) = self.ctx.thunk_memo.get(&memo_key) {
            return Ok((fname.clone(), sum));
        }

        let kind = self.box_kind_of(rcvr_key)?;
        let value_sort = self.ctx.boxing.sort_of(trgt_type)?;
        let trepr = self.ctx.boxing.result_repr(&value_sort);
        let result_sort = if sum {
            trepr.sort.clone()
        } else {
            value_sort.clone()
        };

        let mut params = vec![("x".to_owned(), kind.sort())];
        for (i, key) in arg_keys.iter().enumerate() {
            params.push((format!("a{}", i), self.ctx.boxing.sort_of(key)?));
        }

        let mut branches = Vec::new();
        for (entity, target_key) in &targets {
            let target = prog.invoke(target_key).unwrap();
            if target.params.len() != arg_keys.len() + 1 {
                return Err(malformed(sinfo, "virtual target arity mismatch"));
            }
            let target_fname = self.ctx.names.mint("$i_", &target_key.0);
            let target_fact = self.ctx.safety.fact(prog, target_key).unwrap();
            let target_result = target.result_type.clone();

            let self_val = self.ctx.boxing.unboxed(var("x"), entity, kind)?;
            let p0 = target.params[0].param_type.clone();
            let mut call_args = vec![self.coerced(self_val, entity, &p0)?];
            for (i, key) in arg_keys.iter().enumerate() {
                let pt = target.params[i + 1].param_type.clone();
                call_args.push(self.coerced(var(format!("a{}", i)), key, &pt)?);
            }
            let mut full_args = call_args.clone();
            if target.mask_size() > 0 {
                let repr = self.ctx.boxing.mask_repr(target.mask_size());
                full_args.push(SmtExp::MaskConstruct {
                    ctor: repr.ctor.clone(),
                    bits: vec![SmtExp::bool_const(true); target.mask_size()],
                });
            }

            let mut body = if target_fact.safe {
                let value = SmtExp::CallSimple {
                    fname: target_fname,
                    args: full_args,
                };
                let value = self.coerced(value, &target_result, trgt_type)?;
                if sum {
                    trepr.ok(value)
                } else {
                    value
                }
            } else {
                let target_sort = self.ctx.boxing.sort_of(&target_result)?;
                let crepr = self.ctx.boxing.result_repr(&target_sort);
                let tmp = self.fresh("t");
                let unwrapped =
                    self.coerced(crepr.unwrap_ok(var(&tmp)), &target_result, trgt_type)?;
                SmtExp::let_in(
                    tmp.clone(),
                    SmtExp::CallGeneral {
                        fname: target_fname,
                        args: full_args,
                    },
                    SmtExp::ite(
                        crepr.is_err(var(&tmp)),
                        trepr.err(crepr.err_code(var(&tmp))),
                        trepr.ok(unwrapped),
                    ),
                )
            };
            if let Some(pre) = target.precond.clone() {
                body = self.predicate_guard(
                    sinfo,
                    &pre,
                    &call_args,
                    &trepr,
                    "precond_violation",
                    format!("precondition of '{}' does not hold", target.shortname),
                    body,
                )?;
            }

            let (box_ctor, _) = self.ctx.boxing.box_ctor(entity, kind)?;
            branches.push((
                SmtExp::call(format!("(_ is {})", box_ctor), vec![var("x")]),
                body,
            ));
        }

        let default = branches.pop().unwrap().1;
        let fname = self.ctx.names.mint("$vd_", &memo_key);
        self.helpers.push(SmtFunctionDef {
            name: fname.clone(),
            params,
            result: result_sort,
            body: SmtExp::Cond {
                branches,
                default: Box::new(default),
            },
        });
        self.ctx.thunk_memo.insert(memo_key, fname.clone());
        Ok((fname, sum))
    }

    // ---- arithmetic ----

    fn binop_value(
        &mut self,
        sinfo: &SourceInfo,
        op: BinOpKind,
        op_type: &TypeKey,
        a: &str,
        b: &str,
    ) -> Result<(SmtExp, Vec<(SmtExp, &'static str, String)>), EncodeError> {
        let av = || var(a);
        let bv = || var(b);
        let sext = |width: u32, exp: SmtExp| {
            SmtExp::call(format!("(_ sign_extend {})", width), vec![exp])
        };
        let zext = |width: u32, exp: SmtExp| {
            SmtExp::call(format!("(_ zero_extend {})", width), vec![exp])
        };
        let distinct = |x: SmtExp, y: SmtExp| SmtExp::call("distinct", vec![x, y]);
        let w = self.width();

        let out = match op_type.0.as_str() {
            well_known::INT => {
                let overflow_1 = |bvop: &str| {
                    distinct(
                        sext(1, SmtExp::call(bvop, vec![av(), bv()])),
                        SmtExp::call(bvop, vec![sext(1, av()), sext(1, bv())]),
                    )
                };
                match op {
                    BinOpKind::Add => (
                        SmtExp::call("bvadd", vec![av(), bv()]),
                        vec![(overflow_1("bvadd"), "overflow", "addition overflows".to_owned())],
                    ),
                    BinOpKind::Sub => (
                        SmtExp::call("bvsub", vec![av(), bv()]),
                        vec![(
                            overflow_1("bvsub"),
                            "overflow",
                            "subtraction overflows".to_owned(),
                        )],
                    ),
                    BinOpKind::Mul => (
                        SmtExp::call("bvmul", vec![av(), bv()]),
                        vec![(
                            distinct(
                                sext(w, SmtExp::call("bvmul", vec![av(), bv()])),
                                SmtExp::call("bvmul", vec![sext(w, av()), sext(w, bv())]),
                            ),
                            "overflow",
                            "multiplication overflows".to_owned(),
                        )],
                    ),
                    BinOpKind::Div => (
                        SmtExp::call("bvsdiv", vec![av(), bv()]),
                        vec![
                            (
                                SmtExp::eq(bv(), self.bv(0)),
                                "div_zero",
                                "division by zero".to_owned(),
                            ),
                            (
                                SmtExp::and(vec![
                                    SmtExp::eq(av(), self.int_min()),
                                    SmtExp::eq(bv(), self.all_ones()),
                                ]),
                                "overflow",
                                "division overflows".to_owned(),
                            ),
                        ],
                    ),
                    BinOpKind::Mod => (
                        SmtExp::call("bvsrem", vec![av(), bv()]),
                        vec![(
                            SmtExp::eq(bv(), self.bv(0)),
                            "div_zero",
                            "remainder by zero".to_owned(),
                        )],
                    ),
                }
            }
            well_known::NAT => {
                let overflow_1 = |bvop: &str| {
                    distinct(
                        zext(1, SmtExp::call(bvop, vec![av(), bv()])),
                        SmtExp::call(bvop, vec![zext(1, av()), zext(1, bv())]),
                    )
                };
                match op {
                    BinOpKind::Add => (
                        SmtExp::call("bvadd", vec![av(), bv()]),
                        vec![(overflow_1("bvadd"), "overflow", "addition overflows".to_owned())],
                    ),
                    BinOpKind::Sub => (
                        SmtExp::call("bvsub", vec![av(), bv()]),
                        vec![(
                            SmtExp::call("bvult", vec![av(), bv()]),
                            "underflow",
                            "subtraction underflows".to_owned(),
                        )],
                    ),
                    BinOpKind::Mul => (
                        SmtExp::call("bvmul", vec![av(), bv()]),
                        vec![(
                            distinct(
                                zext(w, SmtExp::call("bvmul", vec![av(), bv()])),
                                SmtExp::call("bvmul", vec![zext(w, av()), zext(w, bv())]),
                            ),
                            "overflow",
                            "multiplication overflows".to_owned(),
                        )],
                    ),
                    BinOpKind::Div => (
                        SmtExp::call("bvudiv", vec![av(), bv()]),
                        vec![(
                            SmtExp::eq(bv(), self.bv(0)),
                            "div_zero",
                            "division by zero".to_owned(),
                        )],
                    ),
                    BinOpKind::Mod => (
                        SmtExp::call("bvurem", vec![av(), bv()]),
                        vec![(
                            SmtExp::eq(bv(), self.bv(0)),
                            "div_zero",
                            "remainder by zero".to_owned(),
                        )],
                    ),
                }
            }
            well_known::BIG_INT => {
                let zero = SmtExp::Const("0".to_owned());
                match op {
                    BinOpKind::Add => (SmtExp::call("+", vec![av(), bv()]), Vec::new()),
                    BinOpKind::Sub => (SmtExp::call("-", vec![av(), bv()]), Vec::new()),
                    BinOpKind::Mul => (SmtExp::call("*", vec![av(), bv()]), Vec::new()),
                    BinOpKind::Div => (
                        SmtExp::call("div", vec![av(), bv()]),
                        vec![(
                            SmtExp::eq(bv(), zero),
                            "div_zero",
                            "division by zero".to_owned(),
                        )],
                    ),
                    BinOpKind::Mod => (
                        SmtExp::call("mod", vec![av(), bv()]),
                        vec![(
                            SmtExp::eq(bv(), zero),
                            "div_zero",
                            "remainder by zero".to_owned(),
                        )],
                    ),
                }
            }
            well_known::FLOAT => {
                let fname = match op {
                    BinOpKind::Add => "+",
                    BinOpKind::Sub => "-",
                    BinOpKind::Mul => "*",
                    BinOpKind::Div => "/",
                    BinOpKind::Mod => {
                        return Err(malformed(sinfo, "no remainder on reals"))
                    }
                };
                (SmtExp::call(fname, vec![av(), bv()]), Vec::new())
            }
            well_known::STRING => match op {
                BinOpKind::Add => (SmtExp::call("str.++", vec![av(), bv()]), Vec::new()),
                _ => return Err(malformed(sinfo, "strings only concatenate")),
            },
            other => {
                return Err(malformed(
                    sinfo,
                    format!("no arithmetic on '{}'", other),
                ))
            }
        };
        Ok(out)
    }

    // ---- primitives ----

    fn encode_primitive(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        callee: &InvokeDecl,
        tag: &str,
        args: &[Arg],
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        match tag {
            "havoc" => {
                let root = {
                    let sort = SmtSort::named(havoc::HAVOC_PATH_SORT);
                    self.ctx.fresh_const(&sort)
                };
                let value = havoc::havoc_call(self.ctx, trgt_type, root)?;
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            "list_empty" => {
                let value = self.ctx.lists.literal(Vec::new());
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            "list_size" => {
                let [list] = args else {
                    return Err(malformed(sinfo, "size takes a list"));
                };
                let list_exp = self.arg_exp(list);
                let size = self.ctx.lists.size(list_exp);
                // Lengths beyond the bounded width wrap; symbolic inputs are
                // constrained elsewhere to stay in range.
                let value = self.int2bv(size);
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            "list_get" => {
                let [list, index] = args else {
                    return Err(malformed(sinfo, "get takes a list and an index"));
                };
                let elem = self.elem_key_of(&self.arg_type(list, sinfo)?, sinfo)?;
                let list_exp = self.arg_exp(list);
                let index_type = self.arg_type(index, sinfo)?;
                let index_raw = self.arg_exp(index);
                let index_int = self.to_int(index_raw, &index_type)?;

                let l = self.fresh("l");
                let i = self.fresh("i");
                let size = self.ctx.lists.size(var(&l));
                let checks = vec![(
                    SmtExp::or(vec![
                        SmtExp::call("<", vec![var(&i), SmtExp::Const("0".to_owned())]),
                        SmtExp::call(">=", vec![var(&i), size]),
                    ]),
                    "out_of_bounds",
                    "index out of bounds".to_owned(),
                )];
                let element = self.ctx.lists.get(var(&l), var(&i));
                let value = self.unbox_elem(element, &elem, trgt_type)?;
                let inner = SmtExp::let_in(self.reg(trgt), value, cont);
                let inner = self.with_checks(sinfo, checks, inner);
                Ok(SmtExp::LetMulti {
                    bindings: vec![(l, list_exp), (i, index_int)],
                    body: Box::new(inner),
                })
            }

            "list_front" | "list_back" => {
                let [list] = args else {
                    return Err(malformed(sinfo, "takes a list"));
                };
                let elem = self.elem_key_of(&self.arg_type(list, sinfo)?, sinfo)?;
                let list_exp = self.arg_exp(list);
                let l = self.fresh("l");
                let size = self.ctx.lists.size(var(&l));
                let checks = vec![(
                    SmtExp::call("<=", vec![size.clone(), SmtExp::Const("0".to_owned())]),
                    "out_of_bounds",
                    "empty list".to_owned(),
                )];
                let index = if tag == "list_front" {
                    SmtExp::Const("0".to_owned())
                } else {
                    SmtExp::call("-", vec![size, SmtExp::Const("1".to_owned())])
                };
                let element = self.ctx.lists.get(var(&l), index);
                let value = self.unbox_elem(element, &elem, trgt_type)?;
                let inner = SmtExp::let_in(self.reg(trgt), value, cont);
                let inner = self.with_checks(sinfo, checks, inner);
                Ok(SmtExp::let_in(l, list_exp, inner))
            }

            "list_append" => {
                let [list, value] = args else {
                    return Err(malformed(sinfo, "append takes a list and a value"));
                };
                let elem = self.elem_key_of(&self.arg_type(list, sinfo)?, sinfo)?;
                let list_exp = self.arg_exp(list);
                let velem = self.coerced_arg(value, &elem, sinfo)?;
                let boxed = self.box_elem(velem, &elem)?;
                let tail = self.ctx.lists.literal(vec![boxed]);
                let joined = self.ctx.lists.concat2(list_exp, tail);
                Ok(SmtExp::let_in(self.reg(trgt), joined, cont))
            }

            "list_slice" => {
                let [list, from, len] = args else {
                    return Err(malformed(sinfo, "slice takes a list and two bounds"));
                };
                let list_exp = self.arg_exp(list);
                let from_type = self.arg_type(from, sinfo)?;
                let from_raw = self.arg_exp(from);
                let from_int = self.to_int(from_raw, &from_type)?;
                let len_type = self.arg_type(len, sinfo)?;
                let len_raw = self.arg_exp(len);
                let len_int = self.to_int(len_raw, &len_type)?;

                let l = self.fresh("l");
                let f = self.fresh("i");
                let n = self.fresh("i");
                let size = self.ctx.lists.size(var(&l));
                let checks = vec![(
                    SmtExp::or(vec![
                        SmtExp::call("<", vec![var(&f), SmtExp::Const("0".to_owned())]),
                        SmtExp::call("<", vec![var(&n), SmtExp::Const("0".to_owned())]),
                        SmtExp::call(
                            ">",
                            vec![SmtExp::call("+", vec![var(&f), var(&n)]), size],
                        ),
                    ]),
                    "out_of_bounds",
                    "slice out of bounds".to_owned(),
                )];
                let value = self.ctx.lists.slice(var(&l), var(&f), var(&n));
                let inner = SmtExp::let_in(self.reg(trgt), value, cont);
                let inner = self.with_checks(sinfo, checks, inner);
                Ok(SmtExp::LetMulti {
                    bindings: vec![(l, list_exp), (f, from_int), (n, len_int)],
                    body: Box::new(inner),
                })
            }

            "list_fill" => {
                let [value, count] = args else {
                    return Err(malformed(sinfo, "fill takes a value and a count"));
                };
                let elem = self.elem_key_of(trgt_type, sinfo)?;
                let velem = self.coerced_arg(value, &elem, sinfo)?;
                let boxed = self.box_elem(velem, &elem)?;
                let count_type = self.arg_type(count, sinfo)?;
                let count_raw = self.arg_exp(count);
                let count_int = self.to_int(count_raw, &count_type)?;
                let n = self.fresh("i");
                let clamped = SmtExp::ite(
                    SmtExp::call("<", vec![var(&n), SmtExp::Const("0".to_owned())]),
                    SmtExp::Const("0".to_owned()),
                    var(&n),
                );
                let value = self.ctx.lists.fill(boxed, clamped);
                Ok(SmtExp::let_in(
                    n,
                    count_int,
                    SmtExp::let_in(self.reg(trgt), value, cont),
                ))
            }

            "list_range" => {
                let [from, to] = args else {
                    return Err(malformed(sinfo, "range takes two bounds"));
                };
                let from_type = self.arg_type(from, sinfo)?;
                let from_raw = self.arg_exp(from);
                let from_int = self.to_int(from_raw, &from_type)?;
                let to_type = self.arg_type(to, sinfo)?;
                let to_raw = self.arg_exp(to);
                let to_int = self.to_int(to_raw, &to_type)?;
                let value = self.ctx.lists.range(from_int, to_int);
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }

            "list_sum" => {
                let [list] = args else {
                    return Err(malformed(sinfo, "sum takes a list"));
                };
                let list_exp = self.arg_exp(list);
                let l = self.fresh("l");
                let s = self.fresh("s");
                let total = self.ctx.lists.sum(var(&l));
                let max = SmtExp::Const(format!("{}", (1u128 << self.width()) - 1));
                let checks = vec![(
                    SmtExp::call(">", vec![var(&s), max]),
                    "overflow",
                    "sum overflows".to_owned(),
                )];
                let value = self.int2bv(var(&s));
                let inner = SmtExp::let_in(self.reg(trgt), value, cont);
                let inner = self.with_checks(sinfo, checks, inner);
                Ok(SmtExp::let_in(
                    l,
                    list_exp,
                    SmtExp::let_in(s, total, inner),
                ))
            }

            "list_map" | "list_filter" | "list_find" => {
                self.encode_large_op(sinfo, trgt, trgt_type, callee, tag, args, cont)
            }

            // Declared but unencoded list operations.
            "list_zip" | "list_sort" | "list_join" | "list_reverse" => {
                self.unconditional_fault(sinfo, trgt, trgt_type, tag, cont)
            }

            other => Err(EncodeError::UnimplementedPrimitive {
                context: self.decl.key.0.clone(),
                tag: other.to_owned(),
            }),
        }
    }

    fn unconditional_fault(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        tag: &str,
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        if self.checks {
            Ok(self.register_fault(
                sinfo,
                "unsupported_op",
                format!("'{}' has no bounded encoding", tag),
            ))
        } else {
            let sort = self.ctx.boxing.sort_of(trgt_type)?;
            let w = self.witness(&sort);
            Ok(SmtExp::let_in(self.reg(trgt), w, cont))
        }
    }

    fn encode_large_op(
        &mut self,
        sinfo: &SourceInfo,
        trgt: &str,
        trgt_type: &TypeKey,
        callee: &InvokeDecl,
        tag: &str,
        args: &[Arg],
        cont: SmtExp,
    ) -> Result<SmtExp, EncodeError> {
        if !self.ctx.opts.large_ops {
            return self.unconditional_fault(sinfo, trgt, trgt_type, tag, cont);
        }
        let prog = self.prog;
        let cb_key = callback_key(callee).ok_or_else(|| EncodeError::UnimplementedPrimitive {
            context: self.decl.key.0.clone(),
            tag: format!("{} without callback", tag),
        })?;
        let cb = prog
            .invoke(&cb_key)
            .ok_or_else(|| malformed(sinfo, format!("unknown callback '{}'", cb_key.0)))?;
        let cb_safe = self
            .ctx
            .safety
            .fact(prog, &cb_key)
            .map_or(false, |fact| fact.safe);
        if !cb_safe || cb.params.len() != 1 {
            // Quantified axioms need a total per-element function.
            return self.unconditional_fault(sinfo, trgt, trgt_type, tag, cont);
        }

        let [list] = args else {
            return Err(malformed(sinfo, "large op takes a list"));
        };
        let src_key = self.arg_type(list, sinfo)?;
        let elem = self.elem_key_of(&src_key, sinfo)?;
        let list_exp = self.arg_exp(list);

        let cb_fname = self.ctx.names.mint("$i_", &cb_key.0);
        let cb_param = cb.params[0].param_type.clone();
        let cb_result = cb.result_type.clone();

        let wrapper_key = format!("lam|{}|{}", cb_key.0, tag);
        let wname = match self.ctx.thunk_memo.get(&wrapper_key) {
            Some(existing) => existing.clone(),
            None => {
                let wname = self.ctx.names.mint("$lam_", &wrapper_key);
                let input = self.unbox_elem(var("v"), &elem, &cb_param)?;
                let applied = SmtExp::call(cb_fname, vec![input]);
                let (body, result) = if tag == "list_map" {
                    let out_elem = self.elem_key_of(trgt_type, sinfo)?;
                    let out = self.coerced(applied, &cb_result, &out_elem)?;
                    (
                        self.box_elem(out, &out_elem)?,
                        SmtSort::named(crate::boxing::BTERM_SORT),
                    )
                } else {
                    let bool_key = TypeKey(well_known::BOOL.to_owned());
                    (
                        self.coerced(applied, &cb_result, &bool_key)?,
                        SmtSort::new("Bool", "Bool"),
                    )
                };
                self.helpers.push(SmtFunctionDef {
                    name: wname.clone(),
                    params: vec![(
                        "v".to_owned(),
                        SmtSort::named(crate::boxing::BTERM_SORT),
                    )],
                    result,
                    body,
                });
                self.ctx.thunk_memo.insert(wrapper_key, wname.clone());
                wname
            }
        };

        match tag {
            "list_map" => {
                let value = self.ctx.lists.map_node(list_exp, &wname);
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }
            "list_filter" => {
                let value = self.ctx.lists.filter_node(list_exp, &wname);
                Ok(SmtExp::let_in(self.reg(trgt), value, cont))
            }
            "list_find" => {
                let l = self.fresh("l");
                let (index, found) = self.ctx.lists.find_first(var(&l), &wname);
                let checks = vec![(
                    SmtExp::not(found),
                    "not_found",
                    "no element satisfies the predicate".to_owned(),
                )];
                let value = if trgt_type.0 == well_known::NAT {
                    self.int2bv(index)
                } else {
                    let element = self.ctx.lists.get(var(&l), index);
                    self.unbox_elem(element, &elem, trgt_type)?
                };
                let inner = SmtExp::let_in(self.reg(trgt), value, cont);
                let inner = self.with_checks(sinfo, checks, inner);
                Ok(SmtExp::let_in(l, list_exp, inner))
            }
            _ => unreachable!(),
        }
    }
}

/// A structural component reference: positional for tuples, named for
/// records, keyed for entity fields.
enum Component {
    Index(usize),
    Name(String),
    Field(attest_common::data::assembly::FieldKey, String),
}

impl Component {
    fn label(&self) -> String {
        match self {
            Component::Index(i) => i.to_string(),
            Component::Name(name) => name.clone(),
            Component::Field(key, _) => key.0.clone(),
        }
    }

    fn position(&self, components: &[(String, TypeKey)]) -> Option<usize> {
        match self {
            Component::Index(i) => (*i < components.len()).then_some(*i),
            Component::Name(name) | Component::Field(_, name) => {
                components.iter().position(|(n, _)| n == name)
            }
        }
    }
}

fn is_terminator(op: &Op) -> bool {
    matches!(
        op,
        Op::Jump { .. }
            | Op::JumpCond { .. }
            | Op::JumpNone { .. }
            | Op::ReturnAssign { .. }
            | Op::Abort { .. }
    )
}

fn lit_type(lit: &Literal) -> TypeKey {
    let name = match lit {
        Literal::None => well_known::NONE,
        Literal::Bool(_) => well_known::BOOL,
        Literal::Int(_) => well_known::INT,
        Literal::Nat(_) => well_known::NAT,
        Literal::BigInt(_) => well_known::BIG_INT,
        Literal::Float(_) => well_known::FLOAT,
        Literal::Str(_) => well_known::STRING,
    };
    TypeKey(name.to_owned())
}

fn mask_bit_var(mask: &str, index: usize) -> String {
    format!("$mb_{}_{}", mask, index)
}

fn cmp_value(
    sinfo: &SourceInfo,
    op: CmpKind,
    op_type: &TypeKey,
    lhs: SmtExp,
    rhs: SmtExp,
) -> Result<SmtExp, EncodeError> {
    match op {
        CmpKind::Eq => return Ok(SmtExp::eq(lhs, rhs)),
        CmpKind::Neq => return Ok(SmtExp::call("distinct", vec![lhs, rhs])),
        _ => {}
    }
    let (lt, le) = match op_type.0.as_str() {
        well_known::INT => ("bvslt", "bvsle"),
        well_known::NAT => ("bvult", "bvule"),
        well_known::BIG_INT | well_known::FLOAT => ("<", "<="),
        well_known::STRING => ("str.<", "str.<="),
        other => return Err(malformed(sinfo, format!("no ordering on '{}'", other))),
    };
    Ok(match op {
        CmpKind::Lt => SmtExp::call(lt, vec![lhs, rhs]),
        CmpKind::Le => SmtExp::call(le, vec![lhs, rhs]),
        CmpKind::Gt => SmtExp::call(lt, vec![rhs, lhs]),
        CmpKind::Ge => SmtExp::call(le, vec![rhs, lhs]),
        CmpKind::Eq | CmpKind::Neq => unreachable!(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use attest_common::config::EncodeOptions;
    use attest_common::data::assembly::{
        Assembly, EntityDecl, FieldDecl, FieldKey, FlowType, ParamDecl, TypeOption,
    };
    use attest_common::data::mir::BasicBlock;
    use std::collections::BTreeMap;

    fn sinfo(line: u64) -> SourceInfo {
        SourceInfo {
            file: "app.src".to_owned(),
            line,
            pos: 0,
        }
    }

    fn int_key() -> TypeKey {
        TypeKey("Int".to_owned())
    }

    fn param(name: &str, ty: &str) -> ParamDecl {
        ParamDecl {
            name: name.to_owned(),
            param_type: TypeKey(ty.to_owned()),
            optional: false,
        }
    }

    fn invoke(key: &str, params: Vec<ParamDecl>, blocks: Vec<BasicBlock>) -> InvokeDecl {
        InvokeDecl {
            key: InvokeKey(key.to_owned()),
            shortname: key.to_owned(),
            params,
            result_type: int_key(),
            recursive: false,
            attributes: Vec::new(),
            precond: None,
            postcond: None,
            body: Some(Body { blocks }),
            primitive: None,
        }
    }

    fn block(label: &str, ops: Vec<Op>) -> BasicBlock {
        BasicBlock {
            label: label.to_owned(),
            ops,
        }
    }

    fn translate(assembly: Assembly, root: &str) -> (attest_common::data::assembly::Program, String, usize) {
        let prog = attest_common::data::assembly::Program::build(assembly).unwrap();
        let roots = vec![InvokeKey(root.to_owned())];
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &roots).unwrap();
        let id = prog.invoke_ids[&InvokeKey(root.to_owned())];
        let out = translate_invoke(&mut ctx, id).unwrap();
        let rendered = out.main.unwrap().render();
        let faults = ctx.faults.len();
        (prog, rendered, faults)
    }

    #[test]
    fn safe_identity_returns_a_bare_value() {
        let assembly = Assembly {
            invokes: vec![invoke(
                "id",
                vec![param("x", "Int")],
                vec![block(
                    "entry",
                    vec![
                        Op::AccessArgument {
                            sinfo: sinfo(1),
                            trgt: "t0".to_owned(),
                            trgt_type: int_key(),
                            name: "x".to_owned(),
                        },
                        Op::ReturnAssign {
                            sinfo: sinfo(2),
                            src: Arg::Var("t0".to_owned()),
                        },
                    ],
                )],
            )],
            ..Assembly::default()
        };
        let (_, rendered, faults) = translate(assembly, "id");
        assert!(rendered.contains("$p_x"));
        assert!(rendered.contains("(_ BitVec 16)"));
        assert!(!rendered.contains("$Result_"));
        assert_eq!(faults, 0);
    }

    #[test]
    fn addition_gets_an_overflow_guard_and_a_failure_sum() {
        let assembly = Assembly {
            invokes: vec![invoke(
                "inc",
                vec![param("x", "Int")],
                vec![block(
                    "entry",
                    vec![
                        Op::AccessArgument {
                            sinfo: sinfo(1),
                            trgt: "t0".to_owned(),
                            trgt_type: int_key(),
                            name: "x".to_owned(),
                        },
                        Op::BinOp {
                            sinfo: sinfo(2),
                            trgt: "t1".to_owned(),
                            trgt_type: int_key(),
                            op: BinOpKind::Add,
                            op_type: int_key(),
                            lhs: Arg::Var("t0".to_owned()),
                            rhs: Arg::Lit(Literal::Int(1)),
                        },
                        Op::ReturnAssign {
                            sinfo: sinfo(3),
                            src: Arg::Var("t1".to_owned()),
                        },
                    ],
                )],
            )],
            ..Assembly::default()
        };
        let (_, rendered, faults) = translate(assembly, "inc");
        assert!(rendered.contains("(_ sign_extend 1)"));
        assert!(rendered.contains("$Err_Int"));
        assert!(rendered.contains("$Ok_Int"));
        assert_eq!(faults, 1);
    }

    #[test]
    fn unsafe_callee_results_are_inspected_and_forwarded() {
        let add_body = vec![block(
            "entry",
            vec![
                Op::AccessArgument {
                    sinfo: sinfo(1),
                    trgt: "t0".to_owned(),
                    trgt_type: int_key(),
                    name: "x".to_owned(),
                },
                Op::BinOp {
                    sinfo: sinfo(2),
                    trgt: "t1".to_owned(),
                    trgt_type: int_key(),
                    op: BinOpKind::Add,
                    op_type: int_key(),
                    lhs: Arg::Var("t0".to_owned()),
                    rhs: Arg::Lit(Literal::Int(1)),
                },
                Op::ReturnAssign {
                    sinfo: sinfo(3),
                    src: Arg::Var("t1".to_owned()),
                },
            ],
        )];
        let outer_body = vec![block(
            "entry",
            vec![
                Op::Invoke {
                    sinfo: sinfo(10),
                    trgt: "t0".to_owned(),
                    trgt_type: int_key(),
                    invoke: InvokeKey("inc".to_owned()),
                    args: vec![Arg::Lit(Literal::Int(5))],
                    optmask: None,
                },
                Op::ReturnAssign {
                    sinfo: sinfo(11),
                    src: Arg::Var("t0".to_owned()),
                },
            ],
        )];
        let assembly = Assembly {
            invokes: vec![
                invoke("inc", vec![param("x", "Int")], add_body),
                invoke("outer", Vec::new(), outer_body),
            ],
            ..Assembly::default()
        };
        let (_, rendered, _) = translate(assembly, "outer");
        assert!(rendered.contains("(_ is $Err_Int)"));
        // The callee's error code passes through unchanged.
        assert!(rendered.contains("$Err_Int@code"));
    }

    #[test]
    fn assert_registers_a_fault_with_its_message_position() {
        let assembly = Assembly {
            invokes: vec![invoke(
                "checked",
                vec![param("x", "Int")],
                vec![block(
                    "entry",
                    vec![
                        Op::AccessArgument {
                            sinfo: sinfo(1),
                            trgt: "t0".to_owned(),
                            trgt_type: int_key(),
                            name: "x".to_owned(),
                        },
                        Op::BinCmp {
                            sinfo: sinfo(2),
                            trgt: "c".to_owned(),
                            op: CmpKind::Gt,
                            op_type: int_key(),
                            lhs: Arg::Var("t0".to_owned()),
                            rhs: Arg::Lit(Literal::Int(0)),
                        },
                        Op::Assert {
                            sinfo: sinfo(3),
                            cond: Arg::Var("c".to_owned()),
                            msg: "x must be positive".to_owned(),
                        },
                        Op::ReturnAssign {
                            sinfo: sinfo(4),
                            src: Arg::Var("t0".to_owned()),
                        },
                    ],
                )],
            )],
            ..Assembly::default()
        };
        let prog = attest_common::data::assembly::Program::build(assembly).unwrap();
        let roots = vec![InvokeKey("checked".to_owned())];
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &roots).unwrap();
        let id = prog.invoke_ids[&InvokeKey("checked".to_owned())];
        let out = translate_invoke(&mut ctx, id).unwrap();
        let rendered = out.main.unwrap().render();
        assert!(rendered.contains("(not $r_c)"));
        let mut found = false;
        for (_, info) in &ctx.faults.infos {
            if info.tag == "assert_failed" {
                assert_eq!(info.line, 3);
                assert_eq!(info.msg, "x must be positive");
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn branches_inline_both_arms_and_bind_merge_points() {
        let assembly = Assembly {
            invokes: vec![invoke(
                "pick",
                vec![param("x", "Int")],
                vec![
                    block(
                        "entry",
                        vec![
                            Op::AccessArgument {
                                sinfo: sinfo(1),
                                trgt: "t0".to_owned(),
                                trgt_type: int_key(),
                                name: "x".to_owned(),
                            },
                            Op::BinCmp {
                                sinfo: sinfo(2),
                                trgt: "c".to_owned(),
                                op: CmpKind::Lt,
                                op_type: int_key(),
                                lhs: Arg::Var("t0".to_owned()),
                                rhs: Arg::Lit(Literal::Int(0)),
                            },
                            Op::JumpCond {
                                sinfo: sinfo(3),
                                cond: Arg::Var("c".to_owned()),
                                true_block: "neg".to_owned(),
                                false_block: "pos".to_owned(),
                            },
                        ],
                    ),
                    block(
                        "neg",
                        vec![
                            Op::LoadConst {
                                sinfo: sinfo(4),
                                trgt: "a".to_owned(),
                                trgt_type: int_key(),
                                value: Literal::Int(1),
                            },
                            Op::Jump {
                                sinfo: sinfo(5),
                                target: "join".to_owned(),
                            },
                        ],
                    ),
                    block(
                        "pos",
                        vec![
                            Op::LoadConst {
                                sinfo: sinfo(6),
                                trgt: "b".to_owned(),
                                trgt_type: int_key(),
                                value: Literal::Int(2),
                            },
                            Op::Jump {
                                sinfo: sinfo(7),
                                target: "join".to_owned(),
                            },
                        ],
                    ),
                    block(
                        "join",
                        vec![
                            Op::Phi {
                                sinfo: sinfo(8),
                                trgt: "m".to_owned(),
                                trgt_type: int_key(),
                                sources: BTreeMap::from([
                                    ("neg".to_owned(), Arg::Var("a".to_owned())),
                                    ("pos".to_owned(), Arg::Var("b".to_owned())),
                                ]),
                            },
                            Op::ReturnAssign {
                                sinfo: sinfo(9),
                                src: Arg::Var("m".to_owned()),
                            },
                        ],
                    ),
                ],
            )],
            ..Assembly::default()
        };
        let (_, rendered, _) = translate(assembly, "pick");
        assert!(rendered.contains("(ite (bvslt"));
        assert!(rendered.contains("(_ bv1 16)"));
        assert!(rendered.contains("(_ bv2 16)"));
        // Merge value bound at both jump sites.
        assert_eq!(rendered.matches("(($r_m ").count(), 2);
    }

    #[test]
    fn control_flow_cycles_are_rejected() {
        let assembly = Assembly {
            invokes: vec![invoke(
                "spin",
                Vec::new(),
                vec![
                    block(
                        "entry",
                        vec![Op::Jump {
                            sinfo: sinfo(1),
                            target: "entry".to_owned(),
                        }],
                    ),
                ],
            )],
            ..Assembly::default()
        };
        let prog = attest_common::data::assembly::Program::build(assembly).unwrap();
        let roots = vec![InvokeKey("spin".to_owned())];
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &roots).unwrap();
        let id = prog.invoke_ids[&InvokeKey("spin".to_owned())];
        assert!(matches!(
            translate_invoke(&mut ctx, id),
            Err(EncodeError::MalformedOp { .. })
        ));
    }

    #[test]
    fn list_access_goes_through_the_accessor_theory() {
        let int_list = EntityDecl {
            key: TypeKey("IntList".to_owned()),
            shortname: "IntList".to_owned(),
            fields: Vec::new(),
            provides: vec![TypeKey("APIType".to_owned())],
            vtable: BTreeMap::new(),
            invariant: None,
            validator: None,
            collection_of: Some(int_key()),
            numeric_range: None,
            is_abstract: false,
        };
        let get = InvokeDecl {
            key: InvokeKey("get".to_owned()),
            shortname: "get".to_owned(),
            params: vec![param("l", "IntList"), param("i", "Nat")],
            result_type: int_key(),
            recursive: false,
            attributes: Vec::new(),
            precond: None,
            postcond: None,
            body: None,
            primitive: Some("list_get".to_owned()),
        };
        let caller = invoke(
            "first",
            Vec::new(),
            vec![block(
                "entry",
                vec![
                    Op::ConstructList {
                        sinfo: sinfo(1),
                        trgt: "l".to_owned(),
                        trgt_type: TypeKey("IntList".to_owned()),
                        args: vec![Arg::Lit(Literal::Int(7)), Arg::Lit(Literal::Int(8))],
                    },
                    Op::Invoke {
                        sinfo: sinfo(2),
                        trgt: "t0".to_owned(),
                        trgt_type: int_key(),
                        invoke: InvokeKey("get".to_owned()),
                        args: vec![Arg::Var("l".to_owned()), Arg::Lit(Literal::Nat(0))],
                        optmask: None,
                    },
                    Op::ReturnAssign {
                        sinfo: sinfo(3),
                        src: Arg::Var("t0".to_owned()),
                    },
                ],
            )],
        );
        let assembly = Assembly {
            entities: vec![int_list],
            invokes: vec![get, caller],
            ..Assembly::default()
        };
        let prog = attest_common::data::assembly::Program::build(assembly).unwrap();
        let roots = vec![InvokeKey("first".to_owned())];
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &roots).unwrap();
        let id = prog.invoke_ids[&InvokeKey("first".to_owned())];
        let out = translate_invoke(&mut ctx, id).unwrap();
        let rendered = out.main.unwrap().render();
        assert!(rendered.contains("$List@lit2"));
        assert!(rendered.contains("$ListGet"));
        assert!(rendered.contains("bv2nat"));
        let mut bounds = false;
        for (_, info) in &ctx.faults.infos {
            bounds = bounds || info.tag == "out_of_bounds";
        }
        assert!(bounds);
    }

    #[test]
    fn union_field_loads_dispatch_on_type_tags() {
        let entity = |key: &str, fields: Vec<&str>| EntityDecl {
            key: TypeKey(key.to_owned()),
            shortname: key.to_owned(),
            fields: fields.into_iter().map(|f| FieldKey(f.to_owned())).collect(),
            provides: Vec::new(),
            vtable: BTreeMap::new(),
            invariant: None,
            validator: None,
            collection_of: None,
            numeric_range: None,
            is_abstract: false,
        };
        let assembly = Assembly {
            types: vec![FlowType {
                type_id: TypeKey("Cat|Dog".to_owned()),
                shortname: "Pet".to_owned(),
                options: vec![
                    TypeOption::Entity {
                        key: TypeKey("Cat".to_owned()),
                    },
                    TypeOption::Entity {
                        key: TypeKey("Dog".to_owned()),
                    },
                ],
            }],
            entities: vec![entity("Cat", vec!["cat.name"]), entity("Dog", vec![])],
            fields: vec![FieldDecl {
                key: FieldKey("cat.name".to_owned()),
                name: "name".to_owned(),
                field_type: int_key(),
                optional: false,
            }],
            invokes: vec![invoke(
                "pet_name",
                vec![param("p", "Cat|Dog")],
                vec![block(
                    "entry",
                    vec![
                        Op::AccessArgument {
                            sinfo: sinfo(1),
                            trgt: "t0".to_owned(),
                            trgt_type: TypeKey("Cat|Dog".to_owned()),
                            name: "p".to_owned(),
                        },
                        Op::FieldLoad {
                            sinfo: sinfo(2),
                            trgt: "n".to_owned(),
                            trgt_type: int_key(),
                            arg: Arg::Var("t0".to_owned()),
                            arg_flow_type: TypeKey("Cat|Dog".to_owned()),
                            field: FieldKey("cat.name".to_owned()),
                            guard: None,
                        },
                        Op::ReturnAssign {
                            sinfo: sinfo(3),
                            src: Arg::Var("n".to_owned()),
                        },
                    ],
                )],
            )],
            ..Assembly::default()
        };

        let prog = attest_common::data::assembly::Program::build(assembly).unwrap();
        let roots = vec![InvokeKey("pet_name".to_owned())];
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &roots).unwrap();
        let id = prog.invoke_ids[&InvokeKey("pet_name".to_owned())];
        let out = translate_invoke(&mut ctx, id).unwrap();

        let main = out.main.unwrap().render();
        assert!(main.contains("$get_"));

        let thunks: String = out.helpers.iter().map(|h| h.render()).collect();
        assert!(thunks.contains("(_ is "));
        // The shape without the field falls through to an unconstrained witness.
        assert!(thunks.contains("$w0"));
        assert!(ctx.extra_decls.iter().any(|decl| decl.contains("$w0")));
    }
}
