//! Symbolic witness ("havoc") constructors for externally-visible types.
//!
//! Every API-visible type gets one havoc function from an abstract input path
//! to a value of its solver sort. Functions are declared uninterpreted and
//! pinned down by defining assertions, which makes recursive types and
//! mutually recursive shapes unproblematic; refinements (numeric ranges,
//! string validators, entity invariants) become constraints over all paths.

use attest_common::data::assembly::{well_known, TypeKey, TypeOption};
use attest_common::data::smt::{SmtExp, SmtSort};
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::boxing::Repr;
use crate::emit::EncodeCtx;
use crate::error::EncodeError;
use crate::regex::regex_to_smt;

pub const HAVOC_PATH_SORT: &str = "$HavocPath";

#[derive(Default)]
pub(crate) struct HavocGen {
    registered: BTreeMap<TypeKey, String>,
    decls: Vec<String>,
    /// Assertions over declared havoc functions that reference translated
    /// invocation definitions (entity invariants); rendered with the action,
    /// after every function definition.
    constraints: Vec<String>,
    used: bool,
}

impl HavocGen {
    pub(crate) fn new() -> Self {
        HavocGen::default()
    }

    pub(crate) fn render_havoc_decls(&self) -> String {
        let mut out = String::new();
        if !self.used {
            return out;
        }
        let _ = writeln!(out, "(declare-sort {} 0)", HAVOC_PATH_SORT);
        let _ = writeln!(
            out,
            "(declare-fun $HavocStep (Int {}) {})",
            HAVOC_PATH_SORT, HAVOC_PATH_SORT
        );
        let _ = writeln!(out, "(declare-fun $HavocListId ({}) Int)", HAVOC_PATH_SORT);
        for decl in &self.decls {
            out.push_str(decl);
            out.push('\n');
        }
        out
    }

    pub(crate) fn render_constraints(&self) -> String {
        let mut out = String::new();
        for constraint in &self.constraints {
            out.push_str(constraint);
            out.push('\n');
        }
        out
    }
}

fn path_var() -> SmtExp {
    SmtExp::Var("p".to_owned())
}

fn step(index: usize, path: SmtExp) -> SmtExp {
    SmtExp::call(
        "$HavocStep",
        vec![SmtExp::Const(index.to_string()), path],
    )
}

fn forall_paths(body: String) -> String {
    format!(
        "(assert (forall ((p {})) {}))",
        HAVOC_PATH_SORT, body
    )
}

/// A havoc'd value of `key` at `path`.
pub(crate) fn havoc_call(
    ctx: &mut EncodeCtx,
    key: &TypeKey,
    path: SmtExp,
) -> Result<SmtExp, EncodeError> {
    let fname = ensure_havoc_fn(ctx, key)?;
    Ok(SmtExp::call(fname, vec![path]))
}

fn ensure_havoc_fn(ctx: &mut EncodeCtx, key: &TypeKey) -> Result<String, EncodeError> {
    if let Some(fname) = ctx.havoc.registered.get(key) {
        return Ok(fname.clone());
    }
    ctx.havoc.used = true;
    let fname = ctx.names.mint("$havoc_", &key.0);
    // Registered before the body is built so recursive shapes tie back to the
    // same declared function.
    ctx.havoc.registered.insert(key.clone(), fname.clone());

    let sort = ctx.boxing.sort_of(key)?;
    ctx.havoc.decls.push(format!(
        "(declare-fun {} ({}) {})",
        fname, HAVOC_PATH_SORT, sort.name
    ));

    if let Some(constraint) = havoc_definition(ctx, key, &fname, &sort)? {
        ctx.havoc.decls.push(constraint);
    }
    Ok(fname)
}

/// The defining assertion for one havoc function, or `None` for sorts whose
/// values are legitimately unconstrained.
fn havoc_definition(
    ctx: &mut EncodeCtx,
    key: &TypeKey,
    fname: &str,
    sort: &SmtSort,
) -> Result<Option<String>, EncodeError> {
    let prog = ctx.prog;
    let ty = prog
        .lookup_type(key)
        .ok_or_else(|| EncodeError::MissingKey {
            referrer: "havoc".to_owned(),
            missing: key.0.clone(),
        })?
        .clone();
    let applied = SmtExp::call(fname, vec![path_var()]);

    if ty.options.len() == 1 {
        if let TypeOption::Entity { key: entity_key } = &ty.options[0] {
            if well_known::PRIMITIVES.contains(&entity_key.0.as_str()) {
                // Unconstrained symbolic primitive.
                return Ok(None);
            }
            if let Some(decl) = prog.entities.get(entity_key).cloned() {
                if let Some((lo, hi)) = decl.numeric_range {
                    let body = format!(
                        "(and (bvsge {val} {lo}) (bvsle {val} {hi}))",
                        val = applied.render(0),
                        lo = bv_const(lo, ctx.opts.int_width),
                        hi = bv_const(hi, ctx.opts.int_width),
                    );
                    return Ok(Some(forall_paths(body)));
                }
                if let Some(pattern) = &decl.validator {
                    let re = regex_to_smt(pattern)?;
                    let body = format!("(str.in_re {} {})", applied.render(0), re);
                    return Ok(Some(forall_paths(body)));
                }
                if let Some(elem_key) = &decl.collection_of {
                    return collection_definition(ctx, elem_key, &applied);
                }
                if !decl.is_abstract {
                    return entity_definition(ctx, &decl, fname, &applied);
                }
                // Abstract entity: falls through to the union encoding below.
            }
        }
        match &ty.options[0] {
            TypeOption::Tuple { entries } | TypeOption::Ephemeral { entries } => {
                let components: Vec<(String, TypeKey)> = entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| (i.to_string(), entry.clone()))
                    .collect();
                return shape_definition(ctx, key, &components, &applied);
            }
            TypeOption::Record { entries } => {
                return shape_definition(ctx, key, entries, &applied);
            }
            _ => {}
        }
    }

    union_definition(ctx, key, sort, &applied)
}

fn entity_definition(
    ctx: &mut EncodeCtx,
    decl: &attest_common::data::assembly::EntityDecl,
    fname: &str,
    applied: &SmtExp,
) -> Result<Option<String>, EncodeError> {
    let mut components = Vec::new();
    for field_key in &decl.fields {
        let field = ctx
            .prog
            .fields
            .get(field_key)
            .ok_or_else(|| EncodeError::MissingKey {
                referrer: decl.key.0.clone(),
                missing: field_key.0.clone(),
            })?;
        components.push((field.name.clone(), field.field_type.clone()));
    }
    let definition = shape_definition(ctx, &decl.key, &components, applied)?;

    if let Some(invariant) = &decl.invariant {
        let inv_fname = ctx.names.mint("$i_", &invariant.0);
        let inv_id = ctx.prog.invoke_ids[invariant];
        let call = SmtExp::call(&inv_fname, vec![SmtExp::call(fname, vec![path_var()])]);
        let holds = if ctx.safety.facts[inv_id].safe {
            call
        } else {
            let bool_sort = SmtSort::new("Bool", "Bool");
            let repr = ctx.boxing.result_repr(&bool_sort);
            SmtExp::and(vec![
                SmtExp::not(repr.is_err(call.clone())),
                repr.unwrap_ok(call),
            ])
        };
        ctx.havoc
            .constraints
            .push(forall_paths(holds.render(0)));
    }
    Ok(definition)
}

fn shape_definition(
    ctx: &mut EncodeCtx,
    key: &TypeKey,
    components: &[(String, TypeKey)],
    applied: &SmtExp,
) -> Result<Option<String>, EncodeError> {
    let repr = ctx.boxing.repr_of(key)?;
    let Repr::Shape { ctor, .. } = repr else {
        return Err(EncodeError::Unrepresentable {
            from: key.0.clone(),
            into: "havoc shape".to_owned(),
        });
    };
    let mut args = Vec::new();
    for (index, (_, ckey)) in components.iter().enumerate() {
        args.push(havoc_call(ctx, ckey, step(index, path_var()))?);
    }
    let body = SmtExp::eq(applied.clone(), SmtExp::call(ctor, args));
    Ok(Some(forall_paths(body.render(0))))
}

fn collection_definition(
    ctx: &mut EncodeCtx,
    elem_key: &TypeKey,
    applied: &SmtExp,
) -> Result<Option<String>, EncodeError> {
    let id = SmtExp::call("$HavocListId", vec![path_var()]);
    let node = ctx.lists.havoc_node(id.clone());
    let mut out = forall_paths(SmtExp::eq(applied.clone(), node).render(0));

    // Pin symbolic elements to the element shape when it is concrete; union
    // elements stay unconstrained boxed terms.
    let elem_repr = ctx.boxing.repr_of(elem_key)?;
    if !matches!(elem_repr, Repr::Boxed(_)) {
        let (ctor, _) = ctx
            .boxing
            .box_ctor(elem_key, crate::boxing::BoxKind::Term)?;
        out.push('\n');
        out.push_str(&format!(
            "(assert (forall ((p {path}) (i Int)) ((_ is {ctor}) ($HavocListGet ($HavocListId p) i))))",
            path = HAVOC_PATH_SORT,
            ctor = ctor,
        ));
    }
    Ok(Some(out))
}

fn union_definition(
    ctx: &mut EncodeCtx,
    key: &TypeKey,
    sort: &SmtSort,
    applied: &SmtExp,
) -> Result<Option<String>, EncodeError> {
    let ty = ctx.prog.lookup_type(key).unwrap().clone();
    let kind = if ctx.prog.is_key_type(&ty) {
        crate::boxing::BoxKind::Key
    } else {
        crate::boxing::BoxKind::Term
    };
    let options = ctx.prog.concrete_options_under(&ty);
    if options.is_empty() {
        // No concrete inhabitant; the declared function stays unconstrained.
        return Ok(None);
    }

    let choice = ctx.names.mint("$havocc_", &key.0);
    ctx.havoc.decls.push(format!(
        "(declare-fun {} ({}) Int)",
        choice, HAVOC_PATH_SORT
    ));
    let choice_call = SmtExp::call(&choice, vec![path_var()]);

    let mut branches = Vec::new();
    for (index, option) in options.iter().enumerate() {
        let opt_key = option.type_id();
        let inner = havoc_call(ctx, &opt_key, step(index, path_var()))?;
        let boxed = ctx.boxing.boxed(inner, &opt_key, kind)?;
        branches.push((
            SmtExp::eq(choice_call.clone(), SmtExp::Const(index.to_string())),
            boxed,
        ));
    }
    let default = branches.pop().unwrap().1;
    let value = SmtExp::Cond {
        branches,
        default: Box::new(default),
    };
    debug_assert_eq!(sort.name, kind.sort().name);
    let body = SmtExp::eq(applied.clone(), value);
    Ok(Some(forall_paths(body.render(0))))
}

fn bv_const(n: i64, width: u32) -> String {
    if n < 0 {
        format!("(bvneg (_ bv{} {}))", n.unsigned_abs(), width)
    } else {
        format!("(_ bv{} {})", n, width)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::emit::EncodeCtx;
    use attest_common::config::EncodeOptions;
    use attest_common::data::assembly::{Assembly, EntityDecl, FieldDecl, FieldKey, Program};
    use std::collections::BTreeMap;

    fn sample_assembly() -> Assembly {
        Assembly {
            entities: vec![
                EntityDecl {
                    key: TypeKey("Score".to_owned()),
                    shortname: "Score".to_owned(),
                    fields: Vec::new(),
                    provides: vec![TypeKey("APIType".to_owned())],
                    vtable: BTreeMap::new(),
                    invariant: None,
                    validator: None,
                    collection_of: None,
                    numeric_range: Some((0, 100)),
                    is_abstract: false,
                },
                EntityDecl {
                    key: TypeKey("Pair".to_owned()),
                    shortname: "Pair".to_owned(),
                    fields: vec![FieldKey("pair.a".to_owned()), FieldKey("pair.b".to_owned())],
                    provides: vec![TypeKey("APIType".to_owned())],
                    vtable: BTreeMap::new(),
                    invariant: None,
                    validator: None,
                    collection_of: None,
                    numeric_range: None,
                    is_abstract: false,
                },
            ],
            fields: vec![
                FieldDecl {
                    key: FieldKey("pair.a".to_owned()),
                    name: "a".to_owned(),
                    field_type: TypeKey("Int".to_owned()),
                    optional: false,
                },
                FieldDecl {
                    key: FieldKey("pair.b".to_owned()),
                    name: "b".to_owned(),
                    field_type: TypeKey("Score".to_owned()),
                    optional: false,
                },
            ],
            ..Assembly::default()
        }
    }

    #[test]
    fn numeric_range_constrains_all_paths() {
        let prog = Program::build(sample_assembly()).unwrap();
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &[]).unwrap();
        havoc_call(&mut ctx, &TypeKey("Score".to_owned()), path_var()).unwrap();
        let decls = ctx.havoc.render_havoc_decls();
        assert!(decls.contains("(declare-sort $HavocPath 0)"));
        assert!(decls.contains("bvsge"));
        assert!(decls.contains("(_ bv100 16)"));
    }

    #[test]
    fn entity_havoc_recurses_into_fields() {
        let prog = Program::build(sample_assembly()).unwrap();
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &[]).unwrap();
        havoc_call(&mut ctx, &TypeKey("Pair".to_owned()), path_var()).unwrap();
        let decls = ctx.havoc.render_havoc_decls();
        // One function per reached type, tied together through path steps.
        assert!(decls.contains("$havoc_Pair"));
        assert!(decls.contains("$havoc_Int"));
        assert!(decls.contains("$havoc_Score"));
        assert!(decls.contains("($HavocStep 1 p)"));
    }

    #[test]
    fn havoc_functions_are_minted_once() {
        let prog = Program::build(sample_assembly()).unwrap();
        let mut ctx = EncodeCtx::new(&prog, EncodeOptions::default(), &[]).unwrap();
        let first = havoc_call(&mut ctx, &TypeKey("Pair".to_owned()), path_var()).unwrap();
        let again = havoc_call(&mut ctx, &TypeKey("Pair".to_owned()), path_var()).unwrap();
        assert_eq!(first, again);
        let decls = ctx.havoc.render_havoc_decls();
        assert_eq!(decls.matches("(declare-fun $havoc_Pair ").count(), 1);
    }
}
