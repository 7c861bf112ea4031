//! Sort assignment and boxing.
//!
//! Every flow type gets exactly one solver representation: an unboxed
//! primitive sort, a dedicated datatype for a unique structural shape, or one
//! of the two universal boxed sorts (`$BKey` for ordering-comparable values,
//! `$BTerm` for everything else). Shapes, boxes, and list nodes are mutually
//! recursive, so all datatype definitions are collected here as data and
//! rendered as one joint `declare-datatypes` group by the orchestrator.

use attest_common::config::EncodeOptions;
use attest_common::data::assembly::{well_known, FlowType, Program, TypeKey, TypeOption};
use attest_common::data::smt::{MatchBranch, SmtExp, SmtFunctionDef, SmtSort};
use attest_common::util::intern::NameInterner;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::rc::Rc;

use crate::error::EncodeError;

pub const BKEY_SORT: &str = "$BKey";
pub const BTERM_SORT: &str = "$BTerm";
pub const TYPE_TAG_SORT: &str = "$TypeTag";
pub const TAG_UNKNOWN: &str = "$Tag_Unknown";
pub const LIST_SORT: &str = "$List";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BoxKind {
    /// Values admitting a total order; storable as map/set keys.
    Key,
    Term,
}

impl BoxKind {
    pub fn sort(self) -> SmtSort {
        match self {
            BoxKind::Key => SmtSort::new(BKEY_SORT, "BKey"),
            BoxKind::Term => SmtSort::new(BTERM_SORT, "BTerm"),
        }
    }
}

/// How a flow type's values live in the solver.
#[derive(Clone, Debug)]
pub enum Repr {
    Direct(SmtSort),
    Shape {
        sort: SmtSort,
        ctor: String,
        selectors: Vec<String>,
    },
    Boxed(BoxKind),
}

impl Repr {
    pub fn sort(&self) -> SmtSort {
        match self {
            Repr::Direct(sort) => sort.clone(),
            Repr::Shape { sort, .. } => sort.clone(),
            Repr::Boxed(kind) => kind.sort(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataCtor {
    pub name: String,
    pub fields: Vec<(String, SmtSort)>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataDef {
    pub name: String,
    pub ctors: Vec<DataCtor>,
}

/// Renders one joint `declare-datatypes` group; member sorts may reference
/// each other freely.
pub fn render_datatypes(defs: &[DataDef]) -> String {
    let mut out = String::new();
    out.push_str("(declare-datatypes (");
    for def in defs {
        let _ = write!(out, "({} 0) ", def.name);
    }
    out.pop();
    out.push_str(")\n  (");
    for def in defs {
        out.push_str("\n    (");
        for (i, ctor) in def.ctors.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push('(');
            out.push_str(&ctor.name);
            for (sel, sort) in &ctor.fields {
                let _ = write!(out, " ({} {})", sel, sort.name);
            }
            out.push(')');
        }
        out.push(')');
    }
    out.push_str("\n  )\n)");
    out
}

#[derive(Clone, Debug)]
struct BoxCtor {
    ctor: String,
    selector: String,
    inner: SmtSort,
    tag: String,
}

#[derive(Clone, Debug)]
pub struct ResultRepr {
    pub sort: SmtSort,
    pub ok_ctor: String,
    pub ok_sel: String,
    pub err_ctor: String,
    pub err_sel: String,
}

impl ResultRepr {
    pub fn is_err(&self, exp: SmtExp) -> SmtExp {
        SmtExp::call(format!("(_ is {})", self.err_ctor), vec![exp])
    }

    pub fn ok(&self, value: SmtExp) -> SmtExp {
        SmtExp::call(&self.ok_ctor, vec![value])
    }

    pub fn err(&self, code: SmtExp) -> SmtExp {
        SmtExp::call(&self.err_ctor, vec![code])
    }

    pub fn unwrap_ok(&self, exp: SmtExp) -> SmtExp {
        SmtExp::call(&self.ok_sel, vec![exp])
    }

    pub fn err_code(&self, exp: SmtExp) -> SmtExp {
        SmtExp::call(&self.err_sel, vec![exp])
    }
}

#[derive(Clone, Debug)]
pub struct MaskRepr {
    pub sort: SmtSort,
    pub ctor: String,
    pub bit_sels: Vec<String>,
}

impl MaskRepr {
    pub fn bit(&self, mask: SmtExp, index: usize) -> SmtExp {
        SmtExp::call(&self.bit_sels[index], vec![mask])
    }
}

pub struct BoxEmitter<'a> {
    prog: &'a Program,
    int_width: u32,
    names: NameInterner,

    shapes: Vec<DataDef>,
    shape_names: BTreeSet<String>,
    repr_memo: BTreeMap<TypeKey, Repr>,
    in_progress: BTreeSet<TypeKey>,

    key_ctors: BTreeMap<TypeKey, BoxCtor>,
    term_ctors: BTreeMap<TypeKey, BoxCtor>,

    tags: BTreeMap<TypeKey, String>,
    results: BTreeMap<String, ResultRepr>,
    result_value_sorts: BTreeMap<String, SmtSort>,
    masks: BTreeMap<usize, MaskRepr>,

    coercions: BTreeMap<(TypeKey, TypeKey), Option<String>>,
    coercion_defs: Vec<SmtFunctionDef>,
    needs_widen: bool,
}

impl<'a> BoxEmitter<'a> {
    pub fn new(prog: &'a Program, opts: &EncodeOptions) -> Self {
        BoxEmitter {
            prog,
            int_width: opts.int_width,
            names: NameInterner::new(),
            shapes: Vec::new(),
            shape_names: BTreeSet::new(),
            repr_memo: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            key_ctors: BTreeMap::new(),
            term_ctors: BTreeMap::new(),
            tags: BTreeMap::new(),
            results: BTreeMap::new(),
            result_value_sorts: BTreeMap::new(),
            masks: BTreeMap::new(),
            coercions: BTreeMap::new(),
            coercion_defs: Vec::new(),
            needs_widen: false,
        }
    }

    pub fn int_sort(&self) -> SmtSort {
        SmtSort::new(format!("(_ BitVec {})", self.int_width), "Int")
    }

    pub fn nat_sort(&self) -> SmtSort {
        SmtSort::new(format!("(_ BitVec {})", self.int_width), "Nat")
    }

    fn primitive_sort(&self, name: &str) -> Option<SmtSort> {
        match name {
            well_known::BOOL => Some(SmtSort::new("Bool", "Bool")),
            well_known::INT => Some(self.int_sort()),
            well_known::NAT => Some(self.nat_sort()),
            well_known::BIG_INT => Some(SmtSort::new("Int", "BigInt")),
            well_known::FLOAT => Some(SmtSort::new("Real", "Float")),
            well_known::STRING => Some(SmtSort::new("String", "String")),
            well_known::NONE => Some(SmtSort::named("$Unit")),
            _ => None,
        }
    }

    fn box_kind_of(&self, ty: &FlowType) -> BoxKind {
        if self.prog.is_key_type(ty) {
            BoxKind::Key
        } else {
            BoxKind::Term
        }
    }

    pub fn repr_of(&mut self, key: &TypeKey) -> Result<Repr, EncodeError> {
        if let Some(repr) = self.repr_memo.get(key) {
            return Ok(repr.clone());
        }
        let ty: Rc<FlowType> = self
            .prog
            .lookup_type(key)
            .ok_or_else(|| EncodeError::MissingKey {
                referrer: "type model".to_owned(),
                missing: key.0.clone(),
            })?
            .clone();

        // A shape reaching itself through a field must box the back edge;
        // the universal sorts and the shapes form one datatype group, so the
        // indirection is well-founded.
        if !self.in_progress.insert(key.clone()) {
            return Ok(Repr::Boxed(self.box_kind_of(&ty)));
        }
        let repr = self.compute_repr(&ty);
        self.in_progress.remove(key);
        let repr = repr?;
        self.repr_memo.insert(key.clone(), repr.clone());
        Ok(repr)
    }

    pub fn sort_of(&mut self, key: &TypeKey) -> Result<SmtSort, EncodeError> {
        Ok(self.repr_of(key)?.sort())
    }

    fn compute_repr(&mut self, ty: &FlowType) -> Result<Repr, EncodeError> {
        if ty.options.len() != 1 {
            return Ok(Repr::Boxed(self.box_kind_of(ty)));
        }
        let option = ty.options[0].clone();
        match &option {
            TypeOption::Entity { key } => {
                if let Some(sort) = self.primitive_sort(&key.0) {
                    return Ok(Repr::Direct(sort));
                }
                let decl = self
                    .prog
                    .entities
                    .get(key)
                    .ok_or_else(|| EncodeError::MissingKey {
                        referrer: ty.type_id.0.clone(),
                        missing: key.0.clone(),
                    })?
                    .clone();
                if decl.collection_of.is_some() {
                    return Ok(Repr::Direct(SmtSort::named(LIST_SORT)));
                }
                if decl.numeric_range.is_some() {
                    return Ok(Repr::Direct(self.int_sort()));
                }
                if decl.validator.is_some() {
                    return Ok(Repr::Direct(SmtSort::new("String", "String")));
                }
                if decl.is_abstract {
                    return Ok(Repr::Boxed(self.box_kind_of(ty)));
                }
                let mut components = Vec::new();
                for field_key in &decl.fields {
                    let field = self.prog.fields.get(field_key).ok_or_else(|| {
                        EncodeError::MissingKey {
                            referrer: key.0.clone(),
                            missing: field_key.0.clone(),
                        }
                    })?;
                    components.push((field.name.clone(), field.field_type.clone()));
                }
                self.register_shape("$E_", &ty.type_id, &components)
            }
            TypeOption::Concept { .. } => Ok(Repr::Boxed(self.box_kind_of(ty))),
            TypeOption::Tuple { entries } => {
                let components: Vec<(String, TypeKey)> = entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| (i.to_string(), entry.clone()))
                    .collect();
                self.register_shape("$T_", &ty.type_id, &components)
            }
            TypeOption::Record { entries } => {
                self.register_shape("$R_", &ty.type_id, entries)
            }
            TypeOption::Ephemeral { entries } => {
                let components: Vec<(String, TypeKey)> = entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| (i.to_string(), entry.clone()))
                    .collect();
                self.register_shape("$V_", &ty.type_id, &components)
            }
        }
    }

    fn register_shape(
        &mut self,
        prefix: &str,
        type_id: &TypeKey,
        components: &[(String, TypeKey)],
    ) -> Result<Repr, EncodeError> {
        let sort_name = self.names.mint(prefix, &type_id.0);
        let ctor = format!("{}@mk", sort_name);
        let mut selectors = Vec::new();
        let mut fields = Vec::new();
        for (cname, ckey) in components {
            let inner = self.sort_of(ckey)?;
            let selector = format!("{}@{}", sort_name, cname);
            fields.push((selector.clone(), inner));
            selectors.push(selector);
        }
        if self.shape_names.insert(sort_name.clone()) {
            self.shapes.push(DataDef {
                name: sort_name.clone(),
                ctors: vec![DataCtor {
                    name: ctor.clone(),
                    fields,
                }],
            });
        }
        Ok(Repr::Shape {
            sort: SmtSort::named(sort_name),
            ctor,
            selectors,
        })
    }

    /// Registers (idempotently) the box constructor wrapping `concrete` values
    /// into the universal sort `kind`, returning `(ctor, selector)`.
    pub fn box_ctor(
        &mut self,
        concrete: &TypeKey,
        kind: BoxKind,
    ) -> Result<(String, String), EncodeError> {
        let table = match kind {
            BoxKind::Key => &self.key_ctors,
            BoxKind::Term => &self.term_ctors,
        };
        if let Some(entry) = table.get(concrete) {
            return Ok((entry.ctor.clone(), entry.selector.clone()));
        }

        let repr = self.repr_of(concrete)?;
        if let Repr::Boxed(_) = repr {
            return Err(EncodeError::Unrepresentable {
                from: concrete.0.clone(),
                into: kind.sort().name,
            });
        }
        let prefix = match kind {
            BoxKind::Key => "$BKey_",
            BoxKind::Term => "$BTerm_",
        };
        let ctor = self.names.mint(prefix, &concrete.0);
        let selector = format!("{}@val", ctor);
        let tag = self.tag_const(concrete);
        let entry = BoxCtor {
            ctor: ctor.clone(),
            selector: selector.clone(),
            inner: repr.sort(),
            tag,
        };
        match kind {
            BoxKind::Key => self.key_ctors.insert(concrete.clone(), entry),
            BoxKind::Term => self.term_ctors.insert(concrete.clone(), entry),
        };
        Ok((ctor, selector))
    }

    pub fn boxed(
        &mut self,
        exp: SmtExp,
        concrete: &TypeKey,
        kind: BoxKind,
    ) -> Result<SmtExp, EncodeError> {
        let (ctor, _) = self.box_ctor(concrete, kind)?;
        Ok(SmtExp::call(ctor, vec![exp]))
    }

    pub fn unboxed(
        &mut self,
        exp: SmtExp,
        concrete: &TypeKey,
        kind: BoxKind,
    ) -> Result<SmtExp, EncodeError> {
        let (_, selector) = self.box_ctor(concrete, kind)?;
        Ok(SmtExp::call(selector, vec![exp]))
    }

    /// Rewraps a key-boxed value as a term box, forcing the widening function
    /// to be rendered.
    pub fn widen(&mut self, exp: SmtExp) -> SmtExp {
        self.needs_widen = true;
        SmtExp::call("$WidenKeyTerm", vec![exp])
    }

    /// The type-tag constant for a concrete shape, registering it on first use.
    pub fn tag_const(&mut self, key: &TypeKey) -> String {
        if let Some(tag) = self.tags.get(key) {
            return tag.clone();
        }
        let tag = self.names.mint("$Tag_", &key.0);
        self.tags.insert(key.clone(), tag.clone());
        tag
    }

    /// A cached coercion between two representations. `Ok(None)` means the
    /// representations already coincide and no call is needed.
    pub fn coerce(
        &mut self,
        from: &TypeKey,
        into: &TypeKey,
    ) -> Result<Option<String>, EncodeError> {
        if from == into {
            return Ok(None);
        }
        let cache_key = (from.clone(), into.clone());
        if let Some(cached) = self.coercions.get(&cache_key) {
            return Ok(cached.clone());
        }

        let from_repr = self.repr_of(from)?;
        let into_repr = self.repr_of(into)?;
        let result = match (&from_repr, &into_repr) {
            (a, b) if a.sort() == b.sort() => None,

            (Repr::Direct(_) | Repr::Shape { .. }, Repr::Boxed(kind)) => {
                let kind = *kind;
                let (ctor, _) = self.box_ctor(from, kind)?;
                let fname = self.names.mint("$as_", &format!("{}>{}", from.0, into.0));
                self.coercion_defs.push(SmtFunctionDef {
                    name: fname.clone(),
                    params: vec![("x".to_owned(), from_repr.sort())],
                    result: kind.sort(),
                    body: SmtExp::call(ctor, vec![SmtExp::Var("x".to_owned())]),
                });
                Some(fname)
            }

            (Repr::Boxed(kind), Repr::Direct(_) | Repr::Shape { .. }) => {
                let kind = *kind;
                let (_, selector) = self.box_ctor(into, kind)?;
                let fname = self.names.mint("$as_", &format!("{}>{}", from.0, into.0));
                self.coercion_defs.push(SmtFunctionDef {
                    name: fname.clone(),
                    params: vec![("x".to_owned(), kind.sort())],
                    result: into_repr.sort(),
                    body: SmtExp::call(selector, vec![SmtExp::Var("x".to_owned())]),
                });
                Some(fname)
            }

            (Repr::Boxed(BoxKind::Key), Repr::Boxed(BoxKind::Term)) => {
                // Body rendered at the end, once every key constructor exists.
                self.needs_widen = true;
                Some("$WidenKeyTerm".to_owned())
            }

            _ => {
                return Err(EncodeError::Unrepresentable {
                    from: from.0.clone(),
                    into: into.0.clone(),
                })
            }
        };

        self.coercions.insert(cache_key, result.clone());
        Ok(result)
    }

    /// The failure-sum wrapper around `value_sort`, shared by every invocation
    /// returning that sort.
    pub fn result_repr(&mut self, value_sort: &SmtSort) -> ResultRepr {
        if let Some(repr) = self.results.get(&value_sort.tag) {
            return repr.clone();
        }
        let name = format!("$Result_{}", value_sort.tag);
        let repr = ResultRepr {
            sort: SmtSort::named(name.clone()),
            ok_ctor: format!("$Ok_{}", value_sort.tag),
            ok_sel: format!("$Ok_{}@val", value_sort.tag),
            err_ctor: format!("$Err_{}", value_sort.tag),
            err_sel: format!("$Err_{}@code", value_sort.tag),
        };
        self.results.insert(value_sort.tag.clone(), repr.clone());
        // The rendered declaration needs the value sort's spelled name, which
        // the tag alone cannot recover.
        self.result_value_sorts
            .insert(value_sort.tag.clone(), value_sort.clone());
        repr
    }

    pub fn mask_repr(&mut self, size: usize) -> MaskRepr {
        if let Some(repr) = self.masks.get(&size) {
            return repr.clone();
        }
        let name = format!("$Mask_{}", size);
        let repr = MaskRepr {
            sort: SmtSort::named(name.clone()),
            ctor: format!("{}@mk", name),
            bit_sels: (0..size).map(|i| format!("{}@{}", name, i)).collect(),
        };
        self.masks.insert(size, repr.clone());
        repr
    }

    /// Dispatches a boxed value to its type tag; the opaque constructor and
    /// any unmatched case map to the unknown tag.
    pub fn type_tag_of(&self, exp: SmtExp, kind: BoxKind) -> SmtExp {
        let fname = match kind {
            BoxKind::Key => "$TypeTagOfKey",
            BoxKind::Term => "$TypeTagOfTerm",
        };
        SmtExp::call(fname, vec![exp])
    }

    /// All datatype definitions this emitter owns: `$Unit`, every dedicated
    /// shape, and the two universal boxed sorts.
    pub fn datatype_defs(&self) -> Vec<DataDef> {
        let mut defs = vec![DataDef {
            name: "$Unit".to_owned(),
            ctors: vec![DataCtor {
                name: "$unit".to_owned(),
                fields: Vec::new(),
            }],
        }];
        defs.extend(self.shapes.iter().cloned());
        for (name, table) in [(BKEY_SORT, &self.key_ctors), (BTERM_SORT, &self.term_ctors)] {
            let mut ctors = vec![DataCtor {
                name: format!("{}@opaque", name),
                fields: vec![(format!("{}@opaque@v", name), SmtSort::new("Int", "BigInt"))],
            }];
            for entry in table.values() {
                ctors.push(DataCtor {
                    name: entry.ctor.clone(),
                    fields: vec![(entry.selector.clone(), entry.inner.clone())],
                });
            }
            defs.push(DataDef {
                name: name.to_owned(),
                ctors,
            });
        }
        defs
    }

    pub fn render_tag_decls(&self) -> String {
        let mut out = String::new();
        out.push_str("(declare-datatypes ((");
        out.push_str(TYPE_TAG_SORT);
        out.push_str(" 0)) (((");
        out.push_str(TAG_UNKNOWN);
        out.push(')');
        for tag in self.tags.values() {
            let _ = write!(out, " ({})", tag);
        }
        out.push_str(")))");
        out
    }

    pub fn render_subtype_facts(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "(declare-fun $SubtypeOf ({} {}) Bool)",
            TYPE_TAG_SORT, TYPE_TAG_SORT
        );
        for (key1, tag1) in &self.tags {
            for (key2, tag2) in &self.tags {
                if self.prog.subtype_of_keys(key1, key2) {
                    let _ = writeln!(out, "(assert ($SubtypeOf {} {}))", tag1, tag2);
                } else {
                    let _ = writeln!(out, "(assert (not ($SubtypeOf {} {})))", tag1, tag2);
                }
            }
        }
        out
    }

    pub fn render_index_facts(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "(declare-fun $HasIndex ({} Int) Bool)", TYPE_TAG_SORT);
        for (key, tag) in &self.tags {
            let Some(ty) = self.prog.lookup_type(key) else {
                continue;
            };
            if let [TypeOption::Tuple { entries }] = ty.options.as_slice() {
                for index in 0..entries.len() {
                    let _ = writeln!(out, "(assert ($HasIndex {} {}))", tag, index);
                }
            }
        }
        out
    }

    pub fn render_property_facts(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "(declare-fun $HasProperty ({} String) Bool)",
            TYPE_TAG_SORT
        );
        for (key, tag) in &self.tags {
            let mut props: Vec<String> = Vec::new();
            if let Some(decl) = self.prog.entities.get(key) {
                for field_key in &decl.fields {
                    if let Some(field) = self.prog.fields.get(field_key) {
                        props.push(field.name.clone());
                    }
                }
            } else if let Some(ty) = self.prog.lookup_type(key) {
                if let [TypeOption::Record { entries }] = ty.options.as_slice() {
                    props.extend(entries.iter().map(|(name, _)| name.clone()));
                }
            }
            for prop in props {
                let _ = writeln!(out, "(assert ($HasProperty {} \"{}\"))", tag, prop);
            }
        }
        out
    }

    pub fn render_result_decls(&self) -> String {
        let mut out = String::new();
        for (tag, repr) in &self.results {
            let value_sort = &self.result_value_sorts[tag];
            let _ = writeln!(
                out,
                "(declare-datatypes (({} 0)) ((({} ({} {})) ({} ({} Int)))))",
                repr.sort.name,
                repr.ok_ctor,
                repr.ok_sel,
                value_sort.name,
                repr.err_ctor,
                repr.err_sel,
            );
        }
        out
    }

    pub fn render_mask_decls(&self) -> String {
        let mut out = String::new();
        for repr in self.masks.values() {
            let _ = write!(out, "(declare-datatypes (({} 0)) ((({}", repr.sort.name, repr.ctor);
            for sel in &repr.bit_sels {
                let _ = write!(out, " ({} Bool)", sel);
            }
            out.push_str("))))\n");
        }
        out
    }

    /// Tag-dispatch and coercion helpers; rendered last, once every box
    /// constructor has been registered.
    pub fn render_box_decls(&self) -> String {
        let mut out = String::new();

        for (fname, kind, table) in [
            ("$TypeTagOfKey", BoxKind::Key, &self.key_ctors),
            ("$TypeTagOfTerm", BoxKind::Term, &self.term_ctors),
        ] {
            let mut branches: Vec<MatchBranch> = table
                .values()
                .map(|entry| MatchBranch {
                    ctor: entry.ctor.clone(),
                    binders: vec!["_v".to_owned()],
                    body: SmtExp::Const(entry.tag.clone()),
                })
                .collect();
            // Variable pattern: the opaque constructor and anything unlisted.
            branches.push(MatchBranch {
                ctor: "_other".to_owned(),
                binders: Vec::new(),
                body: SmtExp::Const(TAG_UNKNOWN.to_owned()),
            });
            let def = SmtFunctionDef {
                name: fname.to_owned(),
                params: vec![("x".to_owned(), kind.sort())],
                result: SmtSort::named(TYPE_TAG_SORT),
                body: SmtExp::Match {
                    scrutinee: Box::new(SmtExp::Var("x".to_owned())),
                    branches,
                },
            };
            out.push_str(&def.render());
            out.push('\n');
        }

        if self.needs_widen {
            let mut branches: Vec<(SmtExp, SmtExp)> = Vec::new();
            for (concrete, entry) in &self.key_ctors {
                let term_ctor = self
                    .term_ctors
                    .get(concrete)
                    .map(|term| term.ctor.clone());
                // A key value only widens if the same shape is also a term
                // constructor; unregistered shapes fall to the opaque default.
                if let Some(term_ctor) = term_ctor {
                    branches.push((
                        SmtExp::call(format!("(_ is {})", entry.ctor), vec![SmtExp::Var("x".to_owned())]),
                        SmtExp::call(
                            term_ctor,
                            vec![SmtExp::call(&entry.selector, vec![SmtExp::Var("x".to_owned())])],
                        ),
                    ));
                }
            }
            let default = SmtExp::call(
                format!("{}@opaque", BTERM_SORT),
                vec![SmtExp::call(
                    format!("{}@opaque@v", BKEY_SORT),
                    vec![SmtExp::Var("x".to_owned())],
                )],
            );
            let def = SmtFunctionDef {
                name: "$WidenKeyTerm".to_owned(),
                params: vec![("x".to_owned(), BoxKind::Key.sort())],
                result: BoxKind::Term.sort(),
                body: SmtExp::Cond {
                    branches,
                    default: Box::new(default),
                },
            };
            out.push_str(&def.render());
            out.push('\n');
        }

        for def in &self.coercion_defs {
            out.push_str(&def.render());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use attest_common::data::assembly::{Assembly, ConceptDecl, EntityDecl, FieldDecl, FieldKey};
    use std::collections::BTreeMap;

    fn sample_program() -> Program {
        let assembly = Assembly {
            concepts: vec![ConceptDecl {
                key: TypeKey("Shape".to_owned()),
                shortname: "Shape".to_owned(),
                provides: vec![TypeKey("Any".to_owned())],
            }],
            entities: vec![EntityDecl {
                key: TypeKey("Point".to_owned()),
                shortname: "Point".to_owned(),
                fields: vec![FieldKey("point.x".to_owned()), FieldKey("point.y".to_owned())],
                provides: vec![TypeKey("Shape".to_owned())],
                vtable: BTreeMap::new(),
                invariant: None,
                validator: None,
                collection_of: None,
                numeric_range: None,
                is_abstract: false,
            }],
            fields: vec![
                FieldDecl {
                    key: FieldKey("point.x".to_owned()),
                    name: "x".to_owned(),
                    field_type: TypeKey("Int".to_owned()),
                    optional: false,
                },
                FieldDecl {
                    key: FieldKey("point.y".to_owned()),
                    name: "y".to_owned(),
                    field_type: TypeKey("Int".to_owned()),
                    optional: false,
                },
            ],
            ..Assembly::default()
        };
        Program::build(assembly).unwrap()
    }

    #[test]
    fn primitives_stay_unboxed() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        let repr = emitter.repr_of(&TypeKey("Int".to_owned())).unwrap();
        match repr {
            Repr::Direct(sort) => assert_eq!(sort.name, "(_ BitVec 16)"),
            other => panic!("Int should be direct, got {:?}", other),
        }
    }

    #[test]
    fn entity_gets_a_dedicated_shape_with_field_selectors() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        let repr = emitter.repr_of(&TypeKey("Point".to_owned())).unwrap();
        match repr {
            Repr::Shape { ctor, selectors, .. } => {
                assert!(ctor.ends_with("@mk"));
                assert_eq!(selectors.len(), 2);
                assert!(selectors[0].ends_with("@x"));
                assert!(selectors[1].ends_with("@y"));
            }
            other => panic!("Point should be a shape, got {:?}", other),
        }
    }

    #[test]
    fn concepts_and_unions_are_boxed() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        let shape = emitter.repr_of(&TypeKey("Shape".to_owned())).unwrap();
        assert!(matches!(shape, Repr::Boxed(BoxKind::Term)));
        let key_marker = emitter.repr_of(&TypeKey("KeyType".to_owned())).unwrap();
        assert!(matches!(key_marker, Repr::Boxed(BoxKind::Key)));
    }

    #[test]
    fn box_round_trip_pairs_ctor_and_selector() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        let int_key = TypeKey("Int".to_owned());
        let boxed = emitter
            .boxed(SmtExp::Var("n".to_owned()), &int_key, BoxKind::Key)
            .unwrap();
        let unboxed = emitter.unboxed(boxed.clone(), &int_key, BoxKind::Key).unwrap();
        let boxed_text = boxed.render(0);
        let unboxed_text = unboxed.render(0);
        assert!(boxed_text.starts_with("($BKey_"));
        assert!(unboxed_text.contains("@val"));
        assert!(unboxed_text.contains(&boxed_text));
    }

    #[test]
    fn coercions_are_cached_per_pair() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        let int_key = TypeKey("Int".to_owned());
        let shape_key = TypeKey("Shape".to_owned());
        let point_key = TypeKey("Point".to_owned());
        let first = emitter.coerce(&point_key, &shape_key).unwrap().unwrap();
        let again = emitter.coerce(&point_key, &shape_key).unwrap().unwrap();
        assert_eq!(first, again);
        assert_eq!(emitter.coercion_defs.len(), 1);
        assert!(emitter.coerce(&int_key, &int_key).unwrap().is_none());
    }

    #[test]
    fn subtype_facts_match_the_oracle() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        let point_tag = emitter.tag_const(&TypeKey("Point".to_owned()));
        let shape_tag = emitter.tag_const(&TypeKey("Shape".to_owned()));
        let facts = emitter.render_subtype_facts();
        assert!(facts.contains(&format!("(assert ($SubtypeOf {} {}))", point_tag, shape_tag)));
        assert!(facts.contains(&format!(
            "(assert (not ($SubtypeOf {} {})))",
            shape_tag, point_tag
        )));
    }

    #[test]
    fn datatype_group_includes_unit_shapes_and_boxes() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        emitter.repr_of(&TypeKey("Point".to_owned())).unwrap();
        emitter
            .boxed(SmtExp::Var("n".to_owned()), &TypeKey("Int".to_owned()), BoxKind::Term)
            .unwrap();
        let rendered = render_datatypes(&emitter.datatype_defs());
        assert!(rendered.starts_with("(declare-datatypes ("));
        assert!(rendered.contains("($Unit 0)"));
        assert!(rendered.contains("($BKey 0)"));
        assert!(rendered.contains("($BTerm 0)"));
        assert!(rendered.contains("$E_Point"));
        assert!(rendered.contains("$BTerm_Int"));
        assert_eq!(rendered.matches('(').count(), rendered.matches(')').count());
    }

    #[test]
    fn result_and_mask_wrappers_are_shared_by_tag() {
        let prog = sample_program();
        let mut emitter = BoxEmitter::new(&prog, &EncodeOptions::default());
        let int_sort = emitter.int_sort();
        let first = emitter.result_repr(&int_sort);
        let again = emitter.result_repr(&int_sort);
        assert_eq!(first.sort.name, again.sort.name);
        assert_eq!(first.sort.name, "$Result_Int");
        let decls = emitter.render_result_decls();
        assert!(decls.contains("($Ok_Int ($Ok_Int@val (_ BitVec 16)))"));
        assert!(decls.contains("($Err_Int ($Err_Int@code Int))"));

        let mask = emitter.mask_repr(2);
        assert_eq!(mask.bit_sels.len(), 2);
        let mask_decls = emitter.render_mask_decls();
        assert!(mask_decls.contains("($Mask_2@mk ($Mask_2@0 Bool) ($Mask_2@1 Bool))"));
    }
}
