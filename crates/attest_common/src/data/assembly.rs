use id_collections::{id_type, IdVec};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use thiserror::Error;

use crate::data::mir::Body;

/// Canonical identifier of a flow type. Structurally identical types share a
/// `TypeKey` by construction upstream, so key equality is type identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeKey(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvokeKey(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldKey(pub String);

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InvokeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nominal types every assembly is assumed to know about. The loader
/// synthesizes the concept declarations if the input omits them.
pub mod well_known {
    /// Universal supertype.
    pub const ANY: &str = "Any";
    /// Marker concept for externally-visible (havoc-able) types.
    pub const API_TYPE: &str = "APIType";
    /// Marker concept for totally-ordered, equality-comparable types.
    pub const KEY_TYPE: &str = "KeyType";

    pub const NONE: &str = "None";
    pub const BOOL: &str = "Bool";
    pub const INT: &str = "Int";
    pub const NAT: &str = "Nat";
    pub const BIG_INT: &str = "BigInt";
    pub const FLOAT: &str = "Float";
    pub const STRING: &str = "String";

    pub const PRIMITIVES: &[&str] = &[NONE, BOOL, INT, NAT, BIG_INT, FLOAT, STRING];
}

/// One member of a (possibly union) flow type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeOption {
    Entity { key: TypeKey },
    /// Conjunction of concept keys, kept sorted.
    Concept { keys: Vec<TypeKey> },
    Tuple { entries: Vec<TypeKey> },
    /// Name-sorted.
    Record { entries: Vec<(String, TypeKey)> },
    /// Multi-value return packs; never boxed or stored.
    Ephemeral { entries: Vec<TypeKey> },
}

impl TypeOption {
    /// The canonical identifier is a deterministic function of the option's
    /// structure, so structurally identical options compare equal by key.
    pub fn type_id(&self) -> TypeKey {
        match self {
            TypeOption::Entity { key } => key.clone(),
            TypeOption::Concept { keys } => {
                let parts: Vec<&str> = keys.iter().map(|k| k.0.as_str()).collect();
                TypeKey(parts.join("&"))
            }
            TypeOption::Tuple { entries } => {
                let parts: Vec<&str> = entries.iter().map(|k| k.0.as_str()).collect();
                TypeKey(format!("[{}]", parts.join(", ")))
            }
            TypeOption::Record { entries } => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(name, ty)| format!("{}: {}", name, ty.0))
                    .collect();
                TypeKey(format!("{{{}}}", parts.join(", ")))
            }
            TypeOption::Ephemeral { entries } => {
                let parts: Vec<&str> = entries.iter().map(|k| k.0.as_str()).collect();
                TypeKey(format!("(|{}|)", parts.join(", ")))
            }
        }
    }
}

/// A flow type: an ordered, deduplicated union of options. Equality, hashing,
/// and ordering are all by `type_id`; the loader guarantees one shared object
/// per distinct id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowType {
    pub type_id: TypeKey,
    pub shortname: String,
    pub options: Vec<TypeOption>,
}

impl PartialEq for FlowType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for FlowType {}

impl PartialOrd for FlowType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_id.cmp(&other.type_id)
    }
}

impl Hash for FlowType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl FlowType {
    pub fn is_union(&self) -> bool {
        self.options.len() > 1
    }

    pub fn is_none(&self) -> bool {
        self.type_id.0 == well_known::NONE
    }

    pub fn includes_none(&self) -> bool {
        self.options
            .iter()
            .any(|opt| matches!(opt, TypeOption::Entity { key } if key.0 == well_known::NONE))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDecl {
    pub key: TypeKey,
    pub shortname: String,
    #[serde(default)]
    pub fields: Vec<FieldKey>,
    #[serde(default)]
    pub provides: Vec<TypeKey>,
    /// Abstract (virtual) call name to the concrete invocation implementing it
    /// for this entity. Sole source of truth for virtual-call resolution.
    #[serde(default)]
    pub vtable: BTreeMap<String, InvokeKey>,
    /// Uniqueness/consistency invariant checked at construction time.
    #[serde(default)]
    pub invariant: Option<InvokeKey>,
    /// String-pattern validator (a regex) for string-of entities.
    #[serde(default)]
    pub validator: Option<String>,
    /// Marks the persistent list type; the value is the element type.
    #[serde(default)]
    pub collection_of: Option<TypeKey>,
    /// Inclusive refinement range for numeric typedecl entities.
    #[serde(default)]
    pub numeric_range: Option<(i64, i64)>,
    #[serde(default)]
    pub is_abstract: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConceptDecl {
    pub key: TypeKey,
    pub shortname: String,
    #[serde(default)]
    pub provides: Vec<TypeKey>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDecl {
    pub key: FieldKey,
    pub name: String,
    pub field_type: TypeKey,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub param_type: TypeKey,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvokeDecl {
    pub key: InvokeKey,
    pub shortname: String,
    pub params: Vec<ParamDecl>,
    pub result_type: TypeKey,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub precond: Option<InvokeKey>,
    #[serde(default)]
    pub postcond: Option<InvokeKey>,
    #[serde(default)]
    pub body: Option<Body>,
    /// Primitive-implementation tag for body-less invocations.
    #[serde(default)]
    pub primitive: Option<String>,
}

impl InvokeDecl {
    /// Declared or assumed fault-free by attribute; trivially safe for the
    /// safety fixed point.
    pub fn is_trusted_safe(&self) -> bool {
        self.attributes
            .iter()
            .any(|attr| attr == "safe" || attr == "assume_safe")
    }

    pub fn mask_size(&self) -> usize {
        self.params.iter().filter(|p| p.optional).count()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstantDecl {
    pub key: String,
    pub const_type: TypeKey,
    pub value_invoke: InvokeKey,
}

/// The serialized input boundary: flat declaration tables addressed entirely
/// by string keys, with no floating pointer references.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Assembly {
    #[serde(default)]
    pub types: Vec<FlowType>,
    #[serde(default)]
    pub entities: Vec<EntityDecl>,
    #[serde(default)]
    pub concepts: Vec<ConceptDecl>,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    #[serde(default)]
    pub invokes: Vec<InvokeDecl>,
    #[serde(default)]
    pub constants: Vec<ConstantDecl>,
}

impl Assembly {
    pub fn from_json(text: &str) -> Result<Assembly, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate declaration key '{0}'")]
    DuplicateKey(String),
    #[error("'{referrer}' references missing key '{missing}'")]
    MissingKey { referrer: String, missing: String },
    #[error("invocation '{0}' has both a body and a primitive tag")]
    AmbiguousImplementation(String),
    #[error("invocation '{0}' has neither a body nor a primitive tag")]
    MissingImplementation(String),
}

#[id_type]
pub struct InvokeId(pub usize);

/// The fully indexed, immutable program: declaration tables plus the read-only
/// dispatch index, built in a second phase after all declarations exist.
/// Subtype queries are memoized in append-only tables; this is sound because
/// nothing here mutates after `build`.
#[derive(Debug)]
pub struct Program {
    pub types: BTreeMap<TypeKey, Rc<FlowType>>,
    pub entities: BTreeMap<TypeKey, EntityDecl>,
    pub concepts: BTreeMap<TypeKey, ConceptDecl>,
    pub fields: BTreeMap<FieldKey, FieldDecl>,
    pub invokes: IdVec<InvokeId, InvokeDecl>,
    pub invoke_ids: BTreeMap<InvokeKey, InvokeId>,
    pub constants: BTreeMap<String, ConstantDecl>,
    /// (receiver entity, abstract name) -> implementing invocation.
    pub dispatch: BTreeMap<(TypeKey, String), InvokeKey>,

    type_memo: RefCell<BTreeMap<(TypeKey, TypeKey), bool>>,
    option_memo: RefCell<BTreeMap<(TypeKey, TypeKey), bool>>,
}

impl Program {
    pub fn build(assembly: Assembly) -> Result<Program, BuildError> {
        let mut types: BTreeMap<TypeKey, Rc<FlowType>> = BTreeMap::new();
        let mut concepts = BTreeMap::new();
        let mut fields = BTreeMap::new();
        let mut constants = BTreeMap::new();

        for concept in [well_known::ANY, well_known::API_TYPE, well_known::KEY_TYPE] {
            concepts.insert(
                TypeKey(concept.to_owned()),
                ConceptDecl {
                    key: TypeKey(concept.to_owned()),
                    shortname: concept.to_owned(),
                    provides: Vec::new(),
                },
            );
        }

        // Primitive entities are part of every assembly's vocabulary; the
        // front end usually ships them, but synthesized fallbacks keep small
        // assemblies (and tests) self-contained.
        let mut entities = BTreeMap::new();
        for prim in well_known::PRIMITIVES {
            let mut provides = vec![
                TypeKey(well_known::ANY.to_owned()),
                TypeKey(well_known::API_TYPE.to_owned()),
            ];
            if *prim != well_known::FLOAT {
                provides.push(TypeKey(well_known::KEY_TYPE.to_owned()));
            }
            entities.insert(
                TypeKey((*prim).to_owned()),
                EntityDecl {
                    key: TypeKey((*prim).to_owned()),
                    shortname: (*prim).to_owned(),
                    fields: Vec::new(),
                    provides,
                    vtable: BTreeMap::new(),
                    invariant: None,
                    validator: None,
                    collection_of: None,
                    numeric_range: None,
                    is_abstract: false,
                },
            );
        }

        for mut decl in assembly.concepts {
            decl.provides.sort();
            decl.provides.dedup();
            let key = decl.key.clone();
            concepts.insert(key.clone(), decl);
        }

        for mut decl in assembly.entities {
            decl.provides.sort();
            decl.provides.dedup();
            let key = decl.key.clone();
            let previous = entities.insert(key.clone(), decl);
            if previous.is_some() && !well_known::PRIMITIVES.contains(&key.0.as_str()) {
                return Err(BuildError::DuplicateKey(key.0));
            }
        }

        for decl in assembly.fields {
            let key = decl.key.clone();
            if fields.insert(key.clone(), decl).is_some() {
                return Err(BuildError::DuplicateKey(key.0));
            }
        }

        for decl in assembly.constants {
            let key = decl.key.clone();
            if constants.insert(key.clone(), decl).is_some() {
                return Err(BuildError::DuplicateKey(key));
            }
        }

        let mut pending: Vec<FlowType> = assembly.types;

        // Every nominal declaration and every option of every declared type is
        // itself registered as a (single-option) type, so downstream code can
        // always resolve an option's type object.
        for key in entities.keys() {
            pending.push(FlowType {
                type_id: key.clone(),
                shortname: entities[key].shortname.clone(),
                options: vec![TypeOption::Entity { key: key.clone() }],
            });
        }
        for key in concepts.keys() {
            pending.push(FlowType {
                type_id: key.clone(),
                shortname: concepts[key].shortname.clone(),
                options: vec![TypeOption::Concept {
                    keys: vec![key.clone()],
                }],
            });
        }

        while let Some(mut ty) = pending.pop() {
            ty.options.sort_by_key(|opt| opt.type_id());
            ty.options.dedup_by_key(|opt| opt.type_id());
            if types.contains_key(&ty.type_id) {
                continue;
            }

            for opt in &ty.options {
                let opt_id = opt.type_id();
                if opt_id != ty.type_id && !types.contains_key(&opt_id) {
                    pending.push(FlowType {
                        type_id: opt_id.clone(),
                        shortname: opt_id.0.clone(),
                        options: vec![opt.clone()],
                    });
                }
            }

            types.insert(ty.type_id.clone(), Rc::new(ty));
        }

        let mut invokes = IdVec::new();
        let mut invoke_ids = BTreeMap::new();
        for decl in assembly.invokes {
            match (&decl.body, &decl.primitive) {
                (Some(_), Some(_)) => {
                    return Err(BuildError::AmbiguousImplementation(decl.key.0.clone()))
                }
                (None, None) => {
                    return Err(BuildError::MissingImplementation(decl.key.0.clone()))
                }
                _ => {}
            }
            let key = decl.key.clone();
            let id = invokes.push(decl);
            if invoke_ids.insert(key.clone(), id).is_some() {
                return Err(BuildError::DuplicateKey(key.0));
            }
        }

        // Second phase: the read-only dispatch index. Virtual targets must
        // exist; a dangling vtable entry is a construction fault.
        let mut dispatch = BTreeMap::new();
        for (entity_key, decl) in &entities {
            for (vname, target) in &decl.vtable {
                if !invoke_ids.contains_key(target) {
                    return Err(BuildError::MissingKey {
                        referrer: entity_key.0.clone(),
                        missing: target.0.clone(),
                    });
                }
                dispatch.insert((entity_key.clone(), vname.clone()), target.clone());
            }
        }

        let program = Program {
            types,
            entities,
            concepts,
            fields,
            invokes,
            invoke_ids,
            constants,
            dispatch,
            type_memo: RefCell::new(BTreeMap::new()),
            option_memo: RefCell::new(BTreeMap::new()),
        };
        program.check_references()?;
        Ok(program)
    }

    fn check_references(&self) -> Result<(), BuildError> {
        let missing = |referrer: &str, missing: &str| BuildError::MissingKey {
            referrer: referrer.to_owned(),
            missing: missing.to_owned(),
        };

        for (key, decl) in &self.entities {
            for field in &decl.fields {
                if !self.fields.contains_key(field) {
                    return Err(missing(&key.0, &field.0));
                }
            }
            for provided in &decl.provides {
                if !self.types.contains_key(provided) {
                    return Err(missing(&key.0, &provided.0));
                }
            }
        }
        for (key, decl) in &self.concepts {
            for provided in &decl.provides {
                if !self.types.contains_key(provided) {
                    return Err(missing(&key.0, &provided.0));
                }
            }
        }
        for (key, decl) in &self.fields {
            if !self.types.contains_key(&decl.field_type) {
                return Err(missing(&key.0, &decl.field_type.0));
            }
        }
        for (_, decl) in &self.invokes {
            for param in &decl.params {
                if !self.types.contains_key(&param.param_type) {
                    return Err(missing(&decl.key.0, &param.param_type.0));
                }
            }
            if !self.types.contains_key(&decl.result_type) {
                return Err(missing(&decl.key.0, &decl.result_type.0));
            }
            for cond in decl.precond.iter().chain(decl.postcond.iter()) {
                if !self.invoke_ids.contains_key(cond) {
                    return Err(missing(&decl.key.0, &cond.0));
                }
            }
        }
        for (key, decl) in &self.constants {
            if !self.types.contains_key(&decl.const_type) {
                return Err(missing(key, &decl.const_type.0));
            }
            if !self.invoke_ids.contains_key(&decl.value_invoke) {
                return Err(missing(key, &decl.value_invoke.0));
            }
        }
        Ok(())
    }

    pub fn lookup_type(&self, key: &TypeKey) -> Option<&Rc<FlowType>> {
        self.types.get(key)
    }

    pub fn type_of_option(&self, opt: &TypeOption) -> Option<&Rc<FlowType>> {
        self.types.get(&opt.type_id())
    }

    fn well_known_type(&self, name: &str) -> &Rc<FlowType> {
        // Synthesized unconditionally in `build`.
        &self.types[&TypeKey(name.to_owned())]
    }

    /// The subtype oracle: total and reflexive; non-relatedness is a valid
    /// answer, never an error.
    pub fn subtype_of(&self, t1: &FlowType, t2: &FlowType) -> bool {
        if t1.type_id == t2.type_id {
            return true;
        }

        let memo_key = (t1.type_id.clone(), t2.type_id.clone());
        if let Some(&known) = self.type_memo.borrow().get(&memo_key) {
            return known;
        }

        let related = t1.options.iter().all(|o1| {
            t2.options
                .iter()
                .any(|o2| self.atomic_subtype_of(o1, o2))
        });

        self.type_memo.borrow_mut().insert(memo_key, related);
        related
    }

    pub fn subtype_of_keys(&self, k1: &TypeKey, k2: &TypeKey) -> bool {
        match (self.types.get(k1), self.types.get(k2)) {
            (Some(t1), Some(t2)) => {
                let (t1, t2) = (t1.clone(), t2.clone());
                self.subtype_of(&t1, &t2)
            }
            _ => false,
        }
    }

    fn atomic_subtype_of(&self, o1: &TypeOption, o2: &TypeOption) -> bool {
        if o1.type_id() == o2.type_id() {
            return true;
        }

        let memo_key = (o1.type_id(), o2.type_id());
        if let Some(&known) = self.option_memo.borrow().get(&memo_key) {
            return known;
        }

        let related = match o2 {
            TypeOption::Concept { keys: super_keys } => match o1 {
                TypeOption::Concept { keys: sub_keys } => {
                    self.concept_subtype(sub_keys, super_keys)
                }
                TypeOption::Entity { key } => self.entity_provides(key, o2),
                TypeOption::Tuple { entries } => {
                    let synthesized = self.synthesized_provides(entries.iter());
                    self.atomic_subtype_of(&synthesized, o2)
                }
                TypeOption::Record { entries } => {
                    let synthesized = self.synthesized_provides(entries.iter().map(|(_, t)| t));
                    self.atomic_subtype_of(&synthesized, o2)
                }
                TypeOption::Ephemeral { .. } => false,
            },
            // Entity/tuple/record/ephemeral supertypes only relate by identity.
            _ => false,
        };

        self.option_memo.borrow_mut().insert(memo_key, related);
        related
    }

    /// Every key of the supertype conjunction must be matched by some key of
    /// the subtype conjunction, either by name or through a transitively
    /// provided type. Acyclic `provides` lists make the recursion terminate.
    fn concept_subtype(&self, sub_keys: &[TypeKey], super_keys: &[TypeKey]) -> bool {
        super_keys.iter().all(|super_key| {
            sub_keys.iter().any(|sub_key| {
                if sub_key == super_key {
                    return true;
                }
                let Some(decl) = self.concepts.get(sub_key) else {
                    return false;
                };
                let Some(super_type) = self.types.get(super_key) else {
                    return false;
                };
                let super_type = super_type.clone();
                decl.provides.iter().any(|provided| {
                    match self.types.get(provided) {
                        Some(provided_type) => {
                            let provided_type = provided_type.clone();
                            self.subtype_of(&provided_type, &super_type)
                        }
                        None => false,
                    }
                })
            })
        })
    }

    fn entity_provides(&self, entity_key: &TypeKey, concept: &TypeOption) -> bool {
        let Some(decl) = self.entities.get(entity_key) else {
            return false;
        };
        let Some(concept_type) = self.type_of_option(concept) else {
            return false;
        };
        let concept_type = concept_type.clone();
        decl.provides.iter().any(|provided| match self.types.get(provided) {
            Some(provided_type) => {
                let provided_type = provided_type.clone();
                self.subtype_of(&provided_type, &concept_type)
            }
            None => false,
        })
    }

    /// The provided-concepts option for a structural (tuple/record) shape:
    /// always the universal top type, plus the API-visibility marker iff
    /// every component is itself API-visible.
    fn synthesized_provides<'a>(
        &self,
        components: impl Iterator<Item = &'a TypeKey>,
    ) -> TypeOption {
        let mut keys = vec![TypeKey(well_known::ANY.to_owned())];
        let all_api = components
            .map(|key| match self.types.get(key) {
                Some(ty) => {
                    let ty = ty.clone();
                    self.is_api_type(&ty)
                }
                None => false,
            })
            .all(|api| api);
        if all_api {
            keys.push(TypeKey(well_known::API_TYPE.to_owned()));
        }
        keys.sort();
        TypeOption::Concept { keys }
    }

    pub fn is_api_type(&self, ty: &FlowType) -> bool {
        let api = self.well_known_type(well_known::API_TYPE).clone();
        self.subtype_of(ty, &api)
    }

    pub fn is_key_type(&self, ty: &FlowType) -> bool {
        let key = self.well_known_type(well_known::KEY_TYPE).clone();
        self.subtype_of(ty, &key)
    }

    /// Concrete (non-abstract) entities whose type flows into `receiver`;
    /// the fan-out set for virtual dispatch.
    pub fn concrete_entities_under(&self, receiver: &FlowType) -> Vec<&EntityDecl> {
        self.entities
            .values()
            .filter(|decl| !decl.is_abstract)
            .filter(|decl| match self.types.get(&decl.key) {
                Some(entity_type) => {
                    let entity_type = entity_type.clone();
                    self.subtype_of(&entity_type, receiver)
                }
                None => false,
            })
            .collect()
    }

    /// The concrete shapes a union-typed value can take at runtime: structural
    /// options stand for themselves, concept options fan out to the concrete
    /// entities providing them.
    pub fn concrete_options_under(&self, receiver: &FlowType) -> Vec<TypeOption> {
        let mut shapes = Vec::new();
        let mut seen = BTreeSet::new();
        for opt in &receiver.options {
            match opt {
                TypeOption::Concept { .. } => {
                    let Some(opt_type) = self.type_of_option(opt) else {
                        continue;
                    };
                    let opt_type = opt_type.clone();
                    for entity in self.concrete_entities_under(&opt_type) {
                        if seen.insert(entity.key.clone()) {
                            shapes.push(TypeOption::Entity {
                                key: entity.key.clone(),
                            });
                        }
                    }
                }
                _ => {
                    if seen.insert(opt.type_id()) {
                        shapes.push(opt.clone());
                    }
                }
            }
        }
        shapes
    }

    pub fn invoke(&self, key: &InvokeKey) -> Option<&InvokeDecl> {
        self.invoke_ids.get(key).map(|&id| &self.invokes[id])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entity(key: &str, provides: &[&str]) -> EntityDecl {
        EntityDecl {
            key: TypeKey(key.to_owned()),
            shortname: key.to_owned(),
            fields: Vec::new(),
            provides: provides.iter().map(|p| TypeKey((*p).to_owned())).collect(),
            vtable: BTreeMap::new(),
            invariant: None,
            validator: None,
            collection_of: None,
            numeric_range: None,
            is_abstract: false,
        }
    }

    fn concept(key: &str, provides: &[&str]) -> ConceptDecl {
        ConceptDecl {
            key: TypeKey(key.to_owned()),
            shortname: key.to_owned(),
            provides: provides.iter().map(|p| TypeKey((*p).to_owned())).collect(),
        }
    }

    fn sample_program() -> Program {
        let assembly = Assembly {
            concepts: vec![
                concept("Animal", &["Any"]),
                concept("Pet", &["Animal"]),
                concept("Mineral", &["Any"]),
            ],
            entities: vec![
                entity("Dog", &["Pet", "APIType", "KeyType"]),
                entity("Rock", &["Mineral"]),
            ],
            ..Assembly::default()
        };
        Program::build(assembly).unwrap()
    }

    fn ty<'a>(prog: &'a Program, key: &str) -> Rc<FlowType> {
        prog.types[&TypeKey(key.to_owned())].clone()
    }

    #[test]
    fn subtype_is_reflexive() {
        let prog = sample_program();
        for key in ["Dog", "Rock", "Animal", "Pet", "Mineral", "Any"] {
            let t = ty(&prog, key);
            assert!(prog.subtype_of(&t, &t), "{} </: itself", key);
        }
    }

    #[test]
    fn disjoint_nominals_are_unrelated_both_ways() {
        let prog = sample_program();
        let dog = ty(&prog, "Dog");
        let rock = ty(&prog, "Rock");
        assert!(!prog.subtype_of(&dog, &rock));
        assert!(!prog.subtype_of(&rock, &dog));
        let pet = ty(&prog, "Pet");
        let mineral = ty(&prog, "Mineral");
        assert!(!prog.subtype_of(&pet, &mineral));
        assert!(!prog.subtype_of(&mineral, &pet));
    }

    #[test]
    fn subtype_is_transitive_through_provides() {
        let prog = sample_program();
        let dog = ty(&prog, "Dog");
        let pet = ty(&prog, "Pet");
        let animal = ty(&prog, "Animal");
        let any = ty(&prog, "Any");
        assert!(prog.subtype_of(&dog, &pet));
        assert!(prog.subtype_of(&pet, &animal));
        assert!(prog.subtype_of(&dog, &animal));
        assert!(prog.subtype_of(&animal, &any));
        assert!(prog.subtype_of(&dog, &any));
    }

    #[test]
    fn primitives_flow_into_the_universal_top() {
        let prog = sample_program();
        let any = ty(&prog, "Any");
        for prim in well_known::PRIMITIVES {
            let t = ty(&prog, prim);
            assert!(prog.subtype_of(&t, &any), "{} </: Any", prim);
        }
        // An Any-typed receiver must include primitive entities in fan-out.
        let fanout = prog.concrete_entities_under(&any);
        assert!(fanout.iter().any(|decl| decl.key.0 == "Int"));
    }

    #[test]
    fn union_is_subtype_when_every_option_is() {
        let prog = sample_program();
        let union = FlowType {
            type_id: TypeKey("Dog|Rock".to_owned()),
            shortname: "Dog|Rock".to_owned(),
            options: vec![
                TypeOption::Entity {
                    key: TypeKey("Dog".to_owned()),
                },
                TypeOption::Entity {
                    key: TypeKey("Rock".to_owned()),
                },
            ],
        };
        let any = ty(&prog, "Any");
        let animal = ty(&prog, "Animal");
        assert!(prog.subtype_of(&union, &any));
        assert!(!prog.subtype_of(&union, &animal));
    }

    #[test]
    fn tuple_of_api_components_is_api_visible() {
        let prog = sample_program();
        let dog_pair = FlowType {
            type_id: TypeKey("[Dog, Dog]".to_owned()),
            shortname: "[Dog, Dog]".to_owned(),
            options: vec![TypeOption::Tuple {
                entries: vec![TypeKey("Dog".to_owned()), TypeKey("Dog".to_owned())],
            }],
        };
        let rock_pair = FlowType {
            type_id: TypeKey("[Rock]".to_owned()),
            shortname: "[Rock]".to_owned(),
            options: vec![TypeOption::Tuple {
                entries: vec![TypeKey("Rock".to_owned())],
            }],
        };
        assert!(prog.is_api_type(&dog_pair));
        assert!(!prog.is_api_type(&rock_pair));
    }

    #[test]
    fn dispatch_fanout_matches_subtyping() {
        let prog = sample_program();
        let animal = ty(&prog, "Animal");
        let targets = prog.concrete_entities_under(&animal);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].key.0, "Dog");
    }

    #[test]
    fn memo_is_consistent_on_repeat_queries() {
        let prog = sample_program();
        let dog = ty(&prog, "Dog");
        let animal = ty(&prog, "Animal");
        let first = prog.subtype_of(&dog, &animal);
        let second = prog.subtype_of(&dog, &animal);
        assert_eq!(first, second);
    }
}
