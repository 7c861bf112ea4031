//! The machine-readable companion to a payload: which types cross the API
//! boundary and how they are shaped, the entrypoint's signature, and the
//! table mapping solver error codes back to source positions.

use attest_common::data::assembly::{
    well_known, EntityDecl, FlowType, InvokeDecl, Program, TypeOption,
};
use serde_json::{json, Value};

use crate::error::EncodeError;
use crate::faults::FaultRegistry;

pub fn api_module(
    prog: &Program,
    entry: &InvokeDecl,
    faults: &FaultRegistry,
) -> Result<Value, EncodeError> {
    let mut types = serde_json::Map::new();
    for (key, ty) in &prog.types {
        if !prog.is_api_type(ty) {
            continue;
        }
        types.insert(key.0.clone(), describe_type(prog, ty)?);
    }

    let params: Vec<Value> = entry
        .params
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "type": p.param_type.0,
                "optional": p.optional,
            })
        })
        .collect();

    let fault_table: Vec<Value> = faults
        .infos
        .iter()
        .map(|(id, info)| {
            json!({
                "code": faults.error_code(id),
                "file": info.file,
                "line": info.line,
                "pos": info.pos,
                "tag": info.tag,
                "message": info.msg,
            })
        })
        .collect();

    Ok(json!({
        "entrypoint": {
            "key": entry.key.0,
            "shortname": entry.shortname,
            "params": params,
            "result": entry.result_type.0,
        },
        "types": Value::Object(types),
        "faults": fault_table,
    }))
}

fn describe_type(prog: &Program, ty: &FlowType) -> Result<Value, EncodeError> {
    if ty.is_union() {
        let options: Vec<String> = ty
            .options
            .iter()
            .map(|option| option.type_id().0)
            .collect();
        return Ok(json!({ "kind": "union", "options": options }));
    }
    match &ty.options[0] {
        TypeOption::Entity { key } => {
            if well_known::PRIMITIVES.contains(&key.0.as_str()) {
                return Ok(json!({ "kind": "primitive" }));
            }
            let decl = prog
                .entities
                .get(key)
                .ok_or_else(|| EncodeError::MissingKey {
                    referrer: "api module".to_owned(),
                    missing: key.0.clone(),
                })?;
            describe_entity(prog, decl)
        }
        TypeOption::Concept { keys } => {
            let concepts: Vec<String> = keys.iter().map(|k| k.0.clone()).collect();
            Ok(json!({ "kind": "concept", "concepts": concepts }))
        }
        TypeOption::Tuple { entries } => {
            let components: Vec<String> = entries.iter().map(|e| e.0.clone()).collect();
            Ok(json!({ "kind": "tuple", "components": components }))
        }
        TypeOption::Record { entries } => {
            let components: Vec<Value> = entries
                .iter()
                .map(|(name, tkey)| json!({ "name": name, "type": tkey.0 }))
                .collect();
            Ok(json!({ "kind": "record", "components": components }))
        }
        TypeOption::Ephemeral { entries } => {
            let components: Vec<String> = entries.iter().map(|e| e.0.clone()).collect();
            Ok(json!({ "kind": "ephemeral", "components": components }))
        }
    }
}

fn describe_entity(prog: &Program, decl: &EntityDecl) -> Result<Value, EncodeError> {
    if let Some(elem) = &decl.collection_of {
        return Ok(json!({ "kind": "collection", "element": elem.0 }));
    }
    if let Some((lo, hi)) = decl.numeric_range {
        return Ok(json!({ "kind": "numeric_range", "min": lo, "max": hi }));
    }
    if let Some(pattern) = &decl.validator {
        return Ok(json!({ "kind": "string", "pattern": pattern }));
    }
    if decl.is_abstract {
        let ty = prog
            .lookup_type(&decl.key)
            .ok_or_else(|| EncodeError::MissingKey {
                referrer: "api module".to_owned(),
                missing: decl.key.0.clone(),
            })?;
        let concrete: Vec<String> = prog
            .concrete_entities_under(ty)
            .into_iter()
            .map(|target| target.key.0.clone())
            .collect();
        return Ok(json!({ "kind": "abstract", "concrete": concrete }));
    }

    let mut fields = Vec::new();
    for field_key in &decl.fields {
        let field = prog
            .fields
            .get(field_key)
            .ok_or_else(|| EncodeError::MissingKey {
                referrer: decl.key.0.clone(),
                missing: field_key.0.clone(),
            })?;
        fields.push(json!({
            "name": field.name,
            "type": field.field_type.0,
            "optional": field.optional,
        }));
    }
    Ok(json!({
        "kind": "entity",
        "shortname": decl.shortname,
        "fields": fields,
        "has_invariant": decl.invariant.is_some(),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use attest_common::data::assembly::{
        Assembly, FieldDecl, FieldKey, InvokeKey, ParamDecl, TypeKey,
    };
    use attest_common::data::mir::SourceInfo;
    use std::collections::BTreeMap;

    fn entity(key: &str) -> EntityDecl {
        EntityDecl {
            key: TypeKey(key.to_owned()),
            shortname: key.to_owned(),
            fields: Vec::new(),
            provides: vec![TypeKey("APIType".to_owned())],
            vtable: BTreeMap::new(),
            invariant: None,
            validator: None,
            collection_of: None,
            numeric_range: None,
            is_abstract: false,
        }
    }

    fn entry_invoke() -> InvokeDecl {
        InvokeDecl {
            key: InvokeKey("main".to_owned()),
            shortname: "main".to_owned(),
            params: vec![ParamDecl {
                name: "score".to_owned(),
                param_type: TypeKey("Score".to_owned()),
                optional: false,
            }],
            result_type: TypeKey("Int".to_owned()),
            recursive: false,
            attributes: Vec::new(),
            precond: None,
            postcond: None,
            body: None,
            primitive: Some("havoc".to_owned()),
        }
    }

    fn sample_program() -> Program {
        let score = EntityDecl {
            numeric_range: Some((0, 100)),
            ..entity("Score")
        };
        let scores = EntityDecl {
            collection_of: Some(TypeKey("Score".to_owned())),
            ..entity("Scores")
        };
        let user = EntityDecl {
            fields: vec![FieldKey("user.name".to_owned())],
            ..entity("User")
        };
        let assembly = Assembly {
            entities: vec![score, scores, user],
            fields: vec![FieldDecl {
                key: FieldKey("user.name".to_owned()),
                name: "name".to_owned(),
                field_type: TypeKey("String".to_owned()),
                optional: false,
            }],
            invokes: vec![entry_invoke()],
            ..Assembly::default()
        };
        Program::build(assembly).unwrap()
    }

    #[test]
    fn shapes_are_described_per_kind() {
        let prog = sample_program();
        let entry = prog.invoke(&InvokeKey("main".to_owned())).unwrap();
        let module = api_module(&prog, entry, &FaultRegistry::new()).unwrap();

        assert_eq!(module["types"]["Score"]["kind"], "numeric_range");
        assert_eq!(module["types"]["Score"]["max"], 100);
        assert_eq!(module["types"]["Scores"]["kind"], "collection");
        assert_eq!(module["types"]["Scores"]["element"], "Score");
        assert_eq!(module["types"]["User"]["kind"], "entity");
        assert_eq!(module["types"]["User"]["fields"][0]["name"], "name");
        assert_eq!(module["types"]["Int"]["kind"], "primitive");
    }

    #[test]
    fn entrypoint_signature_and_fault_table_round_out_the_module() {
        let prog = sample_program();
        let entry = prog.invoke(&InvokeKey("main".to_owned())).unwrap();
        let mut faults = FaultRegistry::new();
        faults.register(
            &SourceInfo {
                file: "app.src".to_owned(),
                line: 4,
                pos: 12,
            },
            "overflow",
            "addition overflows".to_owned(),
        );
        let module = api_module(&prog, entry, &faults).unwrap();

        assert_eq!(module["entrypoint"]["key"], "main");
        assert_eq!(module["entrypoint"]["params"][0]["type"], "Score");
        assert_eq!(module["entrypoint"]["result"], "Int");
        assert_eq!(module["faults"][0]["code"], "0");
        assert_eq!(module["faults"][0]["line"], 4);
        assert_eq!(module["faults"][0]["tag"], "overflow");
    }
}
