use crate::cli::Config;
use crate::handle_config;
use attest_common::config::{ArtifactDir, EncodeOptions, TargetLocation, VerifyMode};
use attest_common::data::assembly::{Assembly, InvokeDecl, InvokeKey, ParamDecl, TypeKey};
use attest_common::data::mir::{
    Arg, BasicBlock, BinOpKind, Body, CmpKind, Literal, Op, SourceInfo,
};
use std::path::PathBuf;

pub struct EncodeRun {
    pub payload: String,
    pub api_module: serde_json::Value,
    pub artifacts: Option<ArtifactDir>,
}

fn sinfo(line: u64, pos: u64) -> SourceInfo {
    SourceInfo {
        file: "app.flow".to_owned(),
        line,
        pos,
    }
}

/// Position of the assertion in [`sample_assembly`].
pub fn assert_target() -> TargetLocation {
    TargetLocation {
        file: "app.flow".to_owned(),
        line: 3,
        pos: 8,
    }
}

fn int() -> TypeKey {
    TypeKey("Int".to_owned())
}

/// `main(x: Int)`: adds one, asserts the sum stays below 100, returns it.
pub fn sample_assembly() -> Assembly {
    let ops = vec![
        Op::AccessArgument {
            sinfo: sinfo(1, 0),
            trgt: "x0".to_owned(),
            trgt_type: int(),
            name: "x".to_owned(),
        },
        Op::BinOp {
            sinfo: sinfo(2, 4),
            trgt: "sum".to_owned(),
            trgt_type: int(),
            op: BinOpKind::Add,
            op_type: int(),
            lhs: Arg::Var("x0".to_owned()),
            rhs: Arg::Lit(Literal::Int(1)),
        },
        Op::BinCmp {
            sinfo: sinfo(3, 4),
            trgt: "ok".to_owned(),
            op: CmpKind::Lt,
            op_type: int(),
            lhs: Arg::Var("sum".to_owned()),
            rhs: Arg::Lit(Literal::Int(100)),
        },
        Op::Assert {
            sinfo: sinfo(3, 8),
            cond: Arg::Var("ok".to_owned()),
            msg: "sum out of range".to_owned(),
        },
        Op::ReturnAssign {
            sinfo: sinfo(4, 0),
            src: Arg::Var("sum".to_owned()),
        },
    ];
    Assembly {
        invokes: vec![InvokeDecl {
            key: InvokeKey("main".to_owned()),
            shortname: "main".to_owned(),
            params: vec![ParamDecl {
                name: "x".to_owned(),
                param_type: int(),
                optional: false,
            }],
            result_type: int(),
            recursive: false,
            attributes: Vec::new(),
            precond: None,
            postcond: None,
            body: Some(Body {
                blocks: vec![BasicBlock {
                    label: "entry".to_owned(),
                    ops,
                }],
            }),
            primitive: None,
        }],
        ..Assembly::default()
    }
}

/// Serializes the assembly to a scratch directory, runs the full pipeline on
/// it, and reads back everything it wrote.
pub fn run_encode(
    name: &str,
    assembly: &Assembly,
    mode: VerifyMode,
    target: Option<TargetLocation>,
    emit_artifacts: bool,
) -> EncodeRun {
    let dir = std::env::temp_dir().join(format!("attest_e2e_{}_{}", std::process::id(), name));
    std::fs::create_dir_all(&dir).unwrap();

    let src_path = dir.join("app.json");
    std::fs::write(&src_path, serde_json::to_string(assembly).unwrap()).unwrap();

    let output_path = dir.join("app.smt2");
    let api_module_path = dir.join("api.json");
    let artifact_dir = if emit_artifacts {
        let artifacts = dir.join("app.smt2-artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        Some(ArtifactDir {
            dir_path: artifacts,
            filename_prefix: PathBuf::from("app.smt2"),
        })
    } else {
        None
    };

    let config = Config {
        src_path,
        entrypoint: "main".to_owned(),
        options: EncodeOptions {
            mode,
            target,
            int_width: 16,
            large_ops: false,
        },
        output_path: output_path.clone(),
        api_module_path: Some(api_module_path.clone()),
        artifact_dir: artifact_dir.clone(),
    };
    handle_config(config).unwrap();

    let payload = std::fs::read_to_string(&output_path).unwrap();
    let api_text = std::fs::read_to_string(&api_module_path).unwrap();
    EncodeRun {
        payload,
        api_module: serde_json::from_str(&api_text).unwrap(),
        artifacts: artifact_dir,
    }
}
