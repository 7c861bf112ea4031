use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::data::assembly::{FieldKey, InvokeKey, TypeKey};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceInfo {
    pub file: String,
    pub line: u64,
    pub pos: u64,
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.pos)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Nat(u64),
    /// Decimal digits; may exceed the bounded width.
    BigInt(String),
    /// Decimal text, rendered as a solver `Real`.
    Float(String),
    Str(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Var(String),
    Lit(Literal),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpKind {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicKind {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOpKind {
    Not,
    Negate,
}

/// Where an optional-access guard bit lives: its own boolean register, or one
/// position of a mask value under construction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardLoc {
    Reg { name: String },
    MaskBit { mask: String, index: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guard {
    pub loc: GuardLoc,
    /// Value bound to the target register when the component is absent.
    #[serde(default)]
    pub default_value: Option<Arg>,
}

// The discriminant tag must not collide with any variant's field names, so
// it cannot be "op" (`BinOp`/`BinCmp`/`LogicOp`/`UnOp` carry an `op` field).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "opcode", rename_all = "snake_case")]
pub enum Op {
    Nop {
        sinfo: SourceInfo,
    },
    LoadConst {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        value: Literal,
    },
    AccessArgument {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        name: String,
    },
    AccessConstant {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        const_key: String,
    },
    /// Reads one bit of the enclosing invocation's optional-parameter mask.
    AccessMaskBit {
        sinfo: SourceInfo,
        trgt: String,
        index: usize,
    },
    RegisterAssign {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        src: Arg,
    },
    ConstructTuple {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        args: Vec<Arg>,
    },
    ConstructRecord {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        args: Vec<(String, Arg)>,
    },
    ConstructEntity {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        entity: TypeKey,
        args: Vec<Arg>,
        check_invariant: bool,
    },
    ConstructList {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        args: Vec<Arg>,
    },
    TupleProject {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        arg: Arg,
        arg_flow_type: TypeKey,
        index: usize,
    },
    RecordProject {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        arg: Arg,
        arg_flow_type: TypeKey,
        pname: String,
    },
    FieldLoad {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        arg: Arg,
        arg_flow_type: TypeKey,
        field: FieldKey,
        #[serde(default)]
        guard: Option<Guard>,
    },
    FieldUpdate {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        arg: Arg,
        arg_flow_type: TypeKey,
        field: FieldKey,
        value: Arg,
    },
    Invoke {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        invoke: InvokeKey,
        args: Vec<Arg>,
        #[serde(default)]
        optmask: Option<String>,
    },
    InvokeVirtual {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        vname: String,
        rcvr_flow_type: TypeKey,
        args: Vec<Arg>,
    },
    BinOp {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        op: BinOpKind,
        op_type: TypeKey,
        lhs: Arg,
        rhs: Arg,
    },
    BinCmp {
        sinfo: SourceInfo,
        trgt: String,
        op: CmpKind,
        op_type: TypeKey,
        lhs: Arg,
        rhs: Arg,
    },
    LogicOp {
        sinfo: SourceInfo,
        trgt: String,
        op: LogicKind,
        lhs: Arg,
        rhs: Arg,
    },
    UnOp {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        op: UnOpKind,
        arg: Arg,
    },
    IsTypeOf {
        sinfo: SourceInfo,
        trgt: String,
        arg: Arg,
        arg_flow_type: TypeKey,
        test_type: TypeKey,
    },
    Assert {
        sinfo: SourceInfo,
        cond: Arg,
        msg: String,
    },
    Abort {
        sinfo: SourceInfo,
        msg: String,
    },
    /// Merge point; bound at each jump site, a no-op when walked in place.
    Phi {
        sinfo: SourceInfo,
        trgt: String,
        trgt_type: TypeKey,
        sources: BTreeMap<String, Arg>,
    },
    Jump {
        sinfo: SourceInfo,
        target: String,
    },
    JumpCond {
        sinfo: SourceInfo,
        cond: Arg,
        true_block: String,
        false_block: String,
    },
    JumpNone {
        sinfo: SourceInfo,
        arg: Arg,
        arg_flow_type: TypeKey,
        none_block: String,
        some_block: String,
    },
    ReturnAssign {
        sinfo: SourceInfo,
        src: Arg,
    },
}

impl Op {
    pub fn sinfo(&self) -> &SourceInfo {
        use Op::*;
        match self {
            Nop { sinfo }
            | LoadConst { sinfo, .. }
            | AccessArgument { sinfo, .. }
            | AccessConstant { sinfo, .. }
            | AccessMaskBit { sinfo, .. }
            | RegisterAssign { sinfo, .. }
            | ConstructTuple { sinfo, .. }
            | ConstructRecord { sinfo, .. }
            | ConstructEntity { sinfo, .. }
            | ConstructList { sinfo, .. }
            | TupleProject { sinfo, .. }
            | RecordProject { sinfo, .. }
            | FieldLoad { sinfo, .. }
            | FieldUpdate { sinfo, .. }
            | Invoke { sinfo, .. }
            | InvokeVirtual { sinfo, .. }
            | BinOp { sinfo, .. }
            | BinCmp { sinfo, .. }
            | LogicOp { sinfo, .. }
            | UnOp { sinfo, .. }
            | IsTypeOf { sinfo, .. }
            | Assert { sinfo, .. }
            | Abort { sinfo, .. }
            | Phi { sinfo, .. }
            | Jump { sinfo, .. }
            | JumpCond { sinfo, .. }
            | JumpNone { sinfo, .. }
            | ReturnAssign { sinfo, .. } => sinfo,
        }
    }

    /// Labels this operation can transfer control to.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Op::Jump { target, .. } => vec![target],
            Op::JumpCond {
                true_block,
                false_block,
                ..
            } => vec![true_block, false_block],
            Op::JumpNone {
                none_block,
                some_block,
                ..
            } => vec![none_block, some_block],
            _ => Vec::new(),
        }
    }

    /// The register this operation defines, if any.
    pub fn target(&self) -> Option<(&str, Option<&TypeKey>)> {
        use Op::*;
        match self {
            LoadConst { trgt, trgt_type, .. }
            | AccessArgument { trgt, trgt_type, .. }
            | AccessConstant { trgt, trgt_type, .. }
            | RegisterAssign { trgt, trgt_type, .. }
            | ConstructTuple { trgt, trgt_type, .. }
            | ConstructRecord { trgt, trgt_type, .. }
            | ConstructEntity { trgt, trgt_type, .. }
            | ConstructList { trgt, trgt_type, .. }
            | TupleProject { trgt, trgt_type, .. }
            | RecordProject { trgt, trgt_type, .. }
            | FieldLoad { trgt, trgt_type, .. }
            | FieldUpdate { trgt, trgt_type, .. }
            | Invoke { trgt, trgt_type, .. }
            | InvokeVirtual { trgt, trgt_type, .. }
            | BinOp { trgt, trgt_type, .. }
            | UnOp { trgt, trgt_type, .. }
            | Phi { trgt, trgt_type, .. } => Some((trgt, Some(trgt_type))),
            AccessMaskBit { trgt, .. }
            | BinCmp { trgt, .. }
            | LogicOp { trgt, .. }
            | IsTypeOf { trgt, .. } => Some((trgt, None)),
            _ => None,
        }
    }

    /// Invocations this operation calls directly (virtual fan-out is resolved
    /// by the safety analyzer, which owns the type model).
    pub fn direct_callee(&self) -> Option<&InvokeKey> {
        match self {
            Op::Invoke { invoke, .. } => Some(invoke),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: String,
    pub ops: Vec<Op>,
}

impl BasicBlock {
    pub fn successors(&self) -> Vec<&str> {
        match self.ops.last() {
            Some(op) => op.successors(),
            None => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Body {
    pub blocks: Vec<BasicBlock>,
}

impl Body {
    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    pub fn block(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|block| block.label == label)
    }
}
