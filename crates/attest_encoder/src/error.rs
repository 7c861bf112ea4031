use attest_common::data::assembly::BuildError;
use thiserror::Error;

/// Construction faults: the input assembly is internally inconsistent, or a
/// recognized feature has no encoding yet. Both abort the run; continuing
/// would silently mis-encode semantics.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("inconsistent assembly: {0}")]
    Assembly(#[from] BuildError),

    #[error("unknown entrypoint invocation '{0}'")]
    UnknownEntrypoint(String),

    #[error("'{referrer}' references missing key '{missing}'")]
    MissingKey { referrer: String, missing: String },

    #[error("virtual call '{vname}' on '{receiver}' resolves to no concrete target")]
    EmptyDispatch { vname: String, receiver: String },

    #[error("entity '{entity}' flows into virtual call '{vname}' but does not implement it")]
    MissingVirtualTarget { entity: String, vname: String },

    #[error("operation at {sinfo} is malformed: {detail}")]
    MalformedOp { sinfo: String, detail: String },

    #[error("in '{context}': primitive operation '{tag}' has no encoding")]
    UnimplementedPrimitive { context: String, tag: String },

    #[error("validator pattern '{pattern}' is not supported: {detail}")]
    BadValidator { pattern: String, detail: String },

    #[error("no solver representation converts '{from}' into '{into}'")]
    Unrepresentable { from: String, into: String },

    #[error("verification mode '{mode}' requires a target fault location")]
    MissingTarget { mode: &'static str },
}
