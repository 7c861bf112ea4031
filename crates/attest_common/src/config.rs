use std::ffi::OsStr;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct ArtifactDir {
    pub dir_path: PathBuf,
    pub filename_prefix: PathBuf,
}

impl ArtifactDir {
    pub fn artifact_path(&self, extension: &(impl AsRef<OsStr> + ?Sized)) -> PathBuf {
        self.dir_path
            .join(self.filename_prefix.with_extension(extension))
    }
}

/// What the emitted payload asks the solver to decide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyMode {
    /// Assert that the target fault is hit; the caller expects UNSAT.
    Unreachable,
    /// Assert that the target fault is hit; the caller expects SAT plus a model.
    Witness,
    /// Assert normal-path execution and extract the entrypoint's result value.
    Evaluate,
}

/// A designated fault position in the verified program's sources.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetLocation {
    pub file: String,
    pub line: u64,
    pub pos: u64,
}

#[derive(Clone, Debug)]
pub struct EncodeOptions {
    pub mode: VerifyMode,
    pub target: Option<TargetLocation>,

    /// Width in bits of the bounded `Int`/`Nat` encodings.
    pub int_width: u32,

    /// When false, map/filter/sum/find over symbolic-length collections are
    /// encoded as an unconditional fault instead of the quantified axioms,
    /// which keeps the emitted theory small.
    pub large_ops: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            mode: VerifyMode::Unreachable,
            target: None,
            int_width: 16,
            large_ops: false,
        }
    }
}
