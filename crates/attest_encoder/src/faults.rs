use attest_common::config::TargetLocation;
use attest_common::data::mir::SourceInfo;
use id_collections::{id_type, IdVec};
use std::collections::BTreeMap;

#[id_type]
pub struct FaultId(pub usize);

/// A fault of the *verified program* — overflow, division by zero, assertion
/// or precondition violation, invariant violation, missing shape. Never an
/// error of this compiler; it becomes a tagged failure value in the payload.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FaultInfo {
    pub file: String,
    pub line: u64,
    pub pos: u64,
    pub tag: &'static str,
    pub msg: String,
}

/// Deduplicates modeled faults per (file, line, pos) and assigns each a stable
/// error-id constant, so a solver counterexample maps back to one source
/// location no matter how many call sites could trigger it.
#[derive(Clone, Debug)]
pub struct FaultRegistry {
    ids: BTreeMap<(String, u64, u64), FaultId>,
    pub infos: IdVec<FaultId, FaultInfo>,
}

impl FaultRegistry {
    pub fn new() -> Self {
        FaultRegistry {
            ids: BTreeMap::new(),
            infos: IdVec::new(),
        }
    }

    pub fn register(&mut self, sinfo: &SourceInfo, tag: &'static str, msg: String) -> FaultId {
        let key = (sinfo.file.clone(), sinfo.line, sinfo.pos);
        if let Some(&existing) = self.ids.get(&key) {
            return existing;
        }
        let id = self.infos.push(FaultInfo {
            file: sinfo.file.clone(),
            line: sinfo.line,
            pos: sinfo.pos,
            tag,
            msg,
        });
        self.ids.insert(key, id);
        id
    }

    /// The solver-side integer constant standing for this fault.
    pub fn error_code(&self, id: FaultId) -> String {
        format!("{}", id.0)
    }

    pub fn lookup_target(&self, target: &TargetLocation) -> Option<FaultId> {
        self.ids
            .get(&(target.file.clone(), target.line, target.pos))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sinfo(line: u64, pos: u64) -> SourceInfo {
        SourceInfo {
            file: "app.src".to_owned(),
            line,
            pos,
        }
    }

    #[test]
    fn faults_deduplicate_by_position() {
        let mut registry = FaultRegistry::new();
        let a = registry.register(&sinfo(3, 7), "overflow", "add overflow".to_owned());
        let b = registry.register(&sinfo(3, 7), "overflow", "add overflow".to_owned());
        let c = registry.register(&sinfo(4, 1), "div_zero", "division by zero".to_owned());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn target_lookup_finds_registered_position() {
        let mut registry = FaultRegistry::new();
        let id = registry.register(&sinfo(3, 7), "overflow", "add overflow".to_owned());
        let target = TargetLocation {
            file: "app.src".to_owned(),
            line: 3,
            pos: 7,
        };
        assert_eq!(registry.lookup_target(&target), Some(id));
        let miss = TargetLocation {
            file: "app.src".to_owned(),
            line: 9,
            pos: 9,
        };
        assert_eq!(registry.lookup_target(&miss), None);
    }
}
