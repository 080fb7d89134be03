use std::collections::{BTreeMap, BTreeSet};

use crate::artifact::Artifact;
use crate::error::MigrationError;
use crate::schema::SchemaSnapshot;

/// Validated artifact history.
///
/// Invariants after [`Chain::build`]: revision ids are unique, exactly one
/// artifact has no predecessor, every predecessor exists, every artifact is
/// reachable from the root, and every artifact still hashes to its own id.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    artifacts: BTreeMap<String, Artifact>,
    children: BTreeMap<String, Vec<String>>,
    root: Option<String>,
}

impl Chain {
    pub fn build(artifacts: Vec<Artifact>) -> Result<Self, MigrationError> {
        let mut by_revision = BTreeMap::new();
        for artifact in artifacts {
            if let Some(previous) = by_revision.insert(artifact.revision.clone(), artifact) {
                return Err(MigrationError::chain(format!(
                    "revision {} appears more than once",
                    previous.revision
                )));
            }
        }

        let mut roots = Vec::new();
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for artifact in by_revision.values() {
            match &artifact.down_revision {
                None => roots.push(artifact.revision.clone()),
                Some(parent) => {
                    if !by_revision.contains_key(parent) {
                        return Err(MigrationError::chain(format!(
                            "revision {} points to unknown predecessor {parent}",
                            artifact.revision
                        )));
                    }
                    children
                        .entry(parent.clone())
                        .or_default()
                        .push(artifact.revision.clone());
                }
            }
        }

        if by_revision.is_empty() {
            return Ok(Self::default());
        }
        if roots.len() != 1 {
            return Err(MigrationError::chain(format!(
                "expected exactly one base revision, found {}: [{}]",
                roots.len(),
                roots.join(", ")
            )));
        }

        let chain = Self {
            artifacts: by_revision,
            children,
            root: roots.pop(),
        };

        let reachable = chain.reachable();
        if reachable.len() != chain.artifacts.len() {
            let orphans: Vec<&str> = chain
                .artifacts
                .keys()
                .filter(|rev| !reachable.contains(rev.as_str()))
                .map(String::as_str)
                .collect();
            return Err(MigrationError::chain(format!(
                "revisions not reachable from the base (cycle?): [{}]",
                orphans.join(", ")
            )));
        }

        for artifact in chain.artifacts.values() {
            let expected_sequence = match &artifact.down_revision {
                Some(parent) => chain.artifacts.get(parent).map_or(0, |p| p.sequence) + 1,
                None => 1,
            };
            if artifact.sequence != expected_sequence {
                return Err(MigrationError::chain(format!(
                    "revision {} has sequence {} but follows sequence {}",
                    artifact.revision,
                    artifact.sequence,
                    expected_sequence - 1
                )));
            }
            artifact.verify()?;
        }

        Ok(chain)
    }

    fn reachable(&self) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.root.iter().map(String::as_str).collect();
        while let Some(rev) = stack.pop() {
            if !seen.insert(rev) {
                continue;
            }
            if let Some(kids) = self.children.get(rev) {
                stack.extend(kids.iter().map(String::as_str));
            }
        }
        seen
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn get(&self, revision: &str) -> Option<&Artifact> {
        self.artifacts.get(revision)
    }

    /// Artifacts with no successor.
    pub fn heads(&self) -> Vec<&Artifact> {
        self.artifacts
            .values()
            .filter(|a| !self.children.contains_key(&a.revision))
            .collect()
    }

    /// The single head, `None` for an empty chain.
    pub fn head(&self) -> Result<Option<&Artifact>, MigrationError> {
        let heads = self.heads();
        match heads.len() {
            0 => Ok(None),
            1 => Ok(heads.into_iter().next()),
            n => {
                let ids: Vec<&str> = heads.iter().map(|a| a.revision.as_str()).collect();
                Err(MigrationError::chain(format!(
                    "{n} heads found [{}]; the history has branched and no merge strategy is available",
                    ids.join(", ")
                )))
            }
        }
    }

    /// Artifacts from the base to the head. Fails on a branched history.
    pub fn ordered(&self) -> Result<Vec<&Artifact>, MigrationError> {
        self.head()?;
        let mut ordered = Vec::with_capacity(self.artifacts.len());
        let mut cursor = self.root.as_deref();
        while let Some(rev) = cursor {
            let Some(artifact) = self.artifacts.get(rev) else {
                break;
            };
            ordered.push(artifact);
            cursor = self
                .children
                .get(rev)
                .and_then(|kids| kids.first())
                .map(String::as_str);
        }
        Ok(ordered)
    }

    /// Schema produced by replaying upgrade sets up to and including `revision`
    /// (`None` = the empty base schema).
    pub fn schema_at(&self, revision: Option<&str>) -> Result<SchemaSnapshot, MigrationError> {
        let mut snapshot = SchemaSnapshot::new();
        let Some(target) = revision else {
            return Ok(snapshot);
        };
        if !self.artifacts.contains_key(target) {
            return Err(MigrationError::chain(format!("unknown revision {target}")));
        }

        for artifact in self.ordered()? {
            for op in &artifact.upgrade {
                snapshot.apply_op(op).map_err(|reason| {
                    MigrationError::chain(format!(
                        "revision {} cannot be replayed: {reason}",
                        artifact.revision
                    ))
                })?;
            }
            if artifact.revision == target {
                break;
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Description;
    use crate::ops::SchemaOp;
    use crate::schema::{ColumnDef, ColumnType, TableDef};

    fn artifact(parent: Option<&Artifact>, description: &str, upgrade: Vec<SchemaOp>) -> Artifact {
        Artifact::next(parent, &Description::new(description).unwrap(), upgrade).unwrap()
    }

    fn create(name: &str) -> Vec<SchemaOp> {
        vec![SchemaOp::CreateTable {
            table: TableDef::new(name).column(ColumnDef::new("id", ColumnType::Integer)),
        }]
    }

    #[test]
    fn empty_chain_has_no_head() {
        let chain = Chain::build(vec![]).unwrap();
        assert!(chain.is_empty());
        assert!(chain.head().unwrap().is_none());
        assert!(chain.ordered().unwrap().is_empty());
    }

    #[test]
    fn linear_chain_orders_base_to_head() {
        let a = artifact(None, "a", create("a"));
        let b = artifact(Some(&a), "b", create("b"));
        let c = artifact(Some(&b), "c", create("c"));
        let chain = Chain::build(vec![c.clone(), a.clone(), b.clone()]).unwrap();

        let order: Vec<&str> = chain
            .ordered()
            .unwrap()
            .iter()
            .map(|x| x.revision.as_str())
            .collect();
        assert_eq!(order, vec![a.revision.as_str(), b.revision.as_str(), c.revision.as_str()]);
        assert_eq!(chain.head().unwrap().unwrap().revision, c.revision);

        let at_b = chain.schema_at(Some(&b.revision)).unwrap();
        assert!(at_b.table("b").is_some());
        assert!(at_b.table("c").is_none());
    }

    #[test]
    fn branched_history_is_a_chain_error() {
        let a = artifact(None, "a", vec![]);
        let b1 = artifact(Some(&a), "b1", vec![]);
        let b2 = artifact(Some(&a), "b2", vec![]);
        let chain = Chain::build(vec![a, b1, b2]).unwrap();
        assert_eq!(chain.heads().len(), 2);
        assert!(matches!(chain.head(), Err(MigrationError::Chain { .. })));
        assert!(chain.ordered().is_err());
    }

    #[test]
    fn broken_histories_are_rejected() {
        let a = artifact(None, "a", vec![]);
        let mut dangling = artifact(Some(&a), "b", vec![]);
        dangling.down_revision = Some("ffffffffffff".to_string());
        assert!(Chain::build(vec![a.clone(), dangling]).is_err());

        let second_root = artifact(None, "other", vec![]);
        assert!(Chain::build(vec![a.clone(), second_root]).is_err());

        assert!(Chain::build(vec![a.clone(), a.clone()]).is_err());

        // x <-> y cycle beside a valid root
        let mut x = artifact(Some(&a), "x", vec![]);
        let mut y = artifact(Some(&a), "y", vec![]);
        x.down_revision = Some(y.revision.clone());
        y.down_revision = Some(x.revision.clone());
        let err = Chain::build(vec![a, x, y]).unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[test]
    fn edited_artifact_is_rejected() {
        let a = artifact(None, "a", create("a"));
        let mut b = artifact(Some(&a), "b", create("b"));
        b.upgrade = create("c");
        b.downgrade = crate::ops::invert(&b.upgrade);

        let err = Chain::build(vec![a, b]).unwrap_err();
        assert!(matches!(err, MigrationError::Chain { .. }));
        assert!(err.to_string().contains("does not match its contents"), "{err}");
    }
}
