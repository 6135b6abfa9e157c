//! Duplicate detection and cleanup.
//!
//! Two signals:
//! - identical raw-line content inside one artifact, which means the same
//!   data was ingested twice;
//! - the same reference number on detail records of different artifacts,
//!   which also happens legitimately (re-presented transactions) and is only
//!   reported unless cleanup is asked to include it.

use crate::artifact::{ArtifactId, LineStatus, RecordId};
use crate::codec::{layout, RecordType};
use crate::error::Result;
use crate::store::{Store, Tables};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    ExactContent,
    BusinessReference,
}

/// Records that share a content hash or a reference number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub kind: DuplicateKind,
    /// md5 of the raw line, or the reference number
    pub key: String,
    /// Artifacts the members belong to.
    pub artifacts: Vec<ArtifactId>,
    /// Oldest first.
    pub members: Vec<RecordId>,
    /// The member that survives cleanup.
    pub canonical: RecordId,
    pub member_count: usize,
}

/// Which records a scan or cleanup looks at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuplicateScope {
    /// Limit to groups touching this artifact.
    pub artifact: Option<ArtifactId>,
    /// Also collapse reference-number groups during cleanup.
    pub include_references: bool,
}

impl DuplicateScope {
    pub fn artifact(id: ArtifactId) -> Self {
        DuplicateScope {
            artifact: Some(id),
            include_references: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Groups with more than one member
    pub groups: usize,
    /// Records removed, or that would be removed in a dry run
    pub removed: usize,
}

/// Hex md5 of a raw line, ignoring trailing whitespace and line endings.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", md5::compute(text.trim_end().as_bytes()))
}

type Member = (DateTime<Utc>, RecordId, ArtifactId);

fn build_group(kind: DuplicateKind, key: String, mut members: Vec<Member>) -> DuplicateGroup {
    members.sort();
    let artifacts: BTreeSet<ArtifactId> = members.iter().map(|m| m.2).collect();
    DuplicateGroup {
        kind,
        key,
        artifacts: artifacts.into_iter().collect(),
        canonical: members[0].1,
        member_count: members.len(),
        members: members.into_iter().map(|m| m.1).collect(),
    }
}

/// Scans the tables for duplicate groups with more than one member.
pub(crate) fn scan(t: &Tables, scope: &DuplicateScope) -> Vec<DuplicateGroup> {
    let mut by_content: BTreeMap<(ArtifactId, String), Vec<Member>> = BTreeMap::new();
    let mut by_reference: BTreeMap<String, Vec<Member>> = BTreeMap::new();

    for (artifact_id, partition) in &t.partitions {
        for record in partition.records.values() {
            let member = (record.created_at, record.id, *artifact_id);
            if let Some(line) = partition.line(record.line_number) {
                by_content
                    .entry((*artifact_id, content_hash(&line.text)))
                    .or_default()
                    .push(member);
            }
            if record.record_type == RecordType::DetailTransaction {
                if let Some(reference) = record.text(layout::REFERENCE_NUMBER) {
                    by_reference
                        .entry(reference.to_string())
                        .or_default()
                        .push(member);
                }
            }
        }
    }

    let in_scope = |g: &DuplicateGroup| scope.artifact.map_or(true, |a| g.artifacts.contains(&a));

    let content = by_content
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|((_, hash), members)| build_group(DuplicateKind::ExactContent, hash, members));
    let references = by_reference
        .into_iter()
        .filter(|(_, members)| {
            members.len() > 1 && members.iter().map(|m| m.2).collect::<BTreeSet<_>>().len() > 1
        })
        .map(|(reference, members)| {
            build_group(DuplicateKind::BusinessReference, reference, members)
        });

    content.chain(references).filter(in_scope).collect()
}

/// Forgets a purged artifact's records in remembered groups.
///
/// Groups left with one member, or reference groups left inside a single
/// artifact, are dropped.
pub(crate) fn forget_artifact(
    groups: &mut Vec<DuplicateGroup>,
    artifact: ArtifactId,
    purged: &BTreeSet<RecordId>,
) {
    groups.retain_mut(|g| {
        g.members.retain(|id| !purged.contains(id));
        g.artifacts.retain(|a| *a != artifact);
        g.member_count = g.members.len();
        let Some(&canonical) = g.members.first() else {
            return false;
        };
        g.canonical = canonical;
        let min_artifacts = match g.kind {
            DuplicateKind::ExactContent => 1,
            DuplicateKind::BusinessReference => 2,
        };
        g.member_count > 1 && g.artifacts.len() >= min_artifacts
    });
}

/// Removes a duplicate record; its raw line becomes `skipped` so line counts
/// still reconcile.
fn remove_record(t: &mut Tables, record_id: RecordId, canonical: RecordId) -> bool {
    for partition in t.partitions.values_mut() {
        let Some(line_number) = partition
            .records
            .values()
            .find(|r| r.id == record_id)
            .map(|r| r.line_number)
        else {
            continue;
        };
        partition.records.remove(&line_number);
        if let Some(line) = partition.line_mut(line_number) {
            line.status = LineStatus::Skipped;
            line.record_id = None;
            line.skip_reason = Some(format!("duplicate of {}", canonical));
        }
        return true;
    }
    false
}

/// Finds and collapses duplicate groups.
#[derive(Clone)]
pub struct DuplicateDetector {
    store: Arc<Store>,
}

impl DuplicateDetector {
    pub fn new(store: Arc<Store>) -> Self {
        DuplicateDetector { store }
    }

    /// Scans for duplicates and remembers the result in the store.
    pub fn find_duplicates(&self, scope: &DuplicateScope) -> Result<Vec<DuplicateGroup>> {
        self.store.write(|t| {
            let groups = scan(t, scope);
            t.duplicate_groups = groups.clone();
            groups
        })
    }

    /// Keeps the oldest member of every group and removes the rest.
    ///
    /// Content groups are always collapsed; reference groups only when the
    /// scope asks for it. A group's last surviving member is never removed.
    /// With `dry_run` nothing changes and the report holds would-be counts.
    pub fn cleanup(&self, scope: &DuplicateScope, dry_run: bool) -> Result<CleanupReport> {
        let report = self.store.write(|t| {
            let groups: Vec<DuplicateGroup> = scan(t, scope)
                .into_iter()
                .filter(|g| g.kind == DuplicateKind::ExactContent || scope.include_references)
                .collect();
            let mut report = CleanupReport {
                dry_run,
                groups: groups.len(),
                removed: 0,
            };
            let mut removed: BTreeSet<RecordId> = BTreeSet::new();

            for group in &groups {
                let survivors: Vec<RecordId> = group
                    .members
                    .iter()
                    .copied()
                    .filter(|id| !removed.contains(id))
                    .collect();
                let Some((&keep, rest)) = survivors.split_first() else {
                    continue;
                };
                for &id in rest {
                    if dry_run || remove_record(t, id, keep) {
                        removed.insert(id);
                        report.removed += 1;
                    }
                }
            }

            if !dry_run {
                t.duplicate_groups = scan(t, scope);
            }
            report
        })?;

        if report.removed > 0 && !dry_run {
            warn!("removed {} duplicate records in {} groups", report.removed, report.groups);
        } else {
            info!(
                "duplicate cleanup{}: {} groups, {} removable",
                if dry_run { " (dry run)" } else { "" },
                report.groups,
                report.removed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_ignores_trailing_whitespace() {
        assert_eq!(content_hash("abc  \r"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash(" abc"));
        assert_eq!(content_hash("test"), "098f6bcd4621d373cade4e832627b4f6");
    }

    #[test]
    fn test_group_is_ordered_oldest_first() {
        let later = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(10);
        let group = build_group(
            DuplicateKind::ExactContent,
            "k".into(),
            vec![
                (later, RecordId(1), ArtifactId(1)),
                (DateTime::<Utc>::UNIX_EPOCH, RecordId(7), ArtifactId(1)),
                (later, RecordId(3), ArtifactId(1)),
            ],
        );
        assert_eq!(group.canonical, RecordId(7));
        assert_eq!(group.members, vec![RecordId(7), RecordId(1), RecordId(3)]);
        assert_eq!(group.member_count, 3);
        assert_eq!(group.artifacts, vec![ArtifactId(1)]);
    }

    #[test]
    fn test_forgetting_an_artifact_prunes_its_members() {
        let at = DateTime::<Utc>::UNIX_EPOCH;
        let mut groups = vec![
            // purged record was canonical
            build_group(
                DuplicateKind::BusinessReference,
                "R1".into(),
                vec![
                    (at, RecordId(1), ArtifactId(1)),
                    (at, RecordId(5), ArtifactId(2)),
                    (at, RecordId(9), ArtifactId(3)),
                ],
            ),
            // only one artifact would be left
            build_group(
                DuplicateKind::BusinessReference,
                "R2".into(),
                vec![
                    (at, RecordId(2), ArtifactId(1)),
                    (at, RecordId(6), ArtifactId(2)),
                    (at, RecordId(7), ArtifactId(2)),
                ],
            ),
            build_group(
                DuplicateKind::ExactContent,
                "h".into(),
                vec![(at, RecordId(10), ArtifactId(3)), (at, RecordId(11), ArtifactId(3))],
            ),
        ];
        let purged: BTreeSet<RecordId> = [RecordId(1), RecordId(2)].into_iter().collect();
        forget_artifact(&mut groups, ArtifactId(1), &purged);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec![RecordId(5), RecordId(9)]);
        assert_eq!(groups[0].canonical, RecordId(5));
        assert_eq!(groups[0].member_count, 2);
        assert_eq!(groups[0].artifacts, vec![ArtifactId(2), ArtifactId(3)]);
        assert_eq!(groups[1].key, "h");
    }

    #[test]
    fn test_detector_can_move_across_threads() {
        use crate::clock::ManualClock;
        let store = Arc::new(Store::new(Arc::new(ManualClock::default())));
        let detector = DuplicateDetector::new(store.clone());
        let handle = {
            let detector = detector.clone();
            std::thread::spawn(move || detector.find_duplicates(&DuplicateScope::default()))
        };
        assert!(handle.join().unwrap().unwrap().is_empty());
        assert_eq!(detector.cleanup(&DuplicateScope::default(), true).unwrap().groups, 0);
    }
}
