//! Replica identity preflight
//!
//! Logical UPDATE/DELETE events only carry usable old-value images when the
//! table has replica identity FULL, a replica identity index, or a primary
//! key. Any table failing the check aborts startup.

use crate::catalog::{BaseTable, Columns, Hypertable, ReplicaIdentity};

/// Validate every non-continuous-aggregate hypertable and vanilla table.
/// Returns the list of human-readable issues; empty means all good.
pub fn check_replica_identities(
    hypertables: &[Hypertable],
    vanilla_tables: &[BaseTable],
) -> Vec<String> {
    let mut issues = Vec::new();

    for hypertable in hypertables {
        if hypertable.is_continuous_aggregate() {
            continue;
        }
        if let Some(issue) = check_table(
            "Hypertable",
            &hypertable.canonical_name(),
            hypertable.replica_identity(),
            hypertable.columns(),
        ) {
            issues.push(issue);
        }
    }

    for table in vanilla_tables {
        if let Some(issue) = check_table(
            "Table",
            &table.canonical_name(),
            table.replica_identity(),
            table.columns(),
        ) {
            issues.push(issue);
        }
    }

    issues
}

fn check_table(
    kind: &str,
    canonical_name: &str,
    replica_identity: ReplicaIdentity,
    columns: &[crate::catalog::Column],
) -> Option<String> {
    if replica_identity == ReplicaIdentity::Full {
        return None;
    }

    if replica_identity == ReplicaIdentity::Index && !columns.has_replica_identity() {
        return Some(format!(
            "{} {} has replica identity INDEX, but no valid index",
            kind, canonical_name
        ));
    }

    if columns.has_primary_key() {
        return None;
    }

    Some(format!(
        "{} {} has replica identity {}, but no valid primary key",
        kind, canonical_name, replica_identity
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, SystemEntity};
    use crate::types::oids;

    fn hypertable(
        replica_identity: ReplicaIdentity,
        columns: Vec<Column>,
        view: Option<(&str, &str)>,
    ) -> Hypertable {
        Hypertable::new(
            1,
            SystemEntity::new("public", "metrics"),
            "tsdb",
            view.map(|(s, _)| s.to_string()),
            view.map(|(_, n)| n.to_string()),
            replica_identity,
            columns,
        )
    }

    fn pk_column() -> Column {
        Column::new("id", oids::INT4, false, true, true)
    }

    fn plain_column() -> Column {
        Column::new("value", oids::FLOAT8, true, false, false)
    }

    #[test]
    fn test_full_replica_identity_passes() {
        let issues = check_replica_identities(
            &[hypertable(ReplicaIdentity::Full, vec![plain_column()], None)],
            &[],
        );
        assert!(issues.is_empty());
    }

    #[test]
    fn test_default_with_primary_key_passes() {
        let issues = check_replica_identities(
            &[hypertable(
                ReplicaIdentity::Default,
                vec![pk_column(), plain_column()],
                None,
            )],
            &[],
        );
        assert!(issues.is_empty());
    }

    #[test]
    fn test_default_without_primary_key_is_flagged() {
        let issues = check_replica_identities(
            &[hypertable(ReplicaIdentity::Default, vec![plain_column()], None)],
            &[],
        );
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("no valid primary key"));
    }

    #[test]
    fn test_index_without_index_is_flagged() {
        let issues = check_replica_identities(
            &[hypertable(ReplicaIdentity::Index, vec![plain_column()], None)],
            &[],
        );
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("no valid index"));
    }

    #[test]
    fn test_continuous_aggregates_are_skipped() {
        let issues = check_replica_identities(
            &[hypertable(
                ReplicaIdentity::Nothing,
                vec![plain_column()],
                Some(("public", "metrics_hourly")),
            )],
            &[],
        );
        assert!(issues.is_empty());
    }

    #[test]
    fn test_vanilla_tables_are_checked() {
        let table = BaseTable::new(
            SystemEntity::new("public", "users"),
            "tsdb",
            ReplicaIdentity::Default,
            vec![plain_column()],
        );
        let issues = check_replica_identities(&[], &[table]);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("Table"));
    }
}
