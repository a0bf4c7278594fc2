//! Topic and schema name generation
//!
//! A naming strategy is a pure function from the configured prefix and the
//! table identity to a name; the default is Debezium-compatible.

use crate::catalog::TrackedTable;

/// Interchangeable topic naming strategies
pub trait NamingStrategy: Send + Sync {
    fn event_topic_name(&self, topic_prefix: &str, table: &TrackedTable) -> String;
    fn schema_topic_name(&self, topic_prefix: &str, table: &TrackedTable) -> String;
    fn message_topic_name(&self, topic_prefix: &str) -> String;
}

/// `{prefix}.{schema}.{table}` for events and schemas, `{prefix}.message`
/// for logical messages
#[derive(Debug, Default)]
pub struct DebeziumNamingStrategy;

impl NamingStrategy for DebeziumNamingStrategy {
    fn event_topic_name(&self, topic_prefix: &str, table: &TrackedTable) -> String {
        format!(
            "{}.{}.{}",
            topic_prefix,
            table.schema_name(),
            table.table_name()
        )
    }

    fn schema_topic_name(&self, topic_prefix: &str, table: &TrackedTable) -> String {
        self.event_topic_name(topic_prefix, table)
    }

    fn message_topic_name(&self, topic_prefix: &str) -> String {
        format!("{}.message", topic_prefix)
    }
}

/// Binds a prefix to a strategy
pub struct NameGenerator {
    topic_prefix: String,
    strategy: Box<dyn NamingStrategy>,
}

impl NameGenerator {
    pub fn new(topic_prefix: impl Into<String>, strategy: Box<dyn NamingStrategy>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            strategy,
        }
    }

    pub fn event_topic_name(&self, table: &TrackedTable) -> String {
        self.strategy.event_topic_name(&self.topic_prefix, table)
    }

    pub fn schema_topic_name(&self, table: &TrackedTable) -> String {
        self.strategy.schema_topic_name(&self.topic_prefix, table)
    }

    pub fn message_topic_name(&self) -> String {
        self.strategy.message_topic_name(&self.topic_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BaseTable, ReplicaIdentity, SystemEntity};
    use std::sync::Arc;

    fn metrics_table() -> TrackedTable {
        TrackedTable::Vanilla(Arc::new(BaseTable::new(
            SystemEntity::new("public", "metrics"),
            "tsdb",
            ReplicaIdentity::Default,
            vec![],
        )))
    }

    #[test]
    fn test_debezium_event_topic_name() {
        let generator = NameGenerator::new("prefix", Box::new(DebeziumNamingStrategy));
        assert_eq!(
            generator.event_topic_name(&metrics_table()),
            "prefix.public.metrics"
        );
    }

    #[test]
    fn test_schema_topic_matches_event_topic() {
        let generator = NameGenerator::new("prefix", Box::new(DebeziumNamingStrategy));
        let table = metrics_table();
        assert_eq!(
            generator.event_topic_name(&table),
            generator.schema_topic_name(&table)
        );
    }

    #[test]
    fn test_message_topic_name() {
        let generator = NameGenerator::new("prefix", Box::new(DebeziumNamingStrategy));
        assert_eq!(generator.message_topic_name(), "prefix.message");
    }
}
