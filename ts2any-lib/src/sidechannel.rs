//! SQL side channel for catalog inspection
//!
//! Everything the streamer needs to ask the database outside of the
//! replication protocol goes through this boundary: version preflight,
//! hypertable/chunk/vanilla-table discovery, publication management,
//! replication slot inspection and snapshot reads.

use crate::catalog::{BaseTable, Chunk, Column, Hypertable, ReplicaIdentity, SystemEntity};
use crate::error::Result;
use crate::handlers::RowValues;
use crate::types::Lsn;
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

/// Facts gathered once at startup
#[derive(Debug, Clone)]
pub struct SystemInformation {
    pub database_name: String,
    pub system_id: String,
    pub timeline: i32,
    pub postgres_version: i32,
    pub postgres_version_text: String,
    pub timescale_version: String,
    pub wal_level: String,
}

impl SystemInformation {
    /// PostgreSQL 13 is the oldest supported release
    pub fn is_minimum_postgres_version(&self) -> bool {
        self.postgres_version >= 130_000
    }

    /// TimescaleDB 2.10 is the oldest supported release
    pub fn is_minimum_timescale_version(&self) -> bool {
        let mut parts = self.timescale_version.split('.');
        let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor: u32 = parts
            .next()
            .and_then(|p| p.split('-').next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        major > 2 || (major == 2 && minor >= 10)
    }

    pub fn is_logical_replication_enabled(&self) -> bool {
        self.wal_level == "logical"
    }
}

/// A replication slot row
#[derive(Debug, Clone)]
pub struct ReplicationSlotInfo {
    pub slot_name: String,
    pub plugin: String,
    pub restart_lsn: Option<Lsn>,
    pub confirmed_flush_lsn: Option<Lsn>,
}

/// Catalog inspection and publication management boundary
#[async_trait]
pub trait SideChannel: Send + Sync {
    async fn read_system_information(&self) -> Result<SystemInformation>;

    async fn get_all_hypertables(&self) -> Result<Vec<Hypertable>>;

    async fn get_all_chunks(&self) -> Result<Vec<Chunk>>;

    async fn get_all_vanilla_tables(&self) -> Result<Vec<BaseTable>>;

    async fn read_published_tables(&self, publication: &str) -> Result<Vec<SystemEntity>>;

    async fn create_publication(&self, publication: &str) -> Result<()>;

    async fn publication_exists(&self, publication: &str) -> Result<bool>;

    async fn attach_tables_to_publication(
        &self,
        publication: &str,
        entities: &[SystemEntity],
    ) -> Result<()>;

    async fn read_replication_slot(&self, slot_name: &str) -> Result<Option<ReplicationSlotInfo>>;

    async fn create_replication_slot(&self, slot_name: &str) -> Result<()>;

    /// Read one batch of rows from a table, values in their text form
    async fn snapshot_table(
        &self,
        entity: &SystemEntity,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RowValues>>;
}

/// tokio-postgres backed side channel
pub struct PgSideChannel {
    client: Client,
}

impl PgSideChannel {
    /// Connect and spawn the connection driver
    pub async fn connect(connection_string: &str) -> Result<Self> {
        info!("Connecting side channel");
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("Side channel connection terminated: {}", err);
            }
        });
        Ok(Self { client })
    }

    async fn read_columns(&self, entity: &SystemEntity) -> Result<Vec<Column>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname,
                        a.atttypid,
                        NOT a.attnotnull AS nullable,
                        EXISTS (
                            SELECT 1 FROM pg_index i
                            WHERE i.indrelid = a.attrelid
                              AND i.indisprimary
                              AND a.attnum = ANY(i.indkey)
                        ) AS is_primary,
                        EXISTS (
                            SELECT 1 FROM pg_index i
                            WHERE i.indrelid = a.attrelid
                              AND (i.indisreplident OR i.indisprimary)
                              AND a.attnum = ANY(i.indkey)
                        ) AS is_replica_identity
                 FROM pg_attribute a
                 WHERE a.attrelid = format('%I.%I', $1::text, $2::text)::regclass
                   AND a.attnum > 0
                   AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&entity.schema_name(), &entity.table_name()],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                Column::new(
                    row.get::<_, String>(0),
                    row.get::<_, u32>(1),
                    row.get::<_, bool>(2),
                    row.get::<_, bool>(3),
                    row.get::<_, bool>(4),
                )
            })
            .collect())
    }

    async fn read_replica_identity(&self, entity: &SystemEntity) -> Result<ReplicaIdentity> {
        let row = self
            .client
            .query_one(
                "SELECT c.relreplident::text
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&entity.schema_name(), &entity.table_name()],
            )
            .await?;
        let ident: String = row.get(0);
        Ok(ReplicaIdentity::from_relreplident(
            ident.chars().next().unwrap_or('d'),
        ))
    }

    fn quote_entities(entities: &[SystemEntity]) -> String {
        entities
            .iter()
            .map(|e| e.canonical_name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl SideChannel for PgSideChannel {
    async fn read_system_information(&self) -> Result<SystemInformation> {
        let row = self
            .client
            .query_one(
                "SELECT current_database(),
                        current_setting('server_version_num'),
                        current_setting('server_version'),
                        current_setting('wal_level')",
                &[],
            )
            .await?;
        let database_name: String = row.get(0);
        let version_num: String = row.get(1);
        let postgres_version_text: String = row.get(2);
        let wal_level: String = row.get(3);

        let control = self
            .client
            .query_one(
                "SELECT system_identifier::text, timeline_id FROM pg_control_system()",
                &[],
            )
            .await?;
        let system_id: String = control.get(0);
        let timeline: i32 = control.get(1);

        let timescale_version: String = self
            .client
            .query_opt(
                "SELECT extversion FROM pg_extension WHERE extname = 'timescaledb'",
                &[],
            )
            .await?
            .map(|row| row.get(0))
            .unwrap_or_default();

        Ok(SystemInformation {
            database_name,
            system_id,
            timeline,
            postgres_version: version_num.parse().unwrap_or(0),
            postgres_version_text,
            timescale_version,
            wal_level,
        })
    }

    async fn get_all_hypertables(&self) -> Result<Vec<Hypertable>> {
        let database_name: String = self
            .client
            .query_one("SELECT current_database()", &[])
            .await?
            .get(0);

        let rows = self
            .client
            .query(
                "SELECT h.id, h.schema_name, h.table_name,
                        ca.user_view_schema, ca.user_view_name
                 FROM _timescaledb_catalog.hypertable h
                 LEFT JOIN _timescaledb_catalog.continuous_agg ca
                        ON ca.mat_hypertable_id = h.id
                 ORDER BY h.id",
                &[],
            )
            .await?;

        let mut hypertables = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = SystemEntity::new(row.get::<_, String>(1), row.get::<_, String>(2));
            let replica_identity = self.read_replica_identity(&entity).await?;
            let columns = self.read_columns(&entity).await?;
            hypertables.push(Hypertable::new(
                row.get(0),
                entity,
                database_name.clone(),
                row.get::<_, Option<String>>(3),
                row.get::<_, Option<String>>(4),
                replica_identity,
                columns,
            ));
        }
        debug!("Discovered {} hypertables", hypertables.len());
        Ok(hypertables)
    }

    async fn get_all_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = self
            .client
            .query(
                "SELECT c.id, c.hypertable_id, c.schema_name, c.table_name,
                        c.status & 1 = 1 AS compressed, c.dropped
                 FROM _timescaledb_catalog.chunk c
                 WHERE NOT c.dropped
                 ORDER BY c.id",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                Chunk::new(
                    row.get(0),
                    row.get(1),
                    SystemEntity::new(row.get::<_, String>(2), row.get::<_, String>(3)),
                    row.get(4),
                    row.get(5),
                )
            })
            .collect())
    }

    async fn get_all_vanilla_tables(&self) -> Result<Vec<BaseTable>> {
        let database_name: String = self
            .client
            .query_one("SELECT current_database()", &[])
            .await?
            .get(0);

        let rows = self
            .client
            .query(
                "SELECT n.nspname, c.relname
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE c.relkind = 'r'
                   AND n.nspname NOT IN
                       ('pg_catalog', 'information_schema',
                        '_timescaledb_catalog', '_timescaledb_internal',
                        '_timescaledb_config', '_timescaledb_cache')
                   AND NOT EXISTS (
                       SELECT 1 FROM _timescaledb_catalog.hypertable h
                       WHERE h.schema_name = n.nspname AND h.table_name = c.relname
                   )
                 ORDER BY n.nspname, c.relname",
                &[],
            )
            .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = SystemEntity::new(row.get::<_, String>(0), row.get::<_, String>(1));
            let replica_identity = self.read_replica_identity(&entity).await?;
            let columns = self.read_columns(&entity).await?;
            tables.push(BaseTable::new(
                entity,
                database_name.clone(),
                replica_identity,
                columns,
            ));
        }
        Ok(tables)
    }

    async fn read_published_tables(&self, publication: &str) -> Result<Vec<SystemEntity>> {
        let rows = self
            .client
            .query(
                "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = $1",
                &[&publication],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| SystemEntity::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn create_publication(&self, publication: &str) -> Result<()> {
        let sql = format!(
            "CREATE PUBLICATION \"{}\" WITH (publish = 'insert,update,delete,truncate')",
            publication.replace('"', "\"\"")
        );
        self.client.execute(sql.as_str(), &[]).await?;
        info!("Created publication {}", publication);
        Ok(())
    }

    async fn publication_exists(&self, publication: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[&publication],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn attach_tables_to_publication(
        &self,
        publication: &str,
        entities: &[SystemEntity],
    ) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "ALTER PUBLICATION \"{}\" ADD TABLE {}",
            publication.replace('"', "\"\""),
            Self::quote_entities(entities)
        );
        self.client.execute(sql.as_str(), &[]).await?;
        debug!(
            "Attached {} tables to publication {}",
            entities.len(),
            publication
        );
        Ok(())
    }

    async fn read_replication_slot(&self, slot_name: &str) -> Result<Option<ReplicationSlotInfo>> {
        let row = self
            .client
            .query_opt(
                "SELECT slot_name, plugin, restart_lsn::text, confirmed_flush_lsn::text
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let parse_lsn = |value: Option<String>| -> Result<Option<Lsn>> {
            value.map(|text| text.parse()).transpose()
        };
        Ok(Some(ReplicationSlotInfo {
            slot_name: row.get(0),
            plugin: row.get(1),
            restart_lsn: parse_lsn(row.get(2))?,
            confirmed_flush_lsn: parse_lsn(row.get(3))?,
        }))
    }

    async fn create_replication_slot(&self, slot_name: &str) -> Result<()> {
        self.client
            .execute(
                "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
                &[&slot_name],
            )
            .await?;
        info!("Created replication slot {}", slot_name);
        Ok(())
    }

    async fn snapshot_table(
        &self,
        entity: &SystemEntity,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RowValues>> {
        let sql = format!(
            "SELECT row_to_json(t)::text FROM {} t LIMIT $1 OFFSET $2",
            entity.canonical_name()
        );
        let rows = self.client.query(sql.as_str(), &[&limit, &offset]).await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get(0);
            let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&json)?;
            values.push(parsed.into_iter().collect());
        }
        Ok(values)
    }
}

impl std::fmt::Debug for PgSideChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSideChannel").finish_non_exhaustive()
    }
}
