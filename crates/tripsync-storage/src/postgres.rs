//! PostgreSQL store backed by a single sqlx connection.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection, Row};
use tracing::debug;
use tripsync_core::{
    normalize_column_name, ColumnDescriptor, ColumnSpec, ColumnType, Ident, RelationDescriptor,
    INSERT_TIME_COLUMN, SURROGATE_KEY_COLUMN, UPDATE_TIME_COLUMN,
};

use crate::surrogate::surrogate_key_sql;
use crate::{MergePlan, Store, StoreError};

const DUPLICATE_COLUMN: &str = "42701";
const UNDEFINED_COLUMN: &str = "42703";
const UNDEFINED_TABLE: &str = "42P01";
const UNIQUE_VIOLATION: &str = "23505";

/// Connection fields the operator set explicitly. Each one wins over both
/// `DATABASE_URL` and the `DB_*` variables.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

impl ConnectionOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Debug for ConnectionOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOverrides")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("name", &self.name)
            .finish()
    }
}

/// Connection parameters for the relational store.
#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub schema: String,
    pub statement_timeout: Option<Duration>,
    pub overrides: ConnectionOverrides,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<redacted>"),
            )
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("schema", &self.schema)
            .field("statement_timeout", &self.statement_timeout)
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            name: "trips".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            schema: "public".to_string(),
            statement_timeout: None,
            overrides: ConnectionOverrides::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            name: std::env::var("DB_NAME").unwrap_or(defaults.name),
            user: std::env::var("DB_USER").unwrap_or(defaults.user),
            password: std::env::var("DB_PASS").unwrap_or(defaults.password),
            host: std::env::var("DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            schema: std::env::var("DB_SCHEMA").unwrap_or(defaults.schema),
            statement_timeout: std::env::var("DB_STATEMENT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            overrides: ConnectionOverrides::default(),
        }
    }

    /// Base options come from `database_url` when set, otherwise from the
    /// discrete fields; explicit overrides are applied last.
    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        let mut options = match &self.database_url {
            Some(url) => url.parse::<PgConnectOptions>()?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.name),
        };
        let overrides = &self.overrides;
        if let Some(host) = &overrides.host {
            options = options.host(host);
        }
        if let Some(port) = overrides.port {
            options = options.port(port);
        }
        if let Some(user) = &overrides.user {
            options = options.username(user);
        }
        if let Some(password) = &overrides.password {
            options = options.password(password);
        }
        if let Some(name) = &overrides.name {
            options = options.database(name);
        }
        // sqlx pins DateStyle=ISO and extra_float_digits at startup, which the
        // in-database key expression relies on for its `::text` casts.
        Ok(match self.statement_timeout {
            Some(timeout) => options.options([(
                "statement_timeout",
                format!("{}ms", timeout.as_millis()),
            )]),
            None => options,
        })
    }
}

/// One live connection scoped to a single synchronization run. Dropping the
/// store closes the connection.
pub struct PgStore {
    conn: PgConnection,
    schema: Ident,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let schema = Ident::new(config.schema.clone())?;
        let options = config.connect_options()?;
        let conn = PgConnection::connect_with(&options).await?;
        Ok(Self { conn, schema })
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }

    fn qualify(&self, relation: &Ident) -> String {
        qualify(&self.schema, relation)
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        debug!(sql, "executing statement");
        let result = sqlx::query(sql).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }
}

fn qualify(schema: &Ident, relation: &Ident) -> String {
    format!("{}.{}", schema.quoted(), relation.quoted())
}

fn classify(err: sqlx::Error, relation: &Ident, column: Option<&Ident>) -> StoreError {
    let code = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned());
    let column_name = || column.map(|c| c.to_string()).unwrap_or_default();
    match code.as_deref() {
        Some(UNDEFINED_TABLE) => StoreError::RelationNotFound(relation.to_string()),
        Some(DUPLICATE_COLUMN) => StoreError::ColumnExists {
            relation: relation.to_string(),
            column: column_name(),
        },
        Some(UNDEFINED_COLUMN) => StoreError::ColumnNotFound {
            relation: relation.to_string(),
            column: column_name(),
        },
        Some(UNIQUE_VIOLATION) => StoreError::DuplicateIdentity {
            relation: relation.to_string(),
        },
        _ => StoreError::Database(err),
    }
}

pub(crate) fn create_relation_sql(
    qualified: &str,
    columns: &[ColumnSpec],
) -> Result<String, StoreError> {
    let identity = Ident::new(SURROGATE_KEY_COLUMN)?;
    let mut defs = vec![format!("{} TEXT PRIMARY KEY", identity.quoted())];
    for column in columns {
        defs.push(format!(
            "{} {}",
            column.name.quoted(),
            column.column_type.to_sql()?
        ));
    }
    defs.push(format!(
        "{} TIMESTAMPTZ NOT NULL DEFAULT now()",
        Ident::new(INSERT_TIME_COLUMN)?.quoted()
    ));
    defs.push(format!(
        "{} TIMESTAMPTZ",
        Ident::new(UPDATE_TIME_COLUMN)?.quoted()
    ));
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {qualified} ({})",
        defs.join(", ")
    ))
}

pub(crate) fn deduplicate_sql(
    qualified: &str,
    business_key: &[Ident],
    tie_break: &Ident,
) -> String {
    let partition = business_key
        .iter()
        .map(Ident::quoted)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "DELETE FROM {qualified} WHERE ctid IN (\
         SELECT ctid FROM (\
         SELECT ctid, row_number() OVER (\
         PARTITION BY {partition} ORDER BY {} DESC NULLS LAST, ctid) AS rn \
         FROM {qualified}) ranked WHERE rn > 1)",
        tie_break.quoted()
    )
}

pub(crate) fn insert_missing_sql(staging: &str, target: &str, plan: &MergePlan) -> String {
    let key = surrogate_key_sql(&plan.business_key, "s");
    let identity = plan.identity.quoted();
    let mut targets = vec![identity.clone()];
    let mut sources = vec![key.clone()];
    for mapping in &plan.columns {
        targets.push(mapping.target.quoted());
        sources.push(format!("s.{}", mapping.source.quoted()));
    }
    format!(
        "INSERT INTO {target} ({}) SELECT {} FROM {staging} AS s \
         WHERE NOT EXISTS (SELECT 1 FROM {target} AS f WHERE f.{identity} = {key})",
        targets.join(", "),
        sources.join(", "),
    )
}

pub(crate) fn update_changed_sql(
    staging: &str,
    target: &str,
    plan: &MergePlan,
) -> Result<Option<String>, StoreError> {
    if plan.columns.is_empty() {
        return Ok(None);
    }
    let key = surrogate_key_sql(&plan.business_key, "s");
    let identity = plan.identity.quoted();
    let mut assignments = plan
        .columns
        .iter()
        .map(|m| format!("{} = s.{}", m.target.quoted(), m.source.quoted()))
        .collect::<Vec<_>>();
    assignments.push(format!("{} = now()", Ident::new(UPDATE_TIME_COLUMN)?.quoted()));
    let current = plan
        .columns
        .iter()
        .map(|m| format!("f.{}", m.target.quoted()))
        .collect::<Vec<_>>()
        .join(", ");
    let incoming = plan
        .columns
        .iter()
        .map(|m| format!("s.{}", m.source.quoted()))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(Some(format!(
        "UPDATE {target} AS f SET {} FROM {staging} AS s \
         WHERE f.{identity} = {key} AND ROW({current}) IS DISTINCT FROM ROW({incoming})",
        assignments.join(", "),
    )))
}

#[async_trait]
impl Store for PgStore {
    async fn describe(
        &mut self,
        relation: &Ident,
    ) -> Result<Option<RelationDescriptor>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name,
                   udt_name::text AS udt_name
              FROM information_schema.columns
             WHERE table_schema = $1
               AND table_name = $2
             ORDER BY ordinal_position
            "#,
        )
        .bind(self.schema.as_str())
        .bind(relation.as_str())
        .fetch_all(&mut self.conn)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let udt: String = row.try_get("udt_name")?;
            columns.push(ColumnDescriptor::new(
                Ident::new(name)?,
                ColumnType::parse(&udt),
            ));
        }

        let identity = sqlx::query(
            r#"
            SELECT kcu.column_name::text AS column_name
              FROM information_schema.table_constraints tc
              JOIN information_schema.key_column_usage kcu
                ON kcu.constraint_schema = tc.constraint_schema
               AND kcu.constraint_name = tc.constraint_name
             WHERE tc.constraint_type = 'PRIMARY KEY'
               AND tc.table_schema = $1
               AND tc.table_name = $2
             ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(self.schema.as_str())
        .bind(relation.as_str())
        .fetch_all(&mut self.conn)
        .await?
        .into_iter()
        .map(|row| {
            row.try_get::<String, _>("column_name")
                .map(|c| normalize_column_name(&c))
        })
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(RelationDescriptor {
            name: relation.clone(),
            columns,
            identity,
        }))
    }

    async fn create_relation(
        &mut self,
        relation: &Ident,
        columns: &[ColumnSpec],
    ) -> Result<(), StoreError> {
        let sql = create_relation_sql(&self.qualify(relation), columns)?;
        self.execute(&sql)
            .await
            .map_err(|e| classify(e, relation, None))?;
        Ok(())
    }

    async fn add_column(
        &mut self,
        relation: &Ident,
        column: &Ident,
        column_type: &ColumnType,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.qualify(relation),
            column.quoted(),
            column_type.to_sql()?
        );
        self.execute(&sql)
            .await
            .map_err(|e| classify(e, relation, Some(column)))?;
        Ok(())
    }

    async fn rename_column(
        &mut self,
        relation: &Ident,
        from: &Ident,
        to: &Ident,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.qualify(relation),
            from.quoted(),
            to.quoted()
        );
        self.execute(&sql)
            .await
            .map_err(|e| match classify(e, relation, Some(to)) {
                StoreError::ColumnNotFound { relation, .. } => StoreError::ColumnNotFound {
                    relation,
                    column: from.to_string(),
                },
                other => other,
            })?;
        Ok(())
    }

    async fn deduplicate(
        &mut self,
        relation: &Ident,
        business_key: &[Ident],
        tie_break: &Ident,
    ) -> Result<u64, StoreError> {
        let sql = deduplicate_sql(&self.qualify(relation), business_key, tie_break);
        self.execute(&sql)
            .await
            .map_err(|e| classify(e, relation, None))
    }

    async fn insert_missing(&mut self, plan: &MergePlan) -> Result<u64, StoreError> {
        let sql = insert_missing_sql(
            &self.qualify(&plan.staging),
            &self.qualify(&plan.final_relation),
            plan,
        );
        self.execute(&sql)
            .await
            .map_err(|e| classify(e, &plan.final_relation, None))
    }

    async fn update_changed(&mut self, plan: &MergePlan) -> Result<u64, StoreError> {
        let staging = self.qualify(&plan.staging);
        let target = self.qualify(&plan.final_relation);
        match update_changed_sql(&staging, &target, plan)? {
            Some(sql) => self
                .execute(&sql)
                .await
                .map_err(|e| classify(e, &plan.final_relation, None)),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ColumnMapping;

    fn id(name: &str) -> Ident {
        Ident::new(name).expect("ident")
    }

    fn plan() -> MergePlan {
        MergePlan {
            staging: id("_stg_yellow_trips"),
            final_relation: id("yellow_trips"),
            identity: id(SURROGATE_KEY_COLUMN),
            business_key: vec![id("VendorID")],
            columns: vec![
                ColumnMapping {
                    source: id("VendorID"),
                    target: id("VendorID"),
                },
                ColumnMapping {
                    source: id("total_amount"),
                    target: id("TOTAL_AMOUNT"),
                },
            ],
        }
    }

    #[test]
    fn config_debug_redacts_credentials() {
        let config = StoreConfig {
            database_url: Some("postgres://u:secret@h/db".into()),
            password: "secret".into(),
            overrides: ConnectionOverrides {
                password: Some("secret".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn overrides_win_over_database_url() {
        let mut config = StoreConfig {
            database_url: Some("postgres://a@h1:5432/db1".into()),
            ..Default::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "h1");
        assert_eq!(options.get_database(), Some("db1"));

        config.overrides = ConnectionOverrides {
            host: Some("h2".into()),
            port: Some(6543),
            user: Some("b".into()),
            password: None,
            name: Some("db2".into()),
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "h2");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_username(), "b");
        assert_eq!(options.get_database(), Some("db2"));
    }

    #[test]
    fn overrides_win_over_discrete_fields() {
        let config = StoreConfig {
            host: "from-env".into(),
            overrides: ConnectionOverrides {
                host: Some("from-flag".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!config.overrides.is_empty());
        assert_eq!(config.connect_options().unwrap().get_host(), "from-flag");
    }

    #[test]
    fn create_sql_adds_identity_and_bookkeeping_columns() {
        let sql = create_relation_sql(
            "\"public\".\"yellow_trips\"",
            &[ColumnSpec {
                name: id("VendorID"),
                column_type: ColumnType::Integer,
            }],
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"public\".\"yellow_trips\" (\
             \"surrogate_key\" TEXT PRIMARY KEY, \"VendorID\" INTEGER, \
             \"insert_time\" TIMESTAMPTZ NOT NULL DEFAULT now(), \
             \"update_time\" TIMESTAMPTZ)"
        );
    }

    #[test]
    fn dedup_sql_ranks_by_tie_break_descending() {
        let sql = deduplicate_sql(
            "\"public\".\"_stg_yellow_trips\"",
            &[id("VendorID"), id("tpep_pickup_datetime")],
            &id("total_amount"),
        );
        assert!(sql.starts_with("DELETE FROM \"public\".\"_stg_yellow_trips\" WHERE ctid IN ("));
        assert!(sql.contains("PARTITION BY \"VendorID\", \"tpep_pickup_datetime\""));
        assert!(sql.contains("ORDER BY \"total_amount\" DESC NULLS LAST, ctid"));
        assert!(sql.ends_with("WHERE rn > 1)"));
    }

    #[test]
    fn insert_sql_selects_complement_of_existing_identities() {
        let staging = "\"public\".\"_stg_yellow_trips\"";
        let target = "\"public\".\"yellow_trips\"";
        let sql = insert_missing_sql(staging, target, &plan());
        assert!(sql.starts_with(
            "INSERT INTO \"public\".\"yellow_trips\" \
             (\"surrogate_key\", \"VendorID\", \"TOTAL_AMOUNT\") SELECT encode("
        ));
        assert!(sql.contains(
            "s.\"VendorID\", s.\"total_amount\" FROM \"public\".\"_stg_yellow_trips\" AS s"
        ));
        assert!(sql.contains(
            "WHERE NOT EXISTS (SELECT 1 FROM \"public\".\"yellow_trips\" AS f \
             WHERE f.\"surrogate_key\" = encode("
        ));
        assert_eq!(sql.matches("sha256(").count(), 2);
    }

    #[test]
    fn update_sql_only_touches_changed_rows() {
        let sql = update_changed_sql("\"s\".\"stg\"", "\"s\".\"fin\"", &plan())
            .unwrap()
            .expect("statement");
        assert!(sql.contains(
            "SET \"VendorID\" = s.\"VendorID\", \"TOTAL_AMOUNT\" = s.\"total_amount\", \
             \"update_time\" = now()"
        ));
        assert!(sql.ends_with(
            "ROW(f.\"VendorID\", f.\"TOTAL_AMOUNT\") IS DISTINCT FROM \
             ROW(s.\"VendorID\", s.\"total_amount\")"
        ));

        let empty = MergePlan {
            columns: Vec::new(),
            ..plan()
        };
        assert!(update_changed_sql("a", "b", &empty).unwrap().is_none());
    }
}
