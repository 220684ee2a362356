use super::{NamespaceService, ProviderService, Repository, TemplateService, Txn};
use chrono::{DateTime, Utc};
use models::{ErrorKind, Namespace, Provider, Rule, RuleFilter, RuleVariable, Template, Variable};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use std::collections::BTreeMap;

/// PgStore is the Postgres store of Rules, and of the Templates, Namespaces
/// and Providers they reference.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

pub struct PgTxn {
    txn: sqlx::Transaction<'static, Postgres>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> models::Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self { pool })
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> models::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| models::Error::new(ErrorKind::Internal, err))
    }

    /// Insert or replace the Template having `template.name`, returning its id.
    pub async fn upsert_template(&self, template: &Template) -> models::Result<u64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into templates (name, body, tags, variables)
            values ($1, $2, $3, $4)
            on conflict (name) do update set
                body = $2,
                tags = $3,
                variables = $4,
                updated_at = now()
            returning id
            "#,
        )
        .bind(&template.name)
        .bind(&template.body)
        .bind(&template.tags)
        .bind(Json(&template.variables))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(id as u64)
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    name: String,
    namespace: String,
    group_name: String,
    template: String,
    enabled: bool,
    variables: Json<Vec<RuleVariable>>,
    provider_namespace: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RuleRow> for Rule {
    fn from(row: RuleRow) -> Self {
        Rule {
            id: row.id as u64,
            name: row.name,
            enabled: row.enabled,
            group_name: row.group_name,
            namespace: row.namespace,
            template: row.template,
            variables: row.variables.0,
            provider_namespace: row.provider_namespace as u64,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        }
    }
}

async fn list_rules<'c, E>(executor: E, filter: &RuleFilter) -> models::Result<Vec<Rule>>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let rows: Vec<RuleRow> = sqlx::query_as(
        r#"
        select id, name, namespace, group_name, template, enabled, variables,
            provider_namespace, created_at, updated_at
        from rules
        where ($1::text is null or name = $1)
            and ($2::text is null or namespace = $2)
            and ($3::text is null or group_name = $3)
            and ($4::text is null or template = $4)
            and ($5::bigint is null or provider_namespace = $5)
        order by id
        "#,
    )
    .bind(filter.name.as_deref())
    .bind(filter.namespace.as_deref())
    .bind(filter.group_name.as_deref())
    .bind(filter.template.as_deref())
    .bind(filter.provider_namespace.map(|id| id as i64))
    .fetch_all(executor)
    .await
    .map_err(db_error)?;

    Ok(rows.into_iter().map(Rule::from).collect())
}

#[async_trait::async_trait]
impl Repository for PgStore {
    type Txn = PgTxn;

    async fn begin(&self) -> models::Result<PgTxn> {
        let txn = self.pool.begin().await.map_err(db_error)?;
        Ok(PgTxn { txn })
    }

    async fn list(&self, filter: &RuleFilter) -> models::Result<Vec<Rule>> {
        list_rules(&self.pool, filter).await
    }
}

#[async_trait::async_trait]
impl Txn for PgTxn {
    #[tracing::instrument(level = "debug", skip_all, fields(name = %rule.name), err(Display))]
    async fn upsert(&mut self, rule: &Rule) -> models::Result<Rule> {
        // Serialize transactions which upsert into the same Rule Group.
        sqlx::query("select pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!(
                "{}/{}/{}",
                rule.provider_namespace, rule.namespace, rule.group_name
            ))
            .execute(&mut *self.txn)
            .await
            .map_err(db_error)?;

        let row: RuleRow = sqlx::query_as(
            r#"
            insert into rules (
                name, namespace, group_name, template, enabled, variables, provider_namespace
            ) values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (name) do update set
                namespace = $2,
                group_name = $3,
                template = $4,
                enabled = $5,
                variables = $6,
                provider_namespace = $7,
                updated_at = now()
            returning id, name, namespace, group_name, template, enabled, variables,
                provider_namespace, created_at, updated_at
            "#,
        )
        .bind(&rule.name)
        .bind(&rule.namespace)
        .bind(&rule.group_name)
        .bind(&rule.template)
        .bind(rule.enabled)
        .bind(Json(&rule.variables))
        .bind(rule.provider_namespace as i64)
        .fetch_one(&mut *self.txn)
        .await
        .map_err(db_error)?;

        Ok(row.into())
    }

    async fn list(&mut self, filter: &RuleFilter) -> models::Result<Vec<Rule>> {
        list_rules(&mut *self.txn, filter).await
    }

    async fn commit(self) -> models::Result<()> {
        self.txn.commit().await.map_err(db_error)
    }

    async fn rollback(self) -> models::Result<()> {
        self.txn.rollback().await.map_err(db_error)
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: i64,
    name: String,
    body: String,
    tags: Vec<String>,
    variables: Json<Vec<Variable>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl TemplateService for PgStore {
    async fn get_by_name(&self, name: &str) -> models::Result<Template> {
        let row: Option<TemplateRow> = sqlx::query_as(
            r#"
            select id, name, body, tags, variables, created_at, updated_at
            from templates where name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Err(models::Error::not_found(format!("template {name:?} not found")));
        };
        Ok(Template {
            id: row.id as u64,
            name: row.name,
            body: row.body,
            tags: row.tags,
            variables: row.variables.0,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct NamespaceRow {
    provider_id: i64,
    urn: String,
    name: String,
    labels: Json<BTreeMap<String, String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl NamespaceService for PgStore {
    async fn get(&self, id: u64) -> models::Result<Namespace> {
        let row: Option<NamespaceRow> = sqlx::query_as(
            r#"
            select provider_id, urn, name, labels, created_at, updated_at
            from namespaces where id = $1
            "#,
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Err(models::Error::not_found(format!("namespace {id} not found")));
        };
        Ok(Namespace {
            id,
            urn: row.urn,
            name: row.name,
            provider: row.provider_id as u64,
            labels: row.labels.0,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    urn: String,
    host: String,
    name: String,
    #[sqlx(rename = "type")]
    type_: String,
    credentials: Json<BTreeMap<String, serde_json::Value>>,
    labels: Json<BTreeMap<String, String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl ProviderService for PgStore {
    async fn get(&self, id: u64) -> models::Result<Provider> {
        let row: Option<ProviderRow> = sqlx::query_as(
            r#"
            select urn, host, name, type, credentials, labels, created_at, updated_at
            from providers where id = $1
            "#,
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Err(models::Error::not_found(format!("provider {id} not found")));
        };
        Ok(Provider {
            id,
            urn: row.urn,
            host: row.host,
            name: row.name,
            type_: row.type_,
            credentials: row.credentials.0,
            labels: row.labels.0,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

/// Classify a Postgres SQLSTATE error code.
fn kind_of_code(code: Option<&str>) -> ErrorKind {
    match code {
        // unique_violation
        Some("23505") => ErrorKind::Conflict,
        // foreign_key_violation
        Some("23503") => ErrorKind::Relation,
        // connection_exception class
        Some(code) if code.starts_with("08") => ErrorKind::Unavailable,
        _ => ErrorKind::Internal,
    }
}

fn db_error(err: sqlx::Error) -> models::Error {
    let kind = match &err {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db) => kind_of_code(db.code().as_deref()),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ErrorKind::Unavailable
        }
        _ => ErrorKind::Internal,
    };
    models::Error::new(kind, err)
}
