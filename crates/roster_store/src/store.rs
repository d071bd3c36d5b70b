use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{LevelFilter, debug};
use sea_orm::sea_query;
use sea_orm::sea_query::{
    ConditionalStatement, Expr, ExprTrait, MysqlQueryBuilder, PostgresQueryBuilder, Query,
    QueryStatementWriter, SelectStatement, SqliteQueryBuilder,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
    Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use time::{Date, PrimitiveDateTime};

use crate::StoreConfig;
use crate::db::*;
use crate::migration::Migrator;
use roster_core::{
    AffiliationApi, AffiliationChanges, IdentityId, IdentityLookup, IdentityLookupApi, OrgId,
    Organization, OrganizationApi, Profile, RosterError, RosterResult, StoredAffiliation,
};

/// Identity store backed by a relational database through sea-orm.
#[derive(Clone)]
pub struct IdentityDb {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    origin: String,
}

impl IdentityDb {
    pub async fn connect(config: &StoreConfig, base_dir: &Path) -> RosterResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        options
            .sqlx_logging(config.sql_trace())
            .sqlx_logging_level(LevelFilter::Debug)
            .map_sqlx_sqlite_opts(|opts| opts.with_regexp());
        let conn = Database::connect(options).await.map_err(RosterError::from)?;
        let backend = conn.get_database_backend();
        debug!("connected to {} identity store", config.backend_name());
        Ok(Self {
            conn,
            backend,
            origin: config.origin().to_string(),
        })
    }

    pub async fn connect_sqlite(path: &Path) -> RosterResult<Self> {
        let config = StoreConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new("."))).await
    }

    /// Create the identity tables when absent. Existing tables are left as they are.
    pub async fn provision(&self) -> RosterResult<()> {
        Migrator::up(&self.conn, None)
            .await
            .map_err(RosterError::from)
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub async fn add_identity(&self, uuid: &str) -> RosterResult<()> {
        let insert = Query::insert()
            .into_table(Uidentities::Table)
            .columns([Uidentities::Uuid])
            .values_panic([uuid.into()])
            .to_owned();
        exec(&self.conn, &insert).await
    }

    pub async fn add_profile(&self, uuid: &str, name: &str, is_bot: Option<bool>) -> RosterResult<()> {
        let insert = Query::insert()
            .into_table(Profiles::Table)
            .columns([Profiles::Uuid, Profiles::Name, Profiles::IsBot])
            .values_panic([uuid.into(), name.into(), is_bot.into()])
            .to_owned();
        exec(&self.conn, &insert).await
    }

    /// Register `username` on `source` as an alias of identity `uuid`.
    pub async fn add_alias(
        &self,
        alias_id: &str,
        uuid: &str,
        source: &str,
        username: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> RosterResult<()> {
        let insert = Query::insert()
            .into_table(Identities::Table)
            .columns([
                Identities::Id,
                Identities::Uuid,
                Identities::Source,
                Identities::Username,
                Identities::Email,
                Identities::Name,
            ])
            .values_panic([
                alias_id.into(),
                uuid.into(),
                source.into(),
                username.into(),
                email.map(str::to_string).into(),
                name.map(str::to_string).into(),
            ])
            .to_owned();
        exec(&self.conn, &insert).await
    }

    pub async fn add_organization(&self, name: &str) -> RosterResult<OrgId> {
        let insert = Query::insert()
            .into_table(Organizations::Table)
            .columns([Organizations::Name])
            .values_panic([name.into()])
            .to_owned();
        exec(&self.conn, &insert).await?;
        let select = Query::select()
            .column(Organizations::Id)
            .from(Organizations::Table)
            .and_where(Expr::col(Organizations::Name).eq(name))
            .limit(1)
            .to_owned();
        let row = query_one(&self.conn, &select)
            .await?
            .ok_or_else(|| RosterError::not_found(format!("organization '{name}' after insert")))?;
        Ok(OrgId(row.try_get("", &col_name(Organizations::Id))?))
    }

    pub async fn add_affiliation(
        &self,
        uuid: &str,
        org_id: OrgId,
        start: Date,
        end: Date,
        project_scope: Option<&str>,
    ) -> RosterResult<()> {
        exec(
            &self.conn,
            &enrollment_insert(uuid, org_id, start, end, project_scope),
        )
        .await
    }
}

fn lookup_select(lookup: &IdentityLookup<'_>) -> SelectStatement {
    if let IdentityLookup::Name { name } = *lookup {
        return Query::select()
            .distinct()
            .column(Profiles::Uuid)
            .from(Profiles::Table)
            .and_where(Expr::col(Profiles::Name).eq(name))
            .limit(2)
            .to_owned();
    }
    let mut select = Query::select()
        .distinct()
        .column(Identities::Uuid)
        .from(Identities::Table)
        .limit(2)
        .to_owned();
    let (name, source, username, email) = match *lookup {
        IdentityLookup::Name { .. } => (None, None, None, None),
        IdentityLookup::SourceUsername { source, username } => {
            (None, Some(source), Some(username), None)
        }
        IdentityLookup::Email { email } => (None, None, None, Some(email)),
        IdentityLookup::NameSourceUsername {
            name,
            source,
            username,
        } => (Some(name), Some(source), Some(username), None),
        IdentityLookup::NameEmail { name, email } => (Some(name), None, None, Some(email)),
        IdentityLookup::SourceUsernameEmail {
            source,
            username,
            email,
        } => (None, Some(source), Some(username), Some(email)),
        IdentityLookup::Full {
            name,
            source,
            username,
            email,
        } => (Some(name), Some(source), Some(username), Some(email)),
    };
    if let Some(name) = name {
        select.and_where(Expr::col(Identities::Name).eq(name));
    }
    if let Some(source) = source {
        select.and_where(Expr::col(Identities::Source).eq(source));
    }
    if let Some(username) = username {
        select.and_where(Expr::col(Identities::Username).eq(username));
    }
    if let Some(email) = email {
        select.and_where(Expr::col(Identities::Email).eq(email));
    }
    select
}

fn scoped<S: ConditionalStatement>(stmt: &mut S, project_scope: Option<&str>) {
    match project_scope {
        Some(scope) => stmt.and_where(Expr::col(Enrollments::ProjectSlug).eq(scope)),
        None => stmt.and_where(Expr::col(Enrollments::ProjectSlug).is_null()),
    };
}

fn enrollment_insert(
    uuid: &str,
    org_id: OrgId,
    start: Date,
    end: Date,
    project_scope: Option<&str>,
) -> sea_query::InsertStatement {
    Query::insert()
        .into_table(Enrollments::Table)
        .columns([
            Enrollments::Uuid,
            Enrollments::OrganizationId,
            Enrollments::Start,
            Enrollments::End,
            Enrollments::ProjectSlug,
        ])
        .values_panic([
            uuid.into(),
            org_id.0.into(),
            start.midnight().into(),
            end.midnight().into(),
            project_scope.map(str::to_string).into(),
        ])
        .to_owned()
}

#[async_trait]
impl IdentityLookupApi for IdentityDb {
    async fn find_identities(
        &self,
        lookup: &IdentityLookup<'_>,
    ) -> RosterResult<Vec<IdentityId>> {
        let rows = query_all(&self.conn, &lookup_select(lookup)).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let uuid: String = row.try_get("", &col_name(Identities::Uuid))?;
            ids.push(IdentityId::new(uuid));
        }
        Ok(ids)
    }
}

#[async_trait]
impl OrganizationApi for IdentityDb {
    async fn list_organizations(&self) -> RosterResult<Vec<Organization>> {
        let select = Query::select()
            .columns([Organizations::Id, Organizations::Name])
            .from(Organizations::Table)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut organizations = Vec::with_capacity(rows.len());
        for row in rows {
            organizations.push(Organization {
                id: OrgId(row.try_get("", &col_name(Organizations::Id))?),
                name: row.try_get("", &col_name(Organizations::Name))?,
            });
        }
        Ok(organizations)
    }

    async fn matches_pattern(&self, value: &str, pattern: &str) -> RosterResult<bool> {
        let sql = match self.backend {
            DatabaseBackend::Postgres => {
                "SELECT CAST(CASE WHEN $1 ~ $2 THEN 1 ELSE 0 END AS BIGINT) AS matched"
            }
            DatabaseBackend::MySql => "SELECT CAST(? REGEXP ? AS SIGNED) AS matched",
            _ => "SELECT ? REGEXP ? AS matched",
        };
        let row = self
            .conn
            .query_one_raw(Statement::from_sql_and_values(
                self.backend,
                sql,
                [value.into(), pattern.into()],
            ))
            .await?;
        let matched: i64 = match row {
            Some(row) => row.try_get("", "matched")?,
            None => 0,
        };
        Ok(matched > 0)
    }
}

#[async_trait]
impl AffiliationApi for IdentityDb {
    async fn identity_exists(&self, identity: &IdentityId) -> RosterResult<bool> {
        let select = Query::select()
            .column(Uidentities::Uuid)
            .from(Uidentities::Table)
            .and_where(Expr::col(Uidentities::Uuid).eq(identity.as_str()))
            .limit(1)
            .to_owned();
        Ok(query_one(&self.conn, &select).await?.is_some())
    }

    async fn fetch_profile(&self, identity: &IdentityId) -> RosterResult<Option<Profile>> {
        let select = Query::select()
            .columns([Profiles::Name, Profiles::IsBot])
            .from(Profiles::Table)
            .and_where(Expr::col(Profiles::Uuid).eq(identity.as_str()))
            .limit(1)
            .to_owned();
        let Some(row) = query_one(&self.conn, &select).await? else {
            return Ok(None);
        };
        let name: Option<String> = row.try_get("", &col_name(Profiles::Name))?;
        let is_bot: Option<bool> = row.try_get("", &col_name(Profiles::IsBot))?;
        Ok(Some(Profile {
            name: name.unwrap_or_default(),
            is_bot,
        }))
    }

    async fn fetch_alias_email(
        &self,
        identity: &IdentityId,
        source: &str,
        username: &str,
    ) -> RosterResult<Option<String>> {
        let select = Query::select()
            .column(Identities::Email)
            .from(Identities::Table)
            .and_where(Expr::col(Identities::Uuid).eq(identity.as_str()))
            .and_where(Expr::col(Identities::Source).eq(source))
            .and_where(Expr::col(Identities::Username).eq(username))
            .and_where(Expr::col(Identities::Email).is_not_null())
            .limit(1)
            .to_owned();
        match query_one(&self.conn, &select).await? {
            Some(row) => Ok(row.try_get("", &col_name(Identities::Email))?),
            None => Ok(None),
        }
    }

    async fn list_affiliations(
        &self,
        identity: &IdentityId,
        project_scope: Option<&str>,
    ) -> RosterResult<Vec<StoredAffiliation>> {
        let mut select = Query::select()
            .columns([
                Enrollments::OrganizationId,
                Enrollments::Start,
                Enrollments::End,
                Enrollments::ProjectSlug,
            ])
            .from(Enrollments::Table)
            .and_where(Expr::col(Enrollments::Uuid).eq(identity.as_str()))
            .to_owned();
        scoped(&mut select, project_scope);
        let rows = query_all(&self.conn, &select).await?;
        let mut affiliations = Vec::with_capacity(rows.len());
        for row in rows {
            affiliations.push(StoredAffiliation {
                org_id: OrgId(row.try_get("", &col_name(Enrollments::OrganizationId))?),
                start: read_date(&row, Enrollments::Start)?,
                end: read_date(&row, Enrollments::End)?,
                project_scope: row.try_get("", &col_name(Enrollments::ProjectSlug))?,
            });
        }
        Ok(affiliations)
    }

    async fn apply_affiliation_changes(&self, changes: &AffiliationChanges) -> RosterResult<()> {
        let scope = changes.project_scope.as_deref();
        let tx = self.conn.begin().await?;
        if self.backend == DatabaseBackend::MySql {
            tx.execute_raw(Statement::from_sql_and_values(
                DatabaseBackend::MySql,
                "SET @origin = ?",
                [self.origin.as_str().into()],
            ))
            .await?;
        }
        if changes.delete_existing {
            let mut delete = Query::delete()
                .from_table(Enrollments::Table)
                .and_where(Expr::col(Enrollments::Uuid).eq(changes.identity.as_str()))
                .to_owned();
            scoped(&mut delete, scope);
            exec(&tx, &delete).await?;
        }
        for insert in &changes.inserts {
            let stmt = enrollment_insert(
                changes.identity.as_str(),
                insert.org_id,
                insert.start,
                insert.end,
                scope,
            );
            exec(&tx, &stmt).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn read_date(row: &QueryResult, column: impl sea_query::Iden) -> RosterResult<Date> {
    let name = col_name(column);
    if let Ok(value) = row.try_get::<PrimitiveDateTime>("", &name) {
        return Ok(value.date());
    }
    let value: Date = row.try_get("", &name)?;
    Ok(value)
}

fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

async fn exec<C, S>(conn: &C, stmt: &S) -> RosterResult<()>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.execute_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> RosterResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> RosterResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}

fn build_connection_url(config: &StoreConfig, base_dir: &Path) -> RosterResult<String> {
    match &config.database {
        crate::DatabaseConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        crate::DatabaseConfig::Postgres { url } => Ok(url.clone()),
        crate::DatabaseConfig::Mysql { url } => Ok(url.clone()),
    }
}
