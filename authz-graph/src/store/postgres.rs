//! PostgreSQL-backed graph store
//!
//! One database per tenant. Each entity has its own table (see
//! `migrations/`), with:
//! - unique constraints backing the create-if-not-exists semantics
//! - foreign keys so edges can never reference missing objects or types
//! - cascading deletes executed inside a single transaction
//! - optimistic concurrency through the `version` column

use crate::{
    error::{GraphError, Result},
    models::*,
    pagination::{Bound, FilterValue, Filterable, Page, Paginator, SortKey},
    region::{classify_sqlx_error, is_foreign_key_violation, is_unique_violation},
    store::{check_edge_endpoints, missing_reference, organization_group, GraphStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

const OBJECT_TYPE_COLUMNS: &str = "id, created, updated, version, type_name";
const EDGE_TYPE_COLUMNS: &str = "id, created, updated, version, type_name, \
     source_object_type_id, target_object_type_id, attributes, organization_id";
const OBJECT_COLUMNS: &str = "id, created, updated, version, alias, type_id, organization_id";
const EDGE_COLUMNS: &str =
    "id, created, updated, version, edge_type_id, source_object_id, target_object_id";
const ORGANIZATION_COLUMNS: &str = "id, created, updated, version, name, region";

/// Attach context to a storage error, keeping region conflicts intact
fn db_error(context: &str, err: sqlx::Error) -> GraphError {
    if is_foreign_key_violation(&err) {
        return GraphError::InvalidEdge(format!("{}: referenced entity does not exist", context));
    }
    match classify_sqlx_error(err) {
        GraphError::StorageError(msg) => GraphError::StorageError(format!("{}: {}", context, msg)),
        other => other,
    }
}

/// Build the conflict error for a failed insert/save from the row that won
fn conflict<T: Entity>(existing: Option<T>, incoming: &T) -> GraphError {
    match existing {
        Some(existing) => GraphError::Conflict {
            id: existing.id(),
            identical: existing.equals_ignoring_id(incoming),
        },
        None => GraphError::StorageError(format!(
            "unique constraint violated by {} {} but no conflicting row was found",
            T::KIND,
            incoming.id()
        )),
    }
}

enum BindValue {
    Uuid(Uuid),
    Text(String),
    Time(DateTime<Utc>),
}

impl From<FilterValue> for BindValue {
    fn from(value: FilterValue) -> Self {
        match value {
            FilterValue::Uuid(u) => BindValue::Uuid(u),
            FilterValue::Text(s) => BindValue::Text(s),
        }
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: Vec<BindValue>,
) -> Query<'q, Postgres, PgArguments> {
    for bind in binds {
        query = match bind {
            BindValue::Uuid(u) => query.bind(u),
            BindValue::Text(s) => query.bind(s),
            BindValue::Time(t) => query.bind(t),
        };
    }
    query
}

/// Render a paginated `SELECT` for one table
fn list_sql(table: &str, columns: &str, paginator: &Paginator) -> Result<(String, Vec<BindValue>)> {
    let mut clauses = Vec::new();
    let mut binds: Vec<BindValue> = Vec::new();

    if let Some(filter) = paginator.filter() {
        let mut filter_binds = Vec::new();
        clauses.push(filter.to_sql(&mut filter_binds, 1));
        binds.extend(filter_binds.into_iter().map(BindValue::from));
    }

    let (cmp, direction, value) = match paginator.bound()? {
        Bound::Forward(v) => (">", "ASC", v),
        Bound::Backward(v) => ("<", "DESC", v),
    };

    if let Some(value) = value {
        match (paginator.sort_key(), value.created) {
            (SortKey::Id, _) => {
                binds.push(BindValue::Uuid(value.id));
                clauses.push(format!("id {} ${}", cmp, binds.len()));
            }
            (SortKey::Created, Some(created)) => {
                binds.push(BindValue::Time(created));
                binds.push(BindValue::Uuid(value.id));
                clauses.push(format!(
                    "(created, id) {} (${}, ${})",
                    cmp,
                    binds.len() - 1,
                    binds.len()
                ));
            }
            (SortKey::Created, None) => {
                return Err(GraphError::ValidationError(
                    "cursor is missing its creation time".to_string(),
                ))
            }
        }
    }

    let order = match paginator.sort_key() {
        SortKey::Id => format!("id {}", direction),
        SortKey::Created => format!("created {d}, id {d}", d = direction),
    };
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {}",
        columns,
        table,
        where_clause,
        order,
        paginator.limit() + 1
    );
    Ok((sql, binds))
}

// =============================================================================
// Row mapping
// =============================================================================

fn base_from_row(row: &PgRow) -> std::result::Result<BaseModel, sqlx::Error> {
    Ok(BaseModel {
        id: row.try_get("id")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        version: row.try_get("version")?,
    })
}

fn object_type_from_row(row: &PgRow) -> std::result::Result<ObjectType, sqlx::Error> {
    Ok(ObjectType {
        base: base_from_row(row)?,
        type_name: row.try_get("type_name")?,
    })
}

fn edge_type_from_row(row: &PgRow) -> std::result::Result<EdgeType, sqlx::Error> {
    let Json(attributes): Json<Vec<Attribute>> = row.try_get("attributes")?;
    Ok(EdgeType {
        base: base_from_row(row)?,
        type_name: row.try_get("type_name")?,
        source_object_type_id: row.try_get("source_object_type_id")?,
        target_object_type_id: row.try_get("target_object_type_id")?,
        attributes,
        organization_id: row.try_get("organization_id")?,
    })
}

fn object_from_row(row: &PgRow) -> std::result::Result<Object, sqlx::Error> {
    Ok(Object {
        base: base_from_row(row)?,
        alias: row.try_get("alias")?,
        type_id: row.try_get("type_id")?,
        organization_id: row.try_get("organization_id")?,
    })
}

fn edge_from_row(row: &PgRow) -> std::result::Result<Edge, sqlx::Error> {
    Ok(Edge {
        base: base_from_row(row)?,
        edge_type_id: row.try_get("edge_type_id")?,
        source_object_id: row.try_get("source_object_id")?,
        target_object_id: row.try_get("target_object_id")?,
    })
}

fn organization_from_row(row: &PgRow) -> std::result::Result<Organization, sqlx::Error> {
    Ok(Organization {
        base: base_from_row(row)?,
        name: row.try_get("name")?,
        region: row.try_get("region")?,
    })
}

/// PostgreSQL-backed graph store
pub struct PostgresGraphStore {
    pool: PgPool,
}

impl PostgresGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create with connection string
    pub async fn from_connection_string(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| GraphError::StorageError(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GraphError::StorageError(format!("Failed to run migrations: {}", e)))?;
        info!("Graph schema migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_by_id<T>(
        &self,
        table: &str,
        columns: &str,
        id: Uuid,
        map: fn(&PgRow) -> std::result::Result<T, sqlx::Error>,
    ) -> Result<T>
    where
        T: Entity,
    {
        let sql = format!("SELECT {} FROM {} WHERE id = $1", columns, table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(&format!("Failed to read {} {}", T::KIND, id), e))?
            .ok_or_else(|| GraphError::not_found(T::KIND, id))?;
        map(&row).map_err(|e| db_error(&format!("Failed to decode {}", T::KIND), e))
    }

    async fn list<T>(
        &self,
        table: &str,
        columns: &str,
        paginator: &Paginator,
        map: fn(&PgRow) -> std::result::Result<T, sqlx::Error>,
    ) -> Result<Page<T>>
    where
        T: Filterable,
    {
        paginator.validate::<T>()?;
        let (sql, binds) = list_sql(table, columns, paginator)?;
        debug!("Listing {}: {}", table, sql);

        let rows = bind_all(sqlx::query(&sql), binds)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(&format!("Failed to list {}", table), e))?;

        let window = rows
            .iter()
            .map(map)
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(|e| db_error(&format!("Failed to decode {}", table), e))?;
        paginator.finish(window)
    }

    /// Rejects a save whose version no longer matches, or whose row is gone
    async fn save_miss<T: Entity>(
        &self,
        table: &str,
        columns: &str,
        entity: &T,
        map: fn(&PgRow) -> std::result::Result<T, sqlx::Error>,
    ) -> GraphError {
        match self.fetch_one_by_id(table, columns, entity.id(), map).await {
            Ok(stored) => GraphError::PreconditionFailed(format!(
                "{} {} was modified concurrently (expected version {}, found {})",
                T::KIND,
                entity.id(),
                entity.base().version,
                stored.base().version
            )),
            Err(e) => e,
        }
    }

    async fn check_edge(&self, edge: &Edge) -> Result<()> {
        let edge_type = self
            .get_edge_type(edge.edge_type_id)
            .await
            .map_err(|e| missing_reference(e, "edge type"))?;
        let source = self
            .get_object(edge.source_object_id)
            .await
            .map_err(|e| missing_reference(e, "source object"))?;
        let target = self
            .get_object(edge.target_object_id)
            .await
            .map_err(|e| missing_reference(e, "target object"))?;
        check_edge_endpoints(edge, &edge_type, &source, &target)
    }

    async fn check_organization(&self, organization_id: Uuid) -> Result<()> {
        if !organization_id.is_nil() {
            self.get_organization(organization_id)
                .await
                .map_err(|e| missing_reference(e, "organization"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    // -------------------------------------------------------------------------
    // Object types
    // -------------------------------------------------------------------------

    async fn get_object_type(&self, id: Uuid) -> Result<ObjectType> {
        self.fetch_one_by_id("object_types", OBJECT_TYPE_COLUMNS, id, object_type_from_row)
            .await
    }

    async fn get_object_type_by_name(&self, type_name: &str) -> Result<ObjectType> {
        let sql = format!("SELECT {} FROM object_types WHERE type_name = $1", OBJECT_TYPE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(type_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to read object type by name", e))?
            .ok_or_else(|| GraphError::not_found(ObjectType::KIND, type_name))?;
        object_type_from_row(&row).map_err(|e| db_error("Failed to decode object type", e))
    }

    async fn insert_object_type(&self, object_type: &ObjectType) -> Result<()> {
        object_type.validate()?;
        debug!("Inserting object type {}", object_type.type_name);

        let result = sqlx::query(
            r#"
            INSERT INTO object_types (id, created, updated, version, type_name)
            VALUES ($1, $2, $3, 0, $4)
            "#,
        )
        .bind(object_type.base.id)
        .bind(object_type.base.created)
        .bind(object_type.base.updated)
        .bind(&object_type.type_name)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("Object type {} created", object_type.type_name);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                let existing = match self.get_object_type(object_type.base.id).await {
                    Ok(found) => Some(found),
                    Err(_) => self.get_object_type_by_name(&object_type.type_name).await.ok(),
                };
                Err(conflict(existing, object_type))
            }
            Err(e) => Err(db_error("Failed to insert object type", e)),
        }
    }

    async fn save_object_type(&self, object_type: &ObjectType) -> Result<ObjectType> {
        object_type.validate()?;
        let sql = format!(
            "UPDATE object_types SET type_name = $3, updated = NOW(), version = version + 1 \
             WHERE id = $1 AND version = $2 RETURNING {}",
            OBJECT_TYPE_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(object_type.base.id)
            .bind(object_type.base.version)
            .bind(&object_type.type_name)
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => {
                object_type_from_row(&row).map_err(|e| db_error("Failed to decode object type", e))
            }
            Ok(None) => Err(self
                .save_miss("object_types", OBJECT_TYPE_COLUMNS, object_type, object_type_from_row)
                .await),
            Err(e) if is_unique_violation(&e) => Err(conflict(
                self.get_object_type_by_name(&object_type.type_name).await.ok(),
                object_type,
            )),
            Err(e) => Err(db_error("Failed to save object type", e)),
        }
    }

    async fn delete_object_type(&self, id: Uuid) -> Result<()> {
        debug!("Deleting object type {} with cascade", id);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let edges = sqlx::query(
            r#"
            DELETE FROM edges
            WHERE edge_type_id IN (
                    SELECT id FROM edge_types
                    WHERE source_object_type_id = $1 OR target_object_type_id = $1)
               OR source_object_id IN (SELECT id FROM objects WHERE type_id = $1)
               OR target_object_id IN (SELECT id FROM objects WHERE type_id = $1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to delete edges of object type", e))?;

        let edge_types = sqlx::query(
            "DELETE FROM edge_types WHERE source_object_type_id = $1 OR target_object_type_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to delete edge types of object type", e))?;

        let objects = sqlx::query("DELETE FROM objects WHERE type_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete objects of object type", e))?;

        let deleted = sqlx::query("DELETE FROM object_types WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete object type", e))?;

        if deleted.rows_affected() == 0 {
            // dropping the transaction rolls back the cascade
            return Err(GraphError::not_found(ObjectType::KIND, id));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        info!(
            "Deleted object type {} with {} edge types, {} objects, {} edges",
            id,
            edge_types.rows_affected(),
            objects.rows_affected(),
            edges.rows_affected()
        );
        Ok(())
    }

    async fn list_object_types(&self, paginator: &Paginator) -> Result<Page<ObjectType>> {
        self.list("object_types", OBJECT_TYPE_COLUMNS, paginator, object_type_from_row)
            .await
    }

    // -------------------------------------------------------------------------
    // Edge types
    // -------------------------------------------------------------------------

    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        self.fetch_one_by_id("edge_types", EDGE_TYPE_COLUMNS, id, edge_type_from_row)
            .await
    }

    async fn get_edge_type_by_name(&self, type_name: &str, organization_id: Uuid) -> Result<EdgeType> {
        let sql = format!(
            "SELECT {} FROM edge_types WHERE type_name = $1 AND organization_id = $2",
            EDGE_TYPE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(type_name)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to read edge type by name", e))?
            .ok_or_else(|| GraphError::not_found(EdgeType::KIND, type_name))?;
        edge_type_from_row(&row).map_err(|e| db_error("Failed to decode edge type", e))
    }

    async fn insert_edge_type(&self, edge_type: &EdgeType) -> Result<()> {
        edge_type.validate()?;
        self.check_organization(edge_type.organization_id).await?;
        debug!("Inserting edge type {}", edge_type.type_name);

        let result = sqlx::query(
            r#"
            INSERT INTO edge_types (
                id, created, updated, version, type_name,
                source_object_type_id, target_object_type_id, attributes, organization_id
            ) VALUES ($1, $2, $3, 0, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(edge_type.base.id)
        .bind(edge_type.base.created)
        .bind(edge_type.base.updated)
        .bind(&edge_type.type_name)
        .bind(edge_type.source_object_type_id)
        .bind(edge_type.target_object_type_id)
        .bind(Json(&edge_type.attributes))
        .bind(edge_type.organization_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("Edge type {} created", edge_type.type_name);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                let existing = match self.get_edge_type(edge_type.base.id).await {
                    Ok(found) => Some(found),
                    Err(_) => self
                        .get_edge_type_by_name(&edge_type.type_name, edge_type.organization_id)
                        .await
                        .ok(),
                };
                Err(conflict(existing, edge_type))
            }
            Err(e) => Err(db_error("Failed to insert edge type", e)),
        }
    }

    async fn save_edge_type(&self, edge_type: &EdgeType) -> Result<EdgeType> {
        edge_type.validate()?;
        let stored = self.get_edge_type(edge_type.base.id).await?;
        if stored.source_object_type_id != edge_type.source_object_type_id
            || stored.target_object_type_id != edge_type.target_object_type_id
        {
            return Err(GraphError::ValidationError(format!(
                "edge type {} cannot change its source or target object type",
                edge_type.type_name
            )));
        }
        self.check_organization(edge_type.organization_id).await?;

        let sql = format!(
            "UPDATE edge_types SET type_name = $3, attributes = $4, organization_id = $5, \
             updated = NOW(), version = version + 1 \
             WHERE id = $1 AND version = $2 RETURNING {}",
            EDGE_TYPE_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(edge_type.base.id)
            .bind(edge_type.base.version)
            .bind(&edge_type.type_name)
            .bind(Json(&edge_type.attributes))
            .bind(edge_type.organization_id)
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => {
                edge_type_from_row(&row).map_err(|e| db_error("Failed to decode edge type", e))
            }
            Ok(None) => Err(self
                .save_miss("edge_types", EDGE_TYPE_COLUMNS, edge_type, edge_type_from_row)
                .await),
            Err(e) if is_unique_violation(&e) => Err(conflict(
                self.get_edge_type_by_name(&edge_type.type_name, edge_type.organization_id)
                    .await
                    .ok(),
                edge_type,
            )),
            Err(e) => Err(db_error("Failed to save edge type", e)),
        }
    }

    async fn delete_edge_type(&self, id: Uuid) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let edges = sqlx::query("DELETE FROM edges WHERE edge_type_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete edges of edge type", e))?;

        let deleted = sqlx::query("DELETE FROM edge_types WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete edge type", e))?;

        if deleted.rows_affected() == 0 {
            return Err(GraphError::not_found(EdgeType::KIND, id));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        info!("Deleted edge type {} and {} edges", id, edges.rows_affected());
        Ok(())
    }

    async fn list_edge_types(&self, paginator: &Paginator) -> Result<Page<EdgeType>> {
        self.list("edge_types", EDGE_TYPE_COLUMNS, paginator, edge_type_from_row)
            .await
    }

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    async fn get_object(&self, id: Uuid) -> Result<Object> {
        self.fetch_one_by_id("objects", OBJECT_COLUMNS, id, object_from_row)
            .await
    }

    async fn get_object_by_alias(&self, type_id: Uuid, alias: &str, organization_id: Uuid) -> Result<Object> {
        let sql = format!(
            "SELECT {} FROM objects WHERE type_id = $1 AND alias = $2 AND organization_id = $3",
            OBJECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(type_id)
            .bind(alias)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to read object by alias", e))?
            .ok_or_else(|| GraphError::not_found(Object::KIND, alias))?;
        object_from_row(&row).map_err(|e| db_error("Failed to decode object", e))
    }

    async fn insert_object(&self, object: &Object) -> Result<()> {
        object.validate()?;
        self.get_object_type(object.type_id)
            .await
            .map_err(|e| missing_reference(e, "object type"))?;
        self.check_organization(object.organization_id).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO objects (id, created, updated, version, alias, type_id, organization_id)
            VALUES ($1, $2, $3, 0, $4, $5, $6)
            "#,
        )
        .bind(object.base.id)
        .bind(object.base.created)
        .bind(object.base.updated)
        .bind(&object.alias)
        .bind(object.type_id)
        .bind(object.organization_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Object {} created", object);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                let existing = match self.get_object(object.base.id).await {
                    Ok(found) => Some(found),
                    Err(_) => match &object.alias {
                        Some(alias) => self
                            .get_object_by_alias(object.type_id, alias, object.organization_id)
                            .await
                            .ok(),
                        None => None,
                    },
                };
                Err(conflict(existing, object))
            }
            Err(e) => Err(db_error("Failed to insert object", e)),
        }
    }

    async fn save_object(&self, object: &Object) -> Result<Object> {
        object.validate()?;
        let stored = self.get_object(object.base.id).await?;
        if stored.type_id != object.type_id {
            return Err(GraphError::ValidationError(format!(
                "object {} cannot change its type",
                object.base.id
            )));
        }
        self.check_organization(object.organization_id).await?;

        let sql = format!(
            "UPDATE objects SET alias = $3, organization_id = $4, updated = NOW(), \
             version = version + 1 WHERE id = $1 AND version = $2 RETURNING {}",
            OBJECT_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(object.base.id)
            .bind(object.base.version)
            .bind(&object.alias)
            .bind(object.organization_id)
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => object_from_row(&row).map_err(|e| db_error("Failed to decode object", e)),
            Ok(None) => Err(self
                .save_miss("objects", OBJECT_COLUMNS, object, object_from_row)
                .await),
            Err(e) if is_unique_violation(&e) => {
                let existing = match &object.alias {
                    Some(alias) => self
                        .get_object_by_alias(object.type_id, alias, object.organization_id)
                        .await
                        .ok(),
                    None => None,
                };
                Err(conflict(existing, object))
            }
            Err(e) => Err(db_error("Failed to save object", e)),
        }
    }

    async fn delete_object(&self, id: Uuid) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let edges = sqlx::query(
            "DELETE FROM edges WHERE source_object_id = $1 OR target_object_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to delete edges of object", e))?;

        let deleted = sqlx::query("DELETE FROM objects WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete object", e))?;

        if deleted.rows_affected() == 0 {
            return Err(GraphError::not_found(Object::KIND, id));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        info!("Deleted object {} and {} edges", id, edges.rows_affected());
        Ok(())
    }

    async fn list_objects(&self, paginator: &Paginator) -> Result<Page<Object>> {
        self.list("objects", OBJECT_COLUMNS, paginator, object_from_row)
            .await
    }

    // -------------------------------------------------------------------------
    // Edges
    // -------------------------------------------------------------------------

    async fn get_edge(&self, id: Uuid) -> Result<Edge> {
        self.fetch_one_by_id("edges", EDGE_COLUMNS, id, edge_from_row)
            .await
    }

    async fn find_edge(&self, edge_type_id: Uuid, source_object_id: Uuid, target_object_id: Uuid) -> Result<Edge> {
        let sql = format!(
            "SELECT {} FROM edges \
             WHERE edge_type_id = $1 AND source_object_id = $2 AND target_object_id = $3",
            EDGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(edge_type_id)
            .bind(source_object_id)
            .bind(target_object_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to find edge", e))?
            .ok_or_else(|| {
                GraphError::NotFound(format!(
                    "edge {} -[{}]-> {}",
                    source_object_id, edge_type_id, target_object_id
                ))
            })?;
        edge_from_row(&row).map_err(|e| db_error("Failed to decode edge", e))
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<()> {
        edge.validate()?;
        self.check_edge(edge).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO edges (
                id, created, updated, version, edge_type_id, source_object_id, target_object_id
            ) VALUES ($1, $2, $3, 0, $4, $5, $6)
            "#,
        )
        .bind(edge.base.id)
        .bind(edge.base.created)
        .bind(edge.base.updated)
        .bind(edge.edge_type_id)
        .bind(edge.source_object_id)
        .bind(edge.target_object_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Edge {} created", edge);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                let existing = match self.get_edge(edge.base.id).await {
                    Ok(found) => Some(found),
                    Err(_) => self
                        .find_edge(edge.edge_type_id, edge.source_object_id, edge.target_object_id)
                        .await
                        .ok(),
                };
                Err(conflict(existing, edge))
            }
            Err(e) => Err(db_error("Failed to insert edge", e)),
        }
    }

    async fn save_edge(&self, edge: &Edge) -> Result<Edge> {
        edge.validate()?;
        self.check_edge(edge).await?;

        let sql = format!(
            "UPDATE edges SET edge_type_id = $3, source_object_id = $4, target_object_id = $5, \
             updated = NOW(), version = version + 1 WHERE id = $1 AND version = $2 RETURNING {}",
            EDGE_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(edge.base.id)
            .bind(edge.base.version)
            .bind(edge.edge_type_id)
            .bind(edge.source_object_id)
            .bind(edge.target_object_id)
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => edge_from_row(&row).map_err(|e| db_error("Failed to decode edge", e)),
            Ok(None) => Err(self.save_miss("edges", EDGE_COLUMNS, edge, edge_from_row).await),
            Err(e) if is_unique_violation(&e) => Err(conflict(
                self.find_edge(edge.edge_type_id, edge.source_object_id, edge.target_object_id)
                    .await
                    .ok(),
                edge,
            )),
            Err(e) => Err(db_error("Failed to save edge", e)),
        }
    }

    async fn delete_edge(&self, id: Uuid) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM edges WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete edge", e))?;
        if deleted.rows_affected() == 0 {
            return Err(GraphError::not_found(Edge::KIND, id));
        }
        debug!("Deleted edge {}", id);
        Ok(())
    }

    async fn delete_edges_for_object(&self, object_id: Uuid) -> Result<u64> {
        self.get_object(object_id).await?;
        let deleted = sqlx::query(
            "DELETE FROM edges WHERE source_object_id = $1 OR target_object_id = $1",
        )
        .bind(object_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to delete edges of object", e))?;
        info!("Deleted {} edges on object {}", deleted.rows_affected(), object_id);
        Ok(deleted.rows_affected())
    }

    async fn list_edges(&self, paginator: &Paginator) -> Result<Page<Edge>> {
        self.list("edges", EDGE_COLUMNS, paginator, edge_from_row)
            .await
    }

    // -------------------------------------------------------------------------
    // Organizations
    // -------------------------------------------------------------------------

    async fn get_organization(&self, id: Uuid) -> Result<Organization> {
        self.fetch_one_by_id("organizations", ORGANIZATION_COLUMNS, id, organization_from_row)
            .await
    }

    async fn insert_organization(&self, organization: &Organization) -> Result<()> {
        organization.validate()?;
        let group = organization_group(organization);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO organizations (id, created, updated, version, name, region)
            VALUES ($1, $2, $3, 0, $4, $5)
            "#,
        )
        .bind(organization.base.id)
        .bind(organization.base.created)
        .bind(organization.base.updated)
        .bind(&organization.name)
        .bind(&organization.region)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            drop(tx);
            if is_unique_violation(&e) {
                let existing = self.get_organization(organization.base.id).await.ok();
                return Err(conflict(existing, organization));
            }
            return Err(db_error("Failed to insert organization", e));
        }

        sqlx::query(
            r#"
            INSERT INTO objects (id, created, updated, version, alias, type_id, organization_id)
            VALUES ($1, $2, $3, 0, $4, $5, $6)
            "#,
        )
        .bind(group.base.id)
        .bind(group.base.created)
        .bind(group.base.updated)
        .bind(&group.alias)
        .bind(group.type_id)
        .bind(group.organization_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to create organization group object", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        info!("Organization {} created", organization.name);
        Ok(())
    }

    async fn save_organization(&self, organization: &Organization) -> Result<Organization> {
        organization.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let sql = format!(
            "UPDATE organizations SET name = $3, region = $4, updated = NOW(), \
             version = version + 1 WHERE id = $1 AND version = $2 RETURNING {}",
            ORGANIZATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(organization.base.id)
            .bind(organization.base.version)
            .bind(&organization.name)
            .bind(&organization.region)
            .fetch_optional(&mut *tx)
            .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => {
                drop(tx);
                return Err(self
                    .save_miss("organizations", ORGANIZATION_COLUMNS, organization, organization_from_row)
                    .await);
            }
            Err(e) if is_unique_violation(&e) => {
                return Err(GraphError::Conflict {
                    id: organization.base.id,
                    identical: false,
                })
            }
            Err(e) => return Err(db_error("Failed to save organization", e)),
        };

        sqlx::query(
            "UPDATE objects SET alias = $2, updated = NOW(), version = version + 1 WHERE id = $1",
        )
        .bind(organization.base.id)
        .bind(&organization.name)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to rename organization group object", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        organization_from_row(&row).map_err(|e| db_error("Failed to decode organization", e))
    }

    async fn list_organizations(&self, paginator: &Paginator) -> Result<Page<Organization>> {
        self.list("organizations", ORGANIZATION_COLUMNS, paginator, organization_from_row)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagination::{Column, Filter};

    #[test]
    fn test_list_sql_first_page() {
        let paginator = Paginator::new()
            .with_limit(10)
            .with_filter(Filter::id(Column::SourceObjectId, Uuid::nil()));
        let (sql, binds) = list_sql("edges", EDGE_COLUMNS, &paginator).unwrap();
        assert_eq!(
            sql,
            format!(
                "SELECT {} FROM edges WHERE source_object_id = $1 ORDER BY id ASC LIMIT 11",
                EDGE_COLUMNS
            )
        );
        assert_eq!(binds.len(), 1);
    }

    #[test]
    fn test_list_sql_without_filter() {
        let (sql, binds) = list_sql("objects", OBJECT_COLUMNS, &Paginator::new()).unwrap();
        assert!(sql.ends_with("FROM objects ORDER BY id ASC LIMIT 51"));
        assert!(binds.is_empty());
    }
}
