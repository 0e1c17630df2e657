use crate::{
    error::{GraphError, Result},
    models::*,
    pagination::{Column, Filter, Page, Paginator},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub mod postgres;

pub use postgres::PostgresGraphStore;

/// Persistence boundary for one tenant's graph.
///
/// Every mutating call is individually atomic, including its cascades.
/// `save_*` calls compare the stored version with the caller's and fail with
/// `PreconditionFailed` when they differ; on success the version is bumped.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // Object types
    async fn get_object_type(&self, id: Uuid) -> Result<ObjectType>;
    async fn get_object_type_by_name(&self, type_name: &str) -> Result<ObjectType>;
    async fn insert_object_type(&self, object_type: &ObjectType) -> Result<()>;
    async fn save_object_type(&self, object_type: &ObjectType) -> Result<ObjectType>;
    /// Removes the type, its objects, every edge type touching it and all their edges
    async fn delete_object_type(&self, id: Uuid) -> Result<()>;
    async fn list_object_types(&self, paginator: &Paginator) -> Result<Page<ObjectType>>;

    // Edge types
    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType>;
    async fn get_edge_type_by_name(&self, type_name: &str, organization_id: Uuid) -> Result<EdgeType>;
    async fn insert_edge_type(&self, edge_type: &EdgeType) -> Result<()>;
    async fn save_edge_type(&self, edge_type: &EdgeType) -> Result<EdgeType>;
    /// Removes the edge type and all edges of that type
    async fn delete_edge_type(&self, id: Uuid) -> Result<()>;
    async fn list_edge_types(&self, paginator: &Paginator) -> Result<Page<EdgeType>>;

    // Objects
    async fn get_object(&self, id: Uuid) -> Result<Object>;
    async fn get_object_by_alias(&self, type_id: Uuid, alias: &str, organization_id: Uuid) -> Result<Object>;
    async fn insert_object(&self, object: &Object) -> Result<()>;
    async fn save_object(&self, object: &Object) -> Result<Object>;
    /// Removes the object and every edge where it is source or target
    async fn delete_object(&self, id: Uuid) -> Result<()>;
    async fn list_objects(&self, paginator: &Paginator) -> Result<Page<Object>>;

    // Edges
    async fn get_edge(&self, id: Uuid) -> Result<Edge>;
    async fn find_edge(&self, edge_type_id: Uuid, source_object_id: Uuid, target_object_id: Uuid) -> Result<Edge>;
    async fn insert_edge(&self, edge: &Edge) -> Result<()>;
    async fn save_edge(&self, edge: &Edge) -> Result<Edge>;
    async fn delete_edge(&self, id: Uuid) -> Result<()>;
    /// Removes every edge where the object is source or target, returning how many went
    async fn delete_edges_for_object(&self, object_id: Uuid) -> Result<u64>;
    async fn list_edges(&self, paginator: &Paginator) -> Result<Page<Edge>>;

    /// Edges leaving `object_id`, ordered by edge ID
    async fn list_outgoing_edges(&self, object_id: Uuid, paginator: &Paginator) -> Result<Page<Edge>> {
        let paginator = scoped(paginator, Filter::id(Column::SourceObjectId, object_id));
        self.list_edges(&paginator).await
    }

    /// Edges entering `object_id`, ordered by edge ID
    async fn list_incoming_edges(&self, object_id: Uuid, paginator: &Paginator) -> Result<Page<Edge>> {
        let paginator = scoped(paginator, Filter::id(Column::TargetObjectId, object_id));
        self.list_edges(&paginator).await
    }

    // Organizations. There is deliberately no delete.
    async fn get_organization(&self, id: Uuid) -> Result<Organization>;
    /// Also creates the organization's group object (same ID, alias = name)
    async fn insert_organization(&self, organization: &Organization) -> Result<()>;
    async fn save_organization(&self, organization: &Organization) -> Result<Organization>;
    async fn list_organizations(&self, paginator: &Paginator) -> Result<Page<Organization>>;

    /// Drop any derived edge data held in front of the store. A no-op without a cache.
    async fn invalidate_edge_cache(&self) -> Result<()> {
        Ok(())
    }
}

/// Narrow a paginator's filter with an extra conjunct
pub fn scoped(paginator: &Paginator, extra: Filter) -> Paginator {
    let filter = match paginator.filter() {
        Some(existing) => Filter::And(vec![existing.clone(), extra]),
        None => extra,
    };
    paginator.clone().with_filter(filter)
}

/// Collect every page of a listing
pub async fn collect_all<T, F, Fut>(paginator: Paginator, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Paginator) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>>>,
{
    let mut out = Vec::new();
    let mut current = Some(paginator);
    while let Some(p) = current {
        let page = fetch(p.clone()).await?;
        current = p.advance(&page.fields);
        out.extend(page.data);
    }
    Ok(out)
}

// =============================================================================
// Pre-save checks shared by both stores
// =============================================================================

pub(crate) fn check_edge_endpoints(
    edge: &Edge,
    edge_type: &EdgeType,
    source: &Object,
    target: &Object,
) -> Result<()> {
    if source.type_id != edge_type.source_object_type_id {
        return Err(GraphError::InvalidEdge(format!(
            "source object ({}, type id: {}) doesn't match source object type {} of edge type {}",
            source.base.id, source.type_id, edge_type.source_object_type_id, edge_type.type_name
        )));
    }
    if target.type_id != edge_type.target_object_type_id {
        return Err(GraphError::InvalidEdge(format!(
            "target object ({}, type id: {}) doesn't match target object type {} of edge type {}",
            target.base.id, target.type_id, edge_type.target_object_type_id, edge_type.type_name
        )));
    }
    if !edge_type.organization_id.is_nil()
        && (edge_type.organization_id != source.organization_id
            || edge_type.organization_id != target.organization_id)
    {
        return Err(GraphError::InvalidEdge(format!(
            "edge {} endpoints must be in organization {} of edge type {}",
            edge.base.id, edge_type.organization_id, edge_type.type_name
        )));
    }
    Ok(())
}

/// Wraps a lookup miss during a pre-save check as a reference error
pub(crate) fn missing_reference(err: GraphError, what: &str) -> GraphError {
    match err {
        GraphError::NotFound(detail) => {
            GraphError::InvalidEdge(format!("{} does not exist: {}", what, detail))
        }
        other => other,
    }
}

/// Version check and bookkeeping for a save; returns the row to store
pub(crate) fn next_version<T: Entity>(stored: &T, incoming: &T) -> Result<T> {
    if stored.base().version != incoming.base().version {
        return Err(GraphError::PreconditionFailed(format!(
            "{} {} was modified concurrently (expected version {}, found {})",
            T::KIND,
            incoming.id(),
            incoming.base().version,
            stored.base().version
        )));
    }
    let mut next = incoming.clone();
    let base = next.base_mut();
    base.created = stored.base().created;
    base.updated = Utc::now();
    base.version = stored.base().version + 1;
    Ok(next)
}

// =============================================================================
// In-memory store
// =============================================================================

struct Table<T> {
    rows: BTreeMap<Uuid, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<T: Entity> Table<T> {
    fn get(&self, id: Uuid) -> Result<T> {
        self.rows
            .get(&id)
            .cloned()
            .ok_or_else(|| GraphError::not_found(T::KIND, id))
    }

    fn find(&self, pred: impl Fn(&T) -> bool) -> Option<&T> {
        self.rows.values().find(|row| pred(row))
    }

    /// Insert, reporting an ID clash or a clash on a unique key found by `unique`
    fn insert(&mut self, row: &T, unique: impl Fn(&T) -> bool) -> Result<()> {
        if let Some(existing) = self.rows.get(&row.id()).or_else(|| self.find(&unique)) {
            return Err(GraphError::Conflict {
                id: existing.id(),
                identical: existing.equals_ignoring_id(row),
            });
        }
        let mut row = row.clone();
        row.base_mut().version = 0;
        self.rows.insert(row.id(), row);
        Ok(())
    }

    fn save(&mut self, row: &T, unique: impl Fn(&T) -> bool) -> Result<T> {
        let stored = self.get(row.id())?;
        if let Some(other) = self.find(|r| r.id() != row.id() && unique(r)) {
            return Err(GraphError::Conflict {
                id: other.id(),
                identical: other.equals_ignoring_id(row),
            });
        }
        let next = next_version(&stored, row)?;
        self.rows.insert(next.id(), next.clone());
        Ok(next)
    }

    fn remove(&mut self, id: Uuid) -> Result<T> {
        self.rows
            .remove(&id)
            .ok_or_else(|| GraphError::not_found(T::KIND, id))
    }

    fn all(&self) -> Vec<T> {
        self.rows.values().cloned().collect()
    }
}

#[derive(Default)]
struct Tables {
    object_types: Table<ObjectType>,
    edge_types: Table<EdgeType>,
    objects: Table<Object>,
    edges: Table<Edge>,
    organizations: Table<Organization>,
}

impl Tables {
    fn check_object(&self, object: &Object) -> Result<()> {
        self.object_types
            .get(object.type_id)
            .map_err(|e| missing_reference(e, "object type"))?;
        if !object.organization_id.is_nil() {
            self.organizations
                .get(object.organization_id)
                .map_err(|e| missing_reference(e, "organization"))?;
        }
        Ok(())
    }

    fn check_edge_type(&self, edge_type: &EdgeType) -> Result<()> {
        self.object_types
            .get(edge_type.source_object_type_id)
            .map_err(|e| missing_reference(e, "source object type"))?;
        self.object_types
            .get(edge_type.target_object_type_id)
            .map_err(|e| missing_reference(e, "target object type"))?;
        if !edge_type.organization_id.is_nil() {
            self.organizations
                .get(edge_type.organization_id)
                .map_err(|e| missing_reference(e, "organization"))?;
        }
        Ok(())
    }

    fn check_edge(&self, edge: &Edge) -> Result<()> {
        let edge_type = self
            .edge_types
            .get(edge.edge_type_id)
            .map_err(|e| missing_reference(e, "edge type"))?;
        let source = self
            .objects
            .get(edge.source_object_id)
            .map_err(|e| missing_reference(e, "source object"))?;
        let target = self
            .objects
            .get(edge.target_object_id)
            .map_err(|e| missing_reference(e, "target object"))?;
        check_edge_endpoints(edge, &edge_type, &source, &target)
    }

    fn remove_edges_where(&mut self, pred: impl Fn(&Edge) -> bool) -> u64 {
        let before = self.edges.rows.len();
        self.edges.rows.retain(|_, e| !pred(e));
        (before - self.edges.rows.len()) as u64
    }
}

/// In-memory graph store for tests and single-process deployments.
///
/// All tables sit behind one lock so cascades are atomic.
pub struct InMemoryGraphStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_object_type(&self, id: Uuid) -> Result<ObjectType> {
        self.tables.read().object_types.get(id)
    }

    async fn get_object_type_by_name(&self, type_name: &str) -> Result<ObjectType> {
        self.tables
            .read()
            .object_types
            .find(|t| t.type_name == type_name)
            .cloned()
            .ok_or_else(|| GraphError::not_found(ObjectType::KIND, type_name))
    }

    async fn insert_object_type(&self, object_type: &ObjectType) -> Result<()> {
        object_type.validate()?;
        self.tables
            .write()
            .object_types
            .insert(object_type, |t| t.type_name == object_type.type_name)
    }

    async fn save_object_type(&self, object_type: &ObjectType) -> Result<ObjectType> {
        object_type.validate()?;
        self.tables
            .write()
            .object_types
            .save(object_type, |t| t.type_name == object_type.type_name)
    }

    async fn delete_object_type(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.object_types.get(id)?;

        let edge_type_ids: Vec<Uuid> = tables
            .edge_types
            .rows
            .values()
            .filter(|et| et.source_object_type_id == id || et.target_object_type_id == id)
            .map(|et| et.base.id)
            .collect();
        let object_ids: Vec<Uuid> = tables
            .objects
            .rows
            .values()
            .filter(|o| o.type_id == id)
            .map(|o| o.base.id)
            .collect();

        let edges = tables.remove_edges_where(|e| {
            edge_type_ids.contains(&e.edge_type_id)
                || object_ids.contains(&e.source_object_id)
                || object_ids.contains(&e.target_object_id)
        });
        tables.edge_types.rows.retain(|k, _| !edge_type_ids.contains(k));
        tables.objects.rows.retain(|k, _| !object_ids.contains(k));
        tables.object_types.remove(id)?;

        info!(
            "Deleted object type {} with {} edge types, {} objects, {} edges",
            id,
            edge_type_ids.len(),
            object_ids.len(),
            edges
        );
        Ok(())
    }

    async fn list_object_types(&self, paginator: &Paginator) -> Result<Page<ObjectType>> {
        let rows = self.tables.read().object_types.all();
        paginator.paginate(rows)
    }

    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        self.tables.read().edge_types.get(id)
    }

    async fn get_edge_type_by_name(&self, type_name: &str, organization_id: Uuid) -> Result<EdgeType> {
        self.tables
            .read()
            .edge_types
            .find(|t| t.type_name == type_name && t.organization_id == organization_id)
            .cloned()
            .ok_or_else(|| GraphError::not_found(EdgeType::KIND, type_name))
    }

    async fn insert_edge_type(&self, edge_type: &EdgeType) -> Result<()> {
        edge_type.validate()?;
        let mut tables = self.tables.write();
        tables.check_edge_type(edge_type)?;
        tables.edge_types.insert(edge_type, |t| {
            t.type_name == edge_type.type_name && t.organization_id == edge_type.organization_id
        })
    }

    async fn save_edge_type(&self, edge_type: &EdgeType) -> Result<EdgeType> {
        edge_type.validate()?;
        let mut tables = self.tables.write();
        let stored = tables.edge_types.get(edge_type.base.id)?;
        if stored.source_object_type_id != edge_type.source_object_type_id
            || stored.target_object_type_id != edge_type.target_object_type_id
        {
            return Err(GraphError::ValidationError(format!(
                "edge type {} cannot change its source or target object type",
                edge_type.type_name
            )));
        }
        tables.check_edge_type(edge_type)?;
        tables.edge_types.save(edge_type, |t| {
            t.type_name == edge_type.type_name && t.organization_id == edge_type.organization_id
        })
    }

    async fn delete_edge_type(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.edge_types.remove(id)?;
        let removed = tables.remove_edges_where(|e| e.edge_type_id == id);
        info!("Deleted edge type {} and {} edges", id, removed);
        Ok(())
    }

    async fn list_edge_types(&self, paginator: &Paginator) -> Result<Page<EdgeType>> {
        let rows = self.tables.read().edge_types.all();
        paginator.paginate(rows)
    }

    async fn get_object(&self, id: Uuid) -> Result<Object> {
        self.tables.read().objects.get(id)
    }

    async fn get_object_by_alias(&self, type_id: Uuid, alias: &str, organization_id: Uuid) -> Result<Object> {
        self.tables
            .read()
            .objects
            .find(|o| {
                o.type_id == type_id
                    && o.organization_id == organization_id
                    && o.alias.as_deref() == Some(alias)
            })
            .cloned()
            .ok_or_else(|| GraphError::not_found(Object::KIND, alias))
    }

    async fn insert_object(&self, object: &Object) -> Result<()> {
        object.validate()?;
        let mut tables = self.tables.write();
        tables.check_object(object)?;
        tables.objects.insert(object, |o| same_alias(o, object))
    }

    async fn save_object(&self, object: &Object) -> Result<Object> {
        object.validate()?;
        let mut tables = self.tables.write();
        let stored = tables.objects.get(object.base.id)?;
        if stored.type_id != object.type_id {
            return Err(GraphError::ValidationError(format!(
                "object {} cannot change its type",
                object.base.id
            )));
        }
        tables.check_object(object)?;
        tables.objects.save(object, |o| same_alias(o, object))
    }

    async fn delete_object(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.objects.remove(id)?;
        let removed =
            tables.remove_edges_where(|e| e.source_object_id == id || e.target_object_id == id);
        info!("Deleted object {} and {} edges", id, removed);
        Ok(())
    }

    async fn list_objects(&self, paginator: &Paginator) -> Result<Page<Object>> {
        let rows = self.tables.read().objects.all();
        paginator.paginate(rows)
    }

    async fn get_edge(&self, id: Uuid) -> Result<Edge> {
        self.tables.read().edges.get(id)
    }

    async fn find_edge(&self, edge_type_id: Uuid, source_object_id: Uuid, target_object_id: Uuid) -> Result<Edge> {
        self.tables
            .read()
            .edges
            .find(|e| {
                e.edge_type_id == edge_type_id
                    && e.source_object_id == source_object_id
                    && e.target_object_id == target_object_id
            })
            .cloned()
            .ok_or_else(|| {
                GraphError::NotFound(format!(
                    "edge {} -[{}]-> {}",
                    source_object_id, edge_type_id, target_object_id
                ))
            })
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<()> {
        edge.validate()?;
        let mut tables = self.tables.write();
        tables.check_edge(edge)?;
        tables.edges.insert(edge, |e| e.equals_ignoring_id(edge))
    }

    async fn save_edge(&self, edge: &Edge) -> Result<Edge> {
        edge.validate()?;
        let mut tables = self.tables.write();
        tables.check_edge(edge)?;
        tables.edges.save(edge, |e| e.equals_ignoring_id(edge))
    }

    async fn delete_edge(&self, id: Uuid) -> Result<()> {
        self.tables.write().edges.remove(id)?;
        debug!("Deleted edge {}", id);
        Ok(())
    }

    async fn delete_edges_for_object(&self, object_id: Uuid) -> Result<u64> {
        let mut tables = self.tables.write();
        tables.objects.get(object_id)?;
        Ok(tables.remove_edges_where(|e| {
            e.source_object_id == object_id || e.target_object_id == object_id
        }))
    }

    async fn list_edges(&self, paginator: &Paginator) -> Result<Page<Edge>> {
        let rows = self.tables.read().edges.all();
        paginator.paginate(rows)
    }

    async fn get_organization(&self, id: Uuid) -> Result<Organization> {
        self.tables.read().organizations.get(id)
    }

    async fn insert_organization(&self, organization: &Organization) -> Result<()> {
        organization.validate()?;
        let mut tables = self.tables.write();
        let group = organization_group(organization);
        tables
            .object_types
            .get(group.type_id)
            .map_err(|e| missing_reference(e, "group object type"))?;
        if let Some(existing) = tables.objects.rows.get(&group.base.id) {
            return Err(GraphError::Conflict {
                id: existing.base.id,
                identical: existing.equals_ignoring_id(&group),
            });
        }
        tables
            .organizations
            .insert(organization, |o| o.name == organization.name)?;
        tables.objects.insert(&group, |o| same_alias(o, &group))
    }

    async fn save_organization(&self, organization: &Organization) -> Result<Organization> {
        organization.validate()?;
        let mut tables = self.tables.write();
        let saved = tables
            .organizations
            .save(organization, |o| o.name == organization.name)?;
        // keep the group object's alias in step with the organization name
        if let Some(group) = tables.objects.rows.get_mut(&saved.base.id) {
            group.alias = Some(saved.name.clone());
            group.base.updated = Utc::now();
            group.base.version += 1;
        }
        Ok(saved)
    }

    async fn list_organizations(&self, paginator: &Paginator) -> Result<Page<Organization>> {
        let rows = self.tables.read().organizations.all();
        paginator.paginate(rows)
    }
}

fn same_alias(existing: &Object, candidate: &Object) -> bool {
    candidate.alias.is_some()
        && existing.alias == candidate.alias
        && existing.type_id == candidate.type_id
        && existing.organization_id == candidate.organization_id
}

/// The group object that mirrors an organization in the graph
pub fn organization_group(organization: &Organization) -> Object {
    Object::new(GROUP_OBJECT_TYPE_ID, Some(&organization.name))
        .with_id(organization.base.id)
        .with_organization(organization.base.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (InMemoryGraphStore, ObjectType, ObjectType, EdgeType) {
        let store = InMemoryGraphStore::new();
        let user = ObjectType::user();
        let doc = ObjectType::new("document");
        store.insert_object_type(&user).await.unwrap();
        store.insert_object_type(&doc).await.unwrap();
        let et = EdgeType::new("viewer", user.base.id, doc.base.id, vec![Attribute::direct("view")]);
        store.insert_edge_type(&et).await.unwrap();
        (store, user, doc, et)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_name() {
        let (store, _, _, _) = seeded().await;
        let err = store
            .insert_object_type(&ObjectType::new("document"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Conflict { identical: true, .. }));
    }

    #[tokio::test]
    async fn test_save_checks_version() {
        let (store, _, doc, _) = seeded().await;
        let mut renamed = doc.clone();
        renamed.type_name = "file".to_string();
        let saved = store.save_object_type(&renamed).await.unwrap();
        assert_eq!(saved.base.version, 1);

        // second save with the stale version loses
        let err = store.save_object_type(&renamed).await.unwrap_err();
        assert!(matches!(err, GraphError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_edge_endpoint_types_are_checked() {
        let (store, user, _, et) = seeded().await;
        let a = Object::new(user.base.id, Some("a"));
        let b = Object::new(user.base.id, Some("b"));
        store.insert_object(&a).await.unwrap();
        store.insert_object(&b).await.unwrap();

        let err = store
            .insert_edge(&Edge::new(et.base.id, a.base.id, b.base.id))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidEdge(_)));
    }

    #[tokio::test]
    async fn test_edge_type_endpoints_are_immutable() {
        let (store, user, _, et) = seeded().await;
        let mut changed = et.clone();
        changed.target_object_type_id = user.base.id;
        assert!(matches!(
            store.save_edge_type(&changed).await,
            Err(GraphError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_organization_creates_group_object() {
        let store = InMemoryGraphStore::new();
        store.insert_object_type(&ObjectType::group()).await.unwrap();
        let org = Organization::new("acme", "aws-us-east-1");
        store.insert_organization(&org).await.unwrap();

        let group = store.get_object(org.base.id).await.unwrap();
        assert_eq!(group.alias.as_deref(), Some("acme"));
        assert_eq!(group.organization_id, org.base.id);
        assert_eq!(group.type_id, GROUP_OBJECT_TYPE_ID);
    }
}
