//! Store wrappers shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use authz_graph::region::REGION_CONFLICT_MESSAGE;
use authz_graph::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// In-memory store where chosen objects behave as if another region is
/// mid-write on them, and edge listings can be made slow
#[derive(Default)]
pub struct RacingStore {
    inner: InMemoryGraphStore,
    /// Incoming edge listings of these objects hit a serialization failure
    contended: Mutex<HashSet<Uuid>>,
    /// These objects were deleted elsewhere; their edges have not caught up
    vanished: Mutex<HashSet<Uuid>>,
    /// Added to every edge listing
    latency: Mutex<Option<Duration>>,
}

impl RacingStore {
    pub fn new(inner: InMemoryGraphStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn contend(&self, object_id: Uuid) {
        self.contended.lock().insert(object_id);
    }

    pub fn settle(&self) {
        self.contended.lock().clear();
        self.vanished.lock().clear();
    }

    pub fn vanish(&self, object_id: Uuid) {
        self.vanished.lock().insert(object_id);
    }

    /// Make every edge listing take `latency` of tokio time
    pub fn slow_down(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    async fn lag(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl GraphStore for RacingStore {
    async fn get_object_type(&self, id: Uuid) -> Result<ObjectType> {
        self.inner.get_object_type(id).await
    }
    async fn get_object_type_by_name(&self, type_name: &str) -> Result<ObjectType> {
        self.inner.get_object_type_by_name(type_name).await
    }
    async fn insert_object_type(&self, object_type: &ObjectType) -> Result<()> {
        self.inner.insert_object_type(object_type).await
    }
    async fn save_object_type(&self, object_type: &ObjectType) -> Result<ObjectType> {
        self.inner.save_object_type(object_type).await
    }
    async fn delete_object_type(&self, id: Uuid) -> Result<()> {
        self.inner.delete_object_type(id).await
    }
    async fn list_object_types(&self, paginator: &Paginator) -> Result<Page<ObjectType>> {
        self.inner.list_object_types(paginator).await
    }

    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        self.inner.get_edge_type(id).await
    }
    async fn get_edge_type_by_name(&self, type_name: &str, organization_id: Uuid) -> Result<EdgeType> {
        self.inner.get_edge_type_by_name(type_name, organization_id).await
    }
    async fn insert_edge_type(&self, edge_type: &EdgeType) -> Result<()> {
        self.inner.insert_edge_type(edge_type).await
    }
    async fn save_edge_type(&self, edge_type: &EdgeType) -> Result<EdgeType> {
        self.inner.save_edge_type(edge_type).await
    }
    async fn delete_edge_type(&self, id: Uuid) -> Result<()> {
        self.inner.delete_edge_type(id).await
    }
    async fn list_edge_types(&self, paginator: &Paginator) -> Result<Page<EdgeType>> {
        self.inner.list_edge_types(paginator).await
    }

    async fn get_object(&self, id: Uuid) -> Result<Object> {
        if self.vanished.lock().contains(&id) {
            return Err(GraphError::NotFound(format!("object {}", id)));
        }
        self.inner.get_object(id).await
    }
    async fn get_object_by_alias(&self, type_id: Uuid, alias: &str, organization_id: Uuid) -> Result<Object> {
        self.inner.get_object_by_alias(type_id, alias, organization_id).await
    }
    async fn insert_object(&self, object: &Object) -> Result<()> {
        self.inner.insert_object(object).await
    }
    async fn save_object(&self, object: &Object) -> Result<Object> {
        self.inner.save_object(object).await
    }
    async fn delete_object(&self, id: Uuid) -> Result<()> {
        self.inner.delete_object(id).await
    }
    async fn list_objects(&self, paginator: &Paginator) -> Result<Page<Object>> {
        self.inner.list_objects(paginator).await
    }

    async fn get_edge(&self, id: Uuid) -> Result<Edge> {
        self.inner.get_edge(id).await
    }
    async fn find_edge(&self, edge_type_id: Uuid, source_object_id: Uuid, target_object_id: Uuid) -> Result<Edge> {
        self.inner
            .find_edge(edge_type_id, source_object_id, target_object_id)
            .await
    }
    async fn insert_edge(&self, edge: &Edge) -> Result<()> {
        self.inner.insert_edge(edge).await
    }
    async fn save_edge(&self, edge: &Edge) -> Result<Edge> {
        self.inner.save_edge(edge).await
    }
    async fn delete_edge(&self, id: Uuid) -> Result<()> {
        self.inner.delete_edge(id).await
    }
    async fn delete_edges_for_object(&self, object_id: Uuid) -> Result<u64> {
        self.inner.delete_edges_for_object(object_id).await
    }
    async fn list_edges(&self, paginator: &Paginator) -> Result<Page<Edge>> {
        self.inner.list_edges(paginator).await
    }
    async fn list_outgoing_edges(&self, object_id: Uuid, paginator: &Paginator) -> Result<Page<Edge>> {
        self.lag().await;
        self.inner.list_outgoing_edges(object_id, paginator).await
    }
    async fn list_incoming_edges(&self, object_id: Uuid, paginator: &Paginator) -> Result<Page<Edge>> {
        self.lag().await;
        if self.contended.lock().contains(&object_id) {
            return Err(GraphError::RegionConflict(REGION_CONFLICT_MESSAGE.to_string()));
        }
        self.inner.list_incoming_edges(object_id, paginator).await
    }

    async fn get_organization(&self, id: Uuid) -> Result<Organization> {
        self.inner.get_organization(id).await
    }
    async fn insert_organization(&self, organization: &Organization) -> Result<()> {
        self.inner.insert_organization(organization).await
    }
    async fn save_organization(&self, organization: &Organization) -> Result<Organization> {
        self.inner.save_organization(organization).await
    }
    async fn list_organizations(&self, paginator: &Paginator) -> Result<Page<Organization>> {
        self.inner.list_organizations(paginator).await
    }
}
