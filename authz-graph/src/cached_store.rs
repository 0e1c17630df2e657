use crate::{
    cache::CacheManager,
    error::Result,
    models::*,
    pagination::{Page, Paginator, MAX_LIMIT},
    store::GraphStore,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Graph store decorator adding read-through caching and write invalidation.
///
/// Primary-key lookups and per-object edge listings are cached. Every
/// mutation is applied to the inner store first and then invalidates the
/// entries it could have made stale, so a cached answer never outlives a
/// committed write.
pub struct CachedGraphStore {
    inner: Arc<dyn GraphStore>,
    cache: CacheManager,
}

impl CachedGraphStore {
    pub fn new(inner: Arc<dyn GraphStore>, cache: CacheManager) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn inner(&self) -> &Arc<dyn GraphStore> {
        &self.inner
    }

    /// The complete edge set on one side of an object, or `None` when it is
    /// too large to hold as a single cache entry.
    async fn edge_listing(&self, object_id: Uuid, outgoing: bool) -> Result<Option<Vec<Edge>>> {
        let key = if outgoing {
            self.cache.keys().outgoing_edges(object_id)
        } else {
            self.cache.keys().incoming_edges(object_id)
        };
        let inner = self.inner.clone();
        self.cache
            .read_through(&key, self.cache.ttls().edge_listing, move || async move {
                let all = Paginator::new().with_limit(MAX_LIMIT);
                let page = if outgoing {
                    inner.list_outgoing_edges(object_id, &all).await?
                } else {
                    inner.list_incoming_edges(object_id, &all).await?
                };
                Ok(if page.fields.has_next {
                    None
                } else {
                    Some(page.data)
                })
            })
            .await
    }

    async fn list_side(&self, object_id: Uuid, paginator: &Paginator, outgoing: bool) -> Result<Page<Edge>> {
        if paginator.filter().is_none() {
            if let Some(edges) = self.edge_listing(object_id, outgoing).await? {
                return paginator.paginate(edges);
            }
            debug!("Edge listing for {} too large to cache", object_id);
        }
        if outgoing {
            self.inner.list_outgoing_edges(object_id, paginator).await
        } else {
            self.inner.list_incoming_edges(object_id, paginator).await
        }
    }

    fn edge_keys(&self, edge: &Edge) -> Vec<String> {
        let keys = self.cache.keys();
        vec![
            keys.edge(edge.base.id),
            keys.outgoing_edges(edge.source_object_id),
            keys.incoming_edges(edge.target_object_id),
        ]
    }
}

#[async_trait]
impl GraphStore for CachedGraphStore {
    async fn get_object_type(&self, id: Uuid) -> Result<ObjectType> {
        let key = self.cache.keys().object_type(id);
        let inner = self.inner.clone();
        self.cache
            .read_through(&key, self.cache.ttls().object_type, move || async move {
                inner.get_object_type(id).await
            })
            .await
    }

    async fn get_object_type_by_name(&self, type_name: &str) -> Result<ObjectType> {
        self.inner.get_object_type_by_name(type_name).await
    }

    async fn insert_object_type(&self, object_type: &ObjectType) -> Result<()> {
        self.inner.insert_object_type(object_type).await?;
        self.cache
            .invalidate(vec![self.cache.keys().object_type(object_type.base.id)])
            .await
    }

    async fn save_object_type(&self, object_type: &ObjectType) -> Result<ObjectType> {
        let saved = self.inner.save_object_type(object_type).await?;
        self.cache
            .invalidate(vec![self.cache.keys().object_type(saved.base.id)])
            .await?;
        Ok(saved)
    }

    async fn delete_object_type(&self, id: Uuid) -> Result<()> {
        self.inner.delete_object_type(id).await?;
        // the cascade can reach any object, edge type or edge
        self.cache.flush_tenant().await?;
        Ok(())
    }

    async fn list_object_types(&self, paginator: &Paginator) -> Result<Page<ObjectType>> {
        self.inner.list_object_types(paginator).await
    }

    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        let key = self.cache.keys().edge_type(id);
        let inner = self.inner.clone();
        self.cache
            .read_through(&key, self.cache.ttls().edge_type, move || async move {
                inner.get_edge_type(id).await
            })
            .await
    }

    async fn get_edge_type_by_name(&self, type_name: &str, organization_id: Uuid) -> Result<EdgeType> {
        self.inner.get_edge_type_by_name(type_name, organization_id).await
    }

    async fn insert_edge_type(&self, edge_type: &EdgeType) -> Result<()> {
        self.inner.insert_edge_type(edge_type).await?;
        self.cache
            .invalidate(vec![self.cache.keys().edge_type(edge_type.base.id)])
            .await
    }

    async fn save_edge_type(&self, edge_type: &EdgeType) -> Result<EdgeType> {
        let saved = self.inner.save_edge_type(edge_type).await?;
        self.cache
            .invalidate(vec![self.cache.keys().edge_type(saved.base.id)])
            .await?;
        // attribute changes alter what every listing of this type means
        self.cache
            .flush_prefix(&self.cache.keys().edge_listing_prefix())
            .await?;
        Ok(saved)
    }

    async fn delete_edge_type(&self, id: Uuid) -> Result<()> {
        self.inner.delete_edge_type(id).await?;
        self.cache
            .invalidate(vec![self.cache.keys().edge_type(id)])
            .await?;
        self.cache.flush_edges().await?;
        Ok(())
    }

    async fn list_edge_types(&self, paginator: &Paginator) -> Result<Page<EdgeType>> {
        self.inner.list_edge_types(paginator).await
    }

    async fn get_object(&self, id: Uuid) -> Result<Object> {
        let key = self.cache.keys().object(id);
        let inner = self.inner.clone();
        self.cache
            .read_through(&key, self.cache.ttls().object, move || async move {
                inner.get_object(id).await
            })
            .await
    }

    async fn get_object_by_alias(&self, type_id: Uuid, alias: &str, organization_id: Uuid) -> Result<Object> {
        self.inner
            .get_object_by_alias(type_id, alias, organization_id)
            .await
    }

    async fn insert_object(&self, object: &Object) -> Result<()> {
        self.inner.insert_object(object).await?;
        self.cache
            .invalidate(vec![self.cache.keys().object(object.base.id)])
            .await
    }

    async fn save_object(&self, object: &Object) -> Result<Object> {
        let saved = self.inner.save_object(object).await?;
        self.cache
            .invalidate(vec![self.cache.keys().object(saved.base.id)])
            .await?;
        Ok(saved)
    }

    async fn delete_object(&self, id: Uuid) -> Result<()> {
        self.inner.delete_object(id).await?;
        let keys = self.cache.keys();
        self.cache
            .invalidate(vec![
                keys.object(id),
                keys.outgoing_edges(id),
                keys.incoming_edges(id),
            ])
            .await?;
        // neighbours' listings still name the removed edges
        self.cache.flush_edges().await?;
        Ok(())
    }

    async fn list_objects(&self, paginator: &Paginator) -> Result<Page<Object>> {
        self.inner.list_objects(paginator).await
    }

    async fn get_edge(&self, id: Uuid) -> Result<Edge> {
        let key = self.cache.keys().edge(id);
        let inner = self.inner.clone();
        self.cache
            .read_through(&key, self.cache.ttls().edge, move || async move {
                inner.get_edge(id).await
            })
            .await
    }

    async fn find_edge(&self, edge_type_id: Uuid, source_object_id: Uuid, target_object_id: Uuid) -> Result<Edge> {
        self.inner
            .find_edge(edge_type_id, source_object_id, target_object_id)
            .await
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<()> {
        self.inner.insert_edge(edge).await?;
        self.cache.invalidate(self.edge_keys(edge)).await
    }

    async fn save_edge(&self, edge: &Edge) -> Result<Edge> {
        let previous = self.inner.get_edge(edge.base.id).await?;
        let saved = self.inner.save_edge(edge).await?;
        let mut keys = self.edge_keys(&previous);
        keys.extend(self.edge_keys(&saved));
        self.cache.invalidate(keys).await?;
        Ok(saved)
    }

    async fn delete_edge(&self, id: Uuid) -> Result<()> {
        let edge = self.inner.get_edge(id).await?;
        self.inner.delete_edge(id).await?;
        self.cache.invalidate(self.edge_keys(&edge)).await
    }

    async fn delete_edges_for_object(&self, object_id: Uuid) -> Result<u64> {
        let removed = self.inner.delete_edges_for_object(object_id).await?;
        self.cache.flush_edges().await?;
        Ok(removed)
    }

    async fn list_edges(&self, paginator: &Paginator) -> Result<Page<Edge>> {
        self.inner.list_edges(paginator).await
    }

    async fn list_outgoing_edges(&self, object_id: Uuid, paginator: &Paginator) -> Result<Page<Edge>> {
        self.list_side(object_id, paginator, true).await
    }

    async fn list_incoming_edges(&self, object_id: Uuid, paginator: &Paginator) -> Result<Page<Edge>> {
        self.list_side(object_id, paginator, false).await
    }

    async fn get_organization(&self, id: Uuid) -> Result<Organization> {
        let key = self.cache.keys().organization(id);
        let inner = self.inner.clone();
        self.cache
            .read_through(&key, self.cache.ttls().organization, move || async move {
                inner.get_organization(id).await
            })
            .await
    }

    async fn insert_organization(&self, organization: &Organization) -> Result<()> {
        self.inner.insert_organization(organization).await?;
        let keys = self.cache.keys();
        self.cache
            .invalidate(vec![
                keys.organization(organization.base.id),
                keys.object(organization.base.id),
            ])
            .await
    }

    async fn save_organization(&self, organization: &Organization) -> Result<Organization> {
        let saved = self.inner.save_organization(organization).await?;
        let keys = self.cache.keys();
        self.cache
            .invalidate(vec![keys.organization(saved.base.id), keys.object(saved.base.id)])
            .await?;
        Ok(saved)
    }

    async fn list_organizations(&self, paginator: &Paginator) -> Result<Page<Organization>> {
        self.inner.list_organizations(paginator).await
    }

    async fn invalidate_edge_cache(&self) -> Result<()> {
        self.cache.flush_tenant().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKeys, CacheProvider, CacheTtls, InMemoryCache, DEFAULT_KEY_PREFIX};
    use crate::store::InMemoryGraphStore;

    fn cached() -> (Arc<InMemoryCache>, Arc<InMemoryGraphStore>, CachedGraphStore) {
        let provider = Arc::new(InMemoryCache::new());
        let inner = Arc::new(InMemoryGraphStore::new());
        let store = CachedGraphStore::new(
            inner.clone(),
            CacheManager::new(
                provider.clone(),
                CacheKeys::new(DEFAULT_KEY_PREFIX, Uuid::new_v4()),
                CacheTtls::default(),
            ),
        );
        (provider, inner, store)
    }

    #[tokio::test]
    async fn test_edge_listing_is_cached_and_invalidated() {
        let (provider, _, store) = cached();
        let user = ObjectType::user();
        store.insert_object_type(&user).await.unwrap();
        let follows = EdgeType::new("follows", user.base.id, user.base.id, vec![Attribute::inherit("view")]);
        store.insert_edge_type(&follows).await.unwrap();
        let a = Object::new(user.base.id, Some("a"));
        let b = Object::new(user.base.id, Some("b"));
        store.insert_object(&a).await.unwrap();
        store.insert_object(&b).await.unwrap();

        let page = store
            .list_outgoing_edges(a.base.id, &Paginator::new())
            .await
            .unwrap();
        assert!(page.data.is_empty());
        let key = store.cache().keys().outgoing_edges(a.base.id);
        assert!(provider.get(&key).await.unwrap().is_some());

        let edge = Edge::new(follows.base.id, a.base.id, b.base.id);
        store.insert_edge(&edge).await.unwrap();
        assert!(provider.get(&key).await.unwrap().is_none());

        let page = store
            .list_outgoing_edges(a.base.id, &Paginator::new())
            .await
            .unwrap();
        assert_eq!(page.data, vec![edge]);
    }

    #[tokio::test]
    async fn test_object_type_delete_flushes_tenant() {
        let (provider, _, store) = cached();
        let doc = ObjectType::new("document");
        store.insert_object_type(&doc).await.unwrap();
        store.get_object_type(doc.base.id).await.unwrap();
        assert!(!provider.is_empty());

        store.delete_object_type(doc.base.id).await.unwrap();
        assert!(provider.is_empty());
    }
}
