//! The cache in front of the store never changes an answer: cold and warm
//! reads agree, and committed writes are visible immediately.

use authz_graph::*;
use std::sync::Arc;
use uuid::Uuid;

struct Cached {
    service: AuthzService,
    base: Arc<InMemoryGraphStore>,
    cache: Arc<InMemoryCache>,
    caller: CallerContext,
    viewer: EdgeType,
    alice: Object,
    doc: Object,
}

async fn cached_graph() -> Cached {
    let base = Arc::new(InMemoryGraphStore::new());
    let cache = Arc::new(InMemoryCache::new());
    let manager = CacheManager::new(
        cache.clone(),
        CacheKeys::new("authz", Uuid::new_v4()),
        CacheTtls::default(),
    );
    let service = AuthzService::with_cache(base.clone(), manager, SearchConfig::default());
    let caller = CallerContext::system();
    service.provision().await.unwrap();

    let (document, _) = service
        .create_object_type(&caller, ObjectType::new("document"))
        .await
        .unwrap();
    let (viewer, _) = service
        .create_edge_type(
            &caller,
            EdgeType::new("viewer", USER_OBJECT_TYPE_ID, document.base.id, vec![Attribute::direct("view")]),
        )
        .await
        .unwrap();
    let (alice, _) = service
        .create_object(&caller, Object::new(USER_OBJECT_TYPE_ID, Some("alice")))
        .await
        .unwrap();
    let (doc, _) = service
        .create_object(&caller, Object::new(document.base.id, Some("doc")))
        .await
        .unwrap();

    Cached {
        service,
        base,
        cache,
        caller,
        viewer,
        alice,
        doc,
    }
}

impl Cached {
    async fn can_view(&self) -> bool {
        self.service
            .check_attribute(&self.caller, self.alice.base.id, self.doc.base.id, "view")
            .await
            .unwrap()
            .has_attribute
    }
}

#[tokio::test]
async fn test_warm_reads_match_cold_reads() {
    let c = cached_graph().await;
    c.service
        .create_edge(&c.caller, Edge::new(c.viewer.base.id, c.alice.base.id, c.doc.base.id))
        .await
        .unwrap();

    let cold = c
        .service
        .check_attribute(&c.caller, c.alice.base.id, c.doc.base.id, "view")
        .await
        .unwrap();
    assert!(!c.cache.is_empty());
    let warm = c
        .service
        .check_attribute(&c.caller, c.alice.base.id, c.doc.base.id, "view")
        .await
        .unwrap();
    assert_eq!(cold, warm);

    let uncached = AttributeResolver::new(c.base.clone(), SearchConfig::default())
        .check_attribute(c.alice.base.id, c.doc.base.id, "view")
        .await
        .unwrap();
    assert_eq!(warm, uncached);
}

#[tokio::test]
async fn test_edge_writes_are_visible_at_once() {
    let c = cached_graph().await;
    assert!(!c.can_view().await);

    let (edge, _) = c
        .service
        .create_edge(&c.caller, Edge::new(c.viewer.base.id, c.alice.base.id, c.doc.base.id))
        .await
        .unwrap();
    assert!(c.can_view().await);

    c.service.delete_edge(&c.caller, edge.base.id).await.unwrap();
    assert!(!c.can_view().await);
}

#[tokio::test]
async fn test_edge_type_change_is_visible_at_once() {
    let c = cached_graph().await;
    c.service
        .create_edge(&c.caller, Edge::new(c.viewer.base.id, c.alice.base.id, c.doc.base.id))
        .await
        .unwrap();
    assert!(c.can_view().await);

    c.service
        .update_edge_type(&c.caller, c.viewer.base.id, "viewer", vec![Attribute::direct("comment")])
        .await
        .unwrap();
    assert!(!c.can_view().await);

    c.service.delete_edge_type(&c.caller, c.viewer.base.id).await.unwrap();
    assert!(!c.can_view().await);
    assert!(c
        .service
        .list_edges(&c.caller, &EdgeQuery::default(), &Paginator::new())
        .await
        .unwrap()
        .data
        .is_empty());
}

#[tokio::test]
async fn test_object_delete_drops_cached_listings() {
    let c = cached_graph().await;
    c.service
        .create_edge(&c.caller, Edge::new(c.viewer.base.id, c.alice.base.id, c.doc.base.id))
        .await
        .unwrap();
    assert!(c.can_view().await);

    c.service.delete_object(&c.caller, c.doc.base.id).await.unwrap();
    assert!(matches!(
        c.service.get_object(&c.caller, c.doc.base.id).await,
        Err(GraphError::NotFound(_))
    ));
    let reachable = c
        .service
        .list_objects_reachable_with_attribute(&c.caller, c.alice.base.id, c.doc.type_id, "view")
        .await;
    // the document type still exists; nothing of it is reachable
    assert_eq!(reachable.unwrap(), Vec::<Uuid>::new());
}

#[tokio::test]
async fn test_writes_behind_the_cache_need_a_flush() {
    let c = cached_graph().await;
    assert!(!c.can_view().await);

    // a write the cache never hears about
    c.base
        .insert_edge(&Edge::new(c.viewer.base.id, c.alice.base.id, c.doc.base.id))
        .await
        .unwrap();
    assert!(!c.can_view().await);

    let flushed = c.service.flush_cache(&c.caller).await.unwrap();
    assert!(flushed > 0);
    assert!(c.cache.is_empty());
    assert!(c.can_view().await);
}

#[tokio::test]
async fn test_dump_cache_by_prefix() {
    let c = cached_graph().await;
    c.service
        .create_edge(&c.caller, Edge::new(c.viewer.base.id, c.alice.base.id, c.doc.base.id))
        .await
        .unwrap();
    assert!(c.can_view().await);

    let listings = c.service.dump_cache(&c.caller, "EDGES:").await.unwrap();
    assert!(!listings.is_empty());
    assert!(listings.iter().all(|(key, _)| key.contains(":EDGES:")));

    let objects = c.service.dump_cache(&c.caller, "OBJ:").await.unwrap();
    assert!(objects.iter().all(|(key, _)| key.contains(":OBJ:")));

    let edge_types = c.service.dump_cache(&c.caller, "EDGETYPE:").await.unwrap();
    assert_eq!(edge_types.len(), 1);
    assert!(edge_types[0].1.contains("viewer"));
}

#[tokio::test]
async fn test_tenants_share_a_provider_without_sharing_entries() {
    let provider = Arc::new(InMemoryCache::new());
    let first = CacheManager::new(provider.clone(), CacheKeys::new("authz", Uuid::new_v4()), CacheTtls::default());
    let second = CacheManager::new(provider.clone(), CacheKeys::new("authz", Uuid::new_v4()), CacheTtls::default());
    let id = Uuid::new_v4();

    let a: String = first
        .read_through(&first.keys().object(id), CacheTtls::default().object, || async {
            Ok::<_, GraphError>("first".to_string())
        })
        .await
        .unwrap();
    let b: String = second
        .read_through(&second.keys().object(id), CacheTtls::default().object, || async {
            Ok::<_, GraphError>("second".to_string())
        })
        .await
        .unwrap();
    assert_eq!((a.as_str(), b.as_str()), ("first", "second"));
    assert_eq!(provider.len(), 2);

    first.flush_tenant().await.unwrap();
    assert_eq!(provider.len(), 1);

    // the second tenant's entry is still served from cache
    let again: String = second
        .read_through(&second.keys().object(id), CacheTtls::default().object, || async {
            Ok::<_, GraphError>("refetched".to_string())
        })
        .await
        .unwrap();
    assert_eq!(again, "second");
}

#[tokio::test]
async fn test_service_without_cache() {
    let service = AuthzService::new(Arc::new(InMemoryGraphStore::new()), SearchConfig::default());
    let caller = CallerContext::system();
    assert_eq!(service.flush_cache(&caller).await.unwrap(), 0);
    assert!(service.dump_cache(&caller, "").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_from_config_builds_a_cached_in_memory_service() {
    let config = AuthzConfig::default();
    let service = AuthzService::from_config(&config).await.unwrap();
    let caller = CallerContext::system();
    service.provision().await.unwrap();

    service.get_object_type(&caller, USER_OBJECT_TYPE_ID).await.unwrap();
    let cached = service.dump_cache(&caller, "OBJTYPE:").await.unwrap();
    assert_eq!(cached.len(), 1);

    let mut disabled = AuthzConfig::default();
    disabled.cache.provider = CacheProviderKind::Disabled;
    let service = AuthzService::from_config(&disabled).await.unwrap();
    assert!(service.dump_cache(&caller, "").await.unwrap().is_empty());
}
