use crate::{
    audit::{AuditAction, AuditEntry, AuditSink, TracingAuditSink},
    authorizer::{Action, Authorizer, CallerContext},
    cache::{CacheKeys, CacheManager, CacheProvider, InMemoryCache, RedisCache},
    cached_store::CachedGraphStore,
    config::{AuthzConfig, CacheProviderKind, SearchConfig},
    error::{GraphError, Result},
    models::*,
    pagination::{Column, Filter, Page, Paginator},
    resolver::AttributeResolver,
    store::{scoped, GraphStore, InMemoryGraphStore, PostgresGraphStore},
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Optional filters for listing objects
#[derive(Debug, Clone, Default)]
pub struct ObjectQuery {
    pub type_id: Option<Uuid>,
    pub alias: Option<String>,
    pub organization_id: Option<Uuid>,
}

/// Optional filters for listing edge types
#[derive(Debug, Clone, Default)]
pub struct EdgeTypeQuery {
    pub source_object_type_id: Option<Uuid>,
    pub target_object_type_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
}

/// Optional filters for listing edges
#[derive(Debug, Clone, Default)]
pub struct EdgeQuery {
    pub edge_type_id: Option<Uuid>,
    pub source_object_id: Option<Uuid>,
    pub target_object_id: Option<Uuid>,
}

/// The operations a REST binding exposes for one tenant's graph.
///
/// Every call is checked by the authorizer, scoped to the caller's
/// organization when the tenant uses organizations, and audited when it
/// changes something.
pub struct AuthzService {
    store: Arc<dyn GraphStore>,
    resolver: AttributeResolver,
    cache: Option<CacheManager>,
    audit: Arc<dyn AuditSink>,
    authorizer: Authorizer,
    use_organizations: bool,
    company_id: Uuid,
}

impl AuthzService {
    /// Service over `store` without a cache
    pub fn new(store: Arc<dyn GraphStore>, search: SearchConfig) -> Self {
        let resolver = AttributeResolver::new(store.clone(), search);
        Self {
            store,
            resolver,
            cache: None,
            audit: Arc::new(TracingAuditSink),
            authorizer: Authorizer::default(),
            use_organizations: false,
            company_id: Uuid::nil(),
        }
    }

    /// Service reading `store` through `cache`
    pub fn with_cache(store: Arc<dyn GraphStore>, cache: CacheManager, search: SearchConfig) -> Self {
        let cached: Arc<dyn GraphStore> = Arc::new(CachedGraphStore::new(store, cache.clone()));
        let mut service = Self::new(cached, search);
        service.cache = Some(cache);
        service
    }

    /// Build the store, cache and resolver described by `config`
    pub async fn from_config(config: &AuthzConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn GraphStore> = match &config.database_url {
            Some(url) => {
                let store = PostgresGraphStore::from_connection_string(url, DEFAULT_MAX_CONNECTIONS).await?;
                store.migrate().await?;
                Arc::new(store)
            }
            None => {
                warn!("No database_url configured, using the in-memory graph store");
                Arc::new(InMemoryGraphStore::new())
            }
        };

        let provider: Option<Arc<dyn CacheProvider>> = match config.cache.provider {
            CacheProviderKind::Memory => Some(Arc::new(InMemoryCache::new())),
            CacheProviderKind::Redis => {
                let url = config.cache.redis_url.as_deref().ok_or_else(|| {
                    GraphError::ConfigError("cache.redis_url is required for the redis provider".to_string())
                })?;
                let redis = RedisCache::new(url).await?;
                redis.ping().await?;
                Some(Arc::new(redis))
            }
            CacheProviderKind::Disabled => None,
        };

        let mut service = match provider {
            Some(provider) => {
                let cache = CacheManager::new(
                    provider,
                    CacheKeys::new(&config.cache.key_prefix, config.tenant_id),
                    config.cache.ttl.resolve(),
                );
                Self::with_cache(store, cache, config.search.clone())
            }
            None => Self::new(store, config.search.clone()),
        };
        if config.use_organizations {
            service = service.with_organizations(config.company_id);
        }

        info!(
            "Authz service ready for tenant {} (cache: {:?}, organizations: {})",
            config.tenant_id, config.cache.provider, config.use_organizations
        );
        Ok(service)
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Authorizer) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Partition the graph by organization; members of `company_id` act across all of them
    pub fn with_organizations(mut self, company_id: Uuid) -> Self {
        self.use_organizations = true;
        self.company_id = company_id;
        self
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn resolver(&self) -> &AttributeResolver {
        &self.resolver
    }

    /// Create the built-in object types if they are missing
    pub async fn provision(&self) -> Result<()> {
        for object_type in [ObjectType::user(), ObjectType::group(), ObjectType::login_app()] {
            let outcome = resolve_create(&object_type, self.store.insert_object_type(&object_type).await)?;
            debug!("Provisioned object type {}: {:?}", object_type.type_name, outcome);
        }
        Ok(())
    }

    // =============================================================================
    // Object types
    // =============================================================================

    pub async fn create_object_type(
        &self,
        caller: &CallerContext,
        mut object_type: ObjectType,
    ) -> Result<(ObjectType, CreateOutcome)> {
        self.authorize(Action::Create, caller)?;
        assign_id(&mut object_type);

        let outcome = resolve_create(&object_type, self.store.insert_object_type(&object_type).await)?;
        let stored = self.store.get_object_type(object_type.base.id).await?;
        if outcome == CreateOutcome::Created {
            self.record(
                caller,
                AuditAction::CreateObjectType,
                json!({ "ID": stored.base.id, "Name": stored.type_name }),
            )
            .await;
        }
        Ok((stored, outcome))
    }

    pub async fn get_object_type(&self, caller: &CallerContext, id: Uuid) -> Result<ObjectType> {
        self.authorize(Action::GetOne, caller)?;
        self.store.get_object_type(id).await
    }

    pub async fn update_object_type(&self, caller: &CallerContext, id: Uuid, type_name: &str) -> Result<ObjectType> {
        self.authorize(Action::Update, caller)?;
        let existing = self.store.get_object_type(id).await?;
        let mut updated = existing.clone();
        updated.type_name = type_name.to_string();
        if existing.equals_ignoring_id(&updated) {
            return Ok(existing);
        }

        let saved = self.store.save_object_type(&updated).await?;
        self.record(
            caller,
            AuditAction::UpdateObjectType,
            json!({ "ID": saved.base.id, "Name": saved.type_name }),
        )
        .await;
        Ok(saved)
    }

    /// Deletes the type with its objects, edge types and edges
    pub async fn delete_object_type(&self, caller: &CallerContext, id: Uuid) -> Result<()> {
        self.authorize(Action::Delete, caller)?;
        self.check_company_caller(caller).await?;

        let object_type = self.store.get_object_type(id).await?;
        if object_type.is_protected() {
            return Err(GraphError::ProtectedEntity(format!(
                "object type {}",
                object_type.type_name
            )));
        }

        self.store.delete_object_type(id).await?;
        self.record(
            caller,
            AuditAction::DeleteObjectType,
            json!({ "ID": id, "Name": object_type.type_name }),
        )
        .await;
        Ok(())
    }

    pub async fn list_object_types(&self, caller: &CallerContext, paginator: &Paginator) -> Result<Page<ObjectType>> {
        self.authorize(Action::GetAll, caller)?;
        self.store.list_object_types(paginator).await
    }

    // =============================================================================
    // Edge types
    // =============================================================================

    pub async fn create_edge_type(
        &self,
        caller: &CallerContext,
        mut edge_type: EdgeType,
    ) -> Result<(EdgeType, CreateOutcome)> {
        self.authorize(Action::Create, caller)?;
        edge_type.organization_id = self
            .validate_organization(caller, edge_type.organization_id)
            .await?;
        assign_id(&mut edge_type);

        let outcome = resolve_create(&edge_type, self.store.insert_edge_type(&edge_type).await)?;
        let stored = self.store.get_edge_type(edge_type.base.id).await?;
        if outcome == CreateOutcome::Created {
            self.record(
                caller,
                AuditAction::CreateEdgeType,
                json!({
                    "ID": stored.base.id,
                    "Name": stored.type_name,
                    "SourceObjectTypeID": stored.source_object_type_id,
                    "TargetObjectTypeID": stored.target_object_type_id,
                    "Attributes": stored.attributes,
                    "OrganizationID": stored.organization_id,
                }),
            )
            .await;
        }
        Ok((stored, outcome))
    }

    pub async fn get_edge_type(&self, caller: &CallerContext, id: Uuid) -> Result<EdgeType> {
        self.authorize(Action::GetOne, caller)?;
        let edge_type = self.store.get_edge_type(id).await?;
        self.validate_organization(caller, edge_type.organization_id).await?;
        Ok(edge_type)
    }

    /// Rename an edge type or replace its attributes. Endpoint types are fixed.
    pub async fn update_edge_type(
        &self,
        caller: &CallerContext,
        id: Uuid,
        type_name: &str,
        attributes: Vec<Attribute>,
    ) -> Result<EdgeType> {
        self.authorize(Action::Update, caller)?;
        let existing = self.store.get_edge_type(id).await?;
        self.validate_organization(caller, existing.organization_id).await?;

        let mut updated = existing.clone();
        updated.type_name = type_name.to_string();
        updated.attributes = attributes;
        if existing.equals_ignoring_id(&updated) {
            return Ok(existing);
        }

        let saved = self.store.save_edge_type(&updated).await?;
        self.record(
            caller,
            AuditAction::UpdateEdgeType,
            json!({
                "ID": saved.base.id,
                "Name": saved.type_name,
                "Attributes": saved.attributes,
            }),
        )
        .await;
        Ok(saved)
    }

    /// Deletes the edge type and every edge of that type
    pub async fn delete_edge_type(&self, caller: &CallerContext, id: Uuid) -> Result<()> {
        self.authorize(Action::Delete, caller)?;
        let edge_type = self.store.get_edge_type(id).await?;
        self.validate_organization(caller, edge_type.organization_id).await?;

        self.store.delete_edge_type(id).await?;
        self.record(
            caller,
            AuditAction::DeleteEdgeType,
            json!({ "ID": id, "Name": edge_type.type_name }),
        )
        .await;
        Ok(())
    }

    pub async fn list_edge_types(
        &self,
        caller: &CallerContext,
        query: &EdgeTypeQuery,
        paginator: &Paginator,
    ) -> Result<Page<EdgeType>> {
        self.authorize(Action::GetAll, caller)?;
        let mut filters = Vec::new();
        if let Some(id) = query.source_object_type_id {
            filters.push(Filter::id(Column::SourceObjectTypeId, id));
        }
        if let Some(id) = query.target_object_type_id {
            filters.push(Filter::id(Column::TargetObjectTypeId, id));
        }
        if let Some(filter) = self.organization_filter(caller, query.organization_id).await? {
            filters.push(filter);
        }
        self.store
            .list_edge_types(&with_filters(paginator, filters))
            .await
    }

    // =============================================================================
    // Objects
    // =============================================================================

    pub async fn create_object(&self, caller: &CallerContext, mut object: Object) -> Result<(Object, CreateOutcome)> {
        self.authorize(Action::Create, caller)?;
        let organization_id = self
            .validate_organization(caller, object.organization_id)
            .await?;
        let needs_organization =
            object.type_id == USER_OBJECT_TYPE_ID || object.type_id == LOGIN_APP_OBJECT_TYPE_ID;

        if !self.use_organizations {
            // users and login apps always carry an organization
            object.organization_id = if needs_organization {
                self.company_id
            } else {
                Uuid::nil()
            };
        } else {
            if organization_id.is_nil() && needs_organization {
                return Err(GraphError::ValidationError(format!(
                    "object {} of type {} needs an organization",
                    object, object.type_id
                )));
            }
            object.organization_id = organization_id;
        }
        assign_id(&mut object);

        let outcome = resolve_create(&object, self.store.insert_object(&object).await)?;
        let stored = self.store.get_object(object.base.id).await?;
        if outcome == CreateOutcome::Created {
            self.record(
                caller,
                AuditAction::CreateObject,
                json!({
                    "ID": stored.base.id,
                    "TypeID": stored.type_id,
                    "Alias": stored.alias,
                    "OrganizationID": stored.organization_id,
                }),
            )
            .await;
        }
        Ok((stored, outcome))
    }

    pub async fn get_object(&self, caller: &CallerContext, id: Uuid) -> Result<Object> {
        self.authorize(Action::GetOne, caller)?;
        let object = self.store.get_object(id).await?;
        self.validate_organization(caller, object.organization_id).await?;
        Ok(object)
    }

    pub async fn update_object(&self, caller: &CallerContext, id: Uuid, alias: Option<&str>) -> Result<Object> {
        self.authorize(Action::Update, caller)?;
        let existing = self.store.get_object(id).await?;
        self.validate_organization(caller, existing.organization_id).await?;

        let mut updated = existing.clone();
        updated.alias = alias.map(str::to_string);
        if existing.equals_ignoring_id(&updated) {
            return Ok(existing);
        }

        let saved = self.store.save_object(&updated).await?;
        self.record(
            caller,
            AuditAction::UpdateObject,
            json!({ "ID": saved.base.id, "Alias": saved.alias }),
        )
        .await;
        Ok(saved)
    }

    /// Deletes the object and every edge touching it
    pub async fn delete_object(&self, caller: &CallerContext, id: Uuid) -> Result<()> {
        self.authorize(Action::Delete, caller)?;
        let object = self.store.get_object(id).await?;
        self.validate_organization(caller, object.organization_id).await?;

        self.store.delete_object(id).await?;
        self.record(
            caller,
            AuditAction::DeleteObject,
            json!({ "ID": id, "TypeID": object.type_id, "Alias": object.alias }),
        )
        .await;
        Ok(())
    }

    pub async fn list_objects(
        &self,
        caller: &CallerContext,
        query: &ObjectQuery,
        paginator: &Paginator,
    ) -> Result<Page<Object>> {
        self.authorize(Action::GetAll, caller)?;
        let mut filters = Vec::new();
        if let Some(type_id) = query.type_id {
            filters.push(Filter::id(Column::TypeId, type_id));
        }
        if let Some(alias) = &query.alias {
            filters.push(Filter::text(Column::Alias, alias));
        }
        if let Some(filter) = self.organization_filter(caller, query.organization_id).await? {
            filters.push(filter);
        }
        self.store.list_objects(&with_filters(paginator, filters)).await
    }

    // =============================================================================
    // Edges
    // =============================================================================

    pub async fn create_edge(&self, caller: &CallerContext, mut edge: Edge) -> Result<(Edge, CreateOutcome)> {
        self.authorize(Action::Create, caller)?;
        self.validate_two_objects(caller, edge.source_object_id, edge.target_object_id, true)
            .await?;
        assign_id(&mut edge);

        let outcome = resolve_create(&edge, self.store.insert_edge(&edge).await)?;
        let stored = self.store.get_edge(edge.base.id).await?;
        if outcome == CreateOutcome::Created {
            self.record(
                caller,
                AuditAction::CreateEdge,
                json!({
                    "ID": stored.base.id,
                    "EdgeTypeID": stored.edge_type_id,
                    "SourceObjectID": stored.source_object_id,
                    "TargetObjectID": stored.target_object_id,
                }),
            )
            .await;
        }
        Ok((stored, outcome))
    }

    pub async fn get_edge(&self, caller: &CallerContext, id: Uuid) -> Result<Edge> {
        self.authorize(Action::GetOne, caller)?;
        let edge = self.store.get_edge(id).await?;
        self.validate_two_objects(caller, edge.source_object_id, edge.target_object_id, false)
            .await?;
        Ok(edge)
    }

    /// The edge of `edge_type_id` from `source_object_id` to `target_object_id`
    pub async fn find_edge(
        &self,
        caller: &CallerContext,
        edge_type_id: Uuid,
        source_object_id: Uuid,
        target_object_id: Uuid,
    ) -> Result<Edge> {
        self.authorize(Action::GetOne, caller)?;
        self.validate_two_objects(caller, source_object_id, target_object_id, false)
            .await?;
        self.store
            .find_edge(edge_type_id, source_object_id, target_object_id)
            .await
    }

    pub async fn delete_edge(&self, caller: &CallerContext, id: Uuid) -> Result<()> {
        self.authorize(Action::Delete, caller)?;
        let edge = self.store.get_edge(id).await?;
        self.validate_two_objects(caller, edge.source_object_id, edge.target_object_id, true)
            .await?;

        self.store.delete_edge(id).await?;
        self.record(
            caller,
            AuditAction::DeleteEdge,
            json!({
                "ID": id,
                "EdgeTypeID": edge.edge_type_id,
                "SourceObjectID": edge.source_object_id,
                "TargetObjectID": edge.target_object_id,
            }),
        )
        .await;
        Ok(())
    }

    pub async fn list_edges(&self, caller: &CallerContext, query: &EdgeQuery, paginator: &Paginator) -> Result<Page<Edge>> {
        self.authorize(Action::GetAll, caller)?;
        self.check_company_caller(caller).await?;
        let mut filters = Vec::new();
        if let Some(id) = query.edge_type_id {
            filters.push(Filter::id(Column::EdgeTypeId, id));
        }
        if let Some(id) = query.source_object_id {
            filters.push(Filter::id(Column::SourceObjectId, id));
        }
        if let Some(id) = query.target_object_id {
            filters.push(Filter::id(Column::TargetObjectId, id));
        }
        self.store.list_edges(&with_filters(paginator, filters)).await
    }

    /// Edges where `object_id` is source or target, optionally only those
    /// also touching `other_object_id`
    pub async fn list_edges_on_object(
        &self,
        caller: &CallerContext,
        object_id: Uuid,
        other_object_id: Option<Uuid>,
        paginator: &Paginator,
    ) -> Result<Page<Edge>> {
        self.authorize_nested(Action::GetAll, caller, object_id)?;
        let object = self.store.get_object(object_id).await?;
        self.validate_organization(caller, object.organization_id).await?;

        let mut filters = vec![touching(object_id)];
        if let Some(other) = other_object_id {
            filters.push(touching(other));
        }
        self.store.list_edges(&with_filters(paginator, filters)).await
    }

    pub async fn delete_all_edges_on_object(&self, caller: &CallerContext, object_id: Uuid) -> Result<u64> {
        self.authorize_nested(Action::DeleteAll, caller, object_id)?;
        let object = self.store.get_object(object_id).await?;
        self.validate_organization(caller, object.organization_id).await?;

        let removed = self.store.delete_edges_for_object(object_id).await?;
        self.record(
            caller,
            AuditAction::DeleteEdgesOnObject,
            json!({ "ObjectID": object_id, "Removed": removed }),
        )
        .await;
        Ok(removed)
    }

    // =============================================================================
    // Organizations
    // =============================================================================

    /// Creates the organization and its group object
    pub async fn create_organization(
        &self,
        caller: &CallerContext,
        mut organization: Organization,
    ) -> Result<(Organization, CreateOutcome)> {
        self.authorize(Action::Create, caller)?;
        self.check_company_caller(caller).await?;
        assign_id(&mut organization);

        let outcome = resolve_create(&organization, self.store.insert_organization(&organization).await)?;
        let stored = self.store.get_organization(organization.base.id).await?;
        if outcome == CreateOutcome::Created {
            self.record(
                caller,
                AuditAction::CreateOrganization,
                json!({ "ID": stored.base.id, "Name": stored.name, "Region": stored.region }),
            )
            .await;
        }
        Ok((stored, outcome))
    }

    pub async fn get_organization(&self, caller: &CallerContext, id: Uuid) -> Result<Organization> {
        self.authorize(Action::GetOne, caller)?;
        self.validate_organization(caller, id).await?;
        self.store.get_organization(id).await
    }

    pub async fn update_organization(
        &self,
        caller: &CallerContext,
        id: Uuid,
        name: &str,
        region: &str,
    ) -> Result<Organization> {
        self.authorize(Action::Update, caller)?;
        self.validate_organization(caller, id).await?;
        let existing = self.store.get_organization(id).await?;

        let mut updated = existing.clone();
        updated.name = name.to_string();
        updated.region = region.to_string();
        if existing.equals_ignoring_id(&updated) {
            return Ok(existing);
        }

        let saved = self.store.save_organization(&updated).await?;
        self.record(
            caller,
            AuditAction::UpdateOrganization,
            json!({ "ID": saved.base.id, "Name": saved.name, "Region": saved.region }),
        )
        .await;
        Ok(saved)
    }

    pub async fn list_organizations(&self, caller: &CallerContext, paginator: &Paginator) -> Result<Page<Organization>> {
        self.authorize(Action::GetAll, caller)?;
        self.check_company_caller(caller).await?;
        self.store.list_organizations(paginator).await
    }

    pub async fn delete_organization(&self, caller: &CallerContext, id: Uuid) -> Result<()> {
        self.authorize(Action::Delete, caller)?;
        Err(GraphError::Unsupported(format!("deleting organization {}", id)))
    }

    // =============================================================================
    // Organization migration
    // =============================================================================

    /// Move an object to another organization
    pub async fn migrate_object(&self, caller: &CallerContext, id: Uuid, organization_id: Uuid) -> Result<Object> {
        self.authorize(Action::Migrate, caller)?;
        self.check_company_caller(caller).await?;

        let mut object = self.store.get_object(id).await?;
        let from = object.organization_id;
        object.organization_id = organization_id;
        let saved = self.store.save_object(&object).await?;

        self.record(
            caller,
            AuditAction::MigrateObject,
            json!({ "ID": id, "From": from, "To": organization_id }),
        )
        .await;
        Ok(saved)
    }

    /// Move an edge type to another organization
    pub async fn migrate_edge_type(&self, caller: &CallerContext, id: Uuid, organization_id: Uuid) -> Result<EdgeType> {
        self.authorize(Action::Migrate, caller)?;
        self.check_company_caller(caller).await?;

        let mut edge_type = self.store.get_edge_type(id).await?;
        let from = edge_type.organization_id;
        edge_type.organization_id = organization_id;
        let saved = self.store.save_edge_type(&edge_type).await?;

        self.record(
            caller,
            AuditAction::MigrateEdgeType,
            json!({ "ID": id, "From": from, "To": organization_id }),
        )
        .await;
        Ok(saved)
    }

    // =============================================================================
    // Attribute queries
    // =============================================================================

    pub async fn check_attribute(
        &self,
        caller: &CallerContext,
        source_object_id: Uuid,
        target_object_id: Uuid,
        attribute: &str,
    ) -> Result<CheckAttributeResponse> {
        self.authorize(Action::Query, caller)?;
        require_attribute(attribute)?;
        self.validate_two_objects(caller, source_object_id, target_object_id, false)
            .await?;
        self.resolver
            .check_attribute(source_object_id, target_object_id, attribute)
            .await
    }

    pub async fn list_attributes(
        &self,
        caller: &CallerContext,
        source_object_id: Uuid,
        target_object_id: Uuid,
    ) -> Result<Vec<String>> {
        self.authorize(Action::Query, caller)?;
        self.validate_two_objects(caller, source_object_id, target_object_id, false)
            .await?;
        self.resolver
            .list_attributes(source_object_id, target_object_id)
            .await
    }

    pub async fn list_objects_reachable_with_attribute(
        &self,
        caller: &CallerContext,
        source_object_id: Uuid,
        target_object_type_id: Uuid,
        attribute: &str,
    ) -> Result<Vec<Uuid>> {
        self.authorize(Action::Query, caller)?;
        require_attribute(attribute)?;
        let source = self.store.get_object(source_object_id).await?;
        self.validate_organization(caller, source.organization_id).await?;
        self.store.get_object_type(target_object_type_id).await?;
        self.resolver
            .list_objects_reachable_with_attribute(source_object_id, target_object_type_id, attribute)
            .await
    }

    // =============================================================================
    // Cache administration
    // =============================================================================

    /// Drop everything cached for the tenant; returns how many keys went
    pub async fn flush_cache(&self, caller: &CallerContext) -> Result<u64> {
        self.authorize(Action::DeleteAll, caller)?;
        match &self.cache {
            Some(cache) => cache.flush_tenant().await,
            None => Ok(0),
        }
    }

    /// Cached entries whose key, within the tenant namespace, starts with `prefix`
    pub async fn dump_cache(&self, caller: &CallerContext, prefix: &str) -> Result<Vec<(String, String)>> {
        self.authorize(Action::GetAll, caller)?;
        match &self.cache {
            Some(cache) => cache.log_key_values(prefix).await,
            None => Ok(Vec::new()),
        }
    }

    // =============================================================================
    // Helpers
    // =============================================================================

    fn authorize(&self, action: Action, caller: &CallerContext) -> Result<()> {
        self.authorizer.authorize(action, caller, None)
    }

    fn authorize_nested(&self, action: Action, caller: &CallerContext, parent: Uuid) -> Result<()> {
        self.authorizer.nested().authorize(action, caller, Some(parent))
    }

    async fn record(&self, caller: &CallerContext, action: AuditAction, data: serde_json::Value) {
        let entry = AuditEntry::new(action, &caller.subject, data);
        if let Err(e) = self.audit.record(entry).await {
            warn!("Failed to record audit entry {}: {}", action.as_str(), e);
        }
    }

    /// Organization of the caller's own graph object
    async fn subject_organization(&self, caller: &CallerContext) -> Result<Uuid> {
        let Some(subject_id) = caller.subject_id else {
            return Ok(caller.organization_id);
        };
        match self.store.get_object(subject_id).await {
            Ok(subject) => Ok(subject.organization_id),
            Err(GraphError::NotFound(_)) => Err(GraphError::Forbidden(format!(
                "could not find organization for subject {}",
                subject_id
            ))),
            Err(e) => Err(e),
        }
    }

    /// Check the caller may act in `requested` and return the organization
    /// to use. A nil request resolves to the caller's own organization.
    async fn validate_organization(&self, caller: &CallerContext, requested: Uuid) -> Result<Uuid> {
        if !self.use_organizations {
            return Ok(Uuid::nil());
        }

        let allowed = |org: Uuid| org == self.company_id || (!requested.is_nil() && org == requested);
        if allowed(caller.organization_id) {
            return Ok(requested);
        }

        let subject_org = self.subject_organization(caller).await?;
        if subject_org != caller.organization_id {
            warn!(
                "Token organization {} differs from subject organization {} for {}",
                caller.organization_id, subject_org, caller.subject
            );
            if allowed(subject_org) {
                return Ok(requested);
            }
        }
        if subject_org.is_nil() {
            return Err(GraphError::Forbidden(format!(
                "{} has no organization",
                caller.subject
            )));
        }
        if requested.is_nil() {
            return Ok(subject_org);
        }
        Err(GraphError::Forbidden(format!(
            "requested organization {} does not match caller organization {}",
            requested, subject_org
        )))
    }

    /// Either object passing is enough unless `both` is set
    async fn validate_two_objects(&self, caller: &CallerContext, first: Uuid, second: Uuid, both: bool) -> Result<()> {
        if !self.use_organizations {
            return Ok(());
        }

        let object = self.store.get_object(first).await?;
        match self.validate_organization(caller, object.organization_id).await {
            Ok(_) if !both || first == second => return Ok(()),
            Ok(_) => {}
            Err(e) if both => return Err(e),
            Err(_) => {}
        }

        let object = self.store.get_object(second).await?;
        self.validate_organization(caller, object.organization_id).await?;
        Ok(())
    }

    /// Tenant-wide operations are reserved for members of the company organization
    async fn check_company_caller(&self, caller: &CallerContext) -> Result<()> {
        if !self.use_organizations || caller.organization_id == self.company_id {
            return Ok(());
        }
        if self.subject_organization(caller).await? == self.company_id {
            return Ok(());
        }
        Err(GraphError::Forbidden(format!(
            "{} is not a member of the company organization",
            caller.subject
        )))
    }

    async fn organization_filter(&self, caller: &CallerContext, requested: Option<Uuid>) -> Result<Option<Filter>> {
        if let Some(organization_id) = requested {
            self.validate_organization(caller, organization_id).await?;
            return Ok(Some(Filter::id(Column::OrganizationId, organization_id)));
        }
        if self.check_company_caller(caller).await.is_ok() {
            return Ok(None);
        }
        let organization_id = self.validate_organization(caller, Uuid::nil()).await?;
        Ok(Some(Filter::Or(vec![
            Filter::id(Column::OrganizationId, organization_id),
            Filter::id(Column::OrganizationId, Uuid::nil()),
        ])))
    }
}

fn assign_id<T: Entity>(entity: &mut T) {
    if entity.id().is_nil() {
        entity.base_mut().id = Uuid::new_v4();
    }
}

/// A conflict with a row carrying the same ID and payload is a repeat of an
/// earlier create, not an error
fn resolve_create<T: Entity>(incoming: &T, inserted: Result<()>) -> Result<CreateOutcome> {
    match inserted {
        Ok(()) => Ok(CreateOutcome::Created),
        Err(GraphError::Conflict { id, identical: true }) if id == incoming.id() => {
            debug!("Identical {} {} already exists", T::KIND, id);
            Ok(CreateOutcome::Identical)
        }
        Err(e) => Err(e),
    }
}

fn require_attribute(attribute: &str) -> Result<()> {
    if attribute.trim().is_empty() {
        return Err(GraphError::ValidationError("attribute must not be empty".to_string()));
    }
    Ok(())
}

fn touching(object_id: Uuid) -> Filter {
    Filter::Or(vec![
        Filter::id(Column::SourceObjectId, object_id),
        Filter::id(Column::TargetObjectId, object_id),
    ])
}

fn with_filters(paginator: &Paginator, mut filters: Vec<Filter>) -> Paginator {
    match filters.len() {
        0 => paginator.clone(),
        1 => scoped(paginator, filters.remove(0)),
        _ => scoped(paginator, Filter::And(filters)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MockAuditSink;
    use crate::authorizer::CallerRole;

    fn admin() -> CallerContext {
        CallerContext::new("admin", Uuid::nil(), CallerRole::Admin)
    }

    #[tokio::test]
    async fn test_update_without_change_skips_write_and_audit() {
        let mut audit = MockAuditSink::new();
        // exactly one entry: the create
        audit.expect_record().times(1).returning(|_| Ok(()));

        let service = AuthzService::new(Arc::new(InMemoryGraphStore::new()), SearchConfig::default())
            .with_audit(Arc::new(audit));
        let (created, _) = service
            .create_object_type(&admin(), ObjectType::new("document"))
            .await
            .unwrap();

        let unchanged = service
            .update_object_type(&admin(), created.base.id, "document")
            .await
            .unwrap();
        assert_eq!(unchanged.base.version, created.base.version);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_the_request() {
        let mut audit = MockAuditSink::new();
        audit
            .expect_record()
            .returning(|_| Err(GraphError::StorageError("audit log offline".to_string())));

        let service = AuthzService::new(Arc::new(InMemoryGraphStore::new()), SearchConfig::default())
            .with_audit(Arc::new(audit));
        let (_, outcome) = service
            .create_object_type(&admin(), ObjectType::new("document"))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
    }

    #[tokio::test]
    async fn test_protected_types_cannot_be_deleted() {
        let service = AuthzService::new(Arc::new(InMemoryGraphStore::new()), SearchConfig::default());
        service.provision().await.unwrap();
        // provisioning twice is harmless
        service.provision().await.unwrap();

        let err = service
            .delete_object_type(&admin(), USER_OBJECT_TYPE_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::ProtectedEntity(_)));
        assert!(service.get_object_type(&admin(), USER_OBJECT_TYPE_ID).await.is_ok());
    }

    #[tokio::test]
    async fn test_members_cannot_write() {
        let service = AuthzService::new(Arc::new(InMemoryGraphStore::new()), SearchConfig::default());
        let member = CallerContext::new("bob", Uuid::nil(), CallerRole::Member);
        let err = service
            .create_object_type(&member, ObjectType::new("document"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_empty_attribute_is_rejected() {
        let service = AuthzService::new(Arc::new(InMemoryGraphStore::new()), SearchConfig::default());
        let err = service
            .check_attribute(&admin(), Uuid::new_v4(), Uuid::new_v4(), " ")
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::ValidationError(_)));
    }
}
