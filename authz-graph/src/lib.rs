//! Relationship-based authorization graph.
//!
//! Tenants model their domain as typed objects joined by typed edges. Each
//! edge type carries attributes with three flags:
//!
//! - `direct`: the edge grants the attribute from its source to its target
//! - `inherit`: the source inherits what the target holds
//! - `propagate`: what reaches the source also reaches the target
//!
//! A source holds an attribute on a target when some path
//! `inherit* -> direct -> propagate*` joins them. [`AttributeResolver`]
//! answers those questions over any [`GraphStore`]; [`CachedGraphStore`]
//! puts a tenant-scoped cache in front of one, and [`AuthzService`] adds
//! authorization, organization scoping and audit on top.

pub mod audit;
pub mod authorizer;
pub mod cache;
pub mod cached_store;
pub mod config;
pub mod error;
pub mod models;
pub mod pagination;
pub mod region;
pub mod resolver;
pub mod service;
pub mod store;
pub mod telemetry;

pub use audit::{AuditAction, AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use authorizer::{Action, Authorizer, CallerContext, CallerRole};
pub use cache::{CacheKeys, CacheManager, CacheProvider, CacheTtls, InMemoryCache, RedisCache};
pub use cached_store::CachedGraphStore;
pub use config::{AuthzConfig, CacheConfig, CacheProviderKind, SearchConfig};
pub use error::{GraphError, Result};
pub use models::*;
pub use pagination::{Column, Cursor, Filter, Page, Paginator, ResponseFields, SortKey};
pub use resolver::AttributeResolver;
pub use service::{AuthzService, EdgeQuery, EdgeTypeQuery, ObjectQuery};
pub use store::{GraphStore, InMemoryGraphStore, PostgresGraphStore};
