//! Cursor pagination and list filters shared by every store.
//!
//! A cursor is an opaque base64 string naming a sort key and the last value
//! seen on the current page. Filters are small boolean trees over indexed
//! columns; the in-memory store evaluates them directly and the Postgres
//! store renders them to a parameterised `WHERE` clause.

use crate::error::{GraphError, Result};
use crate::models::{Edge, EdgeType, Entity, Object, ObjectType, Organization};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SortKey {
    #[default]
    Id,
    Created,
}

/// Position of an entity under a sort key; `created` is only set when sorting by creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SortValue {
    pub created: Option<DateTime<Utc>>,
    pub id: Uuid,
}

impl SortValue {
    pub fn of<T: Entity>(entity: &T, key: SortKey) -> Self {
        let base = entity.base();
        Self {
            created: match key {
                SortKey::Id => None,
                SortKey::Created => Some(base.created),
            },
            id: base.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Position {
    Start,
    End,
    After(SortValue),
    Before(SortValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CursorPayload {
    key: SortKey,
    position: Position,
}

/// Opaque page cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn start() -> Self {
        Self::encode(SortKey::Id, Position::Start)
    }

    pub fn end() -> Self {
        Self::encode(SortKey::Id, Position::End)
    }

    pub fn parse(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn encode(key: SortKey, position: Position) -> Self {
        // serializing plain data into a Vec cannot fail
        let json = serde_json::to_vec(&CursorPayload { key, position }).unwrap_or_default();
        Self(BASE64.encode(json))
    }

    fn decode(&self) -> Result<CursorPayload> {
        let bytes = BASE64
            .decode(self.0.as_bytes())
            .map_err(|e| GraphError::ValidationError(format!("invalid cursor: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GraphError::ValidationError(format!("invalid cursor: {}", e)))
    }
}

/// Paging metadata returned with every page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResponseFields {
    pub has_next: bool,
    pub has_prev: bool,
    pub next: Option<Cursor>,
    pub prev: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(flatten)]
    pub fields: ResponseFields,
}

/// Where a store should start reading and in which direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Ascending from the beginning, or strictly after the given value
    Forward(Option<SortValue>),
    /// Descending from the end, or strictly before the given value
    Backward(Option<SortValue>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paginator {
    cursor: Option<Cursor>,
    limit: usize,
    sort_key: SortKey,
    filter: Option<Filter>,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_LIMIT,
            sort_key: SortKey::Id,
            filter: None,
        }
    }
}

impl Paginator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Limits above `MAX_LIMIT` are clamped; zero falls back to the default
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = match limit {
            0 => DEFAULT_LIMIT,
            n => n.min(MAX_LIMIT),
        };
        self
    }

    pub fn with_sort_key(mut self, sort_key: SortKey) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn sort_key(&self) -> SortKey {
        self.sort_key
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// True when this request reads the first page
    pub fn is_at_start(&self) -> bool {
        self.cursor.is_none()
            || matches!(self.bound(), Ok(Bound::Forward(None)))
    }

    /// Decode the cursor into a read bound. A cursor minted for another sort key is rejected.
    pub fn bound(&self) -> Result<Bound> {
        let Some(cursor) = &self.cursor else {
            return Ok(Bound::Forward(None));
        };
        let payload = cursor.decode()?;
        match payload.position {
            Position::Start => Ok(Bound::Forward(None)),
            Position::End => Ok(Bound::Backward(None)),
            Position::After(_) | Position::Before(_) if payload.key != self.sort_key => {
                Err(GraphError::ValidationError(format!(
                    "cursor was issued for sort key {:?}, not {:?}",
                    payload.key, self.sort_key
                )))
            }
            Position::After(v) => Ok(Bound::Forward(Some(v))),
            Position::Before(v) => Ok(Bound::Backward(Some(v))),
        }
    }

    /// Validate the filter against the columns `T` exposes
    pub fn validate<T: Filterable>(&self) -> Result<()> {
        self.bound()?;
        if let Some(filter) = &self.filter {
            filter.validate::<T>()?;
        }
        Ok(())
    }

    /// Turn a raw window read by a store into a page.
    ///
    /// `window` holds up to `limit + 1` rows in read order (ascending for a
    /// forward bound, descending for a backward bound). The extra row only
    /// signals that more data exists in the read direction.
    pub fn finish<T: Entity>(&self, mut window: Vec<T>) -> Result<Page<T>> {
        let bound = self.bound()?;
        let more = window.len() > self.limit;
        window.truncate(self.limit);

        let (has_next, has_prev) = match bound {
            Bound::Forward(after) => (more, after.is_some()),
            Bound::Backward(before) => {
                window.reverse();
                (before.is_some(), more)
            }
        };

        let next = match (has_next, window.last()) {
            (true, Some(last)) => Some(Cursor::encode(
                self.sort_key,
                Position::After(SortValue::of(last, self.sort_key)),
            )),
            _ => None,
        };
        let prev = match (has_prev, window.first()) {
            (true, Some(first)) => Some(Cursor::encode(
                self.sort_key,
                Position::Before(SortValue::of(first, self.sort_key)),
            )),
            _ => None,
        };

        Ok(Page {
            data: window,
            fields: ResponseFields {
                has_next,
                has_prev,
                next,
                prev,
            },
        })
    }

    /// Page over a fully materialised collection. Used by the in-memory store.
    pub fn paginate<T: Entity + Filterable>(&self, items: Vec<T>) -> Result<Page<T>> {
        self.validate::<T>()?;
        let key = self.sort_key;
        let mut matching: Vec<T> = items
            .into_iter()
            .filter(|item| self.filter.as_ref().map_or(true, |f| f.matches(item)))
            .collect();
        matching.sort_by_key(|item| SortValue::of(item, key));

        let take = self.limit.saturating_add(1);
        let window: Vec<T> = match self.bound()? {
            Bound::Forward(after) => matching
                .into_iter()
                .filter(|item| after.map_or(true, |a| SortValue::of(item, key) > a))
                .take(take)
                .collect(),
            Bound::Backward(before) => matching
                .into_iter()
                .rev()
                .filter(|item| before.map_or(true, |b| SortValue::of(item, key) < b))
                .take(take)
                .collect(),
        };
        self.finish(window)
    }

    /// Paginator for the page after `fields`, if there is one
    pub fn advance(&self, fields: &ResponseFields) -> Option<Paginator> {
        fields.next.as_ref().map(|next| Paginator {
            cursor: Some(next.clone()),
            ..self.clone()
        })
    }
}

// =============================================================================
// Filters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Id,
    TypeName,
    TypeId,
    Alias,
    OrganizationId,
    SourceObjectTypeId,
    TargetObjectTypeId,
    EdgeTypeId,
    SourceObjectId,
    TargetObjectId,
    Name,
    Region,
}

impl Column {
    pub fn sql_name(self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::TypeName => "type_name",
            Column::TypeId => "type_id",
            Column::Alias => "alias",
            Column::OrganizationId => "organization_id",
            Column::SourceObjectTypeId => "source_object_type_id",
            Column::TargetObjectTypeId => "target_object_type_id",
            Column::EdgeTypeId => "edge_type_id",
            Column::SourceObjectId => "source_object_id",
            Column::TargetObjectId => "target_object_id",
            Column::Name => "name",
            Column::Region => "region",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterValue {
    Uuid(Uuid),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(Column, FilterValue),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn id(column: Column, value: Uuid) -> Self {
        Filter::Eq(column, FilterValue::Uuid(value))
    }

    pub fn text(column: Column, value: &str) -> Self {
        Filter::Eq(column, FilterValue::Text(value.to_string()))
    }

    pub fn matches<T: Filterable>(&self, item: &T) -> bool {
        match self {
            Filter::Eq(column, value) => item.column(*column).as_ref() == Some(value),
            Filter::And(parts) => parts.iter().all(|f| f.matches(item)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(item)),
        }
    }

    pub fn validate<T: Filterable>(&self) -> Result<()> {
        match self {
            Filter::Eq(column, _) if !T::COLUMNS.contains(column) => {
                Err(GraphError::ValidationError(format!(
                    "cannot filter {} by {}",
                    T::KIND,
                    column.sql_name()
                )))
            }
            Filter::Eq(..) => Ok(()),
            Filter::And(parts) | Filter::Or(parts) if parts.is_empty() => Err(
                GraphError::ValidationError("empty filter group".to_string()),
            ),
            Filter::And(parts) | Filter::Or(parts) => {
                parts.iter().try_for_each(Filter::validate::<T>)
            }
        }
    }

    /// Render as SQL, pushing bind values in placeholder order
    pub fn to_sql(&self, binds: &mut Vec<FilterValue>, first_placeholder: usize) -> String {
        match self {
            Filter::Eq(column, value) => {
                binds.push(value.clone());
                let n = first_placeholder + binds.len() - 1;
                format!("{} = ${}", column.sql_name(), n)
            }
            Filter::And(parts) => Self::join(parts, " AND ", binds, first_placeholder),
            Filter::Or(parts) => Self::join(parts, " OR ", binds, first_placeholder),
        }
    }

    fn join(
        parts: &[Filter],
        op: &str,
        binds: &mut Vec<FilterValue>,
        first_placeholder: usize,
    ) -> String {
        let rendered: Vec<String> = parts
            .iter()
            .map(|p| p.to_sql(binds, first_placeholder))
            .collect();
        format!("({})", rendered.join(op))
    }
}

/// Entities whose columns can be filtered on
pub trait Filterable: Entity {
    const COLUMNS: &'static [Column];

    fn column(&self, column: Column) -> Option<FilterValue>;
}

impl Filterable for ObjectType {
    const COLUMNS: &'static [Column] = &[Column::Id, Column::TypeName];

    fn column(&self, column: Column) -> Option<FilterValue> {
        match column {
            Column::Id => Some(FilterValue::Uuid(self.base.id)),
            Column::TypeName => Some(FilterValue::Text(self.type_name.clone())),
            _ => None,
        }
    }
}

impl Filterable for EdgeType {
    const COLUMNS: &'static [Column] = &[
        Column::Id,
        Column::TypeName,
        Column::SourceObjectTypeId,
        Column::TargetObjectTypeId,
        Column::OrganizationId,
    ];

    fn column(&self, column: Column) -> Option<FilterValue> {
        match column {
            Column::Id => Some(FilterValue::Uuid(self.base.id)),
            Column::TypeName => Some(FilterValue::Text(self.type_name.clone())),
            Column::SourceObjectTypeId => Some(FilterValue::Uuid(self.source_object_type_id)),
            Column::TargetObjectTypeId => Some(FilterValue::Uuid(self.target_object_type_id)),
            Column::OrganizationId => Some(FilterValue::Uuid(self.organization_id)),
            _ => None,
        }
    }
}

impl Filterable for Object {
    const COLUMNS: &'static [Column] = &[
        Column::Id,
        Column::TypeId,
        Column::Alias,
        Column::OrganizationId,
    ];

    fn column(&self, column: Column) -> Option<FilterValue> {
        match column {
            Column::Id => Some(FilterValue::Uuid(self.base.id)),
            Column::TypeId => Some(FilterValue::Uuid(self.type_id)),
            Column::Alias => self.alias.clone().map(FilterValue::Text),
            Column::OrganizationId => Some(FilterValue::Uuid(self.organization_id)),
            _ => None,
        }
    }
}

impl Filterable for Edge {
    const COLUMNS: &'static [Column] = &[
        Column::Id,
        Column::EdgeTypeId,
        Column::SourceObjectId,
        Column::TargetObjectId,
    ];

    fn column(&self, column: Column) -> Option<FilterValue> {
        match column {
            Column::Id => Some(FilterValue::Uuid(self.base.id)),
            Column::EdgeTypeId => Some(FilterValue::Uuid(self.edge_type_id)),
            Column::SourceObjectId => Some(FilterValue::Uuid(self.source_object_id)),
            Column::TargetObjectId => Some(FilterValue::Uuid(self.target_object_id)),
            _ => None,
        }
    }
}

impl Filterable for Organization {
    const COLUMNS: &'static [Column] = &[Column::Id, Column::Name, Column::Region];

    fn column(&self, column: Column) -> Option<FilterValue> {
        match column {
            Column::Id => Some(FilterValue::Uuid(self.base.id)),
            Column::Name => Some(FilterValue::Text(self.name.clone())),
            Column::Region => Some(FilterValue::Text(self.region.clone())),
            _ => None,
        }
    }
}
