use crate::{
    config::SearchConfig,
    error::{GraphError, Result},
    models::*,
    pagination::{Paginator, MAX_LIMIT},
    region::{self, REGION_CONFLICT_MESSAGE},
    store::{collect_all, GraphStore},
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Answers attribute questions by walking the graph.
///
/// An attribute `A` is granted from `S` to `T` by a chain of edges that
/// starts with zero or more edges inheriting `A` out of `S`, crosses exactly
/// one edge granting `A` directly, and ends with zero or more edges
/// propagating `A` into `T`:
///
/// ```text
/// S -inherit-> .. -inherit-> u -direct-> v -propagate-> .. -propagate-> T
/// ```
///
/// All search state lives in the call; the resolver itself is stateless
/// apart from the store it reads through.
#[derive(Clone)]
pub struct AttributeResolver {
    store: Arc<dyn GraphStore>,
    config: SearchConfig,
}

impl AttributeResolver {
    pub fn new(store: Arc<dyn GraphStore>, config: SearchConfig) -> Self {
        Self { store, config }
    }

    /// Same resolver with a different per-query time budget
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Does `source` hold `attribute` on `target`, and along which edges?
    ///
    /// The path is the shortest by hop count; among equally short paths the
    /// one whose edge IDs sort first wins, so the answer is stable for an
    /// unchanged graph.
    pub async fn check_attribute(
        &self,
        source_object_id: Uuid,
        target_object_id: Uuid,
        attribute: &str,
    ) -> Result<CheckAttributeResponse> {
        debug!(
            "Checking {} on {} -> {}",
            attribute, source_object_id, target_object_id
        );
        let mut search = self.search();
        let path = self
            .bounded(
                PathSearch::new(&mut search, attribute, source_object_id, target_object_id).run(),
            )
            .await?;

        Ok(match path {
            Some(path) => CheckAttributeResponse {
                has_attribute: true,
                path,
            },
            None => CheckAttributeResponse::denied(),
        })
    }

    /// Every attribute `source` holds on `target`, sorted by name
    pub async fn list_attributes(&self, source_object_id: Uuid, target_object_id: Uuid) -> Result<Vec<String>> {
        let mut search = self.search();
        self.bounded(async move {
            // names that could start a grant out of the source
            let mut candidates: HashMap<String, bool> = HashMap::new();
            for edge in search.edges(source_object_id, Direction::Outgoing).await? {
                let edge_type = search.edge_type(&edge).await?;
                for attr in edge_type.attributes.iter().filter(|a| a.direct || a.inherit) {
                    candidates.entry(attr.name.clone()).or_insert(false);
                }
            }
            if candidates.is_empty() {
                return Ok(Vec::new());
            }

            // ... and could finish one into the target
            for edge in search.edges(target_object_id, Direction::Incoming).await? {
                let edge_type = search.edge_type(&edge).await?;
                for attr in edge_type.attributes.iter().filter(|a| a.direct || a.propagate) {
                    if let Some(confirmed) = candidates.get_mut(&attr.name) {
                        *confirmed = true;
                    }
                }
            }

            let confirmed: BTreeSet<String> = candidates
                .into_iter()
                .filter_map(|(name, confirmed)| confirmed.then_some(name))
                .collect();
            debug!(
                "{} candidate attributes between {} and {}",
                confirmed.len(),
                source_object_id,
                target_object_id
            );

            // both ends matching is necessary but not sufficient
            let mut held = Vec::new();
            for name in confirmed {
                search.reset_states();
                let path = PathSearch::new(&mut search, &name, source_object_id, target_object_id)
                    .run()
                    .await?;
                if path.is_some() {
                    held.push(name);
                }
            }
            Ok(held)
        })
        .await
    }

    /// Objects of `target_object_type_id` on which `source` holds
    /// `attribute`, in discovery order
    pub async fn list_objects_reachable_with_attribute(
        &self,
        source_object_id: Uuid,
        target_object_type_id: Uuid,
        attribute: &str,
    ) -> Result<Vec<Uuid>> {
        let mut search = self.search();
        self.bounded(async move {
            let mut seen: HashSet<(Uuid, Role)> = HashSet::new();
            let mut frontier = vec![(source_object_id, Role::Inheriting)];
            seen.insert((source_object_id, Role::Inheriting));
            search.count_state()?;
            let mut reachable = Vec::new();

            while !frontier.is_empty() {
                search.check_deadline()?;
                let mut next = Vec::new();
                for (object_id, role) in frontier {
                    for (edge, attr) in search.carrying(object_id, Direction::Outgoing, attribute).await? {
                        let target = edge.target_object_id;
                        let mut steps = Vec::with_capacity(2);
                        match role {
                            Role::Inheriting => {
                                if attr.inherit {
                                    steps.push(Role::Inheriting);
                                }
                                if attr.direct {
                                    steps.push(Role::Granted);
                                }
                            }
                            Role::Granted => {
                                if attr.propagate {
                                    steps.push(Role::Granted);
                                }
                            }
                        }

                        for step in steps {
                            if !seen.insert((target, step)) {
                                continue;
                            }
                            search.count_state()?;
                            next.push((target, step));
                            if step == Role::Granted
                                && search.object_type_of(&edge).await? == target_object_type_id
                            {
                                reachable.push(target);
                            }
                        }
                    }
                }
                frontier = next;
            }
            Ok(reachable)
        })
        .await
    }

    fn search(&self) -> Search {
        Search {
            store: self.store.clone(),
            edge_types: HashMap::new(),
            deadline: Instant::now() + self.config.timeout(),
            timeout_ms: self.config.timeout_ms,
            max_candidates: self.config.max_candidates,
            states: 0,
        }
    }

    /// Run a query under the configured time budget. Dropping the future
    /// cancels any storage call still in flight.
    async fn bounded<T>(&self, query: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.timeout(), query).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Graph search exceeded {} ms", self.config.timeout_ms);
                Err(GraphError::DeadlineExceeded(self.config.timeout_ms))
            }
        }
    }
}

// =============================================================================
// Per-query search context
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

/// What the walk has established about an object in a reachability search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    /// Reached through inheriting edges only; may still cross a direct edge
    Inheriting,
    /// Past the direct edge; only propagating edges continue
    Granted,
}

struct Search {
    store: Arc<dyn GraphStore>,
    edge_types: HashMap<Uuid, EdgeType>,
    deadline: Instant,
    timeout_ms: u64,
    max_candidates: usize,
    states: usize,
}

impl Search {
    fn check_deadline(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(GraphError::DeadlineExceeded(self.timeout_ms));
        }
        Ok(())
    }

    fn count_state(&mut self) -> Result<()> {
        self.states += 1;
        if self.states > self.max_candidates {
            warn!("Graph search visited more than {} states", self.max_candidates);
            return Err(GraphError::SearchLimitExceeded {
                limit: self.max_candidates,
            });
        }
        Ok(())
    }

    fn reset_states(&mut self) {
        self.states = 0;
    }

    /// All edges on one side of an object, ordered by edge ID
    async fn edges(&self, object_id: Uuid, direction: Direction) -> Result<Vec<Edge>> {
        let store = &self.store;
        let mut edges = collect_all(Paginator::new().with_limit(MAX_LIMIT), |page| async move {
            match direction {
                Direction::Outgoing => store.list_outgoing_edges(object_id, &page).await,
                Direction::Incoming => store.list_incoming_edges(object_id, &page).await,
            }
        })
        .await?;
        edges.sort_by_key(|e| e.base.id);
        Ok(edges)
    }

    async fn edge_type(&mut self, edge: &Edge) -> Result<&EdgeType> {
        if !self.edge_types.contains_key(&edge.edge_type_id) {
            let edge_type = match self.store.get_edge_type(edge.edge_type_id).await {
                Ok(edge_type) => edge_type,
                Err(GraphError::NotFound(_)) => {
                    return Err(region::edge_type_desync(self.store.as_ref(), edge).await)
                }
                Err(e) => return Err(e),
            };
            self.edge_types.insert(edge.edge_type_id, edge_type);
        }
        self.edge_types
            .get(&edge.edge_type_id)
            .ok_or_else(|| GraphError::not_found(EdgeType::KIND, edge.edge_type_id))
    }

    /// Edges on one side of an object whose type defines `attribute`
    async fn carrying(
        &mut self,
        object_id: Uuid,
        direction: Direction,
        attribute: &str,
    ) -> Result<Vec<(Edge, Attribute)>> {
        let mut out = Vec::new();
        for edge in self.edges(object_id, direction).await? {
            if let Some(attr) = self.edge_type(&edge).await?.attribute(attribute) {
                let attr = attr.clone();
                out.push((edge, attr));
            }
        }
        Ok(out)
    }

    async fn object_type_of(&self, edge: &Edge) -> Result<Uuid> {
        match self.store.get_object(edge.target_object_id).await {
            Ok(object) => Ok(object.type_id),
            // the edge outlived its target: a delete elsewhere is still replicating
            Err(GraphError::NotFound(_)) => {
                warn!(
                    "Edge {} points at missing object {}",
                    edge.base.id, edge.target_object_id
                );
                Err(GraphError::RegionConflict(REGION_CONFLICT_MESSAGE.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Bidirectional path search
// =============================================================================

#[derive(Debug, Clone)]
struct Step {
    depth: usize,
    /// Edge the object was discovered through; `None` at the search roots
    via: Option<Edge>,
}

/// Per-object entry in the shared visited map, tagged by discovering side
#[derive(Debug, Default)]
struct Visit {
    forward: Option<Step>,
    backward: Option<Step>,
}

/// A direct edge joining the two sides
#[derive(Debug)]
struct Connection {
    length: usize,
    from: Uuid,
    edge: Edge,
    to: Uuid,
}

/// One check: the forward side follows inheriting edges out of the source,
/// the backward side follows propagating edges into the target, and a
/// direct edge from a forward object to a backward object completes a path.
///
/// Each step expands one whole level of the smaller open frontier. After
/// each step the shortest path still undiscovered has a known lower bound;
/// the search stops once the best connection found is strictly shorter, so
/// every shortest path has been seen before ties are broken.
struct PathSearch<'a> {
    search: &'a mut Search,
    attribute: &'a str,
    visited: HashMap<Uuid, Visit>,
    forward: Vec<Uuid>,
    backward: Vec<Uuid>,
    forward_depth: usize,
    backward_depth: usize,
    /// Direct edges seen by the forward side, keyed by target
    forward_directs: HashMap<Uuid, Vec<(Uuid, Edge)>>,
    /// Direct edges seen by the backward side, keyed by source
    backward_directs: HashMap<Uuid, Vec<(Edge, Uuid)>>,
    connections: Vec<Connection>,
}

impl<'a> PathSearch<'a> {
    fn new(search: &'a mut Search, attribute: &'a str, source: Uuid, target: Uuid) -> Self {
        let mut visited: HashMap<Uuid, Visit> = HashMap::new();
        visited.entry(source).or_default().forward = Some(Step { depth: 0, via: None });
        visited.entry(target).or_default().backward = Some(Step { depth: 0, via: None });
        Self {
            search,
            attribute,
            visited,
            forward: vec![source],
            backward: vec![target],
            forward_depth: 0,
            backward_depth: 0,
            forward_directs: HashMap::new(),
            backward_directs: HashMap::new(),
            connections: Vec::new(),
        }
    }

    async fn run(mut self) -> Result<Option<Vec<Edge>>> {
        self.search.count_state()?;
        self.search.count_state()?;

        loop {
            let forward_open = !self.forward.is_empty();
            let backward_open = !self.backward.is_empty();

            // a closed side with no direct edges means no path exists
            if self.connections.is_empty()
                && ((!forward_open && self.forward_directs.is_empty())
                    || (!backward_open && self.backward_directs.is_empty()))
            {
                break;
            }

            let best = self.connections.iter().map(|c| c.length).min();
            match (best, self.lower_bound(forward_open, backward_open)) {
                (_, None) => break,
                (Some(best), Some(bound)) if best < bound => break,
                _ => {}
            }

            self.search.check_deadline()?;
            if forward_open && (!backward_open || self.forward.len() <= self.backward.len()) {
                self.expand_forward().await?;
            } else {
                self.expand_backward().await?;
            }
        }

        Ok(self.shortest_path())
    }

    /// Fewest hops any connection not yet recorded could have, or `None`
    /// when both sides are exhausted
    fn lower_bound(&self, forward_open: bool, backward_open: bool) -> Option<usize> {
        let (f, b) = (self.forward_depth, self.backward_depth);
        [
            // neither end expanded yet
            (forward_open && backward_open).then_some(f + b + 1),
            // source side of the direct edge not reached yet
            forward_open.then_some(f + 2),
            // target side of the direct edge not reached yet
            backward_open.then_some(b + 2),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn depth(&self, object_id: Uuid, forward: bool) -> Option<usize> {
        self.visited.get(&object_id).and_then(|v| {
            if forward {
                v.forward.as_ref().map(|s| s.depth)
            } else {
                v.backward.as_ref().map(|s| s.depth)
            }
        })
    }

    /// Frontier order is the lexicographic order of the discovering paths,
    /// so first discovery keeps the smallest prefix.
    async fn expand_forward(&mut self) -> Result<()> {
        let depth = self.forward_depth;
        let frontier = std::mem::take(&mut self.forward);
        let mut next = Vec::new();

        for from in frontier {
            for (edge, attr) in self
                .search
                .carrying(from, Direction::Outgoing, self.attribute)
                .await?
            {
                let to = edge.target_object_id;
                if attr.direct {
                    if let Some(tail) = self.depth(to, false) {
                        self.connections.push(Connection {
                            length: depth + 1 + tail,
                            from,
                            edge: edge.clone(),
                            to,
                        });
                    }
                    self.forward_directs
                        .entry(to)
                        .or_default()
                        .push((from, edge.clone()));
                }
                if attr.inherit {
                    let entry = self.visited.entry(to).or_default();
                    if entry.forward.is_some() {
                        continue;
                    }
                    entry.forward = Some(Step {
                        depth: depth + 1,
                        via: Some(edge),
                    });
                    self.search.count_state()?;
                    next.push(to);

                    let joins: Vec<(Edge, Uuid)> =
                        self.backward_directs.get(&to).cloned().unwrap_or_default();
                    for (direct, end) in joins {
                        if let Some(tail) = self.depth(end, false) {
                            self.connections.push(Connection {
                                length: depth + 2 + tail,
                                from: to,
                                edge: direct,
                                to: end,
                            });
                        }
                    }
                }
            }
        }

        self.forward = next;
        self.forward_depth += 1;
        Ok(())
    }

    /// A suffix starts with the discovering edge, so an object found several
    /// times on one level keeps the edge with the smallest ID, and the next
    /// level is ordered by that edge.
    async fn expand_backward(&mut self) -> Result<()> {
        let depth = self.backward_depth;
        let frontier = std::mem::take(&mut self.backward);
        let mut next = Vec::new();

        for to in frontier {
            for (edge, attr) in self
                .search
                .carrying(to, Direction::Incoming, self.attribute)
                .await?
            {
                let from = edge.source_object_id;
                if attr.direct {
                    if let Some(head) = self.depth(from, true) {
                        self.connections.push(Connection {
                            length: head + 1 + depth,
                            from,
                            edge: edge.clone(),
                            to,
                        });
                    }
                    self.backward_directs
                        .entry(from)
                        .or_default()
                        .push((edge.clone(), to));
                }
                if attr.propagate {
                    let entry = self.visited.entry(from).or_default();
                    match entry.backward.as_mut() {
                        Some(step) if step.depth == depth + 1 => {
                            if step.via.as_ref().map_or(false, |via| edge.base.id < via.base.id) {
                                step.via = Some(edge);
                            }
                            continue;
                        }
                        Some(_) => continue,
                        None => {
                            entry.backward = Some(Step {
                                depth: depth + 1,
                                via: Some(edge),
                            });
                        }
                    }
                    self.search.count_state()?;
                    next.push(from);

                    let joins: Vec<(Uuid, Edge)> =
                        self.forward_directs.get(&from).cloned().unwrap_or_default();
                    for (start, direct) in joins {
                        if let Some(head) = self.depth(start, true) {
                            self.connections.push(Connection {
                                length: head + 1 + depth + 1,
                                from: start,
                                edge: direct,
                                to: from,
                            });
                        }
                    }
                }
            }
        }

        next.sort_by_key(|id| {
            self.visited
                .get(id)
                .and_then(|v| v.backward.as_ref())
                .and_then(|s| s.via.as_ref())
                .map(|e| e.base.id)
        });
        self.backward = next;
        self.backward_depth += 1;
        Ok(())
    }

    fn shortest_path(&self) -> Option<Vec<Edge>> {
        let best = self.connections.iter().map(|c| c.length).min()?;
        self.connections
            .iter()
            .filter(|c| c.length == best)
            .map(|c| self.assemble(c))
            .min_by(|a, b| {
                let ids = |p: &Vec<Edge>| p.iter().map(|e| e.base.id).collect::<Vec<_>>();
                ids(a).cmp(&ids(b))
            })
    }

    fn assemble(&self, connection: &Connection) -> Vec<Edge> {
        let mut path = Vec::with_capacity(connection.length);

        let mut at = connection.from;
        while let Some(edge) = self
            .visited
            .get(&at)
            .and_then(|v| v.forward.as_ref())
            .and_then(|s| s.via.as_ref())
        {
            path.push(edge.clone());
            at = edge.source_object_id;
        }
        path.reverse();
        path.push(connection.edge.clone());

        let mut at = connection.to;
        while let Some(edge) = self
            .visited
            .get(&at)
            .and_then(|v| v.backward.as_ref())
            .and_then(|s| s.via.as_ref())
        {
            path.push(edge.clone());
            at = edge.target_object_id;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKeys, CacheManager, CacheTtls, InMemoryCache, DEFAULT_KEY_PREFIX};
    use crate::cached_store::CachedGraphStore;
    use crate::store::InMemoryGraphStore;

    struct Fixture {
        store: Arc<InMemoryGraphStore>,
        resolver: AttributeResolver,
        node: ObjectType,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(InMemoryGraphStore::new());
            let node = ObjectType::new("node");
            store.insert_object_type(&node).await.unwrap();
            let resolver = AttributeResolver::new(store.clone(), SearchConfig::default());
            Self { store, resolver, node }
        }

        async fn edge_type(&self, name: &str, attr: Attribute) -> EdgeType {
            let et = EdgeType::new(name, self.node.base.id, self.node.base.id, vec![attr]);
            self.store.insert_edge_type(&et).await.unwrap();
            et
        }

        async fn object(&self, alias: &str) -> Uuid {
            let object = Object::new(self.node.base.id, Some(alias));
            self.store.insert_object(&object).await.unwrap();
            object.base.id
        }

        async fn edge(&self, et: &EdgeType, from: Uuid, to: Uuid) -> Edge {
            let edge = Edge::new(et.base.id, from, to);
            self.store.insert_edge(&edge).await.unwrap();
            edge
        }
    }

    #[tokio::test]
    async fn test_single_direct_edge() {
        let f = Fixture::new().await;
        let grants = f.edge_type("grants", Attribute::direct("read")).await;
        let (a, b) = (f.object("a").await, f.object("b").await);
        let edge = f.edge(&grants, a, b).await;

        let response = f.resolver.check_attribute(a, b, "read").await.unwrap();
        assert!(response.has_attribute);
        assert_eq!(response.path, vec![edge]);

        // direct edges do not grant backwards
        assert!(!f.resolver.check_attribute(b, a, "read").await.unwrap().has_attribute);
    }

    #[tokio::test]
    async fn test_inherit_direct_propagate_chain() {
        let f = Fixture::new().await;
        let inherit = f.edge_type("inherit", Attribute::inherit("read")).await;
        let direct = f.edge_type("direct", Attribute::direct("read")).await;
        let propagate = f.edge_type("propagate", Attribute::propagate("read")).await;
        let ids = [
            f.object("s").await,
            f.object("i").await,
            f.object("g").await,
            f.object("p").await,
            f.object("t").await,
        ];
        let e1 = f.edge(&inherit, ids[0], ids[1]).await;
        let e2 = f.edge(&direct, ids[1], ids[2]).await;
        let e3 = f.edge(&propagate, ids[2], ids[3]).await;
        let e4 = f.edge(&propagate, ids[3], ids[4]).await;

        let response = f.resolver.check_attribute(ids[0], ids[4], "read").await.unwrap();
        assert!(response.has_attribute);
        assert_eq!(response.path, vec![e1, e2, e3, e4]);
    }

    #[tokio::test]
    async fn test_propagate_before_direct_does_not_grant() {
        let f = Fixture::new().await;
        let direct = f.edge_type("direct", Attribute::direct("read")).await;
        let propagate = f.edge_type("propagate", Attribute::propagate("read")).await;
        let (a, b, c) = (f.object("a").await, f.object("b").await, f.object("c").await);
        f.edge(&propagate, a, b).await;
        f.edge(&direct, b, c).await;

        assert!(!f.resolver.check_attribute(a, c, "read").await.unwrap().has_attribute);
    }

    #[tokio::test]
    async fn test_shortest_path_wins() {
        let f = Fixture::new().await;
        let inherit = f.edge_type("inherit", Attribute::inherit("read")).await;
        let direct = f.edge_type("direct", Attribute::direct("read")).await;
        let (s, m, t) = (f.object("s").await, f.object("m").await, f.object("t").await);
        f.edge(&inherit, s, m).await;
        f.edge(&direct, m, t).await;
        let shortcut = f.edge(&direct, s, t).await;

        let response = f.resolver.check_attribute(s, t, "read").await.unwrap();
        assert_eq!(response.path, vec![shortcut]);
    }

    #[tokio::test]
    async fn test_self_cycle_terminates() {
        let f = Fixture::new().await;
        let inherit = f.edge_type("inherit", Attribute::inherit("read")).await;
        let (a, b) = (f.object("a").await, f.object("b").await);
        f.edge(&inherit, a, b).await;
        f.edge(&inherit, b, a).await;

        assert!(!f.resolver.check_attribute(a, b, "read").await.unwrap().has_attribute);
        assert!(f
            .resolver
            .list_objects_reachable_with_attribute(a, f.node.base.id, "read")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_candidate_cap_is_enforced() {
        let f = Fixture::new().await;
        let inherit = f.edge_type("inherit", Attribute::inherit("read")).await;
        let root = f.object("root").await;
        for i in 0..5 {
            let child = f.object(&format!("child-{}", i)).await;
            f.edge(&inherit, root, child).await;
        }
        let target = f.object("target").await;
        let resolver = AttributeResolver::new(
            f.store.clone(),
            SearchConfig {
                max_candidates: 4,
                ..SearchConfig::default()
            },
        );

        let err = resolver.check_attribute(root, target, "read").await.unwrap_err();
        assert!(matches!(err, GraphError::SearchLimitExceeded { limit: 4 }));
    }

    #[tokio::test]
    async fn test_missing_edge_type_is_a_region_conflict() {
        let f = Fixture::new().await;
        let direct = f.edge_type("direct", Attribute::direct("read")).await;
        let (a, b) = (f.object("a").await, f.object("b").await);
        f.edge(&direct, a, b).await;

        let cached = Arc::new(CachedGraphStore::new(
            f.store.clone(),
            CacheManager::new(
                Arc::new(InMemoryCache::new()),
                CacheKeys::new(DEFAULT_KEY_PREFIX, Uuid::new_v4()),
                CacheTtls::default(),
            ),
        ));
        let resolver = AttributeResolver::new(cached.clone(), SearchConfig::default());
        assert!(resolver.check_attribute(a, b, "read").await.unwrap().has_attribute);

        // another region drops the edge type; only its own cache entry has expired here
        f.store.delete_edge_type(direct.base.id).await.unwrap();
        let keys = cached.cache().keys().clone();
        cached
            .cache()
            .invalidate(vec![keys.edge_type(direct.base.id)])
            .await
            .unwrap();

        let err = resolver.check_attribute(a, b, "read").await.unwrap_err();
        assert!(err.is_retryable());

        // the desync flushed the stale listings, so the retry sees the truth
        assert!(!resolver.check_attribute(a, b, "read").await.unwrap().has_attribute);
    }

    #[tokio::test]
    async fn test_list_attributes_confirms_with_a_full_check() {
        let f = Fixture::new().await;
        let writes = f.edge_type("writes", Attribute::direct("write")).await;
        let et = EdgeType::new(
            "owns",
            f.node.base.id,
            f.node.base.id,
            vec![Attribute::direct("read"), Attribute::inherit("share")],
        );
        f.store.insert_edge_type(&et).await.unwrap();
        let (a, b) = (f.object("a").await, f.object("b").await);
        f.edge(&et, a, b).await;
        f.edge(&writes, a, b).await;

        let attrs = f.resolver.list_attributes(a, b).await.unwrap();
        assert_eq!(attrs, vec!["read".to_string(), "write".to_string()]);
    }
}
