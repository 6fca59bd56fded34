//! Group/member relationships built only on the data-object contract.
//!
//! Three tables: groups, members, and relationships whose rows carry
//! `groupID` and `memberID`. The backends offer no foreign keys and no
//! uniqueness constraint, so this module keeps the links consistent itself:
//!
//! - **Orphans**: a relationship whose group or member no longer exists is
//!   deleted the next time an access touches that side.
//! - **Collisions**: concurrent inserts may leave several rows for one pair.
//!   The newest row (highest OID) is kept and the others are deleted.
//!
//! Neither case is an error; both are repaired silently and logged.

mod query;
mod relationship;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use stackstore_core::{Oid, Predicate, Query, Result};
use tracing::{debug, info, warn};

use crate::storage::{Backend, DataObjectMap, Record};

pub use query::{MembershipQuery, Route};
pub use relationship::Relationship;

use relationship::link_of;

/// Relationship field holding the group OID.
pub const GROUP_ID: &str = "groupID";
/// Relationship field holding the member OID.
pub const MEMBER_ID: &str = "memberID";

/// Which table a relationship side lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    Group,
    Member,
}

impl Side {
    fn field(self) -> &'static str {
        match self {
            Self::Group => GROUP_ID,
            Self::Member => MEMBER_ID,
        }
    }
}

/// Group, member and relationship tables managed together.
#[derive(Clone)]
pub struct Membership {
    groups: Arc<dyn DataObjectMap>,
    members: Arc<dyn DataObjectMap>,
    relations: Arc<dyn DataObjectMap>,
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("groups", &self.groups.name())
            .field("members", &self.members.name())
            .field("relations", &self.relations.name())
            .finish()
    }
}

fn pair_predicate(group_id: &Oid, member_id: &Oid) -> Predicate {
    Predicate::eq(GROUP_ID, group_id.as_str()).and(Predicate::eq(MEMBER_ID, member_id.as_str()))
}

/// Per-call cache of side lookups, so each group or member is read once.
struct SideCache<'a> {
    table: &'a dyn DataObjectMap,
    seen: HashMap<Oid, Option<Record>>,
}

impl<'a> SideCache<'a> {
    fn new(table: &'a dyn DataObjectMap) -> Self {
        Self {
            table,
            seen: HashMap::new(),
        }
    }

    fn seed(&mut self, record: Record) {
        self.seen.insert(record.oid().clone(), Some(record));
    }

    fn lookup(&mut self, oid: &Oid) -> Result<Option<&Record>> {
        if !self.seen.contains_key(oid) {
            let found = self.table.get(oid)?;
            self.seen.insert(oid.clone(), found);
        }
        Ok(self.seen.get(oid).and_then(Option::as_ref))
    }
}

impl Membership {
    #[must_use]
    pub fn new(
        groups: Arc<dyn DataObjectMap>,
        members: Arc<dyn DataObjectMap>,
        relations: Arc<dyn DataObjectMap>,
    ) -> Self {
        Self {
            groups,
            members,
            relations,
        }
    }

    #[must_use]
    pub fn groups(&self) -> &Arc<dyn DataObjectMap> {
        &self.groups
    }

    #[must_use]
    pub fn members(&self) -> &Arc<dyn DataObjectMap> {
        &self.members
    }

    #[must_use]
    pub fn relations(&self) -> &Arc<dyn DataObjectMap> {
        &self.relations
    }

    fn table(&self, side: Side) -> &dyn DataObjectMap {
        match side {
            Side::Group => self.groups.as_ref(),
            Side::Member => self.members.as_ref(),
        }
    }

    fn wrap(&self, record: Record) -> Option<Relationship> {
        Relationship::from_record(record, Arc::clone(&self.relations))
    }

    /// Deletes every relationship row whose `side` field equals `oid`.
    fn purge_side(&self, side: Side, oid: &Oid) -> Result<usize> {
        let rows = self
            .relations
            .query(&Query::filter(Predicate::eq(side.field(), oid.as_str())))?;
        for row in &rows {
            self.relations.remove(row.oid())?;
        }
        if !rows.is_empty() {
            info!(side = side.field(), %oid, removed = rows.len(), "purged relationships");
        }
        Ok(rows.len())
    }

    /// Confirms both sides exist, purging the relationships of any side
    /// that does not. Returns whether both exist.
    fn heal_sides(&self, group_id: &Oid, member_id: &Oid) -> Result<bool> {
        let mut intact = true;
        for (side, oid) in [(Side::Group, group_id), (Side::Member, member_id)] {
            if !self.table(side).contains(oid)? {
                self.purge_side(side, oid)?;
                intact = false;
            }
        }
        Ok(intact)
    }

    /// Keeps the highest-OID row of `rows` and deletes the rest.
    fn collapse(&self, mut rows: Vec<Record>) -> Result<Option<Record>> {
        rows.sort_by(|a, b| b.oid().cmp(a.oid()));
        let mut rows = rows.into_iter();
        let Some(keep) = rows.next() else {
            return Ok(None);
        };
        for duplicate in rows {
            warn!(
                kept = %keep.oid(),
                removed = %duplicate.oid(),
                "collapsing duplicate relationship"
            );
            self.relations.remove(duplicate.oid())?;
        }
        Ok(Some(keep))
    }

    fn collapse_pair(&self, group_id: &Oid, member_id: &Oid) -> Result<Option<Relationship>> {
        let rows = self
            .relations
            .query(&Query::filter(pair_predicate(group_id, member_id)))?;
        Ok(self.collapse(rows)?.and_then(|row| self.wrap(row)))
    }

    /// The live relationship between `group_id` and `member_id`.
    ///
    /// If either side no longer exists its relationships are purged and
    /// `None` is returned. Duplicate rows for the pair are collapsed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn resolve(&self, group_id: &Oid, member_id: &Oid) -> Result<Option<Relationship>> {
        if !self.heal_sides(group_id, member_id)? {
            return Ok(None);
        }
        self.collapse_pair(group_id, member_id)
    }

    /// Links `member_id` to `group_id` unless already linked, returning
    /// the single live relationship. Repeated calls never accumulate rows.
    ///
    /// Returns `None` when either side does not exist.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn add_membership(&self, group_id: &Oid, member_id: &Oid) -> Result<Option<Relationship>> {
        if !self.heal_sides(group_id, member_id)? {
            return Ok(None);
        }
        if let Some(existing) = self.collapse_pair(group_id, member_id)? {
            return Ok(Some(existing));
        }

        let mut row = self.relations.new_entry();
        row.put(GROUP_ID, group_id.as_str())?;
        row.put(MEMBER_ID, member_id.as_str())?;
        self.relations.save(&mut row)?;
        debug!(group = %group_id, member = %member_id, oid = %row.oid(), "added membership");

        // A concurrent insert of the same pair may have landed meanwhile.
        self.collapse_pair(group_id, member_id)
    }

    /// Deletes every relationship row for the pair. Returns whether any
    /// existed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn remove_membership(&self, group_id: &Oid, member_id: &Oid) -> Result<bool> {
        let rows = self
            .relations
            .query(&Query::filter(pair_predicate(group_id, member_id)))?;
        for row in &rows {
            self.relations.remove(row.oid())?;
        }
        Ok(!rows.is_empty())
    }

    /// Deletes every relationship of a group. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn purge_group(&self, group_id: &Oid) -> Result<usize> {
        self.purge_side(Side::Group, group_id)
    }

    /// Deletes every relationship of a member. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn purge_member(&self, member_id: &Oid) -> Result<usize> {
        self.purge_side(Side::Member, member_id)
    }

    /// Live relationships of one member.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn groups_of(&self, member_id: &Oid) -> Result<Vec<Relationship>> {
        self.find(&MembershipQuery::new().member(member_id.clone()))
    }

    /// Live relationships of one group.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn members_of(&self, group_id: &Oid) -> Result<Vec<Relationship>> {
        self.find(&MembershipQuery::new().group(group_id.clone()))
    }

    /// Fetches candidate rows along `route`. The relationship predicate is
    /// pushed into every fetch.
    fn fetch<'t>(
        &self,
        route: Route,
        query: &MembershipQuery,
        groups: &mut SideCache<'t>,
        members: &mut SideCache<'t>,
    ) -> Result<Vec<Record>> {
        let relation = query.relation_predicate().cloned();
        let with_relation = |base: Predicate| match &relation {
            Some(extra) => Query::filter(base.and(extra.clone())),
            None => Query::filter(base),
        };

        match route {
            Route::Pair => {
                let (Some(g), Some(m)) = (&query.group_id, &query.member_id) else {
                    return Ok(Vec::new());
                };
                self.relations.query(&with_relation(pair_predicate(g, m)))
            }
            Route::Group => {
                let Some(g) = &query.group_id else {
                    return Ok(Vec::new());
                };
                self.relations
                    .query(&with_relation(Predicate::eq(GROUP_ID, g.as_str())))
            }
            Route::Member => {
                let Some(m) = &query.member_id else {
                    return Ok(Vec::new());
                };
                self.relations
                    .query(&with_relation(Predicate::eq(MEMBER_ID, m.as_str())))
            }
            Route::GroupFanOut | Route::MemberFanOut => {
                let (side, filter, cache) = if route == Route::GroupFanOut {
                    (Side::Group, &query.group_filter, groups)
                } else {
                    (Side::Member, &query.member_filter, members)
                };
                let Some(filter) = filter else {
                    return Ok(Vec::new());
                };
                let matched = self.table(side).query(&Query::filter(filter.clone()))?;
                let mut rows = Vec::new();
                for record in matched {
                    let base = Predicate::eq(side.field(), record.oid().as_str());
                    rows.extend(self.relations.query(&with_relation(base))?);
                    cache.seed(record);
                }
                Ok(rows)
            }
            Route::RelationScan => match &relation {
                Some(predicate) => self.relations.query(&Query::filter(predicate.clone())),
                None => Ok(Vec::new()),
            },
            Route::FullScan => self.relations.query(&Query::all()),
        }
    }

    /// Relationships matching every criterion of `query`.
    ///
    /// Candidates are fetched along [`MembershipQuery::route`]; criteria the
    /// route did not already apply are then checked per candidate. Orphaned
    /// rows found on the way are purged, duplicate pairs are collapsed, and
    /// the relationship query's ordering and paging are applied last (OID
    /// order when it has none).
    ///
    /// # Errors
    ///
    /// Returns a validation error for unusable field names and propagates
    /// backend failures.
    pub fn find(&self, query: &MembershipQuery) -> Result<Vec<Relationship>> {
        query.validate()?;
        let route = query.route();
        debug!(?route, "membership query");

        let mut groups = SideCache::new(self.groups.as_ref());
        let mut members = SideCache::new(self.members.as_ref());
        let candidates = self.fetch(route, query, &mut groups, &mut members)?;

        let mut purged: HashSet<(Side, Oid)> = HashSet::new();
        let mut by_pair: BTreeMap<(Oid, Oid), Vec<Record>> = BTreeMap::new();

        for row in candidates {
            let Some((group_id, member_id)) = link_of(&row) else {
                warn!(oid = %row.oid(), "removing malformed relationship");
                self.relations.remove(row.oid())?;
                continue;
            };

            let mut keep = true;
            for (side, oid, cache, filter, applied) in [
                (
                    Side::Group,
                    &group_id,
                    &mut groups,
                    &query.group_filter,
                    route == Route::GroupFanOut,
                ),
                (
                    Side::Member,
                    &member_id,
                    &mut members,
                    &query.member_filter,
                    route == Route::MemberFanOut,
                ),
            ] {
                if purged.contains(&(side, oid.clone())) {
                    keep = false;
                    continue;
                }
                match cache.lookup(oid)? {
                    None => {
                        self.purge_side(side, oid)?;
                        purged.insert((side, oid.clone()));
                        keep = false;
                    }
                    Some(record) => {
                        if !applied && filter.as_ref().is_some_and(|p| !p.matches(record.fields())) {
                            keep = false;
                        }
                    }
                }
            }

            if keep {
                by_pair.entry((group_id, member_id)).or_default().push(row);
            }
        }

        let mut survivors = Vec::with_capacity(by_pair.len());
        for rows in by_pair.into_values() {
            if let Some(row) = self.collapse(rows)? {
                survivors.push(row);
            }
        }

        let paging = query.relation_filter.clone().unwrap_or_default();
        Ok(paging
            .order_and_page(survivors)
            .into_iter()
            .filter_map(|row| self.wrap(row))
            .collect())
    }
}
