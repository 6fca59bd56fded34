use stackstore_core::{Oid, Predicate, Query, Result};

/// Criteria for [`Membership::find`](super::Membership::find).
///
/// Every criterion that is set must hold for a relationship to be returned.
/// `group_where` and `member_where` filter on the group and member records;
/// `relation_where` filters on the relationship row itself and also supplies
/// the ordering and paging of the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipQuery {
    pub group_id: Option<Oid>,
    pub group_filter: Option<Predicate>,
    pub member_id: Option<Oid>,
    pub member_filter: Option<Predicate>,
    pub relation_filter: Option<Query>,
}

/// How candidate relationship rows are fetched, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Both ids known: fetch the rows of that pair.
    Pair,
    /// Group id known: fetch that group's rows.
    Group,
    /// Member id known: fetch that member's rows.
    Member,
    /// Enumerate matching groups and union their rows.
    GroupFanOut,
    /// Fetch rows by the relationship predicate alone.
    RelationScan,
    /// Enumerate matching members and union their rows.
    MemberFanOut,
    /// Nothing narrows the search: every row is a candidate.
    FullScan,
}

impl MembershipQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn group(mut self, group_id: Oid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    #[must_use]
    pub fn group_where(mut self, predicate: Predicate) -> Self {
        self.group_filter = Some(predicate);
        self
    }

    #[must_use]
    pub fn member(mut self, member_id: Oid) -> Self {
        self.member_id = Some(member_id);
        self
    }

    #[must_use]
    pub fn member_where(mut self, predicate: Predicate) -> Self {
        self.member_filter = Some(predicate);
        self
    }

    #[must_use]
    pub fn relation_where(mut self, query: Query) -> Self {
        self.relation_filter = Some(query);
        self
    }

    /// Predicate part of `relation_where`, if any.
    pub(super) fn relation_predicate(&self) -> Option<&Predicate> {
        self.relation_filter.as_ref()?.predicate.as_ref()
    }

    /// Picks the fetch strategy.
    ///
    /// Exact ids beat predicates; among predicates a group fan-out is tried
    /// before a relationship scan, and a member fan-out is the last resort.
    #[must_use]
    pub fn route(&self) -> Route {
        match (&self.group_id, &self.member_id) {
            (Some(_), Some(_)) => Route::Pair,
            (Some(_), None) => Route::Group,
            (None, Some(_)) => Route::Member,
            (None, None) if self.group_filter.is_some() => Route::GroupFanOut,
            (None, None) if self.relation_predicate().is_some() => Route::RelationScan,
            (None, None) if self.member_filter.is_some() => Route::MemberFanOut,
            (None, None) => Route::FullScan,
        }
    }

    /// Checks every field name in every filter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidField`](stackstore_core::StoreError::InvalidField)
    /// for the first unusable name.
    pub fn validate(&self) -> Result<()> {
        if let Some(p) = &self.group_filter {
            p.validate()?;
        }
        if let Some(p) = &self.member_filter {
            p.validate()?;
        }
        if let Some(q) = &self.relation_filter {
            q.validate()?;
        }
        Ok(())
    }
}
