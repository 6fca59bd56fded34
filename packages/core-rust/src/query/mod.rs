//! Backend-agnostic query model.
//!
//! A [`Query`] is an immutable predicate tree of field comparisons joined by
//! AND/OR, plus optional ordering and offset/limit. Backends either translate
//! the [`Predicate`] into their native filter language (push-down) or
//! enumerate candidates and call [`Query::evaluate`]. Both paths must agree,
//! so the comparison rules live in exactly one place: [`CompareOp::test`].
//!
//! Ordering and paging are always applied after filtering, through
//! [`Query::order_and_page`], regardless of where filtering happened.

mod parser;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::oid::Oid;
use crate::types::{validate_field_name, FieldMap, Value};

/// Binary comparison operator: `=`, `!=`, `>`, `<`, `>=`, `<=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    /// Evaluates `field OP arg` under the shared comparison semantics.
    ///
    /// - A missing field is treated as null.
    /// - Null only equals null; null `!=` any non-null value; ordering
    ///   comparisons involving null are false.
    /// - If both operands are numeric ([`Value::as_number`]) they compare
    ///   numerically, otherwise they compare as text.
    /// - Numeric comparison is in `f64`, so integers beyond ±2^53 that
    ///   differ only in the low bits compare equal. Native push-down stores
    ///   numbers as `REAL` and agrees with this.
    #[must_use]
    pub fn test(self, field: Option<&Value>, arg: &Value) -> bool {
        let field = field.filter(|v| !v.is_null());
        match (field, arg.is_null()) {
            (None, true) => self == Self::Eq,
            (None, false) | (Some(_), true) => self == Self::Ne,
            (Some(value), false) => {
                let ordering = match (value.as_number(), arg.as_number()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => value.as_text().partial_cmp(&arg.as_text()),
                };
                ordering.is_some_and(|o| self.holds(o))
            }
        }
    }

    /// Whether an ordering between operands satisfies this operator.
    #[must_use]
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Lt => ordering == Ordering::Less,
            Self::Ge => ordering != Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }

    /// Canonical textual form.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }
}

/// A node of the predicate tree.
///
/// `And(vec![])` matches everything; `Or(vec![])` matches nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    /// `field OP arg`.
    Compare {
        field: String,
        op: CompareOp,
        arg: Value,
    },
    /// All children must match.
    And(Vec<Predicate>),
    /// At least one child must match.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Builds `field OP arg`.
    pub fn compare(field: impl Into<String>, op: CompareOp, arg: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            arg: arg.into(),
        }
    }

    pub fn eq(field: impl Into<String>, arg: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, arg)
    }

    pub fn ne(field: impl Into<String>, arg: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, arg)
    }

    pub fn gt(field: impl Into<String>, arg: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, arg)
    }

    pub fn lt(field: impl Into<String>, arg: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, arg)
    }

    pub fn ge(field: impl Into<String>, arg: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, arg)
    }

    pub fn le(field: impl Into<String>, arg: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Le, arg)
    }

    /// Conjunction, flattening nested `And` nodes.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (this, Self::And(mut right)) => {
                right.insert(0, this);
                Self::And(right)
            }
            (this, other) => Self::And(vec![this, other]),
        }
    }

    /// Disjunction, flattening nested `Or` nodes.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (this, Self::Or(mut right)) => {
                right.insert(0, this);
                Self::Or(right)
            }
            (this, other) => Self::Or(vec![this, other]),
        }
    }

    /// Evaluates the predicate against a record's fields.
    #[must_use]
    pub fn matches(&self, fields: &FieldMap) -> bool {
        match self {
            Self::Compare { field, op, arg } => op.test(fields.get(field), arg),
            Self::And(children) => children.iter().all(|c| c.matches(fields)),
            Self::Or(children) => children.iter().any(|c| c.matches(fields)),
        }
    }

    /// Checks every field name in the tree.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidField`](crate::StoreError::InvalidField)
    /// for the first field that is not a plain identifier.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Compare { field, .. } => validate_field_name(field),
            Self::And(children) | Self::Or(children) => {
                children.iter().try_for_each(Predicate::validate)
            }
        }
    }

    /// Field names referenced anywhere in the tree, in first-seen order.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { field, .. } => {
                if !out.contains(&field.as_str()) {
                    out.push(field);
                }
            }
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    children: &[Predicate],
    sep: &str,
    empty: &str,
) -> fmt::Result {
    if children.is_empty() {
        return f.write_str(empty);
    }
    f.write_str("(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{child}")?;
    }
    f.write_str(")")
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { field, op, arg } => match arg {
                Value::String(s) => write!(f, "{field} {} {s:?}", op.symbol()),
                other => write!(f, "{field} {} {other}", op.symbol()),
            },
            Self::And(children) => write_joined(f, children, " AND ", "TRUE"),
            Self::Or(children) => write_joined(f, children, " OR ", "FALSE"),
        }
    }
}

/// Sort direction for query ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Ordering clause: field and direction. OID ascending always breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Anything the query model can filter and order: an OID plus its fields.
pub trait Row {
    fn oid(&self) -> &Oid;
    fn fields(&self) -> &FieldMap;
}

impl Row for (Oid, FieldMap) {
    fn oid(&self) -> &Oid {
        &self.0
    }

    fn fields(&self) -> &FieldMap {
        &self.1
    }
}

/// Filter, ordering and paging parameters.
///
/// `predicate: None` matches every record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    pub predicate: Option<Predicate>,
    pub order: Option<OrderBy>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    /// Matches every record, unordered, unpaged.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Query with the given predicate and no ordering or paging.
    #[must_use]
    pub fn filter(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    /// Parses `field OP ?` comparisons joined by AND/OR with positional
    /// arguments substituted left to right. An empty expression matches
    /// everything.
    ///
    /// ```
    /// use stackstore_core::{Query, Value};
    ///
    /// let q = Query::parse("n > ? AND (kind = ? OR kind = ?)", &[
    ///     Value::Int(1),
    ///     Value::from("a"),
    ///     Value::from("b"),
    /// ])
    /// .unwrap();
    /// assert!(q.predicate.is_some());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidQuery`](crate::StoreError::InvalidQuery)
    /// on a syntax error or when the number of `?` placeholders differs from
    /// `args.len()`, and
    /// [`StoreError::InvalidField`](crate::StoreError::InvalidField) for an
    /// unusable field name.
    pub fn parse(expr: &str, args: &[Value]) -> Result<Self> {
        let predicate = parser::parse(expr, args)?;
        Ok(Self {
            predicate,
            ..Self::default()
        })
    }

    /// Sets the ordering field and direction.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Skips the first `offset` ordered results.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// ANDs an extra predicate onto this query, keeping ordering and paging.
    #[must_use]
    pub fn and(mut self, extra: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(extra),
            None => extra,
        });
        self
    }

    /// The same filter without ordering or paging.
    #[must_use]
    pub fn unpaged(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            ..Self::default()
        }
    }

    /// Whether ordering, offset or limit is set.
    #[must_use]
    pub fn is_paged(&self) -> bool {
        self.order.is_some() || self.offset > 0 || self.limit.is_some()
    }

    /// Validates every field name used by the predicate and ordering.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidField`](crate::StoreError::InvalidField)
    /// for the first unusable field name.
    pub fn validate(&self) -> Result<()> {
        if let Some(predicate) = &self.predicate {
            predicate.validate()?;
        }
        if let Some(order) = &self.order {
            validate_field_name(&order.field)?;
        }
        Ok(())
    }

    /// Whether a record's fields satisfy the predicate.
    #[must_use]
    pub fn matches(&self, fields: &FieldMap) -> bool {
        self.predicate.as_ref().is_none_or(|p| p.matches(fields))
    }

    /// In-memory evaluation path: filter, then order, then page.
    pub fn evaluate<R, I>(&self, rows: I) -> Vec<R>
    where
        R: Row,
        I: IntoIterator<Item = R>,
    {
        let filtered = rows.into_iter().filter(|r| self.matches(r.fields())).collect();
        self.order_and_page(filtered)
    }

    /// Orders already-filtered rows and applies offset/limit.
    ///
    /// Without an ordering field rows are sorted by OID so results stay
    /// deterministic across backends. The sort is stable and OID ascending
    /// breaks ties.
    pub fn order_and_page<R: Row>(&self, mut rows: Vec<R>) -> Vec<R> {
        match &self.order {
            Some(order) => rows.sort_by(|a, b| {
                let by_field = a
                    .fields()
                    .get(&order.field)
                    .unwrap_or(&Value::Null)
                    .sort_cmp(b.fields().get(&order.field).unwrap_or(&Value::Null));
                let by_field = match order.direction {
                    SortDirection::Asc => by_field,
                    SortDirection::Desc => by_field.reverse(),
                };
                by_field.then_with(|| a.oid().cmp(b.oid()))
            }),
            None => rows.sort_by(|a, b| a.oid().cmp(b.oid())),
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        rows.into_iter().skip(self.offset).take(limit).collect()
    }
}
