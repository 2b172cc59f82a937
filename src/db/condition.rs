//! Composable query-condition tree: builds parameterised SQL fragments and
//! binds their own parameters into a shared positional list.
//!
//! Each variant knows how to render itself (`to_sql`) and how to append its
//! bind values (`bind_into`) — the tagged-enum replacement for a
//! build-clause/bind virtual-method pair; no vtable needed.

use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlArguments;
use sqlx::query::Query;
use sqlx::MySql;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Null,
}

/// A SET-clause value: either a bound parameter or a raw SQL expression
/// (e.g. `NOW(3)`) that contributes text but never a bind slot.
#[derive(Debug, Clone)]
pub enum SetValue {
    Bound(SqlValue),
    Raw(String),
}

#[derive(Debug, Clone)]
pub enum LeafOp {
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
    Between,
    Like,
    Regexp,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone)]
pub enum Condition {
    Leaf {
        op: LeafOp,
        field: &'static str,
        values: Vec<SqlValue>,
    },
    Raw(String),
    True,
    False,
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn eq(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::Eq,
            field,
            values: vec![value.into()],
        }
    }

    pub fn neq(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::Neq,
            field,
            values: vec![value.into()],
        }
    }

    pub fn gt(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::Gt,
            field,
            values: vec![value.into()],
        }
    }

    pub fn ge(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::Ge,
            field,
            values: vec![value.into()],
        }
    }

    pub fn lt(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::Lt,
            field,
            values: vec![value.into()],
        }
    }

    pub fn le(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::Le,
            field,
            values: vec![value.into()],
        }
    }

    pub fn between(field: &'static str, low: impl Into<SqlValue>, high: impl Into<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::Between,
            field,
            values: vec![low.into(), high.into()],
        }
    }

    pub fn like(field: &'static str, pattern: impl Into<String>) -> Self {
        Self::Leaf {
            op: LeafOp::Like,
            field,
            values: vec![SqlValue::Str(pattern.into())],
        }
    }

    pub fn regexp(field: &'static str, pattern: impl Into<String>) -> Self {
        Self::Leaf {
            op: LeafOp::Regexp,
            field,
            values: vec![SqlValue::Str(pattern.into())],
        }
    }

    pub fn in_list(field: &'static str, values: Vec<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::In,
            field,
            values,
        }
    }

    pub fn not_in(field: &'static str, values: Vec<SqlValue>) -> Self {
        Self::Leaf {
            op: LeafOp::NotIn,
            field,
            values,
        }
    }

    pub fn is_null(field: &'static str) -> Self {
        Self::Leaf {
            op: LeafOp::IsNull,
            field,
            values: vec![],
        }
    }

    pub fn is_not_null(field: &'static str) -> Self {
        Self::Leaf {
            op: LeafOp::IsNotNull,
            field,
            values: vec![],
        }
    }

    pub fn raw(expr: impl Into<String>) -> Self {
        Self::Raw(expr.into())
    }

    pub fn not(inner: Condition) -> Self {
        Self::Not(Box::new(inner))
    }

    pub fn and(parts: Vec<Condition>) -> Self {
        Self::And(parts)
    }

    pub fn or(parts: Vec<Condition>) -> Self {
        Self::Or(parts)
    }

    /// Render this node to a SQL fragment. Placeholders are always `?`;
    /// MySQL binds positionally, so nesting order here must exactly match
    /// `bind_into`'s traversal order.
    pub fn to_sql(&self) -> String {
        match self {
            Condition::True => "1=1".to_string(),
            Condition::False => "1=0".to_string(),
            Condition::Raw(expr) => expr.clone(),
            Condition::Leaf { op, field, values } => leaf_sql(op, field, values.len()),
            Condition::And(parts) => join_parts(parts, "AND"),
            Condition::Or(parts) => join_parts(parts, "OR"),
            Condition::Not(inner) => format!("NOT ({})", inner.to_sql()),
        }
    }

    /// Append this node's bind values, in the same order `to_sql` placed
    /// their placeholders.
    pub fn bind_into(&self, out: &mut Vec<SqlValue>) {
        match self {
            Condition::True | Condition::False | Condition::Raw(_) => {}
            Condition::Leaf { values, .. } => out.extend(values.iter().cloned()),
            Condition::And(parts) | Condition::Or(parts) => {
                for p in parts {
                    p.bind_into(out);
                }
            }
            Condition::Not(inner) => inner.bind_into(out),
        }
    }
}

fn join_parts(parts: &[Condition], op: &str) -> String {
    if parts.is_empty() {
        return "1=1".to_string();
    }
    let rendered: Vec<String> = parts.iter().map(|p| format!("({})", p.to_sql())).collect();
    rendered.join(&format!(" {op} "))
}

fn leaf_sql(op: &LeafOp, field: &str, n_values: usize) -> String {
    match op {
        LeafOp::Eq => format!("{field} = ?"),
        LeafOp::Neq => format!("{field} != ?"),
        LeafOp::Gt => format!("{field} > ?"),
        LeafOp::Ge => format!("{field} >= ?"),
        LeafOp::Lt => format!("{field} < ?"),
        LeafOp::Le => format!("{field} <= ?"),
        LeafOp::Between => format!("{field} BETWEEN ? AND ?"),
        LeafOp::Like => format!("{field} LIKE ?"),
        LeafOp::Regexp => format!("{field} REGEXP ?"),
        LeafOp::In => {
            let placeholders = std::iter::repeat("?").take(n_values).collect::<Vec<_>>().join(", ");
            format!("{field} IN ({placeholders})")
        }
        LeafOp::NotIn => {
            let placeholders = std::iter::repeat("?").take(n_values).collect::<Vec<_>>().join(", ");
            format!("{field} NOT IN ({placeholders})")
        }
        LeafOp::IsNull => format!("{field} IS NULL"),
        LeafOp::IsNotNull => format!("{field} IS NOT NULL"),
    }
}

/// Bind a single value onto an in-progress sqlx query, preserving the
/// signed/unsigned/size dispatch the driver performs natively.
pub fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Int(v) => query.bind(v),
        SqlValue::UInt(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Str(v) => query.bind(v),
        SqlValue::Bytes(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v),
        SqlValue::Null => query.bind(Option::<i64>::None),
    }
}

/// Same dispatch as [`bind_value`], but for a `query_as` builder — sqlx
/// gives `Query` and `QueryAs` distinct, unrelated bind methods.
pub fn bind_value_as<'q, E>(
    query: sqlx::query::QueryAs<'q, MySql, E, MySqlArguments>,
    value: SqlValue,
) -> sqlx::query::QueryAs<'q, MySql, E, MySqlArguments> {
    match value {
        SqlValue::Int(v) => query.bind(v),
        SqlValue::UInt(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Str(v) => query.bind(v),
        SqlValue::Bytes(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v),
        SqlValue::Null => query.bind(Option::<i64>::None),
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}
impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::UInt(v)
    }
}
impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::UInt(v as u64)
    }
}
impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Str(v)
    }
}
impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Str(v.to_string())
    }
}
impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_renders_a_single_placeholder() {
        let cond = Condition::eq("email", "a@example.com");
        assert_eq!(cond.to_sql(), "email = ?");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert_eq!(binds, vec![SqlValue::Str("a@example.com".into())]);
    }

    #[test]
    fn and_or_compose_with_matching_bind_order() {
        let cond = Condition::and(vec![
            Condition::eq("username", "alice"),
            Condition::or(vec![Condition::eq("id", 1i64), Condition::eq("id", 2i64)]),
        ]);
        assert_eq!(cond.to_sql(), "(username = ?) AND ((id = ?) OR (id = ?))");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert_eq!(
            binds,
            vec![
                SqlValue::Str("alice".into()),
                SqlValue::Int(1),
                SqlValue::Int(2)
            ]
        );
    }

    #[test]
    fn in_list_renders_one_placeholder_per_value() {
        let cond = Condition::in_list("id", vec![SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(3)]);
        assert_eq!(cond.to_sql(), "id IN (?, ?, ?)");
    }

    #[test]
    fn is_null_has_no_bind_values() {
        let cond = Condition::is_null("updated_at");
        assert_eq!(cond.to_sql(), "updated_at IS NULL");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert!(binds.is_empty());
    }

    #[test]
    fn is_not_null_has_no_bind_values() {
        let cond = Condition::is_not_null("updated_at");
        assert_eq!(cond.to_sql(), "updated_at IS NOT NULL");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert!(binds.is_empty());
    }

    #[test]
    fn between_binds_both_bounds_in_order() {
        let cond = Condition::between("created_at", 1i64, 100i64);
        assert_eq!(cond.to_sql(), "created_at BETWEEN ? AND ?");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert_eq!(binds, vec![SqlValue::Int(1), SqlValue::Int(100)]);
    }

    #[test]
    fn not_in_renders_one_placeholder_per_value() {
        let cond = Condition::not_in("id", vec![SqlValue::Int(1), SqlValue::Int(2)]);
        assert_eq!(cond.to_sql(), "id NOT IN (?, ?)");
    }

    #[test]
    fn regexp_renders_and_binds_the_pattern() {
        let cond = Condition::regexp("username", "^a.*e$");
        assert_eq!(cond.to_sql(), "username REGEXP ?");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert_eq!(binds, vec![SqlValue::Str("^a.*e$".into())]);
    }

    #[test]
    fn not_wraps_its_inner_condition() {
        let cond = Condition::not(Condition::eq("username", "alice"));
        assert_eq!(cond.to_sql(), "NOT (username = ?)");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert_eq!(binds, vec![SqlValue::Str("alice".into())]);
    }

    #[test]
    fn raw_contributes_sql_text_but_no_binds() {
        let cond = Condition::raw("deleted_at IS NULL");
        assert_eq!(cond.to_sql(), "deleted_at IS NULL");
        let mut binds = Vec::new();
        cond.bind_into(&mut binds);
        assert!(binds.is_empty());
    }

    #[test]
    fn true_and_false_render_tautology_and_contradiction() {
        assert_eq!(Condition::True.to_sql(), "1=1");
        assert_eq!(Condition::False.to_sql(), "1=0");
    }

    #[test]
    fn comparison_ops_render_expected_operators() {
        assert_eq!(Condition::gt("age", 18i64).to_sql(), "age > ?");
        assert_eq!(Condition::ge("age", 18i64).to_sql(), "age >= ?");
        assert_eq!(Condition::lt("age", 18i64).to_sql(), "age < ?");
        assert_eq!(Condition::le("age", 18i64).to_sql(), "age <= ?");
        assert_eq!(Condition::neq("age", 18i64).to_sql(), "age != ?");
    }
}
