//! The Unset-Marker Policy.
//!
//! A statement is prepared once with `?` markers and executed with bound
//! values. A marker can be bound to a value, to `NULL`, or left *unset*,
//! meaning "leave this untouched". Normalization resolves every marker
//! before any row is written, so a statement either fails as a whole or
//! reaches the write path fully resolved:
//!
//! | context                     | unset                    |
//! |-----------------------------|--------------------------|
//! | `SET col = ?`               | assignment dropped       |
//! | arithmetic expression       | whole statement rejected |
//! | `c = c + ?`, `li = li + ?`  | no-op for that column    |
//! | `USING TTL ?`               | no TTL                   |
//! | `USING TIMESTAMP ?`         | current time             |
//! | `LIMIT ?`                   | unlimited                |
//! | `WHERE col = ?`             | rejected                 |

use basalt_types::{Timestamp, Ttl};
use serde::{Deserialize, Serialize};

use crate::error::ViewError;
use crate::value::Value;

// ============================================================================
// Bound Values and Terms
// ============================================================================

/// What the client bound to one marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundValue {
    Value(Value),
    Null,
    Unset,
}

impl BoundValue {
    pub fn value(value: impl Into<Value>) -> Self {
        BoundValue::Value(value.into())
    }
}

impl From<Value> for BoundValue {
    fn from(value: Value) -> Self {
        BoundValue::Value(value)
    }
}

/// A statement operand: a literal or the `n`th bind marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    Literal(Value),
    Null,
    Bind(usize),
}

impl Term {
    pub fn literal(value: impl Into<Value>) -> Self {
        Term::Literal(value.into())
    }

    /// Resolves the term against the bound values.
    pub fn bind(&self, values: &[BoundValue]) -> Result<BoundValue, ViewError> {
        match self {
            Term::Literal(value) => Ok(BoundValue::Value(value.clone())),
            Term::Null => Ok(BoundValue::Null),
            Term::Bind(index) => values.get(*index).cloned().ok_or_else(|| {
                ViewError::InvalidBind(format!(
                    "no value bound for marker {index} ({} values given)",
                    values.len()
                ))
            }),
        }
    }
}

/// Integer arithmetic over terms, e.g. `SET a = ? + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Term(Term),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Expr::Add(Box::new(lhs), Box::new(rhs))
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Expr::Sub(Box::new(lhs), Box::new(rhs))
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Expr::Mul(Box::new(lhs), Box::new(rhs))
    }

    /// Evaluates the expression. `NULL` propagates; an unset operand fails
    /// the evaluation instead of being partially applied.
    pub fn evaluate(&self, values: &[BoundValue]) -> Result<Option<Value>, ViewError> {
        type Op = fn(i64, i64) -> Option<i64>;
        let (lhs, rhs, op): (&Expr, &Expr, Op) = match self {
            Expr::Term(term) => {
                return match term.bind(values)? {
                    BoundValue::Value(value) => Ok(Some(value)),
                    BoundValue::Null => Ok(None),
                    BoundValue::Unset => Err(ViewError::InvalidBind(
                        "Invalid unset value in arithmetic expression".to_string(),
                    )),
                };
            }
            Expr::Add(lhs, rhs) => (lhs.as_ref(), rhs.as_ref(), i64::checked_add as Op),
            Expr::Sub(lhs, rhs) => (lhs.as_ref(), rhs.as_ref(), i64::checked_sub as Op),
            Expr::Mul(lhs, rhs) => (lhs.as_ref(), rhs.as_ref(), i64::checked_mul as Op),
        };

        // Both sides are evaluated so an unset operand is reported even when
        // the other side is null.
        let lhs = lhs.evaluate(values)?;
        let rhs = rhs.evaluate(values)?;
        let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
            return Ok(None);
        };
        let (Some(a), Some(b)) = (lhs.as_bigint(), rhs.as_bigint()) else {
            return Err(ViewError::InvalidBind(format!(
                "arithmetic needs integer operands, got {lhs} and {rhs}"
            )));
        };
        let result = op(a, b)
            .ok_or_else(|| ViewError::InvalidBind(format!("integer overflow evaluating {a} and {b}")))?;

        match (lhs, rhs) {
            (Value::Int(_), Value::Int(_)) => i32::try_from(result)
                .map(|v| Some(Value::Int(v)))
                .map_err(|_| ViewError::InvalidBind(format!("{result} does not fit in an int"))),
            _ => Ok(Some(Value::BigInt(result))),
        }
    }
}

impl From<Term> for Expr {
    fn from(term: Term) -> Self {
        Expr::Term(term)
    }
}

// ============================================================================
// Statements
// ============================================================================

/// `col = term` in a WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub column: String,
    pub value: Term,
}

impl Restriction {
    pub fn new(column: impl Into<String>, value: Term) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// One SET clause entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assignment {
    /// `col = term`
    Set { column: String, value: Term },
    /// `col = col + term` on a counter.
    CounterIncrement { column: String, delta: Term },
    /// `col = col + term` on a list.
    ListAppend { column: String, items: Term },
    /// `col = <arithmetic>`
    Expression { column: String, expr: Expr },
}

impl Assignment {
    pub fn column(&self) -> &str {
        match self {
            Assignment::Set { column, .. }
            | Assignment::CounterIncrement { column, .. }
            | Assignment::ListAppend { column, .. }
            | Assignment::Expression { column, .. } => column,
        }
    }
}

/// A prepared `UPDATE ... USING TTL ? AND TIMESTAMP ? SET ... WHERE ...`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub restrictions: Vec<Restriction>,
    pub assignments: Vec<Assignment>,
    pub ttl: Option<Term>,
    pub timestamp: Option<Term>,
}

impl UpdateStatement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restrict(mut self, column: impl Into<String>, value: Term) -> Self {
        self.restrictions.push(Restriction::new(column, value));
        self
    }

    pub fn set(mut self, column: impl Into<String>, value: Term) -> Self {
        self.assignments.push(Assignment::Set {
            column: column.into(),
            value,
        });
        self
    }

    pub fn increment(mut self, column: impl Into<String>, delta: Term) -> Self {
        self.assignments.push(Assignment::CounterIncrement {
            column: column.into(),
            delta,
        });
        self
    }

    pub fn append(mut self, column: impl Into<String>, items: Term) -> Self {
        self.assignments.push(Assignment::ListAppend {
            column: column.into(),
            items,
        });
        self
    }

    pub fn set_expr(mut self, column: impl Into<String>, expr: Expr) -> Self {
        self.assignments.push(Assignment::Expression {
            column: column.into(),
            expr,
        });
        self
    }

    pub fn using_ttl(mut self, ttl: Term) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn using_timestamp(mut self, timestamp: Term) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A prepared `SELECT ... WHERE ... LIMIT ?`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectStatement {
    pub restrictions: Vec<Restriction>,
    pub limit: Option<Term>,
}

impl SelectStatement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restrict(mut self, column: impl Into<String>, value: Term) -> Self {
        self.restrictions.push(Restriction::new(column, value));
        self
    }

    pub fn limit(mut self, limit: Term) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ============================================================================
// Normalized Forms
// ============================================================================

/// A resolved per-column write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnOp {
    Set(Value),
    /// Writes a cell tombstone.
    Delete,
    CounterAdd(i64),
    ListAppend(Vec<Value>),
}

/// An update with every marker resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedUpdate {
    pub key: Vec<(String, Value)>,
    pub ops: Vec<(String, ColumnOp)>,
    pub ttl: Option<Ttl>,
    /// `None` means "use the current time".
    pub timestamp: Option<Timestamp>,
}

/// A select with every marker resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedSelect {
    pub restrictions: Vec<(String, Value)>,
    /// `None` means unlimited.
    pub limit: Option<usize>,
}

// ============================================================================
// Normalization
// ============================================================================

/// Resolves an update statement. `default_ttl` is the table's default,
/// used when the statement has no TTL clause.
pub fn normalize_update(
    stmt: &UpdateStatement,
    values: &[BoundValue],
    default_ttl: Option<Ttl>,
) -> Result<NormalizedUpdate, ViewError> {
    let key = normalize_where(&stmt.restrictions, values)?;

    let mut ops = Vec::with_capacity(stmt.assignments.len());
    for assignment in &stmt.assignments {
        if let Some(op) = normalize_assignment(assignment, values)? {
            ops.push((assignment.column().to_string(), op));
        }
    }

    let ttl = match &stmt.ttl {
        None => default_ttl,
        Some(term) => normalize_ttl(term.bind(values)?)?,
    };
    let timestamp = match &stmt.timestamp {
        None => None,
        Some(term) => normalize_timestamp(term.bind(values)?)?,
    };

    Ok(NormalizedUpdate {
        key,
        ops,
        ttl,
        timestamp,
    })
}

/// Resolves a select statement.
pub fn normalize_select(
    stmt: &SelectStatement,
    values: &[BoundValue],
) -> Result<NormalizedSelect, ViewError> {
    let restrictions = normalize_where(&stmt.restrictions, values)?;
    let limit = match &stmt.limit {
        None => None,
        Some(term) => normalize_limit(term.bind(values)?)?,
    };
    Ok(NormalizedSelect {
        restrictions,
        limit,
    })
}

/// WHERE restrictions never accept unset or null values.
pub fn normalize_where(
    restrictions: &[Restriction],
    values: &[BoundValue],
) -> Result<Vec<(String, Value)>, ViewError> {
    restrictions
        .iter()
        .map(|r| match r.value.bind(values)? {
            BoundValue::Value(value) => Ok((r.column.clone(), value)),
            BoundValue::Null => Err(ViewError::InvalidBind(format!(
                "Invalid null value in condition for column {}",
                r.column
            ))),
            BoundValue::Unset => Err(ViewError::InvalidBind(format!(
                "Invalid unset value for column {}",
                r.column
            ))),
        })
        .collect()
}

/// `LIMIT ?`: unset is unlimited; null and non-positive limits are rejected.
pub fn normalize_limit(bound: BoundValue) -> Result<Option<usize>, ViewError> {
    match bound {
        BoundValue::Unset => Ok(None),
        BoundValue::Null => Err(ViewError::InvalidBind("Invalid null value of limit".to_string())),
        BoundValue::Value(value) => match value.as_bigint() {
            Some(limit) if limit > 0 => Ok(Some(usize::try_from(limit).unwrap_or(usize::MAX))),
            Some(_) => Err(ViewError::InvalidBind(
                "LIMIT must be strictly positive".to_string(),
            )),
            None => Err(ViewError::InvalidBind(format!("invalid limit {value}"))),
        },
    }
}

fn normalize_assignment(
    assignment: &Assignment,
    values: &[BoundValue],
) -> Result<Option<ColumnOp>, ViewError> {
    match assignment {
        Assignment::Set { value, .. } => Ok(match value.bind(values)? {
            BoundValue::Value(value) => Some(ColumnOp::Set(value)),
            BoundValue::Null => Some(ColumnOp::Delete),
            BoundValue::Unset => None,
        }),
        Assignment::CounterIncrement { column, delta } => match delta.bind(values)? {
            BoundValue::Unset => Ok(None),
            BoundValue::Null => Err(ViewError::InvalidBind(
                "Invalid null value for counter increment".to_string(),
            )),
            BoundValue::Value(value) => value
                .as_bigint()
                .map(|delta| Some(ColumnOp::CounterAdd(delta)))
                .ok_or_else(|| {
                    ViewError::InvalidBind(format!("invalid counter increment {value} for {column}"))
                }),
        },
        Assignment::ListAppend { column, items } => match items.bind(values)? {
            BoundValue::Unset | BoundValue::Null => Ok(None),
            BoundValue::Value(Value::List(items)) => Ok(Some(ColumnOp::ListAppend(items))),
            BoundValue::Value(value) => Err(ViewError::InvalidBind(format!(
                "cannot append {value} to list {column}"
            ))),
        },
        Assignment::Expression { expr, .. } => Ok(Some(match expr.evaluate(values)? {
            Some(value) => ColumnOp::Set(value),
            None => ColumnOp::Delete,
        })),
    }
}

fn normalize_ttl(bound: BoundValue) -> Result<Option<Ttl>, ViewError> {
    match bound {
        BoundValue::Unset => Ok(None),
        BoundValue::Null => Err(ViewError::InvalidBind("Invalid null value of TTL".to_string())),
        BoundValue::Value(value) => match value.as_bigint() {
            Some(0) => Ok(None),
            Some(secs) => u32::try_from(secs)
                .map(|secs| Some(Ttl::from_secs(secs)))
                .map_err(|_| ViewError::InvalidBind(format!("TTL {secs} is out of range"))),
            None => Err(ViewError::InvalidBind(format!("invalid TTL {value}"))),
        },
    }
}

fn normalize_timestamp(bound: BoundValue) -> Result<Option<Timestamp>, ViewError> {
    match bound {
        BoundValue::Unset => Ok(None),
        BoundValue::Null => Err(ViewError::InvalidBind(
            "Invalid null value of timestamp".to_string(),
        )),
        BoundValue::Value(value) => value
            .as_bigint()
            .map(|micros| Some(Timestamp::from_micros(micros)))
            .ok_or_else(|| ViewError::InvalidBind(format!("invalid timestamp {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn update_abc() -> UpdateStatement {
        UpdateStatement::new()
            .restrict("p", Term::Literal(Value::Int(1)))
            .set("a", Term::Bind(0))
            .set("b", Term::Bind(1))
            .set("c", Term::Bind(2))
    }

    #[test]
    fn unset_assignments_are_dropped_individually() {
        // Every combination of set and unset for three columns.
        for mask in 0u8..8 {
            let values: Vec<BoundValue> = (0..3)
                .map(|i| {
                    if mask & (1 << i) == 0 {
                        BoundValue::value(i32::from(i) + 10)
                    } else {
                        BoundValue::Unset
                    }
                })
                .collect();

            let update = normalize_update(&update_abc(), &values, None).expect("valid update");

            let written: Vec<&str> = update.ops.iter().map(|(c, _)| c.as_str()).collect();
            let expected: Vec<&str> = ["a", "b", "c"]
                .into_iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) == 0)
                .map(|(_, c)| c)
                .collect();
            assert_eq!(written, expected, "mask {mask:03b}");
        }
    }

    #[test]
    fn null_assignment_deletes_the_cell() {
        let values = [BoundValue::Null, BoundValue::Unset, BoundValue::value(3)];
        let update = normalize_update(&update_abc(), &values, None).expect("valid update");
        assert_eq!(
            update.ops,
            vec![
                ("a".to_string(), ColumnOp::Delete),
                ("c".to_string(), ColumnOp::Set(Value::Int(3))),
            ]
        );
    }

    #[test]
    fn unset_in_an_expression_fails_the_whole_statement() {
        let stmt = UpdateStatement::new()
            .restrict("p", Term::Literal(Value::Int(1)))
            .set("b", Term::Literal(Value::Int(5)))
            .set_expr(
                "a",
                Expr::add(Term::Bind(0).into(), Term::Literal(Value::Int(1)).into()),
            );

        let ok = normalize_update(&stmt, &[BoundValue::value(7)], None).expect("valid update");
        assert_eq!(ok.ops[1], ("a".to_string(), ColumnOp::Set(Value::Int(8))));

        let err = normalize_update(&stmt, &[BoundValue::Unset], None).unwrap_err();
        assert!(matches!(err, ViewError::InvalidBind(_)));
    }

    #[test_case(BoundValue::Unset, Ok(None); "unset is a no-op")]
    #[test_case(BoundValue::value(3), Ok(Some(ColumnOp::CounterAdd(3))); "value increments")]
    #[test_case(
        BoundValue::Null,
        Err(ViewError::InvalidBind("Invalid null value for counter increment".to_string()));
        "null is rejected"
    )]
    fn counter_increment(bound: BoundValue, expected: Result<Option<ColumnOp>, ViewError>) {
        let assignment = Assignment::CounterIncrement {
            column: "c".to_string(),
            delta: Term::Bind(0),
        };
        assert_eq!(normalize_assignment(&assignment, &[bound]), expected);
    }

    #[test]
    fn unset_list_append_is_a_no_op() {
        let assignment = Assignment::ListAppend {
            column: "li".to_string(),
            items: Term::Bind(0),
        };
        assert_eq!(normalize_assignment(&assignment, &[BoundValue::Unset]), Ok(None));
        assert_eq!(
            normalize_assignment(&assignment, &[BoundValue::Value(Value::List(vec![Value::Int(7)]))]),
            Ok(Some(ColumnOp::ListAppend(vec![Value::Int(7)])))
        );
    }

    #[test]
    fn unset_ttl_means_no_ttl_even_with_a_table_default() {
        let stmt = update_abc().using_ttl(Term::Bind(3));
        let default = Some(Ttl::from_secs(60));
        let values = [
            BoundValue::value(1),
            BoundValue::value(2),
            BoundValue::value(3),
            BoundValue::Unset,
        ];

        let update = normalize_update(&stmt, &values, default).expect("valid update");
        assert_eq!(update.ttl, None);
        assert_eq!(update.ops.len(), 3);

        let without_clause = normalize_update(&update_abc(), &values[..3], default)
            .expect("valid update");
        assert_eq!(without_clause.ttl, default);
    }

    #[test]
    fn unset_timestamp_means_now() {
        let stmt = update_abc().using_timestamp(Term::Bind(3));
        let mut values = vec![BoundValue::value(1), BoundValue::Unset, BoundValue::Unset];

        values.push(BoundValue::Unset);
        let update = normalize_update(&stmt, &values, None).expect("valid update");
        assert_eq!(update.timestamp, None);

        values[3] = BoundValue::value(42i64);
        let update = normalize_update(&stmt, &values, None).expect("valid update");
        assert_eq!(update.timestamp, Some(Timestamp::from_micros(42)));
    }

    #[test_case(BoundValue::Unset, Some(None); "unset is unlimited")]
    #[test_case(BoundValue::value(2), Some(Some(2)); "positive")]
    #[test_case(BoundValue::value(0), None; "zero")]
    #[test_case(BoundValue::Null, None; "null")]
    fn limit(bound: BoundValue, expected: Option<Option<usize>>) {
        assert_eq!(normalize_limit(bound).ok(), expected);
    }

    #[test]
    fn unset_where_value_is_rejected() {
        let stmt = SelectStatement::new()
            .restrict("p", Term::Literal(Value::Int(1)))
            .restrict("c", Term::Bind(0));
        let err = normalize_select(&stmt, &[BoundValue::Unset]).unwrap_err();
        assert!(err.to_string().contains("unset"), "{err}");
    }

    #[test]
    fn missing_bind_value_is_an_error() {
        let err = normalize_update(&update_abc(), &[BoundValue::value(1)], None).unwrap_err();
        assert!(matches!(err, ViewError::InvalidBind(_)));
    }
}
