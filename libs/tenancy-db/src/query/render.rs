//! Lowering of [`Query`] into `sea_query` statements.

use sea_orm::sea_query::{
    Alias, Asterisk, BinOper, Condition, Expr, JoinType, SelectStatement, SimpleExpr,
};
use sea_orm::{DbBackend, Statement};

use super::{
    Boolean, Clause, Join, JoinCondition, JoinKind, Op, Order, Predicate, Query, SelectItem,
    TableRef, Value, is_identifier, split_qualified,
};

impl Query {
    /// Render into a `sea_query` select statement.
    #[must_use]
    pub fn to_statement(&self) -> SelectStatement {
        let mut stmt = SelectStatement::new();
        from_table(&mut stmt, &self.from);

        if self.columns.is_empty() {
            stmt.column(Asterisk);
        }
        for raw in &self.columns {
            match SelectItem::parse(raw) {
                SelectItem::Wildcard => {
                    stmt.column(Asterisk);
                }
                SelectItem::QualifiedWildcard(q) => {
                    stmt.column((Alias::new(q), Asterisk));
                }
                SelectItem::Column {
                    qualifier,
                    name,
                    alias,
                } => {
                    let col = match qualifier {
                        Some(q) => Expr::col((Alias::new(q), Alias::new(name))),
                        None => Expr::col(Alias::new(name)),
                    };
                    match alias {
                        Some(a) => stmt.expr_as(col, Alias::new(a)),
                        None => stmt.expr(col),
                    };
                }
                SelectItem::Expression => {
                    stmt.expr(Expr::cust(raw.clone()));
                }
            }
        }

        for join in &self.joins {
            add_join(&mut stmt, join);
        }

        if !self.wheres.is_empty() {
            stmt.cond_where(condition(&self.wheres));
        }

        for (column, order) in &self.orders {
            let order = match order {
                Order::Asc => sea_orm::sea_query::Order::Asc,
                Order::Desc => sea_orm::sea_query::Order::Desc,
            };
            stmt.order_by_expr(SimpleExpr::from(column_expr(column)), order);
        }

        if let Some(limit) = self.limit {
            stmt.limit(limit);
        }

        stmt
    }

    /// Render into a backend-specific statement with bound values.
    #[must_use]
    pub fn build(&self, backend: DbBackend) -> Statement {
        backend.build(&self.to_statement())
    }
}

fn from_table(stmt: &mut SelectStatement, table: &TableRef) {
    match (&table.alias, table.name.split_once('.')) {
        (Some(alias), Some((schema, name))) => {
            stmt.from_as((Alias::new(schema), Alias::new(name)), Alias::new(alias));
        }
        (Some(alias), None) => {
            stmt.from_as(Alias::new(&table.name), Alias::new(alias));
        }
        (None, Some((schema, name))) => {
            stmt.from((Alias::new(schema), Alias::new(name)));
        }
        (None, None) => {
            stmt.from(Alias::new(&table.name));
        }
    }
}

fn add_join(stmt: &mut SelectStatement, join: &Join) {
    let kind = match join.kind {
        JoinKind::Inner => JoinType::InnerJoin,
        JoinKind::Left => JoinType::LeftJoin,
    };
    let on = join
        .conditions
        .iter()
        .fold(Condition::all(), |cond, term| cond.add(join_term(term)));

    match &join.table.alias {
        Some(alias) => {
            stmt.join_as(kind, Alias::new(&join.table.name), Alias::new(alias), on);
        }
        None => {
            stmt.join(kind, Alias::new(&join.table.name), on);
        }
    }
}

fn join_term(term: &JoinCondition) -> SimpleExpr {
    match term {
        JoinCondition::Columns { left, op, right } => {
            column_expr(left).binary(bin_oper(*op), column_expr(right))
        }
        JoinCondition::Value { column, op, value } => compare(column, *op, value),
        JoinCondition::Raw(sql) => Expr::cust(sql.clone()),
    }
}

/// Fold clauses left to right, honouring each clause's AND/OR link.
pub(crate) fn condition(clauses: &[Clause]) -> Condition {
    let mut acc: Option<Condition> = None;
    for clause in clauses {
        let next = predicate_condition(&clause.predicate);
        acc = Some(match (acc, clause.boolean) {
            (None, _) => next,
            (Some(prev), Boolean::And) => Condition::all().add(prev).add(next),
            (Some(prev), Boolean::Or) => Condition::any().add(prev).add(next),
        });
    }
    acc.unwrap_or_else(Condition::all)
}

fn predicate_condition(predicate: &Predicate) -> Condition {
    match predicate {
        Predicate::Compare { column, op, value } => Condition::all().add(compare(column, *op, value)),
        Predicate::Null { column, negated } => {
            let col = column_expr(column);
            Condition::all().add(if *negated {
                col.is_not_null()
            } else {
                col.is_null()
            })
        }
        Predicate::In {
            column,
            values,
            negated,
        } => {
            let values: Vec<sea_orm::Value> = values.iter().map(sea_value).collect();
            let col = column_expr(column);
            Condition::all().add(if *negated {
                col.is_not_in(values)
            } else {
                col.is_in(values)
            })
        }
        Predicate::Raw { sql, bindings } => Condition::all().add(Expr::cust_with_values(
            sql.clone(),
            bindings.iter().map(sea_value).collect::<Vec<_>>(),
        )),
        Predicate::Group(clauses) => condition(clauses),
    }
}

fn compare(column: &str, op: Op, value: &Value) -> SimpleExpr {
    let col = column_expr(column);
    match (op, value) {
        (Op::Eq, Value::Null) => col.is_null(),
        (Op::Ne, Value::Null) => col.is_not_null(),
        (op, value) => col.binary(bin_oper(op), SimpleExpr::Value(sea_value(value))),
    }
}

fn bin_oper(op: Op) -> BinOper {
    match op {
        Op::Eq => BinOper::Equal,
        Op::Ne => BinOper::NotEqual,
        Op::Gt => BinOper::GreaterThan,
        Op::Gte => BinOper::GreaterThanOrEqual,
        Op::Lt => BinOper::SmallerThan,
        Op::Lte => BinOper::SmallerThanOrEqual,
        Op::Like => BinOper::Like,
    }
}

/// Column reference; anything that is not `col` or `table.col` is passed through verbatim.
fn column_expr(raw: &str) -> Expr {
    match split_qualified(raw) {
        (Some(q), name) if is_identifier(q) && is_identifier(name) => {
            Expr::col((Alias::new(q), Alias::new(name)))
        }
        (None, name) if is_identifier(name) => Expr::col(Alias::new(name)),
        _ => Expr::expr(Expr::cust(raw.to_owned())),
    }
}

pub(crate) fn sea_value(value: &Value) -> sea_orm::Value {
    match value {
        Value::Null => sea_orm::Value::BigInt(None),
        Value::Bool(b) => sea_orm::Value::Bool(Some(*b)),
        Value::Int(i) => sea_orm::Value::BigInt(Some(*i)),
        Value::Text(s) => sea_orm::Value::String(Some(Box::new(s.clone()))),
    }
}
