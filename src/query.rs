use crate::error::{EngineError, Result};
use crate::table::{Table, TableRegistry};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, SelectItem, SetExpr,
    Statement, TableFactor, UnaryOperator, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Comparison operators supported by filter clauses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    pub table_idx: usize,
    pub column_idx: usize,
}

#[derive(Clone, Debug)]
pub struct FilterClause {
    pub op: CmpOp,
    pub column_ref: ColumnRef,
    /// Literal text, already validated as parseable by the column type.
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    /// A grouping column appearing in the projection.
    Project,
}

#[derive(Clone, Debug)]
pub struct AggregateClause {
    pub kind: AggregateKind,
    pub column_ref: Option<ColumnRef>,
}

/// A lowered SELECT, the input surface of the executor.
#[derive(Debug)]
pub struct QueryDesc<'a> {
    pub tables: Vec<&'a Table>,
    pub filter_clauses: Vec<FilterClause>,
    pub group_by: Vec<ColumnRef>,
    pub aggregate_clauses: Vec<AggregateClause>,
}

impl<'a> QueryDesc<'a> {
    pub fn column_desc(&self, column_ref: ColumnRef) -> &crate::table::ColumnDesc {
        &self.tables[column_ref.table_idx].schema()[column_ref.column_idx]
    }
}

/// Lowers a SELECT statement onto a registered table.
///
/// The supported shape is `SELECT <aggregates> FROM <table> [WHERE
/// <conjunction>] [GROUP BY <columns>]` with aggregates drawn from
/// `count(*)`, `sum(col)`, and bare grouping columns. Disjunctions are
/// rejected here so the execution core never sees an OR filter list.
pub fn parse_select<'a>(sql: &str, registry: &'a TableRegistry) -> Result<QueryDesc<'a>> {
    let dialect = PostgreSqlDialect {};
    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|err| EngineError::parse(err.to_string()))?;

    if statements.len() != 1 {
        return Err(EngineError::invalid("expected a single SELECT statement"));
    }
    let select = match &statements[0] {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select.clone(),
            _ => return Err(EngineError::invalid("only plain SELECT is supported")),
        },
        _ => return Err(EngineError::invalid("only SELECT statements are supported")),
    };

    let mut desc = QueryDesc {
        tables: Vec::new(),
        filter_clauses: Vec::new(),
        group_by: Vec::new(),
        aggregate_clauses: Vec::new(),
    };

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(EngineError::invalid("exactly one table is supported"));
    }
    let table_name = match &select.from[0].relation {
        TableFactor::Table { name, .. } => name.to_string().to_lowercase(),
        _ => return Err(EngineError::invalid("only plain table references are supported")),
    };
    let table = registry
        .get(&table_name)
        .ok_or_else(|| EngineError::invalid(format!("table not found: {table_name}")))?;
    desc.tables.push(table);

    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) => expr,
            SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => return Err(EngineError::invalid("wildcard projections are not supported")),
        };
        let clause = lower_projection(expr, &desc)?;
        desc.aggregate_clauses.push(clause);
    }
    if desc.aggregate_clauses.is_empty() {
        return Err(EngineError::invalid("query has no projection"));
    }

    if let Some(selection) = &select.selection {
        lower_conjunction(selection, &mut desc)?;
    }

    match &select.group_by {
        GroupByExpr::Expressions(exprs) => {
            for expr in exprs {
                let column_ref = resolve_column(expr, &desc)?;
                desc.group_by.push(column_ref);
            }
        }
        GroupByExpr::All => {
            return Err(EngineError::invalid("GROUP BY ALL is not supported"));
        }
    }

    Ok(desc)
}

fn lower_projection(expr: &Expr, desc: &QueryDesc<'_>) -> Result<AggregateClause> {
    match expr {
        Expr::Function(function) => {
            let name = function.name.to_string().to_lowercase();
            if function.distinct {
                return Err(EngineError::invalid(format!(
                    "{name}(DISTINCT ...) is not supported"
                )));
            }
            match name.as_str() {
                "count" => {
                    let is_star = matches!(
                        function.args.first(),
                        Some(FunctionArg::Unnamed(FunctionArgExpr::Wildcard))
                    );
                    if !is_star || function.args.len() != 1 {
                        return Err(EngineError::invalid("count supports only count(*)"));
                    }
                    Ok(AggregateClause {
                        kind: AggregateKind::Count,
                        column_ref: None,
                    })
                }
                "sum" => {
                    let arg = match function.args.as_slice() {
                        [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))]
                        | [FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(expr),
                            ..
                        }] => expr,
                        _ => {
                            return Err(EngineError::invalid("sum expects a single column"));
                        }
                    };
                    let column_ref = resolve_column(arg, desc)?;
                    Ok(AggregateClause {
                        kind: AggregateKind::Sum,
                        column_ref: Some(column_ref),
                    })
                }
                other => Err(EngineError::invalid(format!(
                    "unsupported aggregate: {other}"
                ))),
            }
        }
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            let column_ref = resolve_column(expr, desc)?;
            Ok(AggregateClause {
                kind: AggregateKind::Project,
                column_ref: Some(column_ref),
            })
        }
        other => Err(EngineError::invalid(format!(
            "unsupported projection: {other}"
        ))),
    }
}

/// Walks a WHERE expression as a conjunction of simple comparisons.
fn lower_conjunction(expr: &Expr, desc: &mut QueryDesc<'_>) -> Result<()> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            lower_conjunction(left, desc)?;
            lower_conjunction(right, desc)
        }
        Expr::BinaryOp {
            op: BinaryOperator::Or,
            ..
        } => Err(EngineError::invalid("OR filters are not supported")),
        Expr::Nested(inner) => lower_conjunction(inner, desc),
        Expr::BinaryOp { left, op, right } => {
            let clause = lower_comparison(left, op, right, desc)?;
            desc.filter_clauses.push(clause);
            Ok(())
        }
        other => Err(EngineError::invalid(format!(
            "unsupported filter expression: {other}"
        ))),
    }
}

fn lower_comparison(
    left: &Expr,
    op: &BinaryOperator,
    right: &Expr,
    desc: &QueryDesc<'_>,
) -> Result<FilterClause> {
    let cmp = match op {
        BinaryOperator::Eq => CmpOp::Eq,
        BinaryOperator::NotEq => CmpOp::Ne,
        BinaryOperator::Lt => CmpOp::Lt,
        BinaryOperator::LtEq => CmpOp::Le,
        BinaryOperator::Gt => CmpOp::Gt,
        BinaryOperator::GtEq => CmpOp::Ge,
        other => {
            return Err(EngineError::invalid(format!(
                "unsupported filter operator: {other}"
            )));
        }
    };

    // Accept both `col op literal` and `literal op col`, mirroring the op
    // in the latter case.
    let (column_ref, op, value) = if let Ok(column_ref) = resolve_column(left, desc) {
        (column_ref, cmp, literal_text(right)?)
    } else if let Ok(column_ref) = resolve_column(right, desc) {
        (column_ref, mirror_op(cmp), literal_text(left)?)
    } else {
        return Err(EngineError::invalid(
            "filters must compare a column with a literal",
        ));
    };

    let desc_entry = desc.column_desc(column_ref);
    desc_entry.ty.validate_literal(&value).map_err(|_| {
        EngineError::parse(format!(
            "value '{value}' is not valid for column {} ({})",
            desc_entry.name,
            desc_entry.ty.to_display_string()
        ))
    })?;

    Ok(FilterClause {
        op,
        column_ref,
        value,
    })
}

fn mirror_op(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::Le => CmpOp::Ge,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::Ge => CmpOp::Le,
        CmpOp::Eq | CmpOp::Ne => op,
    }
}

fn literal_text(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Value(Value::Number(text, _)) => Ok(text.clone()),
        Expr::Value(Value::SingleQuotedString(text)) => Ok(text.clone()),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => Ok(format!("-{}", literal_text(expr)?)),
        other => Err(EngineError::invalid(format!(
            "unsupported filter literal: {other}"
        ))),
    }
}

fn resolve_column(expr: &Expr, desc: &QueryDesc<'_>) -> Result<ColumnRef> {
    let name = match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default(),
        _ => return Err(EngineError::invalid("expected a column reference")),
    };

    for (table_idx, table) in desc.tables.iter().enumerate() {
        if let Some(column_idx) = table.column_index(&name) {
            return Ok(ColumnRef {
                table_idx,
                column_idx,
            });
        }
    }

    Err(EngineError::invalid(format!("column not found: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableBuilder;

    fn registry() -> TableRegistry {
        let table = TableBuilder::new("orders")
            .column_int64("o_orderkey", vec![1, 2, 3])
            .column_strings(
                "o_priority",
                vec!["HIGH".into(), "LOW".into(), "HIGH".into()],
            )
            .column_decimal("o_total", 2, vec![100, 250, 75])
            .build()
            .unwrap();
        let mut registry = TableRegistry::new();
        registry.insert("orders".into(), table);
        registry
    }

    #[test]
    fn lowers_count_star_with_filters() {
        let registry = registry();
        let desc = parse_select(
            "SELECT count(*) FROM orders WHERE o_orderkey = 1 AND o_priority = 'HIGH';",
            &registry,
        )
        .unwrap();
        assert_eq!(desc.aggregate_clauses.len(), 1);
        assert_eq!(desc.aggregate_clauses[0].kind, AggregateKind::Count);
        assert_eq!(desc.filter_clauses.len(), 2);
        assert_eq!(desc.filter_clauses[0].op, CmpOp::Eq);
        assert_eq!(desc.filter_clauses[0].value, "1");
    }

    #[test]
    fn lowers_group_by_projection() {
        let registry = registry();
        let desc = parse_select(
            "SELECT o_priority, count(*), sum(o_total) FROM orders GROUP BY o_priority;",
            &registry,
        )
        .unwrap();
        assert_eq!(desc.aggregate_clauses.len(), 3);
        assert_eq!(desc.aggregate_clauses[0].kind, AggregateKind::Project);
        assert_eq!(desc.aggregate_clauses[2].kind, AggregateKind::Sum);
        assert_eq!(desc.group_by.len(), 1);
    }

    #[test]
    fn flips_reversed_comparisons() {
        let registry = registry();
        let desc = parse_select(
            "SELECT count(*) FROM orders WHERE 2 > o_orderkey;",
            &registry,
        )
        .unwrap();
        assert_eq!(desc.filter_clauses[0].op, CmpOp::Lt);
        assert_eq!(desc.filter_clauses[0].value, "2");
    }

    #[test]
    fn rejects_or_filters() {
        let registry = registry();
        let err = parse_select(
            "SELECT count(*) FROM orders WHERE o_orderkey = 1 OR o_orderkey = 2;",
            &registry,
        )
        .unwrap_err();
        assert!(err.to_string().contains("OR filters"));
    }

    #[test]
    fn rejects_unknown_table_and_column() {
        let registry = registry();
        assert!(parse_select("SELECT count(*) FROM missing;", &registry).is_err());
        assert!(
            parse_select("SELECT count(*) FROM orders WHERE nope = 1;", &registry).is_err()
        );
    }

    #[test]
    fn rejects_bad_literal_for_column_type() {
        let registry = registry();
        let err = parse_select(
            "SELECT count(*) FROM orders WHERE o_orderkey = 'AIR';",
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn rejects_unsupported_aggregates() {
        let registry = registry();
        assert!(parse_select("SELECT avg(o_total) FROM orders;", &registry).is_err());
        assert!(parse_select("SELECT count(DISTINCT o_priority) FROM orders;", &registry).is_err());
    }
}
