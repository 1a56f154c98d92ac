//! Condition compiler: lowers a logical condition tree into hot-tier and
//! cold-tier SQL in one pass.
//!
//! Each predicate is classified against the metadata cache: attributes with
//! a column binding (and literal main-column references) push down to the
//! main table; everything else becomes a correlated `EXISTS` over the EAV
//! table. Unknown attributes are skipped silently; an operator the value
//! type cannot support is a hard error.

use std::fmt::Write as _;

use tracing::debug;

use crate::error::{LtBaseError, Result};
use crate::layout::{self, COL_ROW_ID, COL_SCHEMA_ID, ColumnDescriptor, ColumnKind};
use crate::query::{Condition, Logic, Operator};
use crate::record::ScalarValue;
use crate::record::transform::{format_iso8601, parse_date_literal};
use crate::schema::{Encoding, SchemaAttributes, ValueType};
use crate::util::{ParsedNumber, sanitize, try_parse_number};

/// Alias of the main table when it is the anchor.
pub const MAIN_ANCHOR_ALIAS: &str = "m";
/// Alias of the EAV table when it is the anchor.
pub const EAV_ANCHOR_ALIAS: &str = "t";

/// Which table anchors the optimized paged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Main,
    Eav,
}

/// The paired hot-tier / cold-tier artefacts of one compilation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DualClauses {
    /// Hot-tier `EXISTS` subquery per EAV predicate, correlated to the
    /// anchor alias `t`.
    pub pg_clause: String,
    pub pg_args: Vec<ScalarValue>,
    /// Predicates pushed down to main columns as `m.<col> <op> $n`.
    pub pg_main_clause: String,
    pub pg_main_args: Vec<ScalarValue>,
    /// Cold-tier clause with `?` placeholders over main columns.
    pub duck_clause: String,
    pub duck_args: Vec<ScalarValue>,
}

/// A single combined hot-tier clause for the optimized paged query.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridClause {
    pub clause: String,
    pub args: Vec<ScalarValue>,
    pub anchor: Anchor,
}

/// How one predicate's attribute resolves against the cache and catalog.
enum Target {
    /// Bound attribute, or a literal main-column reference.
    Main {
        descriptor: ColumnDescriptor,
        value_type: ValueType,
        encoding: Encoding,
    },
    /// Unbound attribute stored as EAV rows.
    Eav { attr_id: i16, value_type: ValueType },
}

fn resolve_target(attr: &str, attrs: &SchemaAttributes) -> Option<Target> {
    if let Some(meta) = attrs.get(attr) {
        if let Some(binding) = &meta.column_binding {
            let descriptor = layout::descriptor(&binding.column_name)?;
            return Some(Target::Main {
                descriptor,
                value_type: meta.value_type,
                encoding: binding.encoding,
            });
        }
        return Some(Target::Eav {
            attr_id: meta.attribute_id,
            value_type: meta.value_type,
        });
    }

    // Literal reference to a catalog column, system columns included.
    layout::descriptor(attr).map(|descriptor| Target::Main {
        value_type: column_value_type(descriptor),
        encoding: Encoding::Default,
        descriptor,
    })
}

/// Value-type analog of a raw catalog column.
fn column_value_type(descriptor: ColumnDescriptor) -> ValueType {
    match descriptor.kind {
        ColumnKind::Text => ValueType::Text,
        ColumnKind::SmallInt => ValueType::Smallint,
        ColumnKind::Integer => ValueType::Integer,
        ColumnKind::BigInt => ValueType::Bigint,
        ColumnKind::Double => ValueType::Numeric,
        ColumnKind::Uuid => ValueType::Uuid,
        ColumnKind::System => match descriptor.name {
            COL_ROW_ID => ValueType::Uuid,
            COL_SCHEMA_ID => ValueType::Smallint,
            _ => ValueType::Bigint,
        },
    }
}

/// Pushdown classification: the operators each value type supports.
fn operator_supported(value_type: ValueType, op: Operator) -> bool {
    match value_type {
        ValueType::Text | ValueType::Uuid => matches!(
            op,
            Operator::Equals | Operator::StartsWith | Operator::Contains
        ),
        ValueType::Numeric
        | ValueType::Smallint
        | ValueType::Integer
        | ValueType::Bigint
        | ValueType::Date
        | ValueType::Datetime => matches!(
            op,
            Operator::Equals
                | Operator::NotEquals
                | Operator::Gt
                | Operator::Gte
                | Operator::Lt
                | Operator::Lte
        ),
        ValueType::Bool => matches!(op, Operator::Equals | Operator::NotEquals),
    }
}

/// Quote a slot column; system columns stay bare.
fn quote_column(descriptor: ColumnDescriptor) -> String {
    if descriptor.kind == ColumnKind::System {
        descriptor.name.to_string()
    } else {
        sanitize(descriptor.name)
    }
}

fn parse_bool_literal(attr: &str, literal: &str) -> Result<bool> {
    match literal.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(LtBaseError::InvalidAttributeValue {
            attr: attr.to_string(),
            value: literal.to_string(),
        }),
    }
}

fn parse_integer_literal(attr: &str, literal: &str) -> Result<i64> {
    match try_parse_number(literal) {
        Some(ParsedNumber::Int(i)) => Ok(i),
        Some(ParsedNumber::Float(f)) if f.fract() == 0.0 => Ok(f as i64),
        _ => Err(LtBaseError::InvalidAttributeValue {
            attr: attr.to_string(),
            value: literal.to_string(),
        }),
    }
}

fn parse_float_literal(attr: &str, literal: &str) -> Result<f64> {
    match try_parse_number(literal) {
        Some(ParsedNumber::Int(i)) => Ok(i as f64),
        Some(ParsedNumber::Float(f)) => Ok(f),
        None => Err(LtBaseError::InvalidAttributeValue {
            attr: attr.to_string(),
            value: literal.to_string(),
        }),
    }
}

fn parse_date_ms(attr: &str, literal: &str) -> Result<i64> {
    parse_date_literal(literal).ok_or_else(|| LtBaseError::InvalidDateLiteral {
        attr: attr.to_string(),
        literal: literal.to_string(),
    })
}

/// Normalize a literal for a main-column predicate. Dates collapse to the
/// stored encoding; bools to the encoded representation.
fn main_scalar(
    attr: &str,
    value_type: ValueType,
    encoding: Encoding,
    kind: ColumnKind,
    op: Operator,
    literal: &str,
) -> Result<ScalarValue> {
    let value = match value_type {
        ValueType::Text => ScalarValue::Text(op.wrap_literal(literal)),
        ValueType::Uuid => {
            if op == Operator::Equals {
                ScalarValue::Uuid(crate::util::to_uuid(literal)?)
            } else {
                ScalarValue::Text(op.wrap_literal(literal))
            }
        }
        ValueType::Smallint => ScalarValue::SmallInt(parse_integer_literal(attr, literal)? as i16),
        ValueType::Integer => ScalarValue::Int(parse_integer_literal(attr, literal)? as i32),
        ValueType::Bigint => ScalarValue::BigInt(parse_integer_literal(attr, literal)?),
        ValueType::Numeric => ScalarValue::Double(parse_float_literal(attr, literal)?),
        ValueType::Date | ValueType::Datetime => {
            let ms = parse_date_ms(attr, literal)?;
            match encoding {
                Encoding::Iso8601 => ScalarValue::Text(format_iso8601(ms)),
                _ if kind == ColumnKind::Text => ScalarValue::Text(format_iso8601(ms)),
                _ => ScalarValue::BigInt(ms),
            }
        }
        ValueType::Bool => {
            let flag = parse_bool_literal(attr, literal)?;
            match encoding {
                Encoding::BoolText => ScalarValue::Text(if flag { "1" } else { "0" }.to_string()),
                Encoding::BoolInt => ScalarValue::SmallInt(i16::from(flag)),
                _ if kind == ColumnKind::Text => {
                    ScalarValue::Text(if flag { "1" } else { "0" }.to_string())
                }
                _ if kind == ColumnKind::SmallInt => ScalarValue::SmallInt(i16::from(flag)),
                _ => ScalarValue::Bool(flag),
            }
        }
    };
    Ok(value)
}

/// Normalize a literal for an EAV predicate: text types compare against
/// `value_text`, everything else against `value_numeric`.
fn eav_scalar(attr: &str, value_type: ValueType, op: Operator, literal: &str) -> Result<ScalarValue> {
    let value = match value_type {
        ValueType::Text | ValueType::Uuid => ScalarValue::Text(op.wrap_literal(literal)),
        ValueType::Bool => ScalarValue::Double(f64::from(u8::from(parse_bool_literal(
            attr, literal,
        )?))),
        ValueType::Date | ValueType::Datetime => {
            ScalarValue::Double(parse_date_ms(attr, literal)? as f64)
        }
        _ => ScalarValue::Double(parse_float_literal(attr, literal)?),
    };
    Ok(value)
}

/// DuckDB cast target for a non-text parameter.
fn duck_cast_type(value: &ScalarValue) -> Option<&'static str> {
    match value {
        ScalarValue::Text(_) => None,
        ScalarValue::SmallInt(_) => Some("SMALLINT"),
        ScalarValue::Int(_) => Some("INTEGER"),
        ScalarValue::BigInt(_) => Some("BIGINT"),
        ScalarValue::Double(_) => Some("DOUBLE"),
        ScalarValue::Uuid(_) => Some("UUID"),
        ScalarValue::Bool(_) => Some("BOOLEAN"),
    }
}

struct Compiler<'a> {
    main_table: String,
    eav_table: String,
    schema_id: i16,
    attrs: &'a SchemaAttributes,
    param_index: usize,
}

/// Per-node output of the dual-clause fold; one channel per artefact.
#[derive(Default)]
struct ClauseSet {
    pg: String,
    pg_args: Vec<ScalarValue>,
    pg_main: String,
    pg_main_args: Vec<ScalarValue>,
    duck: String,
    duck_args: Vec<ScalarValue>,
}

impl ClauseSet {
    fn is_empty(&self) -> bool {
        self.pg.is_empty() && self.pg_main.is_empty() && self.duck.is_empty()
    }
}

fn join_channel(fragments: Vec<&str>, logic: Logic) -> String {
    let non_empty: Vec<&str> = fragments.into_iter().filter(|f| !f.is_empty()).collect();
    match non_empty.len() {
        0 => String::new(),
        1 => non_empty[0].to_string(),
        _ => format!("({})", non_empty.join(logic.sql())),
    }
}

impl Compiler<'_> {
    fn next_param(&mut self) -> usize {
        let index = self.param_index;
        self.param_index += 1;
        index
    }

    /// The `e.value_text`/`e.value_numeric` predicate tail of an EAV EXISTS.
    fn eav_exists(
        &mut self,
        schema_expr: &str,
        row_expr: &str,
        attr_id: i16,
        value_type: ValueType,
        op: Operator,
    ) -> String {
        let value_col = if value_type.is_textual() {
            "value_text"
        } else {
            "value_numeric"
        };
        let n = self.next_param();
        format!(
            "EXISTS (SELECT 1 FROM {eav} e WHERE e.schema_id = {schema_expr} AND e.row_id = {row_expr} AND e.attr_id = {attr_id} AND e.{value_col} {op} ${n})",
            eav = self.eav_table,
            op = op.sql(),
        )
    }

    /// Dual-clause fold: every predicate lands in exactly one hot-tier
    /// channel, and additionally in the cold-tier channel when bound.
    fn dual_node(&mut self, condition: &Condition) -> Result<ClauseSet> {
        match condition {
            Condition::Composite { logic, conditions } => {
                let mut children = Vec::with_capacity(conditions.len());
                for child in conditions {
                    let set = self.dual_node(child)?;
                    if !set.is_empty() {
                        children.push(set);
                    }
                }
                let mut merged = ClauseSet {
                    pg: join_channel(children.iter().map(|c| c.pg.as_str()).collect(), *logic),
                    pg_main: join_channel(
                        children.iter().map(|c| c.pg_main.as_str()).collect(),
                        *logic,
                    ),
                    duck: join_channel(children.iter().map(|c| c.duck.as_str()).collect(), *logic),
                    ..ClauseSet::default()
                };
                for child in children {
                    merged.pg_args.extend(child.pg_args);
                    merged.pg_main_args.extend(child.pg_main_args);
                    merged.duck_args.extend(child.duck_args);
                }
                Ok(merged)
            }
            Condition::Kv { attr, value } => {
                let (op, literal) = Operator::parse(value);
                let Some(target) = resolve_target(attr, self.attrs) else {
                    debug!(attr = %attr, "attribute not resolvable, predicate skipped");
                    return Ok(ClauseSet::default());
                };
                let mut set = ClauseSet::default();
                match target {
                    Target::Main {
                        descriptor,
                        value_type,
                        encoding,
                    } => {
                        if !operator_supported(value_type, op) {
                            return Err(LtBaseError::UnsupportedOperator {
                                op: op.name().to_string(),
                                attr: attr.clone(),
                            });
                        }
                        let scalar =
                            main_scalar(attr, value_type, encoding, descriptor.kind, op, literal)?;
                        let column = quote_column(descriptor);

                        let n = self.next_param();
                        let lhs = pg_main_lhs(&column, value_type, op);
                        set.pg_main = format!("m.{lhs} {} ${n}", op.sql());
                        set.pg_main_args.push(scalar.clone());

                        let duck_scalar = duck_bool_override(&scalar, value_type, encoding);
                        set.duck = duck_predicate(&column, value_type, op, &duck_scalar);
                        set.duck_args.push(duck_scalar);
                    }
                    Target::Eav {
                        attr_id,
                        value_type,
                    } => {
                        if !operator_supported(value_type, op) {
                            return Err(LtBaseError::UnsupportedOperator {
                                op: op.name().to_string(),
                                attr: attr.clone(),
                            });
                        }
                        let scalar = eav_scalar(attr, value_type, op, literal)?;
                        let schema_expr = self.schema_id.to_string();
                        set.pg = self.eav_exists(
                            &schema_expr,
                            &format!("{EAV_ANCHOR_ALIAS}.row_id"),
                            attr_id,
                            value_type,
                            op,
                        );
                        set.pg_args.push(scalar);
                    }
                }
                Ok(set)
            }
        }
    }

    /// Hybrid fold: one combined clause whose shape depends on the anchor.
    fn hybrid_node(&mut self, condition: &Condition, anchor: Anchor) -> Result<(String, Vec<ScalarValue>)> {
        match condition {
            Condition::Composite { logic, conditions } => {
                let mut fragments = Vec::new();
                let mut args = Vec::new();
                for child in conditions {
                    let (sql, child_args) = self.hybrid_node(child, anchor)?;
                    if !sql.is_empty() {
                        fragments.push(sql);
                        args.extend(child_args);
                    }
                }
                let joined =
                    join_channel(fragments.iter().map(String::as_str).collect(), *logic);
                Ok((joined, args))
            }
            Condition::Kv { attr, value } => {
                let (op, literal) = Operator::parse(value);
                let Some(target) = resolve_target(attr, self.attrs) else {
                    debug!(attr = %attr, "attribute not resolvable, predicate skipped");
                    return Ok((String::new(), Vec::new()));
                };
                match target {
                    Target::Main {
                        descriptor,
                        value_type,
                        encoding,
                    } => {
                        if !operator_supported(value_type, op) {
                            return Err(LtBaseError::UnsupportedOperator {
                                op: op.name().to_string(),
                                attr: attr.clone(),
                            });
                        }
                        let scalar =
                            main_scalar(attr, value_type, encoding, descriptor.kind, op, literal)?;
                        let column = quote_column(descriptor);
                        let n = self.next_param();
                        let lhs = pg_main_lhs(&column, value_type, op);
                        let predicate = format!("m.{lhs} {} ${n}", op.sql());
                        let sql = match anchor {
                            Anchor::Main => predicate,
                            Anchor::Eav => format!(
                                "EXISTS (SELECT 1 FROM {main} m WHERE m.ltbase_row_id = {EAV_ANCHOR_ALIAS}.row_id AND {predicate})",
                                main = self.main_table,
                            ),
                        };
                        Ok((sql, vec![scalar]))
                    }
                    Target::Eav {
                        attr_id,
                        value_type,
                    } => {
                        if !operator_supported(value_type, op) {
                            return Err(LtBaseError::UnsupportedOperator {
                                op: op.name().to_string(),
                                attr: attr.clone(),
                            });
                        }
                        let scalar = eav_scalar(attr, value_type, op, literal)?;
                        let (schema_expr, row_expr) = match anchor {
                            Anchor::Main => (
                                format!("{MAIN_ANCHOR_ALIAS}.{COL_SCHEMA_ID}"),
                                format!("{MAIN_ANCHOR_ALIAS}.{COL_ROW_ID}"),
                            ),
                            Anchor::Eav => (
                                format!("{EAV_ANCHOR_ALIAS}.schema_id"),
                                format!("{EAV_ANCHOR_ALIAS}.row_id"),
                            ),
                        };
                        let sql =
                            self.eav_exists(&schema_expr, &row_expr, attr_id, value_type, op);
                        Ok((sql, vec![scalar]))
                    }
                }
            }
        }
    }
}

/// Left-hand side of a main-column predicate; uuid LIKE comparisons cast
/// through text.
fn pg_main_lhs(column: &str, value_type: ValueType, op: Operator) -> String {
    if value_type == ValueType::Uuid && op != Operator::Equals {
        format!("{column}::text")
    } else {
        column.to_string()
    }
}

/// One cold-tier predicate with a `?` placeholder, cast for non-text types.
fn duck_predicate(column: &str, value_type: ValueType, op: Operator, value: &ScalarValue) -> String {
    if value_type == ValueType::Uuid && op != Operator::Equals {
        return format!("CAST(m.{column} AS VARCHAR) {} ?", op.sql());
    }
    match duck_cast_type(value) {
        Some(cast) => format!("m.{column} {} CAST(? AS {cast})", op.sql()),
        None => format!("m.{column} {} ?", op.sql()),
    }
}

/// Default-encoded bools travel to the cold tier as true/false; encoded
/// bools keep their stored representation.
fn duck_bool_override(
    scalar: &ScalarValue,
    value_type: ValueType,
    encoding: Encoding,
) -> ScalarValue {
    if value_type == ValueType::Bool && encoding == Encoding::Default {
        if let ScalarValue::SmallInt(v) = scalar {
            return ScalarValue::Bool(*v != 0);
        }
        if let ScalarValue::Text(v) = scalar {
            return ScalarValue::Bool(v == "1");
        }
    }
    scalar.clone()
}

/// Choose the paged-query anchor by inspecting the condition: main when any
/// predicate references a main column or main-bound attribute, or when the
/// condition is empty.
#[must_use]
pub fn classify_anchor(condition: Option<&Condition>, attrs: &SchemaAttributes) -> Anchor {
    fn walk(condition: &Condition, attrs: &SchemaAttributes) -> (bool, bool) {
        match condition {
            Condition::Composite { conditions, .. } => {
                let mut any_main = false;
                let mut any_predicate = false;
                for child in conditions {
                    let (main, predicate) = walk(child, attrs);
                    any_main |= main;
                    any_predicate |= predicate;
                }
                (any_main, any_predicate)
            }
            Condition::Kv { attr, .. } => match resolve_target(attr, attrs) {
                Some(Target::Main { .. }) => (true, true),
                Some(Target::Eav { .. }) => (false, true),
                None => (false, false),
            },
        }
    }

    match condition {
        None => Anchor::Main,
        Some(cond) => {
            let (any_main, any_predicate) = walk(cond, attrs);
            if any_main || !any_predicate {
                Anchor::Main
            } else {
                Anchor::Eav
            }
        }
    }
}

/// Compile a condition into the paired hot-tier / cold-tier artefacts.
///
/// `param_index` numbers the `$n` placeholders of the hot-tier fragments and
/// is advanced across both; the cold-tier clause uses `?`. An empty or
/// absent condition yields empty clauses (callers substitute `1=1`).
pub fn to_dual_clauses(
    condition: Option<&Condition>,
    eav_table: &str,
    schema_id: i16,
    attrs: &SchemaAttributes,
    param_index: &mut usize,
) -> Result<DualClauses> {
    if schema_id <= 0 {
        return Err(LtBaseError::InvalidSchemaId { schema_id });
    }
    let eav = sanitize(eav_table);
    if eav.is_empty() {
        return Err(LtBaseError::EmptyTableName { context: "eav table" });
    }

    let Some(condition) = condition else {
        return Ok(DualClauses::default());
    };

    let mut compiler = Compiler {
        main_table: String::new(),
        eav_table: eav,
        schema_id,
        attrs,
        param_index: *param_index,
    };
    let set = compiler.dual_node(condition)?;
    *param_index = compiler.param_index;

    Ok(DualClauses {
        pg_clause: set.pg,
        pg_args: set.pg_args,
        pg_main_clause: set.pg_main,
        pg_main_args: set.pg_main_args,
        duck_clause: set.duck,
        duck_args: set.duck_args,
    })
}

/// Compile the single combined hot-tier clause used by the optimized paged
/// query. A null condition (or one that compiles away entirely) yields
/// `1=1`.
pub fn to_hybrid_clause(
    condition: Option<&Condition>,
    main_table: &str,
    eav_table: &str,
    attrs: &SchemaAttributes,
    anchor: Anchor,
    param_index: &mut usize,
) -> Result<HybridClause> {
    let main = sanitize(main_table);
    if main.is_empty() {
        return Err(LtBaseError::EmptyTableName {
            context: "main table",
        });
    }
    let eav = sanitize(eav_table);
    if eav.is_empty() {
        return Err(LtBaseError::EmptyTableName { context: "eav table" });
    }

    let Some(condition) = condition else {
        return Ok(HybridClause {
            clause: "1=1".to_string(),
            args: Vec::new(),
            anchor,
        });
    };

    let mut compiler = Compiler {
        main_table: main,
        eav_table: eav,
        schema_id: 0,
        attrs,
        param_index: *param_index,
    };
    let (mut clause, args) = compiler.hybrid_node(condition, anchor)?;
    *param_index = compiler.param_index;

    if clause.is_empty() {
        clause = "1=1".to_string();
    }
    Ok(HybridClause {
        clause,
        args,
        anchor,
    })
}

/// Render the anti-join exclusion appended to cold-tier anchors, one `?`
/// placeholder per dirty id.
#[must_use]
pub fn duck_exclusion_clause(dirty_count: usize) -> String {
    if dirty_count == 0 {
        return String::new();
    }
    let mut sql = String::from("m.ltbase_row_id NOT IN (");
    for i in 0..dirty_count {
        if i > 0 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "CAST(? AS UUID)");
    }
    sql.push(')');
    sql
}
