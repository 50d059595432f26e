use super::frame::load_frame;
use super::{CancelFlag, ChartKind, ExecutionValue, PlotSpec, SandboxFailure, Table, Value};
use crate::config::ExecutionLimits;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Pipeline mini-language executed for `kind=code` snippets.
///
/// A snippet is a `|`-separated chain of allow-listed operations, e.g.
/// `group_by(region) | sum(revenue) | sort_desc(sum_revenue) | head(1) | pick(region)`
/// or `group_by(region) | sum(revenue) | plot(bar, region, sum_revenue)`.
/// Nothing outside this operation set is reachable from a snippet; there is
/// no filesystem, network, or process surface in the interpreter.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Cmp {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "==" => Some(Cmp::Eq),
            "!=" => Some(Cmp::Ne),
            ">" => Some(Cmp::Gt),
            ">=" => Some(Cmp::Ge),
            "<" => Some(Cmp::Lt),
            "<=" => Some(Cmp::Le),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggFunc {
    Sum,
    Mean,
    Count,
    Min,
    Max,
}

impl AggFunc {
    fn name(self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Count => "count",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Select(Vec<String>),
    Filter {
        column: String,
        cmp: Cmp,
        literal: Value,
    },
    GroupBy(String),
    Agg {
        func: AggFunc,
        column: Option<String>,
    },
    SortAsc(String),
    SortDesc(String),
    Head(usize),
    Pick(String),
    Plot {
        kind: ChartKind,
        label_column: String,
        value_column: String,
    },
}

fn split_args(raw: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in raw.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if in_quotes {
        return Err("unterminated quote in arguments".to_string());
    }
    let last = current.trim();
    if !last.is_empty() {
        args.push(last.to_string());
    }
    if args.iter().any(|a| a.is_empty()) {
        return Err("empty argument".to_string());
    }
    Ok(args)
}

fn parse_literal(raw: &str) -> Value {
    let unquoted = raw.trim().trim_matches('"');
    match unquoted.parse::<f64>() {
        Ok(n) if n.is_finite() => Value::Number(n),
        _ => Value::Text(unquoted.to_string()),
    }
}

fn parse_op(raw: &str) -> Result<Op, String> {
    let trimmed = raw.trim();
    let open = trimmed
        .find('(')
        .ok_or_else(|| format!("expected `name(...)`, got `{trimmed}`"))?;
    if !trimmed.ends_with(')') {
        return Err(format!("missing closing parenthesis in `{trimmed}`"));
    }
    let name = trimmed[..open].trim();
    let args = split_args(&trimmed[open + 1..trimmed.len() - 1])?;

    let expect = |count: usize| -> Result<(), String> {
        if args.len() == count {
            Ok(())
        } else {
            Err(format!("`{name}` takes {count} argument(s), got {}", args.len()))
        }
    };

    match name {
        "select" => {
            if args.is_empty() {
                return Err("`select` needs at least one column".to_string());
            }
            Ok(Op::Select(args))
        }
        "filter" => {
            expect(3)?;
            let cmp = Cmp::parse(&args[1])
                .ok_or_else(|| format!("unknown comparison `{}` in `filter`", args[1]))?;
            Ok(Op::Filter {
                column: args[0].clone(),
                cmp,
                literal: parse_literal(&args[2]),
            })
        }
        "group_by" => {
            expect(1)?;
            Ok(Op::GroupBy(args[0].clone()))
        }
        "sum" | "mean" | "min" | "max" => {
            expect(1)?;
            let func = match name {
                "sum" => AggFunc::Sum,
                "mean" => AggFunc::Mean,
                "min" => AggFunc::Min,
                _ => AggFunc::Max,
            };
            Ok(Op::Agg {
                func,
                column: Some(args[0].clone()),
            })
        }
        "count" => {
            if !args.is_empty() {
                return Err("`count` takes no arguments".to_string());
            }
            Ok(Op::Agg {
                func: AggFunc::Count,
                column: None,
            })
        }
        "sort_asc" => {
            expect(1)?;
            Ok(Op::SortAsc(args[0].clone()))
        }
        "sort_desc" => {
            expect(1)?;
            Ok(Op::SortDesc(args[0].clone()))
        }
        "head" => {
            expect(1)?;
            let n: usize = args[0]
                .parse()
                .map_err(|_| format!("`head` needs a whole number, got `{}`", args[0]))?;
            Ok(Op::Head(n))
        }
        "pick" => {
            expect(1)?;
            Ok(Op::Pick(args[0].clone()))
        }
        "plot" => {
            expect(3)?;
            let kind = ChartKind::parse(&args[0])
                .ok_or_else(|| format!("unknown chart kind `{}`", args[0]))?;
            Ok(Op::Plot {
                kind,
                label_column: args[1].clone(),
                value_column: args[2].clone(),
            })
        }
        other => Err(format!("operation `{other}` is not allowed")),
    }
}

fn parse_pipeline(snippet: &str) -> Result<Vec<Op>, String> {
    let trimmed = snippet.trim();
    if trimmed.is_empty() {
        return Err("empty snippet".to_string());
    }
    let mut ops = Vec::new();
    let mut segment = String::new();
    let mut in_quotes = false;
    for ch in trimmed.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                segment.push(ch);
            }
            '|' if !in_quotes => {
                ops.push(parse_op(&segment)?);
                segment.clear();
            }
            _ => segment.push(ch),
        }
    }
    ops.push(parse_op(&segment)?);
    for (idx, op) in ops.iter().enumerate() {
        if matches!(op, Op::Plot { .. }) && idx + 1 != ops.len() {
            return Err("`plot` must be the final operation".to_string());
        }
    }
    Ok(ops)
}

/// Drops a trailing `pick(...)` so a chart follow-up can re-derive the
/// table a scalar answer was picked from. Returns `None` when the snippet
/// does not end in a pick.
pub fn strip_terminal_pick(snippet: &str) -> Option<String> {
    let mut segments = Vec::new();
    let mut segment = String::new();
    let mut in_quotes = false;
    for ch in snippet.trim().chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                segment.push(ch);
            }
            '|' if !in_quotes => {
                segments.push(segment.trim().to_string());
                segment.clear();
            }
            _ => segment.push(ch),
        }
    }
    segments.push(segment.trim().to_string());
    if segments.len() < 2 || !segments.last()?.starts_with("pick(") {
        return None;
    }
    segments.pop();
    Some(segments.join(" | "))
}

/// Deadline and cancellation guard checked at operation boundaries and at
/// row-chunk granularity inside scans.
struct ExecGuard<'a> {
    deadline: Instant,
    cancel: &'a CancelFlag,
    budget: u32,
}

const GUARD_CHUNK: u32 = 1024;

impl<'a> ExecGuard<'a> {
    fn new(deadline: Instant, cancel: &'a CancelFlag) -> Self {
        Self {
            deadline,
            cancel,
            budget: GUARD_CHUNK,
        }
    }

    fn check(&self) -> Result<(), SandboxFailure> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(SandboxFailure::timeout("execution cancelled"));
        }
        if Instant::now() >= self.deadline {
            return Err(SandboxFailure::timeout("execution deadline exceeded"));
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<(), SandboxFailure> {
        self.budget -= 1;
        if self.budget == 0 {
            self.budget = GUARD_CHUNK;
            return self.check();
        }
        Ok(())
    }
}

enum PipeData {
    Rows(Table),
    Grouped {
        key_column: String,
        columns: Vec<String>,
        groups: Vec<(Value, Vec<Vec<Value>>)>,
    },
    Scalar(Value),
    Plot(PlotSpec),
}

fn column_index(table: &Table, name: &str) -> Result<usize, SandboxFailure> {
    table
        .column_index(name)
        .ok_or_else(|| SandboxFailure::execution(format!("unknown column `{name}`")))
}

fn compare_values(left: &Value, right: &Value) -> std::cmp::Ordering {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => left.render().cmp(&right.render()),
    }
}

fn filter_matches(cell: &Value, cmp: Cmp, literal: &Value) -> bool {
    let ordering = compare_values(cell, literal);
    match cmp {
        Cmp::Eq => ordering == std::cmp::Ordering::Equal,
        Cmp::Ne => ordering != std::cmp::Ordering::Equal,
        Cmp::Gt => ordering == std::cmp::Ordering::Greater,
        Cmp::Ge => ordering != std::cmp::Ordering::Less,
        Cmp::Lt => ordering == std::cmp::Ordering::Less,
        Cmp::Le => ordering != std::cmp::Ordering::Greater,
    }
}

fn aggregate_rows(
    func: AggFunc,
    column: Option<&str>,
    columns: &[String],
    rows: &[Vec<Value>],
) -> Result<Value, SandboxFailure> {
    if func == AggFunc::Count {
        return Ok(Value::Number(rows.len() as f64));
    }
    let name = column.ok_or_else(|| {
        SandboxFailure::validation(format!("`{}` needs a column", func.name()))
    })?;
    let idx = columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| SandboxFailure::execution(format!("unknown column `{name}`")))?;

    let numbers = rows.iter().filter_map(|row| row[idx].as_number());
    match func {
        AggFunc::Sum => Ok(Value::Number(numbers.sum())),
        AggFunc::Mean => {
            let values: Vec<f64> = numbers.collect();
            if values.is_empty() {
                return Err(SandboxFailure::execution(format!(
                    "`mean` over column `{name}` found no numeric values"
                )));
            }
            Ok(Value::Number(values.iter().sum::<f64>() / values.len() as f64))
        }
        AggFunc::Min => numbers
            .reduce(f64::min)
            .map(Value::Number)
            .ok_or_else(|| {
                SandboxFailure::execution(format!(
                    "`min` over column `{name}` found no numeric values"
                ))
            }),
        AggFunc::Max => numbers
            .reduce(f64::max)
            .map(Value::Number)
            .ok_or_else(|| {
                SandboxFailure::execution(format!(
                    "`max` over column `{name}` found no numeric values"
                ))
            }),
        AggFunc::Count => unreachable!(),
    }
}

fn apply_op(data: PipeData, op: &Op, guard: &mut ExecGuard<'_>) -> Result<PipeData, SandboxFailure> {
    guard.check()?;
    match data {
        PipeData::Scalar(_) => Err(SandboxFailure::validation(
            "no operations are allowed after a scalar result",
        )),
        PipeData::Plot(_) => Err(SandboxFailure::validation(
            "no operations are allowed after `plot`",
        )),
        PipeData::Grouped {
            key_column,
            columns,
            groups,
        } => match op {
            Op::Agg { func, column } => {
                let value_name = match column {
                    Some(name) => format!("{}_{name}", func.name()),
                    None => func.name().to_string(),
                };
                let mut rows = Vec::with_capacity(groups.len());
                for (key, group_rows) in &groups {
                    guard.tick()?;
                    let value =
                        aggregate_rows(*func, column.as_deref(), &columns, group_rows)?;
                    rows.push(vec![key.clone(), value]);
                }
                Ok(PipeData::Rows(Table {
                    columns: vec![key_column, value_name],
                    rows,
                }))
            }
            _ => Err(SandboxFailure::validation(
                "`group_by` must be followed by an aggregation",
            )),
        },
        PipeData::Rows(table) => match op {
            Op::Select(names) => {
                let indexes: Vec<usize> = names
                    .iter()
                    .map(|name| column_index(&table, name))
                    .collect::<Result<_, _>>()?;
                let mut rows = Vec::with_capacity(table.rows.len());
                for row in &table.rows {
                    guard.tick()?;
                    rows.push(indexes.iter().map(|&i| row[i].clone()).collect());
                }
                Ok(PipeData::Rows(Table {
                    columns: names.clone(),
                    rows,
                }))
            }
            Op::Filter {
                column,
                cmp,
                literal,
            } => {
                let idx = column_index(&table, column)?;
                let mut rows = Vec::new();
                for row in table.rows {
                    guard.tick()?;
                    if filter_matches(&row[idx], *cmp, literal) {
                        rows.push(row);
                    }
                }
                Ok(PipeData::Rows(Table {
                    columns: table.columns,
                    rows,
                }))
            }
            Op::GroupBy(column) => {
                let idx = column_index(&table, column)?;
                let mut order: Vec<Value> = Vec::new();
                let mut groups: Vec<(Value, Vec<Vec<Value>>)> = Vec::new();
                for row in table.rows {
                    guard.tick()?;
                    let key = row[idx].clone();
                    match order.iter().position(|k| compare_values(k, &key).is_eq()) {
                        Some(pos) => groups[pos].1.push(row),
                        None => {
                            order.push(key.clone());
                            groups.push((key, vec![row]));
                        }
                    }
                }
                Ok(PipeData::Grouped {
                    key_column: column.clone(),
                    columns: table.columns,
                    groups,
                })
            }
            Op::Agg { func, column } => {
                let value =
                    aggregate_rows(*func, column.as_deref(), &table.columns, &table.rows)?;
                Ok(PipeData::Scalar(value))
            }
            Op::SortAsc(column) | Op::SortDesc(column) => {
                let idx = column_index(&table, column)?;
                let mut rows = table.rows;
                rows.sort_by(|a, b| compare_values(&a[idx], &b[idx]));
                if matches!(op, Op::SortDesc(_)) {
                    rows.reverse();
                }
                Ok(PipeData::Rows(Table {
                    columns: table.columns,
                    rows,
                }))
            }
            Op::Head(n) => {
                let mut rows = table.rows;
                rows.truncate(*n);
                Ok(PipeData::Rows(Table {
                    columns: table.columns,
                    rows,
                }))
            }
            Op::Pick(column) => {
                let idx = column_index(&table, column)?;
                let first = table.rows.first().ok_or_else(|| {
                    SandboxFailure::execution("`pick` on an empty result".to_string())
                })?;
                Ok(PipeData::Scalar(first[idx].clone()))
            }
            Op::Plot {
                kind,
                label_column,
                value_column,
            } => {
                column_index(&table, label_column)?;
                column_index(&table, value_column)?;
                Ok(PipeData::Plot(PlotSpec {
                    kind: *kind,
                    label_column: label_column.clone(),
                    value_column: value_column.clone(),
                    table,
                }))
            }
        },
    }
}

pub fn run_script(
    snippet: &str,
    csv_path: &Path,
    limits: &ExecutionLimits,
    deadline: Instant,
    cancel: &CancelFlag,
) -> Result<(ExecutionValue, bool), SandboxFailure> {
    let ops = parse_pipeline(snippet).map_err(SandboxFailure::validation)?;

    let mut guard = ExecGuard::new(deadline, cancel);
    guard.check()?;
    let frame = load_frame(csv_path, limits.max_frame_rows)?;
    let loaded_truncated = frame.truncated;

    let mut data = PipeData::Rows(frame.table);
    for op in &ops {
        data = apply_op(data, op, &mut guard)?;
    }

    let value = match data {
        PipeData::Rows(table) => ExecutionValue::Table(table),
        PipeData::Scalar(value) => ExecutionValue::Scalar(value),
        PipeData::Plot(spec) => ExecutionValue::Plot(spec),
        PipeData::Grouped { .. } => {
            return Err(SandboxFailure::validation(
                "`group_by` must be followed by an aggregation",
            ))
        }
    };
    Ok((value, loaded_truncated))
}
