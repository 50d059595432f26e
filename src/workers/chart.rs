use crate::artifacts::{ArtifactStore, ArtifactStoreError};
use crate::sandbox::{ChartKind, ExecutionResult, ExecutionValue, Table};
use crate::session::SessionState;
use crate::shared::ids::ArtifactId;

const CANVAS_W: f64 = 640.0;
const CANVAS_H: f64 = 400.0;
const MARGIN: f64 = 48.0;

/// Result of a chart worker run. A render failure is reported here and
/// degrades the turn to its textual result; only artifact-store faults
/// escape as errors.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartOutcome {
    pub summary: String,
    pub artifact: Option<ArtifactId>,
    pub failed: bool,
}

/// Renders the prior worker's result as a chart artifact. Consumes the
/// execution result, not raw session state; the session is only touched to
/// clear the pending-chart flag.
pub fn run_chart(
    state: &mut SessionState,
    prior: &ExecutionResult,
    hint: Option<ChartKind>,
    store: &ArtifactStore,
    now: i64,
) -> Result<ChartOutcome, ArtifactStoreError> {
    let worker = state.active_worker;
    state.pending_chart = false;
    state.updated_at = now;

    let plan = match plan_chart(prior, hint) {
        Ok(plan) => plan,
        Err(reason) => {
            return Ok(ChartOutcome {
                summary: format!("chart could not be rendered: {reason}"),
                artifact: None,
                failed: true,
            })
        }
    };

    match render_svg(&plan) {
        Ok(payload) => {
            let artifact_id = store.put(&payload, worker, plan.kind, now)?;
            Ok(ChartOutcome {
                summary: format!("{} chart stored as {artifact_id}", plan.kind),
                artifact: Some(artifact_id),
                failed: false,
            })
        }
        Err(reason) => Ok(ChartOutcome {
            summary: format!("chart could not be rendered: {reason}"),
            artifact: None,
            failed: true,
        }),
    }
}

struct ChartPlan {
    kind: ChartKind,
    series: Vec<(String, f64)>,
    label_column: String,
    value_column: String,
}

fn pick_columns(table: &Table) -> Result<(String, String), String> {
    if table.columns.len() < 2 {
        return Err("result needs a label column and a value column".to_string());
    }
    let value_column = table
        .columns
        .iter()
        .enumerate()
        .skip(1)
        .find(|(idx, _)| {
            table
                .rows
                .iter()
                .any(|row| row.get(*idx).and_then(|v| v.as_number()).is_some())
        })
        .map(|(_, name)| name.clone())
        .ok_or_else(|| "result has no numeric column to plot".to_string())?;
    Ok((table.columns[0].clone(), value_column))
}

fn extract_series(
    table: &Table,
    label_column: &str,
    value_column: &str,
) -> Result<Vec<(String, f64)>, String> {
    let label_idx = table
        .column_index(label_column)
        .ok_or_else(|| format!("unknown label column `{label_column}`"))?;
    let value_idx = table
        .column_index(value_column)
        .ok_or_else(|| format!("unknown value column `{value_column}`"))?;
    let series: Vec<(String, f64)> = table
        .rows
        .iter()
        .filter_map(|row| {
            let value = row.get(value_idx)?.as_number()?;
            Some((row.get(label_idx)?.render(), value))
        })
        .collect();
    if series.is_empty() {
        return Err(format!(
            "column `{value_column}` holds no numeric values to plot"
        ));
    }
    Ok(series)
}

fn plan_chart(prior: &ExecutionResult, hint: Option<ChartKind>) -> Result<ChartPlan, String> {
    let (table, kind, label_column, value_column) = match prior.value.as_ref() {
        Some(ExecutionValue::Plot(spec)) => (
            &spec.table,
            hint.unwrap_or(spec.kind),
            spec.label_column.clone(),
            spec.value_column.clone(),
        ),
        Some(ExecutionValue::Table(table)) => {
            let (label, value) = pick_columns(table)?;
            (table, hint.unwrap_or(ChartKind::Bar), label, value)
        }
        _ => return Err("no tabular result is available to chart".to_string()),
    };
    let series = extract_series(table, &label_column, &value_column)?;
    Ok(ChartPlan {
        kind,
        series,
        label_column,
        value_column,
    })
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn svg_open(title: &str) -> String {
    format!(
        concat!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" ",
            "viewBox=\"0 0 {w} {h}\">\n",
            "<rect width=\"{w}\" height=\"{h}\" fill=\"white\"/>\n",
            "<text x=\"{tx}\" y=\"24\" text-anchor=\"middle\" font-size=\"16\">{title}</text>\n"
        ),
        w = CANVAS_W,
        h = CANVAS_H,
        tx = CANVAS_W / 2.0,
        title = escape_xml(title),
    )
}

fn value_bounds(series: &[(String, f64)]) -> (f64, f64) {
    let mut min = 0.0_f64;
    let mut max = 0.0_f64;
    for (_, value) in series {
        min = min.min(*value);
        max = max.max(*value);
    }
    if (max - min).abs() < f64::EPSILON {
        max = min + 1.0;
    }
    (min, max)
}

fn render_svg(plan: &ChartPlan) -> Result<Vec<u8>, String> {
    let title = format!("{} by {}", plan.value_column, plan.label_column);
    let body = match plan.kind {
        ChartKind::Bar | ChartKind::Histogram => render_bars(&plan.series),
        ChartKind::Line => render_line(&plan.series, false),
        ChartKind::Scatter => render_line(&plan.series, true),
        ChartKind::Pie => render_pie(&plan.series)?,
    };
    let svg = format!("{}{}</svg>\n", svg_open(&title), body);
    Ok(svg.into_bytes())
}

fn plot_area() -> (f64, f64, f64, f64) {
    (
        MARGIN,
        MARGIN,
        CANVAS_W - 2.0 * MARGIN,
        CANVAS_H - 2.0 * MARGIN,
    )
}

fn axis_lines() -> String {
    let (x0, y0, w, h) = plot_area();
    format!(
        concat!(
            "<line x1=\"{x0}\" y1=\"{yb}\" x2=\"{x1}\" y2=\"{yb}\" stroke=\"black\"/>\n",
            "<line x1=\"{x0}\" y1=\"{y0}\" x2=\"{x0}\" y2=\"{yb}\" stroke=\"black\"/>\n"
        ),
        x0 = x0,
        y0 = y0,
        x1 = x0 + w,
        yb = y0 + h,
    )
}

fn render_bars(series: &[(String, f64)]) -> String {
    let (x0, y0, w, h) = plot_area();
    let (min, max) = value_bounds(series);
    let span = max - min;
    let slot = w / series.len() as f64;
    let bar_w = slot * 0.8;

    let mut out = axis_lines();
    for (idx, (label, value)) in series.iter().enumerate() {
        let height = (value - min) / span * h;
        let x = x0 + idx as f64 * slot + slot * 0.1;
        let y = y0 + h - height;
        out.push_str(&format!(
            "<rect x=\"{x:.1}\" y=\"{y:.1}\" width=\"{bar_w:.1}\" height=\"{height:.1}\" fill=\"steelblue\"/>\n"
        ));
        out.push_str(&format!(
            "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"middle\" font-size=\"11\">{}</text>\n",
            x + bar_w / 2.0,
            y0 + h + 16.0,
            escape_xml(label),
        ));
    }
    out
}

fn render_line(series: &[(String, f64)], points_only: bool) -> String {
    let (x0, y0, w, h) = plot_area();
    let (min, max) = value_bounds(series);
    let span = max - min;
    let step = if series.len() > 1 {
        w / (series.len() - 1) as f64
    } else {
        0.0
    };

    let coords: Vec<(f64, f64)> = series
        .iter()
        .enumerate()
        .map(|(idx, (_, value))| {
            (
                x0 + idx as f64 * step,
                y0 + h - (value - min) / span * h,
            )
        })
        .collect();

    let mut out = axis_lines();
    if !points_only && coords.len() > 1 {
        let points: Vec<String> = coords.iter().map(|(x, y)| format!("{x:.1},{y:.1}")).collect();
        out.push_str(&format!(
            "<polyline points=\"{}\" fill=\"none\" stroke=\"steelblue\" stroke-width=\"2\"/>\n",
            points.join(" ")
        ));
    }
    for (x, y) in &coords {
        out.push_str(&format!(
            "<circle cx=\"{x:.1}\" cy=\"{y:.1}\" r=\"3\" fill=\"steelblue\"/>\n"
        ));
    }
    out
}

fn render_pie(series: &[(String, f64)]) -> Result<String, String> {
    if series.iter().any(|(_, value)| *value < 0.0) {
        return Err("pie charts require non-negative values".to_string());
    }
    let total: f64 = series.iter().map(|(_, value)| value).sum();
    if total <= 0.0 {
        return Err("pie charts require a positive total".to_string());
    }

    let cx = CANVAS_W / 2.0;
    let cy = CANVAS_H / 2.0 + 12.0;
    let r = (CANVAS_H / 2.0) - MARGIN;
    let palette = ["steelblue", "darkorange", "seagreen", "firebrick", "mediumpurple", "goldenrod"];

    let mut out = String::new();
    let mut angle = -std::f64::consts::FRAC_PI_2;
    for (idx, (label, value)) in series.iter().enumerate() {
        let sweep = value / total * std::f64::consts::TAU;
        let (x1, y1) = (cx + r * angle.cos(), cy + r * angle.sin());
        let end = angle + sweep;
        let (x2, y2) = (cx + r * end.cos(), cy + r * end.sin());
        let large = if sweep > std::f64::consts::PI { 1 } else { 0 };
        out.push_str(&format!(
            "<path d=\"M {cx:.1} {cy:.1} L {x1:.1} {y1:.1} A {r:.1} {r:.1} 0 {large} 1 {x2:.1} {y2:.1} Z\" fill=\"{}\"/>\n",
            palette[idx % palette.len()],
        ));
        let mid = angle + sweep / 2.0;
        out.push_str(&format!(
            "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"middle\" font-size=\"11\">{}</text>\n",
            cx + (r + 18.0) * mid.cos(),
            cy + (r + 18.0) * mid.sin(),
            escape_xml(label),
        ));
        angle = end;
    }
    Ok(out)
}
