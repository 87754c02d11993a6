use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::{array_field, as_f64, fields, file_type, number, scratch};
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

/// Number of rows kept in the durable analysis for display.
const SAMPLE_ROWS: usize = 3;

/// Parsed CSV file.
#[derive(Debug, Clone)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl Table {
    /// Numeric values of the first column whose lowercase name is in `names`.
    fn numbers(&self, names: &[&str]) -> Option<Vec<f64>> {
        let column = self
            .columns
            .iter()
            .find(|c| names.contains(&c.to_lowercase().as_str()))?;
        Some(
            self.rows
                .iter()
                .filter_map(|r| r.get(column).and_then(as_f64))
                .collect(),
        )
    }

    fn column_containing(&self, needles: &[&str]) -> Option<&String> {
        self.columns.iter().find(|c| {
            let lower = c.to_lowercase();
            needles.iter().any(|n| lower.contains(n))
        })
    }
}

/// Read a CSV file, typing cells as integers, floats or strings.
pub fn read_csv(path: &Path) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open '{}'", path.display()))?;

    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to read header of '{}'", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Malformed row in '{}'", path.display()))?;
        let row: Map<String, Value> = columns
            .iter()
            .zip(record.iter())
            .map(|(col, cell)| (col.clone(), cell_value(cell)))
            .collect();
        rows.push(row);
    }

    Ok(Table { columns, rows })
}

fn cell_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    cell.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(cell.to_string()))
}

/// Classify a file by its column names.
pub fn detect_file_type(columns: &[String]) -> &'static str {
    let lower: BTreeSet<String> = columns.iter().map(|c| c.to_lowercase()).collect();
    let hits = |names: &[&str]| names.iter().filter(|n| lower.contains(**n)).count();

    if hits(&["experiment_id", "variant", "variation", "test_group", "control"]) > 0 {
        return file_type::EXPERIMENT_RESULTS;
    }
    if hits(&[
        "campaign_name",
        "campaign_id",
        "spend",
        "conversions",
        "impressions",
        "clicks",
        "ctr",
        "cpa",
        "roas",
    ]) >= 3
    {
        return file_type::HISTORICAL;
    }
    if hits(&["competitor", "market", "benchmark", "industry", "category"]) > 0 {
        return file_type::ENRICHMENT;
    }
    file_type::UNKNOWN
}

fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| sum(values) / values.len() as f64)
}

fn historical_metrics(table: &Table) -> Map<String, Value> {
    let mut metrics = Map::new();
    if let Some(spend) = table.numbers(&["spend", "cost", "budget"]) {
        metrics.insert("total_spend".into(), number(sum(&spend)));
        if let Some(avg) = mean(&spend) {
            metrics.insert("avg_daily_spend".into(), number(avg));
        }
    }
    if let Some(conv) = table.numbers(&["conversions", "conv"]) {
        metrics.insert("total_conversions".into(), number(sum(&conv)));
    }
    if let Some(revenue) = table.numbers(&["revenue", "conversion_value"]) {
        metrics.insert("total_revenue".into(), number(sum(&revenue)));
    }
    for (names, key) in [
        (&["cpa", "cost_per_acquisition"][..], "avg_cpa"),
        (&["ctr", "click_through_rate"][..], "avg_ctr"),
        (&["roas", "return_on_ad_spend"][..], "avg_roas"),
    ] {
        if let Some(avg) = table.numbers(names).as_deref().and_then(mean) {
            metrics.insert(key.into(), number(avg));
        }
    }
    metrics
}

/// Per-variant totals plus derived CPA, ROAS and CTR.
pub fn variant_summary(table: &Table) -> Map<String, Value> {
    let Some(variant_col) = table.column_containing(&["variant", "variation", "test_group"]) else {
        return Map::new();
    };

    let measures = [
        ("spend", &["spend", "cost"][..]),
        ("conversions", &["conversions", "conv"][..]),
        ("revenue", &["revenue", "conversion_value"][..]),
        ("clicks", &["clicks"][..]),
        ("impressions", &["impressions"][..]),
    ];
    let columns: Vec<(&str, Option<&String>)> = measures
        .iter()
        .map(|(key, names)| {
            let col = table
                .columns
                .iter()
                .find(|c| names.contains(&c.to_lowercase().as_str()));
            (*key, col)
        })
        .collect();

    let mut totals: BTreeMap<String, BTreeMap<&str, f64>> = BTreeMap::new();
    for row in &table.rows {
        let Some(variant) = row.get(variant_col).filter(|v| !v.is_null()) else {
            continue;
        };
        let name = match variant {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let entry = totals.entry(name).or_default();
        for &(key, col) in &columns {
            if let Some(v) = col.and_then(|c| row.get(c)).and_then(as_f64) {
                *entry.entry(key).or_default() += v;
            }
        }
    }

    totals
        .into_iter()
        .map(|(variant, t)| {
            let get = |k: &str| t.get(k).copied().unwrap_or(0.0);
            let mut summary = Map::new();
            for &(key, _) in &columns {
                summary.insert(key.into(), number(get(key)));
            }
            if get("conversions") > 0.0 {
                summary.insert("cpa".into(), number(get("spend") / get("conversions")));
            }
            if get("spend") > 0.0 {
                summary.insert("roas".into(), number(get("revenue") / get("spend")));
            }
            if get("impressions") > 0.0 {
                summary.insert("ctr".into(), number(get("clicks") / get("impressions")));
            }
            (variant, Value::Object(summary))
        })
        .collect()
}

fn experiment_metrics(table: &Table) -> Map<String, Value> {
    let mut metrics = Map::new();
    if let Some(col) = table.columns.iter().find(|c| c.eq_ignore_ascii_case("experiment_id")) {
        let ids: BTreeSet<String> = table
            .rows
            .iter()
            .filter_map(|r| r.get(col))
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();
        metrics.insert("experiment_count".into(), Value::from(ids.len()));
    }
    let summary = variant_summary(table);
    if !summary.is_empty() {
        metrics.insert(
            "variants".into(),
            Value::Array(summary.keys().cloned().map(Value::String).collect()),
        );
        metrics.insert("variant_summary".into(), Value::Object(summary));
    }
    metrics
}

/// Durable summary of a parsed file. Raw rows are not included.
pub fn analyze_table(path: &Path, table: &Table) -> Value {
    let kind = detect_file_type(&table.columns);
    let metrics = match kind {
        file_type::HISTORICAL => historical_metrics(table),
        file_type::EXPERIMENT_RESULTS => experiment_metrics(table),
        _ => Map::new(),
    };

    json!({
        "file_path": path.display().to_string(),
        "file_name": file_name(path),
        "type": kind,
        "row_count": table.rows.len(),
        "column_count": table.columns.len(),
        "columns": table.columns,
        "sample": table.rows.iter().take(SAMPLE_ROWS).cloned().collect::<Vec<_>>(),
        "metrics": metrics,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Parses the session's uploaded files.
///
/// Summaries land in `file_analyses`; the raw rows only go to scratch, since
/// they can be large and are only needed by later nodes of the same run.
pub struct AnalyzeFilesNode;

#[async_trait]
impl Node for AnalyzeFilesNode {
    fn name(&self) -> &str {
        "analyze_files"
    }

    fn description(&self) -> &str {
        "Parse uploaded CSV files, classify them and summarise their metrics"
    }

    async fn execute(&self, mut state: ExecutionState, ctx: &NodeContext) -> Result<ExecutionState> {
        let paths: Vec<PathBuf> = array_field(&state, fields::UPLOADED_FILES)
            .iter()
            .filter_map(|v| v.as_str())
            .map(PathBuf::from)
            .collect();

        if paths.is_empty() {
            state.set_field(fields::FILE_ANALYSES, Value::Array(Vec::new()));
            state.push_message("No files uploaded this session");
            return Ok(state);
        }

        let mut analyses = Vec::new();
        let mut rows_by_file = Map::new();

        for path in paths {
            let name = file_name(&path);
            let parse_path = path.clone();
            let parsed = tokio::task::spawn_blocking(move || read_csv(&parse_path))
                .await
                .context("analyze_files: parser task panicked")?;

            match parsed {
                Ok(table) => {
                    let analysis = analyze_table(&path, &table);
                    let kind = analysis["type"].as_str().unwrap_or(file_type::UNKNOWN);
                    info!(file = %name, kind = %kind, rows = table.rows.len(), "Analyzed file");
                    let line = format!("Analyzed {}: {} ({} rows)", name, kind, table.rows.len());
                    ctx.report(line.clone());
                    state.push_message(line);
                    analyses.push(analysis);
                    rows_by_file.insert(
                        name,
                        Value::Array(table.rows.into_iter().map(Value::Object).collect()),
                    );
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "File analysis failed");
                    let line = format!("File analysis error: {:#}", e);
                    ctx.report(line.clone());
                    state.errors.push(line);
                }
            }
        }

        state.set_field(fields::FILE_ANALYSES, Value::Array(analyses));
        state
            .scratch
            .insert(scratch::FILE_ROWS.into(), Value::Object(rows_by_file));
        Ok(state)
    }
}
