//! The merged terminal view: visits and scans rolled up per terminal.

use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};

use super::supervisor::{ActiveSchema, ConnectionSupervisor};
use crate::error::AuditError;

/// Substring filters on the Terminal columns. Empty values are ignored.
///
/// Matching uses SQLite `LIKE`, which folds case for ASCII letters only:
/// "acme" finds "ACME", but "é" does not find "É".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MergedFilter {
    #[serde(default, rename = "customerName")]
    pub customer_name: Option<String>,
    #[serde(default, rename = "customerCode")]
    pub customer_code: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl MergedFilter {
    pub fn customer_name(mut self, v: impl Into<String>) -> Self {
        self.customer_name = Some(v.into());
        self
    }

    pub fn customer_code(mut self, v: impl Into<String>) -> Self {
        self.customer_code = Some(v.into());
        self
    }

    pub fn area(mut self, v: impl Into<String>) -> Self {
        self.area = Some(v.into());
        self
    }

    pub fn region(mut self, v: impl Into<String>) -> Self {
        self.region = Some(v.into());
        self
    }

    /// (column, LIKE pattern) for every non-empty predicate.
    fn predicates(&self) -> Vec<(&'static str, String)> {
        [
            ("t.customer_name", &self.customer_name),
            ("t.customer_code", &self.customer_code),
            ("t.area", &self.area),
            ("t.region", &self.region),
        ]
        .into_iter()
        .filter_map(|(col, v)| {
            v.as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| (col, format!("%{}%", escape_like(s))))
        })
        .collect()
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedRow {
    pub customer_name: Option<String>,
    pub customer_code: Option<String>,
    pub area: Option<String>,
    pub region: Option<String>,
    pub visit_count: i64,
    pub scan_count: i64,
    pub scan_products: String,
}

// Visits and scans are pre-aggregated per customer before joining, so the
// join never multiplies rows. The inner scan grouping yields one row per
// distinct "code-name" pair with its hit count; the outer one sums the hits
// and concatenates the pairs (NULL pairs are skipped by group_concat).
const MERGED_SELECT: &str = r#"
SELECT
    t.customer_name,
    t.customer_code,
    t.area,
    t.region,
    COALESCE(v.visit_count, 0) AS visit_count,
    COALESCE(s.scan_count, 0) AS scan_count,
    COALESCE(s.scan_products, '') AS scan_products
FROM Terminal t
LEFT JOIN (
    SELECT customer_code, COUNT(*) AS visit_count
    FROM Visit
    GROUP BY customer_code
) v ON t.customer_code = v.customer_code
LEFT JOIN (
    SELECT
        customer_code,
        SUM(hits) AS scan_count,
        group_concat(product, '; ' ORDER BY sort_code, product) AS scan_products
    FROM (
        SELECT
            customer_code,
            product_code || '-' || product_name AS product,
            MIN(product_code) AS sort_code,
            COUNT(*) AS hits
        FROM Scan
        GROUP BY customer_code, product_code || '-' || product_name
    )
    GROUP BY customer_code
) s ON t.customer_code = s.customer_code
"#;

fn merged_sql(predicates: &[(&'static str, String)]) -> String {
    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        let conds: Vec<String> = predicates
            .iter()
            .map(|(col, _)| format!("{col} LIKE ? ESCAPE '\\'"))
            .collect();
        format!("WHERE {}", conds.join(" AND "))
    };
    format!("{MERGED_SELECT}{where_clause}\nORDER BY visit_count DESC")
}

fn row_to_merged(row: &rusqlite::Row) -> rusqlite::Result<MergedRow> {
    Ok(MergedRow {
        customer_name: row.get("customer_name")?,
        customer_code: row.get("customer_code")?,
        area: row.get("area")?,
        region: row.get("region")?,
        visit_count: row.get("visit_count")?,
        scan_count: row.get("scan_count")?,
        scan_products: row.get("scan_products")?,
    })
}

impl ActiveSchema {
    pub fn merged_rows(&self, filter: &MergedFilter) -> Result<Vec<MergedRow>, AuditError> {
        let predicates = filter.predicates();
        let sql = merged_sql(&predicates);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(predicates.iter().map(|(_, p)| p)), row_to_merged)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Run the merged query against the current handle.
pub async fn query_merged(
    supervisor: &ConnectionSupervisor,
    filter: MergedFilter,
) -> Result<Vec<MergedRow>, AuditError> {
    supervisor
        .with_current(move |schema| schema.merged_rows(&filter))
        .await
}

#[cfg(test)]
#[path = "merged_tests.rs"]
mod merged_tests;
