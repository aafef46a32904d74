/// Derived metric columns: pure post-processing over the enriched table.
///
/// Rules combine already-fetched columns into new ones; the canonical
/// case is summing several land-cover fractions into a single "percent
/// forest" column. No I/O here; a rule over a missing or null input
/// yields a null derived value for that row, never an error.

use std::collections::BTreeMap;
use std::fmt;

use crate::model::EnrichedSite;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

pub struct DeriveRule {
    /// Output column name.
    pub name: String,
    /// Input column names, all of which must be present and non-null.
    pub inputs: Vec<String>,
    apply: Box<dyn Fn(&[f64]) -> f64 + Send + Sync>,
}

impl DeriveRule {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<String>,
        apply: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        DeriveRule {
            name: name.into(),
            inputs,
            apply: Box::new(apply),
        }
    }

    /// Sum of the input columns.
    pub fn sum(name: impl Into<String>, inputs: Vec<String>) -> Self {
        Self::new(name, inputs, |values| values.iter().sum())
    }

    /// Evaluates the rule against one row's metric map. `None` if any
    /// input column is absent or null.
    pub fn evaluate(&self, metrics: &BTreeMap<String, Option<f64>>) -> Option<f64> {
        let mut values = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            match metrics.get(input) {
                Some(Some(v)) => values.push(*v),
                _ => return None,
            }
        }
        Some((self.apply)(&values))
    }
}

impl fmt::Debug for DeriveRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeriveRule")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Adds every rule's column to every row, in rule order. Later rules may
/// reference columns produced by earlier ones.
pub fn compose(rows: &mut [EnrichedSite], rules: &[DeriveRule]) {
    for row in rows.iter_mut() {
        for rule in rules {
            let value = rule.evaluate(&row.metrics);
            row.metrics.insert(rule.name.clone(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn row(metrics: &[(&str, Option<f64>)]) -> EnrichedSite {
        EnrichedSite {
            site_id: "1".to_string(),
            longitude: -81.20298,
            latitude: 41.17274,
            comid: Some("4000390".to_string()),
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    fn forest_inputs() -> Vec<String> {
        ["PCTDECID2019WS", "PCTCONIF2019WS", "PCTMXFST2019WS", "PCTWDWET2019WS"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_sum_rule_is_exact_arithmetic() {
        let mut rows = vec![row(&[
            ("PCTDECID2019WS", Some(30.0)),
            ("PCTCONIF2019WS", Some(5.5)),
            ("PCTMXFST2019WS", Some(4.25)),
            ("PCTWDWET2019WS", Some(2.0)),
        ])];
        compose(&mut rows, &[DeriveRule::sum("PCTFOREST2019WS", forest_inputs())]);
        assert_eq!(rows[0].metric("PCTFOREST2019WS"), Some(41.75));
    }

    #[test]
    fn test_missing_input_column_yields_null_not_error() {
        let mut rows = vec![row(&[
            ("PCTDECID2019WS", Some(30.0)),
            ("PCTCONIF2019WS", Some(5.5)),
            ("PCTMXFST2019WS", Some(4.25)),
            // PCTWDWET2019WS absent entirely
        ])];
        compose(&mut rows, &[DeriveRule::sum("PCTFOREST2019WS", forest_inputs())]);
        assert_eq!(rows[0].metric("PCTFOREST2019WS"), None);
        assert!(rows[0].metrics.contains_key("PCTFOREST2019WS"));
    }

    #[test]
    fn test_null_input_yields_null() {
        let mut rows = vec![row(&[
            ("PCTDECID2019WS", Some(30.0)),
            ("PCTCONIF2019WS", None),
            ("PCTMXFST2019WS", Some(4.25)),
            ("PCTWDWET2019WS", Some(2.0)),
        ])];
        compose(&mut rows, &[DeriveRule::sum("PCTFOREST2019WS", forest_inputs())]);
        assert_eq!(rows[0].metric("PCTFOREST2019WS"), None);
    }

    #[test]
    fn test_custom_rule_closure() {
        let mut rows = vec![row(&[
            ("PCTDECID2019WS", Some(10.0)),
            ("PCTCONIF2019WS", Some(30.0)),
        ])];
        let mean = DeriveRule::new(
            "FORESTMEANWS",
            vec!["PCTDECID2019WS".to_string(), "PCTCONIF2019WS".to_string()],
            |values| values.iter().sum::<f64>() / values.len() as f64,
        );
        compose(&mut rows, &[mean]);
        assert_eq!(rows[0].metric("FORESTMEANWS"), Some(20.0));
    }

    #[test]
    fn test_later_rules_see_earlier_derived_columns() {
        let mut rows = vec![row(&[("PCTDECID2019WS", Some(10.0))])];
        let double = DeriveRule::new(
            "DOUBLEWS",
            vec!["PCTDECID2019WS".to_string()],
            |v| v[0] * 2.0,
        );
        let quadruple = DeriveRule::new("QUADWS", vec!["DOUBLEWS".to_string()], |v| v[0] * 2.0);
        compose(&mut rows, &[double, quadruple]);
        assert_eq!(rows[0].metric("QUADWS"), Some(40.0));
    }

    #[test]
    fn test_rules_apply_to_every_row() {
        let mut rows = vec![
            row(&[("PCTDECID2019WS", Some(1.0))]),
            row(&[("PCTDECID2019WS", None)]),
        ];
        let rule = DeriveRule::sum("TOTALWS", vec!["PCTDECID2019WS".to_string()]);
        compose(&mut rows, &[rule]);
        assert_eq!(rows[0].metric("TOTALWS"), Some(1.0));
        assert_eq!(rows[1].metric("TOTALWS"), None);
        assert!(rows[1].metrics.contains_key("TOTALWS"));
    }
}
