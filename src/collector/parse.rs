//! Text-exposition parsing (§4.2). Only allow-listed metric names survive;
//! samples without a recognized tenant label are dropped silently (§7).

use log::debug;
use prometheus_parse::Value;

use super::{extract_tenant, Sample, TrackedMetric};

fn scalar_value(value: &Value) -> Option<f64> {
    match value {
        Value::Counter(v) | Value::Gauge(v) | Value::Untyped(v) => Some(*v),
        // Sample-count projection: the cumulative count in the highest
        // (effectively +Inf) bucket is the total number of observations.
        Value::Histogram(buckets) => buckets
            .iter()
            .max_by(|a, b| a.less_than.partial_cmp(&b.less_than).unwrap())
            .map(|b| b.count),
        Value::Summary(counts) => counts
            .iter()
            .max_by(|a, b| a.quantile.partial_cmp(&b.quantile).unwrap())
            .map(|c| c.count),
    }
}

/// Parse one scrape response body, keeping only allow-listed metrics with a
/// recognizable tenant label. Parse errors on individual lines are absorbed
/// by `prometheus_parse` itself (malformed lines are skipped upstream); a
/// hard parse failure of the whole body yields an empty sample set rather
/// than aborting the tick (§7: parse error never aborts the tick).
pub fn parse_exposition(body: &str, source: &str) -> Vec<Sample> {
    let lines = body.lines().map(|l| Ok(l.to_string()));
    let scrape = match prometheus_parse::Scrape::parse(lines) {
        Ok(s) => s,
        Err(e) => {
            debug!("failed to parse exposition text from {source}: {e}");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for raw in scrape.samples {
        let Some(metric) = TrackedMetric::from_exposed_name(&raw.metric) else {
            continue;
        };
        let Some(value) = scalar_value(&raw.value) else {
            continue;
        };
        let labels: std::collections::HashMap<String, String> = raw
            .labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let Some(tenant) = extract_tenant(&labels) else {
            continue;
        };
        out.push(Sample {
            tenant,
            metric,
            value,
            timestamp: raw.timestamp,
            source: source.to_string(),
            labels,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_allow_listed_counter_with_tenant_label() {
        let body = "cortex_distributor_received_samples_total{tenant_id=\"t1\"} 1000\n";
        let samples = parse_exposition(body, "http://x/metrics");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].tenant, "t1");
        assert_eq!(samples[0].metric, TrackedMetric::DistributorReceivedSamples);
        assert_eq!(samples[0].value, 1000.0);
    }

    #[test]
    fn drops_sample_without_tenant_label() {
        let body = "cortex_distributor_received_samples_total{pod=\"p\"} 1000\n";
        assert!(parse_exposition(body, "src").is_empty());
    }

    #[test]
    fn ignores_non_allow_listed_metric() {
        let body = "go_goroutines{tenant=\"t1\"} 12\n";
        assert!(parse_exposition(body, "src").is_empty());
    }

    #[test]
    fn malformed_body_yields_no_samples_not_a_panic() {
        let body = "not a valid exposition line at all {{{\n";
        let samples = parse_exposition(body, "src");
        assert!(samples.is_empty());
    }
}
