use crate::billing::BillingApi;
use crate::error::AppError;
use crate::models::{
    AccountNameIndex, CostAndUsageQuery, CostRecord, Dimension, Granularity, MetricKind,
    MetricMap, ReportingWindow,
};
use crate::plugin::is_metric_segment;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    pub metric: MetricKind,
    pub resolve_names: bool,
    pub forecast: bool,
}

/// Drops `.` and `,` and turns spaces into `-`. The result may still hold
/// characters Mackerel rejects; callers check it with `is_metric_segment`.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '.' && *c != ',')
        .map(|c| if c == ' ' { '-' } else { c })
        .collect()
}

/// Key segment per record. A name is used only when it is a valid segment,
/// belongs to exactly one record and is not another record's account ID.
/// Everything else reports the raw account ID, so keys never collide.
fn key_segments<'a>(
    records: &'a [CostRecord],
    names: &'a AccountNameIndex,
    resolve_names: bool,
) -> Vec<&'a str> {
    let candidates: Vec<Option<&str>> = records
        .iter()
        .map(|record| {
            names
                .get(&record.account_id)
                .map(String::as_str)
                .filter(|name| resolve_names && is_metric_segment(name))
        })
        .collect();

    let mut uses: HashMap<&str, usize> = HashMap::new();
    for name in candidates.iter().flatten() {
        *uses.entry(*name).or_default() += 1;
    }
    let ids: HashSet<&str> = records.iter().map(|r| r.account_id.as_str()).collect();

    records
        .iter()
        .zip(candidates)
        .map(|(record, candidate)| match candidate {
            Some(name)
                if uses[name] == 1 && (name == record.account_id || !ids.contains(name)) =>
            {
                name
            }
            Some(name) => {
                warn!(
                    account = %record.account_id,
                    name = %name,
                    "account name is shared with another account; reporting the account ID"
                );
                record.account_id.as_str()
            }
            None => record.account_id.as_str(),
        })
        .collect()
}

pub fn build_metric_map(
    records: &[CostRecord],
    names: &AccountNameIndex,
    window: &ReportingWindow,
    options: CollectorOptions,
) -> MetricMap {
    let metric = options.metric.as_str();
    // Invoked at the first second of the month: floor to one second.
    let elapsed = window.elapsed_seconds.max(1) as f64;
    let period = window.period_seconds as f64;

    let mut out = MetricMap::new();
    for (record, key) in records
        .iter()
        .zip(key_segments(records, names, options.resolve_names))
    {
        out.insert(format!("usage.{key}.{metric}"), record.amount);
        if options.forecast {
            out.insert(
                format!("forecast.{key}.Forecast{metric}"),
                record.amount * period / elapsed,
            );
        }
    }
    out
}

pub struct BillingCollector<A> {
    api: A,
    options: CollectorOptions,
}

impl<A: BillingApi> BillingCollector<A> {
    pub fn new(api: A, options: CollectorOptions) -> Self {
        Self { api, options }
    }

    pub async fn fetch(&self) -> Result<MetricMap, AppError> {
        self.fetch_at(Utc::now()).await
    }

    pub async fn fetch_at(&self, now: DateTime<Utc>) -> Result<MetricMap, AppError> {
        let window = ReportingWindow::containing(now);
        debug!(start = %window.start, end = %window.end, "reporting window");

        let names = if self.options.resolve_names {
            self.resolve_account_names(&window).await?
        } else {
            AccountNameIndex::new()
        };
        let records = self.fetch_cost_and_usage(&window).await?;
        let metrics = build_metric_map(&records, &names, &window, self.options);

        info!(
            accounts = records.len(),
            metrics = metrics.len(),
            metric = self.options.metric.as_str(),
            "fetched cost and usage"
        );
        Ok(metrics)
    }

    async fn resolve_account_names(
        &self,
        window: &ReportingWindow,
    ) -> Result<AccountNameIndex, AppError> {
        let values = self
            .api
            .list_dimension_values(Dimension::LinkedAccount, window)
            .await?;

        let mut names = AccountNameIndex::new();
        for value in values {
            let Some(description) = value.attributes.get("description") else {
                continue;
            };
            let name = sanitize_name(description);
            if is_metric_segment(&name) {
                names.insert(value.value, name);
            } else {
                debug!(account = %value.value, name = %name, "name is not a valid metric key segment");
            }
        }
        Ok(names)
    }

    async fn fetch_cost_and_usage(
        &self,
        window: &ReportingWindow,
    ) -> Result<Vec<CostRecord>, AppError> {
        let metric = self.options.metric;
        let query = CostAndUsageQuery {
            window: *window,
            granularity: Granularity::Monthly,
            metrics: vec![metric],
            group_by: Dimension::LinkedAccount,
        };
        let result = self.api.query_cost_and_usage(&query).await?;

        let Some(bucket) = result.results_by_time.into_iter().next() else {
            return Ok(Vec::new());
        };
        debug!(
            period = ?bucket.time_period,
            estimated = bucket.estimated,
            groups = bucket.groups.len(),
            "cost bucket"
        );

        bucket
            .groups
            .into_iter()
            .map(|group| -> Result<CostRecord, AppError> {
                let account_id = group.keys.into_iter().next().ok_or_else(|| {
                    AppError::MalformedResponse("cost group without account key".into())
                })?;
                let amount = group
                    .metrics
                    .get(metric.as_str())
                    .and_then(|m| m.amount.clone())
                    .ok_or_else(|| {
                        AppError::MalformedResponse(format!(
                            "account {account_id} has no {} amount",
                            metric.as_str()
                        ))
                    })?;
                let parsed = amount
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| AppError::MalformedAmount {
                        account: account_id.clone(),
                        amount,
                    })?;
                Ok(CostRecord {
                    account_id,
                    amount: parsed,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CostAndUsageResult, CostGroup, DimensionValue, MetricValue, ResultByTime};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        dimensions: Vec<(&'static str, Option<&'static str>)>,
        groups: Vec<(&'static str, &'static str)>,
        fail_dimensions: bool,
        fail_costs: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeApi {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl BillingApi for FakeApi {
        async fn list_dimension_values(
            &self,
            dimension: Dimension,
            _window: &ReportingWindow,
        ) -> Result<Vec<DimensionValue>, AppError> {
            assert_eq!(dimension, Dimension::LinkedAccount);
            self.calls.lock().expect("calls lock").push("dimensions");
            if self.fail_dimensions {
                return Err(AppError::upstream("GetDimensionValues", "AccessDenied"));
            }
            Ok(self
                .dimensions
                .iter()
                .map(|(id, description)| DimensionValue {
                    value: id.to_string(),
                    attributes: description
                        .map(|d| HashMap::from([("description".to_string(), d.to_string())]))
                        .unwrap_or_default(),
                })
                .collect())
        }

        async fn query_cost_and_usage(
            &self,
            query: &CostAndUsageQuery,
        ) -> Result<CostAndUsageResult, AppError> {
            assert_eq!(query.granularity, Granularity::Monthly);
            assert_eq!(query.group_by, Dimension::LinkedAccount);
            self.calls.lock().expect("calls lock").push("costs");
            if self.fail_costs {
                return Err(AppError::upstream("GetCostAndUsage", "Throttling"));
            }
            let metric = query.metrics[0].as_str().to_string();
            let groups = self
                .groups
                .iter()
                .map(|(id, amount)| CostGroup {
                    keys: vec![id.to_string()],
                    metrics: HashMap::from([(
                        metric.clone(),
                        MetricValue {
                            amount: Some(amount.to_string()),
                        },
                    )]),
                })
                .collect();
            Ok(CostAndUsageResult {
                results_by_time: vec![ResultByTime {
                    time_period: Some(query.window.interval()),
                    groups,
                    estimated: true,
                }],
            })
        }
    }

    fn march_15() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
    }

    fn options(resolve_names: bool, forecast: bool) -> CollectorOptions {
        CollectorOptions {
            metric: MetricKind::UnblendedCost,
            resolve_names,
            forecast,
        }
    }

    fn record(id: &str, amount: f64) -> CostRecord {
        CostRecord {
            account_id: id.into(),
            amount,
        }
    }

    #[test]
    fn sanitize_name_strips_punctuation_and_hyphenates_spaces() {
        assert_eq!(sanitize_name("Prod Team, LLC."), "Prod-Team-LLC");
        assert_eq!(sanitize_name("a.b,c d"), "abc-d");
        assert_eq!(sanitize_name(""), "");
    }

    #[test]
    fn sanitize_name_is_idempotent_and_total() {
        for raw in ["Prod Team, LLC.", "  spaced  out ", "...,,,", "already-clean_1", "日本 支社."] {
            let once = sanitize_name(raw);
            assert_eq!(sanitize_name(&once), once);
            assert!(!once.contains('.'));
            assert!(!once.contains(','));
            assert!(!once.contains(' '));
        }
    }

    #[test]
    fn build_metric_map_emits_one_usage_key_per_record() {
        let names = AccountNameIndex::from([("111111111111".to_string(), "Prod".to_string())]);
        let window = ReportingWindow::containing(march_15());
        let map = build_metric_map(
            &[record("111111111111", 5.0), record("333333333333", 7.5)],
            &names,
            &window,
            options(true, false),
        );

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("usage.Prod.UnblendedCost"), Some(&5.0));
        assert_eq!(map.get("usage.333333333333.UnblendedCost"), Some(&7.5));
        assert!(map.keys().all(|k| !k.starts_with("forecast.")));
    }

    #[test]
    fn build_metric_map_ignores_names_when_resolution_disabled() {
        let names = AccountNameIndex::from([("111111111111".to_string(), "Prod".to_string())]);
        let window = ReportingWindow::containing(march_15());
        let map = build_metric_map(
            &[record("111111111111", 5.0)],
            &names,
            &window,
            options(false, false),
        );
        assert_eq!(map.get("usage.111111111111.UnblendedCost"), Some(&5.0));
    }

    #[test]
    fn build_metric_map_scales_forecast_by_period_over_elapsed() {
        let window = ReportingWindow::containing(march_15());
        let map = build_metric_map(
            &[record("111111111111", 1234.56)],
            &AccountNameIndex::new(),
            &window,
            options(false, true),
        );

        let expected = 1234.56 * window.period_seconds as f64 / window.elapsed_seconds as f64;
        let forecast = map["forecast.111111111111.ForecastUnblendedCost"];
        assert!(((forecast - expected) / expected).abs() < 1e-9);
        // 31 days in March, 14 elapsed.
        assert!((forecast - 1234.56 * 31.0 / 14.0).abs() < 1e-6);
    }

    #[test]
    fn build_metric_map_floors_zero_elapsed_time() {
        let window = ReportingWindow::containing(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(window.elapsed_seconds, 0);

        let map = build_metric_map(
            &[record("1", 2.0)],
            &AccountNameIndex::new(),
            &window,
            options(false, true),
        );
        let forecast = map["forecast.1.ForecastUnblendedCost"];
        assert!(forecast.is_finite());
        assert_eq!(forecast, 2.0 * window.period_seconds as f64);
    }

    #[test]
    fn build_metric_map_is_pure() {
        let names = AccountNameIndex::from([("1".to_string(), "One".to_string())]);
        let window = ReportingWindow::containing(march_15());
        let records = [record("1", 1.0), record("2", 2.0)];
        let first = build_metric_map(&records, &names, &window, options(true, true));
        let second = build_metric_map(&records, &names, &window, options(true, true));
        assert_eq!(first, second);
    }

    #[test]
    fn build_metric_map_keeps_accounts_whose_names_collide() {
        let names = AccountNameIndex::from([
            ("111111111111".to_string(), sanitize_name("Dev Team")),
            ("222222222222".to_string(), sanitize_name("Dev, Team.")),
            ("333333333333".to_string(), "Prod".to_string()),
        ]);
        let window = ReportingWindow::containing(march_15());
        let map = build_metric_map(
            &[
                record("111111111111", 100.0),
                record("222222222222", 5.0),
                record("333333333333", 1.0),
            ],
            &names,
            &window,
            options(true, true),
        );

        assert_eq!(map.len(), 6);
        assert_eq!(map.get("usage.111111111111.UnblendedCost"), Some(&100.0));
        assert_eq!(map.get("usage.222222222222.UnblendedCost"), Some(&5.0));
        assert_eq!(map.get("usage.Prod.UnblendedCost"), Some(&1.0));
        assert!(map.contains_key("forecast.111111111111.ForecastUnblendedCost"));
        assert!(map.contains_key("forecast.222222222222.ForecastUnblendedCost"));
        assert!(!map.keys().any(|k| k.contains("Dev-Team")));
    }

    #[test]
    fn build_metric_map_never_reuses_another_accounts_id() {
        let names = AccountNameIndex::from([("111111111111".to_string(), "222222222222".to_string())]);
        let window = ReportingWindow::containing(march_15());
        let map = build_metric_map(
            &[record("111111111111", 1.0), record("222222222222", 2.0)],
            &names,
            &window,
            options(true, false),
        );

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("usage.111111111111.UnblendedCost"), Some(&1.0));
        assert_eq!(map.get("usage.222222222222.UnblendedCost"), Some(&2.0));
    }

    #[test]
    fn build_metric_map_rejects_names_outside_key_charset() {
        let names = AccountNameIndex::from([("111111111111".to_string(), "R&D-(Tokyo)".to_string())]);
        let window = ReportingWindow::containing(march_15());
        let map = build_metric_map(
            &[record("111111111111", 100.0)],
            &names,
            &window,
            options(true, false),
        );
        assert_eq!(map.get("usage.111111111111.UnblendedCost"), Some(&100.0));
    }

    #[tokio::test]
    async fn fetch_reports_every_account_when_names_clash_or_are_unusable() {
        let api = FakeApi {
            dimensions: vec![
                ("111111111111", Some("Dev Team")),
                ("222222222222", Some("Dev, Team.")),
                ("333333333333", Some("R&D (Tokyo)")),
                ("444444444444", Some("日本 支社.")),
                ("555555555555", Some("Prod Team, LLC.")),
            ],
            groups: vec![
                ("111111111111", "100.0"),
                ("222222222222", "5.0"),
                ("333333333333", "7.0"),
                ("444444444444", "8.0"),
                ("555555555555", "9.0"),
            ],
            ..FakeApi::default()
        };
        let collector = BillingCollector::new(api, options(true, false));

        let map = collector.fetch_at(march_15()).await.expect("metrics");
        assert_eq!(map.len(), 5);
        for (id, amount) in [
            ("111111111111", 100.0),
            ("222222222222", 5.0),
            ("333333333333", 7.0),
            ("444444444444", 8.0),
        ] {
            assert_eq!(map.get(&format!("usage.{id}.UnblendedCost")), Some(&amount));
        }
        assert_eq!(map.get("usage.Prod-Team-LLC.UnblendedCost"), Some(&9.0));
    }

    #[tokio::test]
    async fn fetch_resolves_names_before_querying_costs() {
        let api = FakeApi {
            dimensions: vec![("111111111111", Some("Prod Team, LLC."))],
            groups: vec![("111111111111", "1234.56")],
            ..FakeApi::default()
        };
        let collector = BillingCollector::new(api, options(true, false));

        let map = collector.fetch_at(march_15()).await.expect("metrics");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("usage.Prod-Team-LLC.UnblendedCost"), Some(&1234.56));
        assert_eq!(collector.api.calls(), vec!["dimensions", "costs"]);
    }

    #[tokio::test]
    async fn fetch_without_name_resolution_skips_lookup() {
        let api = FakeApi {
            groups: vec![("222222222222", "10.0")],
            ..FakeApi::default()
        };
        let collector = BillingCollector::new(api, options(false, false));

        let map = collector.fetch_at(march_15()).await.expect("metrics");
        assert_eq!(map.get("usage.222222222222.UnblendedCost"), Some(&10.0));
        assert_eq!(collector.api.calls(), vec!["costs"]);
    }

    #[tokio::test]
    async fn fetch_falls_back_to_raw_id_for_unnamed_accounts() {
        let api = FakeApi {
            dimensions: vec![("111111111111", Some("...")), ("444444444444", None)],
            groups: vec![
                ("111111111111", "1"),
                ("444444444444", "2"),
                ("555555555555", "3"),
            ],
            ..FakeApi::default()
        };
        let collector = BillingCollector::new(api, options(true, true));

        let map = collector.fetch_at(march_15()).await.expect("metrics");
        for id in ["111111111111", "444444444444", "555555555555"] {
            assert!(map.contains_key(&format!("usage.{id}.UnblendedCost")));
            assert!(map.contains_key(&format!("forecast.{id}.ForecastUnblendedCost")));
        }
        assert_eq!(map.len(), 6);
    }

    #[tokio::test]
    async fn malformed_amount_aborts_fetch() {
        let api = FakeApi {
            groups: vec![("111111111111", "1.0"), ("222222222222", "N/A")],
            ..FakeApi::default()
        };
        let collector = BillingCollector::new(api, options(false, false));

        let err = collector.fetch_at(march_15()).await.expect_err("bad amount");
        match err {
            AppError::MalformedAmount { account, amount } => {
                assert_eq!(account, "222222222222");
                assert_eq!(amount, "N/A");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dimension_failure_aborts_before_cost_query() {
        let api = FakeApi {
            groups: vec![("111111111111", "1.0")],
            fail_dimensions: true,
            ..FakeApi::default()
        };
        let collector = BillingCollector::new(api, options(true, false));

        let err = collector.fetch_at(march_15()).await.expect_err("upstream");
        assert!(matches!(
            err,
            AppError::UpstreamQuery {
                operation: "GetDimensionValues",
                ..
            }
        ));
        assert_eq!(collector.api.calls(), vec!["dimensions"]);
    }

    #[tokio::test]
    async fn cost_query_failure_is_surfaced() {
        let api = FakeApi {
            fail_costs: true,
            ..FakeApi::default()
        };
        let collector = BillingCollector::new(api, options(false, true));

        let err = collector.fetch_at(march_15()).await.expect_err("upstream");
        assert!(err.to_string().contains("GetCostAndUsage failed"));
    }

    #[tokio::test]
    async fn empty_result_yields_empty_map() {
        let collector = BillingCollector::new(FakeApi::default(), options(true, true));
        let map = collector.fetch_at(march_15()).await.expect("metrics");
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn group_missing_requested_metric_is_malformed() {
        struct MissingMetric;

        #[async_trait]
        impl BillingApi for MissingMetric {
            async fn list_dimension_values(
                &self,
                _dimension: Dimension,
                _window: &ReportingWindow,
            ) -> Result<Vec<DimensionValue>, AppError> {
                Ok(Vec::new())
            }

            async fn query_cost_and_usage(
                &self,
                _query: &CostAndUsageQuery,
            ) -> Result<CostAndUsageResult, AppError> {
                Ok(CostAndUsageResult {
                    results_by_time: vec![ResultByTime {
                        time_period: None,
                        groups: vec![CostGroup {
                            keys: vec!["1".into()],
                            metrics: HashMap::new(),
                        }],
                        estimated: false,
                    }],
                })
            }
        }

        let collector = BillingCollector::new(MissingMetric, options(false, false));
        let err = collector.fetch_at(march_15()).await.expect_err("missing metric");
        assert!(matches!(err, AppError::MalformedResponse(_)));
    }
}
