//! 执行分析
//!
//! 按记录时间戳保存执行记录，并在请求的时间窗口内聚合出仪表盘数据。
//! 超过保留期的记录在写入时清理。比率均为百分比（0-100）。

use crate::error::{Result, RuleError, ScriptErrorKind};
use crate::record::{EvaluationStatus, ExecutionRecord};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// 时间窗口上限（天）
const MAX_RANGE_DAYS: i64 = 366;

/// 仪表盘时间窗口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    label: String,
    span: TimeDelta,
}

impl TimeRange {
    /// 解析时间窗口：`1h`、`24h`/`1d`、`7d`、`30d` 或通用的 `<n>m|h|d`，空串视为 `24h`
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        match input {
            "" | "24h" | "1d" => return Ok(Self::hours(24)),
            "1h" => return Ok(Self::hours(1)),
            _ => {}
        }

        let invalid = || RuleError::validation("time_range", format!("无效的时间窗口: {}", input));
        if !input.is_ascii() {
            return Err(invalid());
        }

        let (digits, unit) = input.split_at(input.len().saturating_sub(1));
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        if n <= 0 {
            return Err(invalid());
        }

        let span = match unit {
            "m" => TimeDelta::try_minutes(n),
            "h" => TimeDelta::try_hours(n),
            "d" => TimeDelta::try_days(n),
            _ => None,
        }
        .filter(|span| *span <= TimeDelta::days(MAX_RANGE_DAYS))
        .ok_or_else(invalid)?;

        Ok(Self {
            label: input.to_string(),
            span,
        })
    }

    fn hours(n: i64) -> Self {
        Self {
            label: format!("{}h", n),
            span: TimeDelta::hours(n),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn span(&self) -> TimeDelta {
        self.span
    }

    /// 趋势分桶宽度
    fn bucket_width(&self) -> TimeDelta {
        if self.span <= TimeDelta::hours(1) {
            TimeDelta::minutes(5)
        } else if self.span <= TimeDelta::hours(24) {
            TimeDelta::hours(1)
        } else if self.span <= TimeDelta::days(7) {
            TimeDelta::hours(6)
        } else {
            TimeDelta::days(1)
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::hours(24)
    }
}

impl FromStr for TimeRange {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// 整体统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallStats {
    pub total_executions: u64,
    pub matched_executions: u64,
    pub match_rate: f64,
    /// 含至少一个脚本失败的记录数
    pub error_count: u64,
    pub error_rate: f64,
    pub timeouts: u64,
    pub resource_exceeded: u64,
    pub partial_evaluations: u64,
    pub average_latency_ms: f64,
    pub triggers_fired: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStats {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub total_executions: u64,
    pub matched_executions: u64,
    pub match_rate: f64,
    pub errors: u64,
    pub average_latency_ms: f64,
    pub last_executed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionStats {
    pub action_id: Uuid,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

/// 趋势数据点，`timestamp` 为分桶起点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub executions: u64,
    pub matched: u64,
    pub errors: u64,
}

/// 仪表盘数据
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub time_range: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub overall_stats: OverallStats,
    pub per_rule: Vec<RuleStats>,
    pub per_action: Vec<ActionStats>,
    pub execution_trend: Vec<TrendPoint>,
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn average(sum: f64, count: u64) -> f64 {
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// 执行记录聚合器
#[derive(Clone)]
pub struct AnalyticsAggregator {
    /// (记录时间戳, 记录 ID) -> 记录
    records: Arc<RwLock<BTreeMap<(DateTime<Utc>, Uuid), Arc<ExecutionRecord>>>>,
    retention: TimeDelta,
}

impl AnalyticsAggregator {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn record(&self, record: ExecutionRecord) {
        self.record_all(std::iter::once(record));
    }

    /// 写入记录并清理超过保留期的旧记录
    pub fn record_all(&self, records: impl IntoIterator<Item = ExecutionRecord>) {
        let mut map = self.records.write();
        for record in records {
            map.insert((record.timestamp, record.id), Arc::new(record));
        }

        if let Some(cutoff) = Utc::now().checked_sub_signed(self.retention) {
            let kept = map.split_off(&(cutoff, Uuid::nil()));
            let pruned = map.len();
            *map = kept;
            if pruned > 0 {
                debug!(pruned, "已清理过期执行记录");
            }
        }
    }

    pub fn dashboard(&self, range: &TimeRange) -> Dashboard {
        self.dashboard_at(range, Utc::now())
    }

    /// 以指定时间为窗口终点聚合
    pub fn dashboard_at(&self, range: &TimeRange, now: DateTime<Utc>) -> Dashboard {
        let start = now
            .checked_sub_signed(range.span())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let width = range.bucket_width();

        let bucket_count =
            (range.span().num_seconds() + width.num_seconds() - 1) / width.num_seconds();
        let mut trend: Vec<TrendPoint> = (0..bucket_count.max(1))
            .map(|i| TrendPoint {
                timestamp: start + width * i as i32,
                executions: 0,
                matched: 0,
                errors: 0,
            })
            .collect();

        let mut overall = OverallStats::default();
        let mut latency_sum = 0.0;
        let mut per_rule: HashMap<Uuid, (RuleStats, f64)> = HashMap::new();
        let mut per_action: HashMap<Uuid, (ActionStats, f64)> = HashMap::new();

        let map = self.records.read();
        let in_window = map
            .range((start, Uuid::nil())..)
            .map(|(_, r)| r)
            .take_while(|r| r.timestamp <= now);

        for record in in_window {
            let has_error = record.has_error();

            overall.total_executions += 1;
            latency_sum += record.duration_ms;
            if record.matched {
                overall.matched_executions += 1;
            }
            if has_error {
                overall.error_count += 1;
            }
            for failure in record.failures() {
                match failure.kind {
                    ScriptErrorKind::Timeout => overall.timeouts += 1,
                    ScriptErrorKind::ResourceExceeded => overall.resource_exceeded += 1,
                    _ => {}
                }
            }
            if record.status == EvaluationStatus::PartiallyEvaluated {
                overall.partial_evaluations += 1;
            }
            overall.triggers_fired += record.fired_triggers().count() as u64;

            let (rule, rule_latency) = per_rule.entry(record.rule_id).or_insert_with(|| {
                (
                    RuleStats {
                        rule_id: record.rule_id,
                        rule_name: record.rule_name.clone(),
                        total_executions: 0,
                        matched_executions: 0,
                        match_rate: 0.0,
                        errors: 0,
                        average_latency_ms: 0.0,
                        last_executed: None,
                    },
                    0.0,
                )
            });
            rule.total_executions += 1;
            *rule_latency += record.duration_ms;
            if record.matched {
                rule.matched_executions += 1;
            }
            if has_error {
                rule.errors += 1;
            }
            // 记录按时间升序遍历，最后一次覆盖即最新
            rule.rule_name = record.rule_name.clone();
            rule.last_executed = Some(record.timestamp);

            for outcome in record.actions.iter().filter(|a| a.executed) {
                overall.actions_executed += 1;
                if !outcome.succeeded {
                    overall.actions_failed += 1;
                }

                let (action, action_latency) =
                    per_action.entry(outcome.action_id).or_insert_with(|| {
                        (
                            ActionStats {
                                action_id: outcome.action_id,
                                executions: 0,
                                successes: 0,
                                failures: 0,
                                success_rate: 0.0,
                                average_latency_ms: 0.0,
                            },
                            0.0,
                        )
                    });
                action.executions += 1;
                *action_latency += outcome.duration_ms;
                if outcome.succeeded {
                    action.successes += 1;
                } else {
                    action.failures += 1;
                }
            }

            // 落在窗口终点上的记录归入最后一个桶
            let offset = (record.timestamp - start).num_seconds() / width.num_seconds();
            let last = trend.len() - 1;
            if let Some(point) = usize::try_from(offset)
                .ok()
                .and_then(|i| trend.get_mut(i.min(last)))
            {
                point.executions += 1;
                if record.matched {
                    point.matched += 1;
                }
                if has_error {
                    point.errors += 1;
                }
            }
        }
        drop(map);

        overall.match_rate = percent(overall.matched_executions, overall.total_executions);
        overall.error_rate = percent(overall.error_count, overall.total_executions);
        overall.average_latency_ms = average(latency_sum, overall.total_executions);

        let mut rules: Vec<RuleStats> = per_rule
            .into_values()
            .map(|(mut stats, latency)| {
                stats.match_rate = percent(stats.matched_executions, stats.total_executions);
                stats.average_latency_ms = average(latency, stats.total_executions);
                stats
            })
            .collect();
        rules.sort_by(|a, b| {
            b.total_executions
                .cmp(&a.total_executions)
                .then(a.rule_id.cmp(&b.rule_id))
        });

        let mut actions: Vec<ActionStats> = per_action
            .into_values()
            .map(|(mut stats, latency)| {
                stats.success_rate = percent(stats.successes, stats.executions);
                stats.average_latency_ms = average(latency, stats.executions);
                stats
            })
            .collect();
        actions.sort_by(|a, b| {
            b.executions
                .cmp(&a.executions)
                .then(a.action_id.cmp(&b.action_id))
        });

        Dashboard {
            time_range: range.label().to_string(),
            window_start: start,
            window_end: now,
            overall_stats: overall,
            per_rule: rules,
            per_action: actions,
            execution_trend: trend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;
    use crate::record::{ActionOutcome, EvaluationStatus, ScriptFailure};

    fn record_at(rule_id: Uuid, matched: bool, timestamp: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            rule_id,
            rule_name: "rule".into(),
            matched,
            error: None,
            triggers: Vec::new(),
            actions: Vec::new(),
            duration_ms: 2.0,
            timestamp,
            status: EvaluationStatus::Completed,
        }
    }

    #[test]
    fn test_parse_time_range() {
        assert_eq!(TimeRange::parse("").unwrap().label(), "24h");
        assert_eq!(TimeRange::parse("1d").unwrap().label(), "24h");
        assert_eq!(TimeRange::parse("1h").unwrap().span(), TimeDelta::hours(1));
        assert_eq!(TimeRange::parse("7d").unwrap().span(), TimeDelta::days(7));
        assert_eq!(TimeRange::parse("30d").unwrap().span(), TimeDelta::days(30));
        assert_eq!(TimeRange::parse("15m").unwrap().span(), TimeDelta::minutes(15));

        for bad in ["abc", "0h", "-1d", "10x", "h", "400d", "1天"] {
            let err = bad.parse::<TimeRange>().unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR", "{bad}");
        }
    }

    #[test]
    fn test_bucket_width() {
        assert_eq!(TimeRange::parse("1h").unwrap().bucket_width(), TimeDelta::minutes(5));
        assert_eq!(TimeRange::parse("24h").unwrap().bucket_width(), TimeDelta::hours(1));
        assert_eq!(TimeRange::parse("7d").unwrap().bucket_width(), TimeDelta::hours(6));
        assert_eq!(TimeRange::parse("30d").unwrap().bucket_width(), TimeDelta::days(1));
    }

    #[test]
    fn test_dashboard_counts_records_in_window() {
        let analytics = AnalyticsAggregator::new(Duration::from_secs(7 * 24 * 3600));
        let now = Utc::now();
        let rule = Uuid::new_v4();

        // 乱序写入
        analytics.record(record_at(rule, true, now - TimeDelta::minutes(10)));
        analytics.record(record_at(rule, false, now - TimeDelta::minutes(50)));
        analytics.record(record_at(rule, true, now - TimeDelta::hours(3)));

        let dashboard = analytics.dashboard_at(&TimeRange::parse("1h").unwrap(), now);
        assert_eq!(dashboard.overall_stats.total_executions, 2);
        assert_eq!(dashboard.overall_stats.matched_executions, 1);
        assert_eq!(dashboard.overall_stats.match_rate, 50.0);
        assert_eq!(dashboard.execution_trend.len(), 12);
        assert_eq!(
            dashboard.execution_trend.iter().map(|p| p.executions).sum::<u64>(),
            2
        );

        let dashboard = analytics.dashboard_at(&TimeRange::default(), now);
        assert_eq!(dashboard.overall_stats.total_executions, 3);
        assert_eq!(dashboard.per_rule.len(), 1);
        assert_eq!(dashboard.per_rule[0].total_executions, 3);
        assert_eq!(
            dashboard.per_rule[0].last_executed,
            Some(now - TimeDelta::minutes(10))
        );
    }

    #[test]
    fn test_record_at_window_end_is_in_trend() {
        let analytics = AnalyticsAggregator::new(Duration::from_secs(7200));
        let now = Utc::now();
        analytics.record(record_at(Uuid::new_v4(), true, now));
        analytics.record(record_at(Uuid::new_v4(), false, now - TimeDelta::hours(1)));

        let dashboard = analytics.dashboard_at(&TimeRange::parse("1h").unwrap(), now);
        assert_eq!(dashboard.overall_stats.total_executions, 2);
        assert_eq!(dashboard.execution_trend[0].executions, 1);
        let last = dashboard.execution_trend.last().unwrap();
        assert_eq!(last.executions, 1);
        assert_eq!(last.matched, 1);
    }

    #[test]
    fn test_errors_and_actions_are_aggregated() {
        let analytics = AnalyticsAggregator::new(Duration::from_secs(3600));
        let now = Utc::now();
        let action_id = Uuid::new_v4();

        let mut failed = record_at(Uuid::new_v4(), false, now);
        failed.error = Some(ScriptFailure::from(&ScriptError::Timeout { limit_ms: 100 }));
        failed.status = EvaluationStatus::PartiallyEvaluated;

        let mut fired = record_at(Uuid::new_v4(), true, now);
        fired.actions = vec![
            ActionOutcome {
                action_id,
                trigger_id: Uuid::new_v4(),
                executed: true,
                succeeded: true,
                error: None,
                duration_ms: 1.0,
                logs: Vec::new(),
            },
            ActionOutcome {
                action_id,
                trigger_id: Uuid::new_v4(),
                executed: true,
                succeeded: false,
                error: Some(ScriptFailure::from(&ScriptError::Runtime("boom".into()))),
                duration_ms: 3.0,
                logs: Vec::new(),
            },
            ActionOutcome::skipped(Uuid::new_v4(), Uuid::new_v4()),
        ];

        analytics.record_all(vec![failed, fired]);

        let dashboard = analytics.dashboard_at(&TimeRange::default(), now);
        let overall = &dashboard.overall_stats;
        assert_eq!(overall.total_executions, 2);
        assert_eq!(overall.error_count, 2);
        assert_eq!(overall.error_rate, 100.0);
        assert_eq!(overall.timeouts, 1);
        assert_eq!(overall.partial_evaluations, 1);
        assert_eq!(overall.actions_executed, 2);
        assert_eq!(overall.actions_failed, 1);

        assert_eq!(dashboard.per_action.len(), 1);
        let action = &dashboard.per_action[0];
        assert_eq!(action.executions, 2);
        assert_eq!(action.success_rate, 50.0);
        assert_eq!(action.average_latency_ms, 2.0);
    }

    #[test]
    fn test_old_records_are_pruned() {
        let analytics = AnalyticsAggregator::new(Duration::from_secs(3600));
        let rule = Uuid::new_v4();

        analytics.record(record_at(rule, true, Utc::now() - TimeDelta::hours(2)));
        analytics.record(record_at(rule, true, Utc::now()));

        assert_eq!(analytics.len(), 1);
    }

    #[test]
    fn test_empty_dashboard() {
        let analytics = AnalyticsAggregator::new(Duration::from_secs(3600));
        let dashboard = analytics.dashboard(&TimeRange::parse("7d").unwrap());
        assert_eq!(dashboard.time_range, "7d");
        assert_eq!(dashboard.overall_stats, OverallStats::default());
        assert_eq!(dashboard.execution_trend.len(), 28);
    }
}
