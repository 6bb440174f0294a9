//! 趋势与成本聚合查询

use rusqlite::Connection;

use super::error::{Result, StatsError};
use super::types::{CostGroup, CostSummary, CostSummaryQuery, TrendBucket, TrendQuery};

/// 单次趋势查询允许的最大桶数
const MAX_BUCKETS: i64 = 10_000;

/// 时间分桶趋势
///
/// 桶从 `start_time` 开始按粒度对齐，空桶也会返回（求和为 0，平均响应时间为 null）。
/// 最后一个桶截断到 `end_time`，时间戳等于 `end_time` 的记录归入最后一个桶。
pub fn query_trends(conn: &mut Connection, query: &TrendQuery) -> Result<Vec<TrendBucket>> {
    if query.end_time < query.start_time {
        return Ok(Vec::new());
    }

    let size = query.granularity.duration_ms();
    let span = query
        .end_time
        .checked_sub(query.start_time)
        .ok_or_else(|| StatsError::InvalidQuery("时间范围超出可表示范围".to_string()))?;
    let bucket_count = (span / size + i64::from(span % size != 0)).max(1);
    if bucket_count > MAX_BUCKETS {
        return Err(StatsError::InvalidQuery(format!(
            "时间范围过大：需要 {} 个桶，最多 {}",
            bucket_count, MAX_BUCKETS
        )));
    }

    let mut buckets: Vec<TrendBucket> = (0..bucket_count)
        .map(|i| {
            // i * size <= span，桶起点不会越过 end_time
            let start = query.start_time + i * size;
            let end = start.saturating_add(size).min(query.end_time);
            TrendBucket::empty(start, end, query.tool_type)
        })
        .collect();

    let tool_type = query.tool_type.map(|t| t.as_str());
    let mut stmt = conn.prepare_cached(
        "SELECT MIN((timestamp - ?1) / ?2, ?3) AS bucket,
                SUM(input_tokens), SUM(output_tokens), SUM(cache_creation_tokens), SUM(cache_read_tokens),
                COUNT(*),
                SUM(CASE WHEN request_status = 'success' THEN 1 ELSE 0 END),
                SUM(CASE WHEN request_status = 'failed' THEN 1 ELSE 0 END),
                COALESCE(SUM(input_price), 0.0), COALESCE(SUM(output_price), 0.0),
                COALESCE(SUM(cache_write_price), 0.0), COALESCE(SUM(cache_read_price), 0.0),
                COALESCE(SUM(total_cost), 0.0),
                AVG(response_time_ms)
         FROM token_logs
         WHERE timestamp >= ?1 AND timestamp <= ?4 AND (?5 IS NULL OR tool_type = ?5)
         GROUP BY bucket",
    )?;

    let rows = stmt.query_map(
        rusqlite::params![
            query.start_time,
            size,
            bucket_count - 1,
            query.end_time,
            tool_type
        ],
        |row| {
            let index: i64 = row.get(0)?;
            Ok((
                index,
                (
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ),
                (
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ),
                (
                    row.get::<_, f64>(8)?,
                    row.get::<_, f64>(9)?,
                    row.get::<_, f64>(10)?,
                    row.get::<_, f64>(11)?,
                    row.get::<_, f64>(12)?,
                ),
                row.get::<_, Option<f64>>(13)?,
            ))
        },
    )?;

    for row in rows {
        let (index, tokens, counts, costs, avg) = row?;
        let Some(bucket) = buckets.get_mut(index as usize) else {
            continue;
        };
        (
            bucket.input_tokens,
            bucket.output_tokens,
            bucket.cache_creation_tokens,
            bucket.cache_read_tokens,
        ) = tokens;
        bucket.request_count = counts.0 as u64;
        bucket.success_count = counts.1 as u64;
        bucket.failed_count = counts.2 as u64;
        (
            bucket.input_cost,
            bucket.output_cost,
            bucket.cache_write_cost,
            bucket.cache_read_cost,
            bucket.total_cost,
        ) = costs;
        bucket.avg_response_time_ms = avg;
    }

    Ok(buckets)
}

/// 时间范围内的成本摘要，按 `group_by` 指定的列拆分
pub fn query_cost_summary(conn: &mut Connection, query: &CostSummaryQuery) -> Result<CostSummary> {
    let tool_type = query.tool_type.map(|t| t.as_str());
    let params = rusqlite::params![query.start_time, query.end_time, tool_type];

    // 总计与拆分共享同一快照
    let tx = conn.transaction()?;

    let mut summary = tx.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN request_status = 'success' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN request_status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                COALESCE(SUM(input_price), 0.0), COALESCE(SUM(output_price), 0.0),
                COALESCE(SUM(cache_write_price), 0.0), COALESCE(SUM(cache_read_price), 0.0),
                COALESCE(SUM(total_cost), 0.0),
                AVG(response_time_ms)
         FROM token_logs
         WHERE timestamp >= ?1 AND timestamp <= ?2 AND (?3 IS NULL OR tool_type = ?3)",
        params,
        |row| {
            Ok(CostSummary {
                start_time: query.start_time,
                end_time: query.end_time,
                tool_type: query.tool_type,
                total_requests: row.get::<_, i64>(0)? as u64,
                successful_requests: row.get::<_, i64>(1)? as u64,
                failed_requests: row.get::<_, i64>(2)? as u64,
                input_tokens: row.get(3)?,
                output_tokens: row.get(4)?,
                cache_creation_tokens: row.get(5)?,
                cache_read_tokens: row.get(6)?,
                input_cost: row.get(7)?,
                output_cost: row.get(8)?,
                cache_write_cost: row.get(9)?,
                cache_read_cost: row.get(10)?,
                total_cost: row.get(11)?,
                avg_response_time_ms: row.get(12)?,
                group_by: query.group_by,
                groups: Vec::new(),
            })
        },
    )?;

    summary.groups = {
        let column = query.group_by.column();
        let mut stmt = tx.prepare(&format!(
            "SELECT {column}, COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                    COALESCE(SUM(total_cost), 0.0)
             FROM token_logs
             WHERE timestamp >= ?1 AND timestamp <= ?2 AND (?3 IS NULL OR tool_type = ?3)
             GROUP BY {column}
             ORDER BY SUM(total_cost) DESC, COUNT(*) DESC, {column} ASC"
        ))?;
        stmt.query_map(params, |row| {
            Ok(CostGroup {
                key: row.get(0)?,
                request_count: row.get::<_, i64>(1)? as u64,
                input_tokens: row.get(2)?,
                output_tokens: row.get(3)?,
                cache_creation_tokens: row.get(4)?,
                cache_read_tokens: row.get(5)?,
                total_cost: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
    };
    tx.commit()?;

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use crate::token_stats::error::StatsError;
    use crate::token_stats::model::{ErrorType, LogRecord, ResponseType, ToolType};
    use crate::token_stats::store::tests::{open_temp, sample};
    use crate::token_stats::types::{CostGroupBy, CostSummaryQuery, TimeGranularity, TrendQuery};

    const MINUTE: i64 = 60_000;
    const BASE: i64 = 1_768_046_400_000; // 2026-01-10 12:00:00 UTC

    fn trend(start: i64, end: i64, granularity: TimeGranularity) -> TrendQuery {
        TrendQuery {
            start_time: start,
            end_time: end,
            tool_type: None,
            granularity,
        }
    }

    #[test]
    fn test_one_hour_at_fifteen_minutes_has_four_buckets() {
        let (_dir, store) = open_temp();
        store
            .insert_batch(&[
                sample("s", BASE + 2 * MINUTE).with_response_time(100),
                sample("s", BASE + 5 * MINUTE).with_response_time(300),
                sample("s", BASE + 50 * MINUTE).with_response_time(40),
            ])
            .unwrap();

        let buckets = store
            .query_trends(&trend(BASE, BASE + 60 * MINUTE, TimeGranularity::FifteenMinutes))
            .unwrap();
        assert_eq!(buckets.len(), 4);
        assert!(
            buckets
                .windows(2)
                .all(|w| w[1].bucket_start - w[0].bucket_start == 15 * MINUTE)
        );

        assert_eq!(buckets[0].request_count, 2);
        assert_eq!(buckets[0].input_tokens, 200);
        assert_eq!(buckets[0].avg_response_time_ms, Some(200.0));

        // 空桶：求和为 0，平均响应时间为 null
        for empty in &buckets[1..3] {
            assert_eq!(empty.request_count, 0);
            assert_eq!(empty.input_tokens, 0);
            assert_eq!(empty.total_cost, 0.0);
            assert_eq!(empty.avg_response_time_ms, None);
        }

        assert_eq!(buckets[3].request_count, 1);
        assert_eq!(buckets[3].avg_response_time_ms, Some(40.0));
    }

    #[test]
    fn test_null_average_when_no_response_time() {
        let (_dir, store) = open_temp();
        let failed = LogRecord::failed(
            ToolType::ClaudeCode,
            BASE + MINUTE,
            "s",
            "default",
            "claude-sonnet-4-5",
            ResponseType::Unknown,
            ErrorType::UpstreamError,
            "HTTP 502: Bad Gateway",
        );
        let zero = sample("s", BASE + 20 * MINUTE).with_response_time(0);
        store.insert_batch(&[failed, zero]).unwrap();

        let buckets = store
            .query_trends(&trend(BASE, BASE + 30 * MINUTE, TimeGranularity::FifteenMinutes))
            .unwrap();
        assert_eq!(buckets[0].failed_count, 1);
        assert_eq!(buckets[0].avg_response_time_ms, None);
        assert_eq!(buckets[1].success_count, 1);
        assert_eq!(buckets[1].avg_response_time_ms, Some(0.0));
    }

    #[test]
    fn test_final_bucket_truncated_and_end_inclusive() {
        let (_dir, store) = open_temp();
        let end = BASE + 70 * MINUTE;
        store.insert_batch(&[sample("s", end)]).unwrap();

        let buckets = store
            .query_trends(&trend(BASE, end, TimeGranularity::ThirtyMinutes))
            .unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[2].bucket_start, BASE + 60 * MINUTE);
        assert_eq!(buckets[2].bucket_end, end);
        assert_eq!(buckets[2].request_count, 1);
    }

    #[test]
    fn test_end_at_exact_boundary_lands_in_last_bucket() {
        let (_dir, store) = open_temp();
        let end = BASE + 60 * MINUTE;
        store.insert_batch(&[sample("s", end)]).unwrap();

        let buckets = store
            .query_trends(&trend(BASE, end, TimeGranularity::Hour))
            .unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].request_count, 1);
    }

    #[test]
    fn test_inverted_range_returns_empty() {
        let (_dir, store) = open_temp();
        let buckets = store
            .query_trends(&trend(BASE, BASE - 1, TimeGranularity::Day))
            .unwrap();
        assert!(buckets.is_empty());
    }

    #[test]
    fn test_range_near_i64_max_yields_single_bucket() {
        let (_dir, store) = open_temp();
        let buckets = store
            .query_trends(&trend(i64::MAX - 10, i64::MAX, TimeGranularity::Hour))
            .unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].bucket_start, i64::MAX - 10);
        assert_eq!(buckets[0].bucket_end, i64::MAX);
        assert_eq!(buckets[0].request_count, 0);
    }

    #[test]
    fn test_unrepresentable_span_is_invalid_query() {
        let (_dir, store) = open_temp();
        let result = store.query_trends(&trend(i64::MIN, i64::MAX, TimeGranularity::Day));
        assert!(matches!(result, Err(StatsError::InvalidQuery(_))));

        let result = store.query_trends(&trend(-1, i64::MAX, TimeGranularity::Day));
        assert!(matches!(result, Err(StatsError::InvalidQuery(_))));
    }

    #[test]
    fn test_trend_tool_filter() {
        let (_dir, store) = open_temp();
        let mut codex = sample("s", BASE + MINUTE);
        codex.tool_type = ToolType::Codex;
        store
            .insert_batch(&[codex, sample("s", BASE + 2 * MINUTE)])
            .unwrap();

        let mut query = trend(BASE, BASE + 60 * MINUTE, TimeGranularity::Hour);
        query.tool_type = Some(ToolType::Codex);
        let buckets = store.query_trends(&query).unwrap();
        assert_eq!(buckets[0].request_count, 1);
        assert_eq!(buckets[0].tool_type, Some(ToolType::Codex));
    }

    #[test]
    fn test_cost_summary_by_model() {
        let (_dir, store) = open_temp();
        let mut cheap = sample("s", BASE).with_response_time(100);
        cheap.model = "claude-haiku-4-5".to_string();
        cheap.total_cost = 0.001;
        cheap.input_price = Some(0.0004);
        let mut pricey = sample("s", BASE + 1).with_response_time(300);
        pricey.total_cost = 0.02;
        pricey.input_price = Some(0.01);
        let mut pricey2 = sample("s", BASE + 2);
        pricey2.total_cost = 0.03;
        let outside = sample("s", BASE + 10 * MINUTE);
        store
            .insert_batch(&[cheap, pricey, pricey2, outside])
            .unwrap();

        let summary = store
            .query_cost_summary(&CostSummaryQuery {
                start_time: BASE,
                end_time: BASE + MINUTE,
                tool_type: Some(ToolType::ClaudeCode),
                group_by: CostGroupBy::Model,
            })
            .unwrap();

        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.successful_requests, 3);
        assert_eq!(summary.input_tokens, 300);
        assert!((summary.total_cost - 0.051).abs() < 1e-12);
        assert!((summary.input_cost - 0.0104).abs() < 1e-12);
        assert_eq!(summary.avg_response_time_ms, Some(200.0));
        assert_eq!(summary.group_by, CostGroupBy::Model);
        assert_eq!(summary.groups.len(), 2);
        assert_eq!(summary.groups[0].key, "claude-sonnet-4-5");
        assert_eq!(summary.groups[0].request_count, 2);
        assert_eq!(summary.groups[1].key, "claude-haiku-4-5");
    }

    #[test]
    fn test_cost_summary_grouped_by_session() {
        let (_dir, store) = open_temp();
        let mut batch = Vec::new();
        for (n, session) in ["s1", "s2", "s3"].iter().enumerate() {
            for i in 0..5 {
                let mut record = sample(session, BASE + (n as i64) * MINUTE + i);
                record.total_cost = 0.0033;
                batch.push(record);
            }
        }
        let mut codex = sample("s1", BASE + 1);
        codex.tool_type = ToolType::Codex;
        batch.push(codex);
        store.insert_batch(&batch).unwrap();

        let summary = store
            .query_cost_summary(&CostSummaryQuery {
                start_time: BASE,
                end_time: BASE + 10 * MINUTE,
                tool_type: Some(ToolType::ClaudeCode),
                group_by: CostGroupBy::Session,
            })
            .unwrap();

        assert_eq!(summary.total_requests, 15);
        assert_eq!(summary.groups.len(), 3);
        for group in &summary.groups {
            assert_eq!(group.request_count, 5);
            assert!(group.total_cost > 0.0);
        }
        let mut keys: Vec<_> = summary.groups.iter().map(|g| g.key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, ["s1", "s2", "s3"]);
    }

    #[test]
    fn test_cost_summary_grouped_by_config_name() {
        let (_dir, store) = open_temp();
        let mut other = sample("s", BASE + 1);
        other.config_name = "backup".to_string();
        other.total_cost = 0.5;
        store
            .insert_batch(&[sample("s", BASE), other, sample("s", BASE + 2)])
            .unwrap();

        let summary = store
            .query_cost_summary(&CostSummaryQuery {
                start_time: BASE,
                end_time: BASE + MINUTE,
                tool_type: None,
                group_by: CostGroupBy::ConfigName,
            })
            .unwrap();
        assert_eq!(summary.groups.len(), 2);
        assert_eq!(summary.groups[0].key, "backup");
        assert_eq!(summary.groups[0].request_count, 1);
        assert_eq!(summary.groups[1].request_count, 2);
    }

    #[test]
    fn test_cost_summary_empty_range() {
        let (_dir, store) = open_temp();
        let summary = store
            .query_cost_summary(&CostSummaryQuery {
                start_time: BASE,
                end_time: BASE + MINUTE,
                tool_type: None,
                group_by: CostGroupBy::default(),
            })
            .unwrap();
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.total_cost, 0.0);
        assert_eq!(summary.avg_response_time_ms, None);
        assert!(summary.groups.is_empty());
    }
}
