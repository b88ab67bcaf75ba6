//! 事件流接入
//!
//! 从按行分隔的字节流读取 JSON 事件并发评估。非 UTF-8 的行和无法解析的行
//! 记录告警后跳过。无论输入结束、读取出错还是收到关闭信号，返回前都会等待
//! 已派发的评估全部完成。

use crate::engine::RuleEngine;
use crate::error::{Result, RuleError};
use crate::models::Event;
use crate::record::ExecutionRecord;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 事件流处理统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// 已派发评估的事件数
    pub accepted: usize,
    /// 被跳过的行数（空行不计）
    pub skipped: usize,
}

/// 解析事件；负载中的 `id` 字段为 UUID 时作为事件 ID
pub fn parse_event(line: &str) -> serde_json::Result<Event> {
    let payload: Value = serde_json::from_str(line)?;
    let event = Event::new(payload);

    let id = event
        .get_field("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());

    Ok(match id {
        Some(id) => event.with_id(id),
        None => event,
    })
}

/// 解析一行原始字节，空行返回 `Ok(None)`
fn parse_line(raw: &[u8]) -> std::result::Result<Option<Event>, String> {
    let line = std::str::from_utf8(raw).map_err(|e| format!("非 UTF-8 内容: {}", e))?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    parse_event(line)
        .map(Some)
        .map_err(|e| format!("JSON 解析失败: {}", e))
}

/// 处理事件流，并发度受 `limit` 限制
///
/// 每个事件的执行记录交给 `on_records`。`shutdown` 完成后停止读取新事件。
pub async fn process_stream<R, S, F>(
    engine: &RuleEngine,
    mut reader: R,
    limit: usize,
    shutdown: S,
    on_records: F,
) -> Result<StreamSummary>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
    F: Fn(Vec<ExecutionRecord>) + Send + Sync + 'static,
{
    let on_records = Arc::new(on_records);
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut summary = StreamSummary::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    tokio::pin!(shutdown);

    let outcome: Result<()> = loop {
        buf.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read,
            _ = &mut shutdown => {
                info!("收到关闭信号，停止读取事件");
                break Ok(());
            }
        };
        match read {
            Ok(0) => {
                info!("输入流已结束");
                break Ok(());
            }
            Ok(_) => line_no += 1,
            Err(e) => break Err(RuleError::Internal(format!("读取事件流失败: {}", e))),
        }

        let event = match parse_line(&buf) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(reason) => {
                summary.skipped += 1;
                warn!(line = line_no, %reason, "跳过无法解析的事件");
                continue;
            }
        };

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => break Err(RuleError::Internal(format!("并发许可不可用: {}", e))),
            },
            _ = &mut shutdown => {
                info!("收到关闭信号，停止读取事件");
                break Ok(());
            }
        };

        let engine = engine.clone();
        let on_records = on_records.clone();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            let event_id = event.id;
            match engine.evaluate_async(event).await {
                Ok(records) => on_records(records),
                Err(e) => error!(%event_id, error = %e, "事件评估失败"),
            }
        }));
        summary.accepted += 1;
    };

    for joined in futures::future::join_all(tasks).await {
        if let Err(e) = joined {
            error!(error = %e, "评估任务异常退出");
        }
    }

    info!(
        accepted = summary.accepted,
        skipped = summary.skipped,
        "事件流处理结束"
    );
    outcome.map(|_| summary)
}
