//! Block Kit formatting for threshold alerts and digests.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::SlackMessage;
use crate::model::UserTaskTotal;
use crate::threshold::{CrossingKind, ThresholdCrossing};

/// Slack rejects messages with more than 50 blocks.
pub const MAX_BLOCKS_PER_MESSAGE: usize = 50;

/// Render seconds as `Hh MMm`.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    format!("{hours}h {minutes:02}m")
}

fn header(text: &str) -> Value {
    json!({
        "type": "header",
        "text": { "type": "plain_text", "text": text, "emoji": true }
    })
}

fn section(markdown: &str) -> Value {
    json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": markdown }
    })
}

fn context(markdown: &str) -> Value {
    json!({
        "type": "context",
        "elements": [{ "type": "mrkdwn", "text": markdown }]
    })
}

fn alert_line(crossing: &ThresholdCrossing) -> String {
    let headline = match crossing.kind {
        CrossingKind::FirstCrossing => format!(
            ":warning: *{}* reached *{}* of its budget",
            crossing.task_name, crossing.level
        ),
        CrossingKind::PersistentViolation => format!(
            ":rotating_light: *{}* is still over budget and growing",
            crossing.task_name
        ),
    };
    format!(
        "{headline}\nUsed: *{:.0}%* · Now: {} · Before: {}",
        crossing.percentage,
        format_duration(crossing.current_secs),
        format_duration(crossing.previous_secs),
    )
}

/// One message per (recipient, project) group.
pub fn threshold_alert_message(project_label: &str, crossings: &[ThresholdCrossing]) -> SlackMessage {
    let title = format!("Budget alerts · {project_label}");
    let mut blocks = vec![header(&title)];
    blocks.extend(
        crossings
            .iter()
            .take(MAX_BLOCKS_PER_MESSAGE - 2)
            .map(|c| section(&alert_line(c))),
    );
    if crossings.len() > MAX_BLOCKS_PER_MESSAGE - 2 {
        blocks.push(context(&format!(
            "…and {} more",
            crossings.len() - (MAX_BLOCKS_PER_MESSAGE - 2)
        )));
    }

    SlackMessage {
        text: format!("{title}: {} task(s) need attention", crossings.len()),
        blocks,
    }
}

/// Time digest grouped by user; split into as many messages as the block limit needs.
pub fn digest_messages(title: &str, period: &str, totals: &[UserTaskTotal]) -> Vec<SlackMessage> {
    if totals.is_empty() {
        return vec![SlackMessage {
            text: format!("{title}: no time tracked"),
            blocks: vec![
                header(title),
                context(period),
                section("_No time tracked in this period._"),
            ],
        }];
    }

    let mut by_user: BTreeMap<&str, Vec<&UserTaskTotal>> = BTreeMap::new();
    for total in totals {
        by_user.entry(total.user_name.as_str()).or_default().push(total);
    }

    let grand_total: i64 = totals.iter().map(|t| t.duration_secs).sum();
    let mut body = Vec::with_capacity(by_user.len());
    for (user, rows) in &by_user {
        let user_total: i64 = rows.iter().map(|t| t.duration_secs).sum();
        let lines: Vec<String> = rows
            .iter()
            .map(|t| format!("• {} — {}", t.task_name, format_duration(t.duration_secs)))
            .collect();
        body.push(section(&format!(
            "*{user}* · {}\n{}",
            format_duration(user_total),
            lines.join("\n")
        )));
    }

    let per_message = MAX_BLOCKS_PER_MESSAGE - 2;
    let pages = body.chunks(per_message).count();
    body.chunks(per_message)
        .enumerate()
        .map(|(i, chunk)| {
            let page_title = if pages > 1 {
                format!("{title} ({}/{pages})", i + 1)
            } else {
                title.to_string()
            };
            let mut blocks = vec![
                header(&page_title),
                context(&format!("{period} · total {}", format_duration(grand_total))),
            ];
            blocks.extend(chunk.iter().cloned());
            SlackMessage {
                text: format!("{page_title}: {}", format_duration(grand_total)),
                blocks,
            }
        })
        .collect()
}
