//! Wire types for the TimeCamp third-party API.
//!
//! TimeCamp serialises most numeric fields as strings (`"task_id": "123"`)
//! but not consistently, so every number goes through [`flexible_i64`].

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};

use crate::model::{Task, TimeEntry, TrackedUser};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Int(i64),
    Float(f64),
    Text(String),
}

fn parse_number<E: serde::de::Error>(raw: NumberOrString) -> Result<Option<i64>, E> {
    match raw {
        NumberOrString::Int(n) => Ok(Some(n)),
        NumberOrString::Float(f) => Ok(Some(f as i64)),
        NumberOrString::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                .map(Some)
                .map_err(|_| E::custom(format!("expected a number, got {s:?}")))
        }
    }
}

/// Accept `123`, `123.0` or `"123"`.
pub(crate) fn flexible_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let raw = NumberOrString::deserialize(d)?;
    parse_number(raw)?.ok_or_else(|| serde::de::Error::custom("empty number"))
}

/// Like [`flexible_i64`] but `null` and `""` become `None`.
pub(crate) fn flexible_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    match Option::<NumberOrString>::deserialize(d)? {
        Some(raw) => parse_number(raw),
        None => Ok(None),
    }
}

/// Accept `true`, `1`, `"1"` or `"0"`.
fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Num(NumberOrString),
    }
    match Option::<Raw>::deserialize(d)? {
        None => Ok(false),
        Some(Raw::Bool(b)) => Ok(b),
        Some(Raw::Num(n)) => Ok(parse_number::<D::Error>(n)?.unwrap_or(0) != 0),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTask {
    #[serde(deserialize_with = "flexible_i64")]
    pub task_id: i64,
    #[serde(default, deserialize_with = "flexible_opt_i64")]
    pub parent_id: Option<i64>,
    pub name: String,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub archived: bool,
}

impl From<ApiTask> for Task {
    fn from(t: ApiTask) -> Self {
        Task {
            id: t.task_id,
            parent_id: t.parent_id.filter(|&p| p != 0),
            name: t.name,
            archived: t.archived,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    #[serde(deserialize_with = "flexible_i64")]
    pub user_id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl From<ApiUser> for TrackedUser {
    fn from(u: ApiUser) -> Self {
        let display_name = u
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| u.email.clone());
        TrackedUser {
            id: u.user_id,
            email: u.email,
            display_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEntry {
    #[serde(deserialize_with = "flexible_i64")]
    pub id: i64,
    #[serde(deserialize_with = "flexible_i64")]
    pub task_id: i64,
    #[serde(deserialize_with = "flexible_i64")]
    pub user_id: i64,
    pub date: NaiveDate,
    #[serde(deserialize_with = "flexible_i64")]
    pub duration: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<ApiEntry> for TimeEntry {
    fn from(e: ApiEntry) -> Self {
        TimeEntry {
            id: e.id,
            task_id: e.task_id,
            user_id: e.user_id,
            date: e.date,
            duration_secs: e.duration.max(0),
            description: e.description.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_accepts_string_numbers() {
        let raw = r#"{"task_id": "42", "parent_id": "0", "name": "Design [10-20]", "archived": "1"}"#;
        let task: Task = serde_json::from_str::<ApiTask>(raw).unwrap().into();
        assert_eq!(task.id, 42);
        assert_eq!(task.parent_id, None);
        assert!(task.archived);
    }

    #[test]
    fn task_accepts_native_numbers_and_missing_fields() {
        let raw = r#"{"task_id": 7, "parent_id": 500, "name": "Child"}"#;
        let task: Task = serde_json::from_str::<ApiTask>(raw).unwrap().into();
        assert_eq!(task.parent_id, Some(500));
        assert!(!task.archived);
    }

    #[test]
    fn entry_parses_timecamp_shape() {
        let raw = r#"{
            "id": "101", "duration": "3600", "user_id": "3", "task_id": "42",
            "date": "2026-03-02", "description": null, "billable": "1"
        }"#;
        let entry: TimeEntry = serde_json::from_str::<ApiEntry>(raw).unwrap().into();
        assert_eq!(entry.id, 101);
        assert_eq!(entry.duration_secs, 3600);
        assert_eq!(entry.date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(entry.description, "");
    }

    #[test]
    fn garbage_number_is_an_error() {
        let raw = r#"{"task_id": "abc", "name": "x"}"#;
        assert!(serde_json::from_str::<ApiTask>(raw).is_err());
    }

    #[test]
    fn user_falls_back_to_email_for_name() {
        let raw = r#"{"user_id": "3", "email": "ana@example.com", "display_name": ""}"#;
        let user: TrackedUser = serde_json::from_str::<ApiUser>(raw).unwrap().into();
        assert_eq!(user.display_name, "ana@example.com");
    }
}
