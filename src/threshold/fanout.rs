//! Fan-out of threshold crossings to Slack recipients.
//!
//! Each recipient gets only the crossings for their assigned projects,
//! grouped into one message per project. Delivery is sequential and paced;
//! a failed send is logged and the fan-out moves on. Ledger rows written by
//! the detector are never rolled back here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ThresholdError;
use crate::model::{Project, Recipient};
use crate::slack::Messenger;
use crate::store::Database;
use crate::threshold::detector::ThresholdCrossing;

/// Label for crossings that belong to no configured project.
pub const UNASSIGNED_LABEL: &str = "Other tasks";

/// Which crossings a recipient is eligible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientScope {
    /// No project assignments: the recipient sees every crossing.
    Unfiltered,
    /// Only crossings under one of these projects.
    Projects(Vec<Project>),
}

impl RecipientScope {
    pub fn from_assignments(assignments: Vec<Project>) -> Self {
        if assignments.is_empty() {
            RecipientScope::Unfiltered
        } else {
            RecipientScope::Projects(assignments)
        }
    }
}

/// Counters from one fan-out pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub recipients_notified: usize,
    pub messages_sent: usize,
    pub messages_failed: usize,
}

pub struct NotificationFanout {
    store: Arc<dyn Database>,
    messenger: Arc<dyn Messenger>,
    pacing: Duration,
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn Database>, messenger: Arc<dyn Messenger>, pacing: Duration) -> Self {
        Self {
            store,
            messenger,
            pacing,
        }
    }

    pub async fn deliver(
        &self,
        crossings: &[ThresholdCrossing],
    ) -> Result<FanoutReport, ThresholdError> {
        let mut report = FanoutReport::default();
        if crossings.is_empty() {
            return Ok(report);
        }

        let recipients = self
            .store
            .list_recipients()
            .await
            .map_err(ThresholdError::RoutingUnavailable)?;
        let projects = self
            .store
            .list_projects()
            .await
            .map_err(ThresholdError::RoutingUnavailable)?;

        if recipients.is_empty() {
            info!(crossings = crossings.len(), "No recipients registered for threshold alerts");
            return Ok(report);
        }

        let mut delivered_before = false;
        for recipient in &recipients {
            let scope = match self.store.user_project_assignments(&recipient.slack_user_id).await {
                Ok(assignments) => RecipientScope::from_assignments(assignments),
                Err(e) => {
                    warn!(recipient = %recipient.slack_user_id, error = %e, "Could not load project assignments, skipping recipient");
                    continue;
                }
            };

            let groups = group_for_recipient(&scope, &projects, crossings);
            if groups.is_empty() {
                debug!(recipient = %recipient.slack_user_id, "No relevant crossings");
                continue;
            }

            if delivered_before && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            delivered_before = true;

            if self.send_groups(recipient, groups, &mut report).await {
                report.recipients_notified += 1;
            }
        }

        info!(
            sent = report.messages_sent,
            failed = report.messages_failed,
            recipients = report.recipients_notified,
            "Threshold notifications delivered"
        );
        Ok(report)
    }

    /// Returns whether at least one message reached the recipient.
    async fn send_groups(
        &self,
        recipient: &Recipient,
        groups: BTreeMap<String, Vec<ThresholdCrossing>>,
        report: &mut FanoutReport,
    ) -> bool {
        let mut any_sent = false;
        for (label, group) in groups {
            match self
                .messenger
                .send_message(&recipient.slack_user_id, &label, &group)
                .await
            {
                Ok(()) => {
                    report.messages_sent += 1;
                    any_sent = true;
                }
                Err(e) => {
                    report.messages_failed += 1;
                    warn!(
                        recipient = %recipient.slack_user_id,
                        project = %label,
                        error = %e,
                        "Threshold notification failed"
                    );
                }
            }
        }
        any_sent
    }
}

/// Filter crossings by scope and group them by project label.
pub fn group_for_recipient(
    scope: &RecipientScope,
    all_projects: &[Project],
    crossings: &[ThresholdCrossing],
) -> BTreeMap<String, Vec<ThresholdCrossing>> {
    let mut groups: BTreeMap<String, Vec<ThresholdCrossing>> = BTreeMap::new();

    for crossing in crossings {
        let label = match scope {
            RecipientScope::Unfiltered => project_for(all_projects, crossing)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| UNASSIGNED_LABEL.to_string()),
            RecipientScope::Projects(assigned) => match project_for(assigned, crossing) {
                Some(project) => project.name.clone(),
                None => continue,
            },
        };
        groups.entry(label).or_default().push(crossing.clone());
    }

    groups
}

fn project_for<'a>(projects: &'a [Project], crossing: &ThresholdCrossing) -> Option<&'a Project> {
    projects
        .iter()
        .find(|p| p.covers(crossing.task_id, crossing.parent_id))
}
