//! Ticket entity: the user-visible unit of requested work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContextMap, EntityId, MAX_DESCRIPTION_LEN};

/// Lifecycle status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Submitted, not yet building.
    Pending,
    /// Tasks are actively in flight.
    Building,
    /// All tasks completed successfully.
    Done,
    /// Work is stalled on an external dependency or approval.
    Blocked,
    /// Terminal failure.
    Failed,
}

/// Ticket priority, inherited by tasks unless explicitly overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TicketPriority {
    /// Lowest scheduling priority.
    Low,
    /// Standard priority; the default for most work.
    Medium,
    /// Important work that should be scheduled ahead of medium/low.
    High,
    /// Must be scheduled ahead of everything else.
    Critical,
}

impl TicketPriority {
    /// Numeric rank used by the queue's claim ordering:
    /// `CRITICAL=4, HIGH=3, MEDIUM=2, LOW=1`.
    pub fn rank(self) -> u8 {
        match self {
            TicketPriority::Critical => 4,
            TicketPriority::High => 3,
            TicketPriority::Medium => 2,
            TicketPriority::Low => 1,
        }
    }
}

/// Approval gate state for a ticket before its tasks become runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a reviewer decision; tasks are not claimable.
    PendingReview,
    /// Reviewer approved; tasks may be claimed.
    Approved,
    /// Reviewer rejected; the ticket will not proceed.
    Rejected,
    /// The approval deadline elapsed with no decision.
    TimedOut,
}

impl ApprovalStatus {
    /// True iff this status permits tasks belonging to the ticket to be
    /// claimed off the queue. Mirrors the invariant in §3: "a ticket whose
    /// `approval_status` is not `approved` never yields runnable tasks".
    pub fn allows_scheduling(self) -> bool {
        matches!(self, ApprovalStatus::Approved)
    }
}

/// A unit of requested work, owning one or more [`crate::Task`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Opaque identifier.
    pub id: EntityId,
    /// Short human-readable title.
    pub title: String,
    /// Full description of the requested work.
    pub description: String,
    /// Implementation phase tag (e.g. `"backend"`, `"frontend"`).
    pub phase: String,
    /// Current lifecycle status.
    pub status: TicketStatus,
    /// Scheduling priority, inherited by tasks unless overridden.
    pub priority: TicketPriority,
    /// Owning project.
    pub project_id: EntityId,
    /// Owning user.
    pub user_id: EntityId,
    /// Free-form context map (open-ended; known keys documented at call sites).
    pub context: ContextMap,
    /// Approval gate state.
    pub approval_status: ApprovalStatus,
    /// Deadline by which a reviewer must decide, after which the ticket
    /// transitions to `ApprovalStatus::TimedOut`.
    pub approval_deadline: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Errors raised while constructing or mutating a [`Ticket`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TicketError {
    /// The description exceeded [`MAX_DESCRIPTION_LEN`] or was empty.
    #[error("invalid ticket description: {0}")]
    InvalidDescription(String),
}

impl Ticket {
    /// Construct a new ticket in `Pending` status with no approval gate
    /// (approved by default — callers that need a review gate should set
    /// `approval_status` to `PendingReview` with a deadline after creation).
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        phase: impl Into<String>,
        priority: TicketPriority,
        project_id: EntityId,
        user_id: EntityId,
    ) -> Result<Self, TicketError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(TicketError::InvalidDescription("description cannot be empty".into()));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(TicketError::InvalidDescription(format!(
                "description too long: {} > {}",
                description.len(),
                MAX_DESCRIPTION_LEN
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: EntityId::new(),
            title: title.into(),
            description,
            phase: phase.into(),
            status: TicketStatus::Pending,
            priority,
            project_id,
            user_id,
            context: ContextMap::new(),
            approval_status: ApprovalStatus::Approved,
            approval_deadline: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether this ticket currently permits its tasks to be scheduled.
    pub fn can_schedule(&self) -> bool {
        self.approval_status.allows_scheduling()
    }

    /// Apply the approval-timeout transition if the deadline has elapsed
    /// and no decision has been recorded. Returns `true` if a transition
    /// was applied.
    pub fn apply_approval_timeout(&mut self, now: DateTime<Utc>) -> bool {
        if self.approval_status == ApprovalStatus::PendingReview {
            if let Some(deadline) = self.approval_deadline {
                if now > deadline {
                    self.approval_status = ApprovalStatus::TimedOut;
                    self.updated_at = now;
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_and_user() -> (EntityId, EntityId) {
        (EntityId::new(), EntityId::new())
    }

    #[test]
    fn rejects_empty_description() {
        let (p, u) = project_and_user();
        let err = Ticket::new("t", "", "backend", TicketPriority::Medium, p, u).unwrap_err();
        assert_eq!(err, TicketError::InvalidDescription("description cannot be empty".into()));
    }

    #[test]
    fn approved_by_default_can_schedule() {
        let (p, u) = project_and_user();
        let ticket = Ticket::new("t", "desc", "backend", TicketPriority::Medium, p, u).unwrap();
        assert!(ticket.can_schedule());
    }

    #[test]
    fn pending_review_blocks_scheduling_until_approved() {
        let (p, u) = project_and_user();
        let mut ticket = Ticket::new("t", "desc", "backend", TicketPriority::Medium, p, u).unwrap();
        ticket.approval_status = ApprovalStatus::PendingReview;
        assert!(!ticket.can_schedule());
        ticket.approval_status = ApprovalStatus::Approved;
        assert!(ticket.can_schedule());
    }

    #[test]
    fn approval_timeout_fires_once_deadline_passes() {
        let (p, u) = project_and_user();
        let mut ticket = Ticket::new("t", "desc", "backend", TicketPriority::Medium, p, u).unwrap();
        ticket.approval_status = ApprovalStatus::PendingReview;
        let deadline = Utc::now();
        ticket.approval_deadline = Some(deadline);
        let later = deadline + chrono::Duration::seconds(1);
        assert!(ticket.apply_approval_timeout(later));
        assert_eq!(ticket.approval_status, ApprovalStatus::TimedOut);
        // Second call is a no-op (status no longer PendingReview).
        assert!(!ticket.apply_approval_timeout(later));
    }

    #[test]
    fn priority_rank_matches_spec() {
        assert_eq!(TicketPriority::Critical.rank(), 4);
        assert_eq!(TicketPriority::High.rank(), 3);
        assert_eq!(TicketPriority::Medium.rank(), 2);
        assert_eq!(TicketPriority::Low.rank(), 1);
    }
}
