//! Social-group verification workflow.
//!
//! Given a user, a SNILS and the groups to check, asks the verification
//! service and reconciles the answer against the user's stored memberships.
//!
//! ```text
//! load user → call service → CheckOutcome → reconcile (pure) → replace membership list
//! ```
//!
//! Only memberships whose type was requested, and which still await a
//! determination (see [`UserGroupMembership::awaits_determination`]), are
//! touched. A failed call marks them rejected with an error message so the
//! failure is visible, and the error is still returned so the task is retried.

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::client::{CheckResponse, CheckStatus, VerificationService};
use crate::users::{
    GroupType, MembershipStatus, RepositoryError, UserGroupMembership, UserRepository,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("user {0} not found")]
    UserNotFound(Uuid),

    #[error("verification call failed: {0}")]
    VerificationCallFailed(String),

    #[error("failed to persist memberships: {0}")]
    PersistenceFailed(String),
}

impl From<RepositoryError> for WorkflowError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(user_id) => WorkflowError::UserNotFound(user_id),
            RepositoryError::Storage(message) => WorkflowError::PersistenceFailed(message),
        }
    }
}

/// Determination for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Confirmed,
    Rejected,
}

/// Everything a check run learned from the verification service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The call succeeded; one verdict per group the service answered for.
    Results(Vec<(GroupType, Verdict)>),
    /// The call itself failed; no group was determined.
    CallFailed(String),
}

impl CheckOutcome {
    fn verdict_for(&self, group: GroupType) -> Option<Verdict> {
        match self {
            // First answer wins if the service repeats a group
            CheckOutcome::Results(results) => results
                .iter()
                .find(|(answered, _)| *answered == group)
                .map(|(_, verdict)| *verdict),
            CheckOutcome::CallFailed(_) => None,
        }
    }
}

impl From<CheckResponse> for CheckOutcome {
    fn from(response: CheckResponse) -> Self {
        let results = response
            .results
            .into_iter()
            .map(|result| {
                let verdict = match result.status {
                    CheckStatus::Confirmed => Verdict::Confirmed,
                    CheckStatus::Rejected => Verdict::Rejected,
                };
                (result.group, verdict)
            })
            .collect();
        CheckOutcome::Results(results)
    }
}

/// How long a verification stays valid.
pub fn verification_expiry(verified_at: DateTime<Utc>) -> DateTime<Utc> {
    verified_at
        .checked_add_months(Months::new(12))
        .unwrap_or(verified_at + chrono::Duration::days(365))
}

/// Apply a check outcome to a user's memberships in place.
///
/// Returns the group types that changed, in membership order.
pub fn reconcile(
    memberships: &mut [UserGroupMembership],
    requested: &[GroupType],
    outcome: &CheckOutcome,
    now: DateTime<Utc>,
) -> Vec<GroupType> {
    let mut changed = Vec::new();

    for membership in memberships.iter_mut() {
        if !requested.contains(&membership.group_type) || !membership.awaits_determination() {
            continue;
        }

        match outcome {
            CheckOutcome::CallFailed(reason) => {
                // rejected_at is stamped on the transition only
                if membership.status != MembershipStatus::Rejected {
                    membership.status = MembershipStatus::Rejected;
                    membership.rejected_at = Some(now);
                    membership.verified_at = None;
                    membership.expires_at = None;
                }
                membership.error_message = format!("verification service call failed: {}", reason);
            }
            CheckOutcome::Results(_) => match outcome.verdict_for(membership.group_type) {
                Some(Verdict::Confirmed) => {
                    membership.status = MembershipStatus::Verified;
                    membership.verified_at = Some(now);
                    membership.expires_at = Some(verification_expiry(now));
                    membership.rejected_at = None;
                    membership.error_message.clear();
                }
                Some(Verdict::Rejected) => {
                    membership.status = MembershipStatus::Rejected;
                    membership.rejected_at = Some(now);
                    membership.verified_at = None;
                    membership.expires_at = None;
                    membership.error_message.clear();
                }
                None => continue,
            },
        }

        changed.push(membership.group_type);
    }

    changed
}

/// Result of one successful check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub user_id: Uuid,
    pub changed: Vec<GroupType>,
}

/// Runs check requests against the verification service and the user store.
#[derive(Clone)]
pub struct SocialGroupVerifier {
    users: Arc<dyn UserRepository>,
    service: Arc<dyn VerificationService>,
}

impl SocialGroupVerifier {
    pub fn new(users: Arc<dyn UserRepository>, service: Arc<dyn VerificationService>) -> Self {
        Self { users, service }
    }

    /// Check `groups` for a user and persist the outcome.
    pub async fn verify(
        &self,
        user_id: Uuid,
        snils: &str,
        groups: &[GroupType],
    ) -> Result<VerificationReport, WorkflowError> {
        let user = self.users.get_by_id(user_id).await?;
        let mut memberships = user.group_memberships;

        let outcome = match self.service.check(snils, groups).await {
            Ok(response) => CheckOutcome::from(response),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "social_group_check_call_failed");
                CheckOutcome::CallFailed(e.to_string())
            }
        };

        let changed = reconcile(&mut memberships, groups, &outcome, Utc::now());

        let persisted = if changed.is_empty() {
            info!(user_id = %user_id, "social_group_check_no_changes");
            Ok(())
        } else {
            self.users.update_user_groups(user_id, &memberships).await
        };

        if let CheckOutcome::CallFailed(reason) = outcome {
            if let Err(e) = persisted {
                error!(user_id = %user_id, error = %e, "social_group_failure_persist_failed");
            }
            return Err(WorkflowError::VerificationCallFailed(reason));
        }
        persisted?;

        info!(
            user_id = %user_id,
            requested = groups.len(),
            changed = changed.len(),
            "social_group_check_complete"
        );

        Ok(VerificationReport { user_id, changed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeVerificationService, InMemoryUserRepository};
    use crate::users::User;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    fn membership(group: GroupType, status: MembershipStatus) -> UserGroupMembership {
        let mut m = UserGroupMembership::pending(group);
        m.status = status;
        m
    }

    fn user_with(memberships: Vec<UserGroupMembership>) -> User {
        User {
            id: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            snils: "11223344595".to_string(),
            group_memberships: memberships,
        }
    }

    // -------------------------------------------------------------------------
    // reconcile
    // -------------------------------------------------------------------------

    #[test]
    fn test_confirmed_pending_becomes_verified() {
        let mut memberships = vec![UserGroupMembership::pending(GroupType::Pensioners)];
        let outcome = CheckOutcome::Results(vec![(GroupType::Pensioners, Verdict::Confirmed)]);

        let changed = reconcile(&mut memberships, &[GroupType::Pensioners], &outcome, now());

        assert_eq!(changed, vec![GroupType::Pensioners]);
        let m = &memberships[0];
        assert_eq!(m.status, MembershipStatus::Verified);
        assert_eq!(m.verified_at, Some(now()));
        assert_eq!(
            m.expires_at,
            Some(Utc.with_ymd_and_hms(2027, 3, 15, 12, 0, 0).unwrap())
        );
        assert_eq!(m.rejected_at, None);
        assert_eq!(m.error_message, "");
    }

    #[test]
    fn test_rejected_verdict() {
        let mut memberships = vec![UserGroupMembership::pending(GroupType::LowIncome)];
        let outcome = CheckOutcome::Results(vec![(GroupType::LowIncome, Verdict::Rejected)]);

        reconcile(&mut memberships, &[GroupType::LowIncome], &outcome, now());

        let m = &memberships[0];
        assert_eq!(m.status, MembershipStatus::Rejected);
        assert_eq!(m.rejected_at, Some(now()));
        assert_eq!(m.verified_at, None);
        assert_eq!(m.expires_at, None);
        assert!(m.error_message.is_empty());
    }

    #[test]
    fn test_call_failure_rejects_pending_with_message() {
        let mut memberships = vec![UserGroupMembership::pending(GroupType::Students)];
        let outcome = CheckOutcome::CallFailed("connection refused".to_string());

        let changed = reconcile(&mut memberships, &[GroupType::Students], &outcome, now());

        assert_eq!(changed, vec![GroupType::Students]);
        let m = &memberships[0];
        assert_eq!(m.status, MembershipStatus::Rejected);
        assert_eq!(m.rejected_at, Some(now()));
        assert!(m.error_message.contains("connection refused"));
    }

    #[test]
    fn test_unanswered_requested_group_stays_pending() {
        let mut memberships = vec![
            UserGroupMembership::pending(GroupType::Disabled),
            UserGroupMembership::pending(GroupType::Veterans),
        ];
        let outcome = CheckOutcome::Results(vec![(GroupType::Disabled, Verdict::Confirmed)]);

        let changed = reconcile(
            &mut memberships,
            &[GroupType::Disabled, GroupType::Veterans],
            &outcome,
            now(),
        );

        assert_eq!(changed, vec![GroupType::Disabled]);
        assert_eq!(memberships[0].status, MembershipStatus::Verified);
        assert_eq!(memberships[1], UserGroupMembership::pending(GroupType::Veterans));
    }

    #[test]
    fn test_unrequested_groups_untouched() {
        let original = vec![
            UserGroupMembership::pending(GroupType::Children),
            UserGroupMembership::pending(GroupType::YoungFamilies),
        ];
        let mut memberships = original.clone();
        let outcome = CheckOutcome::Results(vec![
            (GroupType::Children, Verdict::Confirmed),
            (GroupType::YoungFamilies, Verdict::Confirmed),
        ]);

        let changed = reconcile(&mut memberships, &[GroupType::Pensioners], &outcome, now());

        assert!(changed.is_empty());
        assert_eq!(memberships, original);

        let failed = CheckOutcome::CallFailed("timeout".to_string());
        reconcile(&mut memberships, &[GroupType::Veterans], &failed, now());
        assert_eq!(memberships, original);
    }

    #[test]
    fn test_determined_memberships_are_final() {
        let original = vec![
            membership(GroupType::Pensioners, MembershipStatus::Verified),
            membership(GroupType::Disabled, MembershipStatus::Rejected),
        ];
        let requested = [GroupType::Pensioners, GroupType::Disabled];

        let mut memberships = original.clone();
        let flipped = CheckOutcome::Results(vec![
            (GroupType::Pensioners, Verdict::Rejected),
            (GroupType::Disabled, Verdict::Confirmed),
        ]);
        assert!(reconcile(&mut memberships, &requested, &flipped, now()).is_empty());
        assert_eq!(memberships, original);

        let failed = CheckOutcome::CallFailed("503".to_string());
        assert!(reconcile(&mut memberships, &requested, &failed, now()).is_empty());
        assert_eq!(memberships, original);
    }

    #[test]
    fn test_failed_attempt_is_redetermined() {
        let mut memberships = vec![UserGroupMembership::pending(GroupType::Students)];
        let earlier = now() - chrono::Duration::minutes(5);

        let failed = CheckOutcome::CallFailed("timeout".to_string());
        reconcile(&mut memberships, &[GroupType::Students], &failed, earlier);

        // A second failure refreshes the message but keeps the first rejection time
        let failed_again = CheckOutcome::CallFailed("connection reset".to_string());
        reconcile(&mut memberships, &[GroupType::Students], &failed_again, now());
        assert_eq!(memberships[0].rejected_at, Some(earlier));
        assert!(memberships[0].error_message.contains("connection reset"));

        let confirmed = CheckOutcome::Results(vec![(GroupType::Students, Verdict::Confirmed)]);
        reconcile(&mut memberships, &[GroupType::Students], &confirmed, now());

        let m = &memberships[0];
        assert_eq!(m.status, MembershipStatus::Verified);
        assert_eq!(m.verified_at, Some(now()));
        assert_eq!(m.rejected_at, None);
        assert!(m.error_message.is_empty());
    }

    #[test]
    fn test_verification_expiry_handles_leap_day() {
        let leap = Utc.with_ymd_and_hms(2028, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(
            verification_expiry(leap),
            Utc.with_ymd_and_hms(2029, 2, 28, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_outcome_from_response() {
        let response: CheckResponse = serde_json::from_str(
            r#"{"snils": "1", "results": [{"group": "veterans", "status": "confirmed"}]}"#,
        )
        .unwrap();

        assert_eq!(
            CheckOutcome::from(response),
            CheckOutcome::Results(vec![(GroupType::Veterans, Verdict::Confirmed)])
        );
    }

    // -------------------------------------------------------------------------
    // SocialGroupVerifier
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_verify_persists_verified_membership() {
        let user = user_with(vec![UserGroupMembership::pending(GroupType::Pensioners)]);
        let users = Arc::new(InMemoryUserRepository::with_users(vec![user.clone()]));
        let service = Arc::new(FakeVerificationService::answering(vec![(
            GroupType::Pensioners,
            CheckStatus::Confirmed,
        )]));
        let verifier = SocialGroupVerifier::new(users.clone(), service.clone());

        let report = verifier
            .verify(user.id, &user.snils, &[GroupType::Pensioners])
            .await
            .unwrap();

        assert_eq!(report.changed, vec![GroupType::Pensioners]);
        let stored = users.memberships(user.id);
        assert_eq!(stored[0].status, MembershipStatus::Verified);
        let verified_at = stored[0].verified_at.unwrap();
        assert_eq!(stored[0].expires_at, Some(verification_expiry(verified_at)));
        assert!(stored[0].error_message.is_empty());
        assert_eq!(service.calls(), vec![("11223344595".to_string(), vec![GroupType::Pensioners])]);
    }

    #[tokio::test]
    async fn test_verify_call_failure_marks_and_propagates() {
        let user = user_with(vec![
            UserGroupMembership::pending(GroupType::Students),
            membership(GroupType::Pensioners, MembershipStatus::Verified),
        ]);
        let users = Arc::new(InMemoryUserRepository::with_users(vec![user.clone()]));
        let service = Arc::new(FakeVerificationService::failing("status 502"));
        let verifier = SocialGroupVerifier::new(users.clone(), service);

        let err = verifier
            .verify(user.id, &user.snils, &[GroupType::Students, GroupType::Pensioners])
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::VerificationCallFailed(_)));
        let stored = users.memberships(user.id);
        assert_eq!(stored[0].status, MembershipStatus::Rejected);
        assert!(stored[0].rejected_at.is_some());
        assert!(stored[0].error_message.contains("status 502"));
        assert_eq!(stored[1], user.group_memberships[1]);
    }

    #[tokio::test]
    async fn test_verify_unknown_user() {
        let users = Arc::new(InMemoryUserRepository::default());
        let service = Arc::new(FakeVerificationService::answering(vec![]));
        let verifier = SocialGroupVerifier::new(users, service.clone());

        let missing = Uuid::new_v4();
        let err = verifier
            .verify(missing, "11223344595", &[GroupType::Children])
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::UserNotFound(id) if id == missing));
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_verify_persistence_failure() {
        let user = user_with(vec![UserGroupMembership::pending(GroupType::Disabled)]);
        let users = Arc::new(InMemoryUserRepository::with_users(vec![user.clone()]));
        users.fail_updates(true);
        let service = Arc::new(FakeVerificationService::answering(vec![(
            GroupType::Disabled,
            CheckStatus::Rejected,
        )]));
        let verifier = SocialGroupVerifier::new(users.clone(), service);

        let err = verifier
            .verify(user.id, &user.snils, &[GroupType::Disabled])
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::PersistenceFailed(_)));
        assert_eq!(users.memberships(user.id), user.group_memberships);
    }

    #[tokio::test]
    async fn test_verify_twice_equals_once() {
        let user = user_with(vec![
            UserGroupMembership::pending(GroupType::Disabled),
            UserGroupMembership::pending(GroupType::Veterans),
        ]);
        let users = Arc::new(InMemoryUserRepository::with_users(vec![user.clone()]));
        let service = Arc::new(FakeVerificationService::answering(vec![
            (GroupType::Disabled, CheckStatus::Confirmed),
            (GroupType::Veterans, CheckStatus::Rejected),
        ]));
        let verifier = SocialGroupVerifier::new(users.clone(), service);
        let groups = [GroupType::Disabled, GroupType::Veterans];

        verifier.verify(user.id, &user.snils, &groups).await.unwrap();
        let once = users.memberships(user.id);

        let second = verifier.verify(user.id, &user.snils, &groups).await.unwrap();
        assert!(second.changed.is_empty());
        assert_eq!(users.memberships(user.id), once);
    }
}
