//! In-memory fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::email::{EmailError, EmailSender};
use crate::processor::TaskContext;
use crate::queue::{EnqueueError, Enqueuer, Task, TaskInfo};
use crate::users::{GroupType, RepositoryError, User, UserGroupMembership, UserRepository};
use crate::verification::{
    CheckResponse, CheckStatus, GroupCheckResult, VerificationError, VerificationService,
};

/// Serializes tests that touch the process-wide queue client.
pub static DEFAULT_CLIENT_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Fresh context for a first attempt.
pub fn context() -> TaskContext {
    TaskContext::new(Uuid::new_v4(), 0, 3, CancellationToken::new())
}

// =============================================================================
// Enqueuer
// =============================================================================

#[derive(Default)]
pub struct RecordingEnqueuer {
    tasks: Mutex<Vec<Task>>,
}

impl RecordingEnqueuer {
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Enqueuer for RecordingEnqueuer {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, EnqueueError> {
        let info = TaskInfo {
            id: Uuid::new_v4(),
            kind: task.kind(),
            queue: task.queue(),
            max_retry: task.max_retry(),
        };
        self.tasks.lock().unwrap().push(task);
        Ok(info)
    }
}

// =============================================================================
// Email
// =============================================================================

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<SentEmail>>,
    fail: bool,
}

impl RecordingEmailSender {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        if self.fail {
            return Err(EmailError::Rejected {
                status: 500,
                body: "provider unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// Users
// =============================================================================

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: Mutex<HashMap<Uuid, User>>,
    fail_updates: AtomicBool,
    updates: AtomicUsize,
}

impl InMemoryUserRepository {
    pub fn with_users(users: Vec<User>) -> Self {
        let repo = Self::default();
        {
            let mut map = repo.users.lock().unwrap();
            for user in users {
                map.insert(user.id, user);
            }
        }
        repo
    }

    pub fn memberships(&self, user_id: Uuid) -> Vec<UserGroupMembership> {
        self.users
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|user| user.group_memberships.clone())
            .unwrap_or_default()
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn get_by_id(&self, user_id: Uuid) -> Result<User, RepositoryError> {
        self.users
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or(RepositoryError::NotFound(user_id))
    }

    async fn update_user_groups(
        &self,
        user_id: Uuid,
        memberships: &[UserGroupMembership],
    ) -> Result<(), RepositoryError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RepositoryError::Storage("write refused".to_string()));
        }
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(&user_id)
            .ok_or(RepositoryError::NotFound(user_id))?;
        user.group_memberships = memberships.to_vec();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Verification Service
// =============================================================================

pub struct FakeVerificationService {
    answer: Result<Vec<(GroupType, CheckStatus)>, String>,
    delay: Duration,
    calls: Mutex<Vec<(String, Vec<GroupType>)>>,
}

impl FakeVerificationService {
    pub fn answering(results: Vec<(GroupType, CheckStatus)>) -> Self {
        Self {
            answer: Ok(results),
            delay: Duration::ZERO,
            calls: Mutex::default(),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            answer: Err(reason.to_string()),
            delay: Duration::ZERO,
            calls: Mutex::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<GroupType>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VerificationService for FakeVerificationService {
    async fn check(
        &self,
        snils: &str,
        groups: &[GroupType],
    ) -> Result<CheckResponse, VerificationError> {
        self.calls
            .lock()
            .unwrap()
            .push((snils.to_string(), groups.to_vec()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.answer {
            Ok(results) => Ok(CheckResponse {
                snils: snils.to_string(),
                results: results
                    .iter()
                    .map(|(group, status)| GroupCheckResult {
                        group: *group,
                        status: *status,
                    })
                    .collect(),
            }),
            Err(reason) => Err(VerificationError::Status {
                status: 503,
                body: reason.clone(),
            }),
        }
    }
}
