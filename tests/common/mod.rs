#![allow(dead_code)]

use async_trait::async_trait;
use peerlink::common::course::CourseCode;
use peerlink::common::models::{MembershipChange, NewGroup, User, UserId};
use peerlink::server::database::Database;
use peerlink::server::error::{ServiceError, ServiceResult};
use peerlink::server::groups::GroupService;
use peerlink::server::notifications::MembershipNotifier;
use peerlink::server::suggestions::{MemberSuggester, Suggestion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn test_db() -> Arc<Database> {
    Arc::new(Database::in_memory().await.unwrap())
}

/// A migrated database file under the temp dir, removed when dropped.
pub struct FileDb {
    pub db: Arc<Database>,
    dir: std::path::PathBuf,
}

impl Drop for FileDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub async fn file_db() -> FileDb {
    let dir = std::env::temp_dir().join(format!("peerlink-{}", uuid::Uuid::new_v4()));
    let url = format!("sqlite:{}", dir.join("peerlink.db").display());
    let db = Database::connect(&url).await.unwrap();
    db.migrate().await.unwrap();
    FileDb { db: Arc::new(db), dir }
}

/// Insert a user directly, skipping password hashing.
pub async fn seed_user(db: &Database, name: &str, courses: &[&str]) -> UserId {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO users (id, name, email, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(name)
        .bind(format!("{}@example.edu", name.to_lowercase().replace(' ', ".")))
        .bind(chrono::Utc::now().timestamp())
        .execute(&db.pool)
        .await
        .unwrap();
    for (position, course) in courses.iter().enumerate() {
        sqlx::query("INSERT OR IGNORE INTO user_courses (user_id, course_code, position) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(CourseCode::parse(course).as_str())
            .bind(position as i64)
            .execute(&db.pool)
            .await
            .unwrap();
    }
    id
}

pub async fn delete_user_row(db: &Database, user_id: &str) {
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(&db.pool)
        .await
        .unwrap();
}

pub fn new_group(name: &str, course: &str, max_members: u32, is_public: bool, invitees: &[&UserId]) -> NewGroup {
    NewGroup {
        name: name.to_string(),
        course: course.to_string(),
        max_members,
        is_public,
        invitees: invitees.iter().map(|id| id.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, MembershipChange, String)>>,
}

impl RecordingNotifier {
    /// Wait for the background deliveries to land.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, MembershipChange, String)> {
        for _ in 0..100 {
            {
                let events = self.events.lock().unwrap();
                if events.len() >= count {
                    return events.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl MembershipNotifier for RecordingNotifier {
    async fn notify_membership_change(
        &self,
        group_id: &str,
        kind: MembershipChange,
        actor_name: &str,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((group_id.to_string(), kind, actor_name.to_string()));
        Ok(())
    }
}

pub struct FailingNotifier;

#[async_trait]
impl MembershipNotifier for FailingNotifier {
    async fn notify_membership_change(&self, _: &str, _: MembershipChange, _: &str) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("chat service offline"))
    }
}

pub fn service(db: &Arc<Database>) -> (GroupService, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    (GroupService::new(db.clone(), notifier.clone()), notifier)
}

/// Replays a fixed answer and counts invocations.
pub struct StubSuggester {
    answer: Mutex<Box<dyn Fn(&[User]) -> ServiceResult<Suggestion> + Send>>,
    pub calls: AtomicUsize,
}

impl StubSuggester {
    pub fn new(answer: impl Fn(&[User]) -> ServiceResult<Suggestion> + Send + 'static) -> Self {
        Self {
            answer: Mutex::new(Box::new(answer)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn picking(ids: Vec<UserId>) -> Self {
        Self::new(move |_| {
            Ok(Suggestion {
                member_ids: ids.clone(),
                rationale: "shared schedule".to_string(),
            })
        })
    }

    pub fn failing() -> Self {
        Self::new(|_| Err(ServiceError::ExternalService("model returned prose".to_string())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemberSuggester for StubSuggester {
    async fn suggest_members(
        &self,
        _course: &CourseCode,
        _requester: &User,
        candidates: &[User],
        _count: usize,
    ) -> ServiceResult<Suggestion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answer.lock().unwrap();
        (*answer)(candidates)
    }
}
