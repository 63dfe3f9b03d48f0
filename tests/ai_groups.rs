mod common;

use common::*;
use async_trait::async_trait;
use peerlink::common::course::CourseCode;
use peerlink::common::models::{AiGroupRequest, User};
use peerlink::server::ai_groups::AiGroupPlanner;
use peerlink::server::database::Database;
use peerlink::server::error::{ServiceError, ServiceResult};
use peerlink::server::suggestions::{MemberSuggester, Suggestion};
use std::sync::Arc;

fn request(course: &str, max_members: u32) -> AiGroupRequest {
    AiGroupRequest {
        course: course.to_string(),
        max_members,
        is_public: false,
        name: None,
    }
}

async fn group_count(db: &Database) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM study_groups")
        .fetch_one(&db.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn builds_group_from_eligible_suggestions() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let me = seed_user(&db, "Me", &["CS 31"]).await;
    let peer_a = seed_user(&db, "A", &["cs31"]).await;
    let peer_b = seed_user(&db, "B", &["CS 31", "MATH 61"]).await;
    let off_course = seed_user(&db, "C", &["HIST 1"]).await;

    let suggester = Arc::new(StubSuggester::picking(vec![
        peer_b.clone(),
        off_course,
        "ghost".to_string(),
        me.clone(),
        peer_b.clone(),
        peer_a.clone(),
    ]));
    let planner = AiGroupPlanner::new(Arc::new(groups), suggester.clone(), 3600);

    let created = planner.create_ai_group(&me, request("cs 31", 3)).await.unwrap();
    assert_eq!(created.group.group.name, "CS 31 AI Study Group");
    assert_eq!(created.group.group.creator_id, me);
    assert_eq!(created.group.group.members, vec![me.clone(), peer_b, peer_a]);
    assert!(!created.group.group.is_public);
    assert_eq!(created.rationale, "shared schedule");
    assert_eq!(suggester.call_count(), 1);
}

#[tokio::test]
async fn suggestion_failure_creates_nothing() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let me = seed_user(&db, "Me", &["CS 31"]).await;
    seed_user(&db, "A", &["CS 31"]).await;

    let planner = AiGroupPlanner::new(Arc::new(groups), Arc::new(StubSuggester::failing()), 3600);
    let err = planner.create_ai_group(&me, request("CS 31", 4)).await.unwrap_err();
    assert!(matches!(err, ServiceError::ExternalService(_)));
    assert_eq!(group_count(&db).await, 0);
}

#[tokio::test]
async fn suggestion_without_eligible_ids_creates_nothing() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let me = seed_user(&db, "Me", &["CS 31"]).await;
    seed_user(&db, "A", &["CS 31"]).await;

    let suggester = StubSuggester::new(|_| {
        Ok(Suggestion {
            member_ids: vec!["made-up".to_string()],
            rationale: String::new(),
        })
    });
    let planner = AiGroupPlanner::new(Arc::new(groups), Arc::new(suggester), 3600);
    let err = planner.create_ai_group(&me, request("CS 31", 4)).await.unwrap_err();
    assert!(matches!(err, ServiceError::ExternalService(_)));
    assert_eq!(group_count(&db).await, 0);
}

/// Picks every candidate, then deletes them before answering.
struct VanishingSuggester {
    db: Arc<Database>,
}

#[async_trait]
impl MemberSuggester for VanishingSuggester {
    async fn suggest_members(
        &self,
        _course: &CourseCode,
        _requester: &User,
        candidates: &[User],
        _count: usize,
    ) -> ServiceResult<Suggestion> {
        for user in candidates {
            delete_user_row(&self.db, &user.id).await;
        }
        Ok(Suggestion {
            member_ids: candidates.iter().map(|u| u.id.clone()).collect(),
            rationale: "all free on Fridays".to_string(),
        })
    }
}

#[tokio::test]
async fn members_deleted_mid_suggestion_create_nothing() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let me = seed_user(&db, "Me", &["CS 31"]).await;
    seed_user(&db, "A", &["CS 31"]).await;
    seed_user(&db, "B", &["CS 31"]).await;

    let suggester = Arc::new(VanishingSuggester { db: db.clone() });
    let planner = AiGroupPlanner::new(Arc::new(groups), suggester, 3600);
    let err = planner.create_ai_group(&me, request("CS 31", 4)).await.unwrap_err();
    assert!(matches!(err, ServiceError::ExternalService(_)), "{:?}", err);
    assert_eq!(group_count(&db).await, 0);

    // No cooldown is recorded for an attempt that created nothing
    let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_group_requests")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(logged, 0);
}

#[tokio::test]
async fn cooldown_applies_per_course() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let me = seed_user(&db, "Me", &["CS 31", "MATH 61"]).await;
    seed_user(&db, "A", &["CS 31", "MATH 61"]).await;

    let suggester = Arc::new(StubSuggester::new(|pool| {
        Ok(Suggestion {
            member_ids: pool.iter().map(|u| u.id.clone()).collect(),
            rationale: "everyone".to_string(),
        })
    }));
    let planner = AiGroupPlanner::new(Arc::new(groups), suggester.clone(), 3600);

    planner.create_ai_group(&me, request("CS 31", 2)).await.unwrap();
    let err = planner.create_ai_group(&me, request("cs31", 2)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(suggester.call_count(), 1);

    planner.create_ai_group(&me, request("MATH 61", 2)).await.unwrap();
    assert_eq!(group_count(&db).await, 2);
}

#[tokio::test]
async fn zero_cooldown_allows_repeats() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let me = seed_user(&db, "Me", &["CS 31"]).await;
    let a = seed_user(&db, "A", &["CS 31"]).await;

    let planner = AiGroupPlanner::new(Arc::new(groups), Arc::new(StubSuggester::picking(vec![a])), 0);
    planner.create_ai_group(&me, request("CS 31", 2)).await.unwrap();
    planner.create_ai_group(&me, request("CS 31", 2)).await.unwrap();
    assert_eq!(group_count(&db).await, 2);
}

#[tokio::test]
async fn empty_pool_and_bad_input() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let me = seed_user(&db, "Me", &["CS 31"]).await;
    let suggester = Arc::new(StubSuggester::picking(vec![]));
    let planner = AiGroupPlanner::new(Arc::new(groups), suggester.clone(), 3600);

    let err = planner.create_ai_group(&me, request("CS 31", 3)).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    let err = planner.create_ai_group(&me, request(" ", 3)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    let err = planner.create_ai_group(&me, request("CS 31", 25)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    assert_eq!(suggester.call_count(), 0);
}
