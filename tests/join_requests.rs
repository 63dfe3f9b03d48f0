mod common;

use common::*;
use peerlink::common::models::{MembershipChange, RequestStatus};
use peerlink::server::error::ServiceError;

#[tokio::test]
async fn private_group_request_accept_then_full() {
    let db = test_db().await;
    let (groups, notifier) = service(&db);
    let u1 = seed_user(&db, "U1", &[]).await;
    let u2 = seed_user(&db, "U2", &[]).await;
    let u3 = seed_user(&db, "U3", &[]).await;
    let g = groups
        .create_group(&u1, new_group("G", "CS 31", 2, false, &[]))
        .await
        .unwrap()
        .group;

    let req = groups.request_join(&g.id, &u2, Some("  hi  ")).await.unwrap();
    assert_eq!(req.status, RequestStatus::Pending);
    assert_eq!(req.user_name, "U2");
    assert_eq!(req.message.as_deref(), Some("hi"));

    let after = groups.accept_request(&g.id, &u1, &req.id).await.unwrap();
    assert_eq!(after.members, vec![u1.clone(), u2.clone()]);

    let err = groups.request_join(&g.id, &u3, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)), "{:?}", err);

    let events = notifier.wait_for(1).await;
    assert_eq!(events[0].1, MembershipChange::RequestAccepted);
    assert_eq!(events[0].2, "U2");
}

#[tokio::test]
async fn duplicate_pending_request_is_a_conflict() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let owner = seed_user(&db, "Owner", &[]).await;
    let asker = seed_user(&db, "Asker", &[]).await;
    let g = groups
        .create_group(&owner, new_group("G", "CS 31", 4, false, &[]))
        .await
        .unwrap()
        .group;

    groups.request_join(&g.id, &asker, None).await.unwrap();
    let err = groups.request_join(&g.id, &asker, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(groups.user_requests(&asker).await.unwrap().len(), 1);
}

#[tokio::test]
async fn request_join_preconditions() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let owner = seed_user(&db, "Owner", &[]).await;
    let asker = seed_user(&db, "Asker", &[]).await;
    let public = groups
        .create_group(&owner, new_group("Open", "CS 31", 4, true, &[]))
        .await
        .unwrap()
        .group;
    let private = groups
        .create_group(&owner, new_group("Closed", "CS 31", 4, false, &[]))
        .await
        .unwrap()
        .group;

    let err = groups.request_join(&public.id, &asker, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    let err = groups.request_join(&private.id, &owner, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    let err = groups.request_join("missing", &asker, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn rejected_request_can_be_refiled() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let owner = seed_user(&db, "Owner", &[]).await;
    let asker = seed_user(&db, "Asker", &[]).await;
    let g = groups
        .create_group(&owner, new_group("G", "CS 31", 4, false, &[]))
        .await
        .unwrap()
        .group;

    let first = groups.request_join(&g.id, &asker, None).await.unwrap();
    let rejected = groups.reject_request(&g.id, &owner, &first.id).await.unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert!(rejected.responded_at.is_some());

    let err = groups.reject_request(&g.id, &owner, &first.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    let err = groups.accept_request(&g.id, &owner, &first.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let second = groups.request_join(&g.id, &asker, None).await.unwrap();
    assert_ne!(second.id, first.id);
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM join_requests WHERE group_id = ? AND user_id = ?")
        .bind(&g.id)
        .bind(&asker)
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn only_the_creator_answers_and_lists_requests() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let owner = seed_user(&db, "Owner", &[]).await;
    let member = seed_user(&db, "Member", &[]).await;
    let asker = seed_user(&db, "Asker", &[]).await;
    let g = groups
        .create_group(&owner, new_group("G", "CS 31", 4, false, &[&member]))
        .await
        .unwrap()
        .group;
    let other = groups
        .create_group(&owner, new_group("Other", "CS 31", 4, false, &[]))
        .await
        .unwrap()
        .group;
    let req = groups.request_join(&g.id, &asker, None).await.unwrap();

    let err = groups.accept_request(&g.id, &member, &req.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied(_)));
    let err = groups.reject_request(&g.id, &member, &req.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied(_)));
    let err = groups.group_requests(&g.id, &member).await.unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied(_)));

    // A request id from another group is not found in this one
    let err = groups.accept_request(&other.id, &owner, &req.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    let err = groups.accept_request(&g.id, &owner, "nope").await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    let pending = groups.group_requests(&g.id, &owner).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, req.id);
}

#[tokio::test]
async fn capacity_is_rechecked_when_accepting() {
    let db = test_db().await;
    let (groups, _) = service(&db);
    let owner = seed_user(&db, "Owner", &[]).await;
    let first = seed_user(&db, "First", &[]).await;
    let second = seed_user(&db, "Second", &[]).await;
    let g = groups
        .create_group(&owner, new_group("Tight", "CS 31", 2, false, &[]))
        .await
        .unwrap()
        .group;

    let r1 = groups.request_join(&g.id, &first, None).await.unwrap();
    let r2 = groups.request_join(&g.id, &second, None).await.unwrap();
    groups.accept_request(&g.id, &owner, &r1.id).await.unwrap();

    let err = groups.accept_request(&g.id, &owner, &r2.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::CapacityExceeded(_)), "{:?}", err);
    let pending = groups.group_requests(&g.id, &owner).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, RequestStatus::Pending);
}
