//! Races against a file database with a multi-connection pool.

mod common;

use common::*;
use peerlink::server::error::ServiceError;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_fill_exactly_to_capacity() {
    let store = file_db().await;
    let db = store.db.clone();
    let (groups, _) = service(&db);
    let groups = Arc::new(groups);
    let owner = seed_user(&db, "Owner", &[]).await;
    let group = groups
        .create_group(&owner, new_group("Race", "PHYSICS 1A", 5, true, &[]))
        .await
        .unwrap()
        .group;

    let mut racers = Vec::new();
    for i in 0..12 {
        racers.push(seed_user(&db, &format!("Racer {}", i), &[]).await);
    }
    let handles: Vec<_> = racers
        .into_iter()
        .map(|user| {
            let groups = groups.clone();
            let group_id = group.id.clone();
            tokio::spawn(async move { groups.join_group(&group_id, &user).await })
        })
        .collect();

    let (mut joined, mut full) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => joined += 1,
            Err(ServiceError::CapacityExceeded(_)) => full += 1,
            Err(e) => panic!("unexpected join failure: {:?}", e),
        }
    }
    assert_eq!(joined, 4);
    assert_eq!(full, 8);
    let view = groups.get_group(&group.id).await.unwrap();
    assert_eq!(view.group.members.len(), 5);
    assert_eq!(view.group.members[0], owner);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_requests_race_to_one_conflict() {
    let store = file_db().await;
    let db = store.db.clone();
    let (groups, _) = service(&db);
    let groups = Arc::new(groups);
    let owner = seed_user(&db, "Owner", &[]).await;
    let asker = seed_user(&db, "Asker", &[]).await;
    let group = groups
        .create_group(&owner, new_group("Quiet", "CS 33", 4, false, &[]))
        .await
        .unwrap()
        .group;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let groups = groups.clone();
            let group_id = group.id.clone();
            let asker = asker.clone();
            tokio::spawn(async move { groups.request_join(&group_id, &asker, Some("me too")).await })
        })
        .collect();

    let (mut filed, mut conflicts) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => filed += 1,
            Err(ServiceError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected request failure: {:?}", e),
        }
    }
    assert_eq!((filed, conflicts), (1, 1));
    assert_eq!(groups.group_requests(&group.id, &owner).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_respect_capacity() {
    let store = file_db().await;
    let db = store.db.clone();
    let (groups, _) = service(&db);
    let groups = Arc::new(groups);
    let owner = seed_user(&db, "Owner", &[]).await;
    let group = groups
        .create_group(&owner, new_group("Small", "CS 35L", 3, false, &[]))
        .await
        .unwrap()
        .group;

    let mut requests = Vec::new();
    for i in 0..5 {
        let user = seed_user(&db, &format!("Asker {}", i), &[]).await;
        requests.push(groups.request_join(&group.id, &user, None).await.unwrap().id);
    }
    let handles: Vec<_> = requests
        .into_iter()
        .map(|request_id| {
            let groups = groups.clone();
            let group_id = group.id.clone();
            let owner = owner.clone();
            tokio::spawn(async move { groups.accept_request(&group_id, &owner, &request_id).await })
        })
        .collect();

    let (mut accepted, mut full) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(ServiceError::CapacityExceeded(_)) => full += 1,
            Err(e) => panic!("unexpected accept failure: {:?}", e),
        }
    }
    assert_eq!((accepted, full), (2, 3));
    assert_eq!(groups.get_group(&group.id).await.unwrap().group.members.len(), 3);
}
