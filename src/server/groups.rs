//! Study group lifecycle: creation, membership, ownership and visibility.
//!
//! Every transition runs in one transaction. Capacity is guarded by a
//! conditional insert that only adds a member while the roster is below
//! `max_members`, so concurrent joins cannot overfill a group.

use crate::common::course::CourseCode;
use crate::common::models::{
    GroupView, LeaveOutcome, MemberSummary, MembershipChange, NewGroup, StudyGroup, UserId,
};
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::notifications::{self, MembershipNotifier};
use crate::server::users;
use log::{info, warn};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::sync::Arc;

pub const MIN_GROUP_SIZE: u32 = 2;
pub const MAX_GROUP_SIZE: u32 = 20;
pub const MAX_GROUP_NAME_LEN: usize = 50;

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    creator_id: String,
    max_members: i64,
    is_public: bool,
    created_at: i64,
}

pub(crate) struct GroupDraft {
    pub name: String,
    pub creator_id: UserId,
    pub course: CourseCode,
    pub max_members: u32,
    pub is_public: bool,
    /// Full roster, creator first.
    pub members: Vec<UserId>,
}

pub struct GroupService {
    db: Arc<Database>,
    notifier: Arc<dyn MembershipNotifier>,
}

impl GroupService {
    pub fn new(db: Arc<Database>, notifier: Arc<dyn MembershipNotifier>) -> Self {
        Self { db, notifier }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub(crate) fn announce(&self, group_id: &str, kind: MembershipChange, actor_name: &str) {
        notifications::dispatch(&self.notifier, group_id, kind, actor_name);
    }

    pub async fn create_group(&self, creator_id: &str, new_group: NewGroup) -> ServiceResult<GroupView> {
        let name = validate_group_name(&new_group.name)?;
        let course = CourseCode::parse(&new_group.course);
        if creator_id.trim().is_empty() || course.is_empty() {
            return Err(ServiceError::Validation("Missing required fields".to_string()));
        }
        validate_max_members(new_group.max_members)?;

        let mut seen = HashSet::new();
        let invitees: Vec<UserId> = new_group
            .invitees
            .into_iter()
            .filter(|id| id != creator_id && seen.insert(id.clone()))
            .collect();
        if 1 + invitees.len() > new_group.max_members as usize {
            return Err(ServiceError::CapacityExceeded(format!(
                "A group of at most {} members cannot hold the creator and {} invitees",
                new_group.max_members,
                invitees.len()
            )));
        }

        let mut roster = Vec::with_capacity(invitees.len() + 1);
        roster.push(creator_id.to_string());
        roster.extend(invitees);

        let mut tx = self.db.begin_write().await?;
        let users = users::fetch_users(&mut *tx, &roster).await?;
        if let Some(missing) = roster.iter().find(|id| !users.iter().any(|u| &u.id == *id)) {
            return Err(ServiceError::NotFound(format!("User {} not found", missing)));
        }

        let group = insert_group(
            &mut *tx,
            GroupDraft {
                name,
                creator_id: creator_id.to_string(),
                course,
                max_members: new_group.max_members,
                is_public: new_group.is_public,
                members: roster,
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            "[GROUPS] Group '{}' created with id {} by {} ({} members)",
            group.name,
            group.id,
            creator_id,
            group.members.len()
        );
        let member_names = users
            .into_iter()
            .map(|u| MemberSummary { id: u.id, name: u.name })
            .collect();
        Ok(GroupView { group, member_names })
    }

    /// Fetch a group with its roster resolved. Members that no longer exist
    /// in the user directory are pruned and the cleaned roster is persisted.
    pub async fn get_group(&self, group_id: &str) -> ServiceResult<GroupView> {
        let mut tx = self.db.begin_write().await?;
        let group = require_group(&mut *tx, group_id).await?;
        let view = resolve_view(&mut *tx, group).await?;
        tx.commit().await?;
        view.ok_or_else(group_not_found)
    }

    /// Groups the user belongs to, newest first.
    pub async fn list_user_groups(&self, user_id: &str) -> ServiceResult<Vec<GroupView>> {
        let mut tx = self.db.begin_write().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT g.id FROM study_groups g JOIN group_members m ON g.id = m.group_id
             WHERE m.user_id = ? ORDER BY g.created_at DESC, g.rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        let views = resolve_all(&mut *tx, &ids).await?;
        tx.commit().await?;
        Ok(views)
    }

    /// Groups studying the given course, newest first.
    pub async fn list_course_groups(&self, course: &str) -> ServiceResult<Vec<GroupView>> {
        let course = CourseCode::parse(course);
        if course.is_empty() {
            return Err(ServiceError::Validation("Course is required".to_string()));
        }
        let mut tx = self.db.begin_write().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT g.id FROM study_groups g JOIN group_courses c ON g.id = c.group_id
             WHERE c.course_code = ? ORDER BY g.created_at DESC, g.rowid DESC",
        )
        .bind(course.as_str())
        .fetch_all(&mut *tx)
        .await?;
        let views = resolve_all(&mut *tx, &ids).await?;
        tx.commit().await?;
        info!("[GROUPS] Found {} groups for course {}", views.len(), course);
        Ok(views)
    }

    pub async fn join_group(&self, group_id: &str, user_id: &str) -> ServiceResult<StudyGroup> {
        let mut tx = self.db.begin_write().await?;
        let group = require_group(&mut *tx, group_id).await?;
        if group.is_member(user_id) {
            return Err(ServiceError::Conflict("User already in group".to_string()));
        }
        if group.is_full() {
            return Err(ServiceError::CapacityExceeded("Group is full".to_string()));
        }
        if !group.is_public {
            return Err(ServiceError::PermissionDenied(
                "This group is private; send a join request instead".to_string(),
            ));
        }
        let user = users::fetch_user(&mut *tx, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

        if !try_add_member(&mut *tx, group_id, user_id).await? {
            return Err(classify_rejected_add(&mut *tx, group_id, user_id).await);
        }
        let group = require_group(&mut *tx, group_id).await?;
        tx.commit().await?;

        info!("[GROUPS] User {} joined group {}", user_id, group_id);
        self.announce(group_id, MembershipChange::Joined, &user.name);
        Ok(group)
    }

    pub async fn leave_group(&self, group_id: &str, user_id: &str) -> ServiceResult<LeaveOutcome> {
        let mut tx = self.db.begin_write().await?;
        let group = require_group(&mut *tx, group_id).await?;
        if !group.is_member(user_id) {
            return Err(ServiceError::Conflict("User is not in this group".to_string()));
        }
        let actor = actor_name(&mut *tx, user_id).await?;

        remove_member(&mut *tx, group_id, user_id).await?;
        // A departed user's outstanding request is no longer meaningful
        sqlx::query("DELETE FROM join_requests WHERE group_id = ? AND user_id = ? AND status = 'pending'")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let remaining: Vec<&UserId> = group.members.iter().filter(|m| *m != user_id).collect();
        let Some(heir) = remaining.first() else {
            purge_group(&mut *tx, group_id).await?;
            tx.commit().await?;
            info!("[GROUPS] Last member {} left group {}; group deleted", user_id, group_id);
            return Ok(LeaveOutcome::Deleted { group_id: group_id.to_string() });
        };

        let kind = if group.creator_id == user_id {
            sqlx::query("UPDATE study_groups SET creator_id = ? WHERE id = ?")
                .bind(heir.as_str())
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
            info!("[GROUPS] Ownership of group {} transferred from {} to {}", group_id, user_id, heir);
            MembershipChange::OwnershipTransferred
        } else {
            MembershipChange::Left
        };
        let group = require_group(&mut *tx, group_id).await?;
        tx.commit().await?;

        info!("[GROUPS] User {} left group {}", user_id, group_id);
        self.announce(group_id, kind, &actor);
        Ok(LeaveOutcome::Remaining { group })
    }

    pub async fn kick_member(&self, group_id: &str, caller_id: &str, target_id: &str) -> ServiceResult<StudyGroup> {
        let mut tx = self.db.begin_write().await?;
        let group = require_group(&mut *tx, group_id).await?;
        if group.creator_id != caller_id {
            return Err(ServiceError::PermissionDenied(
                "Only the group creator can remove members".to_string(),
            ));
        }
        if target_id == group.creator_id {
            return Err(ServiceError::Validation(
                "The creator cannot be removed; leave the group to transfer ownership".to_string(),
            ));
        }
        if !group.is_member(target_id) {
            return Err(ServiceError::NotFound("User is not a member of this group".to_string()));
        }
        let actor = actor_name(&mut *tx, target_id).await?;
        remove_member(&mut *tx, group_id, target_id).await?;
        let group = require_group(&mut *tx, group_id).await?;
        tx.commit().await?;

        info!("[GROUPS] User {} removed from group {} by {}", target_id, group_id, caller_id);
        self.announce(group_id, MembershipChange::Kicked, &actor);
        Ok(group)
    }

    pub async fn rename_group(&self, group_id: &str, caller_id: &str, new_name: &str) -> ServiceResult<StudyGroup> {
        let mut tx = self.db.begin_write().await?;
        let group = require_group(&mut *tx, group_id).await?;
        if !group.is_member(caller_id) {
            return Err(ServiceError::PermissionDenied(
                "Only group members can rename the group".to_string(),
            ));
        }
        let name = validate_group_name(new_name)?;
        sqlx::query("UPDATE study_groups SET name = ? WHERE id = ?")
            .bind(&name)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let actor = actor_name(&mut *tx, caller_id).await?;
        let group = require_group(&mut *tx, group_id).await?;
        tx.commit().await?;

        info!("[GROUPS] Group {} renamed to '{}' by {}", group_id, name, caller_id);
        self.announce(group_id, MembershipChange::Renamed, &actor);
        Ok(group)
    }

    pub async fn toggle_visibility(&self, group_id: &str, caller_id: &str) -> ServiceResult<StudyGroup> {
        let mut tx = self.db.begin_write().await?;
        let group = require_group(&mut *tx, group_id).await?;
        if group.creator_id != caller_id {
            return Err(ServiceError::PermissionDenied(
                "Only the group creator can change visibility".to_string(),
            ));
        }
        sqlx::query("UPDATE study_groups SET is_public = NOT is_public WHERE id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let group = require_group(&mut *tx, group_id).await?;
        tx.commit().await?;
        info!(
            "[GROUPS] Group {} is now {}",
            group_id,
            if group.is_public { "public" } else { "private" }
        );
        Ok(group)
    }

    pub async fn delete_group(&self, group_id: &str, caller_id: &str) -> ServiceResult<()> {
        let mut tx = self.db.begin_write().await?;
        let group = require_group(&mut *tx, group_id).await?;
        if group.creator_id != caller_id {
            return Err(ServiceError::PermissionDenied(
                "Only the group creator can delete the group".to_string(),
            ));
        }
        purge_group(&mut *tx, group_id).await?;
        tx.commit().await?;
        info!("[GROUPS] Group {} deleted by {}", group_id, caller_id);
        Ok(())
    }
}

pub fn validate_group_name(raw: &str) -> ServiceResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation("Group name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_GROUP_NAME_LEN {
        return Err(ServiceError::Validation(format!(
            "Group name must be at most {} characters",
            MAX_GROUP_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

pub fn validate_max_members(max_members: u32) -> ServiceResult<()> {
    if !(MIN_GROUP_SIZE..=MAX_GROUP_SIZE).contains(&max_members) {
        return Err(ServiceError::Validation(format!(
            "maxMembers must be between {} and {}",
            MIN_GROUP_SIZE, MAX_GROUP_SIZE
        )));
    }
    Ok(())
}

pub(crate) fn group_not_found() -> ServiceError {
    ServiceError::NotFound("Study group not found".to_string())
}

pub(crate) async fn load_group(conn: &mut SqliteConnection, group_id: &str) -> ServiceResult<Option<StudyGroup>> {
    let row: Option<GroupRow> = sqlx::query_as(
        "SELECT id, name, creator_id, max_members, is_public, created_at FROM study_groups WHERE id = ?",
    )
    .bind(group_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let courses: Vec<String> =
        sqlx::query_scalar("SELECT course_code FROM group_courses WHERE group_id = ? ORDER BY position")
            .bind(group_id)
            .fetch_all(&mut *conn)
            .await?;
    let members: Vec<String> =
        sqlx::query_scalar("SELECT user_id FROM group_members WHERE group_id = ? ORDER BY position")
            .bind(group_id)
            .fetch_all(&mut *conn)
            .await?;

    Ok(Some(StudyGroup {
        id: row.id,
        name: row.name,
        creator_id: row.creator_id,
        courses: courses.into_iter().map(CourseCode::from_stored).collect(),
        max_members: row.max_members as u32,
        members,
        is_public: row.is_public,
        created_at: row.created_at,
    }))
}

pub(crate) async fn require_group(conn: &mut SqliteConnection, group_id: &str) -> ServiceResult<StudyGroup> {
    load_group(conn, group_id).await?.ok_or_else(group_not_found)
}

pub(crate) async fn insert_group(conn: &mut SqliteConnection, draft: GroupDraft) -> ServiceResult<StudyGroup> {
    let group_id = uuid::Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO study_groups (id, name, creator_id, max_members, is_public, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&group_id)
    .bind(&draft.name)
    .bind(&draft.creator_id)
    .bind(draft.max_members as i64)
    .bind(draft.is_public)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO group_courses (group_id, course_code, position) VALUES (?, ?, 0)")
        .bind(&group_id)
        .bind(draft.course.as_str())
        .execute(&mut *conn)
        .await?;

    for (position, member) in draft.members.iter().enumerate() {
        sqlx::query("INSERT INTO group_members (group_id, user_id, position, joined_at) VALUES (?, ?, ?, ?)")
            .bind(&group_id)
            .bind(member)
            .bind(position as i64)
            .bind(created_at)
            .execute(&mut *conn)
            .await?;
    }

    require_group(conn, &group_id).await
}

/// Append a member only while the roster is below capacity. Returns false
/// when the group is full, missing, or already contains the user.
pub(crate) async fn try_add_member(conn: &mut SqliteConnection, group_id: &str, user_id: &str) -> ServiceResult<bool> {
    let joined_at = chrono::Utc::now().timestamp();
    let res = sqlx::query(
        "INSERT OR IGNORE INTO group_members (group_id, user_id, position, joined_at)
         SELECT g.id, ?,
                (SELECT COALESCE(MAX(position), -1) + 1 FROM group_members WHERE group_id = g.id),
                ?
         FROM study_groups g
         WHERE g.id = ?
           AND (SELECT COUNT(*) FROM group_members WHERE group_id = g.id) < g.max_members",
    )
    .bind(user_id)
    .bind(joined_at)
    .bind(group_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Explain why [`try_add_member`] declined.
pub(crate) async fn classify_rejected_add(conn: &mut SqliteConnection, group_id: &str, user_id: &str) -> ServiceError {
    match load_group(conn, group_id).await {
        Ok(Some(group)) if group.is_member(user_id) => ServiceError::Conflict("User already in group".to_string()),
        Ok(Some(_)) => ServiceError::CapacityExceeded("Group is full".to_string()),
        Ok(None) => group_not_found(),
        Err(e) => e,
    }
}

pub(crate) async fn remove_member(conn: &mut SqliteConnection, group_id: &str, user_id: &str) -> ServiceResult<()> {
    sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete a group together with its roster, courses and join requests.
pub(crate) async fn purge_group(conn: &mut SqliteConnection, group_id: &str) -> ServiceResult<()> {
    for statement in [
        "DELETE FROM join_requests WHERE group_id = ?",
        "DELETE FROM group_members WHERE group_id = ?",
        "DELETE FROM group_courses WHERE group_id = ?",
        "DELETE FROM study_groups WHERE id = ?",
    ] {
        sqlx::query(statement).bind(group_id).execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn actor_name(conn: &mut SqliteConnection, user_id: &str) -> ServiceResult<String> {
    Ok(users::fetch_user(conn, user_id)
        .await?
        .map(|u| u.name)
        .unwrap_or_else(|| "Unknown User".to_string()))
}

async fn resolve_all(conn: &mut SqliteConnection, group_ids: &[String]) -> ServiceResult<Vec<GroupView>> {
    let mut views = Vec::with_capacity(group_ids.len());
    for id in group_ids {
        if let Some(group) = load_group(&mut *conn, id).await? {
            if let Some(view) = resolve_view(&mut *conn, group).await? {
                views.push(view);
            }
        }
    }
    Ok(views)
}

/// Attach member names, pruning ids that no longer resolve to a user.
/// Returns `None` when pruning left the group empty and it was deleted.
async fn resolve_view(conn: &mut SqliteConnection, mut group: StudyGroup) -> ServiceResult<Option<GroupView>> {
    let users = users::fetch_users(&mut *conn, &group.members).await?;

    if users.len() != group.members.len() {
        let known: HashSet<&str> = users.iter().map(|u| u.id.as_str()).collect();
        let stale: Vec<UserId> = group
            .members
            .iter()
            .filter(|m| !known.contains(m.as_str()))
            .cloned()
            .collect();
        warn!("[GROUPS] Pruning {} unknown member(s) from group {}: {:?}", stale.len(), group.id, stale);
        for id in &stale {
            remove_member(&mut *conn, &group.id, id).await?;
        }
        group.members.retain(|m| known.contains(m.as_str()));

        if group.members.is_empty() {
            purge_group(&mut *conn, &group.id).await?;
            warn!("[GROUPS] Group {} had no remaining members and was deleted", group.id);
            return Ok(None);
        }
        if !group.is_member(&group.creator_id) {
            group.creator_id = group.members[0].clone();
            sqlx::query("UPDATE study_groups SET creator_id = ? WHERE id = ?")
                .bind(&group.creator_id)
                .bind(&group.id)
                .execute(&mut *conn)
                .await?;
            warn!("[GROUPS] Creator of group {} vanished; ownership moved to {}", group.id, group.creator_id);
        }
    }

    let member_names = users
        .into_iter()
        .map(|u| MemberSummary { id: u.id, name: u.name })
        .collect();
    Ok(Some(GroupView { group, member_names }))
}
