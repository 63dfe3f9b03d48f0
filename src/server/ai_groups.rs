//! Study groups whose roster is proposed by the suggestion service.

use crate::common::course::CourseCode;
use crate::common::models::{AiGroup, AiGroupRequest, GroupView, MemberSummary, UserId};
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::groups::{self, GroupDraft, GroupService};
use crate::server::suggestions::MemberSuggester;
use crate::server::users;
use log::{info, warn};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::sync::Arc;

pub struct AiGroupPlanner {
    groups: Arc<GroupService>,
    suggester: Arc<dyn MemberSuggester>,
    cooldown_secs: i64,
}

impl AiGroupPlanner {
    pub fn new(groups: Arc<GroupService>, suggester: Arc<dyn MemberSuggester>, cooldown_secs: i64) -> Self {
        Self {
            groups,
            suggester,
            cooldown_secs,
        }
    }

    /// Build a group for `course` from the suggested peers. Nothing is stored
    /// unless the suggestion yields at least one eligible member.
    pub async fn create_ai_group(&self, requester_id: &str, request: AiGroupRequest) -> ServiceResult<AiGroup> {
        let course = CourseCode::parse(&request.course);
        if course.is_empty() {
            return Err(ServiceError::Validation("Course is required".to_string()));
        }
        groups::validate_max_members(request.max_members)?;
        let name = match request.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => groups::validate_group_name(name)?,
            None => format!("{} AI Study Group", course),
        };

        let db = self.groups.database();
        let requester = users::find_by_id(db, requester_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;
        {
            let mut conn = db.pool.acquire().await?;
            self.check_cooldown(&mut *conn, requester_id, &course).await?;
        }

        let candidates = users::find_by_course_membership(db, std::slice::from_ref(&course), requester_id).await?;
        if candidates.is_empty() {
            return Err(ServiceError::NotFound(format!("No other students are taking {}", course)));
        }

        let wanted = (request.max_members - 1) as usize;
        info!(
            "[AI] Requesting {} members for {} from a pool of {} (requester {})",
            wanted,
            course,
            candidates.len(),
            requester_id
        );
        let suggestion = self
            .suggester
            .suggest_members(&course, &requester, &candidates, wanted)
            .await?;

        let eligible: HashSet<&str> = candidates.iter().map(|u| u.id.as_str()).collect();
        let mut seen = HashSet::new();
        let chosen: Vec<UserId> = suggestion
            .member_ids
            .into_iter()
            .filter(|id| eligible.contains(id.as_str()) && seen.insert(id.clone()))
            .take(wanted)
            .collect();
        if chosen.is_empty() {
            warn!("[AI] Suggestion for {} named no eligible students", course);
            return Err(ServiceError::ExternalService(
                "The suggestion did not name any eligible students".to_string(),
            ));
        }

        let mut roster = Vec::with_capacity(chosen.len() + 1);
        roster.push(requester.id.clone());
        roster.extend(chosen);

        let mut tx = db.begin_write().await?;
        self.check_cooldown(&mut *tx, requester_id, &course).await?;
        // Members deleted while the suggestion was in flight are dropped here
        let members = users::fetch_users(&mut *tx, &roster).await?;
        if !members.iter().any(|u| u.id == requester.id) {
            return Err(ServiceError::NotFound("User not found".to_string()));
        }
        if members.len() < 2 {
            warn!("[AI] Every suggested member for {} is gone; no group created", course);
            return Err(ServiceError::ExternalService(
                "None of the suggested students is still available".to_string(),
            ));
        }
        let group = groups::insert_group(
            &mut *tx,
            GroupDraft {
                name,
                creator_id: requester.id.clone(),
                course: course.clone(),
                max_members: request.max_members,
                is_public: request.is_public,
                members: members.iter().map(|u| u.id.clone()).collect(),
            },
        )
        .await?;
        sqlx::query("INSERT INTO ai_group_requests (user_id, course_code, group_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(requester_id)
            .bind(course.as_str())
            .bind(&group.id)
            .bind(group.created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            "[AI] Created group {} for {} with {} members",
            group.id,
            course,
            group.members.len()
        );
        let member_names = members
            .into_iter()
            .map(|u| MemberSummary { id: u.id, name: u.name })
            .collect();
        Ok(AiGroup {
            group: GroupView { group, member_names },
            rationale: suggestion.rationale,
        })
    }

    async fn check_cooldown(&self, conn: &mut SqliteConnection, user_id: &str, course: &CourseCode) -> ServiceResult<()> {
        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM ai_group_requests WHERE user_id = ? AND course_code = ?",
        )
        .bind(user_id)
        .bind(course.as_str())
        .fetch_one(&mut *conn)
        .await?;
        let now = chrono::Utc::now().timestamp();
        match last {
            Some(at) if now - at < self.cooldown_secs => Err(ServiceError::Conflict(format!(
                "An AI group for {} was already created recently; try again in {} minutes",
                course,
                (self.cooldown_secs - (now - at) + 59) / 60
            ))),
            _ => Ok(()),
        }
    }
}
