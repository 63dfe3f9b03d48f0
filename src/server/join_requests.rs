//! Join requests for private groups.

use crate::common::models::{JoinRequest, MembershipChange, RequestStatus, StudyGroup};
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::groups::{self, GroupService};
use crate::server::users;
use log::{info, warn};
use sqlx::SqliteConnection;

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    group_id: String,
    user_id: String,
    user_name: String,
    user_email: String,
    message: Option<String>,
    status: String,
    created_at: i64,
    responded_at: Option<i64>,
}

impl TryFrom<RequestRow> for JoinRequest {
    type Error = ServiceError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<RequestStatus>()
            .map_err(|e| ServiceError::Validation(format!("Corrupt join request {}: {}", row.id, e)))?;
        Ok(JoinRequest {
            id: row.id,
            group_id: row.group_id,
            user_id: row.user_id,
            user_name: row.user_name,
            user_email: row.user_email,
            message: row.message,
            status,
            created_at: row.created_at,
            responded_at: row.responded_at,
        })
    }
}

const REQUEST_COLUMNS: &str =
    "id, group_id, user_id, user_name, user_email, message, status, created_at, responded_at";

impl GroupService {
    pub async fn request_join(&self, group_id: &str, user_id: &str, message: Option<&str>) -> ServiceResult<JoinRequest> {
        let mut tx = self.database().begin_write().await?;
        let group = groups::require_group(&mut *tx, group_id).await?;
        if group.is_public {
            return Err(ServiceError::Validation(
                "This group is public; join it directly".to_string(),
            ));
        }
        if group.is_member(user_id) {
            return Err(ServiceError::Conflict("User already in group".to_string()));
        }
        if group.is_full() {
            return Err(ServiceError::Conflict("Group is full".to_string()));
        }
        let user = users::fetch_user(&mut *tx, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

        // Answered requests for this pair are history; drop them before filing anew
        sqlx::query("DELETE FROM join_requests WHERE group_id = ? AND user_id = ? AND status != 'pending'")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let request = JoinRequest {
            id: uuid::Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user.name,
            user_email: user.email,
            message: message.map(str::trim).filter(|m| !m.is_empty()).map(str::to_string),
            status: RequestStatus::Pending,
            created_at: chrono::Utc::now().timestamp(),
            responded_at: None,
        };
        let inserted = sqlx::query(
            "INSERT INTO join_requests (id, group_id, user_id, user_name, user_email, message, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(&request.group_id)
        .bind(&request.user_id)
        .bind(&request.user_name)
        .bind(&request.user_email)
        .bind(request.message.as_deref())
        .bind(request.status.as_str())
        .bind(request.created_at)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            if ServiceError::is_unique_violation(&e) {
                info!("[REQUESTS] Duplicate pending request from {} for group {}", user_id, group_id);
                return Err(ServiceError::Conflict(
                    "A join request for this group is already pending".to_string(),
                ));
            }
            return Err(e.into());
        }
        tx.commit().await?;

        info!("[REQUESTS] User {} requested to join group {} ({})", user_id, group_id, request.id);
        Ok(request)
    }

    pub async fn accept_request(&self, group_id: &str, caller_id: &str, request_id: &str) -> ServiceResult<StudyGroup> {
        let mut tx = self.database().begin_write().await?;
        let request = pending_request_for_creator(&mut *tx, group_id, caller_id, request_id).await?;

        if !groups::try_add_member(&mut *tx, group_id, &request.user_id).await? {
            let err = groups::classify_rejected_add(&mut *tx, group_id, &request.user_id).await;
            warn!("[REQUESTS] Could not accept request {}: {}", request_id, err);
            return Err(err);
        }
        mark_answered(&mut *tx, request_id, RequestStatus::Accepted).await?;
        let group = groups::require_group(&mut *tx, group_id).await?;
        tx.commit().await?;

        info!("[REQUESTS] Request {} accepted; {} joined group {}", request_id, request.user_id, group_id);
        self.announce(group_id, MembershipChange::RequestAccepted, &request.user_name);
        Ok(group)
    }

    pub async fn reject_request(&self, group_id: &str, caller_id: &str, request_id: &str) -> ServiceResult<JoinRequest> {
        let mut tx = self.database().begin_write().await?;
        let mut request = pending_request_for_creator(&mut *tx, group_id, caller_id, request_id).await?;
        let responded_at = mark_answered(&mut *tx, request_id, RequestStatus::Rejected).await?;
        tx.commit().await?;

        request.status = RequestStatus::Rejected;
        request.responded_at = Some(responded_at);
        info!("[REQUESTS] Request {} for group {} rejected", request_id, group_id);
        Ok(request)
    }

    /// Pending requests of a group, oldest first. Creator only.
    pub async fn group_requests(&self, group_id: &str, caller_id: &str) -> ServiceResult<Vec<JoinRequest>> {
        let mut conn = self.database().pool.acquire().await?;
        let group = groups::require_group(&mut *conn, group_id).await?;
        if group.creator_id != caller_id {
            return Err(ServiceError::PermissionDenied(
                "Only the group creator can view join requests".to_string(),
            ));
        }
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM join_requests WHERE group_id = ? AND status = 'pending' ORDER BY created_at, rowid",
            REQUEST_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(JoinRequest::try_from).collect()
    }

    /// The caller's own pending requests, newest first.
    pub async fn user_requests(&self, user_id: &str) -> ServiceResult<Vec<JoinRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM join_requests WHERE user_id = ? AND status = 'pending' ORDER BY created_at DESC, rowid DESC",
            REQUEST_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.database().pool)
        .await?;
        rows.into_iter().map(JoinRequest::try_from).collect()
    }
}

async fn fetch_request(conn: &mut SqliteConnection, request_id: &str) -> ServiceResult<Option<JoinRequest>> {
    let row: Option<RequestRow> = sqlx::query_as(&format!(
        "SELECT {} FROM join_requests WHERE id = ?",
        REQUEST_COLUMNS
    ))
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(JoinRequest::try_from).transpose()
}

/// Shared preconditions of accept and reject.
async fn pending_request_for_creator(
    conn: &mut SqliteConnection,
    group_id: &str,
    caller_id: &str,
    request_id: &str,
) -> ServiceResult<JoinRequest> {
    let group = groups::require_group(&mut *conn, group_id).await?;
    if group.creator_id != caller_id {
        return Err(ServiceError::PermissionDenied(
            "Only the group creator can answer join requests".to_string(),
        ));
    }
    let request = fetch_request(&mut *conn, request_id)
        .await?
        .filter(|r| r.group_id == group_id)
        .ok_or_else(|| ServiceError::NotFound("Join request not found".to_string()))?;
    if request.status != RequestStatus::Pending {
        return Err(ServiceError::Conflict(format!(
            "Join request was already {}",
            request.status
        )));
    }
    Ok(request)
}

async fn mark_answered(conn: &mut SqliteConnection, request_id: &str, status: RequestStatus) -> ServiceResult<i64> {
    let responded_at = chrono::Utc::now().timestamp();
    let res = sqlx::query("UPDATE join_requests SET status = ?, responded_at = ? WHERE id = ? AND status = 'pending'")
        .bind(status.as_str())
        .bind(responded_at)
        .bind(request_id)
        .execute(&mut *conn)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ServiceError::Conflict("Join request is no longer pending".to_string()));
    }
    Ok(responded_at)
}
