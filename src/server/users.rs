//! User directory: lookups by id and by course membership, profile edits.

use crate::common::course::CourseCode;
use crate::common::models::{ProfileUpdate, User, UserId};
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use log::info;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{HashMap, HashSet};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    name: String,
    email: String,
    availability: Option<String>,
    year: Option<String>,
    bio: Option<String>,
    image_url: Option<String>,
    created_at: i64,
}

impl UserRow {
    fn into_user(self, courses_seeking: Vec<CourseCode>) -> User {
        User {
            id: self.id,
            name: self.name,
            email: self.email,
            courses_seeking,
            availability: self.availability,
            year: self.year,
            bio: self.bio,
            image_url: self.image_url,
            created_at: self.created_at,
        }
    }
}

const USER_COLUMNS: &str = "id, name, email, availability, year, bio, image_url, created_at";

/// Normalize a course list for storage: blank labels are rejected and
/// duplicates (after normalization) collapse to their first occurrence.
pub fn normalize_course_list(raw: &[String]) -> ServiceResult<Vec<CourseCode>> {
    let mut seen = HashSet::new();
    let mut courses = Vec::with_capacity(raw.len());
    for label in raw {
        let code = CourseCode::parse(label);
        if code.is_empty() {
            return Err(ServiceError::Validation("Course codes cannot be blank".to_string()));
        }
        if seen.insert(code.clone()) {
            courses.push(code);
        }
    }
    Ok(courses)
}

pub async fn find_by_id(db: &Database, user_id: &str) -> ServiceResult<Option<User>> {
    let mut conn = db.pool.acquire().await?;
    fetch_user(&mut *conn, user_id).await
}

/// Every user except `exclude_id` seeking at least one of `courses`, in
/// registration order.
pub async fn find_by_course_membership(
    db: &Database,
    courses: &[CourseCode],
    exclude_id: &str,
) -> ServiceResult<Vec<User>> {
    if courses.is_empty() {
        return Ok(Vec::new());
    }
    let mut conn = db.pool.acquire().await?;

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM users u WHERE u.id != ",
        USER_COLUMNS
    ));
    qb.push_bind(exclude_id.to_string());
    qb.push(" AND EXISTS (SELECT 1 FROM user_courses c WHERE c.user_id = u.id AND c.course_code IN (");
    let mut separated = qb.separated(", ");
    for course in courses {
        separated.push_bind(course.as_str().to_string());
    }
    separated.push_unseparated(")) ORDER BY u.created_at, u.rowid");

    let rows: Vec<UserRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
    attach_courses(&mut *conn, rows).await
}

pub async fn update_profile(db: &Database, user_id: &str, update: ProfileUpdate) -> ServiceResult<User> {
    if let Some(name) = &update.name {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("Name cannot be empty".to_string()));
        }
    }
    let courses = match &update.courses {
        Some(raw) => Some(normalize_course_list(raw)?),
        None => None,
    };

    let mut tx = db.begin_write().await?;
    if fetch_user(&mut *tx, user_id).await?.is_none() {
        return Err(ServiceError::NotFound("User not found".to_string()));
    }

    sqlx::query(
        "UPDATE users SET
            name = COALESCE(?, name),
            availability = COALESCE(?, availability),
            year = COALESCE(?, year),
            bio = COALESCE(?, bio),
            image_url = COALESCE(?, image_url)
         WHERE id = ?",
    )
    .bind(update.name.as_deref().map(str::trim))
    .bind(update.availability.as_deref())
    .bind(update.year.as_deref())
    .bind(update.bio.as_deref())
    .bind(update.image_url.as_deref())
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    if let Some(courses) = &courses {
        replace_courses(&mut *tx, user_id, courses).await?;
    }

    let user = fetch_user(&mut *tx, user_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;
    tx.commit().await?;
    info!("[USERS] Updated profile of user {}", user_id);
    Ok(user)
}

pub(crate) async fn fetch_user(conn: &mut SqliteConnection, user_id: &str) -> ServiceResult<Option<User>> {
    let row: Option<UserRow> = sqlx::query_as(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(attach_courses(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

pub(crate) async fn fetch_user_by_email(conn: &mut SqliteConnection, email: &str) -> ServiceResult<Option<User>> {
    let row: Option<UserRow> = sqlx::query_as(&format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS))
        .bind(email)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(attach_courses(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

pub(crate) async fn fetch_users(conn: &mut SqliteConnection, user_ids: &[UserId]) -> ServiceResult<Vec<User>> {
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {} FROM users WHERE id IN (", USER_COLUMNS));
    let mut separated = qb.separated(", ");
    for id in user_ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    let rows: Vec<UserRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
    let users = attach_courses(conn, rows).await?;

    let mut by_id: HashMap<String, User> = users.into_iter().map(|u| (u.id.clone(), u)).collect();
    Ok(user_ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// Replace the stored course list of a user with already-normalized codes.
pub(crate) async fn replace_courses(
    conn: &mut SqliteConnection,
    user_id: &str,
    courses: &[CourseCode],
) -> ServiceResult<()> {
    sqlx::query("DELETE FROM user_courses WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    for (position, course) in courses.iter().enumerate() {
        sqlx::query("INSERT OR IGNORE INTO user_courses (user_id, course_code, position) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(course.as_str())
            .bind(position as i64)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn attach_courses(conn: &mut SqliteConnection, rows: Vec<UserRow>) -> ServiceResult<Vec<User>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT user_id, course_code FROM user_courses WHERE user_id IN (");
    let mut separated = qb.separated(", ");
    for row in &rows {
        separated.push_bind(row.id.clone());
    }
    separated.push_unseparated(") ORDER BY user_id, position");
    let pairs: Vec<(String, String)> = qb.build_query_as().fetch_all(&mut *conn).await?;

    let mut courses: HashMap<String, Vec<CourseCode>> = HashMap::new();
    for (user_id, code) in pairs {
        courses.entry(user_id).or_default().push(CourseCode::from_stored(code));
    }
    Ok(rows
        .into_iter()
        .map(|row| {
            let list = courses.remove(&row.id).unwrap_or_default();
            row.into_user(list)
        })
        .collect())
}
