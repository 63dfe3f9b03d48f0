use crate::common::models::{NewUser, Session, User, UserId};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::users;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use log::{info, warn};
use rand::RngCore;
use sqlx::Row;

fn hash_password(password: &str, salt_length: u32) -> ServiceResult<String> {
    let mut salt_bytes = vec![0u8; salt_length as usize];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| ServiceError::Validation(format!("Invalid salt configuration: {}", e)))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServiceError::Validation(format!("Could not hash password: {}", e)))
}

fn verify_password(hash: &str, password: &str) -> bool {
    // The salt is embedded in the PHC string
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

fn generate_session_token() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{}-{:x}", uuid, md5::compute(random))
}

pub async fn register(db: &Database, new_user: NewUser, config: &ServerConfig) -> ServiceResult<User> {
    let name = new_user.name.trim();
    let email = new_user.email.trim().to_lowercase();
    if name.is_empty() || email.is_empty() || new_user.password.is_empty() {
        return Err(ServiceError::Validation("Name, email and password are required".to_string()));
    }
    if !email.contains('@') {
        return Err(ServiceError::Validation("Email address is not valid".to_string()));
    }
    let courses = users::normalize_course_list(&new_user.courses)?;
    let password_hash = hash_password(&new_user.password, config.argon2_salt_length)?;

    info!("[AUTH] Register attempt: {}", email);
    let user_id = uuid::Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().timestamp();

    let mut tx = db.begin_write().await?;
    let inserted = sqlx::query(
        "INSERT INTO users (id, name, email, availability, year, bio, image_url, created_at)
         VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
    )
    .bind(&user_id)
    .bind(name)
    .bind(&email)
    .bind(new_user.availability.as_deref())
    .bind(new_user.year.as_deref())
    .bind(new_user.bio.as_deref())
    .bind(created_at)
    .execute(&mut *tx)
    .await;
    if let Err(e) = inserted {
        if ServiceError::is_unique_violation(&e) {
            warn!("[AUTH] Registration refused for {}: email already registered", email);
            return Err(ServiceError::Conflict("Sorry, this email already exists".to_string()));
        }
        return Err(e.into());
    }

    users::replace_courses(&mut *tx, &user_id, &courses).await?;

    sqlx::query("INSERT INTO auth (user_id, password_hash) VALUES (?, ?)")
        .bind(&user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?;

    let user = users::fetch_user(&mut *tx, &user_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;
    tx.commit().await?;
    info!("[AUTH] Registered user {} (id={})", email, user_id);
    Ok(user)
}

/// Verify credentials and open a new session.
pub async fn login(db: &Database, email: &str, password: &str, config: &ServerConfig) -> ServiceResult<Session> {
    let email = email.trim().to_lowercase();
    info!("[AUTH] Login attempt: {}", email);

    let row = sqlx::query("SELECT users.id, auth.password_hash FROM users JOIN auth ON users.id = auth.user_id WHERE users.email = ?")
        .bind(&email)
        .fetch_optional(&db.pool)
        .await?;
    let (user_id, password_hash): (String, String) = match row {
        Some(row) => (row.get("id"), row.get("password_hash")),
        None => {
            info!("[AUTH] Login failed for {}: unknown email", email);
            return Err(ServiceError::Unauthorized("Invalid email or password. Please try again.".to_string()));
        }
    };
    if !verify_password(&password_hash, password) {
        info!("[AUTH] Login failed for {}: wrong password", email);
        return Err(ServiceError::Unauthorized("Invalid email or password. Please try again.".to_string()));
    }

    let token = generate_session_token();
    let now = chrono::Utc::now().timestamp();
    let expires_at = now + 60 * 60 * 24 * config.session_expiry_days as i64;
    let mut tx = db.begin_write().await?;
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&token)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

    let user = users::fetch_user_by_email(&mut *tx, &email)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;
    tx.commit().await?;

    info!("[AUTH] Login success for {} (id={})", email, user_id);
    Ok(Session { token, expires_at, user })
}

pub async fn logout(db: &Database, session_token: &str) -> ServiceResult<()> {
    let res = sqlx::query("DELETE FROM sessions WHERE session_token = ?")
        .bind(session_token)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        info!("[AUTH] Logout with unknown session (token masked)");
        return Err(ServiceError::Unauthorized("Session not found".to_string()));
    }
    info!("[AUTH] Session closed (token masked)");
    Ok(())
}

/// Resolve a session token to the user it belongs to.
pub async fn validate_session(db: &Database, session_token: &str) -> ServiceResult<UserId> {
    let now = chrono::Utc::now().timestamp();
    let user_id: Option<String> =
        sqlx::query_scalar("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
            .bind(session_token)
            .bind(now)
            .fetch_optional(&db.pool)
            .await?;
    user_id.ok_or_else(|| ServiceError::Unauthorized("Invalid or expired session".to_string()))
}

/// Remove expired sessions. Idempotent, safe to run periodically.
pub async fn cleanup_expired_sessions(db: &Database) -> ServiceResult<u64> {
    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() > 0 {
        info!("[AUTH] Cleaned up {} expired sessions", res.rows_affected());
    }
    Ok(res.rows_affected())
}
