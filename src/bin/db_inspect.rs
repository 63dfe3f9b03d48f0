use peerlink::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let db_path = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/peerlink.db".to_string());
    println!("Connecting to {}", db_path);
    let db = Database::connect(&db_path).await?;

    println!("\n-- study_groups --");
    let rows = sqlx::query("SELECT id, name, creator_id, max_members, is_public, created_at FROM study_groups ORDER BY created_at")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let name: String = r.try_get("name").unwrap_or_default();
        let creator_id: String = r.try_get("creator_id").unwrap_or_default();
        let max_members: i64 = r.try_get("max_members").unwrap_or(0);
        let is_public: bool = r.try_get("is_public").unwrap_or(false);
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!(
            "id={} name={} creator={} max={} public={} created_at={}",
            id, name, creator_id, max_members, is_public, created_at
        );
    }

    println!("\n-- group_members --");
    let rows = sqlx::query("SELECT group_id, user_id, position, joined_at FROM group_members ORDER BY group_id, position")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let group_id: String = r.try_get("group_id").unwrap_or_default();
        let user_id: String = r.try_get("user_id").unwrap_or_default();
        let position: i64 = r.try_get("position").unwrap_or(0);
        let joined_at: i64 = r.try_get("joined_at").unwrap_or(0);
        println!("group_id={} #{} user_id={} joined_at={}", group_id, position, user_id, joined_at);
    }

    println!("\n-- join_requests (last 20) --");
    let rows = sqlx::query("SELECT id, group_id, user_id, status, created_at, responded_at FROM join_requests ORDER BY created_at DESC LIMIT 20")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let group_id: String = r.try_get("group_id").unwrap_or_default();
        let user_id: String = r.try_get("user_id").unwrap_or_default();
        let status: String = r.try_get("status").unwrap_or_default();
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        let responded_at: Option<i64> = r.try_get("responded_at").unwrap_or(None);
        println!(
            "id={} group_id={} user_id={} status={} created_at={} responded_at={:?}",
            id, group_id, user_id, status, created_at, responded_at
        );
    }

    Ok(())
}
