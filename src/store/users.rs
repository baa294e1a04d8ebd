//! `users` table.

use super::error::StorageResult;
use crate::models::user::User;
use sqlx::SqliteExecutor;

/// Insert or refresh a user row.
pub async fn store_user(db: impl SqliteExecutor<'_>, user: &User) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO users (user_id, display_name, email, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
             display_name = excluded.display_name,
             email = excluded.email",
    )
    .bind(&user.user_id)
    .bind(&user.display_name)
    .bind(&user.email)
    .bind(user.created_at)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_user(db: impl SqliteExecutor<'_>, user_id: &str) -> StorageResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT user_id, display_name, email, created_at FROM users WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await?;
    Ok(user)
}
