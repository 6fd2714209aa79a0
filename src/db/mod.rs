// src/db/mod.rs
// Schema bootstrap for the relational store. The corpus does not ship a
// separate migrations tool (see `patterns/storage.rs`'s inline `CREATE
// TABLE` in its own constructor path); this crate centralizes the
// equivalent `CREATE TABLE IF NOT EXISTS` statements for every entity in
// one place so `AppState::new` can bring up a fresh database with one call.
// Repos still own their own queries — this module only owns table shape.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            display_name TEXT,
            email_local_part TEXT,
            is_admin INTEGER NOT NULL DEFAULT 0,
            avatar_ref TEXT,
            frame_ref TEXT,
            badge_ref TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS idempotency_keys (
            surface TEXT NOT NULL,
            sender_id INTEGER NOT NULL,
            client_message_id TEXT NOT NULL,
            secondary_key TEXT,
            result_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(surface, sender_id, client_message_id, secondary_key)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_mute_preferences (
            user_id INTEGER PRIMARY KEY,
            global_chat_muted INTEGER NOT NULL DEFAULT 0,
            trivia_chat_muted INTEGER NOT NULL DEFAULT 0,
            private_chat_muted_users TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS user_presence (
            user_id INTEGER PRIMARY KEY,
            last_seen_at TEXT,
            device_online INTEGER NOT NULL DEFAULT 0,
            share_last_seen TEXT NOT NULL DEFAULT 'everyone',
            share_online INTEGER NOT NULL DEFAULT 1,
            read_receipts INTEGER NOT NULL DEFAULT 1
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS global_chat_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            client_message_id TEXT,
            reply_to_id INTEGER
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_global_chat_created_at ON global_chat_messages(created_at, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS global_chat_viewers (
            user_id INTEGER PRIMARY KEY,
            last_seen_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS trivia_chat_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            draw_date TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            client_message_id TEXT,
            reply_to_id INTEGER
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trivia_draw_date ON trivia_chat_messages(draw_date, created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS trivia_chat_likes (
            user_id INTEGER NOT NULL,
            draw_date TEXT NOT NULL,
            message_id INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_id, draw_date, message_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS private_conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_a INTEGER NOT NULL,
            user_b INTEGER NOT NULL,
            requested_by INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            responded_at TEXT,
            last_message_at TEXT,
            last_read_message_id_a INTEGER,
            last_read_message_id_b INTEGER,
            UNIQUE(user_a, user_b)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS private_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            sender_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'sent',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            delivered_at TEXT,
            client_message_id TEXT,
            reply_to_id INTEGER
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_private_messages_conv ON private_messages(conversation_id, created_at, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS blocks (
            blocker_id INTEGER NOT NULL,
            blocked_id INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(blocker_id, blocked_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS push_devices (
            user_id INTEGER NOT NULL,
            player_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            is_valid INTEGER NOT NULL DEFAULT 1,
            last_active TEXT NOT NULL DEFAULT (datetime('now')),
            last_failure_at TEXT,
            UNIQUE(user_id, player_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS notification_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recipient_id INTEGER NOT NULL,
            surface TEXT NOT NULL,
            heading TEXT NOT NULL,
            body TEXT NOT NULL,
            is_in_app INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS e2ee_devices (
            device_id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            device_name TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            last_seen_at TEXT,
            status TEXT NOT NULL DEFAULT 'active'
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_e2ee_devices_user ON e2ee_devices(user_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS e2ee_key_bundles (
            device_id TEXT PRIMARY KEY,
            identity_key_pub TEXT NOT NULL,
            signed_prekey_pub TEXT NOT NULL,
            signed_prekey_sig TEXT NOT NULL,
            bundle_version INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS e2ee_one_time_prekeys (
            device_id TEXT NOT NULL,
            prekey_id INTEGER NOT NULL,
            prekey_pub TEXT NOT NULL,
            claimed INTEGER NOT NULL DEFAULT 0,
            claimed_at TEXT,
            PRIMARY KEY (device_id, prekey_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS e2ee_device_revocations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dm_conversations (
            id TEXT PRIMARY KEY,
            pair_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            last_message_at TEXT,
            sealed_sender_enabled INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dm_participants (
            conversation_id TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            device_ids TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (conversation_id, user_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dm_messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender_user_id INTEGER NOT NULL,
            sender_device_id TEXT NOT NULL,
            ciphertext BLOB NOT NULL,
            proto TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            client_message_id TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dm_messages_conv ON dm_messages(conversation_id, created_at, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dm_deliveries (
            message_id TEXT NOT NULL,
            recipient_user_id INTEGER NOT NULL,
            delivered_at TEXT,
            read_at TEXT,
            PRIMARY KEY (message_id, recipient_user_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS groups (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            about TEXT,
            photo_url TEXT,
            created_by INTEGER NOT NULL,
            max_participants INTEGER NOT NULL,
            group_epoch INTEGER NOT NULL DEFAULT 0,
            is_closed INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS group_participants (
            group_id TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            is_banned INTEGER NOT NULL DEFAULT 0,
            joined_at TEXT NOT NULL DEFAULT (datetime('now')),
            mute_until TEXT,
            PRIMARY KEY (group_id, user_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS group_bans (
            group_id TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            banned_by INTEGER NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (group_id, user_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS group_invites (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            created_by INTEGER NOT NULL,
            invite_type TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            max_uses INTEGER,
            uses INTEGER NOT NULL DEFAULT 0,
            target_user_id INTEGER
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS group_messages (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            sender_user_id INTEGER NOT NULL,
            sender_device_id TEXT NOT NULL,
            ciphertext BLOB NOT NULL,
            proto TEXT NOT NULL,
            group_epoch INTEGER NOT NULL,
            reply_to_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            client_message_id TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_group_messages_group ON group_messages(group_id, created_at, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS group_deliveries (
            message_id TEXT NOT NULL,
            recipient_user_id INTEGER NOT NULL,
            delivered_at TEXT,
            read_at TEXT,
            PRIMARY KEY (message_id, recipient_user_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS status_posts (
            id TEXT PRIMARY KEY,
            owner_user_id INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            expires_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS admin_pairs (
            user_id INTEGER PRIMARY KEY
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS webhook_events (
            event_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'received',
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
