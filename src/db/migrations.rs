use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: Users, messages and their attachments

CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    password_hash BLOB,
    display_name TEXT,
    avatar_url TEXT,
    bio TEXT
);

CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    text TEXT,
    recipient TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX idx_messages_created ON messages(created_at);

CREATE TABLE images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    filename TEXT,
    filesize INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX idx_images_message ON images(message_id);
",
    )])
}
