use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub mod instance;
mod schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
