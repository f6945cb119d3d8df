#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("unsupported database_url scheme for identity store")]
	UnsupportedUrl,
	#[error("identity store connect failed: {0}")]
	Connect(#[source] sqlx::Error),
	#[error("identity store query failed: {0}")]
	Query(#[source] sqlx::Error),
	#[error("read public key file {path}: {source}")]
	KeyFile {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// Read-only lookup of a user's registered public key.
#[async_trait]
pub trait IdentityStore: Send + Sync + 'static {
	/// The stored key text for `username`, or `None` if the user is unknown.
	async fn public_key(&self, username: &str) -> Result<Option<String>, StoreError>;

	/// Release pooled resources.
	async fn close(&self) {}
}

/// `users_identity` table over sqlx.
#[derive(Clone)]
pub struct SqlIdentityStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlIdentityStore {
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let backend = if database_url.starts_with("sqlite:") {
			SqlBackend::Sqlite(
				sqlx::SqlitePool::connect(database_url)
					.await
					.map_err(StoreError::Connect)?,
			)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			SqlBackend::Postgres(sqlx::PgPool::connect(database_url).await.map_err(StoreError::Connect)?)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			SqlBackend::Mysql(sqlx::MySqlPool::connect(database_url).await.map_err(StoreError::Connect)?)
		} else {
			return Err(StoreError::UnsupportedUrl);
		};

		Ok(Self { backend })
	}

	pub fn from_sqlite_pool(pool: sqlx::SqlitePool) -> Self {
		Self {
			backend: SqlBackend::Sqlite(pool),
		}
	}
}

#[async_trait]
impl IdentityStore for SqlIdentityStore {
	async fn public_key(&self, username: &str) -> Result<Option<String>, StoreError> {
		let key: Option<Option<String>> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_scalar("SELECT public_key FROM users_identity WHERE username = ?")
				.bind(username)
				.fetch_optional(pool)
				.await
				.map_err(StoreError::Query)?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_scalar("SELECT public_key FROM users_identity WHERE username = $1")
					.bind(username)
					.fetch_optional(pool)
					.await
					.map_err(StoreError::Query)?
			}
			SqlBackend::Mysql(pool) => sqlx::query_scalar("SELECT public_key FROM users_identity WHERE username = ?")
				.bind(username)
				.fetch_optional(pool)
				.await
				.map_err(StoreError::Query)?,
		};

		Ok(key.flatten().filter(|k| !k.trim().is_empty()))
	}

	async fn close(&self) {
		match &self.backend {
			SqlBackend::Sqlite(pool) => pool.close().await,
			SqlBackend::Postgres(pool) => pool.close().await,
			SqlBackend::Mysql(pool) => pool.close().await,
		}
		debug!("identity store pool closed");
	}
}

/// Fixed `username -> key` map for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityStore {
	keys: HashMap<String, String>,
}

impl StaticIdentityStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_key(mut self, username: impl Into<String>, public_key: impl Into<String>) -> Self {
		self.keys.insert(username.into(), public_key.into());
		self
	}

	/// Read every configured key file up front.
	pub fn from_files<'a>(entries: impl IntoIterator<Item = (&'a String, &'a PathBuf)>) -> Result<Self, StoreError> {
		let mut store = Self::new();
		for (username, path) in entries {
			let pem = std::fs::read_to_string(path).map_err(|source| StoreError::KeyFile {
				path: path.clone(),
				source,
			})?;
			store.keys.insert(username.clone(), pem);
		}
		Ok(store)
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}
}

#[async_trait]
impl IdentityStore for StaticIdentityStore {
	async fn public_key(&self, username: &str) -> Result<Option<String>, StoreError> {
		Ok(self.keys.get(username).cloned())
	}
}
