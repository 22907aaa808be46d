//! SQLite persistence for the relay: tenants, endpoints, enrollment tokens,
//! operators and their assignments.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::identity::Role;
use crate::scope::{render_predicate, Scope};

/// Bcrypt cost for operator passwords.
pub const OPERATOR_BCRYPT_COST: u32 = 12;

/// Checked when a username is unknown, so a miss costs the same as a wrong
/// password and does not reveal which usernames exist.
fn dummy_password_hash() -> Option<&'static str> {
    static HASH: OnceLock<Option<String>> = OnceLock::new();
    HASH.get_or_init(|| match bcrypt::hash("no such operator", OPERATOR_BCRYPT_COST) {
        Ok(hash) => Some(hash),
        Err(e) => {
            tracing::error!(error = %e, "failed to prepare placeholder password hash");
            None
        }
    })
    .as_deref()
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS endpoints (
    id           TEXT PRIMARY KEY,
    tenant_id    TEXT NOT NULL REFERENCES tenants(id),
    secret_hash  TEXT NOT NULL,
    hostname     TEXT NOT NULL,
    os_version   TEXT NOT NULL,
    connected    INTEGER NOT NULL DEFAULT 0,
    last_seen    TEXT,
    disabled     INTEGER NOT NULL DEFAULT 0,
    enrolled_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_endpoints_tenant ON endpoints(tenant_id);

CREATE TABLE IF NOT EXISTS enrollment_tokens (
    token_hash  TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL REFERENCES tenants(id),
    expires_at  INTEGER NOT NULL,
    used_at     TEXT
);

CREATE TABLE IF NOT EXISTS operators (
    id             TEXT PRIMARY KEY,
    username       TEXT NOT NULL UNIQUE,
    display_name   TEXT NOT NULL,
    role           TEXT NOT NULL,
    password_hash  TEXT NOT NULL,
    totp_seed      TEXT,
    totp_enabled   INTEGER NOT NULL DEFAULT 0,
    backup_codes   TEXT,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operator_assignments (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    operator_id  TEXT NOT NULL REFERENCES operators(id),
    tenant_id    TEXT REFERENCES tenants(id),
    endpoint_id  TEXT REFERENCES endpoints(id),
    CHECK ((tenant_id IS NULL) <> (endpoint_id IS NULL)),
    UNIQUE (operator_id, tenant_id, endpoint_id)
);
CREATE INDEX IF NOT EXISTS idx_assignments_operator ON operator_assignments(operator_id);
"#;

const MAX_MACHINE_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("enrollment token is invalid, expired or already used")]
    InvalidEnrollmentToken,
    #[error("endpoint is disabled")]
    EndpointDisabled,
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointRecord {
    pub id: String,
    pub tenant_id: String,
    pub hostname: String,
    pub os_version: String,
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorRecord {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub password_hash: String,
    /// Sealed one-time-code seed.
    pub totp_seed: Option<String>,
    pub totp_enabled: bool,
    /// Sealed backup-code blob.
    pub backup_codes: Option<String>,
}

impl OperatorRecord {
    pub fn principal(&self) -> crate::identity::Principal {
        crate::identity::Principal {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Tenant(String),
    Endpoint(String),
}

/// Issued once at enrollment; the secret is never readable again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentGrant {
    pub endpoint_id: String,
    pub endpoint_secret: String,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn random_secret() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 32]>())
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn valid_machine_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_MACHINE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn endpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EndpointRecord> {
    let last_seen: Option<String> = row.get(5)?;
    Ok(EndpointRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        hostname: row.get(2)?,
        os_version: row.get(3)?,
        connected: row.get(4)?,
        last_seen: last_seen
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        disabled: row.get(6)?,
    })
}

const ENDPOINT_COLUMNS: &str =
    "id, tenant_id, hostname, os_version, connected, last_seen, disabled";

const OPERATOR_COLUMNS: &str =
    "id, username, display_name, role, password_hash, totp_seed, totp_enabled, backup_codes";

/// Thread-safe handle to the relay database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -- tenants ----------------------------------------------------------

    pub fn create_tenant(&self, name: &str) -> Result<Tenant, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("tenant name"));
        }
        let tenant = Tenant {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![tenant.id, tenant.name, now_rfc3339()],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict("tenant")
            } else {
                e.into()
            }
        })?;
        tracing::info!(tenant = %tenant.id, name = %tenant.name, "tenant created");
        Ok(tenant)
    }

    pub fn tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name FROM tenants WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    // -- enrollment -------------------------------------------------------

    /// Mint a one-time enrollment token for `tenant_id`. Only its hash is
    /// stored.
    pub fn create_enrollment_token(&self, tenant_id: &str, ttl: Duration) -> Result<String, StoreError> {
        if self.tenant(tenant_id)?.is_none() {
            return Err(StoreError::NotFound("tenant"));
        }
        let token = random_secret();
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO enrollment_tokens (token_hash, tenant_id, expires_at) VALUES (?1, ?2, ?3)",
            params![hash_secret(&token), tenant_id, expires_at],
        )?;
        tracing::info!(tenant = tenant_id, ttl_secs = ttl.as_secs(), "enrollment token issued");
        Ok(token)
    }

    /// Consume an enrollment token and register (or re-key) the machine.
    ///
    /// A machine that is already enrolled keeps its tenant and gets a new
    /// secret; a disabled one is refused.
    pub fn enroll(
        &self,
        token: &str,
        machine_id: &str,
        hostname: &str,
        os_version: &str,
    ) -> Result<EnrollmentGrant, StoreError> {
        if !valid_machine_id(machine_id) {
            return Err(StoreError::Invalid("machine id"));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let token_hash = hash_secret(token);
        let tenant_id: Option<String> = tx
            .query_row(
                "SELECT tenant_id FROM enrollment_tokens
                 WHERE token_hash = ?1 AND used_at IS NULL AND expires_at > ?2",
                params![token_hash, Utc::now().timestamp()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(tenant_id) = tenant_id else {
            return Err(StoreError::InvalidEnrollmentToken);
        };

        let existing: Option<bool> = tx
            .query_row(
                "SELECT disabled FROM endpoints WHERE id = ?1",
                params![machine_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing == Some(true) {
            return Err(StoreError::EndpointDisabled);
        }

        let secret = random_secret();
        let secret_hash = hash_secret(&secret);
        let now = now_rfc3339();
        if existing.is_some() {
            tx.execute(
                "UPDATE endpoints SET secret_hash = ?2, hostname = ?3, os_version = ?4 WHERE id = ?1",
                params![machine_id, secret_hash, hostname, os_version],
            )?;
            tracing::info!(endpoint = machine_id, "endpoint re-enrolled, secret rotated");
        } else {
            tx.execute(
                "INSERT INTO endpoints (id, tenant_id, secret_hash, hostname, os_version, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![machine_id, tenant_id, secret_hash, hostname, os_version, now],
            )?;
            tracing::info!(endpoint = machine_id, tenant = %tenant_id, "endpoint enrolled");
        }
        tx.execute(
            "UPDATE enrollment_tokens SET used_at = ?2 WHERE token_hash = ?1",
            params![token_hash, now],
        )?;
        tx.commit()?;

        Ok(EnrollmentGrant {
            endpoint_id: machine_id.to_string(),
            endpoint_secret: secret,
        })
    }

    /// Whether `secret` authenticates a non-disabled endpoint.
    pub fn verify_endpoint_secret(&self, endpoint_id: &str, secret: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT secret_hash, disabled FROM endpoints WHERE id = ?1",
                params![endpoint_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stored, disabled)) = row else {
            return Ok(false);
        };
        let candidate = hash_secret(secret);
        let matches = stored.len() == candidate.len()
            && bool::from(stored.as_bytes().ct_eq(candidate.as_bytes()));
        Ok(matches && !disabled)
    }

    // -- endpoints --------------------------------------------------------

    pub fn endpoint(&self, id: &str) -> Result<Option<EndpointRecord>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = ?1"),
                params![id],
                endpoint_from_row,
            )
            .optional()?)
    }

    pub fn set_connected(&self, id: &str, connected: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE endpoints SET connected = ?2, last_seen = ?3 WHERE id = ?1",
            params![id, connected, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Soft-delete. Returns `false` if no such endpoint.
    pub fn disable_endpoint(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE endpoints SET disabled = 1, connected = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// Endpoints visible through `scope`, ordered by hostname.
    pub fn list_endpoints(&self, scope: &Scope) -> Result<Vec<EndpointRecord>, StoreError> {
        let predicate = render_predicate(scope, "id", 1);
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE {} ORDER BY hostname, id",
            predicate.sql
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(predicate.params.iter()), endpoint_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Single-row scope check. Missing and out-of-scope are both `false`.
    pub fn endpoint_in_scope(&self, id: &str, scope: &Scope) -> Result<bool, StoreError> {
        let predicate = render_predicate(scope, "id", 2);
        let sql = format!(
            "SELECT 1 FROM endpoints WHERE id = ?1 AND ({})",
            predicate.sql
        );
        let mut bound: Vec<&str> = Vec::with_capacity(1 + predicate.params.len());
        bound.push(id);
        bound.extend(predicate.params.iter().map(String::as_str));
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(&sql, params_from_iter(bound), |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    // -- operators --------------------------------------------------------

    pub fn create_operator(
        &self,
        username: &str,
        display_name: &str,
        role: Role,
        password: &str,
        bcrypt_cost: u32,
    ) -> Result<OperatorRecord, StoreError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::Invalid("username"));
        }
        if password.is_empty() {
            return Err(StoreError::Invalid("password"));
        }
        let record = OperatorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            display_name: display_name.trim().to_string(),
            role,
            password_hash: bcrypt::hash(password, bcrypt_cost)?,
            totp_seed: None,
            totp_enabled: false,
            backup_codes: None,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO operators (id, username, display_name, role, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.username,
                record.display_name,
                record.role.as_str(),
                record.password_hash,
                now_rfc3339()
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict("operator")
            } else {
                e.into()
            }
        })?;
        tracing::info!(operator = %record.id, username = %record.username, role = %role, "operator created");
        Ok(record)
    }

    fn operator_where(&self, clause: &str, value: &str) -> Result<Option<OperatorRecord>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {OPERATOR_COLUMNS} FROM operators WHERE {clause} = ?1"),
                params![value],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, username, display_name, role, password_hash, totp_seed, totp_enabled, backup_codes)) = row
        else {
            return Ok(None);
        };
        let role = role
            .parse()
            .map_err(|e: crate::identity::UnknownRole| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(OperatorRecord {
            id,
            username,
            display_name,
            role,
            password_hash,
            totp_seed,
            totp_enabled,
            backup_codes,
        }))
    }

    pub fn operator(&self, id: &str) -> Result<Option<OperatorRecord>, StoreError> {
        self.operator_where("id", id)
    }

    pub fn operator_by_username(&self, username: &str) -> Result<Option<OperatorRecord>, StoreError> {
        self.operator_where("username", username.trim())
    }

    /// Look up `username` and check `password`. `None` for either failure.
    pub fn verify_password(&self, username: &str, password: &str) -> Result<Option<OperatorRecord>, StoreError> {
        let Some(record) = self.operator_by_username(username)? else {
            if let Some(hash) = dummy_password_hash() {
                let _ = bcrypt::verify(password, hash);
            }
            return Ok(None);
        };
        if bcrypt::verify(password, &record.password_hash)? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Store a sealed seed. `enabled` stays false until the operator proves
    /// they can produce a code from it.
    pub fn set_totp(&self, operator_id: &str, sealed_seed: Option<&str>, enabled: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE operators SET totp_seed = ?2, totp_enabled = ?3 WHERE id = ?1",
            params![operator_id, sealed_seed, enabled],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound("operator"));
        }
        Ok(())
    }

    pub fn set_backup_codes(&self, operator_id: &str, sealed: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE operators SET backup_codes = ?2 WHERE id = ?1",
            params![operator_id, sealed],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound("operator"));
        }
        Ok(())
    }

    /// Swap the backup-code blob only if it still equals `expected`.
    /// Returns `false` when another request changed it first.
    pub fn replace_backup_codes(&self, operator_id: &str, expected: &str, sealed: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE operators SET backup_codes = ?3 WHERE id = ?1 AND backup_codes = ?2",
            params![operator_id, expected, sealed],
        )?;
        Ok(n == 1)
    }

    // -- assignments ------------------------------------------------------

    pub fn assign(&self, operator_id: &str, assignment: &Assignment) -> Result<(), StoreError> {
        if self.operator(operator_id)?.is_none() {
            return Err(StoreError::NotFound("operator"));
        }
        let (tenant_id, endpoint_id) = match assignment {
            Assignment::Tenant(id) => {
                if self.tenant(id)?.is_none() {
                    return Err(StoreError::NotFound("tenant"));
                }
                (Some(id.as_str()), None)
            }
            Assignment::Endpoint(id) => {
                if self.endpoint(id)?.is_none() {
                    return Err(StoreError::NotFound("endpoint"));
                }
                (None, Some(id.as_str()))
            }
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO operator_assignments (operator_id, tenant_id, endpoint_id)
             VALUES (?1, ?2, ?3)",
            params![operator_id, tenant_id, endpoint_id],
        )?;
        tracing::info!(operator = operator_id, ?assignment, "operator assignment added");
        Ok(())
    }

    /// Endpoints of every tenant assigned to the operator, plus endpoints
    /// assigned directly.
    pub fn assigned_endpoint_ids(&self, operator_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id FROM endpoints e
               JOIN operator_assignments a ON a.tenant_id = e.tenant_id
              WHERE a.operator_id = ?1
             UNION
             SELECT a.endpoint_id FROM operator_assignments a
              WHERE a.operator_id = ?1 AND a.endpoint_id IS NOT NULL",
        )?;
        let ids = stmt
            .query_map(params![operator_id], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }
}
