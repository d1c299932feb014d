use crate::domain::image_updates::ports::{ImageUpdate, ImageUpdateRepository};
use crate::domain::machines::models::{KeyPair, Machine, MachineId, MachineRef, SaveMachineRequest};
use crate::domain::machines::ports::{KeyRepository, MachineRepository};
use crate::domain::user_config::{UiPreferences, UpdaterSettings, UserConfig, UserConfigRepository};
use crate::error::{Error, Result};
use crate::shared::HostName;
use chrono::Utc;
use log::{debug, info};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::SqliteRow;
use sqlx::{Error as SqlxError, QueryBuilder, Row, SqlitePool};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Sqlite {
    pool: SqlitePool,
}

impl Sqlite {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to database: {database_url}");
        if !sqlx::Sqlite::database_exists(database_url).await? {
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;

        Ok(Self { pool })
    }

    /// Run embedded database migrations.
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| SqlxError::Migrate(Box::new(e)))?;
        Ok(())
    }

    pub async fn open(database_url: &str) -> Result<Self> {
        let db = Self::new(database_url).await?;
        db.migrate().await?;
        Ok(db)
    }
}

fn machine_from_row(row: &SqliteRow) -> Machine {
    let port: i64 = row.get("port");
    Machine {
        id: MachineId(row.get("id")),
        name: HostName(row.get("name")),
        enabled: row.get("enabled"),
        host: row.get("host"),
        port: u16::try_from(port).unwrap_or(22),
        user: row.get("user"),
        password: row.get("password"),
        use_key_pair: row.get("use_key_pair"),
        remote_public_key: row.get("remote_public_key"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn key_from_row(row: &SqliteRow) -> KeyPair {
    KeyPair {
        name: row.get("name"),
        public_key: row.get("public_key"),
        private_key: row.get("private_key"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Give uniqueness and missing-row errors the name of what was looked up.
fn named(what: &'static str, name: &str) -> impl FnOnce(SqlxError) -> Error {
    move |e| match e {
        SqlxError::RowNotFound => Error::not_found(what, name),
        SqlxError::Database(ref db) if db.is_unique_violation() => {
            Error::already_exists(what, name)
        }
        other => Error::from(other),
    }
}

impl MachineRepository for Sqlite {
    async fn save_machine(&self, req: &SaveMachineRequest) -> Result<Machine> {
        let now = Utc::now();
        let row = match req.id {
            Some(id) => sqlx::query(
                r#"
                UPDATE machines
                SET name = ?, enabled = ?, host = ?, port = ?, user = ?, password = ?,
                    use_key_pair = ?, remote_public_key = ?, updated_at = ?
                WHERE id = ?
                RETURNING *
                "#,
            )
            .bind(req.name.as_str())
            .bind(req.enabled)
            .bind(&req.host)
            .bind(req.port as i64)
            .bind(&req.user)
            .bind(&req.password)
            .bind(req.use_key_pair)
            .bind(&req.remote_public_key)
            .bind(now)
            .bind(id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(named("machine", req.name.as_str()))?,
            None => sqlx::query(
                r#"
                INSERT INTO machines
                    (name, enabled, host, port, user, password, use_key_pair, remote_public_key,
                     created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(req.name.as_str())
            .bind(req.enabled)
            .bind(&req.host)
            .bind(req.port as i64)
            .bind(&req.user)
            .bind(&req.password)
            .bind(req.use_key_pair)
            .bind(&req.remote_public_key)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(named("machine", req.name.as_str()))?,
        };
        debug!("saved machine {}", req.name);
        Ok(machine_from_row(&row))
    }

    async fn delete_machine(&self, machine: &MachineRef) -> Result<()> {
        let result = match machine {
            MachineRef::Id(id) => {
                sqlx::query("DELETE FROM machines WHERE id = ?")
                    .bind(id.0)
                    .execute(&self.pool)
                    .await?
            }
            MachineRef::Name(name) => {
                sqlx::query("DELETE FROM machines WHERE name = ?")
                    .bind(name.as_str())
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(Error::not_found("machine", describe(machine)));
        }
        Ok(())
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let rows = sqlx::query("SELECT * FROM machines ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(machine_from_row).collect())
    }

    async fn get_machine(&self, machine: &MachineRef) -> Result<Machine> {
        let row = match machine {
            MachineRef::Id(id) => {
                sqlx::query("SELECT * FROM machines WHERE id = ?")
                    .bind(id.0)
                    .fetch_one(&self.pool)
                    .await
            }
            MachineRef::Name(name) => {
                sqlx::query("SELECT * FROM machines WHERE name = ?")
                    .bind(name.as_str())
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .map_err(named("machine", &describe(machine)))?;
        Ok(machine_from_row(&row))
    }
}

fn describe(machine: &MachineRef) -> String {
    match machine {
        MachineRef::Id(id) => format!("#{}", id.0),
        MachineRef::Name(name) => name.to_string(),
    }
}

impl KeyRepository for Sqlite {
    async fn save_key(&self, name: &str, public_key: &[u8], private_key: &[u8]) -> Result<KeyPair> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO ssh_keys (name, public_key, private_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(public_key)
        .bind(private_key)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(named("key", name))?;
        Ok(key_from_row(&row))
    }

    async fn get_key(&self, name: &str) -> Result<KeyPair> {
        let row = sqlx::query("SELECT * FROM ssh_keys WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(named("key", name))?;
        Ok(key_from_row(&row))
    }

    async fn list_keys(&self) -> Result<Vec<KeyPair>> {
        let rows = sqlx::query("SELECT * FROM ssh_keys ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(key_from_row).collect())
    }

    async fn delete_key(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM ssh_keys WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("key", name));
        }
        Ok(())
    }
}

impl ImageUpdateRepository for Sqlite {
    async fn lookup_updates(
        &self,
        host: &HostName,
        image_ids: &[String],
    ) -> Result<HashMap<String, ImageUpdate>> {
        let mut query = QueryBuilder::new(
            "SELECT host, image_id, update_ref FROM image_updates WHERE host = ",
        );
        query.push_bind(host.as_str());
        query.push(" AND image_id IN (");
        let mut separated = query.separated(", ");
        for id in image_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let update = ImageUpdate {
                    host: HostName(row.get("host")),
                    image_id: row.get("image_id"),
                    update_ref: row.get("update_ref"),
                };
                (update.image_id.clone(), update)
            })
            .collect())
    }

    async fn save_update(&self, update: &ImageUpdate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_updates (host, image_id, update_ref, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(host, image_id) DO UPDATE
                SET update_ref = excluded.update_ref, updated_at = excluded.updated_at
            "#,
        )
        .bind(update.host.as_str())
        .bind(&update.image_id)
        .bind(&update.update_ref)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_update(&self, host: &HostName, image_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM image_updates WHERE host = ? AND image_id = ?")
            .bind(host.as_str())
            .bind(image_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl UserConfigRepository for Sqlite {
    async fn get_user_config(&self) -> Result<UserConfig> {
        sqlx::query("INSERT INTO user_config (id) VALUES (1) ON CONFLICT(id) DO NOTHING")
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT * FROM user_config WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        let interval: i64 = row.get("updater_interval_secs");
        let ui: String = row.get("ui");
        Ok(UserConfig {
            updater: UpdaterSettings {
                enabled: row.get("updater_enabled"),
                interval_secs: interval.max(0) as u64,
            },
            ui: serde_json::from_str::<UiPreferences>(&ui).unwrap_or_default(),
        })
    }

    async fn save_user_config(&self, config: &UserConfig) -> Result<()> {
        let ui = serde_json::to_string(&config.ui)?;
        sqlx::query(
            r#"
            INSERT INTO user_config (id, updater_enabled, updater_interval_secs, ui) VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE
                SET updater_enabled = excluded.updater_enabled,
                    updater_interval_secs = excluded.updater_interval_secs,
                    ui = excluded.ui
            "#,
        )
        .bind(config.updater.enabled)
        .bind(config.updater.interval_secs as i64)
        .bind(ui)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
