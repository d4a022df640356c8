//! SQLite-backed store
//!
//! Resource configs are kept as JSON text; rules and applets keep their
//! script blocks verbatim.

use async_trait::async_trait;
use errors::{RhilexError, RhilexResult};
use rhilex_core::{AppletDef, ResourceDef, ResourceKind, RuleDef, RuleStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;

use super::{ConfigStore, ModbusPointRow};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS m_inends (
        uuid TEXT PRIMARY KEY, name TEXT NOT NULL, type TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}', description TEXT NOT NULL DEFAULT '',
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP)"#,
    r#"CREATE TABLE IF NOT EXISTS m_outends (
        uuid TEXT PRIMARY KEY, name TEXT NOT NULL, type TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}', description TEXT NOT NULL DEFAULT '',
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP)"#,
    r#"CREATE TABLE IF NOT EXISTS m_devices (
        uuid TEXT PRIMARY KEY, name TEXT NOT NULL, type TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}', description TEXT NOT NULL DEFAULT '',
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP)"#,
    r#"CREATE TABLE IF NOT EXISTS m_cecollas (
        uuid TEXT PRIMARY KEY, name TEXT NOT NULL, type TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}', description TEXT NOT NULL DEFAULT '',
        action TEXT, created_at DATETIME DEFAULT CURRENT_TIMESTAMP)"#,
    r#"CREATE TABLE IF NOT EXISTS m_rules (
        uuid TEXT PRIMARY KEY, name TEXT NOT NULL,
        from_source TEXT, from_device TEXT,
        success TEXT NOT NULL, actions TEXT NOT NULL, failed TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '', status INTEGER NOT NULL DEFAULT 1,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP)"#,
    r#"CREATE TABLE IF NOT EXISTS m_applets (
        uuid TEXT PRIMARY KEY, name TEXT NOT NULL, version TEXT NOT NULL DEFAULT '0.0.1',
        auto_start INTEGER NOT NULL DEFAULT 0, script TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP)"#,
    r#"CREATE TABLE IF NOT EXISTS m_modbus_data_points (
        uuid TEXT PRIMARY KEY, device_uuid TEXT NOT NULL, tag TEXT NOT NULL,
        alias TEXT NOT NULL DEFAULT '', function INTEGER NOT NULL, slaver_id INTEGER NOT NULL,
        address INTEGER NOT NULL, frequency INTEGER NOT NULL DEFAULT 1000,
        quantity INTEGER NOT NULL DEFAULT 1, data_type TEXT NOT NULL DEFAULT 'RAW',
        data_order TEXT NOT NULL DEFAULT '', weight REAL NOT NULL DEFAULT 1.0)"#,
    "CREATE INDEX IF NOT EXISTS idx_modbus_points_device ON m_modbus_data_points(device_uuid)",
];

fn table(kind: ResourceKind) -> RhilexResult<&'static str> {
    match kind {
        ResourceKind::Source => Ok("m_inends"),
        ResourceKind::Device => Ok("m_devices"),
        ResourceKind::Target => Ok("m_outends"),
        ResourceKind::Cecolla => Ok("m_cecollas"),
        ResourceKind::Multimedia => Err(RhilexError::Unsupported(
            "multimedia resources are not persisted".to_string(),
        )),
    }
}

fn hydrate_resource(row: &SqliteRow) -> RhilexResult<ResourceDef> {
    let config: String = row.try_get("config")?;
    let mut def = ResourceDef::new(
        row.try_get::<String, _>("uuid")?,
        row.try_get::<String, _>("name")?,
        row.try_get::<String, _>("type")?,
        serde_json::from_str(&config)?,
    );
    def.description = row.try_get("description")?;
    def.action = row.try_get::<Option<String>, _>("action").unwrap_or(None);
    Ok(def)
}

fn hydrate_rule(row: &SqliteRow) -> RhilexResult<RuleDef> {
    let status: i64 = row.try_get("status")?;
    Ok(RuleDef {
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        from_source: row.try_get("from_source")?,
        from_device: row.try_get("from_device")?,
        success: row.try_get("success")?,
        actions: row.try_get("actions")?,
        failed: row.try_get("failed")?,
        description: row.try_get("description")?,
        status: if status == 0 {
            RuleStatus::Stop
        } else {
            RuleStatus::Running
        },
    })
}

fn hydrate_applet(row: &SqliteRow) -> RhilexResult<AppletDef> {
    Ok(AppletDef {
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        auto_start: row.try_get::<i64, _>("auto_start")? != 0,
        script: row.try_get("script")?,
        description: row.try_get("description")?,
    })
}

fn hydrate_point(row: &SqliteRow) -> RhilexResult<ModbusPointRow> {
    Ok(ModbusPointRow {
        uuid: row.try_get("uuid")?,
        device_uuid: row.try_get("device_uuid")?,
        tag: row.try_get("tag")?,
        alias: row.try_get("alias")?,
        function: row.try_get::<i64, _>("function")? as u8,
        slaver_id: row.try_get::<i64, _>("slaver_id")? as u8,
        address: row.try_get::<i64, _>("address")? as u16,
        frequency: row.try_get::<i64, _>("frequency")? as u64,
        quantity: row.try_get::<i64, _>("quantity")? as u16,
        data_type: row.try_get("data_type")?,
        data_order: row.try_get("data_order")?,
        weight: row.try_get::<f64, _>("weight")? as f32,
    })
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating when missing) the database at `path` and apply the schema
    pub async fn connect(path: &str) -> RhilexResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("Resource store opened: {}", path);
        Ok(store)
    }

    /// Private in-memory database
    pub async fn in_memory() -> RhilexResult<Self> {
        // one connection, every new connection would see an empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> RhilexResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn save_resource(&self, kind: ResourceKind, def: &ResourceDef) -> RhilexResult<()> {
        let table = table(kind)?;
        let config = serde_json::to_string(&def.config)?;
        if kind == ResourceKind::Cecolla {
            sqlx::query(
                "INSERT OR REPLACE INTO m_cecollas (uuid, name, type, config, description, action) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&def.uuid)
            .bind(&def.name)
            .bind(&def.type_tag)
            .bind(config)
            .bind(&def.description)
            .bind(&def.action)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO {} (uuid, name, type, config, description) VALUES (?, ?, ?, ?, ?)",
                table
            ))
            .bind(&def.uuid)
            .bind(&def.name)
            .bind(&def.type_tag)
            .bind(config)
            .bind(&def.description)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_resource(&self, kind: ResourceKind, id: &str) -> RhilexResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE uuid = ?", table(kind)?))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_rule(&self, def: &RuleDef) -> RhilexResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO m_rules \
             (uuid, name, from_source, from_device, success, actions, failed, description, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&def.uuid)
        .bind(&def.name)
        .bind(&def.from_source)
        .bind(&def.from_device)
        .bind(&def.success)
        .bind(&def.actions)
        .bind(&def.failed)
        .bind(&def.description)
        .bind(i64::from(u8::from(def.status)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_applet(&self, def: &AppletDef) -> RhilexResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO m_applets (uuid, name, version, auto_start, script, description) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&def.uuid)
        .bind(&def.name)
        .bind(&def.version)
        .bind(i64::from(def.auto_start))
        .bind(&def.script)
        .bind(&def.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_point(&self, row: &ModbusPointRow) -> RhilexResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO m_modbus_data_points \
             (uuid, device_uuid, tag, alias, function, slaver_id, address, frequency, quantity, \
              data_type, data_order, weight) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.uuid)
        .bind(&row.device_uuid)
        .bind(&row.tag)
        .bind(&row.alias)
        .bind(i64::from(row.function))
        .bind(i64::from(row.slaver_id))
        .bind(i64::from(row.address))
        .bind(row.frequency as i64)
        .bind(i64::from(row.quantity))
        .bind(&row.data_type)
        .bind(&row.data_order)
        .bind(f64::from(row.weight))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_resource(&self, kind: ResourceKind, id: &str) -> RhilexResult<Option<ResourceDef>> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE uuid = ?", table(kind)?))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(hydrate_resource).transpose()
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn get_source(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        self.get_resource(ResourceKind::Source, id).await
    }

    async fn get_device(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        self.get_resource(ResourceKind::Device, id).await
    }

    async fn get_target(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        self.get_resource(ResourceKind::Target, id).await
    }

    async fn get_cecolla(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        self.get_resource(ResourceKind::Cecolla, id).await
    }

    async fn get_rule(&self, id: &str) -> RhilexResult<Option<RuleDef>> {
        let row = sqlx::query("SELECT * FROM m_rules WHERE uuid = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(hydrate_rule).transpose()
    }

    async fn get_applet(&self, id: &str) -> RhilexResult<Option<AppletDef>> {
        let row = sqlx::query("SELECT * FROM m_applets WHERE uuid = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(hydrate_applet).transpose()
    }

    async fn list_resources(&self, kind: ResourceKind) -> RhilexResult<Vec<ResourceDef>> {
        let rows = sqlx::query(&format!("SELECT * FROM {} ORDER BY rowid", table(kind)?))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_resource).collect()
    }

    async fn list_rules(&self) -> RhilexResult<Vec<RuleDef>> {
        let rows = sqlx::query("SELECT * FROM m_rules ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_rule).collect()
    }

    async fn list_applets(&self) -> RhilexResult<Vec<AppletDef>> {
        let rows = sqlx::query("SELECT * FROM m_applets ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_applet).collect()
    }

    async fn device_points(&self, device_id: &str) -> RhilexResult<Vec<ModbusPointRow>> {
        let rows = sqlx::query(
            "SELECT * FROM m_modbus_data_points WHERE device_uuid = ? ORDER BY rowid",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(hydrate_point).collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use rhilex_core::types::{cecolla_types, source_types};

    #[tokio::test]
    async fn test_resource_round_trip_keeps_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        for id in ["s2", "s1"] {
            let def = ResourceDef::new(
                id,
                "udp",
                source_types::RHILEX_UDP,
                serde_json::json!({"host": "0.0.0.0", "port": 2583}),
            );
            store.save_resource(ResourceKind::Source, &def).await.unwrap();
        }
        let all = store.list_resources(ResourceKind::Source).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|d| d.uuid.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
        assert_eq!(all[0].config["port"], 2583);

        store.delete_resource(ResourceKind::Source, "s2").await.unwrap();
        assert!(store.get_source("s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cecolla_keeps_action_script() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut def = ResourceDef::new(
            "c1",
            "hub",
            cecolla_types::ITHINGS_IOTHUB_CEC,
            serde_json::json!({}),
        );
        def.action = Some("function Main(uuid, env) return 0 end".into());
        store.save_resource(ResourceKind::Cecolla, &def).await.unwrap();
        let loaded = store.get_cecolla("c1").await.unwrap().unwrap();
        assert_eq!(loaded, def);
    }

    #[tokio::test]
    async fn test_rules_applets_and_points() {
        let store = SqliteStore::in_memory().await.unwrap();
        let rule = RuleDef {
            uuid: "r1".into(),
            name: "rule".into(),
            from_source: None,
            from_device: Some("d1".into()),
            success: "function Success() end".into(),
            actions: "Actions = {}".into(),
            failed: "function Failed(e) end".into(),
            description: String::new(),
            status: RuleStatus::Stop,
        };
        store.save_rule(&rule).await.unwrap();
        assert_eq!(store.get_rule("r1").await.unwrap().unwrap(), rule);

        let applet = AppletDef {
            uuid: "a1".into(),
            name: "app".into(),
            version: "1.0.0".into(),
            auto_start: true,
            script: "function Main(uuid, env) return 0 end".into(),
            description: String::new(),
        };
        store.save_applet(&applet).await.unwrap();
        assert!(store.list_applets().await.unwrap()[0].auto_start);

        let point = ModbusPointRow {
            uuid: "p1".into(),
            device_uuid: "d1".into(),
            tag: "temp".into(),
            alias: "Temperature".into(),
            function: 3,
            slaver_id: 1,
            address: 0,
            frequency: 100,
            quantity: 2,
            data_type: "INT16".into(),
            data_order: "AB".into(),
            weight: 1.0,
        };
        store.save_point(&point).await.unwrap();
        assert_eq!(store.device_points("d1").await.unwrap(), vec![point]);
        assert!(store.device_points("d2").await.unwrap().is_empty());
    }
}
