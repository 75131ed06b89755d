//! SQLite 数据库模块
//!
//! 以键值方式持久化仪表盘记录，整条记录序列化为一个 JSON 值

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

use crate::dash::model::record::DashRecord;

/// 仪表盘记录的键
const RECORD_KEY: &str = "dash_record";

/// 数据库连接包装器
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 打开或创建数据库
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = path.as_ref();

        // 确保父目录存在
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }

        let conn = Connection::open(path).with_context(|| format!("打开数据库失败: {:?}", path))?;

        // 使用 DELETE 模式，只保留单个 db 文件
        conn.execute_batch("PRAGMA journal_mode=DELETE;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(Arc::new(db))
    }

    /// 初始化数据库 schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(())
    }

    /// 读取原始值
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// 写入原始值（存在则覆盖）
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// 记录是否已经写入过
    pub fn has_record(&self) -> Result<bool> {
        Ok(self.get(RECORD_KEY)?.is_some())
    }

    /// 读取仪表盘记录，不存在时返回默认值
    pub fn load_record(&self) -> Result<DashRecord> {
        match self.get(RECORD_KEY)? {
            Some(json) => serde_json::from_str(&json).context("解析仪表盘记录失败"),
            None => Ok(DashRecord::default()),
        }
    }

    /// 保存仪表盘记录
    pub fn save_record(&self, record: &DashRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("序列化仪表盘记录失败")?;
        self.put(RECORD_KEY, &json)
    }

    /// 读取-修改-写回，整个过程持有连接锁
    pub fn update_record<F, T>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut DashRecord) -> T,
    {
        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![RECORD_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let mut record = match current {
            Some(json) => serde_json::from_str(&json).context("解析仪表盘记录失败")?,
            None => DashRecord::default(),
        };

        let result = mutate(&mut record);

        let json = serde_json::to_string(&record).context("序列化仪表盘记录失败")?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
            params![RECORD_KEY, json],
        )?;
        Ok(result)
    }
}
