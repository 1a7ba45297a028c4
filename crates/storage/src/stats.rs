//! Aggregate usage queries backing the admin surface.

use rusqlite::params;
use serde::Serialize;

use relay_domain::Result;

use crate::{sql_err, Storage};

/// Per-user row/last-activity aggregate (chat or tool usage).
#[derive(Debug, Clone, Serialize)]
pub struct UserStat {
    pub user_id: String,
    pub count: usize,
    pub last_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolUsageStat {
    pub tool: String,
    pub count: usize,
    pub ok_count: usize,
    pub last_time: f64,
}

impl Storage {
    pub fn user_chat_stats(&self) -> Result<Vec<UserStat>> {
        self.user_stats("chat_history")
    }

    pub fn user_tool_stats(&self) -> Result<Vec<UserStat>> {
        self.user_stats("tool_logs")
    }

    fn user_stats(&self, table: &str) -> Result<Vec<UserStat>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT user_id, COUNT(*), MAX(timestamp) FROM {table} GROUP BY user_id"
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserStat {
                    user_id: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                    last_time: row.get(2)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Per-tool invocation totals, optionally scoped to one user.
    pub fn tool_usage_stats(&self, user_id: Option<&str>) -> Result<Vec<ToolUsageStat>> {
        let conn = self.conn.lock();
        let sql = "SELECT tool, COUNT(*), SUM(ok), MAX(timestamp)
                   FROM tool_logs
                   WHERE (?1 IS NULL OR user_id = ?1)
                   GROUP BY tool
                   ORDER BY COUNT(*) DESC";
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(ToolUsageStat {
                    tool: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                    ok_count: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
                    last_time: row.get(3)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }
}
