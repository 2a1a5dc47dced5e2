//! Playbook pipeline state, shared across workers through redis.
//!
//! Layout:
//!   key `{vmId}`          -> hash {key, name, status}
//!   key `pb_logs_{vmId}`  -> hash {returncode, stdout, stderr}

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::Result;

/// One per-VM pipeline record. `key` is the private part of the keypair the
/// playbook runner logs in with; it lives here so any worker can pick the
/// deployment up.
#[derive(Debug, Clone)]
pub struct PipelineRecord {
    pub key: String,
    pub name: String,
    pub status: String,
}

#[derive(Clone)]
pub struct PipelineStore {
    conn: ConnectionManager,
}

fn logs_key(openstack_id: &str) -> String {
    format!("pb_logs_{openstack_id}")
}

impl PipelineStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis connection created");
        Ok(Self { conn })
    }

    pub async fn put(&self, openstack_id: &str, record: &PipelineRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(
            openstack_id,
            &[
                ("key", record.key.as_str()),
                ("name", record.name.as_str()),
                ("status", record.status.as_str()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, openstack_id: &str, status: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(openstack_id, "status", status).await?;
        Ok(())
    }

    pub async fn get_status(&self, openstack_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(openstack_id, "status").await?)
    }

    pub async fn get_private_key(&self, openstack_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(openstack_id, "key").await?)
    }

    pub async fn get_name(&self, openstack_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(openstack_id, "name").await?)
    }

    pub async fn exists(&self, openstack_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(openstack_id).await?)
    }

    pub async fn delete(&self, openstack_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(openstack_id).await?;
        Ok(())
    }

    /// Keep the runner's last output around after a forced stop.
    pub async fn stash_logs(
        &self,
        openstack_id: &str,
        returncode: i32,
        stdout: &str,
        stderr: &str,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(
            logs_key(openstack_id),
            &[
                ("returncode", returncode.to_string().as_str()),
                ("stdout", stdout),
                ("stderr", stderr),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_stashed_logs(
        &self,
        openstack_id: &str,
    ) -> Result<Option<(i32, String, String)>> {
        let mut conn = self.conn.clone();
        let values: Option<(Option<String>, Option<String>, Option<String>)> = conn
            .hget(logs_key(openstack_id), &["returncode", "stdout", "stderr"])
            .await?;
        Ok(values.and_then(|(rc, stdout, stderr)| {
            let rc = rc?.parse().ok()?;
            Some((rc, stdout.unwrap_or_default(), stderr.unwrap_or_default()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_key_namespace() {
        assert_eq!(logs_key("abc-123"), "pb_logs_abc-123");
    }
}
