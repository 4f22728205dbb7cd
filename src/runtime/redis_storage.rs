use std::collections::HashMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;

use crate::runtime::storage::KvStore;

/// [`KvStore`] backed by one Redis hash per namespace.
pub struct RedisKvStore {
    client: redis::Client,
    prefix: String,
}

impl RedisKvStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid redis url {}", url))?;
        Ok(Self::new(client, prefix))
    }

    fn space_key(&self, namespace: &str) -> String {
        format!("{}:{}", self.prefix, namespace)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.hget(self.space_key(namespace), key).await?;

        match raw {
            Some(s) => {
                let value = serde_json::from_str(&s)
                    .with_context(|| format!("Corrupt value at {}/{}", namespace, key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw = serde_json::to_string(&value)?;
        let _: () = conn.hset(self.space_key(namespace), key, raw).await?;
        Ok(())
    }

    async fn has(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let exists: bool = conn.hexists(self.space_key(namespace), key).await?;
        Ok(exists)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.hdel(self.space_key(namespace), key).await?;
        Ok(())
    }

    async fn iterate(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw_map: HashMap<String, String> = conn.hgetall(self.space_key(namespace)).await?;

        let mut entries = Vec::with_capacity(raw_map.len());
        for (key, raw) in raw_map {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt value at {}/{}", namespace, key))?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}
