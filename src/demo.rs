use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::store::{keys, read_json, write_json, KeyValueStore};
use crate::{ClientError, Method};

/// Offline stand-in for the live service: same endpoint/method surface,
/// state kept in the persistent local store, responses delayed to feel like
/// a network.
#[async_trait]
pub trait SimulatedBackend: Send + Sync {
    async fn handle(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<Value, ClientError>;
}

/// Generic record store keyed by endpoint collection. `orders/42` addresses
/// the record with `"id": "42"` inside the `demo:orders` collection.
pub struct DemoBackend {
    store: Arc<dyn KeyValueStore>,
    latency: Duration,
    write_gate: Mutex<()>,
}

impl DemoBackend {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, latency: Duration) -> Self {
        Self {
            store,
            latency,
            write_gate: Mutex::new(()),
        }
    }

    async fn collection(&self, name: &str) -> Result<Vec<Value>, ClientError> {
        Ok(read_json(self.store.as_ref(), &keys::demo(name))
            .await?
            .unwrap_or_default())
    }

    async fn save_collection(&self, name: &str, records: &[Value]) -> Result<(), ClientError> {
        write_json(self.store.as_ref(), &keys::demo(name), records).await
    }
}

fn split_endpoint(endpoint: &str) -> (String, Option<String>) {
    let trimmed = endpoint.trim_matches('/');
    match trimmed.split_once('/') {
        Some((collection, id)) if !id.is_empty() => {
            (collection.to_string(), Some(id.to_string()))
        }
        _ => (trimmed.to_string(), None),
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

fn not_found(endpoint: &str) -> ClientError {
    ClientError::Api {
        status: 404,
        message: format!("no demo record at '{endpoint}'"),
    }
}

fn require_object(body: Option<Value>) -> Result<Map<String, Value>, ClientError> {
    match body {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(ClientError::Validation(
            "demo mutations require a JSON object body".into(),
        )),
    }
}

#[async_trait]
impl SimulatedBackend for DemoBackend {
    async fn handle(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        tokio::time::sleep(self.latency).await;

        let (collection, id) = split_endpoint(endpoint);
        if collection.is_empty() {
            return Err(ClientError::Validation("empty demo endpoint".into()));
        }
        debug!(%collection, ?id, %method, "demo request");

        match method {
            Method::Get => {
                let records = self.collection(&collection).await?;
                match id {
                    Some(id) => records
                        .into_iter()
                        .find(|r| record_id(r) == Some(id.as_str()))
                        .ok_or_else(|| not_found(endpoint)),
                    None => Ok(Value::Array(records)),
                }
            }
            Method::Post => {
                let mut record = require_object(body)?;
                record
                    .entry("id".to_string())
                    .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
                let record = Value::Object(record);

                let _gate = self.write_gate.lock().await;
                let mut records = self.collection(&collection).await?;
                records.push(record.clone());
                self.save_collection(&collection, &records).await?;
                Ok(record)
            }
            Method::Put | Method::Patch => {
                let id = id.ok_or_else(|| {
                    ClientError::Validation("demo updates require a record id".into())
                })?;
                let update = require_object(body)?;

                let _gate = self.write_gate.lock().await;
                let mut records = self.collection(&collection).await?;
                let Some(position) = records
                    .iter()
                    .position(|r| record_id(r) == Some(id.as_str()))
                else {
                    return Err(not_found(endpoint));
                };

                let updated = if method == Method::Put {
                    let mut replacement = update;
                    replacement.insert("id".to_string(), Value::String(id));
                    Value::Object(replacement)
                } else {
                    let mut merged = match &records[position] {
                        Value::Object(existing) => existing.clone(),
                        _ => Map::new(),
                    };
                    for (key, value) in update {
                        merged.insert(key, value);
                    }
                    Value::Object(merged)
                };

                records[position] = updated.clone();
                self.save_collection(&collection, &records).await?;
                Ok(updated)
            }
            Method::Delete => {
                let id = id.ok_or_else(|| {
                    ClientError::Validation("demo deletes require a record id".into())
                })?;

                let _gate = self.write_gate.lock().await;
                let mut records = self.collection(&collection).await?;
                let before = records.len();
                records.retain(|r| record_id(r) != Some(id.as_str()));
                if records.len() == before {
                    return Err(not_found(endpoint));
                }
                self.save_collection(&collection, &records).await?;
                Ok(Value::Null)
            }
        }
    }
}

impl std::fmt::Debug for DemoBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoBackend")
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}
