//! Entry types known to a destination, learned from the metadata topic.

use crate::codec::TypeDescriptor;
use crate::error::{CdcError, Result};
use crate::store::EntryStore;
use crate::transport::{Transport, OFFSET_START};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

struct RegistryState {
    cursor: String,
    types: HashMap<String, TypeDescriptor>,
}

/// Descriptors read so far from one metadata topic.
///
/// Shared by all workers of a destination streamer; refreshes are
/// serialized so each descriptor is registered with the store once.
pub struct TypeRegistry {
    metadata_topic: String,
    conflict_field: Option<String>,
    state: Mutex<RegistryState>,
}

impl TypeRegistry {
    /// `conflict_field` is the top-level payload field every type must
    /// carry for cross-cluster field resolution, if one is configured.
    pub fn new(metadata_topic: impl Into<String>, conflict_field: Option<String>) -> Self {
        Self {
            metadata_topic: metadata_topic.into(),
            conflict_field,
            state: Mutex::new(RegistryState {
                cursor: OFFSET_START.to_string(),
                types: HashMap::new(),
            }),
        }
    }

    /// Read new descriptors and register them with the store.
    ///
    /// Returns how many types were registered. A store failure leaves the
    /// failing descriptor unread so the next refresh retries it.
    pub async fn refresh<S: EntryStore + ?Sized>(&self, transport: &dyn Transport, store: &S) -> Result<usize> {
        let mut state = self.state.lock().await;
        let records = transport.read_metadata(&self.metadata_topic, &state.cursor).await?;
        let mut registered = 0;

        for record in records {
            let descriptor = match TypeDescriptor::decode(&record.data) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        topic = %self.metadata_topic,
                        offset = %record.offset,
                        error = %e,
                        "Skipping malformed type descriptor"
                    );
                    state.cursor = record.offset;
                    continue;
                }
            };

            if state.types.contains_key(&descriptor.type_name) {
                debug!(type_name = %descriptor.type_name, "Type already registered");
                state.cursor = record.offset;
                continue;
            }

            store.register_type(&descriptor).await.map_err(CdcError::from)?;

            if let Some(field) = &self.conflict_field {
                if !descriptor.has_field(field) {
                    error!(
                        type_name = %descriptor.type_name,
                        conflict_field = %field,
                        "Replicated type has no conflict resolution field; cross-cluster conflicts for it stay unresolved"
                    );
                }
            }

            info!(
                type_name = %descriptor.type_name,
                type_id = descriptor.type_id,
                fields = descriptor.fields.len(),
                "Registered replicated type"
            );
            crate::metrics::record_type_registered(&self.metadata_topic);
            state.types.insert(descriptor.type_name.clone(), descriptor);
            state.cursor = record.offset;
            registered += 1;
        }

        Ok(registered)
    }

    pub async fn contains(&self, type_name: &str) -> bool {
        self.state.lock().await.types.contains_key(type_name)
    }

    pub async fn descriptor(&self, type_name: &str) -> Option<TypeDescriptor> {
        self.state.lock().await.types.get(type_name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.types.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
