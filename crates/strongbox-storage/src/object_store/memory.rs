//! In-process object store with fault injection

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use strongbox_core::{Error, Result};

use super::{ObjectInfo, ObjectStoreClient, UploadedPart};

const BACKEND: &str = "memory";

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    /// Outcome of the next upload_part calls: `true` transient, `false` permanent
    part_faults: Vec<bool>,
    fail_deletes: bool,
    part_attempts: u32,
    aborted_uploads: u32,
}

/// Object store kept in memory, with hooks to inject transfer failures
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<MemoryState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` part uploads fail
    pub fn fail_next_parts(&self, count: usize, transient: bool) {
        self.state().part_faults.extend(std::iter::repeat_n(transient, count));
    }

    /// Make every delete fail until reset
    pub fn fail_deletes(&self, fail: bool) {
        self.state().fail_deletes = fail;
    }

    /// Place an object directly, bypassing multipart
    pub fn insert(&self, key: &str, body: Vec<u8>) {
        self.state().objects.insert(key.to_string(), body);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Upload sessions started but neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    pub fn aborted_uploads(&self) -> u32 {
        self.state().aborted_uploads
    }

    pub fn part_attempts(&self) -> u32 {
        self.state().part_attempts
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn create_multipart(&self, key: &str) -> Result<String> {
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<UploadedPart> {
        let mut state = self.state();
        state.part_attempts += 1;

        if !state.part_faults.is_empty() {
            let transient = state.part_faults.remove(0);
            let message = format!("injected failure on part {}", part_number);
            return Err(if transient {
                Error::transient(BACKEND, message)
            } else {
                Error::permanent(BACKEND, message)
            });
        }

        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Error::permanent(BACKEND, format!("no such upload {}", upload_id)))?;
        upload.parts.insert(part_number, body);

        Ok(UploadedPart {
            part_number,
            etag: format!("{}-{}", upload_id, part_number),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let mut state = self.state();
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Error::permanent(BACKEND, format!("no such upload {}", upload_id)))?;

        let mut body = Vec::new();
        for (expected, part) in (1..).zip(&parts) {
            if part.part_number != expected {
                return Err(Error::permanent(BACKEND, "parts out of order"));
            }
            let data = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| Error::permanent(BACKEND, "InvalidPart"))?;
            body.extend_from_slice(data);
        }
        state.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state();
        state.uploads.remove(upload_id);
        state.aborted_uploads += 1;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.insert(key, body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.object(key)
            .ok_or_else(|| Error::permanent(BACKEND, format!("NoSuchKey: {}", key)))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| ObjectInfo {
                key: key.clone(),
                size: body.len() as u64,
            })
            .collect())
    }

    async fn delete_objects(&self, keys: Vec<String>) -> Result<()> {
        let mut state = self.state();
        if state.fail_deletes {
            return Err(Error::transient(BACKEND, "injected delete failure"));
        }
        for key in keys {
            state.objects.remove(&key);
        }
        Ok(())
    }
}
