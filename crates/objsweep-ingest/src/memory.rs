//! In-memory object store and destination
//!
//! Used by the test suites and for local dry runs. Both support failure
//! injection so partial-failure paths can be exercised deterministically.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use objsweep_common::{ObjectDescriptor, Record, RecordValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::store::{DestinationStore, ObjectBody, ObjectPage, ObjectStore};

const DEFAULT_PAGE_SIZE: usize = 1000;

struct StoredObject {
    descriptor: ObjectDescriptor,
    content: Vec<u8>,
}

/// Bucket contents held in memory, listed in key order
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    page_size: usize,
    page_layout: Vec<usize>,
    unavailable: bool,
    failing_keys: Mutex<HashSet<String>>,
    list_calls: AtomicUsize,
    fetched: Mutex<Vec<String>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            page_layout: Vec::new(),
            unavailable: false,
            failing_keys: Mutex::new(HashSet::new()),
            list_calls: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Explicit sizes for the first pages of every listing; a zero produces an
    /// empty page. Pages after the layout use the regular page size.
    pub fn with_page_layout(mut self, layout: Vec<usize>) -> Self {
        self.page_layout = layout;
        self
    }

    /// Make every listing fail as if the bucket were missing
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn put(&self, bucket: &str, key: &str, content: impl Into<Vec<u8>>) {
        let content = content.into();
        let descriptor = ObjectDescriptor::new(bucket, key, content.len() as i64)
            .with_last_modified(chrono::Utc::now());
        self.put_descriptor(descriptor, content);
    }

    /// Store an object whose listed size may disagree with its content
    pub fn put_descriptor(&self, descriptor: ObjectDescriptor, content: Vec<u8>) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            (descriptor.bucket.clone(), descriptor.key.clone()),
            StoredObject {
                descriptor,
                content,
            },
        );
    }

    /// Make `get_object` fail for this key
    pub fn fail_key(&self, key: &str) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Keys passed to `get_object`, in call order
    pub fn fetched_keys(&self) -> Vec<String> {
        self.fetched.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn page_len(&self, page_index: usize) -> usize {
        self.page_layout
            .get(page_index)
            .copied()
            .unwrap_or(self.page_size)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ObjectPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if self.unavailable {
            bail!("NoSuchBucket: The specified bucket does not exist: {}", bucket);
        }

        // Token format: "<page index>:<offset>"
        let (page_index, offset) = match token {
            None => (0usize, 0usize),
            Some(token) => {
                let (page, offset) = token
                    .split_once(':')
                    .ok_or_else(|| anyhow!("Invalid continuation token: {}", token))?;
                (page.parse()?, offset.parse()?)
            },
        };

        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<&ObjectDescriptor> = objects
            .iter()
            .filter(|((b, key), _)| b == bucket && key.starts_with(prefix))
            .map(|(_, stored)| &stored.descriptor)
            .collect();

        let take = self.page_len(page_index);
        let end = (offset + take).min(matching.len());
        let page_objects: Vec<ObjectDescriptor> =
            matching[offset.min(end)..end].iter().map(|d| (*d).clone()).collect();

        let more_layout = page_index + 1 < self.page_layout.len();
        let next_token = if end < matching.len() || more_layout {
            Some(format!("{}:{}", page_index + 1, end))
        } else {
            None
        };

        Ok(ObjectPage {
            objects: page_objects,
            next_token,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        self.fetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());

        if self
            .failing_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
        {
            bail!("Connection reset while fetching s3://{}/{}", bucket, key);
        }

        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let stored = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| anyhow!("NoSuchKey: s3://{}/{}", bucket, key))?;

        Ok(Box::new(Cursor::new(stored.content.clone())))
    }
}

#[derive(Default)]
struct MemoryTable {
    columns: Vec<String>,
    unique: Option<String>,
    rows: Vec<Record>,
}

/// Destination tables held in memory with all-or-nothing inserts
#[derive(Default)]
pub struct MemoryDestination {
    tables: Mutex<HashMap<String, MemoryTable>>,
    unavailable: bool,
    fail_inserts: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table and its columns; inserts naming other columns fail
    pub fn with_table(self, table: &str, columns: &[&str]) -> Self {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                table.to_string(),
                MemoryTable {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    ..Default::default()
                },
            );
        self
    }

    /// Add a uniqueness constraint on one column of a declared table
    pub fn with_unique(self, table: &str, column: &str) -> Self {
        if let Some(t) = self
            .tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(table)
        {
            t.unique = Some(column.to_string());
        }
        self
    }

    /// Make every query fail as if the server were unreachable
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Fail the next `count` insert calls after staging half of their rows
    pub fn fail_next_inserts(&self, count: usize) {
        self.fail_inserts.store(count, Ordering::SeqCst);
    }

    /// Seed committed rows without going through `insert_rows`
    pub fn seed(&self, table: &str, record: Record) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.entry(table.to_string()).or_default().rows.push(record);
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn distinct_values(&self, table: &str, column: &str, limit: i64) -> Result<Vec<String>> {
        if self.unavailable {
            bail!("Connection refused");
        }

        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let table = tables
            .get(table)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))?;

        let mut seen = HashSet::new();
        let values = table
            .rows
            .iter()
            .filter_map(|row| row.get(column).and_then(RecordValue::as_text))
            .filter(|value| seen.insert(value.to_string()))
            .take(limit.max(0) as usize)
            .map(str::to_string)
            .collect();

        Ok(values)
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<RecordValue>],
    ) -> Result<u64> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        if self.unavailable {
            bail!("Connection refused");
        }

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let target = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))?;

        if !target.columns.is_empty() {
            if let Some(unknown) = columns.iter().find(|c| !target.columns.contains(*c)) {
                bail!("column \"{}\" of relation \"{}\" does not exist", unknown, table);
            }
        }

        let injected_failure = self
            .fail_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        // Stage into a scratch buffer; only a fully accepted batch is committed
        let mut staged: Vec<Record> = Vec::with_capacity(rows.len());
        for (index, values) in rows.iter().enumerate() {
            if injected_failure && index >= rows.len() / 2 {
                bail!("Connection lost after {} of {} rows", index, rows.len());
            }

            let mut record = Record::new();
            for (column, value) in columns.iter().zip(values) {
                record.insert(column.clone(), value.clone());
            }

            if let Some(unique) = &target.unique {
                let value = record.get(unique).cloned();
                let duplicate = target
                    .rows
                    .iter()
                    .chain(staged.iter())
                    .any(|existing| existing.get(unique).cloned() == value);
                if duplicate {
                    bail!("duplicate key value violates unique constraint on \"{}\"", unique);
                }
            }

            staged.push(record);
        }

        let inserted = staged.len() as u64;
        target.rows.extend(staged);
        Ok(inserted)
    }
}
