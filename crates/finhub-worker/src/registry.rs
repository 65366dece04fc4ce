//! Task registry
//!
//! A static table from handler key to [`TaskDescriptor`], built once at
//! startup and shared read-only afterwards. Looking up a key that was never
//! registered is a typed [`RegistryError::UnknownHandler`].

use crate::error::RegistryError;
use crate::fetch::Fetcher;
use crate::normalize::Normalizer;
use crate::schema::SchemaDescriptor;
use chrono::{Duration as ChronoDuration, NaiveDate};
use finhub_common::types::{Params, WorkItem};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Format of the bounds a [`DateWindow`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFormat {
    /// `YYYY-MM-DD`
    Date,
    /// Seconds since the epoch, at midnight UTC.
    UnixSeconds,
}

/// A trailing date range injected as two request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateWindow {
    pub days_back: i64,
    pub from_param: String,
    pub to_param: String,
    pub format: WindowFormat,
}

impl DateWindow {
    /// `from`/`to` as `YYYY-MM-DD`.
    pub fn days(days_back: i64) -> Self {
        Self {
            days_back,
            from_param: "from".to_string(),
            to_param: "to".to_string(),
            format: WindowFormat::Date,
        }
    }

    pub fn unix_seconds(mut self) -> Self {
        self.format = WindowFormat::UnixSeconds;
        self
    }

    fn bounds(&self, today: NaiveDate) -> (Value, Value) {
        let from = today - ChronoDuration::days(self.days_back);
        match self.format {
            WindowFormat::Date => (
                Value::String(from.format("%Y-%m-%d").to_string()),
                Value::String(today.format("%Y-%m-%d").to_string()),
            ),
            WindowFormat::UnixSeconds => {
                let seconds = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
                (
                    seconds(from).map(Value::from).unwrap_or(Value::Null),
                    seconds(today).map(Value::from).unwrap_or(Value::Null),
                )
            },
        }
    }
}

/// How to fetch, normalize and store one kind of work.
pub struct TaskDescriptor {
    handler_key: String,
    fetcher: Arc<dyn Fetcher>,
    normalizer: Normalizer,
    target: SchemaDescriptor,
    default_params: Params,
    subject_param: Option<String>,
    date_window: Option<DateWindow>,
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("handler_key", &self.handler_key)
            .field("fetcher", &self.fetcher.describe())
            .field("target", &self.target.table())
            .field("default_params", &self.default_params)
            .finish()
    }
}

impl TaskDescriptor {
    pub fn builder(
        handler_key: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        target: SchemaDescriptor,
    ) -> TaskDescriptorBuilder {
        TaskDescriptorBuilder {
            descriptor: TaskDescriptor {
                handler_key: handler_key.into(),
                fetcher,
                normalizer: Normalizer::default(),
                target,
                default_params: Params::new(),
                subject_param: Some("symbol".to_string()),
                date_window: None,
            },
        }
    }

    pub fn handler_key(&self) -> &str {
        &self.handler_key
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn target(&self) -> &SchemaDescriptor {
        &self.target
    }

    pub fn default_params(&self) -> &Params {
        &self.default_params
    }

    /// Parameters for one fetch.
    ///
    /// Later sources win: defaults, then the date window, then the subject id
    /// under the subject parameter, then the work item's own overrides.
    pub fn merge_params(&self, item: &WorkItem, today: NaiveDate) -> Params {
        let mut params = self.default_params.clone();

        if let Some(window) = &self.date_window {
            let (from, to) = window.bounds(today);
            params.insert(window.from_param.clone(), from);
            params.insert(window.to_param.clone(), to);
        }

        if let Some(subject_param) = &self.subject_param {
            params.insert(subject_param.clone(), Value::String(item.subject_id.clone()));
        }

        params.extend(item.params.clone());
        params
    }
}

/// Builder for [`TaskDescriptor`]
pub struct TaskDescriptorBuilder {
    descriptor: TaskDescriptor,
}

impl TaskDescriptorBuilder {
    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.descriptor.normalizer = normalizer;
        self
    }

    pub fn default_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.descriptor.default_params.insert(key.into(), value.into());
        self
    }

    /// Request parameter carrying the subject id. Defaults to `symbol`.
    pub fn subject_param(mut self, param: impl Into<String>) -> Self {
        self.descriptor.subject_param = Some(param.into());
        self
    }

    /// The subject id is not sent upstream.
    pub fn without_subject_param(mut self) -> Self {
        self.descriptor.subject_param = None;
        self
    }

    pub fn date_window(mut self, window: DateWindow) -> Self {
        self.descriptor.date_window = Some(window);
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.descriptor
    }
}

/// Handler key to descriptor table
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDescriptor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor under its handler key.
    pub fn register(&mut self, descriptor: TaskDescriptor) -> Result<(), RegistryError> {
        let key = descriptor.handler_key.clone();
        if key.trim().is_empty() {
            return Err(RegistryError::invalid_schema(
                descriptor.target.table(),
                "handler key is empty",
            ));
        }
        if self.tasks.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        self.tasks.insert(key, Arc::new(descriptor));
        Ok(())
    }

    pub fn resolve(&self, handler_key: &str) -> Result<Arc<TaskDescriptor>, RegistryError> {
        self.tasks
            .get(handler_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownHandler(handler_key.to_string()))
    }

    pub fn contains(&self, handler_key: &str) -> bool {
        self.tasks.contains_key(handler_key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
