use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use toolgate_protocol::{AdapterContext, AdapterError, AdapterResult, ChangeId, ToolAdapter};
use tracing::{debug, instrument, warn};

use super::{dry_run_result, parse_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Some(Self::Json),
            Some("toml") => Some(Self::Toml),
            _ => None,
        }
    }

    fn parse(self, text: &str) -> Result<Document, AdapterError> {
        match self {
            Self::Json if text.trim().is_empty() => Ok(Document::Json(Map::new())),
            Self::Json => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => Ok(Document::Json(map)),
                Ok(_) => Err(AdapterError::InvalidArgs(
                    "config document must be an object at the top level".to_owned(),
                )),
                Err(err) => Err(AdapterError::InvalidArgs(format!(
                    "existing file is not JSON: {err}"
                ))),
            },
            Self::Toml => toml::from_str::<toml::Table>(text)
                .map(Document::Toml)
                .map_err(|err| AdapterError::InvalidArgs(format!("existing file is not TOML: {err}"))),
        }
    }
}

/// A parsed config file, kept in its native value model so TOML-only types
/// such as datetimes survive an edit.
#[derive(Debug)]
enum Document {
    Json(Map<String, Value>),
    Toml(toml::Table),
}

impl Document {
    fn apply(&mut self, edit: Edit) -> Result<Vec<String>, AdapterError> {
        match self {
            Self::Json(table) => edit.apply_to(table),
            Self::Toml(table) => edit.apply_to(table),
        }
    }

    fn render(&self) -> Result<String, AdapterError> {
        match self {
            Self::Json(table) => serde_json::to_string_pretty(table)
                .map(|mut text| {
                    text.push('\n');
                    text
                })
                .map_err(|err| AdapterError::InvalidArgs(err.to_string())),
            Self::Toml(table) => toml::to_string_pretty(table)
                .map_err(|err| AdapterError::InvalidArgs(format!("value not representable in TOML: {err}"))),
        }
    }
}

/// Table operations shared by the JSON and TOML value models.
trait ConfigTable {
    type Item: Clone + PartialEq;

    fn convert(value: Value) -> Result<Self::Item, AdapterError>;

    /// The nested table under `key`, created when absent. `None` when `key`
    /// holds something other than a table.
    fn child(&mut self, key: &str) -> Option<&mut Self>;

    fn get_item(&self, key: &str) -> Option<&Self::Item>;

    fn put(&mut self, key: String, item: Self::Item) -> Option<Self::Item>;
}

impl ConfigTable for Map<String, Value> {
    type Item = Value;

    fn convert(value: Value) -> Result<Value, AdapterError> {
        Ok(value)
    }

    fn child(&mut self, key: &str) -> Option<&mut Self> {
        self.entry(key.to_owned())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
    }

    fn get_item(&self, key: &str) -> Option<&Value> {
        self.get(key)
    }

    fn put(&mut self, key: String, item: Value) -> Option<Value> {
        self.insert(key, item)
    }
}

impl ConfigTable for toml::Table {
    type Item = toml::Value;

    fn convert(value: Value) -> Result<toml::Value, AdapterError> {
        if value.is_null() {
            return Err(AdapterError::InvalidArgs("TOML has no null value".to_owned()));
        }
        toml::Value::try_from(value)
            .map_err(|err| AdapterError::InvalidArgs(format!("value not representable in TOML: {err}")))
    }

    fn child(&mut self, key: &str) -> Option<&mut Self> {
        self.entry(key.to_owned())
            .or_insert(toml::Value::Table(toml::Table::new()))
            .as_table_mut()
    }

    fn get_item(&self, key: &str) -> Option<&toml::Value> {
        self.get(key)
    }

    fn put(&mut self, key: String, item: toml::Value) -> Option<toml::Value> {
        self.insert(key, item)
    }
}

#[derive(Debug)]
enum Edit {
    SetKey { key: String, value: Value },
    Merge(Map<String, Value>),
}

impl Edit {
    fn apply_to<T: ConfigTable>(self, table: &mut T) -> Result<Vec<String>, AdapterError> {
        match self {
            Self::SetKey { key, value } => set_dotted(table, &key, value),
            Self::Merge(patch) => merge_shallow(table, patch),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SetKeyArgs {
    path: String,
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct MergePatchArgs {
    path: String,
    patch: Map<String, Value>,
}

/// Edits allow-listed JSON/TOML files under a fixed root.
///
/// Edits to the same file are serialized from read through rename.
#[derive(Debug, Clone)]
pub struct ConfigPatcherAdapter {
    root: PathBuf,
    allowed_paths: Vec<String>,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ConfigPatcherAdapter {
    pub fn new(root: impl Into<PathBuf>, allowed_paths: Vec<String>) -> Self {
        Self {
            root: root.into(),
            allowed_paths: allowed_paths
                .into_iter()
                .map(|path| normalize(&path))
                .collect(),
            locks: Arc::default(),
        }
    }

    fn resolve(&self, requested: &str) -> Result<(PathBuf, ConfigFormat), AdapterError> {
        let relative = Path::new(requested);
        let escapes = relative.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        let normalized = normalize(requested);
        if escapes || !self.allowed_paths.contains(&normalized) {
            warn!(path = %requested, "config path refused by allow-list");
            return Err(AdapterError::not_allowed(format!(
                "path not allowed: {requested}"
            )));
        }
        let format = ConfigFormat::from_path(relative).ok_or_else(|| {
            AdapterError::InvalidArgs(format!("unsupported config format: {requested}"))
        })?;
        Ok((self.root.join(normalized), format))
    }

    fn file_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[instrument(skip(self, edit, ctx), fields(request_id = %ctx.request_id))]
    async fn apply(
        &self,
        path: &str,
        ctx: &AdapterContext,
        edit: Edit,
    ) -> Result<AdapterResult, AdapterError> {
        let (absolute, format) = self.resolve(path)?;
        let lock = self.file_lock(&absolute);
        let _guard = lock.lock().await;

        let previous = match fs::read(&absolute).await {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        let text = previous
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        let mut document = format.parse(&text)?;
        let keys_changed = document.apply(edit)?;
        let rendered = document.render()?;

        if ctx.dry_run {
            let mut extra = Map::new();
            extra.insert("path".to_owned(), json!(path));
            extra.insert("keys_changed".to_owned(), json!(keys_changed));
            return Ok(dry_run_result(
                format!("Would patch {path}: {}", keys_changed.join(", ")),
                extra,
            ));
        }

        write_atomically(&absolute, rendered.as_bytes()).await?;
        let change_id = ChangeId::generate();
        debug!(%change_id, path, changed = keys_changed.len(), "config patched");

        Ok(AdapterResult::success(json!({
            "change_id": change_id,
            "path": path,
            "keys_changed": keys_changed,
            "previous_sha256": previous.as_deref().map(sha256_hex),
            "new_sha256": sha256_hex(rendered.as_bytes()),
        })))
    }
}

#[async_trait]
impl ToolAdapter for ConfigPatcherAdapter {
    async fn run(
        &self,
        function: &str,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        match function {
            "set_key" => {
                let SetKeyArgs { path, key, value } = parse_args(args)?;
                self.apply(&path, ctx, Edit::SetKey { key, value }).await
            }
            "merge_patch" => {
                let MergePatchArgs { path, patch } = parse_args(args)?;
                self.apply(&path, ctx, Edit::Merge(patch)).await
            }
            other => Err(AdapterError::UnknownFunction(other.to_owned())),
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").to_owned()
}

/// Set `a.b.c`, creating intermediate tables. Returns the key when the value changed.
fn set_dotted<T: ConfigTable>(
    document: &mut T,
    key: &str,
    value: Value,
) -> Result<Vec<String>, AdapterError> {
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(AdapterError::InvalidArgs(format!("invalid key: {key}")));
    }
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(AdapterError::InvalidArgs(format!("invalid key: {key}")));
    };
    let item = T::convert(value)?;

    let mut cursor = document;
    for segment in parents {
        cursor = cursor.child(segment).ok_or_else(|| {
            AdapterError::InvalidArgs(format!("{segment} in {key} is not an object"))
        })?;
    }

    let previous = cursor.put((*leaf).to_owned(), item.clone());
    Ok(if previous.as_ref() == Some(&item) {
        Vec::new()
    } else {
        vec![key.to_owned()]
    })
}

fn merge_shallow<T: ConfigTable>(
    document: &mut T,
    patch: Map<String, Value>,
) -> Result<Vec<String>, AdapterError> {
    let mut changed = Vec::new();
    for (key, value) in patch {
        let item = T::convert(value)?;
        if document.get_item(&key) != Some(&item) {
            changed.push(key.clone());
        }
        document.put(key, item);
    }
    Ok(changed)
}

async fn write_atomically(target: &Path, contents: &[u8]) -> Result<(), AdapterError> {
    let parent = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).await?;
    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("config");
    let temp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let mut file = fs::File::create(&temp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp, target).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err.into());
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
