//! The registry tree and REPE request dispatch over it.

use crate::error::RegistryError;
use crate::pointer::{parse_index, parse_pointer};
use repe_protocol::{BodyCodecs, BodyFormat, Message};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A callable registry entry. Mapping bodies arrive as keyword-style
/// arguments, sequence bodies as positional ones.
pub type Callable = Arc<dyn Fn(Value) -> Result<Value, RegistryError> + Send + Sync>;

/// A node in the registry tree.
#[derive(Clone)]
pub enum Entry {
    /// A leaf value; pointers may continue into it (object keys and
    /// array indices).
    Value(Value),
    /// A callable.
    Callable(Callable),
    /// A nested mapping of named entries.
    Map(HashMap<String, Entry>),
}

impl Entry {
    pub fn value(value: Value) -> Self {
        Entry::Value(value)
    }

    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, RegistryError> + Send + Sync + 'static,
    {
        Entry::Callable(Arc::new(f))
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Entry::Callable(_) => f.write_str("Callable"),
            Entry::Map(map) => f.debug_tuple("Map").field(&map.keys()).finish(),
        }
    }
}

/// What a read resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    Function,
}

/// A JSON-Pointer-addressed tree of values and callables.
#[derive(Default)]
pub struct Registry {
    root: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an entry at `path`, creating intermediate mappings for
    /// non-terminal segments. The empty path is refused.
    pub fn register(&self, path: &str, entry: Entry) -> Result<(), RegistryError> {
        let segments = parse_pointer(path)?;
        if segments.is_empty() {
            return Err(RegistryError::EmptyPath);
        }

        let mut root = self.root.write().unwrap();
        let mut map = &mut *root;
        for segment in &segments[..segments.len() - 1] {
            let slot = map
                .entry(segment.clone())
                .or_insert_with(|| Entry::Map(HashMap::new()));
            match slot {
                Entry::Map(inner) => map = inner,
                _ => return Err(RegistryError::NotTraversable(segment.clone())),
            }
        }
        map.insert(segments.last().unwrap().clone(), entry);
        Ok(())
    }

    /// Installs a leaf value at `path`.
    pub fn register_value(&self, path: &str, value: Value) -> Result<(), RegistryError> {
        self.register(path, Entry::Value(value))
    }

    /// Installs a callable at `path`.
    pub fn register_fn<F>(&self, path: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Result<Value, RegistryError> + Send + Sync + 'static,
    {
        self.register(path, Entry::callable(f))
    }

    /// Overlays the keys of a mapping onto the mapping at `base`,
    /// creating intermediate mappings as needed. `base` may be the root.
    pub fn merge(&self, base: &str, value: Value) -> Result<(), RegistryError> {
        let Value::Object(entries) = value else {
            return Err(RegistryError::RootWriteRequiresMapping);
        };
        let segments = parse_pointer(base)?;

        let mut root = self.root.write().unwrap();
        let mut map = &mut *root;
        for segment in &segments {
            let slot = map
                .entry(segment.clone())
                .or_insert_with(|| Entry::Map(HashMap::new()));
            match slot {
                Entry::Map(inner) => map = inner,
                _ => return Err(RegistryError::NotTraversable(segment.clone())),
            }
        }
        for (key, entry_value) in entries {
            map.insert(key, Entry::Value(entry_value));
        }
        Ok(())
    }

    /// Reads the value (or function marker) at `path`.
    pub fn read(&self, path: &str) -> Result<Resolved, RegistryError> {
        let segments = parse_pointer(path)?;
        let root = self.root.read().unwrap();
        match lookup(&root, &segments, path)? {
            Target::Value(value) => Ok(Resolved::Value(value)),
            Target::Callable(_) => Ok(Resolved::Function),
        }
    }

    /// Calls the callable at `path` with `args`.
    pub fn call(&self, path: &str, args: Value) -> Result<Value, RegistryError> {
        let segments = parse_pointer(path)?;
        let callable = {
            let root = self.root.read().unwrap();
            match lookup(&root, &segments, path)? {
                Target::Callable(f) => f,
                Target::Value(_) => return Err(RegistryError::NotFound(path.to_owned())),
            }
        };
        // The lock is released before user code runs.
        callable(args)
    }

    /// Replaces the value at `path`. The root cannot be set directly;
    /// use [`Registry::merge`].
    pub fn write(&self, path: &str, value: Value) -> Result<(), RegistryError> {
        let segments = parse_pointer(path)?;
        if segments.is_empty() {
            return Err(RegistryError::EmptyPath);
        }
        let mut root = self.root.write().unwrap();
        write_in_map(&mut root, &segments, value)
    }

    /// Dispatches a REPE request against this registry: empty body reads,
    /// a body on a callable calls, any other body writes.
    pub fn handle_request(&self, request: &Message, codecs: &BodyCodecs) -> Message {
        match self.try_handle(request, codecs) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "registry request failed");
                Message::error_response_to(request, e.code(), e.to_string())
            }
        }
    }

    fn try_handle(
        &self,
        request: &Message,
        codecs: &BodyCodecs,
    ) -> Result<Message, RegistryError> {
        let path = request
            .parse_query()
            .map_err(RegistryError::Protocol)?
            .to_owned();

        if request.body.is_empty() {
            // READ
            let value = match self.read(&path)? {
                Resolved::Value(value) => value,
                Resolved::Function => json!({"type": "function", "path": path}),
            };
            return Ok(Message::response_to(request)
                .with_value(&value, BodyFormat::Json, codecs)?);
        }

        let body = request.parse_body(codecs)?.into_value()?;

        let segments = parse_pointer(&path)?;
        let callable = {
            let root = self.root.read().unwrap();
            match lookup(&root, &segments, &path) {
                Ok(Target::Callable(f)) => Some(f),
                _ => None,
            }
        };

        if let Some(callable) = callable {
            // CALL
            let result = callable(body)?;
            return Ok(Message::response_to(request)
                .with_value(&result, BodyFormat::Json, codecs)?);
        }

        // WRITE
        if segments.is_empty() {
            self.merge("", body)?;
        } else {
            self.write(&path, body)?;
        }
        Ok(Message::response_to(request).with_value(&Value::Null, BodyFormat::Json, codecs)?)
    }

    /// Renders the whole tree as JSON; callables become descriptors.
    pub fn snapshot(&self) -> Value {
        let root = self.root.read().unwrap();
        map_to_value(&root)
    }
}

/// Internal resolution target: an owned value snapshot or a callable.
enum Target {
    Value(Value),
    Callable(Callable),
}

fn lookup(
    map: &HashMap<String, Entry>,
    segments: &[String],
    path: &str,
) -> Result<Target, RegistryError> {
    let Some((first, rest)) = segments.split_first() else {
        return Ok(Target::Value(map_to_value(map)));
    };

    let entry = map
        .get(first)
        .ok_or_else(|| RegistryError::NotFound(path.to_owned()))?;
    match entry {
        Entry::Map(inner) => lookup(inner, rest, path),
        Entry::Callable(f) => {
            if rest.is_empty() {
                Ok(Target::Callable(f.clone()))
            } else {
                Err(RegistryError::NotFound(path.to_owned()))
            }
        }
        Entry::Value(value) => {
            let mut current = value;
            for segment in rest {
                current = value_get(current, segment, path)?;
            }
            Ok(Target::Value(current.clone()))
        }
    }
}

fn value_get<'a>(
    value: &'a Value,
    segment: &str,
    path: &str,
) -> Result<&'a Value, RegistryError> {
    match value {
        Value::Object(map) => map
            .get(segment)
            .ok_or_else(|| RegistryError::NotFound(path.to_owned())),
        Value::Array(items) => {
            let index = parse_index(segment)?;
            items
                .get(index)
                .ok_or(RegistryError::IndexOutOfRange(index))
        }
        _ => Err(RegistryError::NotTraversable(segment.to_owned())),
    }
}

fn write_in_map(
    map: &mut HashMap<String, Entry>,
    segments: &[String],
    value: Value,
) -> Result<(), RegistryError> {
    let (first, rest) = segments.split_first().expect("segments checked non-empty");
    if rest.is_empty() {
        map.insert(first.clone(), Entry::Value(value));
        return Ok(());
    }
    match map.get_mut(first) {
        Some(Entry::Map(inner)) => write_in_map(inner, rest, value),
        Some(Entry::Value(target)) => write_in_value(target, rest, value),
        Some(Entry::Callable(_)) | None => Err(RegistryError::NotFound(first.clone())),
    }
}

fn write_in_value(
    target: &mut Value,
    segments: &[String],
    value: Value,
) -> Result<(), RegistryError> {
    let (first, rest) = segments.split_first().expect("segments checked non-empty");
    if rest.is_empty() {
        return match target {
            Value::Object(map) => {
                map.insert(first.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                let index = parse_index(first)?;
                if index >= items.len() {
                    return Err(RegistryError::IndexOutOfRange(index));
                }
                items[index] = value;
                Ok(())
            }
            _ => Err(RegistryError::NotTraversable(first.clone())),
        };
    }
    let next = match target {
        Value::Object(map) => map
            .get_mut(first)
            .ok_or_else(|| RegistryError::NotFound(first.clone()))?,
        Value::Array(items) => {
            let index = parse_index(first)?;
            items
                .get_mut(index)
                .ok_or(RegistryError::IndexOutOfRange(index))?
        }
        _ => return Err(RegistryError::NotTraversable(first.clone())),
    };
    write_in_value(next, rest, value)
}

fn map_to_value(map: &HashMap<String, Entry>) -> Value {
    let mut out = Map::new();
    for (key, entry) in map {
        let rendered = match entry {
            Entry::Value(value) => value.clone(),
            Entry::Callable(_) => json!({"type": "function"}),
            Entry::Map(inner) => map_to_value(inner),
        };
        out.insert(key.clone(), rendered);
    }
    Value::Object(out)
}
