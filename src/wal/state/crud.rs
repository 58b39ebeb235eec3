//! A generic map-backed CRUD sub-state built on the composed state machine's
//! mutator surface. External collaborator, illustrative of how application code
//! composes with §4.4/§4.5 (`SPEC_FULL.md` §4.8).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wal::codec::Codec;
use crate::wal::error::{Error, Result};
use crate::wal::state::compose::{ComposedStateMachine, SubState, STATE_TAG};
use crate::wal::state::State;

pub trait WithId {
    fn id(&self) -> &str;
}

#[derive(Serialize, Deserialize)]
struct CrudRequest<T> {
    #[serde(rename = "__state__")]
    state: String,
    upsert: Option<T>,
    insert: Option<T>,
    update: Option<T>,
    delete: Option<String>,
    delete_all: Option<bool>,
    bulk_upsert: Option<Vec<T>>,
}

type UpdateHook<T> = Box<dyn Fn(&T, bool) + Send + Sync>;

#[derive(Default)]
pub struct Hooks<T> {
    pub on_upsert: Vec<UpdateHook<T>>,
    pub on_insert: Vec<UpdateHook<T>>,
    pub on_update: Vec<UpdateHook<T>>,
    pub on_delete: Vec<UpdateHook<T>>,
}

/// A named sub-state holding `T` items keyed by [`WithId::id`]. Registered into
/// a [`ComposedStateMachine`]; mutations go through the coordinator's `apply`,
/// reads never touch the log.
pub struct Crud<T> {
    name: String,
    items: RwLock<HashMap<String, T>>,
    hooks: Hooks<T>,
}

impl<T: WithId + Clone + Send + Sync + 'static> Crud<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: RwLock::new(HashMap::new()),
            hooks: Hooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks<T>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items.read().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> Vec<T> {
        self.items.read().unwrap().values().cloned().collect()
    }

    pub fn find(&self, filter: impl Fn(&T) -> bool) -> Vec<T> {
        self.items
            .read()
            .unwrap()
            .values()
            .filter(|item| filter(item))
            .cloned()
            .collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for item in self.items.read().unwrap().values() {
            f(item);
        }
    }

    fn upsert_locked(&self, item: T) {
        let mut items = self.items.write().unwrap();
        let existed = items.contains_key(item.id());
        items.insert(item.id().to_string(), item.clone());
        drop(items);
        for hook in &self.hooks.on_upsert {
            hook(&item, existed);
        }
    }

    fn insert_locked(&self, item: T) -> Result<()> {
        let mut items = self.items.write().unwrap();
        if items.contains_key(item.id()) {
            return Err(Error::AlreadyExists);
        }
        items.insert(item.id().to_string(), item.clone());
        drop(items);
        for hook in &self.hooks.on_insert {
            hook(&item, true);
        }
        Ok(())
    }

    fn update_locked(&self, item: T) -> Result<()> {
        let mut items = self.items.write().unwrap();
        if !items.contains_key(item.id()) {
            return Err(Error::NotFoundItem);
        }
        items.insert(item.id().to_string(), item.clone());
        drop(items);
        for hook in &self.hooks.on_update {
            hook(&item, true);
        }
        Ok(())
    }

    fn delete_locked(&self, id: &str) -> Result<T> {
        let mut items = self.items.write().unwrap();
        let removed = items.remove(id);
        drop(items);
        match removed {
            Some(item) => {
                for hook in &self.hooks.on_delete {
                    hook(&item, true);
                }
                Ok(item)
            }
            None => Err(Error::NotFoundItem),
        }
    }

    fn delete_all_locked(&self) {
        let mut items = self.items.write().unwrap();
        let drained: Vec<T> = items.drain().map(|(_, v)| v).collect();
        drop(items);
        for item in &drained {
            for hook in &self.hooks.on_delete {
                hook(item, true);
            }
        }
    }

    fn bulk_upsert_locked(&self, new_items: Vec<T>) {
        for item in new_items {
            self.upsert_locked(item);
        }
    }
}

impl<T> SubState for Crud<T>
where
    T: WithId + Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn state_name(&self) -> &str {
        &self.name
    }

    fn apply(&self, value: Value) -> Result<Value> {
        if value.get(STATE_TAG).and_then(|v| v.as_str()) != Some(self.name.as_str()) {
            return Err(Error::SkipApply);
        }
        let req: CrudRequest<T> =
            serde_json::from_value(value).map_err(|e| Error::Codec(e.to_string()))?;

        if let Some(item) = req.upsert {
            self.upsert_locked(item);
            return Ok(Value::Null);
        }
        if let Some(item) = req.insert {
            self.insert_locked(item)?;
            return Ok(Value::Null);
        }
        if let Some(item) = req.update {
            self.update_locked(item)?;
            return Ok(Value::Null);
        }
        if let Some(id) = req.delete {
            let item = self.delete_locked(&id)?;
            return serde_json::to_value(item).map_err(|e| Error::Codec(e.to_string()));
        }
        if req.delete_all.unwrap_or(false) {
            self.delete_all_locked();
            return Ok(Value::Null);
        }
        if let Some(items) = req.bulk_upsert {
            self.bulk_upsert_locked(items);
            return Ok(Value::Null);
        }
        Err(Error::Codec("crud request had no recognized operation".into()))
    }
}

/// Convenience wrapper pairing a [`Crud`] sub-state with the coordinator it was
/// registered into, giving callers a typed `upsert`/`get`/... surface instead of
/// hand-building [`CrudRequest`] JSON.
pub struct CrudHandle<T> {
    crud: Arc<Crud<T>>,
    state: Option<Arc<State<ComposedStateMachine, crate::wal::codec::JsonCodec>>>,
}

impl<T> CrudHandle<T>
where
    T: WithId + Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        crud: Arc<Crud<T>>,
        state: Arc<State<ComposedStateMachine, crate::wal::codec::JsonCodec>>,
    ) -> Self {
        Self {
            crud,
            state: Some(state),
        }
    }

    /// Builds a handle before the coordinator it will mutate through exists.
    /// `crud` must already be registered into the `ComposedStateMachine` that
    /// will be passed to `State::new`, but `State::new` itself needs that
    /// composed machine first, so the resulting `Arc<State<...>>` isn't
    /// available until after the handle would otherwise be constructed. Call
    /// `bind` once that `State` exists; any mutator call before then returns
    /// `Error::MutatorNotInitialized`. Reads (`get`/`all`) work unbound.
    pub fn unbound(crud: Arc<Crud<T>>) -> Self {
        Self { crud, state: None }
    }

    pub fn bind(&mut self, state: Arc<State<ComposedStateMachine, crate::wal::codec::JsonCodec>>) {
        self.state = Some(state);
    }

    fn request(&self, req: CrudRequest<T>) -> Result<Value> {
        let state = self.state.as_ref().ok_or(Error::MutatorNotInitialized)?;
        let value = serde_json::to_value(req).map_err(|e| Error::Codec(e.to_string()))?;
        state.apply(value, Some(self.crud.name()))
    }

    fn blank_request(&self) -> CrudRequest<T> {
        CrudRequest {
            state: self.crud.name().to_string(),
            upsert: None,
            insert: None,
            update: None,
            delete: None,
            delete_all: None,
            bulk_upsert: None,
        }
    }

    pub fn upsert(&self, item: T) -> Result<()> {
        let mut req = self.blank_request();
        req.upsert = Some(item);
        self.request(req).map(|_| ())
    }

    pub fn insert(&self, item: T) -> Result<()> {
        let mut req = self.blank_request();
        req.insert = Some(item);
        self.request(req).map(|_| ())
    }

    pub fn update(&self, item: T) -> Result<()> {
        let mut req = self.blank_request();
        req.update = Some(item);
        self.request(req).map(|_| ())
    }

    pub fn delete(&self, id: impl Into<String>) -> Result<T> {
        let mut req = self.blank_request();
        req.delete = Some(id.into());
        let value = self.request(req)?;
        serde_json::from_value(value).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn delete_all(&self) -> Result<()> {
        let mut req = self.blank_request();
        req.delete_all = Some(true);
        self.request(req).map(|_| ())
    }

    pub fn bulk_upsert(&self, items: Vec<T>) -> Result<()> {
        let mut req = self.blank_request();
        req.bulk_upsert = Some(items);
        self.request(req).map(|_| ())
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.crud.get(id)
    }

    pub fn all(&self) -> Vec<T> {
        self.crud.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::codec::JsonCodec;
    use crate::wal::log::{Log, LogOptions};
    use std::thread;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Item {
        id: String,
        x: String,
    }

    impl WithId for Item {
        fn id(&self) -> &str {
            &self.id
        }
    }

    // S2 CRUD compose, `SPEC_FULL.md` §8.
    #[test]
    fn two_named_crud_substates_stay_isolated() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), LogOptions::default()).unwrap();

        let crud1 = Arc::new(Crud::<Item>::new("crud1"));
        let crud2 = Arc::new(Crud::<Item>::new("crud2"));
        let mut composed = ComposedStateMachine::new();
        composed.register(Arc::clone(&crud1) as Arc<dyn SubState>);
        composed.register(Arc::clone(&crud2) as Arc<dyn SubState>);

        let state = State::new(log, Arc::new(composed), JsonCodec, "app");
        let runner = Arc::clone(&state);
        let handle = thread::spawn(move || runner.run());

        let h1 = CrudHandle::new(Arc::clone(&crud1), Arc::clone(&state));
        let h2 = CrudHandle::new(Arc::clone(&crud2), Arc::clone(&state));

        h1.upsert(Item {
            id: "1".into(),
            x: "test".into(),
        })
        .unwrap();

        assert_eq!(h2.get("1"), None);
        assert_eq!(
            h1.get("1"),
            Some(Item {
                id: "1".into(),
                x: "test".into()
            })
        );

        assert!(matches!(h1.delete("2"), Err(Error::NotFoundItem)));
        let deleted = h1.delete("1").unwrap();
        assert_eq!(deleted.id, "1");
        assert_eq!(h1.get("1"), None);

        state.close();
        let _ = handle.join();
    }

    #[test]
    fn unbound_handle_rejects_mutation_until_bound() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), LogOptions::default()).unwrap();

        let crud = Arc::new(Crud::<Item>::new("crud"));
        let mut handle = CrudHandle::unbound(Arc::clone(&crud));
        assert!(matches!(
            handle.upsert(Item {
                id: "1".into(),
                x: "test".into(),
            }),
            Err(Error::MutatorNotInitialized)
        ));
        assert_eq!(handle.get("1"), None);

        let mut composed = ComposedStateMachine::new();
        composed.register(Arc::clone(&crud) as Arc<dyn SubState>);
        let state = State::new(log, Arc::new(composed), JsonCodec, "app");
        let runner = Arc::clone(&state);
        let join_handle = thread::spawn(move || runner.run());

        handle.bind(Arc::clone(&state));
        handle
            .upsert(Item {
                id: "1".into(),
                x: "test".into(),
            })
            .unwrap();
        assert_eq!(
            handle.get("1"),
            Some(Item {
                id: "1".into(),
                x: "test".into()
            })
        );

        state.close();
        let _ = join_handle.join();
    }
}
