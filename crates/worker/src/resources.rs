//! The resource table: generated ids to live engine handles.
//!
//! Every engine object a client can address sits in one table, keyed by a
//! generated `<kind>_<n>` id. Entries record which parent owns them so that
//! closing a parent sweeps everything underneath it, even when the engine
//! has already invalidated the handles on its side.
//!
//! Browsers, contexts, pages and servers are shared handles; routes and
//! dialogs are single-shot, so their accessors remove the entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use drover_protocol::ResourceKind;
use rand::Rng;

use crate::engine::{
    EngineBrowser, EngineContext, EngineDialog, EnginePage, EngineResponse, EngineRoute,
    EngineServer,
};

/// A live engine handle plus the parentage needed for cascade removal.
pub enum Resource {
    Browser(Arc<dyn EngineBrowser>),
    Context {
        handle: Arc<dyn EngineContext>,
        browser_id: String,
    },
    Page {
        handle: Arc<dyn EnginePage>,
        context_id: String,
    },
    Route {
        handle: Box<dyn EngineRoute>,
        page_id: String,
    },
    Response {
        response: EngineResponse,
        page_id: String,
    },
    Dialog {
        handle: Box<dyn EngineDialog>,
        page_id: String,
    },
    Server(Box<dyn EngineServer>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Browser(_) => ResourceKind::Browser,
            Resource::Context { .. } => ResourceKind::Context,
            Resource::Page { .. } => ResourceKind::Page,
            Resource::Route { .. } => ResourceKind::Route,
            Resource::Response { .. } => ResourceKind::Response,
            Resource::Dialog { .. } => ResourceKind::Dialog,
            Resource::Server(_) => ResourceKind::Server,
        }
    }

    /// Table id of the entry this one lives under, if any.
    fn owner(&self) -> Option<&str> {
        match self {
            Resource::Browser(_) | Resource::Server(_) => None,
            Resource::Context { browser_id, .. } => Some(browser_id),
            Resource::Page { context_id, .. } => Some(context_id),
            Resource::Route { page_id, .. }
            | Resource::Response { page_id, .. }
            | Resource::Dialog { page_id, .. } => Some(page_id),
        }
    }
}

#[derive(Default)]
pub struct ResourceTable {
    entries: DashMap<String, Resource>,
    counter: AtomicU64,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next `<kind>_<n>` id. One counter covers every kind, so ids
    /// stay unique across the whole table.
    pub fn allocate_id(&self, kind: ResourceKind) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{kind}_{n}")
    }

    pub fn insert(&self, id: String, resource: Resource) {
        self.entries.insert(id, resource);
    }

    /// Mint a dialog id and insert the handle under it in one step.
    ///
    /// Dialogs arise at times no counter predicts, so their ids embed a
    /// timestamp and a random suffix; the entry API retries the rare
    /// same-millisecond collision instead of clobbering a live dialog.
    pub fn insert_dialog(&self, dialog: Box<dyn EngineDialog>, page_id: String) -> String {
        loop {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let suffix: u32 = rand::thread_rng().gen_range(0..1000);
            let candidate = format!("dialog_{millis}_{suffix}");
            match self.entries.entry(candidate.clone()) {
                Entry::Occupied(_) => {
                    tracing::debug!(id = %candidate, "dialog id collision, re-rolling");
                }
                Entry::Vacant(slot) => {
                    slot.insert(Resource::Dialog {
                        handle: dialog,
                        page_id,
                    });
                    return candidate;
                }
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn browser(&self, id: &str) -> Option<Arc<dyn EngineBrowser>> {
        match self.entries.get(id)?.value() {
            Resource::Browser(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    pub fn context(&self, id: &str) -> Option<Arc<dyn EngineContext>> {
        match self.entries.get(id)?.value() {
            Resource::Context { handle, .. } => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    pub fn page(&self, id: &str) -> Option<Arc<dyn EnginePage>> {
        match self.entries.get(id)?.value() {
            Resource::Page { handle, .. } => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    pub fn response(&self, id: &str) -> Option<EngineResponse> {
        match self.entries.get(id)?.value() {
            Resource::Response { response, .. } => Some(response.clone()),
            _ => None,
        }
    }

    /// Remove and return a route. Routes are acted on at most once, so the
    /// first taker wins and later lookups see an unknown id.
    pub fn take_route(&self, id: &str) -> Option<Box<dyn EngineRoute>> {
        let (key, resource) = self.entries.remove(id)?;
        match resource {
            Resource::Route { handle, .. } => Some(handle),
            other => {
                // Same id, different kind: put it back untouched.
                self.entries.insert(key, other);
                None
            }
        }
    }

    /// Remove and return a dialog; accepting or dismissing consumes it.
    pub fn take_dialog(&self, id: &str) -> Option<Box<dyn EngineDialog>> {
        let (key, resource) = self.entries.remove(id)?;
        match resource {
            Resource::Dialog { handle, .. } => Some(handle),
            other => {
                self.entries.insert(key, other);
                None
            }
        }
    }

    /// Remove and return a server; stopping consumes it.
    pub fn take_server(&self, id: &str) -> Option<Box<dyn EngineServer>> {
        let (key, resource) = self.entries.remove(id)?;
        match resource {
            Resource::Server(handle) => Some(handle),
            other => {
                self.entries.insert(key, other);
                None
            }
        }
    }

    pub fn browser_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Resource::Browser(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Resource::Server(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove `id` and, transitively, every entry owned by it. Returns the
    /// removed ids, descendants first. Unknown ids remove nothing.
    pub fn remove_cascade(&self, id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.remove_cascade_into(id, &mut removed);
        removed
    }

    fn remove_cascade_into(&self, id: &str, removed: &mut Vec<String>) {
        // Collect first: removing while an iterator holds shard locks
        // would deadlock.
        let children: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().owner() == Some(id))
            .map(|entry| entry.key().clone())
            .collect();
        for child in children {
            self.remove_cascade_into(&child, removed);
        }
        if self.entries.remove(id).is_some() {
            removed.push(id.to_string());
        }
    }
}
