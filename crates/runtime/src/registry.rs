//! Client-side registry of remote objects.
//!
//! Every worker resource the client holds a reference to is represented by
//! a [`RemoteHandle`]: the generated id, a parent link, an owned set of
//! children, and a disposed flag. The [`RemoteRegistry`] indexes handles by
//! id using [`DashMap`] for lock-free concurrent access, with a per-id
//! [`Notify`] so [`RemoteRegistry::wait_for`] can block on ids that are
//! referenced before their registration arrives; waiters register before
//! checking to prevent lost wakeups.
//!
//! Disposal is explicit and cascades: disposing a handle disposes its
//! children first (post-order), then detaches it from its parent, then
//! removes it from the table. Disposal is idempotent and never fails, even
//! when the worker-side resource is already gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use drover_protocol::ids;

use crate::error::{Error, Result};
use crate::events::RemoteEvent;

/// Client-side proxy state for one worker resource.
pub struct RemoteHandle {
    id: Arc<str>,
    kind: String,
    parent: Mutex<Option<Weak<RemoteHandle>>>,
    children: Mutex<HashMap<Arc<str>, Arc<RemoteHandle>>>,
    disposed: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RemoteEvent>>>,
}

impl RemoteHandle {
    pub fn new(id: impl Into<Arc<str>>, kind: impl Into<String>) -> Arc<RemoteHandle> {
        Arc::new(RemoteHandle {
            id: id.into(),
            kind: kind.into(),
            parent: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Fail fast before sending a command on behalf of a disposed object.
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::ObjectDisposed {
                id: self.id.to_string(),
            });
        }
        Ok(())
    }

    pub fn parent(&self) -> Option<Arc<RemoteHandle>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Ids of directly owned children, unordered.
    pub fn child_ids(&self) -> Vec<Arc<str>> {
        self.children.lock().keys().cloned().collect()
    }

    /// Subscribe to events delivered to this object. The channel closes
    /// when the handle is disposed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RemoteEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn deliver(&self, event: RemoteEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Thread-safe table of live remote objects by generated id.
pub struct RemoteRegistry {
    objects: DashMap<Arc<str>, Arc<RemoteHandle>>,
    waiters: DashMap<Arc<str>, Arc<Notify>>,
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteRegistry {
    pub fn new() -> Self {
        RemoteRegistry {
            objects: DashMap::new(),
            waiters: DashMap::new(),
        }
    }

    /// Insert a handle and wake any `wait_for` callers parked on its id.
    pub fn register(&self, handle: Arc<RemoteHandle>) {
        let id = handle.id.clone();
        self.objects.insert(id.clone(), handle);
        if let Some((_, notify)) = self.waiters.remove(&id) {
            notify.notify_waiters();
        }
    }

    /// Register `child` under `parent`'s owned set.
    pub fn register_child(&self, parent: &Arc<RemoteHandle>, child: Arc<RemoteHandle>) {
        Self::link_parent_child(parent, &child);
        self.register(child);
    }

    /// Declare ownership: `parent` owns `child`. The child keeps a weak
    /// back-reference so ownership cycles cannot leak.
    pub fn link_parent_child(parent: &Arc<RemoteHandle>, child: &Arc<RemoteHandle>) {
        *child.parent.lock() = Some(Arc::downgrade(parent));
        parent
            .children
            .lock()
            .insert(child.id.clone(), Arc::clone(child));
    }

    /// Synchronous lookup.
    pub fn try_get(&self, id: &str) -> Option<Arc<RemoteHandle>> {
        self.objects.get(id).map(|entry| entry.value().clone())
    }

    /// Wait for an id to be registered, with timeout.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> Result<Arc<RemoteHandle>> {
        let key: Arc<str> = Arc::from(id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = self
                .waiters
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            let notified = notify.notified();

            if let Some(handle) = self.objects.get(&key) {
                return Ok(handle.value().clone());
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Self::timeout_error(&key));
            }

            tokio::select! {
                biased;
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(Self::timeout_error(&key));
                }
            }
        }
    }

    /// Dispose the object with this id, cascading through everything it
    /// owns. Unknown ids are a silent no-op.
    pub fn dispose(&self, id: &str) {
        match self.try_get(id) {
            Some(handle) => self.dispose_handle(&handle),
            None => tracing::debug!(id, "dispose of unknown id (ignored)"),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn dispose_handle(&self, handle: &Arc<RemoteHandle>) {
        if handle.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Children go first so no child ever outlives its parent in the
        // table. Snapshot them; each child detaches itself as it goes.
        let children: Vec<Arc<RemoteHandle>> =
            handle.children.lock().values().cloned().collect();
        for child in children {
            self.dispose_handle(&child);
        }
        handle.children.lock().clear();

        if let Some(parent) = handle.parent() {
            parent.children.lock().remove(handle.id());
        }

        self.objects.remove(&handle.id);
        handle.subscribers.lock().clear();
        tracing::debug!(id = %handle.id, kind = %handle.kind, "disposed remote object");
    }

    fn timeout_error(id: &str) -> Error {
        match ids::kind_of(id) {
            Some(kind) => Error::Timeout(format!("waiting for {kind} object: {id}")),
            None => Error::Timeout(format!("waiting for object: {id}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family() -> (RemoteRegistry, Arc<RemoteHandle>, Arc<RemoteHandle>, Arc<RemoteHandle>) {
        let registry = RemoteRegistry::new();
        let browser = RemoteHandle::new("browser_1", "browser");
        let context = RemoteHandle::new("context_1", "context");
        let page = RemoteHandle::new("page_1", "page");
        registry.register(Arc::clone(&browser));
        registry.register_child(&browser, Arc::clone(&context));
        registry.register_child(&context, Arc::clone(&page));
        (registry, browser, context, page)
    }

    #[test]
    fn register_and_lookup() {
        let registry = RemoteRegistry::new();
        let handle = RemoteHandle::new("page_9", "page");
        registry.register(Arc::clone(&handle));

        let found = registry.try_get("page_9").unwrap();
        assert_eq!(found.id(), "page_9");
        assert_eq!(found.kind(), "page");
        assert!(registry.try_get("page_8").is_none());
    }

    #[test]
    fn ownership_links_run_both_ways() {
        let (_registry, browser, context, page) = family();
        assert_eq!(context.parent().unwrap().id(), "browser_1");
        assert_eq!(page.parent().unwrap().id(), "context_1");
        assert_eq!(browser.child_ids(), vec![Arc::<str>::from("context_1")]);
    }

    #[test]
    fn dispose_cascades_post_order() {
        let (registry, browser, context, page) = family();

        registry.dispose("browser_1");

        assert!(browser.is_disposed());
        assert!(context.is_disposed());
        assert!(page.is_disposed());
        assert!(registry.is_empty());
        assert!(browser.child_ids().is_empty());
    }

    #[test]
    fn dispose_cascades_through_a_wide_tree() {
        let registry = RemoteRegistry::new();
        let browser = RemoteHandle::new("browser_1", "browser");
        registry.register(Arc::clone(&browser));

        let mut leaves = Vec::new();
        for n in 0..2 {
            let context = RemoteHandle::new(format!("context_{}", n + 2), "context");
            registry.register_child(&browser, Arc::clone(&context));
            let page = RemoteHandle::new(format!("page_{}", n + 4), "page");
            registry.register_child(&context, Arc::clone(&page));
            leaves.push(context);
            leaves.push(page);
        }
        assert_eq!(registry.len(), 5);

        registry.dispose("browser_1");

        assert!(browser.is_disposed());
        for handle in &leaves {
            assert!(handle.is_disposed(), "{} survived", handle.id());
            assert!(handle.child_ids().is_empty());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn dispose_leaf_detaches_from_parent() {
        let (registry, _browser, context, page) = family();

        registry.dispose("page_1");

        assert!(page.is_disposed());
        assert!(!context.is_disposed());
        assert!(context.child_ids().is_empty());
        assert!(registry.contains("context_1"));
        assert!(!registry.contains("page_1"));
    }

    #[test]
    fn dispose_is_idempotent() {
        let (registry, _browser, _context, page) = family();

        registry.dispose("page_1");
        registry.dispose("page_1");
        registry.dispose("browser_1");
        registry.dispose("browser_1");

        assert!(page.is_disposed());
        assert!(registry.is_empty());
    }

    #[test]
    fn dispose_unknown_id_is_a_noop() {
        let (registry, ..) = family();
        registry.dispose("page_404");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn ensure_live_fails_after_dispose() {
        let (registry, _browser, _context, page) = family();
        assert!(page.ensure_live().is_ok());

        registry.dispose("page_1");

        let error = page.ensure_live().unwrap_err();
        assert!(matches!(error, Error::ObjectDisposed { ref id } if id == "page_1"));
    }

    #[test]
    fn late_link_parent_child() {
        let registry = RemoteRegistry::new();
        let context = RemoteHandle::new("context_4", "context");
        let page = RemoteHandle::new("page_4", "page");
        registry.register(Arc::clone(&context));
        registry.register(Arc::clone(&page));

        RemoteRegistry::link_parent_child(&context, &page);

        assert_eq!(page.parent().unwrap().id(), "context_4");
        registry.dispose("context_4");
        assert!(page.is_disposed());
    }

    #[test]
    fn subscribers_stop_receiving_after_dispose() {
        let (registry, _browser, _context, page) = family();
        let mut rx = page.subscribe();

        page.deliver(RemoteEvent::Closed);
        assert!(matches!(rx.try_recv(), Ok(RemoteEvent::Closed)));

        registry.dispose("page_1");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn wait_for_sees_late_registration() {
        let registry = Arc::new(RemoteRegistry::new());

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .wait_for("response_1", Duration::from_secs(1))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(RemoteHandle::new("response_1", "response"));

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.id(), "response_1");
    }

    #[tokio::test]
    async fn wait_for_times_out_with_kind_context() {
        let registry = RemoteRegistry::new();
        let error = registry
            .wait_for("page_77", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(error.is_timeout());
        assert!(error.to_string().contains("page"));
    }
}
