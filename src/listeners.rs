// src/listeners.rs
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::model::{Output, OutputKind};
use crate::sandbox::Issue;
use crate::task::{GroupId, TaskId};

/// Receives the outcome of every task of the groups it is subscribed to.
pub trait Listener: Send + Sync {
    fn on_success(&self, group: GroupId, task: TaskId, output: &Output);

    fn on_error(&self, group: GroupId, task: TaskId, issue: &Issue);

    /// Output kinds this listener wants to hear about.
    fn accepts(&self, kind: OutputKind) -> bool {
        let _ = kind;
        true
    }
}

/// Per-group and global listener sets, safe to mutate from any thread.
#[derive(Default)]
pub struct Listeners {
    by_group: RwLock<HashMap<GroupId, Vec<Arc<dyn Listener>>>>,
    global: RwLock<Vec<Arc<dyn Listener>>>,
}

fn same(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribing the same listener twice to a group is a no-op.
    pub fn register(&self, group: GroupId, listener: Arc<dyn Listener>) {
        let mut by_group = self.by_group.write().unwrap_or_else(PoisonError::into_inner);
        let listeners = by_group.entry(group).or_default();
        if !listeners.iter().any(|l| same(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn unregister(&self, group: GroupId, listener: &Arc<dyn Listener>) {
        let mut by_group = self.by_group.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(listeners) = by_group.get_mut(&group) {
            listeners.retain(|l| !same(l, listener));
            if listeners.is_empty() {
                by_group.remove(&group);
            }
        }
    }

    pub fn register_global(&self, listener: Arc<dyn Listener>) {
        let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
        if !global.iter().any(|l| same(l, &listener)) {
            global.push(listener);
        }
    }

    pub fn unregister_global(&self, listener: &Arc<dyn Listener>) {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !same(l, listener));
    }

    /// Snapshot of the listeners of `group` plus the global ones.
    pub fn of(&self, group: GroupId) -> Vec<Arc<dyn Listener>> {
        let mut listeners: Vec<Arc<dyn Listener>> = self
            .by_group
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group)
            .cloned()
            .unwrap_or_default();
        for global in self.global.read().unwrap_or_else(PoisonError::into_inner).iter() {
            if !listeners.iter().any(|l| same(l, global)) {
                listeners.push(global.clone());
            }
        }
        listeners
    }

    /// Delivers one outcome to every interested listener of `group`.
    pub fn broadcast(
        &self,
        group: GroupId,
        task: TaskId,
        kind: OutputKind,
        result: &Result<Output, Issue>,
    ) {
        for listener in self.of(group) {
            if !listener.accepts(kind) {
                continue;
            }
            match result {
                Ok(output) => listener.on_success(group, task, output),
                Err(issue) => listener.on_error(group, task, issue),
            }
        }
    }
}
