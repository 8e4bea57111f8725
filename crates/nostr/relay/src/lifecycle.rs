//! Deferred plugin attachment.
//!
//! A [`Lifecycle`] holds an ordered plugin list for some host (a session, the
//! relay). Plugins only attach on [`connect`](Lifecycle::connect), so code that
//! registers listeners before connecting runs ahead of the defaults and can
//! cancel them.

use crate::dispatcher::Binding;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Attaches listeners to `T` and returns the capability that detaches them.
pub type Plugin<T> = Rc<dyn Fn(&T) -> Binding>;

pub struct Lifecycle<T> {
    plugins: RefCell<Vec<Plugin<T>>>,
    bindings: RefCell<Vec<Binding>>,
    connected: Cell<bool>,
}

impl<T> Lifecycle<T> {
    pub fn new() -> Self {
        Self::with_plugins(Vec::new())
    }

    pub fn with_plugins(plugins: Vec<Plugin<T>>) -> Self {
        Self {
            plugins: RefCell::new(plugins),
            bindings: RefCell::new(Vec::new()),
            connected: Cell::new(false),
        }
    }

    /// Append a plugin. It attaches on the next `connect`.
    pub fn add_plugin(&self, plugin: Plugin<T>) {
        self.plugins.borrow_mut().push(plugin);
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.borrow().len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Attach every plugin in order. Does nothing if already connected.
    pub fn connect(&self, host: &T) {
        if self.connected.replace(true) {
            return;
        }
        // Plugins may add plugins while attaching; those wait for the next connect.
        let plugins = self.plugins.borrow().clone();
        let mut attached = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            attached.push(plugin(host));
        }
        self.bindings.borrow_mut().extend(attached);
    }

    /// Detach every plugin, leaving the container ready for another `connect`.
    pub fn disconnect(&self) {
        if !self.connected.replace(false) {
            return;
        }
        let bindings = std::mem::take(&mut *self.bindings.borrow_mut());
        for binding in bindings {
            binding.disconnect();
        }
    }
}

impl<T> Default for Lifecycle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Lifecycle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("plugins", &self.plugin_count())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Wrap a closure as a [`Plugin`].
pub fn plugin<T, F>(f: F) -> Plugin<T>
where
    F: Fn(&T) -> Binding + 'static,
{
    Rc::new(f)
}
