//! Command Dispatcher
//!
//! Routes inbound envelopes to listeners registered per command. Listeners
//! are identified by the `Arc` they were registered with, so removing one
//! never disturbs another listener for the same command, even one built
//! from an identical closure.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::protocol::{Command, CommandEvent};

/// Callback for one command's events.
pub type Listener = Arc<dyn Fn(&CommandEvent) + Send + Sync>;

/// Callback for scene feed payloads.
pub type FeedHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identity of a registered callback.
type ListenerKey = usize;

fn key_of<T: ?Sized>(callback: &Arc<T>) -> ListenerKey {
    Arc::as_ptr(callback) as *const () as usize
}

struct Entry {
    key: ListenerKey,
    callback: Listener,
}

/// Command -> ordered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: BTreeMap<Command, Vec<Entry>>,
}

impl ListenerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The same listener may be registered twice and
    /// is then invoked twice.
    pub fn on(&mut self, command: Command, listener: Listener) {
        let key = key_of(&listener);
        self.insert(command, key, listener);
    }

    /// Remove one registration of `listener`. Returns whether it was found.
    pub fn off(&mut self, command: Command, listener: &Listener) -> bool {
        self.remove(command, key_of(listener))
    }

    /// Register a scene feed handler that receives only the payload.
    pub fn subscribe(&mut self, handler: FeedHandler) {
        let key = key_of(&handler);
        let listener: Listener = Arc::new(move |event: &CommandEvent| handler(&event.data));
        self.insert(Command::GET_SCENE_FEED, key, listener);
    }

    /// Remove a handler added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&mut self, handler: &FeedHandler) -> bool {
        self.remove(Command::GET_SCENE_FEED, key_of(handler))
    }

    /// Number of listeners for a command.
    pub fn listener_count(&self, command: Command) -> usize {
        self.entries.get(&command).map_or(0, Vec::len)
    }

    /// Invoke every listener for the event's command in registration order.
    /// Returns how many ran.
    pub fn dispatch(&self, event: &CommandEvent) -> usize {
        let Some(entries) = self.entries.get(&event.command) else {
            debug!(command = %event.command, "no listeners");
            return 0;
        };

        for entry in entries {
            let callback = &entry.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(command = %event.command, "listener panicked");
            }
        }
        entries.len()
    }

    fn insert(&mut self, command: Command, key: ListenerKey, callback: Listener) {
        self.entries
            .entry(command)
            .or_default()
            .push(Entry { key, callback });
    }

    fn remove(&mut self, command: Command, key: ListenerKey) -> bool {
        let Some(entries) = self.entries.get_mut(&command) else {
            return false;
        };
        let Some(index) = entries.iter().position(|e| e.key == key) else {
            return false;
        };
        entries.remove(index);
        if entries.is_empty() {
            self.entries.remove(&command);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn event(command: Command, data: Value) -> CommandEvent {
        CommandEvent {
            command,
            data,
            code: 0,
            message: String::new(),
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let log = log.clone();
        Arc::new(move |ev: &CommandEvent| {
            log.lock().unwrap().push(format!("{}:{}", tag, ev.command.0));
        })
    }

    #[test]
    fn test_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.on(Command::GET_EP_LIST, recorder(&log, "a"));
        registry.on(Command::GET_EP_LIST, recorder(&log, "b"));
        registry.on(Command::VOTE_THREAD, recorder(&log, "c"));

        assert_eq!(registry.dispatch(&event(Command::GET_EP_LIST, Value::Null)), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:10109", "b:10109"]);
    }

    #[test]
    fn test_removal_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        let first = recorder(&log, "first");
        let second = recorder(&log, "second");
        registry.on(Command::OPERATE_TWEET, first.clone());
        registry.on(Command::OPERATE_TWEET, second.clone());

        assert!(registry.off(Command::OPERATE_TWEET, &first));
        assert!(!registry.off(Command::OPERATE_TWEET, &first));

        registry.dispatch(&event(Command::OPERATE_TWEET, Value::Null));
        registry.dispatch(&event(Command::OPERATE_TWEET, Value::Null));
        assert_eq!(*log.lock().unwrap(), vec!["second:10113", "second:10113"]);
    }

    #[test]
    fn test_duplicate_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        let listener = recorder(&log, "dup");
        registry.on(Command::LOGIN, listener.clone());
        registry.on(Command::LOGIN, listener.clone());
        assert_eq!(registry.listener_count(Command::LOGIN), 2);

        registry.off(Command::LOGIN, &listener);
        assert_eq!(registry.listener_count(Command::LOGIN), 1);
        registry.off(Command::LOGIN, &listener);
        assert_eq!(registry.listener_count(Command::LOGIN), 0);
    }

    #[test]
    fn test_subscribe_unsubscribe_feed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: FeedHandler = Arc::new(move |data: &Value| sink.lock().unwrap().push(data.clone()));

        let mut registry = ListenerRegistry::new();
        registry.subscribe(handler.clone());
        registry.dispatch(&event(Command::GET_SCENE_FEED, json!({"roomId": 1})));
        assert!(registry.unsubscribe(&handler));
        registry.dispatch(&event(Command::GET_SCENE_FEED, json!({"roomId": 2})));

        assert_eq!(*seen.lock().unwrap(), vec![json!({"roomId": 1})]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.on(Command::GET_USER_POINTS, Arc::new(|_: &CommandEvent| panic!("boom")));
        registry.on(Command::GET_USER_POINTS, recorder(&log, "after"));

        registry.dispatch(&event(Command::GET_USER_POINTS, Value::Null));
        assert_eq!(*log.lock().unwrap(), vec!["after:100081"]);
    }
}
