//! Per-conversation subscriber callbacks.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::types::{ConversationId, ListenerId, Message};

/// Callback invoked with each delivered message and whether it replaces a
/// provisional slot (`true`) or should be appended (`false`).
pub type Listener = Arc<dyn Fn(&Message, bool) + Send + Sync>;

/// Maps conversation id → listeners in registration order.
///
/// Independent of connection lifecycle: listeners may be registered before
/// the channel is opened and survive reconnects.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    listeners: HashMap<ConversationId, Vec<(ListenerId, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, conversation_id: &ConversationId, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(conversation_id.clone())
            .or_default()
            .push((id, listener));
        debug!(conversation = %conversation_id, listener = id.0, "listener registered");
        id
    }

    /// Remove one listener. Others on the same conversation are untouched.
    pub fn unsubscribe(&mut self, conversation_id: &ConversationId, id: ListenerId) -> bool {
        let Some(list) = self.listeners.get_mut(conversation_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.listeners.remove(conversation_id);
        }
        removed
    }

    /// Listeners for a conversation, cloned so they can run without holding
    /// the registry lock.
    pub fn snapshot(&self, conversation_id: &ConversationId) -> Vec<Listener> {
        self.listeners
            .get(conversation_id)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self, conversation_id: &ConversationId) -> usize {
        self.listeners
            .remove(conversation_id)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn count(&self, conversation_id: &ConversationId) -> usize {
        self.listeners.get(conversation_id).map_or(0, Vec::len)
    }
}

/// Invoke every listener in order. A panicking listener is logged and
/// skipped; the rest still receive the message.
///
/// Returns the number of listeners that completed normally.
pub fn dispatch(
    conversation_id: &ConversationId,
    listeners: &[Listener],
    message: &Message,
    is_replacement: bool,
) -> usize {
    let mut delivered = 0;
    for (idx, listener) in listeners.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| listener(message, is_replacement))) {
            Ok(()) => delivered += 1,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(
                    conversation = %conversation_id,
                    listener_index = idx,
                    message_id = %message.id,
                    "listener panicked: {}", reason
                );
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SendState;
    use chrono::Utc;
    use std::sync::Mutex;

    fn msg(id: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: "conv-1".into(),
            sender_id: "u1".into(),
            receiver_id: None,
            content: "hi".into(),
            created_at: Utc::now(),
            status: SendState::Confirmed,
            temp_id: None,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let log = log.clone();
        Arc::new(move |m: &Message, replaced: bool| {
            log.lock().unwrap().push(format!("{tag}:{}:{replaced}", m.id));
        })
    }

    #[test]
    fn dispatch_in_registration_order() {
        let conv = ConversationId::from("conv-1");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ListenerRegistry::new();
        reg.subscribe(&conv, recorder(&log, "a"));
        reg.subscribe(&conv, recorder(&log, "b"));

        let delivered = dispatch(&conv, &reg.snapshot(&conv), &msg("m-1"), false);
        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:m-1:false", "b:m-1:false"]);
    }

    #[test]
    fn unsubscribe_leaves_siblings() {
        let conv = ConversationId::from("conv-1");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ListenerRegistry::new();
        let a = reg.subscribe(&conv, recorder(&log, "a"));
        reg.subscribe(&conv, recorder(&log, "b"));

        assert!(reg.unsubscribe(&conv, a));
        assert!(!reg.unsubscribe(&conv, a));
        assert_eq!(reg.count(&conv), 1);

        dispatch(&conv, &reg.snapshot(&conv), &msg("m-2"), true);
        assert_eq!(*log.lock().unwrap(), vec!["b:m-2:true"]);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let conv = ConversationId::from("conv-1");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ListenerRegistry::new();
        reg.subscribe(&conv, Arc::new(|_: &Message, _: bool| panic!("render failed")));
        reg.subscribe(&conv, recorder(&log, "b"));

        let delivered = dispatch(&conv, &reg.snapshot(&conv), &msg("m-3"), false);
        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["b:m-3:false"]);
    }

    #[test]
    fn conversations_are_isolated() {
        let a = ConversationId::from("a");
        let b = ConversationId::from("b");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ListenerRegistry::new();
        reg.subscribe(&a, recorder(&log, "a"));
        reg.subscribe(&b, recorder(&log, "b"));

        assert_eq!(reg.clear(&a), 1);
        assert_eq!(reg.count(&a), 0);
        assert_eq!(reg.count(&b), 1);
        assert!(reg.snapshot(&a).is_empty());
    }

    #[test]
    fn listener_ids_are_unique_across_conversations() {
        let mut reg = ListenerRegistry::new();
        let noop: Listener = Arc::new(|_: &Message, _: bool| {});
        let x = reg.subscribe(&"a".into(), noop.clone());
        let y = reg.subscribe(&"b".into(), noop);
        assert_ne!(x, y);
        // An id from another conversation does not remove anything.
        assert!(!reg.unsubscribe(&"a".into(), y));
    }
}
