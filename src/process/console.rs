use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lines of scrollback kept per server.
pub const SCROLLBACK_LINES: usize = 2500;
/// Messages a viewer may fall behind before it is dropped.
pub const VIEWER_QUEUE_DEPTH: usize = 1024;

struct Viewer {
    sender: mpsc::Sender<String>,
    user: Option<String>,
}

#[derive(Default)]
struct ConsoleState {
    lines: VecDeque<String>,
    viewers: HashMap<Uuid, Viewer>,
}

impl ConsoleState {
    fn replay_text(&self) -> String {
        let mut text = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

/// A registered viewer. Dropping the receiver (or calling
/// [`ConsoleHub::unsubscribe`]) ends delivery.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<String>,
}

/// Per-server console: bounded scrollback plus fan-out to viewer queues.
///
/// Appending to the scrollback and enqueueing to viewers happen under one lock,
/// so every viewer sees lines in emission order, and a new subscriber gets the
/// scrollback as its first message with nothing lost or repeated between that
/// replay and the live lines that follow.
#[derive(Default)]
pub struct ConsoleHub {
    state: Mutex<ConsoleState>,
}

impl ConsoleHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user: Option<String>) -> Subscription {
        let (sender, receiver) = mpsc::channel(VIEWER_QUEUE_DEPTH);
        let id = Uuid::new_v4();
        let mut state = self.state.lock();
        let replay = state.replay_text();
        if !replay.is_empty() {
            // Fresh queue, cannot be full.
            let _ = sender.try_send(replay);
        }
        debug!(viewer = %id, user = ?user, viewers = state.viewers.len() + 1, "Console viewer subscribed");
        state.viewers.insert(id, Viewer { sender, user });
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.state.lock().viewers.remove(&id).is_some();
        if removed {
            debug!(viewer = %id, "Console viewer unsubscribed");
        }
        removed
    }

    /// Appends a line (without its trailing newline) and fans it out. Viewers
    /// whose queue is full are dropped instead of stalling the caller.
    pub fn publish(&self, line: &str) {
        let message = format!("{}\n", line);
        let mut state = self.state.lock();
        state.lines.push_back(line.to_string());
        while state.lines.len() > SCROLLBACK_LINES {
            state.lines.pop_front();
        }
        state.viewers.retain(|id, viewer| match viewer.sender.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(viewer = %id, user = ?viewer.user, "Console viewer fell too far behind, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Drops every viewer belonging to `username`.
    pub fn disconnect_user(&self, username: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.viewers.len();
        state.viewers.retain(|_, viewer| viewer.user.as_deref() != Some(username));
        before - state.viewers.len()
    }

    #[cfg(test)]
    pub fn scrollback(&self) -> String {
        self.state.lock().replay_text()
    }

    #[cfg(test)]
    pub fn line_count(&self) -> usize {
        self.state.lock().lines.len()
    }

    #[cfg(test)]
    pub fn viewer_count(&self) -> usize {
        self.state.lock().viewers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sub: &mut Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = sub.receiver.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn replays_then_streams_in_order() {
        let hub = ConsoleHub::new();
        for i in 0..5 {
            hub.publish(&format!("line {}", i));
        }
        let mut sub = hub.subscribe(Some("alice".into()));
        for i in 5..8 {
            hub.publish(&format!("line {}", i));
        }

        let messages = drain(&mut sub);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], "line 0\nline 1\nline 2\nline 3\nline 4\n");
        assert_eq!(&messages[1..], ["line 5\n", "line 6\n", "line 7\n"]);
    }

    #[test]
    fn replay_is_capped_to_most_recent_lines() {
        let hub = ConsoleHub::new();
        for i in 0..3000 {
            hub.publish(&i.to_string());
        }
        assert_eq!(hub.line_count(), SCROLLBACK_LINES);

        let mut sub = hub.subscribe(None);
        let replay = drain(&mut sub).remove(0);
        let lines: Vec<_> = replay.lines().collect();
        assert_eq!(lines.len(), SCROLLBACK_LINES);
        assert_eq!(lines[0], "500");
        assert_eq!(lines[SCROLLBACK_LINES - 1], "2999");
    }

    #[test]
    fn empty_hub_sends_no_replay() {
        let hub = ConsoleHub::new();
        let mut sub = hub.subscribe(None);
        assert!(drain(&mut sub).is_empty());
        hub.publish("first");
        assert_eq!(drain(&mut sub), ["first\n"]);
    }

    #[test]
    fn slow_viewer_is_dropped_without_blocking() {
        let hub = ConsoleHub::new();
        let mut slow = hub.subscribe(Some("slow".into()));
        let mut fast = hub.subscribe(Some("fast".into()));

        for i in 0..VIEWER_QUEUE_DEPTH {
            hub.publish(&i.to_string());
            assert_eq!(drain(&mut fast).len(), 1);
        }
        assert_eq!(hub.viewer_count(), 2);
        hub.publish("overflow");
        assert_eq!(hub.viewer_count(), 1);
        assert_eq!(drain(&mut fast), ["overflow\n"]);

        // The slow viewer keeps what was queued, then sees the channel close.
        assert_eq!(drain(&mut slow).len(), VIEWER_QUEUE_DEPTH);
        assert!(matches!(
            slow.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = ConsoleHub::new();
        let mut sub = hub.subscribe(None);
        assert!(hub.unsubscribe(sub.id));
        assert!(!hub.unsubscribe(sub.id));
        hub.publish("after");
        assert!(drain(&mut sub).is_empty());
    }

    #[test]
    fn disconnect_user_only_hits_that_user() {
        let hub = ConsoleHub::new();
        let _a = hub.subscribe(Some("alice".into()));
        let _b = hub.subscribe(Some("bob".into()));
        let _local = hub.subscribe(None);
        assert_eq!(hub.disconnect_user("alice"), 1);
        assert_eq!(hub.viewer_count(), 2);
    }
}
