//! Replay-capable broadcast channels for plugin events.
//!
//! A [`ReplayChannel`] keeps every event it has delivered. Attaching a new
//! listener first replays that history, then streams live events, so an
//! observer that shows up late still sees each event exactly once.

use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::{PluginError, Result};

/// Subscription to a registry event channel.
///
/// Yields `Ok(event)` for each delivered event. A failed channel yields a
/// single `Err` and then ends; a completed channel just ends.
pub struct PluginEvents<T> {
    inner: UnboundedReceiverStream<Result<T>>,
}

impl<T> PluginEvents<T> {
    fn new(rx: mpsc::UnboundedReceiver<Result<T>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Receive the next event, or `None` once the channel has ended.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        self.inner.next().await
    }
}

impl<T> Stream for PluginEvents<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<T> std::fmt::Debug for PluginEvents<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEvents").finish_non_exhaustive()
    }
}

enum Terminal {
    Completed,
    Failed(PluginError),
}

struct ReplayState<T> {
    history: Vec<T>,
    listeners: Vec<mpsc::UnboundedSender<Result<T>>>,
    terminal: Option<Terminal>,
}

/// Broadcast channel that replays its history to late subscribers.
pub(crate) struct ReplayChannel<T> {
    name: &'static str,
    state: Mutex<ReplayState<T>>,
}

impl<T: Clone> ReplayChannel<T> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ReplayState {
                history: Vec::new(),
                listeners: Vec::new(),
                terminal: None,
            }),
        }
    }

    /// Attach a listener: history first, then live events.
    pub(crate) fn subscribe(&self) -> PluginEvents<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        for event in &state.history {
            let _ = tx.send(Ok(event.clone()));
        }

        match &state.terminal {
            None => state.listeners.push(tx),
            Some(Terminal::Failed(error)) => {
                let _ = tx.send(Err(error.clone()));
            }
            Some(Terminal::Completed) => {}
        }

        PluginEvents::new(rx)
    }

    /// Record and deliver an event. Returns `false` once the channel has ended.
    pub(crate) fn publish(&self, event: T) -> bool {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            tracing::debug!(channel = self.name, "Dropping event on terminated channel");
            return false;
        }

        state
            .listeners
            .retain(|listener| listener.send(Ok(event.clone())).is_ok());
        state.history.push(event);
        true
    }

    /// Terminate the channel with an error for current and future listeners.
    pub(crate) fn fail(&self, error: PluginError) -> bool {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return false;
        }

        for listener in state.listeners.drain(..) {
            let _ = listener.send(Err(error.clone()));
        }
        state.terminal = Some(Terminal::Failed(error));
        true
    }

    /// Complete the channel. Listeners drain the history they already hold.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Completed);
        }
        state.listeners.clear();
    }

    pub(crate) fn listener_count(&self) -> usize {
        let mut state = self.state.lock();
        state.listeners.retain(|listener| !listener.is_closed());
        state.listeners.len()
    }

    pub(crate) fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    pub(crate) fn failure(&self) -> Option<PluginError> {
        match &self.state.lock().terminal {
            Some(Terminal::Failed(error)) => Some(error.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T>(events: &mut PluginEvents<T>) -> Vec<Result<T>> {
        let mut out = Vec::new();
        while let Ok(event) = events.inner.as_mut().try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn late_subscriber_sees_history_then_live_events() {
        let channel = ReplayChannel::new("test");
        channel.publish(1);
        channel.publish(2);

        let mut events = channel.subscribe();
        channel.publish(3);

        let seen: Vec<i32> = drain(&mut events).into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(channel.history_len(), 3);
    }

    #[test]
    fn failure_reaches_current_and_future_subscribers() {
        let channel = ReplayChannel::new("test");
        let mut early = channel.subscribe();
        channel.publish("a");
        assert!(channel.fail(PluginError::Closed));
        assert!(!channel.publish("b"));

        let early_seen = drain(&mut early);
        assert_eq!(early_seen.len(), 2);
        assert_eq!(early_seen[1], Err(PluginError::Closed));

        let mut late = channel.subscribe();
        let late_seen = drain(&mut late);
        assert_eq!(late_seen, vec![Ok("a"), Err(PluginError::Closed)]);
        assert_eq!(channel.failure(), Some(PluginError::Closed));
    }

    #[test]
    fn first_failure_wins() {
        let channel: ReplayChannel<u8> = ReplayChannel::new("test");
        assert!(channel.fail(PluginError::MissingPlugin { id: "a".into() }));
        assert!(!channel.fail(PluginError::Closed));
        assert_eq!(
            channel.failure(),
            Some(PluginError::MissingPlugin { id: "a".into() })
        );
    }

    #[tokio::test]
    async fn closed_channel_ends_stream_after_history() {
        let channel = ReplayChannel::new("test");
        channel.publish(7u32);
        channel.close();

        let mut events = channel.subscribe();
        assert_eq!(events.recv().await, Some(Ok(7)));
        assert_eq!(events.recv().await, None);
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let channel: ReplayChannel<u8> = ReplayChannel::new("test");
        let kept = channel.subscribe();
        drop(channel.subscribe());
        assert_eq!(channel.listener_count(), 1);
        drop(kept);
        channel.publish(1);
        assert_eq!(channel.listener_count(), 0);
    }
}
