//! App-lifecycle boundary.
//!
//! Real OS background-task registration lives outside the core; hosts feed
//! foreground/background transitions through this trait (or over the control
//! API, which calls the coordinator hooks directly).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foreground,
    Background,
}

/// Stream of app lifecycle transitions.
#[async_trait]
pub trait LifecycleSource: Send + Sync {
    /// Next transition; `None` once the source is closed.
    async fn next_event(&self) -> Option<LifecycleEvent>;
}

/// Channel-backed source for hosts that push transitions in-process.
pub struct ChannelLifecycleSource {
    receiver: Mutex<mpsc::UnboundedReceiver<LifecycleEvent>>,
}

impl ChannelLifecycleSource {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<LifecycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                receiver: Mutex::new(receiver),
            }),
            sender,
        )
    }
}

#[async_trait]
impl LifecycleSource for ChannelLifecycleSource {
    async fn next_event(&self) -> Option<LifecycleEvent> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_source_delivers_events_in_order() {
        let (source, sender) = ChannelLifecycleSource::new();
        sender.send(LifecycleEvent::Background).unwrap();
        sender.send(LifecycleEvent::Foreground).unwrap();
        drop(sender);

        assert_eq!(source.next_event().await, Some(LifecycleEvent::Background));
        assert_eq!(source.next_event().await, Some(LifecycleEvent::Foreground));
        assert_eq!(source.next_event().await, None);
    }
}
