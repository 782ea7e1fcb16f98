//! Commands held until the player has a container

use crate::types::Reason;
use std::collections::VecDeque;
use tracing::warn;

/// A transport call deferred until the view is ready
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedCommand {
    Play(Reason),
    Pause(Reason),
    Stop,
    Seek { position: f64, reason: Reason },
}

/// Bounded FIFO; overflow drops the oldest command
#[derive(Debug)]
pub struct CommandQueue {
    commands: VecDeque<QueuedCommand>,
    capacity: usize,
    dropped: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            commands: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a command, returning the one evicted to make room
    pub fn push(&mut self, command: QueuedCommand) -> Option<QueuedCommand> {
        let evicted = if self.commands.len() >= self.capacity {
            let evicted = self.commands.pop_front();
            self.dropped += 1;
            warn!(?evicted, capacity = self.capacity, "Command queue full, dropping oldest");
            evicted
        } else {
            None
        };
        self.commands.push_back(command);
        evicted
    }

    /// Remove every queued command in arrival order
    pub fn drain(&mut self) -> Vec<QueuedCommand> {
        self.commands.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands lost to overflow so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let mut queue = CommandQueue::new(4);
        queue.push(QueuedCommand::Play(Reason::Autostart));
        queue.push(QueuedCommand::Seek {
            position: 10.0,
            reason: Reason::External,
        });
        queue.push(QueuedCommand::Pause(Reason::Interaction));

        assert_eq!(
            queue.drain(),
            vec![
                QueuedCommand::Play(Reason::Autostart),
                QueuedCommand::Seek {
                    position: 10.0,
                    reason: Reason::External
                },
                QueuedCommand::Pause(Reason::Interaction),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = CommandQueue::new(2);
        assert!(queue.push(QueuedCommand::Stop).is_none());
        assert!(queue.push(QueuedCommand::Play(Reason::External)).is_none());
        assert_eq!(
            queue.push(QueuedCommand::Pause(Reason::External)),
            Some(QueuedCommand::Stop)
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }
}
