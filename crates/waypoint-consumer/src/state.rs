use std::fmt;

/// Life-cycle of a consumer
///
/// `Uninitialized -> Initializing -> Subscribing -> CatchingUp -> Live`,
/// then `Stopping -> Stopped` on shutdown. `Faulted` is reachable from any
/// state on an unrecoverable error and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Uninitialized,
    Initializing,
    Subscribing,
    CatchingUp,
    Live,
    Stopping,
    Stopped,
    Faulted,
}

impl ConsumerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Faulted)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Uninitialized => "uninitialized",
            ConsumerState::Initializing => "initializing",
            ConsumerState::Subscribing => "subscribing",
            ConsumerState::CatchingUp => "catching-up",
            ConsumerState::Live => "live",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}
