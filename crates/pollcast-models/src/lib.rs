pub mod event;
pub mod poll;
pub mod results;
pub mod wire;

pub use event::VoteEvent;
pub use poll::{Poll, PollKind, PollOption};
pub use results::{OptionTally, ResultSnapshot};
pub use wire::{ClientMessage, ServerMessage};
