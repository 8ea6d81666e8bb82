pub mod ledger;
pub mod message;
pub mod position;

pub use ledger::{DeadLetter, LeaseToken, LedgerEntry};
pub use message::Message;
pub use position::Position;
