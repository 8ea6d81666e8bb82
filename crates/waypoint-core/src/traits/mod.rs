pub mod dead_letter;
pub mod handler;
pub mod ledger;
pub mod stream;

pub use dead_letter::DeadLetterSink;
pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use ledger::{LeaseStore, Ledger};
pub use stream::{Delivery, StreamSource, Subscription};
