//! SOME/IP Service Discovery.
//!
//! `wire` is the entry/option codec, `fsm` holds the timer-driven state
//! machines and registries, `engine` is the task gluing them to the SD
//! socket and the routing core.

pub mod engine;
pub mod fsm;
pub mod wire;

pub use engine::{SdCommand, SdEngine, SdHandle};
pub use fsm::{FindFsm, OfferFsm, RebootDetector, SessionCounter, Subscriber, SubscriberRegistry};
pub use wire::{Entry, EntryPayload, EntryType, L4Proto, SdMessage, SdOption};
