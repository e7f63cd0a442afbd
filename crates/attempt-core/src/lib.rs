pub mod config;
pub mod events;
pub mod prompt;
pub mod ticket;
pub mod types;

pub use config::Config;
pub use events::{AttemptEvent, DomainEvent, DomainEventType};
pub use ticket::{split_ticket, TicketParts};
pub use types::*;
