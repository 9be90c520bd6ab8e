pub mod chat;
pub mod clock;
pub mod context;
pub mod dedup;
pub mod events;
pub mod providers;
pub mod receipts;
pub mod request;
