//! Shared vocabulary of the dialog engine: identities, transcript messages,
//! events, run states, generator and tool contracts, and the tellask
//! line protocol.

pub mod errors;
pub mod events;
pub mod generator;
pub mod health;
pub mod ids;
pub mod messages;
pub mod reminders;
pub mod run_state;
pub mod stream;
pub mod subdialog;
pub mod tellask;
pub mod tools;
