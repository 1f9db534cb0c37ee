//! # pixels-dice-app
//!
//! Application layer — the die **session manager** and **port definitions**
//! (traits).
//!
//! ## Responsibilities
//! - Define the [`Transport`](ports::Transport) port that BLE adapters
//!   implement (discover, connect, subscribe, write, read, advertisements)
//! - Define the [`Observer`](ports::Observer) port for state-change fan-out
//! - Run one [`DieSession`](session::DieSession) per die: connection
//!   lifecycle, frame decoding, presence tracking
//! - Own sessions explicitly through a [`SessionRegistry`](registry::SessionRegistry)
//! - Turn state changes into trigger firings ([`triggers`])
//!
//! ## Dependency rule
//! Depends on `pixels-dice-domain` only (plus `tokio` for tasks and channels).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod observer;
pub mod ports;
pub mod registry;
pub mod session;
pub mod triggers;
