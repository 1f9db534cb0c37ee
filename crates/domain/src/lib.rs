//! # pixels-dice-domain
//!
//! Pure domain model for tracking Pixels electronic dice over BLE.
//!
//! ## Responsibilities
//! - Foundational types: die identifiers, error conventions, timestamps
//! - Define the observable **die state** (connection, roll phase, face,
//!   battery, presence, signal strength) and how decoded messages mutate it
//! - Define the **wire protocol** codec (notification frames in, requests out)
//! - Define **triggers** (face / roll / connection transitions)
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod die;
pub mod protocol;
pub mod trigger;
