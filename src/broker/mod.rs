//! # MQTT Synchronization Module
//!
//! Keeps the in-memory fixture model synchronized with desired state
//! published over the MQTT broker, in both directions.
//!
//! ## Why This Module Exists
//!
//! The lights are controlled from outside the building through retained MQTT
//! messages; this process is the only subscriber that can turn them into
//! hardware output. The module owns the whole broker side of that contract:
//! session lifecycle, retained-state replay at startup, conflict resolution
//! against the shelf-3/RGB sharing rules, live command dispatch, color
//! debouncing, and the reconnect backoff shared with the supervisor.
//!
//! ## Module Architecture
//!
//! ```text
//! broker/
//! ├── backoff.rs  - reconnect delay shared with the supervisor
//! ├── command.rs  - topic/payload parsing, outbound publish records
//! ├── debounce.rs - per-rack coalescing of rapid color updates
//! └── session.rs  - Ignore → Retained → Listening session state machine
//! ```
//!
//! ## Design Philosophy
//!
//! - **Replay, then reconcile**: retained broker state is accumulated into a
//!   private snapshot with no rules enforced, reconciled once, and only then
//!   copied into the live store the driver reads. Hardware never sees a
//!   half-replayed or conflicting state.
//! - **Corrections are traffic, not errors**: a command that violates the
//!   sharing rules is rejected with a retained corrective publish, and the
//!   correction's echo flows through the same dispatch path as any client
//!   message.
//! - **The event loop must survive anything**: parsing is an explicit
//!   `Result`, and a malformed message costs one error line, never the
//!   session.

pub mod backoff;
pub mod command;
pub mod debounce;
pub mod session;
