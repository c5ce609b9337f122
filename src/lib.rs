//! # box-box
//!
//! > **An order pipeline for a pit-lane pizzeria.**
//!
//! Orders come in through the gateway, wait on a durable stream, are cooked by the
//! maestro with dough from the panettiere, and move on to delivery. Every step is
//! broadcast live to whoever is watching.
//!
//! ## Architecture Overview
//!
//! ```text
//!   submit_order                          in_progress / waiting_delivery
//!  ─────────────▶ orders.waiting_to_cook ───────────▶ Maestro ────────────▶ stream
//!                        │                              │
//!                        │                     make_dough (retry, timeout)
//!                        │                              ▼
//!                        │                         Panettiere
//!                        ▼
//!                 Relay (orders.>) ──▶ Broadcaster ──▶ observers (SSE)
//! ```
//!
//! The queue, worker availability, fan-out and retry machinery live in the
//! [`pipeline_framework`] crate. This crate holds the pizzeria itself.
//!
//! ## Delivery Guarantees
//!
//! Orders are delivered at least once. The maestro acknowledges an order only after the
//! dough arrived and the cooked order was republished, so anything that goes wrong
//! earlier, including the panettiere being asleep, ends in a redelivery. Repeated dough
//! requests for the same order are answered from the panettiere's memory, so a
//! redelivered order never costs a second dough.
//!
//! ## Module Tour
//!
//! - [`model`]: orders, their stages and ingress validation.
//! - [`subjects`]: the stream subject of each stage.
//! - [`dough`]: the dough peer contract and the client the maestro calls it through.
//! - [`panettiere`]: the in-process dough peer.
//! - [`maestro`]: the batch worker.
//! - [`gateway`]: ingress, live updates and health.
//! - [`settings`]: layered configuration.
//! - [`lifecycle`]: [`Pizzeria`](lifecycle::Pizzeria), which wires it all together.
//!
//! ## Running the Demo
//!
//! ```bash
//! RUST_LOG=info cargo run
//!
//! # Faster kitchen
//! BOXBOX_PANETTIERE__TIME_TO_MAKE_A_DOUGH_MS=200 cargo run
//! ```

pub mod dough;
pub mod gateway;
pub mod lifecycle;
pub mod maestro;
pub mod model;
pub mod panettiere;
pub mod settings;
pub mod subjects;
