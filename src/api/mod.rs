//! HTTP API Module
//!
//! The node binary's HTTP surface for one driver. Objects are addressed by id; the
//! `DriverSession` holds a handle for every id it has handed out until the client deletes it.
//!
//! ## Endpoints
//! - `POST /object/put`: stores a JSON value, `{"$ref": id}` embeds a held object.
//! - `GET /object/:id?timeout_ms=`: reads a value.
//! - `DELETE /object/:id`: drops the session's handle.
//! - `POST /task/submit`, `GET /task/status/:id`: task submission and inspection.
//! - `GET /stats`: per-node store usage and per-worker counts.

pub mod handlers;
pub mod protocol;
pub mod session;
