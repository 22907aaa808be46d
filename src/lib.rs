//! deskrelay - privileged remote execution for managed endpoints.
//!
//! The crate contains both halves of the system:
//!
//! - the **agent** (`agent`, `terminal`, `runner`, `remediation`,
//!   `validator`), which runs on the endpoint and owns every OS process, and
//! - the **relay** (`api`, `link`, `scope`, `identity`, `store`), which
//!   authenticates operators, scopes their access to endpoints and forwards
//!   requests to connected agents.
//!
//! `catalog` and `protocol` are shared by both sides.

pub mod activity;
pub mod agent;
pub mod api;
pub mod catalog;
pub mod config;
pub mod identity;
pub mod link;
pub mod protocol;
pub mod remediation;
pub mod runner;
pub mod scope;
pub mod store;
pub mod terminal;
pub mod validator;
