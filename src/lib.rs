#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod admission;
pub mod agent;
pub mod bridge;
pub mod channels;
pub mod commands;
pub mod config;
pub mod cron;
pub mod dedup;
pub mod directives;
pub mod discovery;
pub mod dispatch;
pub mod gateway;
pub mod heartbeat;
pub mod pairing;
pub mod plugins;
pub mod providers;
pub mod runtime;
pub mod session;
pub mod util;
