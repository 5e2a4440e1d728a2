//! Healthcare documentation gateway.
//!
//! Forwards uploaded images and text to a vision-language model, recovers the
//! JSON embedded in its free-form answers and returns structured results for
//! five clinical workflows.

pub mod config;
pub mod error;
pub mod models;
pub mod prompts;
pub mod recovery;
pub mod server;
pub mod session;
pub mod uploads;
pub mod workflows;

pub use config::Config;
pub use recovery::{
    extract_json_span, flatten, parse_strict, recover_list, recover_object, ResponseRecovery,
};
pub use workflows::{AppContext, Tab};
