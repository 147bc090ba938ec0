pub mod config;
pub mod dedup;
pub mod generator;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod publisher;
pub mod scraper;

pub const PROJECT_NAME: &str = "medpost-bot";
pub const LOG_TARGET: &str = "medpost_bot::main";
