mod common;

#[path = "integration/cli_smoke.rs"]
mod cli_smoke;
#[path = "integration/errors.rs"]
mod errors;
#[path = "integration/hot_reload.rs"]
mod hot_reload;
#[path = "integration/inheritance.rs"]
mod inheritance;
#[path = "integration/query_local.rs"]
mod query_local;
