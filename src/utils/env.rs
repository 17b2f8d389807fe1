// src/utils/env.rs

use log::{debug, info};

/// Loads environment variables from a .env file when one is present.
pub fn load_env() {
    match dotenv::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(_) => debug!("No .env file found; using process environment"),
    }
}
