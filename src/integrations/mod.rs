//! External service integrations.

pub mod providers {
    pub use crate::providers::*;
}

pub mod webhook_models {
    pub use crate::webhook_models::*;
}
