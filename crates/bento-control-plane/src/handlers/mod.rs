pub mod bento_versions;
pub mod health;
pub mod readiness;
