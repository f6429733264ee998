pub mod check_config;
pub mod detect;
pub mod remap_keys;
