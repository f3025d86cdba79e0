//! Host environment: default paths and requirement checks.

pub mod paths;
mod requirements;

pub use requirements::{
    SystemRequirements, check_all, check_data_dir, check_engine, check_helper,
};
