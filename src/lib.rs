pub mod checkers;
pub mod ctx;
pub mod events;
pub mod fcollection;
pub mod folder;
pub mod generator;
pub mod identity;
pub mod io_util;
pub mod job;
pub mod jobs;
pub mod load_config_file;
pub mod lockable_file;
pub mod maker;
pub mod manager;
pub mod remote;
pub mod serde;
pub mod simulation;
pub mod ui;
pub mod utillib;

pub use cj_path_util::path_util;
