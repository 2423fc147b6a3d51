pub mod action_logger;
pub mod archive;
pub mod fs_ops;
pub mod path_utils;
