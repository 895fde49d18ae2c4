pub mod engine;
pub mod exclude;
pub mod inode_map;
pub mod local;
pub mod observer;
pub mod record;
