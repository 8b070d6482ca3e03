pub mod block_io;
pub mod cache;
pub mod ram_device;
