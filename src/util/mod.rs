pub mod buf_ext;
pub mod buffer_pool;
pub mod clock;
pub mod compression;
pub mod periodic;
